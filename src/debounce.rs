//! Per-conversation debounce windows.
//!
//! A window coalesces a burst of messages into one evaluation cycle. Arming an
//! active window pushes its expiry out instead of opening a second one, and
//! every waiter on a key resolves once, at the final expiry.

use crate::ConversationKey;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot};
use tokio::time::Instant;

struct Window {
    generation: u64,
    timer: tokio::task::JoinHandle<()>,
    waiters: Vec<oneshot::Sender<bool>>,
}

#[derive(Default)]
struct WindowState {
    windows: HashMap<ConversationKey, Window>,
    next_generation: u64,
}

/// Resolves when a debounce window ends: `true` at expiry, `false` if cleared.
#[derive(Debug)]
pub struct DebounceWait {
    receiver: oneshot::Receiver<bool>,
}

impl Future for DebounceWait {
    type Output = bool;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<bool> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(false))
    }
}

/// Single-flight delay windows keyed by conversation.
#[derive(Clone)]
pub struct DebounceCoordinator {
    state: Arc<Mutex<WindowState>>,
    window: Duration,
}

impl std::fmt::Debug for DebounceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebounceCoordinator")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl DebounceCoordinator {
    pub fn new(window: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(WindowState::default())),
            window,
        }
    }

    pub async fn is_active(&self, key: &ConversationKey) -> bool {
        self.state.lock().await.windows.contains_key(key)
    }

    /// Number of live windows.
    pub async fn active_count(&self) -> usize {
        self.state.lock().await.windows.len()
    }

    /// Open or extend the window for `key`.
    ///
    /// The returned future resolves to `true` when the window expires, or
    /// `false` if it was cleared first.
    pub async fn arm(&self, key: &ConversationKey) -> DebounceWait {
        let (sender, receiver) = oneshot::channel();
        let expires_at = Instant::now() + self.window;

        let mut state = self.state.lock().await;
        state.next_generation += 1;
        let generation = state.next_generation;
        let timer = self.spawn_timer(key.clone(), generation, expires_at);

        match state.windows.get_mut(key) {
            Some(window) => {
                window.timer.abort();
                window.timer = timer;
                window.generation = generation;
                window.waiters.push(sender);
                tracing::debug!(conversation = %key, waiters = window.waiters.len(), "debounce window extended");
            }
            None => {
                state.windows.insert(
                    key.clone(),
                    Window {
                        generation,
                        timer,
                        waiters: vec![sender],
                    },
                );
                tracing::debug!(conversation = %key, "debounce window opened");
            }
        }
        drop(state);

        DebounceWait { receiver }
    }

    /// Drop every window, resolving their waiters with `false`.
    pub async fn clear(&self) {
        let windows: Vec<Window> = self.state.lock().await.windows.drain().map(|(_, w)| w).collect();
        for window in windows {
            window.timer.abort();
            for waiter in window.waiters {
                let _ = waiter.send(false);
            }
        }
    }

    fn spawn_timer(
        &self,
        key: ConversationKey,
        generation: u64,
        expires_at: Instant,
    ) -> tokio::task::JoinHandle<()> {
        let state = self.state.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(expires_at).await;

            let mut state = state.lock().await;
            // A re-arm replaced this timer while it was waiting for the lock.
            if state
                .windows
                .get(&key)
                .is_none_or(|window| window.generation != generation)
            {
                return;
            }
            if let Some(window) = state.windows.remove(&key) {
                drop(state);
                tracing::debug!(conversation = %key, waiters = window.waiters.len(), "debounce window expired");
                for waiter in window.waiters {
                    let _ = waiter.send(true);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready_eq, task};

    fn key(channel: &str) -> ConversationKey {
        ConversationKey::guild(channel, "g1")
    }

    #[tokio::test(start_paused = true)]
    async fn window_expires_after_duration() {
        let debounce = DebounceCoordinator::new(Duration::from_secs(5));
        let mut wait = task::spawn(debounce.arm(&key("c1")).await);

        assert!(debounce.is_active(&key("c1")).await);
        assert_pending!(wait.poll());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_ready_eq!(wait.poll(), true);
        assert!(!debounce.is_active(&key("c1")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_extends_without_stacking() {
        let debounce = DebounceCoordinator::new(Duration::from_secs(5));
        let first = tokio::spawn(debounce.arm(&key("c1")).await);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let second = tokio::spawn(debounce.arm(&key("c1")).await);
        assert_eq!(debounce.active_count().await, 1);

        // The original expiry passes but the window was pushed out.
        tokio::time::sleep(Duration::from_millis(4500)).await;
        assert!(debounce.is_active(&key("c1")).await);
        assert!(!first.is_finished());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(first.await.expect("waiter"));
        assert!(second.await.expect("waiter"));
        assert_eq!(debounce.active_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let debounce = DebounceCoordinator::new(Duration::from_secs(5));
        let _a = debounce.arm(&key("a")).await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        let _b = debounce.arm(&key("b")).await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!debounce.is_active(&key("a")).await);
        assert!(debounce.is_active(&key("b")).await);
    }

    #[tokio::test(start_paused = true)]
    async fn clear_cancels_waiters() {
        let debounce = DebounceCoordinator::new(Duration::from_secs(5));
        let wait = tokio::spawn(debounce.arm(&key("c1")).await);

        debounce.clear().await;
        assert!(!wait.await.expect("waiter"));
        assert!(!debounce.is_active(&key("c1")).await);
    }
}
