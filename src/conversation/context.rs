//! Bounded, evicting cache of per-conversation participant and activity state.
//!
//! The cache is read-through and write-through over a [`ConversationRepository`]:
//! a miss hydrates from the most recent stored messages, and every recorded
//! message is persisted before the cached entry changes. Entries reflect every
//! write made through the cache. Rows written to the store by anything else
//! become visible once the entry is evicted (at most one inactivity threshold
//! plus one sweep interval) or reset.

use crate::config::ContextConfig;
use crate::conversation::store::{ConversationRepository, MessageRecord};
use crate::error::Result;
use crate::{ConversationKey, ConversationKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Someone who spoke in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub message_count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

/// Cached view of one conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextEntry {
    /// Most recently active first, at most [`ContextEntry::MAX_PARTICIPANTS`].
    pub participants: Vec<Participant>,
    pub last_author_id: Option<String>,
    pub last_author_name: Option<String>,
    pub last_message_timestamp: DateTime<Utc>,
    pub last_response_id: Option<String>,
    pub channel_name: Option<String>,
}

impl ContextEntry {
    pub const MAX_PARTICIPANTS: usize = 10;

    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            participants: Vec::new(),
            last_author_id: None,
            last_author_name: None,
            last_message_timestamp: now,
            last_response_id: None,
            channel_name: None,
        }
    }

    /// Rebuild an entry by folding message authorship, oldest message first.
    pub fn from_messages(messages: &[MessageRecord], now: DateTime<Utc>) -> Self {
        let mut entry = Self::new(now);
        for message in messages {
            entry.record(&message.author_id, &message.author_name, message.created_at);
        }
        entry
    }

    /// Move the participant to the front, creating it if needed.
    pub fn record(&mut self, author_id: &str, author_name: &str, at: DateTime<Utc>) {
        let first_message = self.last_author_id.is_none();
        let participant = match self.participants.iter().position(|p| p.id == author_id) {
            Some(index) => {
                let mut participant = self.participants.remove(index);
                participant.message_count += 1;
                participant.last_active = at;
                participant.name = author_name.to_string();
                participant
            }
            None => Participant {
                id: author_id.to_string(),
                name: author_name.to_string(),
                message_count: 1,
                first_seen: at,
                last_active: at,
            },
        };

        self.participants.insert(0, participant);
        self.participants.truncate(Self::MAX_PARTICIPANTS);
        self.last_author_id = Some(author_id.to_string());
        self.last_author_name = Some(author_name.to_string());
        self.last_message_timestamp = if first_message {
            at
        } else {
            self.last_message_timestamp.max(at)
        };
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        self.last_message_timestamp
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategoryCounts {
    pub guild: usize,
    pub direct: usize,
    pub group: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_created: u64,
    pub total_evicted: u64,
    pub last_sweep_at: Option<DateTime<Utc>>,
    pub counts: CategoryCounts,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub evicted: usize,
    pub conversations_deleted: u64,
}

#[derive(Default)]
struct CacheState {
    guild: HashMap<ConversationKey, ContextEntry>,
    direct: HashMap<ConversationKey, ContextEntry>,
    group: HashMap<ConversationKey, ContextEntry>,
    total_created: u64,
    total_evicted: u64,
    last_sweep_at: Option<DateTime<Utc>>,
}

impl CacheState {
    fn entries(&self, kind: ConversationKind) -> &HashMap<ConversationKey, ContextEntry> {
        match kind {
            ConversationKind::Guild => &self.guild,
            ConversationKind::Direct => &self.direct,
            ConversationKind::Group => &self.group,
        }
    }

    fn entries_mut(&mut self, kind: ConversationKind) -> &mut HashMap<ConversationKey, ContextEntry> {
        match kind {
            ConversationKind::Guild => &mut self.guild,
            ConversationKind::Direct => &mut self.direct,
            ConversationKind::Group => &mut self.group,
        }
    }
}

/// Three bounded stores, one per conversation category.
pub struct ContextCache {
    state: RwLock<CacheState>,
    repository: Arc<dyn ConversationRepository>,
    config: ContextConfig,
}

impl std::fmt::Debug for ContextCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextCache")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ContextCache {
    pub fn new(repository: Arc<dyn ConversationRepository>, config: ContextConfig) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            repository,
            config,
        }
    }

    /// Cached entry, hydrated from the store on a miss.
    ///
    /// When hydration fails an empty entry is returned and nothing is cached.
    pub async fn get(&self, kind: ConversationKind, key: &ConversationKey) -> ContextEntry {
        if let Some(entry) = self.state.read().await.entries(kind).get(key) {
            return entry.clone();
        }

        let messages = match self
            .repository
            .recent_messages(key, self.config.hydrate_limit)
            .await
        {
            Ok(messages) => messages,
            Err(error) => {
                tracing::warn!(conversation = %key, %error, "failed to hydrate context, serving empty entry");
                return ContextEntry::new(Utc::now());
            }
        };
        let mut entry = ContextEntry::from_messages(&messages, Utc::now());
        if let Ok(Some(conversation)) = self.repository.get_conversation(key).await {
            entry.last_response_id = conversation.last_response_id;
        }

        let mut state = self.state.write().await;
        // Another caller may have populated the entry while we were reading the store.
        if let Some(existing) = state.entries(kind).get(key) {
            return existing.clone();
        }
        self.insert_locked(&mut state, kind, key.clone(), entry.clone());
        entry
    }

    /// Persist a message, then fold its author into the cached entry.
    ///
    /// The cached entry is updated even when persistence fails; the error is
    /// returned so the caller can log the degraded write.
    pub async fn record(
        &self,
        kind: ConversationKind,
        record: &MessageRecord,
        channel_name: Option<&str>,
    ) -> Result<()> {
        // Hydrate before writing so the fold does not count this message twice.
        self.get(kind, &record.key).await;

        let persisted = self.repository.add_message(record).await;

        {
            let mut state = self.state.write().await;
            if !state.entries(kind).contains_key(&record.key) {
                let entry = ContextEntry::new(record.created_at);
                self.insert_locked(&mut state, kind, record.key.clone(), entry);
            }
            if let Some(entry) = state.entries_mut(kind).get_mut(&record.key) {
                entry.record(&record.author_id, &record.author_name, record.created_at);
                if let Some(channel_name) = channel_name {
                    entry.channel_name = Some(channel_name.to_string());
                }
            }
        }

        persisted
    }

    /// Persist and cache the id of the assistant's latest response.
    pub async fn set_last_response(
        &self,
        kind: ConversationKind,
        key: &ConversationKey,
        response_id: &str,
    ) -> Result<()> {
        let persisted = self.repository.set_last_response(key, response_id).await;

        if let Some(entry) = self.state.write().await.entries_mut(kind).get_mut(key) {
            entry.last_response_id = Some(response_id.to_string());
        }

        persisted
    }

    /// Cached entry for a conversation in any category, without hydrating.
    pub async fn lookup(&self, key: &ConversationKey) -> Option<ContextEntry> {
        let state = self.state.read().await;
        ConversationKind::ALL
            .iter()
            .find_map(|kind| state.entries(*kind).get(key))
            .cloned()
    }

    /// Drop an entry and delete its stored history.
    pub async fn reset(&self, kind: ConversationKind, key: &ConversationKey) -> Result<bool> {
        self.state.write().await.entries_mut(kind).remove(key);
        self.repository.delete_conversation(key).await
    }

    /// Evict idle entries, enforce capacities, and drop idle conversations from the store.
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now()).await
    }

    pub async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let evicted = {
            let mut state = self.state.write().await;
            let evicted: usize = ConversationKind::ALL
                .iter()
                .map(|kind| self.sweep_locked(&mut state, *kind, now, None))
                .sum();
            state.last_sweep_at = Some(now);
            evicted
        };

        let conversations_deleted = match self
            .repository
            .delete_inactive(now - self.config.inactivity())
            .await
        {
            Ok(count) => count,
            Err(error) => {
                tracing::warn!(%error, "failed to delete inactive conversations");
                0
            }
        };

        tracing::info!(evicted, conversations_deleted, "context sweep finished");
        SweepReport {
            evicted,
            conversations_deleted,
        }
    }

    pub async fn len(&self, kind: ConversationKind) -> usize {
        self.state.read().await.entries(kind).len()
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.read().await;
        CacheStats {
            total_created: state.total_created,
            total_evicted: state.total_evicted,
            last_sweep_at: state.last_sweep_at,
            counts: CategoryCounts {
                guild: state.guild.len(),
                direct: state.direct.len(),
                group: state.group.len(),
            },
        }
    }

    fn insert_locked(
        &self,
        state: &mut CacheState,
        kind: ConversationKind,
        key: ConversationKey,
        entry: ContextEntry,
    ) {
        let entries = state.entries_mut(kind);
        entries.insert(key.clone(), entry);
        let len = entries.len();
        state.total_created += 1;

        let capacity = self.config.capacity(kind);
        if len as f64 > capacity as f64 * self.config.preventive_ratio {
            tracing::debug!(%kind, len, capacity, "context store nearly full, running preventive sweep");
            self.sweep_locked(state, kind, Utc::now(), Some(&key));
        }
    }

    /// Evict from one category. `protect` is never evicted.
    fn sweep_locked(
        &self,
        state: &mut CacheState,
        kind: ConversationKind,
        now: DateTime<Utc>,
        protect: Option<&ConversationKey>,
    ) -> usize {
        let cutoff = now - self.config.inactivity();
        let capacity = self.config.capacity(kind);
        let entries = state.entries_mut(kind);
        let before = entries.len();

        entries.retain(|key, entry| Some(key) == protect || entry.last_active() >= cutoff);

        if entries.len() > capacity {
            let mut by_activity: Vec<(DateTime<Utc>, ConversationKey)> = entries
                .iter()
                .filter(|(key, _)| Some(*key) != protect)
                .map(|(key, entry)| (entry.last_active(), key.clone()))
                .collect();
            by_activity.sort();

            let excess = entries.len() - capacity;
            for (_, key) in by_activity.into_iter().take(excess) {
                entries.remove(&key);
            }
        }

        let evicted = before - entries.len();
        state.total_evicted += evicted as u64;
        if evicted > 0 {
            tracing::debug!(%kind, evicted, "context entries evicted");
        }
        evicted
    }
}
