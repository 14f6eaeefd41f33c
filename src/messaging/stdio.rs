//! Line-delimited JSON adapter over stdin and stdout.
//!
//! Each input line is one [`InboundMessage`]. Everything the engine wants done
//! on the platform is written as one [`Action`] per output line, which lets a
//! bridge process in front of a real chat service drive the engine.

use crate::error::{PlatformError, Result};
use crate::messaging::traits::{ChatPlatform, InboundStream, ReferencedMessage};
use crate::relevance::scorer::Responder;
use crate::tasks::payload::DispatchPayload;
use crate::{ConversationKey, InboundMessage};
use async_trait::async_trait;
use moka::sync::Cache;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncWrite, AsyncWriteExt as _, BufReader};
use tokio::sync::Mutex;

const PLATFORM: &str = "stdio";

/// Message ids remembered for reply resolution.
const REMEMBERED_MESSAGES: u64 = 10_000;

type Input = Box<dyn AsyncBufRead + Send + Unpin>;
type Output = Box<dyn AsyncWrite + Send + Unpin>;

/// One line written to the output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Send {
        id: String,
        key: ConversationKey,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
    },
    React {
        key: ConversationKey,
        message_id: String,
        emoji: String,
    },
    /// Ask the bridge to generate and post a reply.
    Respond {
        #[serde(flatten)]
        request: DispatchPayload,
    },
    FollowUp {
        key: ConversationKey,
        #[serde(skip_serializing_if = "Option::is_none")]
        topic_summary: Option<String>,
    },
}

pub struct StdioPlatform {
    assistant_id: String,
    input: Mutex<Option<Input>>,
    output: Mutex<Output>,
    /// Message id to author id, for inbound messages and our own sends.
    authors: Cache<String, String>,
}

impl std::fmt::Debug for StdioPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioPlatform")
            .field("assistant_id", &self.assistant_id)
            .field("remembered_messages", &self.authors.entry_count())
            .finish_non_exhaustive()
    }
}

impl StdioPlatform {
    pub fn new(assistant_id: impl Into<String>) -> Self {
        Self::with_io(
            assistant_id,
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
        )
    }

    pub fn with_io(
        assistant_id: impl Into<String>,
        input: impl AsyncBufRead + Send + Unpin + 'static,
        output: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            assistant_id: assistant_id.into(),
            input: Mutex::new(Some(Box::new(input))),
            output: Mutex::new(Box::new(output)),
            authors: Cache::builder().max_capacity(REMEMBERED_MESSAGES).build(),
        }
    }

    async fn emit(&self, action: &Action, what: &'static str) -> Result<()> {
        let failed = |reason: String| PlatformError::Action {
            platform: PLATFORM.into(),
            action: what,
            reason,
        };

        let mut line = serde_json::to_string(action).map_err(|error| failed(error.to_string()))?;
        line.push('\n');

        let mut output = self.output.lock().await;
        output
            .write_all(line.as_bytes())
            .await
            .map_err(|error| failed(error.to_string()))?;
        output
            .flush()
            .await
            .map_err(|error| failed(error.to_string()))?;
        Ok(())
    }
}

/// Parse inbound messages from JSON lines, skipping blank and malformed lines.
fn inbound_lines(input: Input, authors: Cache<String, String>) -> InboundStream {
    Box::pin(async_stream::stream! {
        let mut lines = input.lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<InboundMessage>(&line) {
                        Ok(message) => {
                            authors.insert(message.id.clone(), message.author_id.clone());
                            yield message;
                        }
                        Err(error) => tracing::warn!(%error, "skipping malformed inbound line"),
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    tracing::warn!(%error, "failed to read inbound line");
                    break;
                }
            }
        }
        tracing::debug!("stdio input closed");
    })
}

impl ChatPlatform for StdioPlatform {
    fn name(&self) -> &str {
        PLATFORM
    }

    async fn start(&self) -> Result<InboundStream> {
        let input = self
            .input
            .lock()
            .await
            .take()
            .ok_or(PlatformError::StreamClosed)?;
        tracing::info!("reading inbound messages from stdin");
        Ok(inbound_lines(input, self.authors.clone()))
    }

    async fn send_message(
        &self,
        key: &ConversationKey,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.emit(
            &Action::Send {
                id: id.clone(),
                key: key.clone(),
                text: text.to_string(),
                reply_to: reply_to.map(str::to_string),
            },
            "send message",
        )
        .await?;
        self.authors.insert(id.clone(), self.assistant_id.clone());
        Ok(id)
    }

    async fn fetch_message(
        &self,
        _key: &ConversationKey,
        message_id: &str,
    ) -> Result<Option<ReferencedMessage>> {
        Ok(self
            .authors
            .get(message_id)
            .map(|author_id| ReferencedMessage {
                id: message_id.to_string(),
                author_id,
            }))
    }

    async fn react(&self, key: &ConversationKey, message_id: &str, emoji: &str) -> Result<()> {
        self.emit(
            &Action::React {
                key: key.clone(),
                message_id: message_id.to_string(),
                emoji: emoji.to_string(),
            },
            "react",
        )
        .await
    }
}

/// Generation is left to the bridge: requests are written out and nothing is
/// sent from here.
#[async_trait]
impl Responder for StdioPlatform {
    async fn respond(&self, request: &DispatchPayload) -> Result<Option<String>> {
        self.emit(
            &Action::Respond {
                request: request.clone(),
            },
            "request response",
        )
        .await?;
        Ok(None)
    }

    async fn follow_up(&self, key: &ConversationKey, topic: Option<&str>) -> Result<Option<String>> {
        self.emit(
            &Action::FollowUp {
                key: key.clone(),
                topic_summary: topic.map(str::to_string),
            },
            "request follow-up",
        )
        .await?;
        Ok(None)
    }
}
