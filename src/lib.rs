//! Hearken: deferred message evaluation and task scheduling for chat assistants.

pub mod config;
pub mod conversation;
pub mod db;
pub mod debounce;
pub mod error;
pub mod messaging;
pub mod rate_limit;
pub mod relevance;
pub mod tasks;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies one conversation: a channel, optionally inside a guild.
///
/// An absent guild denotes a one-to-one or group conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConversationKey {
    pub channel_id: String,
    #[serde(default)]
    pub guild_id: Option<String>,
}

impl ConversationKey {
    pub fn new(channel_id: impl Into<String>, guild_id: Option<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            guild_id,
        }
    }

    pub fn guild(channel_id: impl Into<String>, guild_id: impl Into<String>) -> Self {
        Self::new(channel_id, Some(guild_id.into()))
    }

    pub fn private(channel_id: impl Into<String>) -> Self {
        Self::new(channel_id, None)
    }

    /// Guild id as stored in SQLite, where an absent guild is an empty string.
    pub(crate) fn guild_column(&self) -> &str {
        self.guild_id.as_deref().unwrap_or("")
    }

    pub(crate) fn from_columns(channel_id: String, guild_id: String) -> Self {
        let guild_id = (!guild_id.is_empty()).then_some(guild_id);
        Self::new(channel_id, guild_id)
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}",
            self.channel_id,
            self.guild_id.as_deref().unwrap_or("dm")
        )
    }
}

/// Conversation category. Each category has its own bounded context store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Guild,
    Direct,
    Group,
}

impl ConversationKind {
    pub const ALL: [ConversationKind; 3] = [
        ConversationKind::Guild,
        ConversationKind::Direct,
        ConversationKind::Group,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConversationKind::Guild => "guild",
            ConversationKind::Direct => "direct",
            ConversationKind::Group => "group",
        }
    }
}

impl std::fmt::Display for ConversationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An inbound message from the chat platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Platform message id.
    pub id: String,
    pub key: ConversationKey,
    pub kind: ConversationKind,
    #[serde(default)]
    pub channel_name: Option<String>,
    pub author_id: String,
    pub author_name: String,
    #[serde(default)]
    pub author_is_bot: bool,
    pub content: String,
    /// True when the platform reports a direct mention of the assistant.
    #[serde(default)]
    pub mentions_assistant: bool,
    /// Id of the message this one replies to, if any.
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default = "chrono::Utc::now")]
    pub timestamp: DateTime<Utc>,
}
