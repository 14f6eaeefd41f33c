//! Conversation persistence and the bounded context cache.

pub mod context;
pub mod store;

pub use context::{CacheStats, ContextCache, ContextEntry, Participant, SweepReport};
pub use store::{
    Conversation, ConversationRepository, MessageRecord, SqliteConversationStore, clamp_score,
};
