//! Chat platform trait and dynamic dispatch companion.

use crate::error::Result;
use crate::{ConversationKey, InboundMessage};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Message stream type.
pub type InboundStream = Pin<Box<dyn Stream<Item = InboundMessage> + Send>>;

/// A message fetched by id, used to resolve reply targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferencedMessage {
    pub id: String,
    pub author_id: String,
}

/// Static trait for chat platform clients.
/// Use this for type-safe implementations.
pub trait ChatPlatform: Send + Sync + 'static {
    /// Unique name for this platform.
    fn name(&self) -> &str;

    /// Start the client and return the inbound message stream.
    fn start(&self) -> impl std::future::Future<Output = Result<InboundStream>> + Send;

    /// Send a message, optionally as a reply. Returns the id of the sent message.
    fn send_message(
        &self,
        key: &ConversationKey,
        text: &str,
        reply_to: Option<&str>,
    ) -> impl std::future::Future<Output = Result<String>> + Send;

    /// Fetch a message by id. `None` when it no longer exists.
    fn fetch_message(
        &self,
        key: &ConversationKey,
        message_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<ReferencedMessage>>> + Send;

    /// Whether the assistant may write to the conversation.
    fn can_send(&self, _key: &ConversationKey) -> impl std::future::Future<Output = bool> + Send {
        async { true }
    }

    /// React to a message with an emoji.
    fn react(
        &self,
        key: &ConversationKey,
        message_id: &str,
        emoji: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Dynamic trait for runtime polymorphism.
/// Use this when you need `Arc<dyn ChatPlatformDyn>`.
pub trait ChatPlatformDyn: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn start<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<InboundStream>> + Send + 'a>>;

    fn send_message<'a>(
        &'a self,
        key: &'a ConversationKey,
        text: &'a str,
        reply_to: Option<&'a str>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String>> + Send + 'a>>;

    fn fetch_message<'a>(
        &'a self,
        key: &'a ConversationKey,
        message_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Option<ReferencedMessage>>> + Send + 'a>>;

    fn can_send<'a>(
        &'a self,
        key: &'a ConversationKey,
    ) -> Pin<Box<dyn std::future::Future<Output = bool> + Send + 'a>>;

    fn react<'a>(
        &'a self,
        key: &'a ConversationKey,
        message_id: &'a str,
        emoji: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;
}

/// Blanket implementation: any type implementing ChatPlatform automatically implements ChatPlatformDyn.
impl<T: ChatPlatform> ChatPlatformDyn for T {
    fn name(&self) -> &str {
        ChatPlatform::name(self)
    }

    fn start<'a>(&'a self) -> Pin<Box<dyn std::future::Future<Output = Result<InboundStream>> + Send + 'a>> {
        Box::pin(ChatPlatform::start(self))
    }

    fn send_message<'a>(
        &'a self,
        key: &'a ConversationKey,
        text: &'a str,
        reply_to: Option<&'a str>,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(ChatPlatform::send_message(self, key, text, reply_to))
    }

    fn fetch_message<'a>(
        &'a self,
        key: &'a ConversationKey,
        message_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<Option<ReferencedMessage>>> + Send + 'a>> {
        Box::pin(ChatPlatform::fetch_message(self, key, message_id))
    }

    fn can_send<'a>(
        &'a self,
        key: &'a ConversationKey,
    ) -> Pin<Box<dyn std::future::Future<Output = bool> + Send + 'a>> {
        Box::pin(ChatPlatform::can_send(self, key))
    }

    fn react<'a>(
        &'a self,
        key: &'a ConversationKey,
        message_id: &'a str,
        emoji: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(ChatPlatform::react(self, key, message_id, emoji))
    }
}
