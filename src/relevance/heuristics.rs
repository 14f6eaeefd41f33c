//! Immediate message heuristics and channel-topic adjustment.
//!
//! Everything here is synchronous and side-effect free. The engine resolves
//! the reply target (which may need the platform) before classifying.

use crate::config::{AssistantConfig, RelevancePolicy};
use crate::{ConversationKind, InboundMessage};
use serde::Serialize;

/// Who a message replies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyTarget {
    None,
    Assistant,
    /// The author replying to their own message.
    Author,
    /// A different user.
    OtherUser(String),
}

/// Why a message gets an immediate response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum ImmediateReason {
    Mention,
    DirectConversation,
    ReplyToAssistant,
    Question,
    Urgency(String),
    NameReference,
    HelpRequest,
}

impl std::fmt::Display for ImmediateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImmediateReason::Mention => write!(f, "mention"),
            ImmediateReason::DirectConversation => write!(f, "direct conversation"),
            ImmediateReason::ReplyToAssistant => write!(f, "reply to assistant"),
            ImmediateReason::Question => write!(f, "question"),
            ImmediateReason::Urgency(keyword) => write!(f, "urgency keyword '{keyword}'"),
            ImmediateReason::NameReference => write!(f, "name reference"),
            ImmediateReason::HelpRequest => write!(f, "help request"),
        }
    }
}

/// Outcome of the immediate heuristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    Immediate(ImmediateReason),
    /// A reply between two other users, with no exception.
    SuppressedReply,
    Deferred,
}

/// Trimmed content of at most one character never warrants a response.
pub fn is_trivial(content: &str) -> bool {
    content.trim().chars().count() <= 1
}

pub fn has_question(content: &str) -> bool {
    content.contains('?')
}

/// Whether any spelling of the assistant's name appears in `content`.
pub fn references_name(content: &str, assistant: &AssistantConfig) -> bool {
    let content = content.to_lowercase();
    assistant
        .name_variants()
        .iter()
        .any(|variant| !variant.is_empty() && content.contains(variant.as_str()))
}

/// First keyword that appears as a whole word in `content`.
pub fn find_keyword<'a>(content: &str, keywords: &'a [String]) -> Option<&'a str> {
    let content = content.to_lowercase();
    let words: Vec<&str> = content
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect();

    keywords
        .iter()
        .find(|keyword| {
            let keyword = keyword.to_lowercase();
            words.iter().any(|word| *word == keyword)
        })
        .map(String::as_str)
}

/// The exceptions that let a user-to-user reply through.
pub fn reply_exception(
    content: &str,
    assistant: &AssistantConfig,
    policy: &RelevancePolicy,
) -> Option<ImmediateReason> {
    if references_name(content, assistant) {
        return Some(ImmediateReason::NameReference);
    }
    if has_question(content) && find_keyword(content, &policy.help_keywords).is_some() {
        return Some(ImmediateReason::HelpRequest);
    }
    None
}

/// Run the immediate heuristics over an inbound message.
pub fn classify(
    message: &InboundMessage,
    reply: &ReplyTarget,
    assistant: &AssistantConfig,
    policy: &RelevancePolicy,
) -> Classification {
    if message.mentions_assistant {
        return Classification::Immediate(ImmediateReason::Mention);
    }
    if message.kind == ConversationKind::Direct {
        return Classification::Immediate(ImmediateReason::DirectConversation);
    }

    if let ReplyTarget::OtherUser(_) = reply {
        return match reply_exception(&message.content, assistant, policy) {
            Some(reason) => Classification::Immediate(reason),
            None => Classification::SuppressedReply,
        };
    }

    if *reply == ReplyTarget::Assistant {
        return Classification::Immediate(ImmediateReason::ReplyToAssistant);
    }
    if has_question(&message.content) {
        return Classification::Immediate(ImmediateReason::Question);
    }
    if let Some(keyword) = find_keyword(&message.content, &policy.urgency_keywords) {
        return Classification::Immediate(ImmediateReason::Urgency(keyword.to_string()));
    }

    Classification::Deferred
}

/// Score adjustment for the channel's topic.
pub fn channel_adjustment(channel_name: Option<&str>, policy: &RelevancePolicy) -> f64 {
    let Some(channel_name) = channel_name else {
        return 0.0;
    };
    let channel_name = channel_name.to_lowercase();
    let matches = |patterns: &[String]| {
        patterns
            .iter()
            .any(|pattern| channel_name.contains(&pattern.to_lowercase()))
    };

    if matches(&policy.technical_channels) {
        policy.technical_bonus
    } else if matches(&policy.administrative_channels) {
        -policy.administrative_penalty
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConversationKey;

    fn message(content: &str) -> InboundMessage {
        InboundMessage {
            id: "m1".into(),
            key: ConversationKey::guild("c1", "g1"),
            kind: ConversationKind::Guild,
            channel_name: Some("lobby".into()),
            author_id: "u1".into(),
            author_name: "alice".into(),
            author_is_bot: false,
            content: content.into(),
            mentions_assistant: false,
            reply_to: None,
            timestamp: chrono::Utc::now(),
        }
    }

    fn classify_default(message: &InboundMessage, reply: &ReplyTarget) -> Classification {
        classify(
            message,
            reply,
            &AssistantConfig::default(),
            &RelevancePolicy::default(),
        )
    }

    #[test]
    fn trivial_content() {
        assert!(is_trivial(""));
        assert!(is_trivial("  k "));
        assert!(is_trivial("é"));
        assert!(!is_trivial("ok"));
    }

    #[test]
    fn mentions_and_direct_conversations_are_immediate() {
        let mut mention = message("look at this");
        mention.mentions_assistant = true;
        assert_eq!(
            classify_default(&mention, &ReplyTarget::None),
            Classification::Immediate(ImmediateReason::Mention)
        );

        let mut direct = message("hey");
        direct.kind = ConversationKind::Direct;
        assert_eq!(
            classify_default(&direct, &ReplyTarget::None),
            Classification::Immediate(ImmediateReason::DirectConversation)
        );
    }

    #[test]
    fn questions_urgency_and_replies_to_assistant() {
        assert_eq!(
            classify_default(&message("anyone tried the new release?"), &ReplyTarget::None),
            Classification::Immediate(ImmediateReason::Question)
        );
        assert_eq!(
            classify_default(&message("this is URGENT folks"), &ReplyTarget::None),
            Classification::Immediate(ImmediateReason::Urgency("urgent".into()))
        );
        assert_eq!(
            classify_default(&message("thanks"), &ReplyTarget::Assistant),
            Classification::Immediate(ImmediateReason::ReplyToAssistant)
        );
        assert_eq!(
            classify_default(&message("nice weather today"), &ReplyTarget::Author),
            Classification::Deferred
        );
    }

    #[test]
    fn keywords_match_whole_words() {
        let policy = RelevancePolicy::default();
        assert_eq!(find_keyword("I need help!", &policy.help_keywords), Some("help"));
        assert_eq!(find_keyword("that was helpful", &policy.help_keywords), None);
    }

    #[test]
    fn user_to_user_replies_are_suppressed() {
        let reply = ReplyTarget::OtherUser("u2".into());
        assert_eq!(
            classify_default(&message("agreed, good point?"), &reply),
            Classification::SuppressedReply
        );
        assert_eq!(
            classify_default(&message("this is urgent"), &reply),
            Classification::SuppressedReply
        );
    }

    #[test]
    fn user_to_user_reply_exceptions() {
        let reply = ReplyTarget::OtherUser("u2".into());
        assert_eq!(
            classify_default(&message("Yassine what do you think"), &reply),
            Classification::Immediate(ImmediateReason::NameReference)
        );
        assert_eq!(
            classify_default(&message("ask le bot maybe"), &reply),
            Classification::Immediate(ImmediateReason::NameReference)
        );
        assert_eq!(
            classify_default(&message("can someone help me?"), &reply),
            Classification::Immediate(ImmediateReason::HelpRequest)
        );
        assert_eq!(
            classify_default(&message("can someone help me"), &reply),
            Classification::SuppressedReply
        );
    }

    #[test]
    fn channel_adjustments() {
        let policy = RelevancePolicy::default();
        assert_eq!(channel_adjustment(Some("General-Chat"), &policy), 0.25);
        assert_eq!(channel_adjustment(Some("annonces"), &policy), -0.15);
        assert_eq!(channel_adjustment(Some("lobby"), &policy), 0.0);
        assert_eq!(channel_adjustment(None, &policy), 0.0);
    }
}
