//! Typed payloads carried by each task kind.
//!
//! Rows store payloads as opaque JSON. Restoration decodes them through these
//! types and deletes rows that no longer decode or validate.

use crate::error::{Result, SchedulerError};
use crate::tasks::store::{Task, TaskKind};
use crate::{ConversationKey, ConversationKind};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A payload bound to one task kind.
pub trait TaskPayload: Serialize + DeserializeOwned {
    const KIND: TaskKind;

    /// Reject payloads missing what the handler needs.
    fn validate(&self) -> std::result::Result<(), String> {
        Ok(())
    }

    fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Decode and validate the payload of a fired task.
pub fn decode<P: TaskPayload>(task: &Task) -> Result<P> {
    let invalid = |reason: String| SchedulerError::InvalidPayload {
        id: task.id.clone(),
        reason,
    };

    if task.kind != P::KIND {
        return Err(invalid(format!("expected a {} task, found {}", P::KIND, task.kind)).into());
    }
    let payload: P =
        serde_json::from_value(task.payload.clone()).map_err(|error| invalid(error.to_string()))?;
    payload.validate().map_err(invalid)?;
    Ok(payload)
}

/// Check a stored payload against the type its kind expects.
pub fn validate(kind: TaskKind, payload: &Value) -> std::result::Result<(), String> {
    fn check<P: TaskPayload>(payload: &Value) -> std::result::Result<(), String> {
        serde_json::from_value::<P>(payload.clone())
            .map_err(|error| error.to_string())?
            .validate()
    }

    match kind {
        TaskKind::Analysis => check::<AnalysisPayload>(payload),
        TaskKind::ResponseDispatch => check::<DispatchPayload>(payload),
        TaskKind::ConversationFollowup => check::<FollowupPayload>(payload),
        TaskKind::Monitoring => check::<MonitoringPayload>(payload),
    }
}

pub fn analysis_task_id(message_id: &str) -> String {
    format!("analysis-{message_id}")
}

pub fn dispatch_task_id(message_id: &str) -> String {
    format!("respond-{message_id}")
}

pub fn monitoring_task_id(key: &ConversationKey) -> String {
    format!("monitoring-{key}")
}

pub fn followup_task_id(key: &ConversationKey) -> String {
    format!("followup-{key}")
}

/// A message waiting for its deferred evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingMessage {
    pub id: String,
    pub author_id: String,
    pub author_name: String,
    #[serde(default)]
    pub author_is_bot: bool,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Deferred evaluation of a burst of messages in one conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisPayload {
    pub key: ConversationKey,
    pub kind: ConversationKind,
    #[serde(default)]
    pub channel_name: Option<String>,
    /// Oldest first. The last entry is the one that gets scored.
    pub messages: Vec<PendingMessage>,
}

impl AnalysisPayload {
    pub fn latest(&self) -> Option<&PendingMessage> {
        self.messages.last()
    }
}

impl TaskPayload for AnalysisPayload {
    const KIND: TaskKind = TaskKind::Analysis;

    fn validate(&self) -> std::result::Result<(), String> {
        if self.key.channel_id.is_empty() {
            return Err("missing channel id".into());
        }
        if self.messages.is_empty() {
            return Err("no messages to evaluate".into());
        }
        if self
            .messages
            .iter()
            .any(|message| message.id.is_empty() || message.author_id.is_empty())
        {
            return Err("message without id or author".into());
        }
        Ok(())
    }
}

/// Respond to one message after a deferred respond verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchPayload {
    pub key: ConversationKey,
    pub kind: ConversationKind,
    pub message_id: String,
    pub author_id: String,
    pub author_name: String,
    pub content: String,
    pub relevance_score: f64,
    pub has_key_info: bool,
    /// Participant display names, most recently active first.
    #[serde(default)]
    pub participants: Vec<String>,
    /// The assistant's previous message in the conversation, if any.
    #[serde(default)]
    pub last_response_id: Option<String>,
    /// Already counted against the author's rate limit.
    #[serde(default)]
    pub admitted: bool,
}

impl TaskPayload for DispatchPayload {
    const KIND: TaskKind = TaskKind::ResponseDispatch;

    fn validate(&self) -> std::result::Result<(), String> {
        if self.message_id.is_empty() || self.author_id.is_empty() {
            return Err("missing message id or author".into());
        }
        Ok(())
    }
}

/// Proactively revisit a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowupPayload {
    pub key: ConversationKey,
    pub kind: ConversationKind,
    #[serde(default)]
    pub topic_summary: Option<String>,
    pub relevance_score: f64,
}

impl TaskPayload for FollowupPayload {
    const KIND: TaskKind = TaskKind::ConversationFollowup;
}

/// Refresh the conversation-level relevance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringPayload {
    pub key: ConversationKey,
    pub kind: ConversationKind,
}

impl TaskPayload for MonitoringPayload {
    const KIND: TaskKind = TaskKind::Monitoring;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn analysis_value() -> Value {
        json!({
            "key": { "channel_id": "c1", "guild_id": "g1" },
            "kind": "guild",
            "channel_name": "general",
            "messages": [{
                "id": "m1",
                "author_id": "u1",
                "author_name": "alice",
                "content": "anyone around?",
                "timestamp": "2026-01-01T00:00:00Z"
            }]
        })
    }

    #[test]
    fn valid_payload_passes() {
        assert!(validate(TaskKind::Analysis, &analysis_value()).is_ok());
    }

    #[test]
    fn payload_for_another_kind_fails() {
        assert!(validate(TaskKind::ResponseDispatch, &analysis_value()).is_err());
    }

    #[test]
    fn incomplete_payloads_fail() {
        let mut value = analysis_value();
        value["messages"] = json!([]);
        assert!(validate(TaskKind::Analysis, &value).is_err());

        let mut value = analysis_value();
        value["messages"][0]["author_id"] = json!("");
        assert!(validate(TaskKind::Analysis, &value).is_err());

        assert!(validate(TaskKind::Monitoring, &Value::Null).is_err());
    }

    #[test]
    fn decode_checks_kind() {
        let task = Task::new("t", TaskKind::Monitoring, analysis_value(), Utc::now());
        let result = decode::<AnalysisPayload>(&task);
        assert!(matches!(
            result,
            Err(crate::Error::Scheduler(SchedulerError::InvalidPayload { .. }))
        ));

        let task = Task::new("t", TaskKind::Analysis, analysis_value(), Utc::now());
        let payload = decode::<AnalysisPayload>(&task).expect("payload should decode");
        assert_eq!(payload.latest().map(|message| message.id.as_str()), Some("m1"));
    }
}
