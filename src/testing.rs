//! In-memory fakes shared by unit tests.
//!
//! The repositories mirror the SQLite stores closely enough for scheduler,
//! cache and engine tests to run on paused tokio time without a database.

use crate::conversation::{Conversation, ConversationRepository, MessageRecord, clamp_score};
use crate::error::{PlatformError, Result};
use crate::messaging::traits::{ChatPlatform, InboundStream, ReferencedMessage};
use crate::relevance::scorer::{ConversationScore, RawScore, Responder, Scorer, ScoringContext};
use crate::tasks::payload::DispatchPayload;
use crate::tasks::{Task, TaskCount, TaskRepository, TaskStatus};
use crate::ConversationKey;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

fn store_offline() -> crate::Error {
    anyhow::anyhow!("store offline").into()
}

/// Task repository held in a map.
#[derive(Debug, Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<String, Task>>,
    fail_writes: AtomicBool,
}

impl MemoryTaskStore {
    pub fn insert(&self, task: Task) {
        self.tasks.lock().insert(task.id.clone(), task);
    }

    pub fn get_task(&self, id: &str) -> Option<Task> {
        self.tasks.lock().get(id).cloned()
    }

    pub fn status_of(&self, id: &str) -> Option<TaskStatus> {
        self.tasks.lock().get(id).map(|task| task.status)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.tasks.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Make every write fail until turned off again.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(store_offline());
        }
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskStore {
    async fn save(&self, task: &Task) -> Result<()> {
        self.check_writable()?;
        self.insert(task.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.get_task(id))
    }

    async fn update_status(&self, id: &str, status: TaskStatus, at: DateTime<Utc>) -> Result<()> {
        self.check_writable()?;
        if let Some(task) = self.tasks.lock().get_mut(id) {
            task.status = status;
            match status {
                TaskStatus::Completed => task.completed_at = Some(at),
                TaskStatus::Failed => task.failed_at = Some(at),
                _ => {}
            }
        }
        Ok(())
    }

    async fn reschedule(
        &self,
        id: &str,
        next_execution_at: DateTime<Utc>,
        payload: Option<&Value>,
    ) -> Result<()> {
        self.check_writable()?;
        if let Some(task) = self.tasks.lock().get_mut(id) {
            task.next_execution_at = next_execution_at;
            if let Some(payload) = payload {
                task.payload = payload.clone();
            }
        }
        Ok(())
    }

    async fn record_retry(
        &self,
        id: &str,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
    ) -> Result<()> {
        self.check_writable()?;
        if let Some(task) = self.tasks.lock().get_mut(id) {
            task.status = TaskStatus::Retry;
            task.retry_count = retry_count;
            task.next_retry_at = Some(next_retry_at);
        }
        Ok(())
    }

    async fn load_restorable(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .lock()
            .values()
            .filter(|task| matches!(task.status, TaskStatus::Pending | TaskStatus::Retry))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
        });
        Ok(tasks)
    }

    async fn list_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Task>> {
        Ok(self
            .tasks
            .lock()
            .values()
            .filter(|task| {
                matches!(
                    task.status,
                    TaskStatus::Pending | TaskStatus::Processing | TaskStatus::Retry
                ) && task.due_at() < now
            })
            .cloned()
            .collect())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.check_writable()?;
        Ok(self.tasks.lock().remove(id).is_some())
    }

    async fn delete_finished(&self) -> Result<u64> {
        self.check_writable()?;
        let mut tasks = self.tasks.lock();
        let before = tasks.len();
        tasks.retain(|_, task| !task.status.is_finished());
        Ok((before - tasks.len()) as u64)
    }

    async fn counts(&self) -> Result<Vec<TaskCount>> {
        let mut counts: BTreeMap<(&'static str, &'static str), TaskCount> = BTreeMap::new();
        for task in self.tasks.lock().values() {
            counts
                .entry((task.kind.as_str(), task.status.as_str()))
                .or_insert(TaskCount {
                    kind: task.kind,
                    status: task.status,
                    count: 0,
                })
                .count += 1;
        }
        Ok(counts.into_values().collect())
    }
}

#[derive(Debug, Clone)]
struct StoredConversation {
    conversation: Conversation,
    messages: Vec<MessageRecord>,
}

/// Conversation repository held in a map.
#[derive(Debug, Default)]
pub struct MemoryConversationStore {
    conversations: Mutex<HashMap<ConversationKey, StoredConversation>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryConversationStore {
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn messages_for(&self, key: &ConversationKey) -> Vec<MessageRecord> {
        self.conversations
            .lock()
            .get(key)
            .map(|stored| stored.messages.clone())
            .unwrap_or_default()
    }

    pub fn message(&self, key: &ConversationKey, message_id: &str) -> Option<MessageRecord> {
        self.messages_for(key)
            .into_iter()
            .find(|message| message.message_id == message_id)
    }

    fn check_readable(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(store_offline());
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(store_offline());
        }
        Ok(())
    }

    fn upsert<T>(&self, key: &ConversationKey, update: impl FnOnce(&mut StoredConversation) -> T) -> T {
        let mut conversations = self.conversations.lock();
        let stored = conversations
            .entry(key.clone())
            .or_insert_with(|| StoredConversation {
                conversation: Conversation {
                    key: key.clone(),
                    relevance_score: 0.0,
                    topic_summary: None,
                    last_response_id: None,
                    is_shared: false,
                    shared_with: Default::default(),
                    updated_at: Utc::now(),
                },
                messages: Vec::new(),
            });
        stored.conversation.updated_at = Utc::now();
        update(stored)
    }
}

#[async_trait]
impl ConversationRepository for MemoryConversationStore {
    async fn get_conversation(&self, key: &ConversationKey) -> Result<Option<Conversation>> {
        self.check_readable()?;
        Ok(self
            .conversations
            .lock()
            .get(key)
            .map(|stored| stored.conversation.clone()))
    }

    async fn add_message(&self, record: &MessageRecord) -> Result<()> {
        self.check_writable()?;
        let mut record = record.clone();
        record.relevance_score = clamp_score(record.relevance_score);
        self.upsert(&record.key.clone(), |stored| stored.messages.push(record));
        Ok(())
    }

    async fn recent_messages(&self, key: &ConversationKey, limit: i64) -> Result<Vec<MessageRecord>> {
        self.check_readable()?;
        let mut messages = self.messages_for(key);
        messages.sort_by_key(|message| message.created_at);
        let skip = messages.len().saturating_sub(limit.max(0) as usize);
        Ok(messages.split_off(skip))
    }

    async fn update_message_analysis(
        &self,
        key: &ConversationKey,
        message_id: &str,
        relevance_score: f64,
        has_key_info: bool,
    ) -> Result<bool> {
        self.check_writable()?;
        let mut conversations = self.conversations.lock();
        let Some(message) = conversations.get_mut(key).and_then(|stored| {
            stored
                .messages
                .iter_mut()
                .find(|message| message.message_id == message_id)
        }) else {
            return Ok(false);
        };
        message.relevance_score = clamp_score(relevance_score);
        message.has_key_info = has_key_info;
        message.is_analyzed = true;
        Ok(true)
    }

    async fn update_conversation_analysis(
        &self,
        key: &ConversationKey,
        relevance_score: f64,
        topic_summary: Option<&str>,
    ) -> Result<()> {
        self.check_writable()?;
        self.upsert(key, |stored| {
            stored.conversation.relevance_score = clamp_score(relevance_score);
            if let Some(topic_summary) = topic_summary {
                stored.conversation.topic_summary = Some(topic_summary.to_string());
            }
        });
        Ok(())
    }

    async fn set_last_response(&self, key: &ConversationKey, response_id: &str) -> Result<()> {
        self.check_writable()?;
        self.upsert(key, |stored| {
            stored.conversation.last_response_id = Some(response_id.to_string());
        });
        Ok(())
    }

    async fn share(&self, key: &ConversationKey, user_id: &str) -> Result<bool> {
        self.check_writable()?;
        let mut conversations = self.conversations.lock();
        let Some(stored) = conversations.get_mut(key) else {
            return Ok(false);
        };
        stored.conversation.is_shared = true;
        stored.conversation.shared_with.insert(user_id.to_string());
        Ok(true)
    }

    async fn shared_with(&self, user_id: &str) -> Result<Vec<Conversation>> {
        self.check_readable()?;
        Ok(self
            .conversations
            .lock()
            .values()
            .filter(|stored| stored.conversation.shared_with.contains(user_id))
            .map(|stored| stored.conversation.clone())
            .collect())
    }

    async fn delete_conversation(&self, key: &ConversationKey) -> Result<bool> {
        self.check_writable()?;
        Ok(self.conversations.lock().remove(key).is_some())
    }

    async fn delete_inactive(&self, before: DateTime<Utc>) -> Result<u64> {
        self.check_writable()?;
        let mut conversations = self.conversations.lock();
        let count = conversations.len();
        conversations.retain(|_, stored| stored.conversation.updated_at >= before);
        Ok((count - conversations.len()) as u64)
    }
}

/// Scorer answering a configurable score and counting calls.
#[derive(Debug)]
pub struct FakeScorer {
    score: Mutex<std::result::Result<RawScore, String>>,
    conversation_score: Mutex<Option<ConversationScore>>,
    calls: AtomicU32,
    conversation_calls: AtomicU32,
    last_context: Mutex<ScoringContext>,
}

impl FakeScorer {
    pub fn new(relevance_score: f64, has_key_info: bool) -> Self {
        Self {
            score: Mutex::new(Ok(RawScore {
                relevance_score,
                has_key_info,
            })),
            conversation_score: Mutex::new(None),
            calls: AtomicU32::new(0),
            conversation_calls: AtomicU32::new(0),
            last_context: Mutex::new(ScoringContext::default()),
        }
    }

    pub fn set_score(&self, relevance_score: f64, has_key_info: bool) {
        *self.score.lock() = Ok(RawScore {
            relevance_score,
            has_key_info,
        });
    }

    pub fn fail_with(&self, reason: &str) {
        *self.score.lock() = Err(reason.to_string());
    }

    pub fn set_conversation_score(&self, score: ConversationScore) {
        *self.conversation_score.lock() = Some(score);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn conversation_calls(&self) -> u32 {
        self.conversation_calls.load(Ordering::SeqCst)
    }

    /// Context handed to the most recent `score` call.
    pub fn last_context(&self) -> ScoringContext {
        self.last_context.lock().clone()
    }
}

#[async_trait]
impl Scorer for FakeScorer {
    async fn score(&self, _content: &str, context: &ScoringContext) -> Result<RawScore> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_context.lock() = context.clone();
        self.score
            .lock()
            .clone()
            .map_err(|reason| crate::error::ScorerError::Malformed(reason).into())
    }

    async fn score_conversation(&self, _messages: &[MessageRecord]) -> Result<ConversationScore> {
        self.conversation_calls.fetch_add(1, Ordering::SeqCst);
        self.conversation_score
            .lock()
            .clone()
            .ok_or_else(|| crate::error::ScorerError::Malformed("no conversation score".into()).into())
    }
}

/// Responder returning canned text and recording requests.
#[derive(Debug, Default)]
pub struct RecordingResponder {
    requests: Mutex<Vec<DispatchPayload>>,
    follow_ups: Mutex<Vec<ConversationKey>>,
    fail: AtomicBool,
    silent: AtomicBool,
}

impl RecordingResponder {
    pub fn requests(&self) -> Vec<DispatchPayload> {
        self.requests.lock().clone()
    }

    pub fn follow_ups(&self) -> Vec<ConversationKey> {
        self.follow_ups.lock().clone()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Accept requests without producing text, like a responder that posts by itself.
    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }
}

#[async_trait]
impl Responder for RecordingResponder {
    async fn respond(&self, request: &DispatchPayload) -> Result<Option<String>> {
        self.requests.lock().push(request.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow::anyhow!("generation unavailable").into());
        }
        if self.silent.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(format!("re: {}", request.content)))
    }

    async fn follow_up(&self, key: &ConversationKey, topic: Option<&str>) -> Result<Option<String>> {
        self.follow_ups.lock().push(key.clone());
        if self.silent.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(format!("still thinking about {}", topic.unwrap_or("this"))))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub id: String,
    pub key: ConversationKey,
    pub text: String,
    pub reply_to: Option<String>,
}

/// Platform recording sends and reactions.
#[derive(Debug, Default)]
pub struct FakePlatform {
    sent: Mutex<Vec<SentMessage>>,
    reactions: Mutex<Vec<(String, String)>>,
    messages: Mutex<HashMap<String, ReferencedMessage>>,
    read_only: AtomicBool,
    fail_fetch: AtomicBool,
}

impl FakePlatform {
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    /// `(message_id, emoji)` pairs.
    pub fn reactions(&self) -> Vec<(String, String)> {
        self.reactions.lock().clone()
    }

    /// Make `fetch_message` resolve `id` to a message by `author_id`.
    pub fn add_message(&self, id: &str, author_id: &str) {
        self.messages.lock().insert(
            id.to_string(),
            ReferencedMessage {
                id: id.to_string(),
                author_id: author_id.to_string(),
            },
        );
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }
}

impl ChatPlatform for FakePlatform {
    fn name(&self) -> &str {
        "fake"
    }

    async fn start(&self) -> Result<InboundStream> {
        Ok(Box::pin(futures::stream::empty()))
    }

    async fn send_message(
        &self,
        key: &ConversationKey,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<String> {
        let mut sent = self.sent.lock();
        let id = format!("sent-{}", sent.len() + 1);
        sent.push(SentMessage {
            id: id.clone(),
            key: key.clone(),
            text: text.to_string(),
            reply_to: reply_to.map(str::to_string),
        });
        Ok(id)
    }

    async fn fetch_message(
        &self,
        _key: &ConversationKey,
        message_id: &str,
    ) -> Result<Option<ReferencedMessage>> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(PlatformError::Action {
                platform: "fake".into(),
                action: "fetch message",
                reason: "unavailable".into(),
            }
            .into());
        }
        Ok(self.messages.lock().get(message_id).cloned())
    }

    async fn can_send(&self, _key: &ConversationKey) -> bool {
        !self.read_only.load(Ordering::SeqCst)
    }

    async fn react(&self, _key: &ConversationKey, message_id: &str, emoji: &str) -> Result<()> {
        self.reactions
            .lock()
            .push((message_id.to_string(), emoji.to_string()));
        Ok(())
    }
}
