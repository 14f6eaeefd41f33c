//! The relevance engine: one context object owning the scheduler, debounce
//! windows, context cache, pending set and activity tracker.
//!
//! Every inbound message goes through [`RelevanceEngine::monitor`] and is
//! resolved in one pass: answered immediately, ignored, or handed to a
//! deferred analysis task. Fired tasks come back through the handlers in
//! [`super::handlers`].

use crate::config::{AssistantConfig, Config, FollowupConfig, RuntimeConfig};
use crate::conversation::{
    ContextCache, ContextEntry, ConversationRepository, MessageRecord, clamp_score,
};
use crate::debounce::DebounceCoordinator;
use crate::error::Result;
use crate::messaging::traits::{ChatPlatformDyn, InboundStream};
use crate::rate_limit::RateLimiter;
use crate::relevance::heuristics::{
    Classification, ImmediateReason, ReplyTarget, channel_adjustment, classify, is_trivial,
    reply_exception,
};
use crate::relevance::scorer::{Capabilities, RawScore, ScoringContext};
use crate::tasks::payload::{
    self, AnalysisPayload, DispatchPayload, FollowupPayload, MonitoringPayload, PendingMessage,
    TaskPayload as _,
};
use crate::tasks::{SchedulerStatus, Task, TaskKind, TaskScheduler};
use crate::{ConversationKey, ConversationKind, InboundMessage};
use chrono::Utc;
use futures::StreamExt as _;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::Instant;

/// Reaction used to acknowledge a rate-limited request.
const RATE_LIMITED_REACTION: &str = "⏳";

/// Outcome of [`RelevanceEngine::monitor`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    RespondNow { reason: ImmediateReason },
    /// A new deferred analysis task was scheduled.
    Deferred { task_id: String, delay: Duration },
    /// The message joined the conversation's outstanding analysis task.
    Coalesced { task_id: String },
    Ignored { reason: IgnoreReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    Duplicate,
    OwnMessage,
    Trivial,
    CannotSend,
    UserToUserReply,
    RateLimited,
    SchedulingFailed,
}

/// Result of scoring one piece of content.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Evaluation {
    /// Clamped scorer output, capped for bot authors.
    pub relevance_score: f64,
    /// Score after the channel-topic adjustment, compared against the threshold.
    pub effective_score: f64,
    pub has_key_info: bool,
    pub should_respond: bool,
}

impl Evaluation {
    fn ignore() -> Self {
        Self {
            relevance_score: 0.0,
            effective_score: 0.0,
            has_key_info: false,
            should_respond: false,
        }
    }
}

pub struct RelevanceEngine {
    scheduler: Arc<TaskScheduler>,
    debounce: DebounceCoordinator,
    context: ContextCache,
    conversations: Arc<dyn ConversationRepository>,
    capabilities: Capabilities,
    platform: Arc<dyn ChatPlatformDyn>,
    rate_limiter: RateLimiter,
    runtime_config: Arc<RuntimeConfig>,
    assistant: AssistantConfig,
    followup: FollowupConfig,
    /// Message ids with an unresolved verdict.
    pending: RwLock<HashSet<String>>,
    /// The fresh analysis task per conversation while its debounce window is open.
    burst_jobs: Arc<RwLock<HashMap<ConversationKey, String>>>,
    /// Last assistant interaction per conversation.
    activity: RwLock<HashMap<ConversationKey, Instant>>,
    /// Serializes the fold-or-schedule step of deferred messages.
    defer_gate: Mutex<()>,
}

impl std::fmt::Debug for RelevanceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelevanceEngine")
            .field("platform", &self.platform.name())
            .field("assistant", &self.assistant.id)
            .finish_non_exhaustive()
    }
}

impl RelevanceEngine {
    pub fn new(
        config: &Config,
        scheduler: Arc<TaskScheduler>,
        conversations: Arc<dyn ConversationRepository>,
        capabilities: Capabilities,
        platform: Arc<dyn ChatPlatformDyn>,
    ) -> Self {
        Self {
            scheduler,
            debounce: DebounceCoordinator::new(config.debounce.window()),
            context: ContextCache::new(conversations.clone(), config.context),
            conversations,
            capabilities,
            platform,
            rate_limiter: RateLimiter::from_config(&config.rate_limit),
            runtime_config: Arc::new(RuntimeConfig::new(config.policy.clone())),
            assistant: config.assistant.clone(),
            followup: config.followup,
            pending: RwLock::new(HashSet::new()),
            burst_jobs: Arc::new(RwLock::new(HashMap::new())),
            activity: RwLock::new(HashMap::new()),
            defer_gate: Mutex::new(()),
        }
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn context(&self) -> &ContextCache {
        &self.context
    }

    pub fn debounce(&self) -> &DebounceCoordinator {
        &self.debounce
    }

    pub fn runtime_config(&self) -> &Arc<RuntimeConfig> {
        &self.runtime_config
    }

    /// Decide what to do with an inbound message.
    pub async fn monitor(&self, message: InboundMessage) -> Verdict {
        if !self.pending.write().await.insert(message.id.clone()) {
            tracing::debug!(message_id = %message.id, "message already pending, ignoring");
            return Verdict::Ignored {
                reason: IgnoreReason::Duplicate,
            };
        }

        let verdict = self.classify_and_route(&message).await;

        // Deferred messages stay pending until their analysis resolves them.
        if !matches!(verdict, Verdict::Deferred { .. } | Verdict::Coalesced { .. }) {
            self.pending.write().await.remove(&message.id);
        }

        tracing::debug!(
            message_id = %message.id,
            channel_id = %message.key.channel_id,
            ?verdict,
            "message monitored"
        );
        verdict
    }

    async fn classify_and_route(&self, message: &InboundMessage) -> Verdict {
        if message.author_id == self.assistant.id {
            self.record(message, MessageRecord::analyzed(message, 0.0)).await;
            self.note_response(message.kind, &message.key, &message.id).await;
            return Verdict::Ignored {
                reason: IgnoreReason::OwnMessage,
            };
        }

        if is_trivial(&message.content) {
            self.record(message, MessageRecord::analyzed(message, 0.0)).await;
            return Verdict::Ignored {
                reason: IgnoreReason::Trivial,
            };
        }

        if !self.platform.can_send(&message.key).await {
            tracing::debug!(channel_id = %message.key.channel_id, "cannot write to channel, ignoring");
            return Verdict::Ignored {
                reason: IgnoreReason::CannotSend,
            };
        }

        let reply = self.reply_target(message).await;
        let classification = {
            let policy = self.runtime_config.policy.load();
            classify(message, &reply, &self.assistant, &policy)
        };

        match classification {
            Classification::Immediate(reason) => self.respond_now(message, reason).await,
            Classification::SuppressedReply => {
                tracing::debug!(message_id = %message.id, ?reply, "user-to-user reply suppressed");
                self.record(message, MessageRecord::analyzed(message, 0.0)).await;
                Verdict::Ignored {
                    reason: IgnoreReason::UserToUserReply,
                }
            }
            Classification::Deferred => self.defer(message).await,
        }
    }

    /// Resolve who the message replies to. A failed fetch counts as no reply.
    async fn reply_target(&self, message: &InboundMessage) -> ReplyTarget {
        let Some(reply_to) = message.reply_to.as_deref() else {
            return ReplyTarget::None;
        };

        match self.platform.fetch_message(&message.key, reply_to).await {
            Ok(Some(referenced)) if referenced.author_id == self.assistant.id => {
                ReplyTarget::Assistant
            }
            Ok(Some(referenced)) if referenced.author_id == message.author_id => {
                ReplyTarget::Author
            }
            Ok(Some(referenced)) => ReplyTarget::OtherUser(referenced.author_id),
            Ok(None) => ReplyTarget::None,
            Err(error) => {
                tracing::debug!(message_id = %message.id, %reply_to, %error, "could not resolve reply target");
                ReplyTarget::None
            }
        }
    }

    async fn respond_now(&self, message: &InboundMessage, reason: ImmediateReason) -> Verdict {
        if !self.rate_limiter.check(&message.author_id) {
            self.record(message, MessageRecord::analyzed(message, 0.0)).await;
            self.acknowledge_rate_limit(&message.key, &message.id).await;
            return Verdict::Ignored {
                reason: IgnoreReason::RateLimited,
            };
        }

        tracing::info!(message_id = %message.id, channel_id = %message.key.channel_id, %reason, "responding immediately");
        self.record(message, MessageRecord::analyzed(message, 1.0)).await;

        let entry = self.context.get(message.kind, &message.key).await;
        let request = DispatchPayload {
            key: message.key.clone(),
            kind: message.kind,
            message_id: message.id.clone(),
            author_id: message.author_id.clone(),
            author_name: message.author_name.clone(),
            content: message.content.clone(),
            relevance_score: 1.0,
            has_key_info: false,
            participants: participant_names(&entry),
            last_response_id: entry.last_response_id,
            admitted: true,
        };
        if let Err(error) = self.dispatch(&request).await {
            tracing::warn!(message_id = %message.id, %error, "immediate response failed");
        }

        Verdict::RespondNow { reason }
    }

    async fn defer(&self, message: &InboundMessage) -> Verdict {
        self.record(message, MessageRecord::unanalyzed(message)).await;

        let pending_message = PendingMessage {
            id: message.id.clone(),
            author_id: message.author_id.clone(),
            author_name: message.author_name.clone(),
            author_is_bot: message.author_is_bot,
            content: message.content.clone(),
            timestamp: message.timestamp,
        };

        let _gate = self.defer_gate.lock().await;

        let verdict = match self.fold_into_burst(&message.key, &pending_message).await {
            Some(task_id) => Verdict::Coalesced { task_id },
            None => {
                let task_id = payload::analysis_task_id(&message.id);
                let delay = self.scheduler.config().random_delay();
                match self.schedule_analysis(message, &task_id, pending_message, delay).await {
                    Ok(_) => {
                        self.burst_jobs
                            .write()
                            .await
                            .insert(message.key.clone(), task_id.clone());
                        Verdict::Deferred { task_id, delay }
                    }
                    Err(error) => {
                        tracing::warn!(message_id = %message.id, %error, "failed to schedule analysis");
                        return Verdict::Ignored {
                            reason: IgnoreReason::SchedulingFailed,
                        };
                    }
                }
            }
        };

        let task_id = match &verdict {
            Verdict::Deferred { task_id, .. } | Verdict::Coalesced { task_id } => task_id.clone(),
            _ => return verdict,
        };
        self.arm_window(&message.key, task_id).await;
        verdict
    }

    async fn schedule_analysis(
        &self,
        message: &InboundMessage,
        task_id: &str,
        pending_message: PendingMessage,
        delay: Duration,
    ) -> Result<bool> {
        let analysis = AnalysisPayload {
            key: message.key.clone(),
            kind: message.kind,
            channel_name: message.channel_name.clone(),
            messages: vec![pending_message],
        };
        self.scheduler
            .schedule(task_id, Utc::now() + to_chrono(delay), TaskKind::Analysis, analysis.to_value()?)
            .await
    }

    /// Add a message to the conversation's outstanding analysis and push it
    /// out by the debounce extension. Returns the task id on success.
    async fn fold_into_burst(
        &self,
        key: &ConversationKey,
        pending_message: &PendingMessage,
    ) -> Option<String> {
        if !self.debounce.is_active(key).await {
            return None;
        }
        let task_id = self.burst_jobs.read().await.get(key).cloned()?;
        let task = self.scheduler.pending_task(&task_id).await?;

        let mut analysis = match payload::decode::<AnalysisPayload>(&task) {
            Ok(analysis) => analysis,
            Err(error) => {
                tracing::warn!(task_id = %task_id, %error, "outstanding analysis unreadable, starting a new one");
                return None;
            }
        };
        analysis.messages.push(pending_message.clone());
        let value = analysis.to_value().ok()?;

        let execute_at = task.next_execution_at
            + to_chrono(self.scheduler.config().debounce_extension());
        match self.scheduler.reschedule(&task_id, execute_at, Some(value)).await {
            Ok(true) => {
                tracing::debug!(
                    task_id = %task_id,
                    messages = analysis.messages.len(),
                    %execute_at,
                    "message folded into outstanding analysis"
                );
                Some(task_id)
            }
            Ok(false) => None,
            Err(error) => {
                tracing::warn!(task_id = %task_id, %error, "failed to extend analysis");
                None
            }
        }
    }

    /// Open or extend the conversation's window. When it finally expires the
    /// conversation's fresh job is released so the next message starts a new one.
    async fn arm_window(&self, key: &ConversationKey, task_id: String) {
        let wait = self.debounce.arm(key).await;
        let burst_jobs = self.burst_jobs.clone();
        let key = key.clone();

        tokio::spawn(async move {
            if !wait.await {
                return;
            }
            let mut jobs = burst_jobs.write().await;
            if jobs.get(&key) == Some(&task_id) {
                jobs.remove(&key);
                tracing::debug!(conversation = %key, %task_id, "debounce window closed");
            }
        });
    }

    /// Score content the way a deferred analysis would.
    ///
    /// The channel name and participants come from the conversation's cached
    /// context entry. A user-to-user reply never responds unless the name or
    /// help exception holds.
    pub async fn evaluate(
        &self,
        key: &ConversationKey,
        content: &str,
        is_user_to_user_reply: bool,
    ) -> Evaluation {
        let entry = self
            .context
            .lookup(key)
            .await
            .unwrap_or_else(|| ContextEntry::new(Utc::now()));
        self.evaluate_message(
            key,
            &entry,
            entry.channel_name.as_deref(),
            content,
            false,
            is_user_to_user_reply,
        )
        .await
    }

    async fn evaluate_message(
        &self,
        key: &ConversationKey,
        entry: &ContextEntry,
        channel_name: Option<&str>,
        content: &str,
        author_is_bot: bool,
        is_user_to_user_reply: bool,
    ) -> Evaluation {
        if is_trivial(content) {
            return Evaluation::ignore();
        }

        let policy = self.runtime_config.policy.load_full();

        let recent = match self
            .conversations
            .recent_messages(key, policy.scorer_context_messages)
            .await
        {
            Ok(messages) => messages,
            Err(error) => {
                tracing::warn!(conversation = %key, %error, "failed to load scorer context");
                Vec::new()
            }
        };
        let context = ScoringContext {
            channel_name: channel_name.map(str::to_string),
            recent,
            participants: participant_names(entry),
            last_author_name: entry.last_author_name.clone(),
            last_response_id: entry.last_response_id.clone(),
        };

        let raw = match self.capabilities.scorer.score(content, &context).await {
            Ok(raw) => raw,
            Err(error) => {
                tracing::warn!(conversation = %key, %error, "scorer failed, using neutral score");
                RawScore {
                    relevance_score: policy.neutral_score,
                    has_key_info: false,
                }
            }
        };

        let mut relevance_score = clamp_score(raw.relevance_score);
        let mut effective_score =
            clamp_score(relevance_score + channel_adjustment(channel_name, &policy));
        if author_is_bot {
            relevance_score = relevance_score.min(policy.bot_score_cap);
            effective_score = effective_score.min(policy.bot_score_cap);
        }

        let threshold = if self.is_active(key).await {
            policy.active_threshold
        } else {
            policy.respond_threshold
        };
        let mut should_respond = effective_score >= threshold || raw.has_key_info;
        if is_user_to_user_reply && reply_exception(content, &self.assistant, &policy).is_none() {
            should_respond = false;
        }

        tracing::debug!(
            conversation = %key,
            relevance_score,
            effective_score,
            threshold,
            has_key_info = raw.has_key_info,
            should_respond,
            "content evaluated"
        );

        Evaluation {
            relevance_score,
            effective_score,
            has_key_info: raw.has_key_info,
            should_respond,
        }
    }

    /// Handle a fired analysis task.
    pub(crate) async fn run_analysis(&self, task: &Task) -> Result<()> {
        let analysis: AnalysisPayload = payload::decode(task)?;
        let key = &analysis.key;

        {
            let mut jobs = self.burst_jobs.write().await;
            if jobs.get(key) == Some(&task.id) {
                jobs.remove(key);
            }
        }

        let messages: Vec<PendingMessage> = {
            let pending = self.pending.read().await;
            analysis
                .messages
                .iter()
                .filter(|message| pending.contains(&message.id))
                .cloned()
                .collect()
        };
        let Some(latest) = messages.last() else {
            tracing::debug!("no pending messages left to analyze");
            return Ok(());
        };

        // One charge per analysis. The dispatch it schedules is already admitted.
        if !self.rate_limiter.check(&latest.author_id) {
            tracing::info!(author_id = %latest.author_id, "author rate limited, dropping analysis");
            let mut pending = self.pending.write().await;
            for message in &messages {
                pending.remove(&message.id);
            }
            return Ok(());
        }

        let entry = self.context.get(analysis.kind, key).await;
        let channel_name = analysis
            .channel_name
            .as_deref()
            .or(entry.channel_name.as_deref());
        let evaluation = self
            .evaluate_message(
                key,
                &entry,
                channel_name,
                &latest.content,
                latest.author_is_bot,
                false,
            )
            .await;

        // Messages may have been resolved elsewhere while the scorer was running.
        let resolved: Vec<&PendingMessage> = {
            let mut pending = self.pending.write().await;
            messages
                .iter()
                .filter(|message| pending.remove(&message.id))
                .collect()
        };
        let Some(latest) = resolved.last().copied() else {
            tracing::debug!("messages resolved during evaluation, dropping verdict");
            return Ok(());
        };

        let bot_score_cap = self.runtime_config.policy.load().bot_score_cap;
        for message in &resolved {
            let score = if message.author_is_bot {
                evaluation.relevance_score.min(bot_score_cap)
            } else {
                evaluation.relevance_score
            };
            if let Err(error) = self
                .conversations
                .update_message_analysis(key, &message.id, score, evaluation.has_key_info)
                .await
            {
                tracing::warn!(message_id = %message.id, %error, "failed to store message analysis");
            }
        }

        tracing::info!(
            conversation = %key,
            messages = resolved.len(),
            relevance_score = evaluation.relevance_score,
            should_respond = evaluation.should_respond,
            "analysis verdict"
        );

        if evaluation.should_respond {
            let request = DispatchPayload {
                key: key.clone(),
                kind: analysis.kind,
                message_id: latest.id.clone(),
                author_id: latest.author_id.clone(),
                author_name: latest.author_name.clone(),
                content: latest.content.clone(),
                relevance_score: evaluation.relevance_score,
                has_key_info: evaluation.has_key_info,
                participants: participant_names(&entry),
                last_response_id: entry.last_response_id.clone(),
                admitted: true,
            };
            let execute_at = Utc::now() + to_chrono(self.scheduler.config().dispatch_delay());
            self.scheduler
                .schedule(
                    &payload::dispatch_task_id(&latest.id),
                    execute_at,
                    TaskKind::ResponseDispatch,
                    request.to_value()?,
                )
                .await?;
        }

        let monitoring = MonitoringPayload {
            key: key.clone(),
            kind: analysis.kind,
        };
        let execute_at = Utc::now() + to_chrono(self.scheduler.config().monitoring_delay());
        self.scheduler
            .schedule(
                &payload::monitoring_task_id(key),
                execute_at,
                TaskKind::Monitoring,
                monitoring.to_value()?,
            )
            .await?;

        Ok(())
    }

    /// Handle a fired response dispatch task.
    pub(crate) async fn run_dispatch(&self, task: &Task) -> Result<()> {
        let request: DispatchPayload = payload::decode(task)?;

        if !request.admitted && !self.rate_limiter.check(&request.author_id) {
            tracing::info!(author_id = %request.author_id, "author rate limited, skipping response");
            self.acknowledge_rate_limit(&request.key, &request.message_id)
                .await;
            return Ok(());
        }

        self.dispatch(&request).await
    }

    /// Handle a fired monitoring task: refresh the conversation score and
    /// schedule a follow-up when it is worth one.
    pub(crate) async fn run_monitoring(&self, task: &Task) -> Result<()> {
        let monitoring: MonitoringPayload = payload::decode(task)?;
        let key = &monitoring.key;

        let messages = self
            .conversations
            .recent_messages(key, self.followup.history_limit)
            .await?;
        let score = match self.capabilities.scorer.score_conversation(&messages).await {
            Ok(score) => score,
            Err(error) => {
                tracing::warn!(conversation = %key, %error, "conversation scoring failed, keeping previous analysis");
                return Ok(());
            }
        };
        let relevance_score = clamp_score(score.relevance_score);

        self.conversations
            .update_conversation_analysis(key, relevance_score, score.topic_summary.as_deref())
            .await?;
        tracing::info!(conversation = %key, relevance_score, topic = ?score.topic_summary, "conversation analysis updated");

        if !self.followup.enabled
            || relevance_score < self.followup.threshold
            || self.is_active(key).await
        {
            return Ok(());
        }

        let followup = FollowupPayload {
            key: key.clone(),
            kind: monitoring.kind,
            topic_summary: score.topic_summary,
            relevance_score,
        };
        let execute_at = Utc::now() + to_chrono(self.followup.random_delay());
        self.scheduler
            .schedule(
                &payload::followup_task_id(key),
                execute_at,
                TaskKind::ConversationFollowup,
                followup.to_value()?,
            )
            .await?;

        Ok(())
    }

    /// Handle a fired follow-up task.
    pub(crate) async fn run_followup(&self, task: &Task) -> Result<()> {
        let followup: FollowupPayload = payload::decode(task)?;
        let key = &followup.key;

        if self.is_active(key).await {
            tracing::debug!(conversation = %key, "conversation active again, skipping follow-up");
            return Ok(());
        }
        if !self.platform.can_send(key).await {
            return Ok(());
        }

        let text = self
            .capabilities
            .responder
            .follow_up(key, followup.topic_summary.as_deref())
            .await?;
        self.mark_active(key).await;
        let Some(text) = text else {
            return Ok(());
        };

        let sent_id = self.platform.send_message(key, &text, None).await?;
        self.note_response(followup.kind, key, &sent_id).await;
        Ok(())
    }

    /// Ask the responder for text and send it as a reply.
    ///
    /// A responder that accepts the request without returning text has
    /// answered on its own, so the conversation still counts as active.
    async fn dispatch(&self, request: &DispatchPayload) -> Result<()> {
        let text = self.capabilities.responder.respond(request).await?;
        self.mark_active(&request.key).await;
        let Some(text) = text else {
            tracing::debug!(message_id = %request.message_id, "response handed off without text");
            return Ok(());
        };

        let sent_id = self
            .platform
            .send_message(&request.key, &text, Some(&request.message_id))
            .await?;
        tracing::info!(message_id = %request.message_id, %sent_id, "response sent");
        self.note_response(request.kind, &request.key, &sent_id).await;
        Ok(())
    }

    async fn note_response(&self, kind: ConversationKind, key: &ConversationKey, response_id: &str) {
        if let Err(error) = self.context.set_last_response(kind, key, response_id).await {
            tracing::warn!(conversation = %key, %error, "failed to persist last response");
        }
        self.mark_active(key).await;
    }

    async fn mark_active(&self, key: &ConversationKey) {
        self.activity
            .write()
            .await
            .insert(key.clone(), Instant::now());
    }

    async fn acknowledge_rate_limit(&self, key: &ConversationKey, message_id: &str) {
        if let Err(error) = self
            .platform
            .react(key, message_id, RATE_LIMITED_REACTION)
            .await
        {
            tracing::debug!(%message_id, %error, "failed to react to rate-limited message");
        }
    }

    async fn record(&self, message: &InboundMessage, record: MessageRecord) {
        if let Err(error) = self
            .context
            .record(message.kind, &record, message.channel_name.as_deref())
            .await
        {
            tracing::warn!(message_id = %message.id, %error, "failed to persist message, continuing from memory");
        }
    }

    /// Whether the assistant interacted in the conversation within the active window.
    pub async fn is_active(&self, key: &ConversationKey) -> bool {
        let window = self.runtime_config.policy.load().active_window();
        self.activity
            .read()
            .await
            .get(key)
            .is_some_and(|at| at.elapsed() < window)
    }

    pub async fn status(&self) -> SchedulerStatus {
        self.scheduler.status().await
    }

    /// Cancel every task and drop all pending bookkeeping.
    pub async fn stop_all(&self) {
        self.scheduler.stop_all().await;
        self.pending.write().await.clear();
        self.burst_jobs.write().await.clear();
        self.debounce.clear().await;
        self.rate_limiter.reset_all();
        tracing::info!("relevance engine stopped");
    }

    /// Remove finished task rows and idle conversations. Returns the removed count.
    pub async fn cleanup(&self) -> Result<u64> {
        let tasks_removed = self.scheduler.cleanup().await?;
        let sweep = self.context.sweep().await;

        let window = self.runtime_config.policy.load().active_window();
        self.activity
            .write()
            .await
            .retain(|_, at| at.elapsed() < window);

        Ok(tasks_removed + sweep.conversations_deleted)
    }

    /// Run until the inbound stream ends or `shutdown` resolves.
    ///
    /// Persisted tasks are restored first. Messages are monitored in arrival
    /// order; fired tasks run concurrently. Timers are left in the store on
    /// exit so the next start picks them up.
    pub async fn run(
        self: Arc<Self>,
        mut fired_rx: mpsc::UnboundedReceiver<Task>,
        mut inbound: InboundStream,
        shutdown: impl Future<Output = ()>,
        sweep_interval: Duration,
    ) -> Result<()> {
        let registry = Arc::new(super::handlers::registry(&self));

        match self.scheduler.restore().await {
            Ok(restored) => self.adopt_restored(&restored).await,
            Err(error) => tracing::warn!(%error, "failed to restore tasks, starting empty"),
        }

        let mut sweep = tokio::time::interval_at(Instant::now() + sweep_interval, sweep_interval);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                Some(task) = fired_rx.recv() => {
                    let engine = self.clone();
                    let registry = registry.clone();
                    tokio::spawn(async move {
                        engine.scheduler.execute(task, &registry).await;
                    });
                }
                message = inbound.next() => {
                    let Some(message) = message else {
                        tracing::info!("inbound stream ended");
                        break;
                    };
                    self.monitor(message).await;
                }
                _ = sweep.tick() => {
                    match self.cleanup().await {
                        Ok(removed) => tracing::info!(removed, "periodic cleanup finished"),
                        Err(error) => tracing::warn!(%error, "periodic cleanup failed"),
                    }
                }
                _ = &mut shutdown => {
                    tracing::info!("shutdown signal received");
                    break;
                }
            }
        }

        self.scheduler.shutdown().await;
        self.debounce.clear().await;
        Ok(())
    }

    /// Mark the messages of restored analysis tasks pending again so the
    /// analysis does not discard them.
    async fn adopt_restored(&self, restored: &[Task]) {
        let mut pending = self.pending.write().await;
        for task in restored.iter().filter(|task| task.kind == TaskKind::Analysis) {
            match payload::decode::<AnalysisPayload>(task) {
                Ok(analysis) => {
                    pending.extend(analysis.messages.into_iter().map(|message| message.id));
                }
                Err(error) => {
                    tracing::warn!(task_id = %task.id, %error, "restored analysis unreadable")
                }
            }
        }
    }
}

fn participant_names(entry: &ContextEntry) -> Vec<String> {
    entry
        .participants
        .iter()
        .map(|participant| participant.name.clone())
        .collect()
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}
