//! External scoring and response collaborators.
//!
//! The engine is polymorphic over two capabilities, resolved once at startup:
//! a [`Scorer`] (scoreable) and a [`Responder`] (respondable).

use crate::config::{ScorerConfig, ScorerProvider};
use crate::conversation::MessageRecord;
use crate::error::{Result, ScorerError};
use crate::tasks::payload::DispatchPayload;
use crate::ConversationKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Score for one message, as returned by the scoring service.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawScore {
    pub relevance_score: f64,
    pub has_key_info: bool,
}

/// Score and topic for a whole conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationScore {
    pub relevance_score: f64,
    #[serde(default)]
    pub topic_summary: Option<String>,
}

/// What is known about the conversation around a scored message.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScoringContext {
    pub channel_name: Option<String>,
    /// Recent stored messages, oldest first.
    pub recent: Vec<MessageRecord>,
    /// Participant display names, most recently active first.
    pub participants: Vec<String>,
    pub last_author_name: Option<String>,
    /// Id of the assistant's latest message in the conversation.
    pub last_response_id: Option<String>,
}

/// Rates how much a message or conversation merits a response.
#[async_trait]
pub trait Scorer: Send + Sync + 'static {
    async fn score(&self, content: &str, context: &ScoringContext) -> Result<RawScore>;

    async fn score_conversation(&self, messages: &[MessageRecord]) -> Result<ConversationScore>;
}

/// Produces response text. `None` means nothing should be sent.
#[async_trait]
pub trait Responder: Send + Sync + 'static {
    async fn respond(&self, request: &DispatchPayload) -> Result<Option<String>>;

    async fn follow_up(&self, key: &ConversationKey, topic: Option<&str>) -> Result<Option<String>>;
}

/// Capability table handed to the engine.
#[derive(Clone)]
pub struct Capabilities {
    pub scorer: Arc<dyn Scorer>,
    pub responder: Arc<dyn Responder>,
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}

/// Build the configured scorer.
pub fn build_scorer(config: &ScorerConfig, neutral_score: f64) -> Result<Arc<dyn Scorer>> {
    match config.provider {
        ScorerProvider::Http => Ok(Arc::new(HttpScorer::new(config)?)),
        ScorerProvider::Neutral => Ok(Arc::new(NeutralScorer::new(neutral_score))),
    }
}

/// Answers every request with a fixed score.
#[derive(Debug, Clone, Copy)]
pub struct NeutralScorer {
    score: f64,
}

impl NeutralScorer {
    pub fn new(score: f64) -> Self {
        Self { score }
    }
}

#[async_trait]
impl Scorer for NeutralScorer {
    async fn score(&self, _: &str, _: &ScoringContext) -> Result<RawScore> {
        Ok(RawScore {
            relevance_score: self.score,
            has_key_info: false,
        })
    }

    async fn score_conversation(&self, _: &[MessageRecord]) -> Result<ConversationScore> {
        Ok(ConversationScore {
            relevance_score: self.score,
            topic_summary: None,
        })
    }
}

const MESSAGE_INSTRUCTIONS: &str = "You rate chat messages for an assistant that only speaks when it adds value. \
Consider relevance to the conversation, useful or important information, and fit with the channel. \
Answer with a raw JSON object and nothing else: \
{\"relevanceScore\": number between 0 and 1, \"hasKeyInfo\": true or false}.";

const CONVERSATION_INSTRUCTIONS: &str = "You rate whole chat conversations. \
Answer with a raw JSON object and nothing else: \
{\"relevanceScore\": number between 0 and 1, \"topicSummary\": \"main topics in at most 100 characters\"}.";

/// Scorer backed by an OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone)]
pub struct HttpScorer {
    client: reqwest::Client,
    url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpScorer {
    pub fn new(config: &ScorerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(ScorerError::Request)?;

        Ok(Self {
            client,
            url: config.url.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
        })
    }

    async fn complete(&self, instructions: &str, input: String) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                { "role": "system", "content": instructions },
                { "role": "user", "content": input },
            ],
        });

        let mut request = self
            .client
            .post(&self.url)
            .header("content-type", "application/json");
        if let Some(api_key) = &self.api_key {
            request = request.header("authorization", format!("Bearer {api_key}"));
        }

        let response = request.json(&body).send().await.map_err(ScorerError::Request)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ScorerError::Status {
                status: status.as_u16(),
            }
            .into());
        }

        let response_body: serde_json::Value =
            response.json().await.map_err(ScorerError::Request)?;
        response_body["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ScorerError::Malformed("response has no message content".into()).into())
    }
}

#[async_trait]
impl Scorer for HttpScorer {
    async fn score(&self, content: &str, context: &ScoringContext) -> Result<RawScore> {
        let text = self
            .complete(MESSAGE_INSTRUCTIONS, message_input(content, context))
            .await?;
        parse_json_reply(&text)
    }

    async fn score_conversation(&self, messages: &[MessageRecord]) -> Result<ConversationScore> {
        if messages.is_empty() {
            return Ok(ConversationScore {
                relevance_score: 0.0,
                topic_summary: None,
            });
        }

        let input = format!("Conversation to rate:\n{}", transcript(messages));
        let text = self.complete(CONVERSATION_INSTRUCTIONS, input).await?;
        parse_json_reply(&text)
    }
}

fn message_input(content: &str, context: &ScoringContext) -> String {
    let mut input = String::new();
    if let Some(channel_name) = &context.channel_name {
        input.push_str(&format!("Channel: #{channel_name}\n"));
    }
    if !context.participants.is_empty() {
        input.push_str(&format!("Participants: {}\n", context.participants.join(", ")));
    }
    if let Some(last_author) = &context.last_author_name {
        input.push_str(&format!("Last speaker: {last_author}\n"));
    }
    if context.last_response_id.is_some() {
        input.push_str("The assistant has already spoken in this conversation.\n");
    }
    if !context.recent.is_empty() {
        input.push_str("Context:\n");
        input.push_str(&transcript(&context.recent));
        input.push('\n');
    }
    input.push_str(&format!("Message to rate: {content}"));
    input
}

fn transcript(messages: &[MessageRecord]) -> String {
    messages
        .iter()
        .map(|message| format!("{}: {}", message.author_name, message.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse a JSON object out of a model reply, tolerating markdown code fences.
pub fn parse_json_reply<T: serde::de::DeserializeOwned>(text: &str) -> Result<T> {
    let trimmed = text.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end().trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();

    let json = match (unfenced.find('{'), unfenced.rfind('}')) {
        (Some(start), Some(end)) if start < end => &unfenced[start..=end],
        _ => unfenced,
    };

    serde_json::from_str(json).map_err(|error| ScorerError::Malformed(error.to_string()).into())
}
