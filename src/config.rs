//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for `scheduler.retry_base_minutes`, one day.
const MAX_RETRY_BASE_MINUTES: u64 = 24 * 60;

/// Hearken configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory path. Resolved at load time when absent.
    pub data_dir: Option<PathBuf>,

    /// Who the assistant is on the platform.
    pub assistant: AssistantConfig,

    /// Task scheduler timings.
    pub scheduler: SchedulerConfig,

    /// Message debounce window.
    pub debounce: DebounceConfig,

    /// Conversation context cache bounds.
    pub context: ContextConfig,

    /// Relevance thresholds and keyword lists.
    pub policy: RelevancePolicy,

    /// Per-user rate limiting.
    pub rate_limit: RateLimitConfig,

    /// External scoring service.
    pub scorer: ScorerConfig,

    /// Proactive conversation follow-ups.
    pub followup: FollowupConfig,
}

/// Assistant identity used by the immediate heuristics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistantConfig {
    /// Platform user id of the assistant.
    pub id: String,

    /// Display name.
    pub name: String,

    /// Other spellings users type when addressing the assistant.
    pub aliases: Vec<String>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            id: "hearken".into(),
            name: "yassine".into(),
            aliases: vec![
                "yascine".into(),
                "yasine".into(),
                "yacine".into(),
                "le bot".into(),
            ],
        }
    }
}

impl AssistantConfig {
    /// Lowercased name plus aliases.
    pub fn name_variants(&self) -> Vec<String> {
        std::iter::once(&self.name)
            .chain(self.aliases.iter())
            .filter(|name| !name.trim().is_empty())
            .map(|name| name.to_lowercase())
            .collect()
    }
}

/// Scheduler timing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Lower bound of the randomized deferred-evaluation delay.
    pub min_delay_secs: u64,

    /// Upper bound of the randomized deferred-evaluation delay.
    pub max_delay_secs: u64,

    /// Extension applied to an outstanding evaluation while its debounce window is active.
    pub debounce_extension_secs: u64,

    /// How long a completed task row is kept before deletion.
    pub grace_period_secs: u64,

    /// Delay between a respond verdict and the response dispatch.
    pub dispatch_delay_secs: u64,

    /// Delay before a conversation relevance refresh.
    pub monitoring_delay_secs: u64,

    /// Base of the exponential retry delay, in minutes.
    pub retry_base_minutes: u64,

    /// Retries allowed before a retryable task is marked failed.
    pub max_retries: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_delay_secs: 10,
            max_delay_secs: 120,
            debounce_extension_secs: 5,
            grace_period_secs: 5,
            dispatch_delay_secs: 2,
            monitoring_delay_secs: 600,
            retry_base_minutes: 5,
            max_retries: 3,
        }
    }
}

impl SchedulerConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn debounce_extension(&self) -> Duration {
        Duration::from_secs(self.debounce_extension_secs)
    }

    pub fn dispatch_delay(&self) -> Duration {
        Duration::from_secs(self.dispatch_delay_secs)
    }

    pub fn monitoring_delay(&self) -> Duration {
        Duration::from_secs(self.monitoring_delay_secs)
    }

    /// Delay before retry number `retry_count` (1-based): `base * 2^(retry_count - 1)`.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(16);
        Duration::from_secs(
            self.retry_base_minutes
                .saturating_mul(60)
                .saturating_mul(1u64 << exponent),
        )
    }

    /// Draw a deferred-evaluation delay uniformly from the configured range.
    pub fn random_delay(&self) -> Duration {
        random_secs_between(self.min_delay_secs, self.max_delay_secs)
    }
}

/// Debounce window configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebounceConfig {
    pub window_secs: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self { window_secs: 5 }
    }
}

impl DebounceConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Bounds for the conversation context cache.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub guild_capacity: usize,
    pub direct_capacity: usize,
    pub group_capacity: usize,

    /// Entries idle for longer than this are evicted by the sweep.
    pub inactivity_hours: u64,

    pub sweep_interval_hours: u64,

    /// Fill ratio above which inserting an entry triggers a preventive sweep.
    pub preventive_ratio: f64,

    /// Messages read from the store when hydrating a missing entry.
    pub hydrate_limit: i64,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            guild_capacity: 75,
            direct_capacity: 80,
            group_capacity: 50,
            inactivity_hours: 12,
            sweep_interval_hours: 2,
            preventive_ratio: 0.9,
            hydrate_limit: 10,
        }
    }
}

impl ContextConfig {
    pub fn capacity(&self, kind: crate::ConversationKind) -> usize {
        match kind {
            crate::ConversationKind::Guild => self.guild_capacity,
            crate::ConversationKind::Direct => self.direct_capacity,
            crate::ConversationKind::Group => self.group_capacity,
        }
    }

    pub fn inactivity(&self) -> chrono::Duration {
        chrono::Duration::hours(self.inactivity_hours as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_hours * 3600)
    }
}

/// The single source of every relevance threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelevancePolicy {
    /// Effective score at or above which the assistant responds.
    pub respond_threshold: f64,

    /// Lowered threshold used while a conversation is active.
    pub active_threshold: f64,

    /// How long after an interaction a conversation counts as active.
    pub active_window_secs: u64,

    /// Ceiling for scores of bot-authored messages.
    pub bot_score_cap: f64,

    /// Score used when the scorer fails or answers nonsense.
    pub neutral_score: f64,

    /// Added for channels on the technical/social allow-list.
    pub technical_bonus: f64,

    /// Subtracted for administrative/announcement channels.
    pub administrative_penalty: f64,

    /// Recent messages handed to the scorer as context.
    pub scorer_context_messages: i64,

    pub urgency_keywords: Vec<String>,
    pub help_keywords: Vec<String>,
    pub technical_channels: Vec<String>,
    pub administrative_channels: Vec<String>,
}

impl Default for RelevancePolicy {
    fn default() -> Self {
        Self {
            respond_threshold: 0.5,
            active_threshold: 0.3,
            active_window_secs: 60,
            bot_score_cap: 0.3,
            neutral_score: 0.4,
            technical_bonus: 0.25,
            administrative_penalty: 0.15,
            scorer_context_messages: 5,
            urgency_keywords: strings(&[
                "urgent", "important", "help", "aide", "sos", "problème", "problem",
            ]),
            help_keywords: strings(&["help", "aide"]),
            technical_channels: strings(&[
                "general", "discussion", "chat", "meme", "fun", "social", "random",
            ]),
            administrative_channels: strings(&["admin", "mod", "annonce", "règle", "important"]),
        }
    }
}

impl RelevancePolicy {
    pub fn active_window(&self) -> Duration {
        Duration::from_secs(self.active_window_secs)
    }
}

/// Per-user fixed-window rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub window_secs: u64,
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 30,
            max_requests: 10,
        }
    }
}

/// Which scoring backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorerProvider {
    /// OpenAI-compatible chat completions endpoint.
    Http,
    /// Always answers the neutral default. Useful without a scoring service.
    Neutral,
}

/// External scoring service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    pub provider: ScorerProvider,
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            provider: ScorerProvider::Neutral,
            url: "https://api.openai.com/v1/chat/completions".into(),
            model: "gpt-4o-mini".into(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

/// Proactive follow-up configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FollowupConfig {
    pub enabled: bool,

    /// Conversation score at or above which a follow-up is scheduled.
    pub threshold: f64,

    pub min_delay_secs: u64,
    pub max_delay_secs: u64,

    /// Messages handed to the conversation scorer.
    pub history_limit: i64,
}

impl Default for FollowupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 0.4,
            min_delay_secs: 5,
            max_delay_secs: 60,
            history_limit: 20,
        }
    }
}

impl FollowupConfig {
    pub fn random_delay(&self) -> Duration {
        random_secs_between(self.min_delay_secs, self.max_delay_secs)
    }
}

fn random_secs_between(min_secs: u64, max_secs: u64) -> Duration {
    use rand::Rng as _;
    let min = Duration::from_secs(min_secs);
    let max = Duration::from_secs(max_secs.max(min_secs));
    if min == max {
        return min;
    }
    rand::rng().random_range(min..=max)
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

impl Config {
    /// Load configuration from the default config file (if any) and the environment.
    pub fn load() -> Result<Self> {
        let data_dir = match std::env::var("HEARKEN_DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => default_data_dir()?,
        };
        let path = data_dir.join("hearken.toml");

        let mut config = if path.exists() {
            Self::parse_file(&path)?
        } else {
            Self::default()
        };
        config.data_dir.get_or_insert(data_dir);
        config.finish()
    }

    /// Load from a specific config file path.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = Self::parse_file(path)?;
        if config.data_dir.is_none() {
            config.data_dir = Some(default_data_dir()?);
        }
        config.finish()
    }

    /// Parse a TOML document without touching the environment or filesystem.
    pub fn from_toml(source: &str) -> Result<Self> {
        let config: Config = toml::from_str(source).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<Self> {
        let source = std::fs::read_to_string(path).map_err(|error| ConfigError::Load {
            path: path.display().to_string(),
            source: Arc::new(error),
        })?;
        Ok(toml::from_str(&source).map_err(ConfigError::Parse)?)
    }

    fn finish(mut self) -> Result<Self> {
        self.apply_env();
        self.validate()?;

        let data_dir = self.data_dir();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;

        Ok(self)
    }

    fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("HEARKEN_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(value));
        }
        if let Ok(value) = std::env::var("HEARKEN_ASSISTANT_ID") {
            self.assistant.id = value;
        }
        if let Ok(value) = std::env::var("HEARKEN_SCORER_URL") {
            self.scorer.url = value;
            self.scorer.provider = ScorerProvider::Http;
        }
        if let Ok(value) = std::env::var("HEARKEN_SCORER_MODEL") {
            self.scorer.model = value;
        }
        if let Ok(value) = std::env::var("HEARKEN_SCORER_API_KEY") {
            self.scorer.api_key = Some(value);
        }
    }

    /// Reject settings that would break scheduling or scoring invariants.
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| -> Result<()> { Err(ConfigError::Invalid(message).into()) };

        if self.scheduler.min_delay_secs > self.scheduler.max_delay_secs {
            return invalid("scheduler.min_delay_secs exceeds scheduler.max_delay_secs".into());
        }
        if self.scheduler.retry_base_minutes > MAX_RETRY_BASE_MINUTES {
            return invalid(format!(
                "scheduler.retry_base_minutes must be at most {MAX_RETRY_BASE_MINUTES}"
            ));
        }
        if self.followup.min_delay_secs > self.followup.max_delay_secs {
            return invalid("followup.min_delay_secs exceeds followup.max_delay_secs".into());
        }
        for kind in crate::ConversationKind::ALL {
            if self.context.capacity(kind) == 0 {
                return invalid(format!("context capacity for {kind} must be positive"));
            }
        }
        if self.context.inactivity_hours == 0 || self.context.sweep_interval_hours == 0 {
            return invalid(
                "context.inactivity_hours and context.sweep_interval_hours must be positive".into(),
            );
        }
        if !(0.0..=1.0).contains(&self.context.preventive_ratio) {
            return invalid("context.preventive_ratio must be within [0, 1]".into());
        }
        if self.rate_limit.max_requests == 0 || self.rate_limit.window_secs == 0 {
            return invalid("rate_limit window and max_requests must be positive".into());
        }

        let policy = &self.policy;
        let unit = [
            ("policy.respond_threshold", policy.respond_threshold),
            ("policy.active_threshold", policy.active_threshold),
            ("policy.bot_score_cap", policy.bot_score_cap),
            ("policy.neutral_score", policy.neutral_score),
            ("followup.threshold", self.followup.threshold),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{name} must be within [0, 1], got {value}"));
            }
        }
        if self.scorer.provider == ScorerProvider::Http && self.scorer.url.trim().is_empty() {
            return invalid("scorer.url is required for the http provider".into());
        }

        Ok(())
    }

    /// Resolved data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("./data"))
    }

    /// Get the SQLite database path.
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir().join("hearken.db")
    }
}

fn default_data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|dir| dir.join("hearken"))
        .ok_or_else(|| ConfigError::NoDataDir.into())
}

/// Values that can be swapped while the engine is running.
#[derive(Debug)]
pub struct RuntimeConfig {
    pub policy: ArcSwap<RelevancePolicy>,
}

impl RuntimeConfig {
    pub fn new(policy: RelevancePolicy) -> Self {
        Self {
            policy: ArcSwap::from_pointee(policy),
        }
    }

    /// Replace the relevance policy. In-flight evaluations keep the policy they loaded.
    pub fn set_policy(&self, policy: RelevancePolicy) {
        self.policy.store(Arc::new(policy));
    }

    /// Apply the hot-reloadable parts of a freshly loaded config.
    pub fn reload_config(&self, config: &Config) {
        if **self.policy.load() == config.policy {
            tracing::debug!("relevance policy unchanged");
            return;
        }
        self.set_policy(config.policy.clone());
        tracing::info!(
            respond_threshold = config.policy.respond_threshold,
            active_threshold = config.policy.active_threshold,
            "relevance policy reloaded"
        );
    }
}
