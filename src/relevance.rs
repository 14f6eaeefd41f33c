//! Relevance decisions: immediate heuristics, deferred scoring and the engine
//! that owns every piece of per-conversation state.

pub mod engine;
pub mod handlers;
pub mod heuristics;
pub mod scorer;

pub use engine::{Evaluation, IgnoreReason, RelevanceEngine, Verdict};
pub use heuristics::{Classification, ImmediateReason, ReplyTarget};
pub use scorer::{
    Capabilities, ConversationScore, HttpScorer, NeutralScorer, RawScore, Responder, Scorer,
    ScoringContext,
};
