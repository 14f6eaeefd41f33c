//! Task handlers wiring fired tasks back into the engine.

use crate::error::Result;
use crate::relevance::RelevanceEngine;
use crate::tasks::{HandlerRegistry, Task, TaskHandler, TaskKind};
use async_trait::async_trait;
use std::sync::Arc;

/// Scores a burst of deferred messages and schedules the follow-on tasks.
pub struct AnalysisHandler {
    engine: Arc<RelevanceEngine>,
}

#[async_trait]
impl TaskHandler for AnalysisHandler {
    async fn run(&self, task: &Task) -> Result<()> {
        self.engine.run_analysis(task).await
    }
}

/// Sends the response decided by an analysis.
pub struct DispatchHandler {
    engine: Arc<RelevanceEngine>,
}

#[async_trait]
impl TaskHandler for DispatchHandler {
    async fn run(&self, task: &Task) -> Result<()> {
        self.engine.run_dispatch(task).await
    }
}

pub struct MonitoringHandler {
    engine: Arc<RelevanceEngine>,
}

#[async_trait]
impl TaskHandler for MonitoringHandler {
    async fn run(&self, task: &Task) -> Result<()> {
        self.engine.run_monitoring(task).await
    }
}

pub struct FollowupHandler {
    engine: Arc<RelevanceEngine>,
}

#[async_trait]
impl TaskHandler for FollowupHandler {
    async fn run(&self, task: &Task) -> Result<()> {
        self.engine.run_followup(task).await
    }
}

/// One handler per task kind, all backed by the same engine.
pub fn registry(engine: &Arc<RelevanceEngine>) -> HandlerRegistry {
    HandlerRegistry::new()
        .register(
            TaskKind::Analysis,
            AnalysisHandler {
                engine: engine.clone(),
            },
        )
        .register(
            TaskKind::ResponseDispatch,
            DispatchHandler {
                engine: engine.clone(),
            },
        )
        .register(
            TaskKind::Monitoring,
            MonitoringHandler {
                engine: engine.clone(),
            },
        )
        .register(
            TaskKind::ConversationFollowup,
            FollowupHandler {
                engine: engine.clone(),
            },
        )
}
