//! Scheduled task model, storage and scheduler.

pub mod payload;
pub mod scheduler;
pub mod store;

pub use scheduler::{HandlerRegistry, SchedulerStatus, TaskHandler, TaskScheduler, TaskSummary};
pub use store::{SqliteTaskStore, Task, TaskCount, TaskKind, TaskRepository, TaskStatus};
