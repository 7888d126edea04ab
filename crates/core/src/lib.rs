// Orchestrator domain model
//
// This crate is DB-agnostic and network-free: entities, topic envelopes and
// pure functions shared by the workflows, the storage layer and the HTTP
// boundary.
//
// Key design decisions:
// - Tagged enums for every wire-visible payload (no stringly-typed maps)
// - Branch naming and comment parsing are pure functions, tested in isolation
// - The event bus is in-process and ephemeral; durable state lives elsewhere

pub mod branch;
pub mod bus;
pub mod config;
pub mod inbox;
pub mod routing;
pub mod task;
pub mod thread;
pub mod topics;

// Re-exports for convenience
pub use branch::derive_branch_name;
pub use bus::{BusEvent, EventBus, Subscription};
pub use config::Config;
pub use inbox::{QueueItem, QueueItemPriority, QueueItemStatus, QueueItemType};
pub use task::{TaskQuestion, TaskStatus, TaskType, WorkerTask, WorkerTaskPatch};
pub use thread::{MainThread, ThreadStatus};
pub use topics::{
    JobResultPayload, JobStatus, PlanAction, PlanResponsePayload, QuestionAction,
    QuestionResponsePayload, QueueResponsePayload, StartAction, StartImplementationPayload,
    UserMessagePayload, WorkerResultPayload, WorkerResultStatus,
};
