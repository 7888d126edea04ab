//! # Durable Execution Engine
//!
//! An event-sourced workflow orchestration engine for reliable agent-task
//! coordination. Workflows are deterministic state machines whose decisions
//! are recorded as an append-only event log; on restart the log is replayed
//! so completed steps are never re-executed.
//!
//! ## Primitives
//!
//! - **Workflows**: long-lived state machines registered by type name and
//!   started at most once per workflow id.
//! - **Activities**: units of side-effecting work scheduled by workflows and
//!   executed by the in-process worker pool. An activity's recorded result is
//!   what replay feeds back to the workflow.
//! - **Messages**: durable, topic-addressed envelopes between workflows.
//!   Delivery is FIFO per `(receiver, topic)` and each message is consumed
//!   exactly once.
//! - **Timers**: durable sleeps recorded with an absolute deadline, so a
//!   restart preserves the remaining time.
//! - **Queues**: named admission queues with a global concurrency cap and
//!   optional partition keys (per-partition concurrency 1).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Runtime                              │
//! │  (pumps timers, message waits, queue admissions, recovery)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Executor                              │
//! │  (drives workflow state machines, handles event replay)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowStore                           │
//! │  (PostgreSQL or in-memory: instances, events, tasks,        │
//! │   messages, timers, waits)                                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod activity;
pub mod engine;
pub mod persistence;
pub mod retry;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError, ActivityRegistry};
    pub use crate::engine::{
        Executor, ExecutorConfig, ExecutorError, Runtime, RuntimeConfig, WorkflowRegistry,
    };
    pub use crate::persistence::{
        InMemoryWorkflowStore, PostgresWorkflowStore, QueueConfig, StartOptions, StoreError,
        WorkflowStatus, WorkflowStore,
    };
    pub use crate::retry::RetryPolicy;
    pub use crate::workflow::{
        ActivityOptions, Workflow, WorkflowAction, WorkflowError, WorkflowEvent, WorkflowMessage,
    };
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError, ActivityRegistry};
pub use engine::{Executor, ExecutorConfig, ExecutorError, Runtime, RuntimeConfig, WorkflowRegistry};
pub use persistence::{
    InMemoryWorkflowStore, PostgresWorkflowStore, QueueConfig, StartOptions, StoreError,
    WorkflowInfo, WorkflowStatus, WorkflowStore,
};
pub use retry::RetryPolicy;
pub use workflow::{
    ActivityOptions, Workflow, WorkflowAction, WorkflowError, WorkflowEvent, WorkflowMessage,
};
