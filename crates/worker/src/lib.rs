// Orchestrator workflows
//
// The worker-task state machine and the per-user main-thread router, plus
// the activities they schedule. Registration helpers wire both into a
// durable runtime.

pub mod activities;
pub mod main_thread;
pub mod task_workflow;

use std::sync::Arc;

use foreman_core::{Config, EventBus};
use foreman_durable::{ActivityRegistry, WorkflowRegistry};
use foreman_forge::Forge;
use foreman_sandbox::Sandbox;
use foreman_storage::Storage;

pub use main_thread::{MainThreadInput, MainThreadWorkflow};
pub use task_workflow::{TaskWorkflow, TaskWorkflowInput, TaskWorkflowOutput};

/// Shared adapter handles the activities close over
#[derive(Clone)]
pub struct Adapters {
    pub storage: Arc<dyn Storage>,
    pub forge: Arc<dyn Forge>,
    pub sandbox: Arc<dyn Sandbox>,
    pub bus: Arc<EventBus>,
}

/// Register both workflow types
pub fn register_workflows(registry: &mut WorkflowRegistry) {
    registry.register::<TaskWorkflow>();
    registry.register::<MainThreadWorkflow>();
}

/// Register every activity the workflows schedule
pub fn register_activities(
    registry: &mut ActivityRegistry,
    adapters: &Adapters,
    config: &Config,
) {
    activities::register(registry, adapters, config);
}
