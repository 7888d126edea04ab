//! Activity execution context

use uuid::Uuid;

/// Context passed to every activity execution
///
/// Carries the identity of the scheduling workflow and the attempt number,
/// so activities can build idempotency keys and log with correlation.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    /// Workflow that scheduled this activity
    pub workflow_id: Uuid,

    /// Activity identifier within the workflow
    pub activity_id: String,

    /// Current attempt number (1-based)
    pub attempt: u32,
}

impl ActivityContext {
    /// Create a new context
    pub fn new(workflow_id: Uuid, activity_id: impl Into<String>, attempt: u32) -> Self {
        Self {
            workflow_id,
            activity_id: activity_id.into(),
            attempt,
        }
    }

    /// Whether this execution is a retry
    pub fn is_retry(&self) -> bool {
        self.attempt > 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_retry() {
        let ctx = ActivityContext::new(Uuid::now_v7(), "load-task-1", 1);
        assert!(!ctx.is_retry());

        let ctx = ActivityContext::new(Uuid::now_v7(), "load-task-1", 2);
        assert!(ctx.is_retry());
    }
}
