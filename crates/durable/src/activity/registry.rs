//! Activity registry for type-erased activity execution
//!
//! The registry maps activity type names to executable instances so the
//! runtime's worker pool can run activities from JSON input without knowing
//! concrete types.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::{Activity, ActivityContext, ActivityError};

/// Type-erased activity interface
///
/// All inputs and outputs are JSON; typed conversion happens at the edges.
#[async_trait]
pub trait AnyActivity: Send + Sync {
    /// Execute the activity with a JSON input, returning a JSON output
    async fn execute_json(
        &self,
        ctx: &ActivityContext,
        input: Value,
    ) -> Result<Value, ActivityError>;
}

/// Wrapper to implement AnyActivity for any Activity
struct ActivityWrapper<A: Activity> {
    inner: A,
}

#[async_trait]
impl<A: Activity> AnyActivity for ActivityWrapper<A> {
    async fn execute_json(
        &self,
        ctx: &ActivityContext,
        input: Value,
    ) -> Result<Value, ActivityError> {
        let typed_input: A::Input = serde_json::from_value(input).map_err(|e| {
            ActivityError::non_retryable(format!("invalid activity input: {e}"))
                .with_type("INVALID_INPUT")
        })?;

        let output = self.inner.execute(ctx, typed_input).await?;

        serde_json::to_value(output).map_err(|e| {
            ActivityError::non_retryable(format!("failed to serialize activity output: {e}"))
                .with_type("INVALID_OUTPUT")
        })
    }
}

/// Registry of executable activities
#[derive(Default)]
pub struct ActivityRegistry {
    activities: HashMap<String, Arc<dyn AnyActivity>>,
}

impl ActivityRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            activities: HashMap::new(),
        }
    }

    /// Register an activity instance
    ///
    /// Activities typically carry their dependencies (adapter handles) as
    /// fields, so registration takes an instance rather than a type.
    pub fn register<A: Activity>(&mut self, activity: A) {
        self.activities
            .insert(A::TYPE.to_string(), Arc::new(ActivityWrapper { inner: activity }));
    }

    /// Check if an activity type is registered
    pub fn contains(&self, activity_type: &str) -> bool {
        self.activities.contains_key(activity_type)
    }

    /// Look up an activity by type name
    pub fn get(&self, activity_type: &str) -> Option<Arc<dyn AnyActivity>> {
        self.activities.get(activity_type).cloned()
    }

    /// Number of registered activity types
    pub fn len(&self) -> usize {
        self.activities.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }
}

impl fmt::Debug for ActivityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityRegistry")
            .field("activity_types", &self.activities.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use uuid::Uuid;

    #[derive(Deserialize)]
    struct EchoInput {
        value: i64,
    }

    #[derive(Serialize)]
    struct EchoOutput {
        value: i64,
    }

    struct EchoActivity;

    #[async_trait]
    impl Activity for EchoActivity {
        const TYPE: &'static str = "echo";
        type Input = EchoInput;
        type Output = EchoOutput;

        async fn execute(
            &self,
            _ctx: &ActivityContext,
            input: Self::Input,
        ) -> Result<Self::Output, ActivityError> {
            Ok(EchoOutput { value: input.value })
        }
    }

    #[tokio::test]
    async fn test_register_and_execute() {
        let mut registry = ActivityRegistry::new();
        registry.register(EchoActivity);

        assert!(registry.contains("echo"));
        assert!(!registry.contains("unknown"));

        let activity = registry.get("echo").expect("registered");
        let ctx = ActivityContext::new(Uuid::now_v7(), "echo-1", 1);
        let result = activity
            .execute_json(&ctx, serde_json::json!({ "value": 42 }))
            .await
            .expect("should execute");

        assert_eq!(result, serde_json::json!({ "value": 42 }));
    }

    #[tokio::test]
    async fn test_invalid_input_is_non_retryable() {
        let mut registry = ActivityRegistry::new();
        registry.register(EchoActivity);

        let activity = registry.get("echo").unwrap();
        let ctx = ActivityContext::new(Uuid::now_v7(), "echo-1", 1);
        let err = activity
            .execute_json(&ctx, serde_json::json!({ "wrong": true }))
            .await
            .unwrap_err();

        assert!(!err.retryable);
        assert_eq!(err.error_type.as_deref(), Some("INVALID_INPUT"));
    }
}
