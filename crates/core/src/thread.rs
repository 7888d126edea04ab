// Main thread entity: one long-lived conversation per user

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How many recently used repositories the thread context keeps
pub const MAX_RECENT_REPOS: usize = 5;

/// Context key under which the recent-repos list is stored
pub const RECENT_REPOS_KEY: &str = "recent_repos";

/// Thread status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadStatus {
    Active,
    Paused,
    Error,
}

impl std::fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Paused => write!(f, "paused"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A user's main conversation thread, bound to its durable workflow
///
/// Created on first contact, lives indefinitely, never destroyed.
/// `active_task_ids` is mutated only by the owning main-thread workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MainThread {
    pub id: Uuid,
    pub user_id: String,
    /// The durable workflow run bound to this record
    #[serde(default)]
    pub workflow_run_id: Option<Uuid>,
    pub status: ThreadStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// Ordered ids of the user's active worker tasks
    #[serde(default)]
    pub active_task_ids: Vec<Uuid>,
    /// Accumulated context (e.g. the recently-used-repos list)
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl MainThread {
    /// Create a new active thread for a user
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            user_id: user_id.into(),
            workflow_run_id: None,
            status: ThreadStatus::Active,
            created_at: now,
            last_activity_at: now,
            active_task_ids: vec![],
            context: serde_json::Map::new(),
        }
    }

    /// Recently used repository URLs, most recent first
    pub fn recent_repos(&self) -> Vec<String> {
        self.context
            .get(RECENT_REPOS_KEY)
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Record a repository as most recently used, bounding the list
    pub fn push_recent_repo(&mut self, repo_url: &str) {
        let mut repos = self.recent_repos();
        repos.retain(|r| r != repo_url);
        repos.insert(0, repo_url.to_string());
        repos.truncate(MAX_RECENT_REPOS);
        self.context.insert(
            RECENT_REPOS_KEY.to_string(),
            serde_json::Value::Array(
                repos.into_iter().map(serde_json::Value::String).collect(),
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_repos_bounded_and_deduplicated() {
        let mut thread = MainThread::new("user-1");
        for i in 0..7 {
            thread.push_recent_repo(&format!("https://forge.test/o/repo-{i}"));
        }
        // Re-push an old one: moves to front instead of duplicating
        thread.push_recent_repo("https://forge.test/o/repo-5");

        let repos = thread.recent_repos();
        assert_eq!(repos.len(), MAX_RECENT_REPOS);
        assert_eq!(repos[0], "https://forge.test/o/repo-5");
        assert_eq!(repos.iter().filter(|r| r.ends_with("repo-5")).count(), 1);
    }
}
