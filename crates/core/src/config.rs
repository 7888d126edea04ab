// Configuration from environment variables
//
// Loaded once at startup (after dotenvy); handed by reference to the
// components that need it. No global statics.

use std::time::Duration;

/// Application version compiled into the binary
///
/// The durable runtime refuses to resume workflow records tagged with a
/// different version. Bump on incompatible changes to workflow step order.
pub const APP_VERSION: &str = "9";

/// Application settings
#[derive(Debug, Clone)]
pub struct Config {
    // Database (PostgreSQL), constructed from parts
    pub db_host: String,
    pub db_port: u16,
    pub db_name: String,
    pub db_user: String,
    pub db_password: String,

    // Forge
    pub forge_token: String,
    /// Handle whose mentions make comments actionable (e.g. "@foreman")
    pub agent_handle: String,

    // Server
    pub host: String,
    pub port: u16,

    /// Internal URL executor jobs use to call back
    pub internal_base_url: String,

    // Sandbox
    pub sandbox_image: String,
    /// Namespace the secrets are copied from
    pub home_namespace: String,
    /// Executor model for worker jobs
    pub worker_model: String,

    // Queues
    pub worker_concurrency: usize,

    /// Poll interval for PR/check status
    pub pr_poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_host: "localhost".to_string(),
            db_port: 5432,
            db_name: "foreman".to_string(),
            db_user: "foreman".to_string(),
            db_password: String::new(),
            forge_token: String::new(),
            agent_handle: "@foreman".to_string(),
            host: "0.0.0.0".to_string(),
            port: 8000,
            internal_base_url: "http://foreman-backend.foreman.svc.cluster.local:8000"
                .to_string(),
            sandbox_image: "ghcr.io/foreman/agent-runner:latest".to_string(),
            home_namespace: "foreman".to_string(),
            worker_model: "opus".to_string(),
            worker_concurrency: 3,
            pr_poll_interval: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Read configuration from the environment, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            db_host: env_or("DB_HOST", defaults.db_host),
            db_port: env_parse("DB_PORT", defaults.db_port),
            db_name: env_or("DB_NAME", defaults.db_name),
            db_user: env_or("DB_USER", defaults.db_user),
            db_password: env_or("DB_PASSWORD", defaults.db_password),
            forge_token: env_or("GITHUB_TOKEN", defaults.forge_token),
            agent_handle: env_or("AGENT_HANDLE", defaults.agent_handle),
            host: env_or("HOST", defaults.host),
            port: env_parse("PORT", defaults.port),
            internal_base_url: env_or("BACKEND_INTERNAL_URL", defaults.internal_base_url),
            sandbox_image: env_or("SANDBOX_IMAGE", defaults.sandbox_image),
            home_namespace: env_or("HOME_NAMESPACE", defaults.home_namespace),
            worker_model: env_or("WORKER_MODEL", defaults.worker_model),
            worker_concurrency: env_parse("WORKER_CONCURRENCY", defaults.worker_concurrency),
            pr_poll_interval: Duration::from_secs(env_parse(
                "PR_POLL_INTERVAL_SECS",
                defaults.pr_poll_interval.as_secs(),
            )),
        }
    }

    /// PostgreSQL connection URL constructed from parts
    pub fn database_url(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.db_user, self.db_password, self.db_host, self.db_port, self.db_name
        )
    }

    /// Callback URL for a task's executor jobs
    pub fn callback_url(&self, task_id: uuid::Uuid) -> String {
        format!("{}/internal/tasks/{}/complete", self.internal_base_url, task_id)
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_url() {
        let config = Config {
            db_user: "app".to_string(),
            db_password: "secret".to_string(),
            db_host: "db".to_string(),
            db_port: 5433,
            db_name: "orchestrator".to_string(),
            ..Default::default()
        };
        assert_eq!(
            config.database_url(),
            "postgresql://app:secret@db:5433/orchestrator"
        );
    }

    #[test]
    fn test_callback_url() {
        let config = Config {
            internal_base_url: "http://backend:8000".to_string(),
            ..Default::default()
        };
        let task_id = uuid::Uuid::nil();
        assert_eq!(
            config.callback_url(task_id),
            format!("http://backend:8000/internal/tasks/{task_id}/complete")
        );
    }
}
