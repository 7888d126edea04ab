// Forge adapter
//
// Abstracts the Git-hosting platform behind the `Forge` trait so the worker
// workflow and tests can run against an in-memory fake. All read operations
// that the underlying API serves conditionally carry ETags in and out.

mod body;
mod commands;
mod github;
mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use body::IssueBody;
pub use commands::{
    format_feedback, is_actionable_feedback, is_approval_reaction, parse_answer_block,
    parse_command, IssueCommand, APPROVAL_REACTIONS,
};
pub use github::GithubForge;
pub use memory::{InMemoryForge, IssueRecord};

/// Error type for forge operations
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    /// Resource does not exist
    #[error("not found")]
    NotFound,

    /// Rate limited by the platform
    #[error("rate limited")]
    RateLimited,

    /// Unexpected HTTP status
    #[error("http status {0}")]
    Status(u16),

    /// Network-level failure
    #[error("network error: {0}")]
    Network(String),

    /// Response body did not match the expected shape
    #[error("decode error: {0}")]
    Decode(String),

    /// Repository URL could not be parsed into owner/repo
    #[error("invalid repository url: {0}")]
    InvalidRepoUrl(String),
}

impl ForgeError {
    /// Whether a retry may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited | Self::Network(_) => true,
            Self::Status(code) => *code >= 500,
            Self::NotFound | Self::Decode(_) | Self::InvalidRepoUrl(_) => false,
        }
    }
}

/// Result of a conditional request
///
/// `not_modified` means the caller's ETag still matches and `value` is
/// `None`; otherwise `value` holds the fresh data and `etag` the new tag.
#[derive(Debug, Clone)]
pub struct Conditional<T> {
    pub value: Option<T>,
    pub etag: Option<String>,
    pub not_modified: bool,
}

impl<T> Conditional<T> {
    /// A fresh response
    pub fn fresh(value: T, etag: Option<String>) -> Self {
        Self {
            value: Some(value),
            etag,
            not_modified: false,
        }
    }

    /// A 304 response
    pub fn unchanged(etag: Option<String>) -> Self {
        Self {
            value: None,
            etag,
            not_modified: true,
        }
    }
}

/// Reference to a created issue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueRef {
    pub number: i64,
    pub url: String,
}

/// Open/closed state shared by issues and PRs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactState {
    Open,
    Closed,
}

/// Issue status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssueStatus {
    pub number: i64,
    pub state: ArtifactState,
    pub title: String,
    pub body: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Fields to change on an issue
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssuePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<ArtifactState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
}

/// A comment on an issue or PR
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub body: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub url: String,
    /// True for inline code-review comments
    #[serde(default)]
    pub is_review_comment: bool,
}

/// A reaction on a comment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reaction {
    /// Reaction kind (`+1`, `rocket`, `heart`, `hooray`, `eyes`, ...)
    pub kind: String,
    pub user: String,
}

/// Pull request status snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrStatus {
    pub number: i64,
    pub state: ArtifactState,
    pub merged: bool,
    pub title: String,
    pub head_branch: String,
    pub head_sha: String,
    pub base_branch: String,
    pub url: String,
    #[serde(default)]
    pub mergeable: Option<bool>,
}

/// Overall outcome of a commit's check runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    Pending,
    Success,
    Failure,
}

/// A single check run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRun {
    pub name: String,
    pub completed: bool,
    #[serde(default)]
    pub conclusion: Option<String>,
    #[serde(default)]
    pub details_url: Option<String>,
    #[serde(default)]
    pub output_title: Option<String>,
    #[serde(default)]
    pub output_summary: Option<String>,
}

/// Combined status of all check runs for a PR's head commit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckStatus {
    pub overall: CheckOutcome,
    pub runs: Vec<CheckRun>,
    pub failed: Vec<CheckRun>,
}

/// Abstraction over the Git-hosting platform
///
/// All operations retry transient failures internally; errors surfacing to
/// the caller are final.
#[async_trait]
pub trait Forge: Send + Sync + 'static {
    /// Create an issue; returns its number and URL
    async fn create_issue(
        &self,
        repo_url: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<IssueRef, ForgeError>;

    /// Update issue fields
    async fn update_issue(
        &self,
        repo_url: &str,
        number: i64,
        patch: IssuePatch,
    ) -> Result<(), ForgeError>;

    /// Add a comment to an issue; returns the comment id
    async fn add_issue_comment(
        &self,
        repo_url: &str,
        number: i64,
        body: &str,
    ) -> Result<i64, ForgeError>;

    /// Get issue status, conditionally
    async fn get_issue_status(
        &self,
        repo_url: &str,
        number: i64,
        etag: Option<&str>,
    ) -> Result<Conditional<IssueStatus>, ForgeError>;

    /// Get issue comments newer than `since`, conditionally
    async fn get_issue_comments(
        &self,
        repo_url: &str,
        number: i64,
        since: Option<DateTime<Utc>>,
        etag: Option<&str>,
    ) -> Result<Conditional<Vec<Comment>>, ForgeError>;

    /// List reactions on a comment
    async fn get_comment_reactions(
        &self,
        repo_url: &str,
        comment_id: i64,
        is_review_comment: bool,
    ) -> Result<Vec<Reaction>, ForgeError>;

    /// Get PR status; `None` when the PR does not exist
    async fn get_pr_status(
        &self,
        repo_url: &str,
        number: i64,
    ) -> Result<Option<PrStatus>, ForgeError>;

    /// Close a PR without merging (cancellation path)
    async fn close_pr(&self, repo_url: &str, number: i64) -> Result<(), ForgeError>;

    /// Get PR comments (general and inline review) newer than `since`
    async fn get_pr_comments(
        &self,
        repo_url: &str,
        number: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Comment>, ForgeError>;

    /// Combined check status for the PR's head commit
    async fn get_check_status(
        &self,
        repo_url: &str,
        number: i64,
    ) -> Result<CheckStatus, ForgeError>;

    /// Formatted failure context from failed check runs
    async fn get_check_failure_logs(
        &self,
        repo_url: &str,
        number: i64,
    ) -> Result<String, ForgeError>;

    /// React to a comment (acknowledgement)
    async fn add_reaction(
        &self,
        repo_url: &str,
        comment_id: i64,
        kind: &str,
        is_review_comment: bool,
    ) -> Result<(), ForgeError>;
}

/// Parse `(owner, repo)` out of a repository URL
///
/// Tolerates trailing slashes and a `.git` suffix.
pub fn parse_repo_url(repo_url: &str) -> Result<(String, String), ForgeError> {
    let trimmed = repo_url.trim_end_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);

    let mut parts = trimmed.rsplit('/');
    let repo = parts.next().filter(|s| !s.is_empty());
    let owner = parts.next().filter(|s| !s.is_empty());

    match (owner, repo) {
        (Some(owner), Some(repo)) if parts.next().is_some() => {
            Ok((owner.to_string(), repo.to_string()))
        }
        _ => Err(ForgeError::InvalidRepoUrl(repo_url.to_string())),
    }
}

/// Format failure context from failed check runs
///
/// One section per failed run (name, output title, truncated summary,
/// details URL), joined by `---` separators.
pub fn format_check_failures(failed: &[CheckRun]) -> String {
    const SUMMARY_LIMIT: usize = 2000;

    let mut parts = Vec::with_capacity(failed.len());
    for run in failed {
        let mut lines = vec![format!("## Failed: {}", run.name)];
        if let Some(title) = &run.output_title {
            lines.push(format!("**{title}**"));
        }
        if let Some(summary) = &run.output_summary {
            if summary.len() > SUMMARY_LIMIT {
                let cut = summary
                    .char_indices()
                    .take_while(|(i, _)| *i < SUMMARY_LIMIT)
                    .last()
                    .map(|(i, c)| i + c.len_utf8())
                    .unwrap_or(0);
                lines.push(format!("{}\n... (truncated)", &summary[..cut]));
            } else {
                lines.push(summary.clone());
            }
        }
        if let Some(url) = &run.details_url {
            lines.push(format!("Details: {url}"));
        }
        parts.push(lines.join("\n"));
    }

    parts.join("\n\n---\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_repo_url_variants() {
        for url in [
            "https://forge.test/acme/web-app",
            "https://forge.test/acme/web-app/",
            "https://forge.test/acme/web-app.git",
        ] {
            let (owner, repo) = parse_repo_url(url).unwrap();
            assert_eq!(owner, "acme");
            assert_eq!(repo, "web-app");
        }
    }

    #[test]
    fn test_parse_repo_url_rejects_garbage() {
        assert!(parse_repo_url("not-a-url").is_err());
        assert!(parse_repo_url("").is_err());
    }

    #[test]
    fn test_format_check_failures() {
        let failed = vec![CheckRun {
            name: "lint".to_string(),
            completed: true,
            conclusion: Some("failure".to_string()),
            details_url: Some("https://forge.test/runs/1".to_string()),
            output_title: Some("Lint failed".to_string()),
            output_summary: Some("LINT: missing semicolon".to_string()),
        }];

        let formatted = format_check_failures(&failed);
        assert!(formatted.contains("## Failed: lint"));
        assert!(formatted.contains("LINT: missing semicolon"));
        assert!(formatted.contains("Details: https://forge.test/runs/1"));
    }

    #[test]
    fn test_format_check_failures_truncates_long_summaries() {
        let failed = vec![CheckRun {
            name: "test".to_string(),
            completed: true,
            conclusion: Some("failure".to_string()),
            details_url: None,
            output_title: None,
            output_summary: Some("x".repeat(5000)),
        }];

        let formatted = format_check_failures(&failed);
        assert!(formatted.contains("... (truncated)"));
        assert!(formatted.len() < 2200);
    }

    #[test]
    fn test_transient_classification() {
        assert!(ForgeError::RateLimited.is_transient());
        assert!(ForgeError::Status(502).is_transient());
        assert!(ForgeError::Network("reset".to_string()).is_transient());
        assert!(!ForgeError::NotFound.is_transient());
        assert!(!ForgeError::Status(404).is_transient());
    }
}
