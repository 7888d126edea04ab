// In-memory Forge implementation for tests and dev mode
//
// Tests script PR and check statuses, post comments and reactions as "the
// user", and assert on what the workflows wrote.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};

use crate::{
    format_check_failures, ArtifactState, CheckOutcome, CheckStatus, Comment, Conditional,
    Forge, ForgeError, IssuePatch, IssueRef, IssueStatus, PrStatus, Reaction,
};

/// A recorded issue
#[derive(Debug, Clone)]
pub struct IssueRecord {
    pub number: i64,
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
    pub state: ArtifactState,
    pub updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    next_issue: i64,
    next_comment: i64,
    issues: HashMap<i64, IssueRecord>,
    issue_comments: HashMap<i64, Vec<Comment>>,
    comment_reactions: HashMap<i64, Vec<Reaction>>,
    prs: HashMap<i64, PrStatus>,
    pr_comments: HashMap<i64, Vec<Comment>>,
    check_sequence: VecDeque<CheckStatus>,
    current_check: Option<CheckStatus>,
    comments_version: u64,
}

/// In-memory implementation of [`Forge`]
#[derive(Default)]
pub struct InMemoryForge {
    state: RwLock<State>,
}

impl InMemoryForge {
    /// Create an empty forge
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Test scripting
    // =========================================================================

    /// Register or update a PR
    pub fn set_pr(&self, pr: PrStatus) {
        self.state.write().prs.insert(pr.number, pr);
    }

    /// Mark a PR merged
    pub fn merge_pr(&self, number: i64) {
        let mut state = self.state.write();
        if let Some(pr) = state.prs.get_mut(&number) {
            pr.merged = true;
            pr.state = ArtifactState::Closed;
        }
    }

    /// Mark a PR closed without merging
    pub fn close_pr(&self, number: i64) {
        let mut state = self.state.write();
        if let Some(pr) = state.prs.get_mut(&number) {
            pr.state = ArtifactState::Closed;
        }
    }

    /// Queue the next check-status response; when the queue is empty the
    /// last queued status keeps repeating
    pub fn push_check_status(&self, status: CheckStatus) {
        self.state.write().check_sequence.push_back(status);
    }

    /// Post a comment as the user on an issue
    pub fn user_issue_comment(&self, issue: i64, author: &str, body: &str) -> i64 {
        let mut state = self.state.write();
        state.next_comment += 1;
        state.comments_version += 1;
        let id = state.next_comment;
        let comment = Comment {
            id,
            body: body.to_string(),
            author: author.to_string(),
            created_at: Utc::now(),
            url: format!("https://forge.test/comments/{id}"),
            is_review_comment: false,
        };
        state.issue_comments.entry(issue).or_default().push(comment);
        id
    }

    /// Post a comment as the user on a PR
    pub fn user_pr_comment(&self, pr: i64, author: &str, body: &str, is_review: bool) -> i64 {
        let mut state = self.state.write();
        state.next_comment += 1;
        let id = state.next_comment;
        let comment = Comment {
            id,
            body: body.to_string(),
            author: author.to_string(),
            created_at: Utc::now(),
            url: format!("https://forge.test/comments/{id}"),
            is_review_comment: is_review,
        };
        state.pr_comments.entry(pr).or_default().push(comment);
        id
    }

    /// React to a comment as the user
    pub fn user_reaction(&self, comment_id: i64, kind: &str, user: &str) {
        self.state
            .write()
            .comment_reactions
            .entry(comment_id)
            .or_default()
            .push(Reaction {
                kind: kind.to_string(),
                user: user.to_string(),
            });
    }

    // =========================================================================
    // Test inspection
    // =========================================================================

    /// Snapshot of a recorded issue
    pub fn issue(&self, number: i64) -> Option<IssueRecord> {
        self.state.read().issues.get(&number).cloned()
    }

    /// All comments on an issue, oldest first
    pub fn issue_comments(&self, number: i64) -> Vec<Comment> {
        self.state
            .read()
            .issue_comments
            .get(&number)
            .cloned()
            .unwrap_or_default()
    }

    /// Reactions recorded on a comment
    pub fn reactions(&self, comment_id: i64) -> Vec<Reaction> {
        self.state
            .read()
            .comment_reactions
            .get(&comment_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of issues created
    pub fn issue_count(&self) -> usize {
        self.state.read().issues.len()
    }
}

#[async_trait]
impl Forge for InMemoryForge {
    async fn create_issue(
        &self,
        _repo_url: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<IssueRef, ForgeError> {
        let mut state = self.state.write();
        state.next_issue += 1;
        let number = state.next_issue;
        state.issues.insert(
            number,
            IssueRecord {
                number,
                title: title.to_string(),
                body: body.to_string(),
                labels: labels.to_vec(),
                state: ArtifactState::Open,
                updated_at: Utc::now(),
            },
        );
        Ok(IssueRef {
            number,
            url: format!("https://forge.test/o/r/issues/{number}"),
        })
    }

    async fn update_issue(
        &self,
        _repo_url: &str,
        number: i64,
        patch: IssuePatch,
    ) -> Result<(), ForgeError> {
        let mut state = self.state.write();
        let issue = state.issues.get_mut(&number).ok_or(ForgeError::NotFound)?;
        if let Some(title) = patch.title {
            issue.title = title;
        }
        if let Some(body) = patch.body {
            issue.body = body;
        }
        if let Some(new_state) = patch.state {
            issue.state = new_state;
        }
        if let Some(labels) = patch.labels {
            issue.labels = labels;
        }
        issue.updated_at = Utc::now();
        Ok(())
    }

    async fn add_issue_comment(
        &self,
        _repo_url: &str,
        number: i64,
        body: &str,
    ) -> Result<i64, ForgeError> {
        let mut state = self.state.write();
        if !state.issues.contains_key(&number) {
            return Err(ForgeError::NotFound);
        }
        state.next_comment += 1;
        let id = state.next_comment;
        let comment = Comment {
            id,
            body: body.to_string(),
            author: "foreman".to_string(),
            created_at: Utc::now(),
            url: format!("https://forge.test/comments/{id}"),
            is_review_comment: false,
        };
        state.issue_comments.entry(number).or_default().push(comment);
        Ok(id)
    }

    async fn get_issue_status(
        &self,
        _repo_url: &str,
        number: i64,
        etag: Option<&str>,
    ) -> Result<Conditional<IssueStatus>, ForgeError> {
        let state = self.state.read();
        let issue = state.issues.get(&number).ok_or(ForgeError::NotFound)?;

        let current_etag = format!("W/\"issue-{}-{}\"", number, issue.updated_at.timestamp());
        if etag == Some(current_etag.as_str()) {
            return Ok(Conditional::unchanged(Some(current_etag)));
        }

        Ok(Conditional::fresh(
            IssueStatus {
                number,
                state: issue.state,
                title: issue.title.clone(),
                body: Some(issue.body.clone()),
                updated_at: issue.updated_at,
            },
            Some(current_etag),
        ))
    }

    async fn get_issue_comments(
        &self,
        _repo_url: &str,
        number: i64,
        since: Option<DateTime<Utc>>,
        etag: Option<&str>,
    ) -> Result<Conditional<Vec<Comment>>, ForgeError> {
        let state = self.state.read();

        let current_etag = format!("W/\"comments-{}\"", state.comments_version);
        if etag == Some(current_etag.as_str()) {
            return Ok(Conditional::unchanged(Some(current_etag)));
        }

        let mut comments = state
            .issue_comments
            .get(&number)
            .cloned()
            .unwrap_or_default();
        if let Some(since) = since {
            comments.retain(|c| c.created_at > since);
        }

        Ok(Conditional::fresh(comments, Some(current_etag)))
    }

    async fn get_comment_reactions(
        &self,
        _repo_url: &str,
        comment_id: i64,
        _is_review_comment: bool,
    ) -> Result<Vec<Reaction>, ForgeError> {
        Ok(self
            .state
            .read()
            .comment_reactions
            .get(&comment_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_pr_status(
        &self,
        _repo_url: &str,
        number: i64,
    ) -> Result<Option<PrStatus>, ForgeError> {
        Ok(self.state.read().prs.get(&number).cloned())
    }

    async fn close_pr(&self, _repo_url: &str, number: i64) -> Result<(), ForgeError> {
        let mut state = self.state.write();
        let pr = state.prs.get_mut(&number).ok_or(ForgeError::NotFound)?;
        pr.state = ArtifactState::Closed;
        Ok(())
    }

    async fn get_pr_comments(
        &self,
        _repo_url: &str,
        number: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Comment>, ForgeError> {
        let mut comments = self
            .state
            .read()
            .pr_comments
            .get(&number)
            .cloned()
            .unwrap_or_default();
        if let Some(since) = since {
            comments.retain(|c| c.created_at > since);
        }
        comments.sort_by_key(|c| c.created_at);
        Ok(comments)
    }

    async fn get_check_status(
        &self,
        _repo_url: &str,
        _number: i64,
    ) -> Result<CheckStatus, ForgeError> {
        let mut state = self.state.write();
        if let Some(next) = state.check_sequence.pop_front() {
            state.current_check = Some(next);
        }
        Ok(state.current_check.clone().unwrap_or(CheckStatus {
            overall: CheckOutcome::Success,
            runs: vec![],
            failed: vec![],
        }))
    }

    async fn get_check_failure_logs(
        &self,
        _repo_url: &str,
        _number: i64,
    ) -> Result<String, ForgeError> {
        let state = self.state.read();
        Ok(state
            .current_check
            .as_ref()
            .map(|c| format_check_failures(&c.failed))
            .unwrap_or_default())
    }

    async fn add_reaction(
        &self,
        _repo_url: &str,
        comment_id: i64,
        kind: &str,
        _is_review_comment: bool,
    ) -> Result<(), ForgeError> {
        self.state
            .write()
            .comment_reactions
            .entry(comment_id)
            .or_default()
            .push(Reaction {
                kind: kind.to_string(),
                user: "foreman".to_string(),
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_issue_lifecycle() {
        let forge = InMemoryForge::new();

        let issue = forge
            .create_issue("https://forge.test/o/r", "Add toggle", "body", &[])
            .await
            .unwrap();
        assert_eq!(issue.number, 1);

        forge
            .update_issue(
                "https://forge.test/o/r",
                1,
                IssuePatch {
                    state: Some(ArtifactState::Closed),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(forge.issue(1).unwrap().state, ArtifactState::Closed);
    }

    #[tokio::test]
    async fn test_conditional_comments() {
        let forge = InMemoryForge::new();
        forge
            .create_issue("https://forge.test/o/r", "t", "b", &[])
            .await
            .unwrap();

        let first = forge
            .get_issue_comments("https://forge.test/o/r", 1, None, None)
            .await
            .unwrap();
        assert!(!first.not_modified);
        let etag = first.etag.clone().unwrap();

        // Unchanged: 304
        let second = forge
            .get_issue_comments("https://forge.test/o/r", 1, None, Some(&etag))
            .await
            .unwrap();
        assert!(second.not_modified);

        // New comment invalidates the tag
        forge.user_issue_comment(1, "alice", "/lgtm");
        let third = forge
            .get_issue_comments("https://forge.test/o/r", 1, None, Some(&etag))
            .await
            .unwrap();
        assert!(!third.not_modified);
        assert_eq!(third.value.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_check_status_sequence() {
        let forge = InMemoryForge::new();

        forge.push_check_status(CheckStatus {
            overall: CheckOutcome::Failure,
            runs: vec![],
            failed: vec![],
        });
        forge.push_check_status(CheckStatus {
            overall: CheckOutcome::Success,
            runs: vec![],
            failed: vec![],
        });

        let first = forge
            .get_check_status("https://forge.test/o/r", 7)
            .await
            .unwrap();
        assert_eq!(first.overall, CheckOutcome::Failure);

        let second = forge
            .get_check_status("https://forge.test/o/r", 7)
            .await
            .unwrap();
        assert_eq!(second.overall, CheckOutcome::Success);

        // Last status repeats once the script is exhausted
        let third = forge
            .get_check_status("https://forge.test/o/r", 7)
            .await
            .unwrap();
        assert_eq!(third.overall, CheckOutcome::Success);
    }
}
