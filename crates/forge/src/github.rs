// GitHub REST v3 implementation of the Forge trait
//
// Conditional requests use If-None-Match; transient failures (429, 5xx,
// network) are retried with exponential backoff before surfacing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, IF_NONE_MATCH, USER_AGENT};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use crate::{
    format_check_failures, parse_repo_url, ArtifactState, CheckOutcome, CheckRun, CheckStatus,
    Comment, Conditional, Forge, ForgeError, IssuePatch, IssueRef, IssueStatus, PrStatus,
    Reaction,
};

const DEFAULT_API_BASE: &str = "https://api.github.com";
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// GitHub-backed forge
pub struct GithubForge {
    client: Client,
    api_base: String,
    token: Option<String>,
}

impl GithubForge {
    /// Create a client against api.github.com
    pub fn new(token: impl Into<String>) -> Self {
        let token = token.into();
        Self {
            client: Client::new(),
            api_base: DEFAULT_API_BASE.to_string(),
            token: (!token.is_empty()).then_some(token),
        }
    }

    /// Create a client against a custom API base (GitHub Enterprise, tests)
    pub fn with_api_base(token: impl Into<String>, api_base: impl Into<String>) -> Self {
        let mut forge = Self::new(token);
        forge.api_base = api_base.into();
        forge
    }

    fn headers(&self, etag: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github.v3+json"));
        headers.insert(USER_AGENT, HeaderValue::from_static("foreman-orchestrator"));
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        if let Some(etag) = etag {
            if let Ok(value) = HeaderValue::from_str(etag) {
                headers.insert(IF_NONE_MATCH, value);
            }
        }
        headers
    }

    /// Issue a request with transient-failure retry
    async fn request(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<Response, ForgeError> {
        let mut last_error = ForgeError::Network("no attempts made".to_string());

        for attempt in 1..=MAX_ATTEMPTS {
            match build().send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        last_error = ForgeError::RateLimited;
                    } else if status.is_server_error() {
                        last_error = ForgeError::Status(status.as_u16());
                    } else {
                        return Ok(response);
                    }
                }
                Err(e) => {
                    last_error = ForgeError::Network(e.to_string());
                }
            }

            if attempt < MAX_ATTEMPTS {
                let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
                warn!(attempt, ?delay, error = %last_error, "forge request failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }

        Err(last_error)
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: Response,
    ) -> Result<T, ForgeError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ForgeError::NotFound);
        }
        if !status.is_success() {
            return Err(ForgeError::Status(status.as_u16()));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ForgeError::Decode(e.to_string()))
    }

    fn extract_etag(response: &Response) -> Option<String> {
        response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }
}

// Wire shapes, kept private to this module

#[derive(Deserialize)]
struct WireUser {
    login: String,
}

#[derive(Deserialize)]
struct WireIssue {
    number: i64,
    html_url: String,
    state: String,
    title: String,
    body: Option<String>,
    updated_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct WireComment {
    id: i64,
    body: Option<String>,
    user: WireUser,
    created_at: DateTime<Utc>,
    html_url: String,
}

#[derive(Deserialize)]
struct WireReaction {
    content: String,
    user: WireUser,
}

#[derive(Deserialize)]
struct WireBranch {
    #[serde(rename = "ref")]
    branch: String,
    sha: String,
}

#[derive(Deserialize)]
struct WirePr {
    number: i64,
    state: String,
    #[serde(default)]
    merged: bool,
    title: String,
    head: WireBranch,
    base: WireBranch,
    html_url: String,
    mergeable: Option<bool>,
}

#[derive(Deserialize)]
struct WireCheckOutput {
    title: Option<String>,
    summary: Option<String>,
}

#[derive(Deserialize)]
struct WireCheckRun {
    name: String,
    status: String,
    conclusion: Option<String>,
    details_url: Option<String>,
    output: Option<WireCheckOutput>,
}

#[derive(Deserialize)]
struct WireCheckRuns {
    #[serde(default)]
    check_runs: Vec<WireCheckRun>,
}

fn artifact_state(state: &str) -> ArtifactState {
    if state == "closed" {
        ArtifactState::Closed
    } else {
        ArtifactState::Open
    }
}

fn into_comment(wire: WireComment, is_review_comment: bool) -> Comment {
    Comment {
        id: wire.id,
        body: wire.body.unwrap_or_default(),
        author: wire.user.login,
        created_at: wire.created_at,
        url: wire.html_url,
        is_review_comment,
    }
}

#[async_trait]
impl Forge for GithubForge {
    async fn create_issue(
        &self,
        repo_url: &str,
        title: &str,
        body: &str,
        labels: &[String],
    ) -> Result<IssueRef, ForgeError> {
        let (owner, repo) = parse_repo_url(repo_url)?;
        let url = format!("{}/repos/{owner}/{repo}/issues", self.api_base);
        let payload = json!({ "title": title, "body": body, "labels": labels });

        let response = self
            .request(|| {
                self.client
                    .post(&url)
                    .headers(self.headers(None))
                    .json(&payload)
            })
            .await?;

        let issue: WireIssue = Self::decode(response).await?;
        debug!(number = issue.number, "created issue");
        Ok(IssueRef {
            number: issue.number,
            url: issue.html_url,
        })
    }

    async fn update_issue(
        &self,
        repo_url: &str,
        number: i64,
        patch: IssuePatch,
    ) -> Result<(), ForgeError> {
        let (owner, repo) = parse_repo_url(repo_url)?;
        let url = format!("{}/repos/{owner}/{repo}/issues/{number}", self.api_base);

        let mut payload = serde_json::Map::new();
        if let Some(title) = patch.title {
            payload.insert("title".to_string(), json!(title));
        }
        if let Some(body) = patch.body {
            payload.insert("body".to_string(), json!(body));
        }
        if let Some(state) = patch.state {
            let state = match state {
                ArtifactState::Open => "open",
                ArtifactState::Closed => "closed",
            };
            payload.insert("state".to_string(), json!(state));
        }
        if let Some(labels) = patch.labels {
            payload.insert("labels".to_string(), json!(labels));
        }

        let response = self
            .request(|| {
                self.client
                    .patch(&url)
                    .headers(self.headers(None))
                    .json(&serde_json::Value::Object(payload.clone()))
            })
            .await?;

        let _: WireIssue = Self::decode(response).await?;
        Ok(())
    }

    async fn add_issue_comment(
        &self,
        repo_url: &str,
        number: i64,
        body: &str,
    ) -> Result<i64, ForgeError> {
        let (owner, repo) = parse_repo_url(repo_url)?;
        let url = format!(
            "{}/repos/{owner}/{repo}/issues/{number}/comments",
            self.api_base
        );
        let payload = json!({ "body": body });

        let response = self
            .request(|| {
                self.client
                    .post(&url)
                    .headers(self.headers(None))
                    .json(&payload)
            })
            .await?;

        let comment: WireComment = Self::decode(response).await?;
        Ok(comment.id)
    }

    async fn get_issue_status(
        &self,
        repo_url: &str,
        number: i64,
        etag: Option<&str>,
    ) -> Result<Conditional<IssueStatus>, ForgeError> {
        let (owner, repo) = parse_repo_url(repo_url)?;
        let url = format!("{}/repos/{owner}/{repo}/issues/{number}", self.api_base);

        let response = self
            .request(|| self.client.get(&url).headers(self.headers(etag)))
            .await?;

        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(Conditional::unchanged(etag.map(str::to_string)));
        }

        let new_etag = Self::extract_etag(&response);
        let issue: WireIssue = Self::decode(response).await?;
        Ok(Conditional::fresh(
            IssueStatus {
                number: issue.number,
                state: artifact_state(&issue.state),
                title: issue.title,
                body: issue.body,
                updated_at: issue.updated_at,
            },
            new_etag,
        ))
    }

    async fn get_issue_comments(
        &self,
        repo_url: &str,
        number: i64,
        since: Option<DateTime<Utc>>,
        etag: Option<&str>,
    ) -> Result<Conditional<Vec<Comment>>, ForgeError> {
        let (owner, repo) = parse_repo_url(repo_url)?;
        let url = format!(
            "{}/repos/{owner}/{repo}/issues/{number}/comments",
            self.api_base
        );

        let response = self
            .request(|| {
                let mut req = self.client.get(&url).headers(self.headers(etag));
                if let Some(since) = since {
                    req = req.query(&[("since", since.to_rfc3339())]);
                }
                req
            })
            .await?;

        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(Conditional::unchanged(etag.map(str::to_string)));
        }

        let new_etag = Self::extract_etag(&response);
        let wire: Vec<WireComment> = Self::decode(response).await?;
        let mut comments: Vec<Comment> =
            wire.into_iter().map(|c| into_comment(c, false)).collect();

        // The API's `since` filter is updated-at based; enforce created-at
        if let Some(since) = since {
            comments.retain(|c| c.created_at > since);
        }

        Ok(Conditional::fresh(comments, new_etag))
    }

    async fn get_comment_reactions(
        &self,
        repo_url: &str,
        comment_id: i64,
        is_review_comment: bool,
    ) -> Result<Vec<Reaction>, ForgeError> {
        let (owner, repo) = parse_repo_url(repo_url)?;
        let url = if is_review_comment {
            format!(
                "{}/repos/{owner}/{repo}/pulls/comments/{comment_id}/reactions",
                self.api_base
            )
        } else {
            format!(
                "{}/repos/{owner}/{repo}/issues/comments/{comment_id}/reactions",
                self.api_base
            )
        };

        let response = self
            .request(|| self.client.get(&url).headers(self.headers(None)))
            .await?;

        let wire: Vec<WireReaction> = Self::decode(response).await?;
        Ok(wire
            .into_iter()
            .map(|r| Reaction {
                kind: r.content,
                user: r.user.login,
            })
            .collect())
    }

    async fn get_pr_status(
        &self,
        repo_url: &str,
        number: i64,
    ) -> Result<Option<PrStatus>, ForgeError> {
        let (owner, repo) = parse_repo_url(repo_url)?;
        let url = format!("{}/repos/{owner}/{repo}/pulls/{number}", self.api_base);

        let response = self
            .request(|| self.client.get(&url).headers(self.headers(None)))
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let pr: WirePr = Self::decode(response).await?;
        Ok(Some(PrStatus {
            number: pr.number,
            state: artifact_state(&pr.state),
            merged: pr.merged,
            title: pr.title,
            head_branch: pr.head.branch,
            head_sha: pr.head.sha,
            base_branch: pr.base.branch,
            url: pr.html_url,
            mergeable: pr.mergeable,
        }))
    }

    async fn close_pr(&self, repo_url: &str, number: i64) -> Result<(), ForgeError> {
        let (owner, repo) = parse_repo_url(repo_url)?;
        let url = format!("{}/repos/{owner}/{repo}/pulls/{number}", self.api_base);
        let payload = json!({ "state": "closed" });

        let response = self
            .request(|| {
                self.client
                    .patch(&url)
                    .headers(self.headers(None))
                    .json(&payload)
            })
            .await?;

        let _: WirePr = Self::decode(response).await?;
        Ok(())
    }

    async fn get_pr_comments(
        &self,
        repo_url: &str,
        number: i64,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Comment>, ForgeError> {
        let (owner, repo) = parse_repo_url(repo_url)?;

        // General PR comments live on the issues endpoint; inline review
        // comments on the pulls endpoint
        let issue_url = format!(
            "{}/repos/{owner}/{repo}/issues/{number}/comments",
            self.api_base
        );
        let review_url = format!(
            "{}/repos/{owner}/{repo}/pulls/{number}/comments",
            self.api_base
        );

        let mut comments = Vec::new();

        for (url, is_review) in [(issue_url, false), (review_url, true)] {
            let response = self
                .request(|| {
                    let mut req = self.client.get(&url).headers(self.headers(None));
                    if let Some(since) = since {
                        req = req.query(&[("since", since.to_rfc3339())]);
                    }
                    req
                })
                .await?;

            let wire: Vec<WireComment> = Self::decode(response).await?;
            comments.extend(wire.into_iter().map(|c| into_comment(c, is_review)));
        }

        comments.sort_by_key(|c| c.created_at);
        if let Some(since) = since {
            comments.retain(|c| c.created_at > since);
        }

        Ok(comments)
    }

    async fn get_check_status(
        &self,
        repo_url: &str,
        number: i64,
    ) -> Result<CheckStatus, ForgeError> {
        let (owner, repo) = parse_repo_url(repo_url)?;

        let Some(pr) = self.get_pr_status(repo_url, number).await? else {
            return Ok(CheckStatus {
                overall: CheckOutcome::Pending,
                runs: vec![],
                failed: vec![],
            });
        };

        let url = format!(
            "{}/repos/{owner}/{repo}/commits/{}/check-runs",
            self.api_base, pr.head_sha
        );
        let response = self
            .request(|| self.client.get(&url).headers(self.headers(None)))
            .await?;
        let wire: WireCheckRuns = Self::decode(response).await?;

        let runs: Vec<CheckRun> = wire
            .check_runs
            .into_iter()
            .map(|r| CheckRun {
                name: r.name,
                completed: r.status == "completed",
                conclusion: r.conclusion,
                details_url: r.details_url,
                output_title: r.output.as_ref().and_then(|o| o.title.clone()),
                output_summary: r.output.as_ref().and_then(|o| o.summary.clone()),
            })
            .collect();

        let failed: Vec<CheckRun> = runs
            .iter()
            .filter(|r| r.conclusion.as_deref() == Some("failure"))
            .cloned()
            .collect();
        let pending = runs.iter().any(|r| !r.completed);

        let overall = if pending {
            CheckOutcome::Pending
        } else if !failed.is_empty() {
            CheckOutcome::Failure
        } else {
            CheckOutcome::Success
        };

        Ok(CheckStatus {
            overall,
            runs,
            failed,
        })
    }

    async fn get_check_failure_logs(
        &self,
        repo_url: &str,
        number: i64,
    ) -> Result<String, ForgeError> {
        let status = self.get_check_status(repo_url, number).await?;
        Ok(format_check_failures(&status.failed))
    }

    async fn add_reaction(
        &self,
        repo_url: &str,
        comment_id: i64,
        kind: &str,
        is_review_comment: bool,
    ) -> Result<(), ForgeError> {
        let (owner, repo) = parse_repo_url(repo_url)?;
        let url = if is_review_comment {
            format!(
                "{}/repos/{owner}/{repo}/pulls/comments/{comment_id}/reactions",
                self.api_base
            )
        } else {
            format!(
                "{}/repos/{owner}/{repo}/issues/comments/{comment_id}/reactions",
                self.api_base
            )
        };
        let payload = json!({ "content": kind });

        let response = self
            .request(|| {
                self.client
                    .post(&url)
                    .headers(self.headers(None))
                    .json(&payload)
            })
            .await?;

        // 200 = already exists, 201 = created
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status == StatusCode::NOT_FOUND {
            Err(ForgeError::NotFound)
        } else {
            Err(ForgeError::Status(status.as_u16()))
        }
    }
}
