//! GitHub Issues backlog over the REST API.
//!
//! Item ids are `issue-<number>`. Parsing also accepts `#42` and bare `42`
//! so operators can type what GitHub shows them.

use std::fmt::Write as _;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span, Instrument};

use super::{Backlog, BacklogFuture};
use crate::config::BacklogConfig;
use crate::{AppError, Result};

const USER_AGENT: &str = concat!("agent-pool/", env!("CARGO_PKG_VERSION"));
const PAGE_SIZE: usize = 100;

#[derive(Debug, Deserialize)]
struct IssueSummary {
    number: u64,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct LabelsPayload<'a> {
    labels: [&'a str; 1],
}

#[derive(Debug, Serialize)]
struct CommentPayload<'a> {
    body: &'a str,
}

/// [`Backlog`] backed by labels and comments on GitHub issues.
#[derive(Debug, Clone)]
pub struct GithubBacklog {
    client: Client,
    api_url: String,
    repo: String,
    token: String,
    in_progress_label: String,
}

impl GithubBacklog {
    /// Build a client from the `[backlog]` section.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] if `repo` or the token is missing, or the
    /// HTTP client cannot be constructed.
    pub fn new(config: &BacklogConfig) -> Result<Self> {
        let repo = config
            .repo
            .clone()
            .ok_or_else(|| AppError::Config("backlog.repo is required for github".into()))?;
        if config.token.is_empty() {
            return Err(AppError::Config(
                "github token not found in keychain or AGENT_POOL_GITHUB_TOKEN".into(),
            ));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .user_agent(USER_AGENT)
            .build()
            .map_err(|err| AppError::Config(format!("failed to build http client: {err}")))?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_owned(),
            repo,
            token: config.token.clone(),
            in_progress_label: config.labels.in_progress.clone(),
        })
    }

    fn issues_url(&self) -> String {
        format!("{}/repos/{}/issues", self.api_url, self.repo)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
    }

    async fn list_in_progress(&self) -> Result<Vec<String>> {
        let mut items = Vec::new();
        let mut page = 1_u32;
        let per_page = PAGE_SIZE.to_string();
        loop {
            let page_no = page.to_string();
            let response = self
                .request(self.client.get(self.issues_url()))
                .query(&[
                    ("state", "open"),
                    ("labels", self.in_progress_label.as_str()),
                    ("per_page", per_page.as_str()),
                    ("page", page_no.as_str()),
                ])
                .send()
                .await
                .map_err(request_error)?;
            let response = ensure_success(response, "list issues").await?;
            let batch: Vec<IssueSummary> = response.json().await.map_err(request_error)?;
            let len = batch.len();
            items.extend(
                batch
                    .into_iter()
                    .filter(|issue| issue.pull_request.is_none())
                    .map(|issue| item_id(issue.number)),
            );
            if len < PAGE_SIZE {
                break;
            }
            page += 1;
        }
        debug!(count = items.len(), "in-progress items listed");
        Ok(items)
    }

    async fn relabel(&self, item: &str, from: &str, to: &str) -> Result<()> {
        let number = parse_item_id(item)?;
        let url = format!("{}/{number}/labels", self.issues_url());

        let removed = self
            .request(self.client.delete(format!("{url}/{}", encode_label(from))))
            .send()
            .await
            .map_err(request_error)?;
        // 404 means the label was already gone.
        if removed.status() != StatusCode::NOT_FOUND {
            ensure_success(removed, "remove label").await?;
        }

        let added = self
            .request(self.client.post(&url))
            .json(&LabelsPayload { labels: [to] })
            .send()
            .await
            .map_err(request_error)?;
        ensure_success(added, "add label").await?;
        Ok(())
    }

    async fn post_comment(&self, item: &str, body: &str) -> Result<()> {
        let number = parse_item_id(item)?;
        let response = self
            .request(
                self.client
                    .post(format!("{}/{number}/comments", self.issues_url())),
            )
            .json(&CommentPayload { body })
            .send()
            .await
            .map_err(request_error)?;
        ensure_success(response, "post comment").await?;
        Ok(())
    }
}

impl Backlog for GithubBacklog {
    fn in_progress(&self) -> BacklogFuture<'_, Vec<String>> {
        let span = info_span!("backlog_in_progress", repo = %self.repo);
        Box::pin(self.list_in_progress().instrument(span))
    }

    fn transition<'a>(
        &'a self,
        item_id: &'a str,
        from: &'a str,
        to: &'a str,
    ) -> BacklogFuture<'a, ()> {
        let span = info_span!("backlog_transition", item_id, from, to);
        Box::pin(self.relabel(item_id, from, to).instrument(span))
    }

    fn comment<'a>(&'a self, item_id: &'a str, body: &'a str) -> BacklogFuture<'a, ()> {
        let span = info_span!("backlog_comment", item_id);
        Box::pin(self.post_comment(item_id, body).instrument(span))
    }
}

fn request_error(err: reqwest::Error) -> AppError {
    AppError::Backlog(format!("github request failed: {err}"))
}

async fn ensure_success(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AppError::Backlog(format!("{what}: {status}: {body}")))
}

/// Canonical item id for an issue number.
#[must_use]
pub fn item_id(number: u64) -> String {
    format!("issue-{number}")
}

/// Issue number of an item id in `issue-42`, `#42`, or `42` form.
///
/// # Errors
///
/// Returns [`AppError::Backlog`] when the id does not name an issue.
pub fn parse_item_id(item: &str) -> Result<u64> {
    let digits = item
        .strip_prefix("issue-")
        .or_else(|| item.strip_prefix('#'))
        .unwrap_or(item);
    digits
        .parse()
        .map_err(|_| AppError::Backlog(format!("{item} is not a github issue id")))
}

/// Percent-encode a label for use as a path segment.
fn encode_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    for byte in label.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~') {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}
