//! GitHub REST client for change requests.

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{MergeMethod, PrHandle, PrState, SourceHost};
use crate::errors::HostingError;

const GITHUB_API_URL: &str = "https://api.github.com";
const USER_AGENT: &str = "crewforge";

/// Known GitHub token prefixes.
/// See: https://github.blog/2021-04-05-behind-githubs-new-authentication-token-formats/
const GITHUB_TOKEN_PREFIXES: &[&str] = &[
    "ghp_",        // Personal access tokens (classic)
    "github_pat_", // Fine-grained personal access tokens
    "gho_",        // OAuth access tokens
    "ghu_",        // GitHub App user-to-server tokens
    "ghs_",        // GitHub App server-to-server tokens
    "ghr_",        // GitHub App refresh tokens
];

/// Format check only; does not verify the token is active.
pub fn is_valid_github_token(token: &str) -> bool {
    !token.is_empty() && GITHUB_TOKEN_PREFIXES.iter().any(|p| token.starts_with(p))
}

/// Normalize a repository reference to an `owner/repo` slug.
///
/// Accepts a bare slug, `https://github.com/owner/repo[.git]`,
/// token-embedded HTTPS URLs and `git@github.com:owner/repo.git`.
pub fn parse_repo_slug(repo: &str) -> Option<String> {
    let repo = repo.trim();
    let path = if let Some(rest) = repo.strip_prefix("https://") {
        let rest = match rest.find('@') {
            Some(idx) => &rest[idx + 1..],
            None => rest,
        };
        rest.strip_prefix("github.com/")?
    } else if let Some(rest) = repo.strip_prefix("git@github.com:") {
        rest
    } else {
        repo
    };
    let path = path.trim_end_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);

    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() == 2 && parts.iter().all(|p| !p.is_empty() && !p.contains(':')) {
        Some(format!("{}/{}", parts[0], parts[1]))
    } else {
        None
    }
}

#[derive(Debug, Serialize)]
struct CreatePullRequest<'a> {
    title: &'a str,
    body: &'a str,
    head: &'a str,
    base: &'a str,
}

#[derive(Debug, Serialize)]
struct MergePullRequest<'a> {
    merge_method: &'a str,
}

#[derive(Debug, Deserialize)]
struct GitHubRef {
    #[serde(rename = "ref")]
    name: String,
}

/// A GitHub pull request (subset of fields).
#[derive(Debug, Deserialize)]
struct GitHubPullRequest {
    number: u64,
    html_url: String,
    title: String,
    state: String,
    head: GitHubRef,
    base: GitHubRef,
}

impl From<GitHubPullRequest> for PrHandle {
    fn from(pr: GitHubPullRequest) -> Self {
        Self {
            number: pr.number,
            url: pr.html_url,
            title: pr.title,
            state: pr.state,
            head: pr.head.name,
            base: pr.base.name,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MergeResponse {
    merged: bool,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

/// [`SourceHost`] backed by the GitHub REST API.
#[derive(Debug, Clone)]
pub struct GitHubHost {
    client: reqwest::Client,
    api_url: String,
    slug: String,
    token: String,
}

impl GitHubHost {
    /// Create a client for `repo`. A missing token is a credential error.
    pub fn new(repo: &str, token: Option<String>) -> Result<Self, HostingError> {
        let slug =
            parse_repo_slug(repo).ok_or_else(|| HostingError::InvalidRepository(repo.to_string()))?;
        let token = token
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| HostingError::MissingCredential("GITHUB_TOKEN".into()))?;
        if !is_valid_github_token(&token) {
            tracing::warn!("GITHUB_TOKEN does not look like a GitHub token");
        }
        Ok(Self {
            client: reqwest::Client::new(),
            api_url: GITHUB_API_URL.to_string(),
            slug,
            token,
        })
    }

    /// Create a client reading the token from `GITHUB_TOKEN`.
    pub fn from_env(repo: &str) -> Result<Self, HostingError> {
        Self::new(repo, std::env::var("GITHUB_TOKEN").ok())
    }

    /// Use a different API base (GitHub Enterprise).
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    fn pulls_url(&self) -> String {
        format!("{}/repos/{}/pulls", self.api_url, self.slug)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("Authorization", format!("Bearer {}", self.token))
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json")
    }

    /// Send a request and decode the JSON body, mapping failures to [`HostingError`].
    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, HostingError> {
        let resp = self
            .authorized(builder)
            .send()
            .await
            .with_context(|| format!("Failed to send {} request to GitHub", what))
            .map_err(HostingError::Transport)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(api_error(status.as_u16(), &text));
        }

        resp.json::<T>()
            .await
            .with_context(|| format!("Failed to parse {} response from GitHub", what))
            .map_err(HostingError::Transport)
    }
}

/// Build an API error from a status and the raw response body.
fn api_error(status: u16, body: &str) -> HostingError {
    let message = serde_json::from_str::<ApiErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| body.trim().to_string());
    HostingError::Api { status, message }
}

#[async_trait]
impl SourceHost for GitHubHost {
    async fn create_request(
        &self,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> Result<PrHandle, HostingError> {
        let payload = CreatePullRequest {
            title,
            body,
            head,
            base,
        };
        let pr: GitHubPullRequest = self
            .send(self.client.post(self.pulls_url()).json(&payload), "create pull request")
            .await?;
        debug!(number = pr.number, repo = %self.slug, "created pull request");
        Ok(pr.into())
    }

    async fn merge(&self, number: u64, method: MergeMethod) -> Result<bool, HostingError> {
        let url = format!("{}/{}/merge", self.pulls_url(), number);
        let payload = MergePullRequest {
            merge_method: method.as_str(),
        };
        let resp: MergeResponse = self
            .send(self.client.put(url).json(&payload), "merge pull request")
            .await?;
        Ok(resp.merged)
    }

    async fn list(&self, state: PrState) -> Result<Vec<PrHandle>, HostingError> {
        let mut all = Vec::new();
        let mut page = 1u32;

        loop {
            let batch: Vec<GitHubPullRequest> = self
                .send(
                    self.client.get(self.pulls_url()).query(&[
                        ("state", state.as_str()),
                        ("per_page", "100"),
                        ("page", &page.to_string()),
                    ]),
                    "list pull requests",
                )
                .await?;

            let count = batch.len();
            all.extend(batch.into_iter().map(PrHandle::from));
            if count < 100 {
                break;
            }
            page += 1;
        }

        Ok(all)
    }
}
