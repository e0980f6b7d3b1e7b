//! Source-hosting collaborator boundary.
//!
//! The orchestrator opens, merges and lists change requests through a
//! [`SourceHost`]. Every failure here is non-fatal to a run: the result simply
//! carries no PR artifacts.

mod github;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::HostingError;

pub use github::{GitHubHost, is_valid_github_token, parse_repo_slug};

/// How a change request is merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    #[default]
    Merge,
    Squash,
    Rebase,
}

impl MergeMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Squash => "squash",
            Self::Rebase => "rebase",
        }
    }
}

impl std::fmt::Display for MergeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MergeMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "merge" => Ok(Self::Merge),
            "squash" => Ok(Self::Squash),
            "rebase" => Ok(Self::Rebase),
            other => Err(format!(
                "unknown merge method '{}' (expected merge, squash or rebase)",
                other
            )),
        }
    }
}

/// Change-request state filter for [`SourceHost::list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrState {
    #[default]
    Open,
    Closed,
    All,
}

impl PrState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::All => "all",
        }
    }
}

impl std::fmt::Display for PrState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to a change request on the hosting service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrHandle {
    pub number: u64,
    pub url: String,
    pub title: String,
    pub state: String,
    pub head: String,
    pub base: String,
}

/// The source-hosting collaborator.
#[async_trait]
pub trait SourceHost: Send + Sync {
    /// Open a change request from `head` into `base`.
    async fn create_request(
        &self,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
    ) -> Result<PrHandle, HostingError>;

    /// Merge a change request. Returns whether the service reports it merged.
    async fn merge(&self, number: u64, method: MergeMethod) -> Result<bool, HostingError>;

    /// List change requests in `state`.
    async fn list(&self, state: PrState) -> Result<Vec<PrHandle>, HostingError>;
}
