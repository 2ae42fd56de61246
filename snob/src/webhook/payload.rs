//! Gitea pull-request webhook payload.
//!
//! Only the fields the review processor needs are decoded; everything else
//! Gitea sends is ignored.

use serde::{Deserialize, Serialize};

/// Pull-request events this service accepts. Any other action fails to
/// decode, which rejects the request with `400`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    ReviewRequested,
    ReviewRequestRemoved,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::ReviewRequested => "review_requested",
            Action::ReviewRequestRemoved => "review_request_removed",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Head {
    pub sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub id: i64,
    /// Repository-local index. Gitea sends it alongside the global `id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<i64>,
    #[serde(default)]
    pub diff_url: String,
    pub head: Head,
}

impl PullRequest {
    /// Index used in repository API paths: `number` when present, else `id`.
    pub fn index(&self) -> i64 {
        self.number.unwrap_or(self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    pub owner: Owner,
}

/// Decoded review event. Never mutated after decoding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub action: Action,
    pub pull_request: PullRequest,
    pub repository: Repository,
}

impl Payload {
    /// `owner/name` of the repository, for logging.
    pub fn repo_slug(&self) -> String {
        format!("{}/{}", self.repository.owner.login, self.repository.name)
    }
}
