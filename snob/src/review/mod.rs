//! Pull-request review processor.
//!
//! Plugged into the webhook pool as its processing function. For every
//! `review_requested` payload it:
//! 1. Fetches the pull-request diff from Gitea
//! 2. Asks the AI endpoint for a structured review of it
//! 3. Posts that review back to Gitea
//!
//! Failures are logged and dropped; nothing is retried.

pub mod ai;
pub mod gitea;

use std::sync::Arc;

use reqwest::StatusCode;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::Config;
use crate::pool::Process;
use crate::webhook::{Action, Payload};

pub use ai::{AiClient, AiReview, ReviewComment, Verdict};
pub use gitea::GiteaClient;

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} from {url}")]
    Status { status: StatusCode, url: String },

    #[error("invalid JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("model returned no choices")]
    EmptyResponse,

    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

/// Pass successful responses through, turn anything else into an error.
pub(crate) async fn expect_success(
    response: reqwest::Response,
) -> Result<reqwest::Response, ReviewError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    warn!(
        status_code = status.as_u16(),
        url = %url,
        body_preview = %body.chars().take(200).collect::<String>(),
        "review_http_unexpected_status"
    );
    Err(ReviewError::Status { status, url })
}

/// Parse the URL held in env var `name`, which must be set.
fn parse_url(name: &str, raw: &str) -> Result<Url, ReviewError> {
    if raw.trim().is_empty() {
        return Err(ReviewError::InvalidUrl(format!("{name} is required")));
    }
    Url::parse(raw).map_err(|e| ReviewError::InvalidUrl(format!("{name}={raw:?}: {e}")))
}

/// Reviews pull requests using a Gitea client and an AI client.
#[derive(Clone)]
pub struct Reviewer {
    gitea: Arc<GiteaClient>,
    ai: Arc<AiClient>,
}

impl Reviewer {
    pub fn new(gitea: GiteaClient, ai: AiClient) -> Self {
        Self {
            gitea: Arc::new(gitea),
            ai: Arc::new(ai),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, ReviewError> {
        let http = reqwest::Client::builder().build()?;

        let gitea = GiteaClient::new(
            http.clone(),
            parse_url("GITEA_BASE_URL", &config.gitea_base_url)?,
            config.gitea_token.clone(),
        );
        let ai = AiClient::new(http, parse_url("AI_BASE_URL", &config.ai_base_url)?, config.ai_token.clone())
            .with_model(config.ai_model.clone())
            .with_system_prompt(config.ai_system_prompt.clone());

        Ok(Self::new(gitea, ai))
    }

    /// Only freshly requested reviews are acted on.
    pub fn should_review(payload: &Payload) -> bool {
        payload.action == Action::ReviewRequested
    }

    /// Review one pull request. Gives up as soon as `cancel` fires.
    pub async fn review(&self, cancel: CancellationToken, payload: Payload) {
        if !Self::should_review(&payload) {
            debug!(
                action = %payload.action,
                repo = %payload.repo_slug(),
                "review_skipped"
            );
            return;
        }

        let repo = payload.repo_slug();
        let index = payload.pull_request.index();
        info!(repo = %repo, pull_request = index, "review_starting");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(repo = %repo, pull_request = index, "review_cancelled");
            }
            result = self.run(&payload) => match result {
                Ok(verdict) => info!(
                    repo = %repo,
                    pull_request = index,
                    verdict = verdict.as_str(),
                    "review_posted"
                ),
                Err(e) => error!(
                    repo = %repo,
                    pull_request = index,
                    error = %e,
                    "review_failed"
                ),
            },
        }
    }

    async fn run(&self, payload: &Payload) -> Result<Verdict, ReviewError> {
        let owner = &payload.repository.owner.login;
        let repo = &payload.repository.name;
        let index = payload.pull_request.index();

        let diff = self.gitea.get_diff(owner, repo, index).await?;
        let review = self.ai.review(&diff).await?;
        self.gitea
            .create_review(owner, repo, index, &payload.pull_request.head.sha, &review)
            .await?;

        Ok(review.verdict)
    }

    /// Processing function for the webhook pool.
    pub fn into_processor(self) -> Arc<dyn Process<Payload>> {
        Arc::new(move |cancel: CancellationToken, payload: Payload| {
            let reviewer = self.clone();
            async move { reviewer.review(cancel, payload).await }
        })
    }
}
