//! Minimal Gitea API client: fetch a pull-request diff, post a review.

use std::time::Duration;

use reqwest::header::ACCEPT;
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use super::ai::AiReview;
use super::{expect_success, ReviewError};

const GITEA_TIMEOUT: Duration = Duration::from_secs(10);

pub struct GiteaClient {
    http: Client,
    base: Url,
    token: String,
}

impl GiteaClient {
    /// `base` is the API root, e.g. `http://localhost:3000/api/v1`.
    pub fn new(http: Client, base: Url, token: impl Into<String>) -> Self {
        Self {
            http,
            base,
            token: token.into(),
        }
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ReviewError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ReviewError::InvalidUrl(self.base.to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub fn diff_url(&self, owner: &str, repo: &str, index: i64) -> Result<Url, ReviewError> {
        let file = format!("{index}.diff");
        self.endpoint(&["repos", owner, repo, "pulls", file.as_str()])
    }

    pub fn reviews_url(&self, owner: &str, repo: &str, index: i64) -> Result<Url, ReviewError> {
        let index = index.to_string();
        self.endpoint(&["repos", owner, repo, "pulls", index.as_str(), "reviews"])
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .timeout(GITEA_TIMEOUT)
            .header(reqwest::header::AUTHORIZATION, format!("token {}", self.token))
    }

    pub async fn get_diff(&self, owner: &str, repo: &str, index: i64) -> Result<String, ReviewError> {
        let url = self.diff_url(owner, repo, index)?;
        debug!(url = %url, "gitea_diff_fetching");

        let response = self.authorized(self.http.get(url)).send().await?;
        let diff = expect_success(response).await?.text().await?;

        debug!(diff_length = diff.len(), "gitea_diff_fetched");
        Ok(diff)
    }

    pub async fn create_review(
        &self,
        owner: &str,
        repo: &str,
        index: i64,
        commit_id: &str,
        review: &AiReview,
    ) -> Result<(), ReviewError> {
        let url = self.reviews_url(owner, repo, index)?;
        debug!(url = %url, comments = review.comments.len(), "gitea_review_posting");

        let response = self
            .authorized(self.http.post(url))
            .header(ACCEPT, "application/json")
            .json(&review_request_body(commit_id, review))
            .send()
            .await?;
        expect_success(response).await?;
        Ok(())
    }
}

/// Body of `POST /repos/{owner}/{repo}/pulls/{index}/reviews`.
pub fn review_request_body(commit_id: &str, review: &AiReview) -> Value {
    let comments: Vec<Value> = review
        .comments
        .iter()
        .map(|c| {
            json!({
                "body": c.message,
                "path": c.file,
                "new_position": c.new_position,
                "old_position": c.old_position,
            })
        })
        .collect();

    json!({
        "body": review.summary,
        "event": review.verdict.as_str(),
        "commit_id": commit_id,
        "comments": comments,
    })
}
