//! Chat-completions client that turns a diff into a structured review.
//!
//! The request asks for a JSON-schema response, so the first choice's
//! message content is itself a JSON document describing the review.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;

use super::{expect_success, ReviewError};

pub const DEFAULT_MODEL: &str = "Qwen/Qwen3-Coder-480B-A35B-Instruct";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a meticulous senior engineer reviewing a pull request. \
You receive a unified diff. Point out bugs, unsafe code, missing error handling and unclear naming. \
Comment only on lines present in the diff and reference them by their position in the diff. \
Answer with the requested JSON document and nothing else.";

const AI_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_TOKENS: u32 = 2000;

/// Overall outcome of a review, using Gitea's review event names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Approved,
    RequestChanges,
    #[default]
    Comment,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Approved => "APPROVED",
            Verdict::RequestChanges => "REQUEST_CHANGES",
            Verdict::Comment => "COMMENT",
        }
    }
}

/// A remark on one line of the diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewComment {
    pub file: String,
    #[serde(default)]
    pub new_position: i64,
    #[serde(default)]
    pub old_position: i64,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AiReview {
    #[serde(default)]
    pub verdict: Verdict,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub comments: Vec<ReviewComment>,
}

#[derive(Deserialize)]
struct Completion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    #[serde(default)]
    content: String,
}

/// Extract the review from a chat-completions response body.
pub fn parse_completion(body: &[u8]) -> Result<AiReview, ReviewError> {
    let completion: Completion = serde_json::from_slice(body)?;
    let choice = completion
        .choices
        .into_iter()
        .next()
        .ok_or(ReviewError::EmptyResponse)?;
    Ok(serde_json::from_str(&choice.message.content)?)
}

fn response_format() -> Value {
    json!({
        "type": "json_schema",
        "json_schema": {
            "name": "ai_review_result",
            "strict": true,
            "schema": {
                "type": "object",
                "properties": {
                    "verdict": {
                        "type": "string",
                        "enum": ["APPROVED", "REQUEST_CHANGES", "COMMENT"],
                        "description": "APPROVED when there are no critical problems, REQUEST_CHANGES when there are, COMMENT when undecided"
                    },
                    "summary": { "type": "string" },
                    "comments": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "file": { "type": "string" },
                                "new_position": {
                                    "type": "integer",
                                    "description": "line position in the diff after the change, when commenting on an added line"
                                },
                                "old_position": {
                                    "type": "integer",
                                    "description": "line position in the diff before the change, when commenting on a removed line"
                                },
                                "message": { "type": "string" }
                            },
                            "required": ["file", "new_position", "old_position", "message"]
                        }
                    }
                },
                "required": ["summary", "comments", "verdict"]
            }
        }
    })
}

pub struct AiClient {
    http: Client,
    endpoint: Url,
    token: String,
    model: String,
    system_prompt: String,
}

impl AiClient {
    pub fn new(http: Client, endpoint: Url, token: impl Into<String>) -> Self {
        Self {
            http,
            endpoint,
            token: token.into(),
            model: DEFAULT_MODEL.to_string(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    /// Request body asking the model to review `diff`.
    pub fn completion_request(&self, diff: &str) -> Value {
        json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "temperature": 0.1,
            "top_p": 0.8,
            "frequency_penalty": 0.5,
            "presence_penalty": 0,
            "messages": [
                { "role": "system", "content": self.system_prompt },
                { "role": "user", "content": diff },
            ],
            "response_format": response_format(),
        })
    }

    pub async fn review(&self, diff: &str) -> Result<AiReview, ReviewError> {
        debug!(diff_length = diff.len(), model = %self.model, "ai_review_requesting");

        let response = self
            .http
            .post(self.endpoint.clone())
            .timeout(AI_TIMEOUT)
            .bearer_auth(&self.token)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&self.completion_request(diff))
            .send()
            .await?;
        let body = expect_success(response).await?.bytes().await?;
        let review = parse_completion(&body)?;

        info!(
            verdict = review.verdict.as_str(),
            comments = review.comments.len(),
            "ai_review_received"
        );
        Ok(review)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> AiClient {
        AiClient::new(
            Client::new(),
            Url::parse("http://localhost/v1/chat/completions").unwrap(),
            "t",
        )
    }

    #[test]
    fn test_completion_request_shape() {
        let body = client().with_model("m").with_system_prompt("be strict").completion_request("diff --git");

        assert_eq!(body["model"], "m");
        assert_eq!(body["max_tokens"], 2000);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], "be strict");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["messages"][1]["content"], "diff --git");
        assert_eq!(body["response_format"]["json_schema"]["name"], "ai_review_result");
        assert_eq!(
            body["response_format"]["json_schema"]["schema"]["properties"]["verdict"]["enum"],
            json!(["APPROVED", "REQUEST_CHANGES", "COMMENT"])
        );
    }

    #[test]
    fn test_parse_completion() {
        let content = r#"{"verdict":"REQUEST_CHANGES","summary":"needs work","comments":[{"file":"src/lib.rs","new_position":3,"old_position":0,"message":"unwrap on user input"}]}"#;
        let body = json!({
            "id": "cmpl-1",
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": content } }]
        });

        let review = parse_completion(body.to_string().as_bytes()).unwrap();

        assert_eq!(review.verdict, Verdict::RequestChanges);
        assert_eq!(review.summary, "needs work");
        assert_eq!(review.comments.len(), 1);
        assert_eq!(review.comments[0].file, "src/lib.rs");
        assert_eq!(review.comments[0].new_position, 3);
    }

    #[test]
    fn test_parse_completion_defaults_verdict() {
        let body = json!({ "choices": [{ "message": { "content": r#"{"summary":"ok","comments":[]}"# } }] });

        let review = parse_completion(body.to_string().as_bytes()).unwrap();
        assert_eq!(review.verdict, Verdict::Comment);
    }

    #[test]
    fn test_parse_completion_errors() {
        let empty = parse_completion(br#"{"choices":[]}"#).unwrap_err();
        assert!(matches!(empty, ReviewError::EmptyResponse));

        let not_json = parse_completion(b"<html>").unwrap_err();
        assert!(matches!(not_json, ReviewError::Decode(_)));

        let bad_content = json!({ "choices": [{ "message": { "content": "I think it is fine" } }] });
        let err = parse_completion(bad_content.to_string().as_bytes()).unwrap_err();
        assert!(matches!(err, ReviewError::Decode(_)));
    }
}
