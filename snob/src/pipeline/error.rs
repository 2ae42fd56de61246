//! Failures a pipeline stage can halt the chain with.
//!
//! Every variant maps onto the HTTP status the caller sees. Stages never
//! panic on bad input; they halt with one of these instead.

use axum::http::{Method, StatusCode};
use thiserror::Error;

/// Reasons a stage refuses to continue the chain.
#[derive(Debug, Error)]
pub enum StageError {
    /// The request's cancellation signal fired before the stage ran.
    #[error("request no longer servable")]
    Cancelled,

    /// A typed stage expected a value that no upstream stage produced.
    #[error("missing upstream value of type {0}")]
    MissingValue(&'static str),

    /// Request method is not in the allowed set.
    #[error("method {0} not allowed")]
    MethodNotAllowed(Method),

    /// Content-Type header missing or not the expected media type.
    #[error("unsupported content type: {}", .0.as_deref().unwrap_or("<none>"))]
    UnsupportedMediaType(Option<String>),

    /// The body could not be read (transport error or over the size limit).
    #[error("failed to read request body: {0}")]
    Body(String),

    /// The body was empty where content is required.
    #[error("empty payload")]
    EmptyBody,

    /// The body is not valid JSON for the expected type.
    #[error("malformed JSON body: {0}")]
    Decode(#[from] serde_json::Error),

    /// A value could not be serialized into the response.
    #[error("failed to encode response: {0}")]
    Encode(String),

    /// Signature header absent.
    #[error("signature header missing")]
    MissingSignature,

    /// Signature header does not match the body.
    #[error("invalid hmac signature")]
    InvalidSignature,

    /// The caller gave up while the payload was waiting for a queue slot.
    #[error("request cancelled")]
    PushCancelled,

    /// The queue no longer accepts payloads.
    #[error("webhook queue is closed")]
    QueueClosed,
}

impl StageError {
    /// HTTP status reported for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            StageError::Cancelled => StatusCode::GATEWAY_TIMEOUT,
            StageError::MissingValue(_) => StatusCode::BAD_REQUEST,
            StageError::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            StageError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            StageError::Body(_) => StatusCode::BAD_REQUEST,
            StageError::EmptyBody => StatusCode::BAD_REQUEST,
            StageError::Decode(_) => StatusCode::BAD_REQUEST,
            StageError::Encode(_) => StatusCode::INTERNAL_SERVER_ERROR,
            StageError::MissingSignature => StatusCode::BAD_REQUEST,
            StageError::InvalidSignature => StatusCode::UNAUTHORIZED,
            StageError::PushCancelled => StatusCode::REQUEST_TIMEOUT,
            StageError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}
