//! Per-request state handed from stage to stage.
//!
//! A [`Ctx`] owns the request head, the (lazily buffered) body, the
//! request-scoped value store, the cancellation signal and the response sink.
//! Nothing in it is shared between requests.

use std::future::Future;

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::{request::Parts, Extensions, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::Response;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::error::StageError;

/// Default cap on how many body bytes a stage may buffer.
pub const DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;

enum RequestBody {
    Pending(Body),
    Buffered(Bytes),
}

/// Typed values produced by stages for later stages of the same request.
///
/// Holds at most one value per type; inserting again replaces the earlier one.
#[derive(Default)]
pub struct Values(Extensions);

impl Values {
    /// Store `value`, returning the one it replaced.
    pub fn insert<T: Clone + Send + Sync + 'static>(&mut self, value: T) -> Option<T> {
        self.0.insert(value)
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.0.get::<T>()
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.0.get::<T>().is_some()
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.0.remove::<T>()
    }
}

/// Response under construction.
///
/// The first status written wins, like an HTTP response writer: once a stage
/// has committed a status, later attempts are ignored. Writing body bytes
/// commits `200 OK` if nothing was committed yet.
#[derive(Debug, Default)]
pub struct Reply {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl Reply {
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Commit `status`. Returns false if a status was already committed.
    pub fn set_status(&mut self, status: StatusCode) -> bool {
        if self.status.is_some() {
            return false;
        }
        self.status = Some(status);
        true
    }

    pub fn insert_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.status.get_or_insert(StatusCode::OK);
        self.body.extend_from_slice(bytes);
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status.unwrap_or(StatusCode::OK);
        *response.headers_mut() = self.headers;
        response
    }
}

/// Request context passed to every stage.
pub struct Ctx {
    parts: Parts,
    body: RequestBody,
    body_limit: usize,
    values: Values,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    reply: Reply,
}

impl Ctx {
    pub fn new(request: Request, cancel: CancellationToken) -> Self {
        let (parts, body) = request.into_parts();
        Self {
            parts,
            body: RequestBody::Pending(body),
            body_limit: DEFAULT_BODY_LIMIT,
            values: Values::default(),
            cancel,
            deadline: None,
            reply: Reply::default(),
        }
    }

    /// Treat the request as cancelled once `deadline` passes.
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    pub fn method(&self) -> &Method {
        &self.parts.method
    }

    pub fn uri(&self) -> &Uri {
        &self.parts.uri
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    /// Header value as a string, if present and valid ASCII.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.parts.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn values(&self) -> &Values {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut Values {
        &mut self.values
    }

    pub fn reply(&self) -> &Reply {
        &self.reply
    }

    pub fn reply_mut(&mut self) -> &mut Reply {
        &mut self.reply
    }

    /// Read the whole body, buffering it so later stages see the same bytes.
    ///
    /// The first call drains the underlying stream; every later call returns
    /// the buffered copy.
    pub async fn body_bytes(&mut self) -> Result<Bytes, StageError> {
        let pending = std::mem::replace(&mut self.body, RequestBody::Buffered(Bytes::new()));
        let body = match pending {
            RequestBody::Buffered(bytes) => {
                self.body = RequestBody::Buffered(bytes.clone());
                return Ok(bytes);
            }
            RequestBody::Pending(body) => body,
        };

        let bytes = axum::body::to_bytes(body, self.body_limit)
            .await
            .map_err(|e| StageError::Body(e.to_string()))?;
        self.body = RequestBody::Buffered(bytes.clone());
        Ok(bytes)
    }

    /// Whether the caller has given up on this request.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the request is cancelled or its deadline passes.
    ///
    /// The returned future owns its state, so it can be raced against work
    /// that borrows the context mutably.
    pub fn cancelled(&self) -> impl Future<Output = ()> + Send + 'static {
        let cancel = self.cancel.clone();
        let deadline = self.deadline;
        async move {
            match deadline {
                Some(deadline) => tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                },
                None => cancel.cancelled().await,
            }
        }
    }

    /// Commit `status` with a plain-text body, unless a status is already committed.
    pub fn respond(&mut self, status: StatusCode, message: &str) {
        if !self.reply.set_status(status) {
            return;
        }
        self.reply.insert_header(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        self.reply.write(message.as_bytes());
    }

    /// Halt-side helper: report `err` as the response.
    pub fn fail(&mut self, err: StageError) {
        self.respond(err.status(), &err.to_string());
    }

    pub fn into_response(self) -> Response {
        self.reply.into_response()
    }
}
