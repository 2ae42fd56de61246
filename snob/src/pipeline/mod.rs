//! Ordered middleware chain executed per HTTP request.
//!
//! A [`Pipeline`] runs its stages strictly in registration order. Each stage
//! receives the request [`Ctx`] and a [`Next`] continuation; calling
//! [`Next::run`] proceeds to the following stage, returning without calling it
//! halts the chain.
//!
//! ```text
//! request → stage 1 → stage 2 → ... → stage n → response sink
//!              │ (no next)
//!              └──────────────────────────────→ response sink
//! ```
//!
//! Stages exchange data through the request-scoped value store (see
//! [`typed`]) instead of a shared mutable record.

pub mod context;
pub mod error;
pub mod middleware;
pub mod typed;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::Request;
use axum::response::Response;
use futures::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub use context::{Ctx, Reply, Values, DEFAULT_BODY_LIMIT};
pub use error::StageError;
pub use middleware::{
    allow_content_type, allow_methods, decode_json, encode_json, respond_text, AllowContentType,
    AllowMethods, DecodeJson, EncodeJson, RespondText,
};
pub use typed::{in_out, input, output, Consume, Input, InOut, Output, Produce, Transform};

/// A single unit of the chain.
pub trait Middleware: Send + Sync + 'static {
    fn call<'a>(&'a self, ctx: &'a mut Ctx, next: Next<'a>) -> BoxFuture<'a, ()>;
}

/// Shared handle to a stage.
pub type Stage = Arc<dyn Middleware>;

/// Continuation to the rest of the chain.
pub struct Next<'a> {
    rest: &'a [Stage],
}

impl<'a> Next<'a> {
    /// Run the remaining stages. A no-op once the chain is exhausted.
    pub fn run<'b>(self, ctx: &'b mut Ctx) -> BoxFuture<'b, ()>
    where
        'a: 'b,
    {
        match self.rest.split_first() {
            Some((stage, rest)) => stage.call(ctx, Next { rest }),
            None => Box::pin(async {}),
        }
    }
}

/// Stage built from an async closure.
pub struct FromFn<F>(F);

impl<F> Middleware for FromFn<F>
where
    F: for<'a> Fn(&'a mut Ctx, Next<'a>) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    fn call<'a>(&'a self, ctx: &'a mut Ctx, next: Next<'a>) -> BoxFuture<'a, ()> {
        (self.0)(ctx, next)
    }
}

/// Adapt a closure returning a boxed future into a stage.
///
/// ```ignore
/// let stage = from_fn(|ctx, next| Box::pin(async move { next.run(ctx).await }));
/// ```
pub fn from_fn<F>(f: F) -> FromFn<F>
where
    F: for<'a> Fn(&'a mut Ctx, Next<'a>) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    FromFn(f)
}

/// Ordered chain of stages plus the per-request policy it runs them under.
#[derive(Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
    shutdown: CancellationToken,
    request_timeout: Option<Duration>,
    body_limit: usize,
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Self {
        Self {
            stages,
            shutdown: CancellationToken::new(),
            request_timeout: None,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    /// Append a stage after the ones already registered.
    pub fn with<M: Middleware>(mut self, stage: M) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    /// Per-request cancellation tokens become children of `token`.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Treat requests as cancelled once `timeout` has elapsed.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Serve one request under a fresh child of the pipeline's shutdown token.
    pub async fn handle(&self, request: Request) -> Response {
        self.handle_with(request, self.shutdown.child_token()).await
    }

    /// Serve one request under an explicit cancellation token.
    pub async fn handle_with(&self, request: Request, cancel: CancellationToken) -> Response {
        let deadline = self.request_timeout.map(|timeout| Instant::now() + timeout);
        let mut ctx = Ctx::new(request, cancel)
            .with_deadline(deadline)
            .with_body_limit(self.body_limit);

        Next { rest: &self.stages }.run(&mut ctx).await;

        ctx.into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use axum::body::Body;
    use axum::http::StatusCode;
    use http_body_util::BodyExt;

    fn request() -> Request {
        Request::builder()
            .method("POST")
            .uri("/")
            .body(Body::empty())
            .unwrap()
    }

    /// Stage that records its label and then continues.
    fn recorder(log: Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> impl Middleware {
        from_fn(move |ctx, next| {
            log.lock().unwrap().push(label);
            Box::pin(async move { next.run(ctx).await })
        })
    }

    #[tokio::test]
    async fn test_stages_run_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::default()
            .with(recorder(log.clone(), "first"))
            .with(recorder(log.clone(), "second"))
            .with(recorder(log.clone(), "third"));

        let response = pipeline.handle(request()).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_stage_without_next_halts_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let halt = from_fn(|ctx, _next| {
            Box::pin(async move { ctx.respond(StatusCode::FORBIDDEN, "halted") })
        });
        let pipeline = Pipeline::default()
            .with(recorder(log.clone(), "before"))
            .with(halt)
            .with(recorder(log.clone(), "after"));

        let response = pipeline.handle(request()).await;

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(*log.lock().unwrap(), vec!["before"]);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"halted");
    }

    #[tokio::test]
    async fn test_empty_pipeline_returns_ok_with_empty_body() {
        let pipeline = Pipeline::default();
        assert!(pipeline.is_empty());

        let response = pipeline.handle(request()).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_stage_can_act_after_rest_of_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let outer_log = log.clone();
        let outer = from_fn(move |ctx, next| {
            let log = outer_log.clone();
            Box::pin(async move {
                next.run(ctx).await;
                log.lock().unwrap().push("outer-after");
                ctx.reply_mut().write(b"!");
            })
        });
        let inner = from_fn(|ctx, next| {
            Box::pin(async move {
                ctx.reply_mut().write(b"inner");
                next.run(ctx).await;
            })
        });
        let pipeline = Pipeline::default()
            .with(outer)
            .with(inner)
            .with(recorder(log.clone(), "last"));

        let response = pipeline.handle(request()).await;

        assert_eq!(*log.lock().unwrap(), vec!["last", "outer-after"]);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"inner!");
    }

    #[tokio::test]
    async fn test_shutdown_token_reaches_request() {
        let shutdown = CancellationToken::new();
        let seen = Arc::new(Mutex::new(None));
        let seen_in_stage = seen.clone();
        let probe = from_fn(move |ctx, next| {
            *seen_in_stage.lock().unwrap() = Some(ctx.is_cancelled());
            Box::pin(async move { next.run(ctx).await })
        });
        let pipeline = Pipeline::default()
            .with(probe)
            .with_shutdown(shutdown.clone());

        shutdown.cancel();
        pipeline.handle(request()).await;

        assert_eq!(*seen.lock().unwrap(), Some(true));
    }
}
