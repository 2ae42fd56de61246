//! Gitea webhook intake.
//!
//! [`WebhookService`] builds the `/webhook` pipeline and owns the worker pool
//! that processes accepted payloads:
//!
//! ```text
//! [raw body dump] → POST only → application/json only → [signature]
//!     → decode Payload → push onto queue → 200
//! ```
//!
//! The HTTP caller only learns whether the payload was queued. Processing
//! happens later on the pool and its outcome is never reported back.

pub mod middleware;
pub mod payload;
pub mod signature;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::http::Method;
use futures::future::BoxFuture;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::app::Module;
use crate::pipeline::{allow_content_type, allow_methods, decode_json, input, output, Pipeline};
use crate::pool::{
    Process, ProcessingLimit, QueueHandle, WorkerPool, DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKERS,
};
use crate::recover::Recoverer;

pub use middleware::{Push, RawBodyLog};
pub use payload::{Action, Head, Owner, Payload, PullRequest, Repository};
pub use signature::{
    compute_signature, is_signature_verification_enabled, verify_signature, CheckSignature,
    SIGNATURE_HEADER,
};

/// Webhook pipeline plus the pool behind it.
pub struct WebhookService {
    processor: Arc<dyn Process<Payload>>,
    recoverer: Recoverer,
    secret: Option<String>,
    debug_dir: Option<PathBuf>,
    workers: usize,
    capacity: usize,
    limit: ProcessingLimit,
    pool: Arc<WorkerPool<Payload>>,
}

impl WebhookService {
    pub fn new(processor: Arc<dyn Process<Payload>>, recoverer: Recoverer) -> Self {
        Self {
            pool: Arc::new(WorkerPool::new(
                Arc::clone(&processor),
                DEFAULT_WORKERS,
                DEFAULT_QUEUE_CAPACITY,
                recoverer.clone(),
            )),
            processor,
            recoverer,
            secret: None,
            debug_dir: None,
            workers: DEFAULT_WORKERS,
            capacity: DEFAULT_QUEUE_CAPACITY,
            limit: ProcessingLimit::default(),
        }
    }

    /// Require requests to be signed with `secret`. A blank secret disables
    /// verification.
    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        let secret = Some(secret.into());
        self.secret = is_signature_verification_enabled(&secret)
            .then_some(secret)
            .flatten();
        self
    }

    /// Dump every raw body into `dir` before processing it.
    pub fn with_debug(mut self, dir: impl Into<PathBuf>) -> Self {
        self.debug_dir = Some(dir.into());
        self
    }

    // The sizing builders replace the pool, so queue handles taken earlier
    // point at the discarded one.

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self.rebuild_pool();
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self.rebuild_pool();
        self
    }

    pub fn with_processing_limit(mut self, limit: ProcessingLimit) -> Self {
        self.limit = limit;
        self.rebuild_pool();
        self
    }

    fn rebuild_pool(&mut self) {
        let pool = WorkerPool::new(
            Arc::clone(&self.processor),
            self.workers,
            self.capacity,
            self.recoverer.clone(),
        )
        .with_limit(self.limit);
        self.pool = Arc::new(pool);
    }

    pub fn queue(&self) -> QueueHandle<Payload> {
        self.pool.queue()
    }

    pub fn pool(&self) -> &WorkerPool<Payload> {
        &self.pool
    }

    pub fn signature_required(&self) -> bool {
        self.secret.is_some()
    }

    /// The `/webhook` request pipeline.
    pub fn pipeline(&self) -> Pipeline {
        let mut pipeline = Pipeline::default();
        if let Some(dir) = &self.debug_dir {
            pipeline = pipeline.with(RawBodyLog::new(dir.clone()));
        }

        pipeline = pipeline
            .with(allow_methods([Method::POST]))
            .with(allow_content_type("application/json"));

        if let Some(secret) = &self.secret {
            pipeline = pipeline.with(CheckSignature::new(secret.clone()));
        }

        pipeline
            .with(output::<Payload, _>(decode_json()))
            .with(input::<Payload, _>(Push::new(self.pool.queue())))
    }
}

impl Module for WebhookService {
    fn name(&self) -> &'static str {
        "webhook"
    }

    /// Start the pool under `cancel` and hold until it fires.
    fn run(&self, cancel: CancellationToken) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            info!(
                workers = self.pool.workers(),
                capacity = self.pool.capacity(),
                signature_required = self.signature_required(),
                debug = self.debug_dir.is_some(),
                "webhook_handling_starting"
            );
            self.pool
                .start(cancel.clone())
                .context("failed to start webhook worker pool")?;

            cancel.cancelled().await;
            Ok(())
        })
    }

    /// Drain the pool, giving up at `deadline`.
    fn stop(&self, deadline: Instant) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            info!(in_flight = self.pool.in_flight(), "webhook_handling_stopping");
            tokio::time::timeout_at(deadline, self.pool.shutdown())
                .await
                .context("webhook worker pool did not drain before the deadline")?;
            info!("webhook_handling_stopped");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use axum::body::Body;
    use axum::extract::Request;
    use axum::http::StatusCode;
    use axum::Router;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::app::HttpServer;
    use crate::pool::PoolState;

    const SECRET: &str = "s3cret";
    const BODY: &str = r#"{"action":"review_requested","pull_request":{"id":7,"diff_url":"","head":{"sha":"abc123"}},"repository":{"name":"r","owner":{"login":"o"}}}"#;

    type Seen = Arc<Mutex<Vec<Payload>>>;

    fn recording() -> (Arc<dyn Process<Payload>>, Seen) {
        let seen: Seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let processor: Arc<dyn Process<Payload>> =
            Arc::new(move |_cancel: CancellationToken, payload: Payload| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().unwrap().push(payload);
                }
            });
        (processor, seen)
    }

    fn router(pipeline: Pipeline) -> Router {
        HttpServer::new("127.0.0.1:0")
            .with_ping()
            .with_pipeline("/webhook", pipeline)
            .router()
    }

    struct Post {
        uri: &'static str,
        method: &'static str,
        content_type: Option<&'static str>,
        signature: Option<String>,
        body: &'static str,
    }

    impl Post {
        fn signed(body: &'static str) -> Self {
            Self {
                uri: "/webhook",
                method: "POST",
                content_type: Some("application/json"),
                signature: Some(compute_signature(SECRET, body.as_bytes())),
                body,
            }
        }

        fn request(self) -> Request {
            let mut builder = Request::builder().method(self.method).uri(self.uri);
            if let Some(ct) = self.content_type {
                builder = builder.header("content-type", ct);
            }
            if let Some(sig) = self.signature {
                builder = builder.header(SIGNATURE_HEADER, sig);
            }
            builder.body(Body::from(self.body)).unwrap()
        }
    }

    async fn send(app: &Router, post: Post) -> (StatusCode, String) {
        let response = app.clone().oneshot(post.request()).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    /// Send one request against a running service, then drain it.
    async fn exchange(service: WebhookService, post: Post) -> StatusCode {
        let app = router(service.pipeline());
        let cancel = CancellationToken::new();
        service.pool().start(cancel.clone()).unwrap();

        let (status, _) = send(&app, post).await;

        service.pool().shutdown().await;
        status
    }

    fn expected_payload() -> Payload {
        serde_json::from_str(BODY).unwrap()
    }

    #[tokio::test]
    async fn test_signed_request_is_processed() {
        let (processor, seen) = recording();
        let service = WebhookService::new(processor, Recoverer::new("test")).with_secret(SECRET);
        let app = router(service.pipeline());
        service.pool().start(CancellationToken::new()).unwrap();

        let (status, body) = send(&app, Post::signed(BODY)).await;
        service.pool().shutdown().await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
        assert_eq!(*seen.lock().unwrap(), vec![expected_payload()]);
    }

    #[tokio::test]
    async fn test_missing_content_type_is_unsupported() {
        let (processor, seen) = recording();
        let service = WebhookService::new(processor, Recoverer::new("test")).with_secret(SECRET);
        let post = Post {
            content_type: None,
            ..Post::signed(BODY)
        };

        assert_eq!(exchange(service, post).await, StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_signature_is_bad_request() {
        let (processor, seen) = recording();
        let service = WebhookService::new(processor, Recoverer::new("test")).with_secret(SECRET);
        let post = Post {
            signature: None,
            ..Post::signed(BODY)
        };

        assert_eq!(exchange(service, post).await, StatusCode::BAD_REQUEST);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_signature_is_unauthorized() {
        let (processor, seen) = recording();
        let service = WebhookService::new(processor, Recoverer::new("test")).with_secret(SECRET);
        let post = Post {
            signature: Some(compute_signature("not-the-secret", BODY.as_bytes())),
            ..Post::signed(BODY)
        };

        assert_eq!(exchange(service, post).await, StatusCode::UNAUTHORIZED);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_body_is_bad_request() {
        let (processor, seen) = recording();
        let service = WebhookService::new(processor, Recoverer::new("test")).with_secret(SECRET);

        assert_eq!(exchange(service, Post::signed("")).await, StatusCode::BAD_REQUEST);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_action_are_bad_request() {
        let (processor, seen) = recording();
        let service = WebhookService::new(processor, Recoverer::new("test"));
        let app = router(service.pipeline());
        service.pool().start(CancellationToken::new()).unwrap();

        let (malformed, _) = send(&app, Post::signed("{\"action\":")).await;
        let (unknown, _) = send(
            &app,
            Post::signed(r#"{"action":"opened","pull_request":{"id":7,"diff_url":"","head":{"sha":"abc123"}},"repository":{"name":"r","owner":{"login":"o"}}}"#),
        )
        .await;
        service.pool().shutdown().await;

        assert_eq!(malformed, StatusCode::BAD_REQUEST);
        assert_eq!(unknown, StatusCode::BAD_REQUEST);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_method_is_rejected() {
        let (processor, seen) = recording();
        let service = WebhookService::new(processor, Recoverer::new("test"));
        let post = Post {
            method: "GET",
            ..Post::signed(BODY)
        };

        assert_eq!(exchange(service, post).await, StatusCode::METHOD_NOT_ALLOWED);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_post_to_ping_is_rejected() {
        let (processor, seen) = recording();
        let service = WebhookService::new(processor, Recoverer::new("test"));
        let post = Post {
            uri: "/ping",
            ..Post::signed(BODY)
        };

        assert_eq!(exchange(service, post).await, StatusCode::METHOD_NOT_ALLOWED);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_secret_accepts_unsigned() {
        let (processor, seen) = recording();
        let service = WebhookService::new(processor, Recoverer::new("test")).with_secret("  ");
        assert!(!service.signature_required());
        let post = Post {
            signature: None,
            ..Post::signed(BODY)
        };

        assert_eq!(exchange(service, post).await, StatusCode::OK);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_debug_dumps_raw_body() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, _seen) = recording();
        let service = WebhookService::new(processor, Recoverer::new("test"))
            .with_secret(SECRET)
            .with_debug(dir.path());

        assert_eq!(exchange(service, Post::signed(BODY)).await, StatusCode::OK);

        let dumped: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| std::fs::read_to_string(entry.unwrap().path()).unwrap())
            .collect();
        assert_eq!(dumped, vec![BODY.to_string()]);
    }

    #[tokio::test]
    async fn test_full_queue_and_cancelled_caller_is_timeout() {
        let (processor, seen) = recording();
        let service = WebhookService::new(processor, Recoverer::new("test")).with_queue_capacity(1);
        let app = router(
            service
                .pipeline()
                .with_request_timeout(Duration::from_millis(50)),
        );

        // Pool not started yet, so the only slot stays taken.
        service.queue().push(expected_payload()).await.unwrap();

        let (status, _) = send(&app, Post::signed(BODY)).await;
        assert_eq!(status, StatusCode::REQUEST_TIMEOUT);

        service.pool().start(CancellationToken::new()).unwrap();
        service.pool().shutdown().await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_after_shutdown() {
        let (processor, seen) = recording();
        let service = WebhookService::new(processor, Recoverer::new("test"));
        let app = router(service.pipeline());
        service.pool().start(CancellationToken::new()).unwrap();
        service.pool().shutdown().await;

        let (status, _) = send(&app, Post::signed(BODY)).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_module_run_and_stop() {
        let (processor, seen) = recording();
        let service = Arc::new(WebhookService::new(processor, Recoverer::new("test")));
        let cancel = CancellationToken::new();

        let run = tokio::spawn({
            let service = Arc::clone(&service);
            let cancel = cancel.clone();
            async move { service.run(cancel).await }
        });

        while service.pool().state() != PoolState::Running {
            tokio::task::yield_now().await;
        }
        service.queue().push(expected_payload()).await.unwrap();
        while seen.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        cancel.cancel();
        run.await.unwrap().unwrap();
        service
            .stop(Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(service.pool().state(), PoolState::Stopped);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
