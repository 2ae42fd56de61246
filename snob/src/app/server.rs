//! HTTP server module.
//!
//! Every route is served by a [`Pipeline`], mounted for any method so that
//! method filtering happens inside the pipeline:
//!
//! - `GET /ping` → `200 OK`
//! - whatever [`HttpServer::with_pipeline`] adds, e.g. `/webhook`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use axum::extract::Request;
use axum::http::{Method, StatusCode};
use axum::routing::any;
use axum::Router;
use futures::future::BoxFuture;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::Module;
use crate::pipeline::{allow_methods, respond_text, Pipeline};

pub struct HttpServer {
    addr: String,
    router: Router,
    /// Fires when the server should stop accepting requests. Per-request
    /// cancellation tokens are children of it.
    shutdown: CancellationToken,
    /// Fires once `run` has returned.
    stopped: CancellationToken,
    started: AtomicBool,
}

impl HttpServer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            router: Router::new(),
            shutdown: CancellationToken::new(),
            stopped: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    /// Serve `GET /ping` with a plain `OK`.
    pub fn with_ping(self) -> Self {
        let ping = Pipeline::default()
            .with(allow_methods([Method::GET]))
            .with(respond_text(StatusCode::OK, "OK"));
        self.with_pipeline("/ping", ping)
    }

    /// Serve every method on `path` through `pipeline`.
    pub fn with_pipeline(mut self, path: &str, pipeline: Pipeline) -> Self {
        let pipeline = Arc::new(pipeline.with_shutdown(self.shutdown.clone()));
        self.router = self.router.route(
            path,
            any(move |request: Request| {
                let pipeline = Arc::clone(&pipeline);
                async move { pipeline.handle(request).await }
            }),
        );
        self
    }

    /// The routes with request tracing applied.
    pub fn router(&self) -> Router {
        self.router.clone().layer(TraceLayer::new_for_http())
    }
}

impl Module for HttpServer {
    fn name(&self) -> &'static str {
        "http"
    }

    fn run(&self, cancel: CancellationToken) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            self.started.store(true, Ordering::SeqCst);
            let _stopped = self.stopped.clone().drop_guard();

            let listener = TcpListener::bind(&self.addr)
                .await
                .with_context(|| format!("failed to bind {}", self.addr))?;
            info!(address = %self.addr, "http_server_listening");

            let shutdown = self.shutdown.clone();
            axum::serve(listener, self.router())
                .with_graceful_shutdown(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = shutdown.cancelled() => {}
                    }
                    shutdown.cancel();
                })
                .await
                .context("http server error")?;

            info!(address = %self.addr, "http_server_closed");
            Ok(())
        })
    }

    fn stop(&self, deadline: Instant) -> BoxFuture<'_, anyhow::Result<()>> {
        Box::pin(async move {
            info!(address = %self.addr, "http_server_stopping");
            self.shutdown.cancel();
            if !self.started.load(Ordering::SeqCst) {
                return Ok(());
            }

            tokio::time::timeout_at(deadline, self.stopped.cancelled())
                .await
                .context("http server did not shut down before the deadline")?;
            info!(address = %self.addr, "http_server_stopped");
            Ok(())
        })
    }
}
