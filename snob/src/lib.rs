//! Snob - Gitea pull-request review bot.
//!
//! Receives Gitea webhooks, verifies and decodes them in a typed middleware
//! pipeline, and hands accepted payloads to a bounded worker pool that runs
//! the AI review in the background.
//!
//! ## Architecture
//!
//! ```text
//! Gitea → HttpServer → /webhook pipeline → queue → WorkerPool → Reviewer → Gitea
//! ```
//!
//! The HTTP server and the webhook service are [`app::Module`]s run by the
//! [`app::Supervisor`], which owns shutdown.

pub mod app;
pub mod config;
pub mod pipeline;
pub mod pool;
pub mod recover;
pub mod review;
pub mod webhook;

// Re-export commonly used types
pub use app::{AppError, HttpServer, Module, Supervisor};
pub use config::Config;
pub use pipeline::{Ctx, Middleware, Next, Pipeline, StageError};
pub use pool::{ProcessingLimit, PushError, QueueHandle, WorkerPool};
pub use recover::Recoverer;
pub use review::Reviewer;
pub use webhook::{Payload, WebhookService};
