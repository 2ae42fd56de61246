//! Configuration module for environment variable parsing.
//!
//! Every setting has a default; a value that fails to parse falls back to it
//! with a warning instead of aborting startup.

use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::pipeline::DEFAULT_BODY_LIMIT;
use crate::pool::{ProcessingLimit, DEFAULT_QUEUE_CAPACITY, DEFAULT_WORKERS};
use crate::review::ai::{DEFAULT_MODEL, DEFAULT_SYSTEM_PROMPT};

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// `host:port` the HTTP server binds to
    pub http_listen_addr: String,

    // =========================================================================
    // Webhook intake
    // =========================================================================

    /// Shared secret for HMAC signature verification; `None` disables it
    pub webhook_secret: Option<String>,

    /// Persist every raw webhook body for offline inspection
    pub webhook_debug: bool,

    /// Directory raw bodies are written to in debug mode
    pub webhook_debug_dir: String,

    /// Number of pool consumers
    pub webhook_workers: usize,

    /// Bounded queue capacity
    pub webhook_queue_capacity: usize,

    /// Cap on concurrently running review tasks; `None` means unbounded
    pub webhook_max_in_flight: Option<usize>,

    /// Largest request body accepted, in bytes
    pub webhook_max_body_bytes: usize,

    /// Per-request deadline for the webhook pipeline
    pub request_timeout: Option<Duration>,

    /// Time every module gets to stop on shutdown
    pub shutdown_timeout: Duration,

    // =========================================================================
    // Review collaborators
    // =========================================================================

    /// Gitea API root
    pub gitea_base_url: String,

    /// Token of the Gitea user that posts reviews
    pub gitea_token: String,

    /// Chat-completions endpoint; required, startup fails while it is empty
    pub ai_base_url: String,

    /// Bearer token for the AI endpoint
    pub ai_token: String,

    pub ai_model: String,

    pub ai_system_prompt: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            http_listen_addr: "0.0.0.0:8080".to_string(),
            webhook_secret: None,
            webhook_debug: false,
            webhook_debug_dir: ".".to_string(),
            webhook_workers: DEFAULT_WORKERS,
            webhook_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            webhook_max_in_flight: None,
            webhook_max_body_bytes: DEFAULT_BODY_LIMIT,
            request_timeout: None,
            shutdown_timeout: Duration::from_secs(5),
            gitea_base_url: "http://localhost:3000/api/v1".to_string(),
            gitea_token: String::new(),
            ai_base_url: String::new(),
            ai_token: String::new(),
            ai_model: DEFAULT_MODEL.to_string(),
            ai_system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Config::default();

        Config {
            http_listen_addr: env::var("HTTP_LISTEN_ADDR").unwrap_or(defaults.http_listen_addr),

            webhook_secret: env::var("WEBHOOK_GITEA_SECRET")
                .ok()
                .filter(|s| !s.trim().is_empty()),

            webhook_debug: parse_bool("WEBHOOK_DEBUG", defaults.webhook_debug),

            webhook_debug_dir: env::var("WEBHOOK_DEBUG_DIR").unwrap_or(defaults.webhook_debug_dir),

            webhook_workers: parse_or("WEBHOOK_WORKERS", defaults.webhook_workers),

            webhook_queue_capacity: parse_or("WEBHOOK_QUEUE_CAPACITY", defaults.webhook_queue_capacity),

            webhook_max_in_flight: parse_opt("WEBHOOK_MAX_IN_FLIGHT"),

            webhook_max_body_bytes: parse_or("WEBHOOK_MAX_BODY_BYTES", defaults.webhook_max_body_bytes),

            request_timeout: parse_opt("REQUEST_TIMEOUT_MS").map(Duration::from_millis),

            shutdown_timeout: parse_opt("SHUTDOWN_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.shutdown_timeout),

            gitea_base_url: env::var("GITEA_BASE_URL").unwrap_or(defaults.gitea_base_url),

            gitea_token: env::var("SNOB_USER_GITEA_TOKEN").unwrap_or_default(),

            ai_base_url: env::var("AI_BASE_URL").unwrap_or_default(),

            ai_token: env::var("AI_TOKEN").unwrap_or_default(),

            ai_model: env::var("AI_MODEL").unwrap_or(defaults.ai_model),

            ai_system_prompt: env::var("AI_SYSTEM_PROMPT").unwrap_or(defaults.ai_system_prompt),
        }
    }

    /// How many review tasks the pool may run at once.
    pub fn processing_limit(&self) -> ProcessingLimit {
        match self.webhook_max_in_flight {
            Some(n) if n > 0 => ProcessingLimit::Bounded(n),
            _ => ProcessingLimit::Unbounded,
        }
    }
}

/// Parse a variable, returning `None` if unset or invalid.
fn parse_opt<T>(name: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(env_var = name, value = %raw, error = %e, "Invalid value, ignoring");
            None
        }
    }
}

fn parse_or<T>(name: &str, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    parse_opt(name).unwrap_or(default)
}

/// Accepts `1/0`, `true/false`, `yes/no`, `on/off` in any case.
fn parse_bool(name: &str, default: bool) -> bool {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" | "" => false,
        _ => {
            warn!(env_var = name, value = %raw, "Invalid boolean, using default");
            default
        }
    }
}
