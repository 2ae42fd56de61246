//! Module lifecycle and the supervisor that runs them.
//!
//! Every long-running component implements [`Module`]: `run` holds until the
//! component stops or fails, `stop` drains it before a deadline. The
//! [`Supervisor`] runs all modules at once and shuts everything down when one
//! of them fails or the caller cancels.

pub mod server;

use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::recover::Recoverer;

pub use server::HttpServer;

/// Time every module gets to stop once shutdown begins.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A long-running component driven by the [`Supervisor`].
pub trait Module: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Run until stopped, `cancel` fires, or a fatal error occurs.
    fn run(&self, cancel: CancellationToken) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Gracefully stop, giving up at `deadline`.
    fn stop(&self, deadline: Instant) -> BoxFuture<'_, anyhow::Result<()>>;
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("module {module} failed: {error:#}")]
    Module {
        module: &'static str,
        error: anyhow::Error,
    },

    #[error("module {module} panicked")]
    Panicked { module: &'static str },

    #[error("module {module} failed to stop: {error:#}")]
    Stop {
        module: &'static str,
        error: anyhow::Error,
    },

    #[error("module {module} did not stop within {timeout:?}")]
    StopTimeout {
        module: &'static str,
        timeout: Duration,
    },
}

/// Runs modules concurrently and coordinates their shutdown.
pub struct Supervisor {
    modules: Vec<Arc<dyn Module>>,
    shutdown_timeout: Duration,
    recoverer: Recoverer,
}

impl Supervisor {
    pub fn new(recoverer: Recoverer) -> Self {
        Self {
            modules: Vec::new(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            recoverer,
        }
    }

    pub fn with_module(mut self, module: Arc<dyn Module>) -> Self {
        self.modules.push(module);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Run every module until `cancel` fires or one of them fails, then stop
    /// them all. Returns the first error seen.
    ///
    /// Stops run concurrently against one shared deadline. A run future still
    /// alive after that deadline is aborted.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), AppError> {
        let cancel = cancel.child_token();
        let mut first_error: Option<AppError> = None;
        let mut runs = JoinSet::new();

        for module in &self.modules {
            let module = Arc::clone(module);
            let cancel = cancel.clone();
            let recoverer = self.recoverer.clone();

            runs.spawn(async move {
                let name = module.name();
                info!(module = name, "module_starting");
                let result = match recoverer.guard(name, module.run(cancel.clone())).await {
                    Some(Ok(())) => Ok(()),
                    Some(Err(error)) => Err(AppError::Module {
                        module: name,
                        error,
                    }),
                    None => Err(AppError::Panicked { module: name }),
                };
                if result.is_err() {
                    cancel.cancel();
                }
                info!(module = name, failed = result.is_err(), "module_run_finished");
                result
            });
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                joined = runs.join_next() => match joined {
                    Some(joined) => record(&mut first_error, joined),
                    None => break,
                },
            }
        }

        info!(
            modules = self.modules.len(),
            timeout_ms = self.shutdown_timeout.as_millis() as u64,
            "app_shutting_down"
        );
        cancel.cancel();

        let deadline = Instant::now() + self.shutdown_timeout;
        let stops = self
            .modules
            .iter()
            .map(|module| self.stop_module(module.as_ref(), deadline));
        for result in join_all(stops).await {
            if let Err(err) = result {
                error!(error = %err, "module_stop_failed");
                first_error.get_or_insert(err);
            }
        }

        let drained = timeout_at(deadline, async {
            while let Some(joined) = runs.join_next().await {
                record(&mut first_error, joined);
            }
        })
        .await;
        if drained.is_err() {
            warn!(remaining = runs.len(), "app_runs_aborted");
            runs.abort_all();
        }

        match first_error {
            Some(err) => {
                error!(error = %err, "app_exited_with_error");
                Err(err)
            }
            None => {
                info!("app_exited_cleanly");
                Ok(())
            }
        }
    }

    async fn stop_module(&self, module: &dyn Module, deadline: Instant) -> Result<(), AppError> {
        let name = module.name();
        let stop = timeout_at(deadline, module.stop(deadline));

        match self.recoverer.guard(name, stop).await {
            Some(Ok(Ok(()))) => {
                info!(module = name, "module_stopped");
                Ok(())
            }
            Some(Ok(Err(error))) => Err(AppError::Stop {
                module: name,
                error,
            }),
            Some(Err(_elapsed)) => Err(AppError::StopTimeout {
                module: name,
                timeout: self.shutdown_timeout,
            }),
            None => Err(AppError::Panicked { module: name }),
        }
    }
}

fn record(
    first_error: &mut Option<AppError>,
    joined: Result<Result<(), AppError>, tokio::task::JoinError>,
) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(error = %err, "module_failed");
            first_error.get_or_insert(err);
        }
        Err(e) => warn!(error = %e, "module_task_join_failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use anyhow::anyhow;

    /// Module whose run and stop behavior is scripted per test.
    struct Fake {
        name: &'static str,
        run_fails: bool,
        run_panics: bool,
        stop_hangs: bool,
        stopped: AtomicBool,
    }

    impl Fake {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                run_fails: false,
                run_panics: false,
                stop_hangs: false,
                stopped: AtomicBool::new(false),
            }
        }
    }

    impl Module for Fake {
        fn name(&self) -> &'static str {
            self.name
        }

        fn run(&self, cancel: CancellationToken) -> BoxFuture<'_, anyhow::Result<()>> {
            Box::pin(async move {
                if self.run_panics {
                    panic!("{} blew up", self.name);
                }
                if self.run_fails {
                    return Err(anyhow!("{} could not start", self.name));
                }
                cancel.cancelled().await;
                Ok(())
            })
        }

        fn stop(&self, _deadline: Instant) -> BoxFuture<'_, anyhow::Result<()>> {
            Box::pin(async move {
                if self.stop_hangs {
                    std::future::pending::<()>().await;
                }
                self.stopped.store(true, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_failing_module_stops_the_others() {
        let healthy = Arc::new(Fake::new("healthy"));
        let failing = Arc::new(Fake {
            run_fails: true,
            ..Fake::new("failing")
        });
        let supervisor = Supervisor::new(Recoverer::new("app"))
            .with_module(healthy.clone())
            .with_module(failing.clone());

        let err = supervisor.run(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, AppError::Module { module: "failing", .. }));
        assert!(healthy.stopped.load(Ordering::SeqCst));
        assert!(failing.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_external_cancel_is_clean() {
        let first = Arc::new(Fake::new("first"));
        let second = Arc::new(Fake::new("second"));
        let supervisor = Supervisor::new(Recoverer::new("app"))
            .with_module(first.clone())
            .with_module(second.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        supervisor.run(cancel).await.unwrap();
        assert!(first.stopped.load(Ordering::SeqCst));
        assert!(second.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_hanging_stop_times_out_without_blocking_others() {
        let hanging = Arc::new(Fake {
            stop_hangs: true,
            ..Fake::new("hanging")
        });
        let other = Arc::new(Fake::new("other"));
        let supervisor = Supervisor::new(Recoverer::new("app"))
            .with_module(hanging.clone())
            .with_module(other.clone())
            .with_shutdown_timeout(Duration::from_millis(50));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = supervisor.run(cancel).await.unwrap_err();

        assert!(matches!(err, AppError::StopTimeout { module: "hanging", .. }));
        assert!(other.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_panicking_module_is_reported() {
        let panicking = Arc::new(Fake {
            run_panics: true,
            ..Fake::new("panicking")
        });
        let healthy = Arc::new(Fake::new("healthy"));
        let supervisor = Supervisor::new(Recoverer::new("app"))
            .with_module(panicking)
            .with_module(healthy.clone());

        let err = supervisor.run(CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, AppError::Panicked { module: "panicking" }));
        assert!(healthy.stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_no_modules_returns_immediately() {
        let supervisor = Supervisor::new(Recoverer::new("app"));
        supervisor.run(CancellationToken::new()).await.unwrap();
    }
}
