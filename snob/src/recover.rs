//! Panic containment for spawned tasks.
//!
//! A [`Recoverer`] is handed to every component that spawns long-running or
//! fire-and-forget work. It runs a future, catches a panic at that boundary
//! and reports it through `tracing` (and an optional hook), so one bad task
//! never takes down its pool or the process.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::error;

type PanicHook = Arc<dyn Fn(&PanicReport) + Send + Sync>;

/// What a caught panic looked like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanicReport {
    pub component: &'static str,
    pub task: String,
    pub message: String,
}

/// Catches and reports panics for one component.
#[derive(Clone)]
pub struct Recoverer {
    component: &'static str,
    hook: Option<PanicHook>,
}

impl std::fmt::Debug for Recoverer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recoverer")
            .field("component", &self.component)
            .field("has_hook", &self.hook.is_some())
            .finish()
    }
}

impl Recoverer {
    pub fn new(component: &'static str) -> Self {
        Self {
            component,
            hook: None,
        }
    }

    /// Also call `hook` for every caught panic, after it is logged.
    pub fn with_hook(mut self, hook: impl Fn(&PanicReport) + Send + Sync + 'static) -> Self {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Run `fut` to completion, returning `None` if it panicked.
    pub async fn guard<F>(&self, task: &str, fut: F) -> Option<F::Output>
    where
        F: Future,
    {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(output) => Some(output),
            Err(payload) => {
                self.report(task, payload.as_ref());
                None
            }
        }
    }

    fn report(&self, task: &str, payload: &(dyn Any + Send)) {
        let report = PanicReport {
            component: self.component,
            task: task.to_string(),
            message: panic_message(payload),
        };

        error!(
            component = report.component,
            task = %report.task,
            panic = %report.message,
            "task_panicked"
        );

        if let Some(hook) = &self.hook {
            hook(&report);
        }
    }
}

/// Best-effort text of a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_guard_passes_output_through() {
        let recoverer = Recoverer::new("test");
        let out = recoverer.guard("add", async { 1 + 1 }).await;
        assert_eq!(out, Some(2));
    }

    #[tokio::test]
    async fn test_guard_catches_panic_and_calls_hook() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let recoverer =
            Recoverer::new("pool").with_hook(move |report| sink.lock().unwrap().push(report.clone()));

        let out: Option<()> = recoverer
            .guard("process", async { panic!("processor exploded") })
            .await;

        assert!(out.is_none());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].component, "pool");
        assert_eq!(seen[0].task, "process");
        assert_eq!(seen[0].message, "processor exploded");
    }

    #[test]
    fn test_panic_message_variants() {
        let s: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(s.as_ref()), "static");

        let owned: Box<dyn Any + Send> = Box::new(format!("owned {}", 1));
        assert_eq!(panic_message(owned.as_ref()), "owned 1");

        let other: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }
}
