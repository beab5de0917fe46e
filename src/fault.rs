//! Fault isolation module
//!
//! Panic-catch-and-log wrappers applied at every boundary where
//! application code runs inside the gateway: message handlers, lifecycle
//! callbacks, the raw-interception hook, and the per-connection I/O
//! tasks. A fault inside one of these never propagates past the
//! boundary; it is logged and the surrounding loop continues.

use std::panic::{catch_unwind, AssertUnwindSafe};

use futures_util::FutureExt;
use tracing::error;

/// Run a closure, logging any panic instead of unwinding past it.
pub fn safe_call<F>(label: &str, f: F)
where
    F: FnOnce(),
{
    if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
        error!(label = label, panic = ?panic_message(&panic), "caught panic");
    }
}

/// Run a closure that produces a value, logging any panic and returning
/// `None` in its place.
pub fn safe_call_with<F, R>(label: &str, f: F) -> Option<R>
where
    F: FnOnce() -> R,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(panic) => {
            error!(label = label, panic = ?panic_message(&panic), "caught panic");
            None
        }
    }
}

/// Spawn a task whose panics are logged rather than silently swallowed
/// by the dropped `JoinHandle`.
pub fn spawn_guarded<F>(label: &'static str, future: F)
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(future).catch_unwind().await {
            error!(label = label, panic = ?panic_message(&panic), "task panicked");
        }
    });
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
