//! Task failure reporting.
//!
//! A failing task never fails its round. Instead the failure is handed to a
//! [`FailureHandler`]: the scheduler's own handler when one was configured,
//! otherwise the process-wide handler. The default process-wide handler logs
//! the failure at `error` level.

use crate::id::UnitId;
use crate::unit::StepError;
use parking_lot::RwLock;
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::error;

/// Why a task did not complete.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureCause {
    /// The unit returned an error.
    Error(StepError),
    /// The task panicked; carries the panic message.
    Panic(String),
    /// The task was skipped because its scheduler was disposed.
    Cancelled,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Error(e) => write!(f, "{e}"),
            FailureCause::Panic(msg) => write!(f, "panicked: {msg}"),
            FailureCause::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A failed task and the unit it belonged to.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub unit: UnitId,
    pub cause: FailureCause,
}

/// Receives task failures. Called on the worker thread that ran the task.
pub trait FailureHandler: Send + Sync + fmt::Debug {
    fn on_failure(&self, failure: &TaskFailure);
}

/// Logs every failure with `tracing::error!`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogFailureHandler;

impl FailureHandler for LogFailureHandler {
    fn on_failure(&self, failure: &TaskFailure) {
        error!(unit = %failure.unit, cause = %failure.cause, "task failed");
    }
}

// ---------------------------------------------------------------------------
// Process-wide handler
// ---------------------------------------------------------------------------

fn slot() -> &'static RwLock<Arc<dyn FailureHandler>> {
    static GLOBAL: OnceLock<RwLock<Arc<dyn FailureHandler>>> = OnceLock::new();
    GLOBAL.get_or_init(|| RwLock::new(Arc::new(LogFailureHandler)))
}

/// Replace the process-wide handler, returning the previous one.
pub fn set_global_handler(handler: Arc<dyn FailureHandler>) -> Arc<dyn FailureHandler> {
    std::mem::replace(&mut *slot().write(), handler)
}

/// The current process-wide handler.
pub fn global_handler() -> Arc<dyn FailureHandler> {
    Arc::clone(&slot().read())
}

/// Turn a panic payload into a message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
