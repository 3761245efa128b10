//! Executor capability: the seam between the worker runtime and whatever
//! actually runs the numbers.

use infermesh_common::{ModelVersion, NamedTensors};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Error types for model loading and execution
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutorError {
    #[error("Unsupported artifact: {0}")]
    UnsupportedArtifact(String),

    #[error("Invalid artifact: {0}")]
    InvalidArtifact(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Inference failed: {0}")]
    Inference(String),
}

/// Result type for executor operations
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Cooperative cancellation flag shared between the runtime and a running model.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Whether both handles share one flag.
    pub fn same_as(&self, other: &CancelSignal) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// `Err(Cancelled)` once cancelled, for use with `?` between work units.
    pub fn check(&self) -> ExecutorResult<()> {
        if self.is_cancelled() {
            Err(ExecutorError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Turns a published model version into something runnable.
pub trait ModelExecutor: Send + Sync {
    fn load(&self, model: &ModelVersion) -> ExecutorResult<Arc<dyn LoadedModel>>;
}

/// A resident, ready-to-run model. `run` is synchronous and may be CPU heavy;
/// the runtime calls it on the blocking pool.
pub trait LoadedModel: Send + Sync {
    fn run(&self, inputs: &NamedTensors, cancel: &CancelSignal) -> ExecutorResult<NamedTensors>;
}
