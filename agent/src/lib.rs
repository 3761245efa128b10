pub mod api;
pub mod client;
pub mod config;
pub mod device;
pub mod errors;
pub mod executor;
pub mod model;
pub mod runtime;

#[cfg(test)]
pub(crate) mod test_support;

pub use client::{ControlPlaneClient, RemoteSessionValidator};
pub use config::WorkerConfig;
pub use device::{detect_capabilities, HostInfo};
pub use errors::{AgentError, Result};
pub use executor::{CancelSignal, ExecutorError, LoadedModel, ModelExecutor, ReferenceExecutor};
pub use model::ModelStore;
pub use runtime::{RuntimeConfig, SessionValidator, WorkerRuntime};
