pub mod reference;
pub mod types;

pub use reference::ReferenceExecutor;
pub use types::{CancelSignal, ExecutorError, ExecutorResult, LoadedModel, ModelExecutor};
