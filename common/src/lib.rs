//! Types shared by the infermesh manager (`control-plane`) and worker (`agent`).

pub mod error;
pub mod logging;
pub mod model;
pub mod tensor;
pub mod wire;
pub mod worker;

pub use error::{ErrorBody, ErrorKind, RetryHint};
pub use model::{
    ModelArtifact, ModelRef, ModelSchema, ModelSummary, ModelVersion, Stage, VersionSelector,
    LATEST,
};
pub use tensor::{
    validate_tensors, ElementType, NamedTensors, SchemaViolation, Tensor, TensorData, TensorSpec,
};
pub use worker::{AcceleratorClass, WorkerCapabilities, WorkerStatus};
