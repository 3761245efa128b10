//! Model identity, lifecycle stage and the published manifest.

use crate::tensor::TensorSpec;
use crate::worker::AcceleratorClass;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// Selector value meaning "newest eligible version". Never a valid version.
pub const LATEST: &str = "latest";

/// Lifecycle stage of a model version. Ordered `Dev < Staging < Prod`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Dev,
    Staging,
    Prod,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Dev => "dev",
            Stage::Staging => "staging",
            Stage::Prod => "prod",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Stage::Dev),
            "staging" => Ok(Stage::Staging),
            "prod" | "production" => Ok(Stage::Prod),
            other => Err(format!("unknown stage '{}'", other)),
        }
    }
}

/// Identity of one published model version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelRef {
    pub model_id: String,
    pub version: String,
}

impl ModelRef {
    pub fn new(model_id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.model_id, self.version)
    }
}

/// How a caller picks a version: the newest eligible one, or an exact one.
///
/// Serialized as a plain string, with `"latest"` standing for [`VersionSelector::Latest`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum VersionSelector {
    #[default]
    Latest,
    Exact(String),
}

impl From<String> for VersionSelector {
    fn from(s: String) -> Self {
        if s.is_empty() || s.eq_ignore_ascii_case(LATEST) {
            VersionSelector::Latest
        } else {
            VersionSelector::Exact(s)
        }
    }
}

impl From<&str> for VersionSelector {
    fn from(s: &str) -> Self {
        VersionSelector::from(s.to_string())
    }
}

impl From<VersionSelector> for String {
    fn from(selector: VersionSelector) -> Self {
        match selector {
            VersionSelector::Latest => LATEST.to_string(),
            VersionSelector::Exact(v) => v,
        }
    }
}

impl fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSelector::Latest => f.write_str(LATEST),
            VersionSelector::Exact(v) => f.write_str(v),
        }
    }
}

/// Declared inputs and outputs of a model.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModelSchema {
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

/// What a worker's executor loads for a model version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelArtifact {
    /// Element-wise `y = scale * x + bias` over a single input and output.
    Affine { scale: f64, bias: f64 },
    /// Fully connected layer `y = W x + b`, optionally followed by softmax.
    /// `weights` is row-major with one row per output unit.
    Dense {
        weights: Vec<Vec<f64>>,
        bias: Vec<f64>,
        #[serde(default)]
        softmax: bool,
    },
    /// Weights stored elsewhere; only executors that understand the URI can load it.
    External { uri: String },
}

/// A published, immutable model version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub model_id: String,
    pub version: String,
    pub stage: Stage,
    pub schema: ModelSchema,
    pub artifact: ModelArtifact,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: String,
    /// Accelerator class a hosting worker must provide, if any.
    #[serde(default)]
    pub accelerator: Option<AcceleratorClass>,
    /// Registry-assigned publication order.
    #[serde(default)]
    pub publish_seq: u64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub published_at: Option<OffsetDateTime>,
}

impl ModelVersion {
    pub fn model_ref(&self) -> ModelRef {
        ModelRef::new(self.model_id.clone(), self.version.clone())
    }

    pub fn summary(&self) -> ModelSummary {
        ModelSummary {
            model_id: self.model_id.clone(),
            version: self.version.clone(),
            stage: self.stage,
            schema: self.schema.clone(),
            tags: self.tags.clone(),
            description: self.description.clone(),
            accelerator: self.accelerator,
            publish_seq: self.publish_seq,
            published_at: self.published_at,
        }
    }

    /// Copy of this version carrying a different stage.
    pub fn with_stage(&self, stage: Stage) -> Self {
        Self {
            stage,
            ..self.clone()
        }
    }
}

/// Catalog listing entry: a model version without its artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub model_id: String,
    pub version: String,
    pub stage: Stage,
    pub schema: ModelSchema,
    pub tags: Vec<String>,
    pub description: String,
    pub accelerator: Option<AcceleratorClass>,
    pub publish_seq: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub published_at: Option<OffsetDateTime>,
}
