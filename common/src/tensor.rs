//! Named tensors and the schema they are checked against.
//!
//! Every inference call carries its inputs as a map of tensor name to
//! [`Tensor`]. A model declares the tensors it accepts as a list of
//! [`TensorSpec`]s; the worker validates inputs against those specs before
//! anything reaches the executor.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Named tensors, ordered by name so serialized payloads are stable.
pub type NamedTensors = BTreeMap<String, Tensor>;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    F32,
    F64,
    I32,
    I64,
    U8,
    Bool,
}

impl ElementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
            ElementType::I32 => "i32",
            ElementType::I64 => "i64",
            ElementType::U8 => "u8",
            ElementType::Bool => "bool",
        }
    }

    /// Size of a single element in bytes.
    pub fn size_bytes(&self) -> usize {
        match self {
            ElementType::F32 | ElementType::I32 => 4,
            ElementType::F64 | ElementType::I64 => 8,
            ElementType::U8 | ElementType::Bool => 1,
        }
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flat, row-major tensor storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "dtype", content = "values", rename_all = "lowercase")]
pub enum TensorData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I32(Vec<i32>),
    I64(Vec<i64>),
    U8(Vec<u8>),
    Bool(Vec<bool>),
}

impl TensorData {
    pub fn element_type(&self) -> ElementType {
        match self {
            TensorData::F32(_) => ElementType::F32,
            TensorData::F64(_) => ElementType::F64,
            TensorData::I32(_) => ElementType::I32,
            TensorData::I64(_) => ElementType::I64,
            TensorData::U8(_) => ElementType::U8,
            TensorData::Bool(_) => ElementType::Bool,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::F64(v) => v.len(),
            TensorData::I32(v) => v.len(),
            TensorData::I64(v) => v.len(),
            TensorData::U8(v) => v.len(),
            TensorData::Bool(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Widen numeric data to `f64` for executors that compute in floating point.
    ///
    /// Returns `None` for boolean tensors.
    pub fn to_f64(&self) -> Option<Vec<f64>> {
        match self {
            TensorData::F32(v) => Some(v.iter().map(|x| *x as f64).collect()),
            TensorData::F64(v) => Some(v.clone()),
            TensorData::I32(v) => Some(v.iter().map(|x| *x as f64).collect()),
            TensorData::I64(v) => Some(v.iter().map(|x| *x as f64).collect()),
            TensorData::U8(v) => Some(v.iter().map(|x| *x as f64).collect()),
            TensorData::Bool(_) => None,
        }
    }
}

/// A dense tensor: a concrete shape plus its flat data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<u64>,
    pub data: TensorData,
}

/// Construction errors for [`Tensor`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
    #[error("shape {shape:?} holds {expected} elements but {actual} were supplied")]
    ElementCount {
        shape: Vec<u64>,
        expected: u64,
        actual: u64,
    },

    #[error("shape {shape:?} is too large")]
    ShapeOverflow { shape: Vec<u64> },
}

impl Tensor {
    /// Create a tensor, checking that the data fills the shape exactly.
    pub fn new(shape: Vec<u64>, data: TensorData) -> Result<Self, TensorError> {
        let Some(expected) = element_count(&shape) else {
            return Err(TensorError::ShapeOverflow { shape });
        };
        let actual = data.len() as u64;
        if expected != actual {
            return Err(TensorError::ElementCount {
                shape,
                expected,
                actual,
            });
        }
        Ok(Self { shape, data })
    }

    /// Convenience constructor for `f32` tensors.
    pub fn f32(shape: Vec<u64>, values: Vec<f32>) -> Result<Self, TensorError> {
        Self::new(shape, TensorData::F32(values))
    }

    pub fn element_type(&self) -> ElementType {
        self.data.element_type()
    }

    /// Number of elements the shape describes, `None` if it overflows `u64`.
    pub fn element_count(&self) -> Option<u64> {
        element_count(&self.shape)
    }

    /// Values as `f32`, when the tensor stores `f32`.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::F32(v) => Some(v),
            _ => None,
        }
    }
}

fn element_count(shape: &[u64]) -> Option<u64> {
    shape.iter().try_fold(1u64, |acc, dim| acc.checked_mul(*dim))
}

/// Declared tensor in a model schema. `None` in the shape is a wildcard
/// dimension (any size is accepted on that axis).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub name: String,
    pub dtype: ElementType,
    pub shape: Vec<Option<u64>>,
}

impl TensorSpec {
    pub fn new(name: impl Into<String>, dtype: ElementType, shape: Vec<Option<u64>>) -> Self {
        Self {
            name: name.into(),
            dtype,
            shape,
        }
    }

    /// Check a tensor against this spec.
    pub fn check(&self, tensor: &Tensor) -> Result<(), SchemaViolation> {
        if tensor.element_type() != self.dtype {
            return Err(SchemaViolation::DtypeMismatch {
                name: self.name.clone(),
                expected: self.dtype,
                actual: tensor.element_type(),
            });
        }

        if tensor.shape.len() != self.shape.len() {
            return Err(SchemaViolation::RankMismatch {
                name: self.name.clone(),
                expected: self.shape.len(),
                actual: tensor.shape.len(),
            });
        }

        for (axis, (declared, actual)) in self.shape.iter().zip(&tensor.shape).enumerate() {
            if let Some(expected) = declared {
                if expected != actual {
                    return Err(SchemaViolation::DimMismatch {
                        name: self.name.clone(),
                        axis,
                        expected: *expected,
                        actual: *actual,
                    });
                }
            }
        }

        let declared = tensor
            .element_count()
            .ok_or_else(|| SchemaViolation::ShapeOverflow {
                name: self.name.clone(),
                shape: tensor.shape.clone(),
            })?;
        let supplied = tensor.data.len() as u64;
        if declared != supplied {
            return Err(SchemaViolation::ElementCount {
                name: self.name.clone(),
                expected: declared,
                actual: supplied,
            });
        }

        Ok(())
    }
}

/// Ways a set of named tensors can violate a schema.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaViolation {
    #[error("missing tensor '{name}'")]
    Missing { name: String },

    #[error("unexpected tensor '{name}'")]
    Unexpected { name: String },

    #[error("tensor '{name}' has dtype {actual}, expected {expected}")]
    DtypeMismatch {
        name: String,
        expected: ElementType,
        actual: ElementType,
    },

    #[error("tensor '{name}' has rank {actual}, expected {expected}")]
    RankMismatch {
        name: String,
        expected: usize,
        actual: usize,
    },

    #[error("tensor '{name}' axis {axis} has size {actual}, expected {expected}")]
    DimMismatch {
        name: String,
        axis: usize,
        expected: u64,
        actual: u64,
    },

    #[error("tensor '{name}' shape {shape:?} is too large")]
    ShapeOverflow { name: String, shape: Vec<u64> },

    #[error("tensor '{name}' shape holds {expected} elements but carries {actual}")]
    ElementCount {
        name: String,
        expected: u64,
        actual: u64,
    },
}

/// Validate a full set of named tensors against the declared specs.
///
/// Every declared tensor must be present and no undeclared tensor may appear.
pub fn validate_tensors(specs: &[TensorSpec], tensors: &NamedTensors) -> Result<(), SchemaViolation> {
    for spec in specs {
        let tensor = tensors.get(&spec.name).ok_or_else(|| SchemaViolation::Missing {
            name: spec.name.clone(),
        })?;
        spec.check(tensor)?;
    }

    if let Some(extra) = tensors
        .keys()
        .find(|name| !specs.iter().any(|spec| &spec.name == *name))
    {
        return Err(SchemaViolation::Unexpected {
            name: extra.clone(),
        });
    }

    Ok(())
}
