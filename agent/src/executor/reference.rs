//! Built-in executor for the small artifact kinds the catalog can describe
//! inline: element-wise affine maps and a single dense layer with optional
//! softmax.

use super::types::{CancelSignal, ExecutorError, ExecutorResult, LoadedModel, ModelExecutor};
use infermesh_common::{
    ElementType, ModelArtifact, ModelVersion, NamedTensors, Tensor, TensorData, TensorSpec,
};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceExecutor;

impl ReferenceExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl ModelExecutor for ReferenceExecutor {
    fn load(&self, model: &ModelVersion) -> ExecutorResult<Arc<dyn LoadedModel>> {
        let (input, output) = single_io(model)?;

        let loaded: Arc<dyn LoadedModel> = match &model.artifact {
            ModelArtifact::Affine { scale, bias } => Arc::new(Affine {
                input,
                output,
                scale: *scale,
                bias: *bias,
            }),
            ModelArtifact::Dense {
                weights,
                bias,
                softmax,
            } => Arc::new(Dense::new(input, output, weights.clone(), bias.clone(), *softmax)?),
            ModelArtifact::External { uri } => {
                return Err(ExecutorError::UnsupportedArtifact(format!(
                    "reference executor cannot load {}",
                    uri
                )))
            }
        };

        debug!(model = %model.model_ref(), "Reference model loaded");
        Ok(loaded)
    }
}

/// Both artifact kinds map exactly one float input to one float output.
fn single_io(model: &ModelVersion) -> ExecutorResult<(String, TensorSpec)> {
    let schema = &model.schema;
    if schema.inputs.len() != 1 || schema.outputs.len() != 1 {
        return Err(ExecutorError::InvalidArtifact(format!(
            "expected one input and one output, schema declares {} and {}",
            schema.inputs.len(),
            schema.outputs.len()
        )));
    }
    let output = schema.outputs[0].clone();
    if !matches!(output.dtype, ElementType::F32 | ElementType::F64) {
        return Err(ExecutorError::InvalidArtifact(format!(
            "output '{}' must be f32 or f64, not {}",
            output.name, output.dtype
        )));
    }
    Ok((schema.inputs[0].name.clone(), output))
}

fn input_values<'a>(inputs: &'a NamedTensors, name: &str) -> ExecutorResult<(&'a Tensor, Vec<f64>)> {
    let tensor = inputs
        .get(name)
        .ok_or_else(|| ExecutorError::InvalidInput(format!("missing tensor '{}'", name)))?;
    let values = tensor
        .data
        .to_f64()
        .ok_or_else(|| ExecutorError::InvalidInput(format!("tensor '{}' is not numeric", name)))?;
    Ok((tensor, values))
}

fn output_tensor(spec: &TensorSpec, shape: Vec<u64>, values: Vec<f64>) -> ExecutorResult<NamedTensors> {
    let data = match spec.dtype {
        ElementType::F32 => TensorData::F32(values.into_iter().map(|v| v as f32).collect()),
        _ => TensorData::F64(values),
    };
    let tensor = Tensor::new(shape, data).map_err(|e| ExecutorError::Inference(e.to_string()))?;

    let mut outputs = NamedTensors::new();
    outputs.insert(spec.name.clone(), tensor);
    Ok(outputs)
}

struct Affine {
    input: String,
    output: TensorSpec,
    scale: f64,
    bias: f64,
}

impl LoadedModel for Affine {
    fn run(&self, inputs: &NamedTensors, cancel: &CancelSignal) -> ExecutorResult<NamedTensors> {
        cancel.check()?;
        let (tensor, values) = input_values(inputs, &self.input)?;
        let values: Vec<f64> = values.iter().map(|x| self.scale * x + self.bias).collect();
        output_tensor(&self.output, tensor.shape.clone(), values)
    }
}

struct Dense {
    input: String,
    output: TensorSpec,
    weights: Vec<Vec<f64>>,
    bias: Vec<f64>,
    softmax: bool,
}

impl Dense {
    fn new(
        input: String,
        output: TensorSpec,
        weights: Vec<Vec<f64>>,
        bias: Vec<f64>,
        softmax: bool,
    ) -> ExecutorResult<Self> {
        let features = weights.first().map(Vec::len).unwrap_or(0);
        if weights.is_empty() || features == 0 {
            return Err(ExecutorError::InvalidArtifact("dense weights are empty".into()));
        }
        if weights.iter().any(|row| row.len() != features) {
            return Err(ExecutorError::InvalidArtifact(
                "dense weight rows differ in length".into(),
            ));
        }
        if bias.len() != weights.len() {
            return Err(ExecutorError::InvalidArtifact(format!(
                "dense bias has {} entries for {} output units",
                bias.len(),
                weights.len()
            )));
        }
        Ok(Self {
            input,
            output,
            weights,
            bias,
            softmax,
        })
    }

    fn features(&self) -> usize {
        self.weights[0].len()
    }
}

impl LoadedModel for Dense {
    fn run(&self, inputs: &NamedTensors, cancel: &CancelSignal) -> ExecutorResult<NamedTensors> {
        cancel.check()?;
        let (tensor, values) = input_values(inputs, &self.input)?;

        let features = self.features();
        let (batch, width) = match tensor.shape.as_slice() {
            [batch, width] => (*batch as usize, *width as usize),
            [width] => (1, *width as usize),
            shape => {
                return Err(ExecutorError::InvalidInput(format!(
                    "dense input must be rank 1 or 2, got shape {:?}",
                    shape
                )))
            }
        };
        if width != features {
            return Err(ExecutorError::InvalidInput(format!(
                "dense layer expects {} features, input has {}",
                features, width
            )));
        }

        let units = self.weights.len();
        let mut out = Vec::with_capacity(batch * units);
        for row in values.chunks(features) {
            cancel.check()?;
            let start = out.len();
            out.extend(
                self.weights
                    .iter()
                    .zip(&self.bias)
                    .map(|(w, b)| w.iter().zip(row).map(|(w, x)| w * x).sum::<f64>() + b),
            );
            if self.softmax {
                softmax_in_place(&mut out[start..]);
            }
        }

        let shape = if tensor.shape.len() == 1 {
            vec![units as u64]
        } else {
            vec![batch as u64, units as u64]
        };
        output_tensor(&self.output, shape, out)
    }
}

fn softmax_in_place(values: &mut [f64]) {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in values.iter_mut() {
        *v /= sum;
    }
}
