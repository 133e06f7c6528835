//! Weight transfer from a checkpoint into a sequential model
//!
//! Each [`WeightBinding`] copies one checkpoint tensor into one layer
//! parameter, converting from the source layout (PyTorch) to the mobile
//! layout (TFLite) on the way. Parameters without a binding are
//! zero-initialized so the serialized model is always complete and
//! deterministic.

use crate::checkpoint::Checkpoint;
use crate::error::TransferError;
use crate::graph::{LayerKind, ParamSpec, Sequential};
use crate::types::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub use crate::graph::Param;

/// Copy checkpoint tensor `source` into `param` of layer `layer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WeightBinding {
    pub source: String,
    pub layer: String,
    pub param: Param,
}

impl WeightBinding {
    pub fn new(source: impl Into<String>, layer: impl Into<String>, param: Param) -> Self {
        Self {
            source: source.into(),
            layer: layer.into(),
            param,
        }
    }
}

/// Source-to-target layout conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Same element order
    Identity,
    /// Axis permutation of a rank-4 tensor: output axis `i` is input axis `axes[i]`
    Permute([usize; 4]),
}

impl Layout {
    /// Layout conversion for a parameter of the given layer kind
    pub fn for_param(kind: &LayerKind, param: Param) -> Self {
        match (kind, param) {
            // OIHW -> OHWI
            (LayerKind::Conv2D { .. }, Param::Kernel) => Layout::Permute([0, 2, 3, 1]),
            // [C*M, 1, kh, kw] -> [1, kh, kw, C*M]
            (LayerKind::DepthwiseConv2D { .. }, Param::Kernel) => Layout::Permute([1, 2, 3, 0]),
            _ => Layout::Identity,
        }
    }

    /// Target shape for a source shape
    pub fn target_shape(&self, shape: &[usize]) -> Option<Vec<usize>> {
        match self {
            Layout::Identity => Some(shape.to_vec()),
            Layout::Permute(axes) => {
                if shape.len() != 4 {
                    return None;
                }
                Some(axes.iter().map(|&a| shape[a]).collect())
            }
        }
    }
}

/// Outcome of a weight transfer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferReport {
    /// `layer/param` slots filled from the checkpoint
    pub bound: Vec<String>,
    /// `layer/param` slots filled with zeros
    pub zero_initialized: Vec<String>,
    /// Checkpoint tensors no binding referenced
    pub unused: Vec<String>,
}

impl TransferReport {
    pub fn is_complete(&self) -> bool {
        self.zero_initialized.is_empty()
    }
}

/// Permute the axes of a dense row-major tensor
///
/// Output axis `i` takes input axis `axes[i]`. Returns the permuted values
/// and the permuted shape.
pub fn permute<T: Copy>(values: &[T], shape: &[usize], axes: &[usize]) -> (Vec<T>, Vec<usize>) {
    let rank = shape.len();
    debug_assert_eq!(axes.len(), rank);
    debug_assert_eq!(values.len(), shape.iter().product::<usize>());

    let out_shape: Vec<usize> = axes.iter().map(|&a| shape[a]).collect();

    // Row-major strides of the input, reordered to output axis order
    let mut in_strides = vec![1usize; rank];
    for i in (0..rank.saturating_sub(1)).rev() {
        in_strides[i] = in_strides[i + 1] * shape[i + 1];
    }
    let strides: Vec<usize> = axes.iter().map(|&a| in_strides[a]).collect();

    let mut out = Vec::with_capacity(values.len());
    let mut index = vec![0usize; rank];
    for _ in 0..values.len() {
        let offset: usize = index.iter().zip(&strides).map(|(i, s)| i * s).sum();
        out.push(values[offset]);

        // Advance the output multi-index
        for axis in (0..rank).rev() {
            index[axis] += 1;
            if index[axis] < out_shape[axis] {
                break;
            }
            index[axis] = 0;
        }
    }

    (out, out_shape)
}

/// Copy checkpoint tensors into model parameters
pub fn transfer_weights(
    model: &mut Sequential,
    checkpoint: &Checkpoint,
    bindings: &[WeightBinding],
) -> Result<TransferReport, TransferError> {
    let specs = model.param_specs()?;
    let mut report = TransferReport::default();
    let mut filled = HashSet::new();
    let mut used_sources = HashSet::new();

    for binding in bindings {
        let spec = find_spec(model, &specs, binding)?;

        if !filled.insert((binding.layer.clone(), binding.param)) {
            return Err(TransferError::DuplicateBinding {
                layer: binding.layer.clone(),
                param: binding.param.to_string(),
            });
        }

        let source = checkpoint
            .get(&binding.source)
            .ok_or_else(|| TransferError::MissingSource(binding.source.clone()))?;

        let tensor = convert_tensor(model, spec, source)?;
        tracing::debug!(
            source = %binding.source,
            target = %tensor.name,
            shape = ?tensor.shape,
            "transferred tensor"
        );

        if let Some(layer) = model.layer_mut(&binding.layer) {
            layer.set_param(binding.param, tensor);
        }
        used_sources.insert(binding.source.as_str());
        report.bound.push(format!("{}/{}", binding.layer, binding.param));
    }

    for spec in &specs {
        if filled.contains(&(spec.layer.clone(), spec.param)) {
            continue;
        }
        let name = format!("{}/{}", spec.layer, spec.param);
        tracing::warn!(parameter = %name, "no weights bound; zero-initializing");
        let zeros = Tensor::zeros(name.clone(), spec.shape.clone()).ok_or_else(|| {
            TransferError::MalformedTensor {
                name: name.clone(),
                reason: format!("shape {:?} is too large", spec.shape),
            }
        })?;
        if let Some(layer) = model.layer_mut(&spec.layer) {
            layer.set_param(spec.param, zeros);
        }
        report.zero_initialized.push(name);
    }

    report.unused = checkpoint
        .names()
        .filter(|n| !used_sources.contains(n))
        .map(str::to_string)
        .collect();
    if !report.unused.is_empty() {
        tracing::debug!(count = report.unused.len(), "checkpoint tensors left unused");
    }

    Ok(report)
}

fn find_spec<'a>(
    model: &Sequential,
    specs: &'a [ParamSpec],
    binding: &WeightBinding,
) -> Result<&'a ParamSpec, TransferError> {
    if model.layer(&binding.layer).is_none() {
        return Err(TransferError::UnknownLayer(binding.layer.clone()));
    }
    specs
        .iter()
        .find(|s| s.layer == binding.layer && s.param == binding.param)
        .ok_or_else(|| TransferError::UnknownParam {
            layer: binding.layer.clone(),
            param: binding.param.to_string(),
        })
}

/// Convert a source tensor to the target parameter's layout and dtype
fn convert_tensor(
    model: &Sequential,
    spec: &ParamSpec,
    source: &Tensor,
) -> Result<Tensor, TransferError> {
    if !source.dtype.is_float() {
        return Err(TransferError::UnsupportedDType {
            name: source.name.clone(),
            dtype: source.dtype,
        });
    }

    let values = source
        .to_f32_vec()
        .ok_or_else(|| TransferError::MalformedTensor {
            name: source.name.clone(),
            reason: format!(
                "{} bytes of data for shape {:?}",
                source.data.len(),
                source.shape
            ),
        })?;

    let kind = model
        .layer(&spec.layer)
        .map(|l| &l.kind)
        .ok_or_else(|| TransferError::UnknownLayer(spec.layer.clone()))?;
    let layout = Layout::for_param(kind, spec.param);

    let mismatch = || TransferError::ShapeMismatch {
        source_name: source.name.clone(),
        expected: spec.shape.clone(),
        got: source.shape.clone(),
    };

    let target_shape = layout.target_shape(&source.shape).ok_or_else(mismatch)?;
    if target_shape != spec.shape {
        return Err(mismatch());
    }

    let values = match layout {
        Layout::Identity => values,
        Layout::Permute(axes) => permute(&values, &source.shape, &axes).0,
    };

    Ok(Tensor::from_f32(
        format!("{}/{}", spec.layer, spec.param),
        target_shape,
        &values,
    ))
}
