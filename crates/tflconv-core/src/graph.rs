//! Sequential layer graph
//!
//! The target model is a linear list of layers applied to a single NHWC
//! input. Shapes are inferred layer by layer; parametric layers own their
//! kernel and bias tensors in mobile (TFLite) layout once weights have been
//! transferred.

use crate::error::GraphError;
use crate::types::{DataType, Tensor};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default input: 512x512 RGB image plus a 1-channel mask
pub const DEFAULT_INPUT_SHAPE: [usize; 3] = [512, 512, 4];

/// Model input description (shape excludes the batch dimension)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSpec {
    pub shape: Vec<usize>,
    pub batch_size: usize,
    pub dtype: DataType,
}

impl InputSpec {
    pub fn new(shape: Vec<usize>) -> Self {
        Self {
            shape,
            ..Default::default()
        }
    }

    /// Full shape including the batch dimension
    pub fn full_shape(&self) -> Vec<usize> {
        let mut shape = Vec::with_capacity(self.shape.len() + 1);
        shape.push(self.batch_size);
        shape.extend_from_slice(&self.shape);
        shape
    }

    fn validate(&self) -> Result<(), GraphError> {
        if self.shape.is_empty() {
            return Err(GraphError::InvalidInput("input shape is empty".into()));
        }
        if self.shape.contains(&0) {
            return Err(GraphError::InvalidInput(format!(
                "input shape {:?} has a zero dimension",
                self.shape
            )));
        }
        if self.batch_size == 0 {
            return Err(GraphError::InvalidInput("batch size must be at least 1".into()));
        }
        if self.dtype != DataType::Float32 {
            return Err(GraphError::InvalidInput(format!(
                "only f32 inputs are supported, got {}",
                self.dtype.name()
            )));
        }
        Ok(())
    }
}

impl Default for InputSpec {
    fn default() -> Self {
        Self {
            shape: DEFAULT_INPUT_SHAPE.to_vec(),
            batch_size: 1,
            dtype: DataType::Float32,
        }
    }
}

/// Spatial padding mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Padding {
    Same,
    #[default]
    Valid,
}

/// Activation applied after a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    #[default]
    Linear,
    Relu,
    Relu6,
    Sigmoid,
    Tanh,
}

/// Layer parameter slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Param {
    Kernel,
    Bias,
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Kernel => f.write_str("kernel"),
            Param::Bias => f.write_str("bias"),
        }
    }
}

fn one_pair() -> [usize; 2] {
    [1, 1]
}

fn two_pair() -> [usize; 2] {
    [2, 2]
}

fn default_true() -> bool {
    true
}

fn default_alpha() -> f32 {
    0.2
}

/// Layer kinds, with the usual framework defaults when read from a config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LayerKind {
    #[serde(rename = "conv2d")]
    Conv2D {
        filters: usize,
        kernel_size: [usize; 2],
        #[serde(default = "one_pair")]
        strides: [usize; 2],
        #[serde(default)]
        padding: Padding,
        #[serde(default = "one_pair")]
        dilation: [usize; 2],
        #[serde(default = "default_true")]
        use_bias: bool,
        #[serde(default)]
        activation: Activation,
    },
    #[serde(rename = "depthwise_conv2d")]
    DepthwiseConv2D {
        kernel_size: [usize; 2],
        #[serde(default = "one")]
        depth_multiplier: usize,
        #[serde(default = "one_pair")]
        strides: [usize; 2],
        #[serde(default)]
        padding: Padding,
        #[serde(default = "one_pair")]
        dilation: [usize; 2],
        #[serde(default = "default_true")]
        use_bias: bool,
        #[serde(default)]
        activation: Activation,
    },
    #[serde(rename = "dense")]
    Dense {
        units: usize,
        #[serde(default = "default_true")]
        use_bias: bool,
        #[serde(default)]
        activation: Activation,
    },
    #[serde(rename = "max_pool2d")]
    MaxPool2D {
        #[serde(default = "two_pair")]
        pool_size: [usize; 2],
        #[serde(default)]
        strides: Option<[usize; 2]>,
        #[serde(default)]
        padding: Padding,
    },
    #[serde(rename = "avg_pool2d")]
    AvgPool2D {
        #[serde(default = "two_pair")]
        pool_size: [usize; 2],
        #[serde(default)]
        strides: Option<[usize; 2]>,
        #[serde(default)]
        padding: Padding,
    },
    #[serde(rename = "relu")]
    Relu,
    #[serde(rename = "relu6")]
    Relu6,
    #[serde(rename = "sigmoid")]
    Sigmoid,
    #[serde(rename = "tanh")]
    Tanh,
    #[serde(rename = "leaky_relu")]
    LeakyRelu {
        #[serde(default = "default_alpha")]
        alpha: f32,
    },
}

fn one() -> usize {
    1
}

impl LayerKind {
    /// Kind name as written in config files
    pub fn type_name(&self) -> &'static str {
        match self {
            LayerKind::Conv2D { .. } => "conv2d",
            LayerKind::DepthwiseConv2D { .. } => "depthwise_conv2d",
            LayerKind::Dense { .. } => "dense",
            LayerKind::MaxPool2D { .. } => "max_pool2d",
            LayerKind::AvgPool2D { .. } => "avg_pool2d",
            LayerKind::Relu => "relu",
            LayerKind::Relu6 => "relu6",
            LayerKind::Sigmoid => "sigmoid",
            LayerKind::Tanh => "tanh",
            LayerKind::LeakyRelu { .. } => "leaky_relu",
        }
    }

    fn validate(&self) -> Result<(), String> {
        let positive = |what: &str, values: &[usize]| {
            if values.contains(&0) {
                Err(format!("{} must be positive, got {:?}", what, values))
            } else {
                Ok(())
            }
        };

        match self {
            LayerKind::Conv2D {
                filters,
                kernel_size,
                strides,
                dilation,
                ..
            } => {
                positive("filters", &[*filters])?;
                positive("kernel_size", kernel_size)?;
                positive("strides", strides)?;
                positive("dilation", dilation)
            }
            LayerKind::DepthwiseConv2D {
                kernel_size,
                depth_multiplier,
                strides,
                dilation,
                ..
            } => {
                positive("depth_multiplier", &[*depth_multiplier])?;
                positive("kernel_size", kernel_size)?;
                positive("strides", strides)?;
                positive("dilation", dilation)
            }
            LayerKind::Dense { units, .. } => positive("units", &[*units]),
            LayerKind::MaxPool2D {
                pool_size, strides, ..
            }
            | LayerKind::AvgPool2D {
                pool_size, strides, ..
            } => {
                positive("pool_size", pool_size)?;
                positive("strides", &strides.unwrap_or(*pool_size))
            }
            LayerKind::LeakyRelu { alpha } if !alpha.is_finite() => {
                Err(format!("alpha must be finite, got {}", alpha))
            }
            _ => Ok(()),
        }
    }
}

/// Output length of one spatial dimension
///
/// `None` when the (dilated) window does not fit the input.
fn spatial_output(
    input: usize,
    kernel: usize,
    stride: usize,
    dilation: usize,
    padding: Padding,
) -> Option<usize> {
    match padding {
        Padding::Same => Some(input.div_ceil(stride)),
        Padding::Valid => {
            let effective = (kernel - 1).checked_mul(dilation)?.checked_add(1)?;
            if input < effective {
                None
            } else {
                Some((input - effective) / stride + 1)
            }
        }
    }
}

/// One layer of a sequential model
#[derive(Debug, Clone, PartialEq)]
pub struct Layer {
    pub name: String,
    pub kind: LayerKind,
    /// Kernel in mobile layout (OHWI for convolutions, [out, in] for dense)
    pub kernel: Option<Tensor>,
    pub bias: Option<Tensor>,
}

impl Layer {
    pub fn new(name: impl Into<String>, kind: LayerKind) -> Self {
        Self {
            name: name.into(),
            kind,
            kernel: None,
            bias: None,
        }
    }

    pub fn param(&self, param: Param) -> Option<&Tensor> {
        match param {
            Param::Kernel => self.kernel.as_ref(),
            Param::Bias => self.bias.as_ref(),
        }
    }

    pub fn set_param(&mut self, param: Param, tensor: Tensor) {
        match param {
            Param::Kernel => self.kernel = Some(tensor),
            Param::Bias => self.bias = Some(tensor),
        }
    }

    /// Output shape for a given full (batched) input shape
    pub fn output_shape(&self, input: &[usize]) -> Result<Vec<usize>, GraphError> {
        let fail = |reason: String| GraphError::ShapeInference {
            layer: self.name.clone(),
            reason,
        };

        let nhwc = |input: &[usize]| -> Result<[usize; 4], GraphError> {
            match input {
                [n, h, w, c] => Ok([*n, *h, *w, *c]),
                _ => Err(fail(format!(
                    "expected a rank-4 NHWC input, got shape {:?}",
                    input
                ))),
            }
        };

        let spatial = |[n, h, w, _]: [usize; 4],
                       kernel: [usize; 2],
                       strides: [usize; 2],
                       dilation: [usize; 2],
                       padding: Padding,
                       channels: usize| {
            let out_h = spatial_output(h, kernel[0], strides[0], dilation[0], padding);
            let out_w = spatial_output(w, kernel[1], strides[1], dilation[1], padding);
            match (out_h, out_w) {
                (Some(out_h), Some(out_w)) => Ok(vec![n, out_h, out_w, channels]),
                _ => Err(fail(format!(
                    "window {:?} does not fit input {}x{} with valid padding",
                    kernel, h, w
                ))),
            }
        };

        match &self.kind {
            LayerKind::Conv2D {
                filters,
                kernel_size,
                strides,
                padding,
                dilation,
                ..
            } => spatial(
                nhwc(input)?,
                *kernel_size,
                *strides,
                *dilation,
                *padding,
                *filters,
            ),
            LayerKind::DepthwiseConv2D {
                kernel_size,
                depth_multiplier,
                strides,
                padding,
                dilation,
                ..
            } => {
                let shape = nhwc(input)?;
                let channels = shape[3].checked_mul(*depth_multiplier).ok_or_else(|| {
                    fail(format!(
                        "{} channels times depth multiplier {} overflows",
                        shape[3], depth_multiplier
                    ))
                })?;
                spatial(
                    shape,
                    *kernel_size,
                    *strides,
                    *dilation,
                    *padding,
                    channels,
                )
            }
            LayerKind::Dense { units, .. } => {
                if input.len() < 2 {
                    return Err(fail(format!(
                        "dense needs at least a rank-2 input, got {:?}",
                        input
                    )));
                }
                let mut shape = input.to_vec();
                let last = shape.len() - 1;
                shape[last] = *units;
                Ok(shape)
            }
            LayerKind::MaxPool2D {
                pool_size,
                strides,
                padding,
            }
            | LayerKind::AvgPool2D {
                pool_size,
                strides,
                padding,
            } => {
                let shape = nhwc(input)?;
                spatial(
                    shape,
                    *pool_size,
                    strides.unwrap_or(*pool_size),
                    [1, 1],
                    *padding,
                    shape[3],
                )
            }
            LayerKind::Relu
            | LayerKind::Relu6
            | LayerKind::Sigmoid
            | LayerKind::Tanh
            | LayerKind::LeakyRelu { .. } => Ok(input.to_vec()),
        }
    }

    /// Parameters this layer owns and their expected mobile-layout shapes
    ///
    /// Fails if a parameter would not fit in memory as f32 data.
    pub fn param_shapes(&self, input: &[usize]) -> Result<Vec<(Param, Vec<usize>)>, GraphError> {
        let fail = |reason: String| GraphError::ShapeInference {
            layer: self.name.clone(),
            reason,
        };
        let channels = || {
            input
                .last()
                .copied()
                .ok_or_else(|| fail("input has no channel dimension".into()))
        };

        let with_bias = |kernel: Vec<usize>, bias: usize, use_bias: bool| {
            let mut params = vec![(Param::Kernel, kernel)];
            if use_bias {
                params.push((Param::Bias, vec![bias]));
            }
            params
        };

        let params = match &self.kind {
            LayerKind::Conv2D {
                filters,
                kernel_size,
                use_bias,
                ..
            } => with_bias(
                vec![*filters, kernel_size[0], kernel_size[1], channels()?],
                *filters,
                *use_bias,
            ),
            LayerKind::DepthwiseConv2D {
                kernel_size,
                depth_multiplier,
                use_bias,
                ..
            } => {
                let out = channels()?
                    .checked_mul(*depth_multiplier)
                    .ok_or_else(|| fail("depthwise output channels overflow".into()))?;
                with_bias(vec![1, kernel_size[0], kernel_size[1], out], out, *use_bias)
            }
            LayerKind::Dense {
                units, use_bias, ..
            } => with_bias(vec![*units, channels()?], *units, *use_bias),
            _ => Vec::new(),
        };

        for (param, shape) in &params {
            if DataType::Float32.byte_len(shape).is_none() {
                return Err(fail(format!("{} shape {:?} is too large", param, shape)));
            }
        }

        Ok(params)
    }
}

/// Expected shape of one layer parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub layer: String,
    pub param: Param,
    pub shape: Vec<usize>,
}

/// A linear stack of layers over one input
#[derive(Debug, Clone, PartialEq)]
pub struct Sequential {
    name: String,
    input: InputSpec,
    layers: Vec<Layer>,
}

impl Sequential {
    /// Create an empty model; an empty model is the identity on its input
    pub fn new(name: impl Into<String>, input: InputSpec) -> Result<Self, GraphError> {
        input.validate()?;
        Ok(Self {
            name: name.into(),
            input,
            layers: Vec::new(),
        })
    }

    /// Append a layer, validating its configuration and output shape
    pub fn add(&mut self, layer: Layer) -> Result<&mut Self, GraphError> {
        if layer.name.is_empty() {
            return Err(GraphError::InvalidLayer {
                layer: layer.name,
                reason: "layer name is empty".into(),
            });
        }
        if self.layer(&layer.name).is_some() {
            return Err(GraphError::DuplicateLayer(layer.name));
        }
        layer
            .kind
            .validate()
            .map_err(|reason| GraphError::InvalidLayer {
                layer: layer.name.clone(),
                reason,
            })?;

        let input = self.output_shape()?;
        layer.output_shape(&input)?;
        layer.param_shapes(&input)?;

        self.layers.push(layer);
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input(&self) -> &InputSpec {
        &self.input
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.iter().find(|l| l.name == name)
    }

    pub fn layer_mut(&mut self, name: &str) -> Option<&mut Layer> {
        self.layers.iter_mut().find(|l| l.name == name)
    }

    /// Input shape of every layer followed by the model output shape
    pub fn shapes(&self) -> Result<Vec<Vec<usize>>, GraphError> {
        let mut shapes = Vec::with_capacity(self.layers.len() + 1);
        let mut current = self.input.full_shape();
        for layer in &self.layers {
            let next = layer.output_shape(&current)?;
            shapes.push(current);
            current = next;
        }
        shapes.push(current);
        Ok(shapes)
    }

    pub fn output_shape(&self) -> Result<Vec<usize>, GraphError> {
        let mut current = self.input.full_shape();
        for layer in &self.layers {
            current = layer.output_shape(&current)?;
        }
        Ok(current)
    }

    /// Every parameter slot of the model in layer order
    pub fn param_specs(&self) -> Result<Vec<ParamSpec>, GraphError> {
        let shapes = self.shapes()?;
        let mut specs = Vec::new();
        for (layer, input) in self.layers.iter().zip(&shapes) {
            for (param, shape) in layer.param_shapes(input)? {
                specs.push(ParamSpec {
                    layer: layer.name.clone(),
                    param,
                    shape,
                });
            }
        }
        Ok(specs)
    }

    /// Number of parameter elements currently held by the layers
    pub fn parameter_count(&self) -> usize {
        self.layers
            .iter()
            .flat_map(|l| [l.kernel.as_ref(), l.bias.as_ref()])
            .flatten()
            .map(Tensor::num_elements)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conv(filters: usize, kernel: usize, stride: usize, padding: Padding) -> LayerKind {
        LayerKind::Conv2D {
            filters,
            kernel_size: [kernel, kernel],
            strides: [stride, stride],
            padding,
            dilation: [1, 1],
            use_bias: true,
            activation: Activation::Relu,
        }
    }

    #[test]
    fn test_default_input() {
        let model = Sequential::new("lama", InputSpec::default()).unwrap();
        assert_eq!(model.input().full_shape(), vec![1, 512, 512, 4]);
        assert_eq!(model.output_shape().unwrap(), vec![1, 512, 512, 4]);
        assert!(model.param_specs().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_input_rejected() {
        assert!(Sequential::new("m", InputSpec::new(vec![])).is_err());
        assert!(Sequential::new("m", InputSpec::new(vec![8, 0, 3])).is_err());

        let input = InputSpec {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            Sequential::new("m", input),
            Err(GraphError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_conv_shapes() {
        let mut model = Sequential::new("m", InputSpec::new(vec![32, 32, 4])).unwrap();
        model
            .add(Layer::new("same", conv(8, 3, 2, Padding::Same)))
            .unwrap()
            .add(Layer::new("valid", conv(16, 3, 1, Padding::Valid)))
            .unwrap();

        assert_eq!(model.output_shape().unwrap(), vec![1, 14, 14, 16]);

        let specs = model.param_specs().unwrap();
        assert_eq!(specs.len(), 4);
        assert_eq!(specs[0].shape, vec![8, 3, 3, 4]);
        assert_eq!(specs[1].shape, vec![8]);
        assert_eq!(specs[2].shape, vec![16, 3, 3, 8]);
        assert_eq!(specs[3].param, Param::Bias);
    }

    #[test]
    fn test_depthwise_and_dense_params() {
        let mut model = Sequential::new("m", InputSpec::new(vec![8, 8, 3])).unwrap();
        model
            .add(Layer::new(
                "dw",
                LayerKind::DepthwiseConv2D {
                    kernel_size: [3, 3],
                    depth_multiplier: 2,
                    strides: [1, 1],
                    padding: Padding::Same,
                    dilation: [1, 1],
                    use_bias: false,
                    activation: Activation::Linear,
                },
            ))
            .unwrap()
            .add(Layer::new(
                "fc",
                LayerKind::Dense {
                    units: 10,
                    use_bias: true,
                    activation: Activation::Linear,
                },
            ))
            .unwrap();

        assert_eq!(model.output_shape().unwrap(), vec![1, 8, 8, 10]);
        let specs = model.param_specs().unwrap();
        assert_eq!(specs[0].shape, vec![1, 3, 3, 6]);
        assert_eq!(specs[1].shape, vec![10, 6]);
        assert_eq!(specs[2].shape, vec![10]);
    }

    #[test]
    fn test_pool_defaults_stride_to_pool_size() {
        let mut model = Sequential::new("m", InputSpec::new(vec![16, 16, 2])).unwrap();
        model
            .add(Layer::new(
                "pool",
                LayerKind::MaxPool2D {
                    pool_size: [2, 2],
                    strides: None,
                    padding: Padding::Valid,
                },
            ))
            .unwrap();
        assert_eq!(model.output_shape().unwrap(), vec![1, 8, 8, 2]);
    }

    #[test]
    fn test_kernel_larger_than_input_fails() {
        let mut model = Sequential::new("m", InputSpec::new(vec![2, 2, 1])).unwrap();
        let result = model.add(Layer::new("big", conv(1, 5, 1, Padding::Valid)));
        assert!(matches!(result, Err(GraphError::ShapeInference { .. })));
        assert!(model.layers().is_empty());
    }

    #[test]
    fn test_conv_needs_rank_four() {
        let mut model = Sequential::new("m", InputSpec::new(vec![16])).unwrap();
        let result = model.add(Layer::new("c", conv(1, 1, 1, Padding::Same)));
        assert!(matches!(result, Err(GraphError::ShapeInference { .. })));
    }

    #[test]
    fn test_duplicate_and_invalid_layers() {
        let mut model = Sequential::new("m", InputSpec::default()).unwrap();
        model.add(Layer::new("act", LayerKind::Relu)).unwrap();

        assert!(matches!(
            model.add(Layer::new("act", LayerKind::Tanh)),
            Err(GraphError::DuplicateLayer(_))
        ));
        assert!(matches!(
            model.add(Layer::new("zero", conv(0, 3, 1, Padding::Same))),
            Err(GraphError::InvalidLayer { .. })
        ));
        assert!(matches!(
            model.add(Layer::new("", LayerKind::Relu)),
            Err(GraphError::InvalidLayer { .. })
        ));
    }

    #[test]
    fn test_overflowing_config_is_an_error() {
        let depthwise = |depth_multiplier: usize, dilation: usize| LayerKind::DepthwiseConv2D {
            kernel_size: [3, 3],
            depth_multiplier,
            strides: [1, 1],
            padding: Padding::Valid,
            dilation: [dilation, dilation],
            use_bias: true,
            activation: Activation::Linear,
        };

        let mut model = Sequential::new("m", InputSpec::default()).unwrap();
        assert!(matches!(
            model.add(Layer::new("wide", depthwise(i64::MAX as usize, 1))),
            Err(GraphError::ShapeInference { .. })
        ));
        assert!(matches!(
            model.add(Layer::new("dilated", depthwise(1, usize::MAX))),
            Err(GraphError::ShapeInference { .. })
        ));
        assert!(matches!(
            model.add(Layer::new(
                "huge",
                LayerKind::Dense {
                    units: usize::MAX / 2,
                    use_bias: false,
                    activation: Activation::Linear,
                },
            )),
            Err(GraphError::ShapeInference { .. })
        ));
        assert!(model.layers().is_empty());
    }

    #[test]
    fn test_layer_kind_from_json() {
        let kind: LayerKind = serde_json::from_str(
            r#"{"type": "conv2d", "filters": 64, "kernel_size": [7, 7], "padding": "same"}"#,
        )
        .unwrap();

        match kind {
            LayerKind::Conv2D {
                filters,
                strides,
                padding,
                use_bias,
                activation,
                ..
            } => {
                assert_eq!(filters, 64);
                assert_eq!(strides, [1, 1]);
                assert_eq!(padding, Padding::Same);
                assert!(use_bias);
                assert_eq!(activation, Activation::Linear);
            }
            other => panic!("unexpected kind {:?}", other),
        }

        let relu: LayerKind = serde_json::from_str(r#"{"type": "relu"}"#).unwrap();
        assert_eq!(relu, LayerKind::Relu);
    }
}
