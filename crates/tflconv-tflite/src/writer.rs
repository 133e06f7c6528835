//! TFLite FlatBuffer writer
//!
//! Serialization happens in two steps. [`GraphPlan::from_model`] lowers a
//! [`Sequential`] into flat tensor, buffer and operator tables using TFLite
//! indices; [`TFLiteWriter`] then emits those tables with the FlatBuffers
//! builder. Both steps are deterministic: the same model always produces
//! the same bytes.

use crate::schema::{
    field, fused_activation_code, padding_code, BuiltinOperator, BuiltinOptions, TFLiteDataType,
    TFLITE_EXTENSION, TFLITE_FILE_IDENTIFIER, TFLITE_SCHEMA_VERSION,
};
use flatbuffers::{FlatBufferBuilder, TableFinishedWIPOffset, WIPOffset};
use tflconv_core::{
    Activation, Layer, LayerKind, ModelWriter, Padding, Param, SerializeError, Sequential, Tensor,
};

/// Default `Model.description`
pub const DEFAULT_DESCRIPTION: &str = "tflconv converted.";

/// Default value of the `min_runtime_version` metadata entry
pub const DEFAULT_MIN_RUNTIME_VERSION: &str = "1.14.0";

const MIN_RUNTIME_VERSION_KEY: &str = "min_runtime_version";
const MIN_RUNTIME_VERSION_LEN: usize = 16;

/// Name of the single subgraph
const SUBGRAPH_NAME: &str = "main";

/// Marks an omitted optional operator input
const OPTIONAL_INPUT: i32 = -1;

/// A tensor entry of the plan
#[derive(Debug, Clone, PartialEq)]
pub struct TensorDef {
    pub name: String,
    pub shape: Vec<i32>,
    pub dtype: TFLiteDataType,
    /// Index into [`GraphPlan::buffers`]; 0 is the empty sentinel
    pub buffer: u32,
}

/// Builtin options of one operator
#[derive(Debug, Clone, PartialEq)]
pub enum OptionsDef {
    None,
    Conv2D {
        padding: i8,
        stride_w: i32,
        stride_h: i32,
        activation: i8,
        dilation_w: i32,
        dilation_h: i32,
    },
    DepthwiseConv2D {
        padding: i8,
        stride_w: i32,
        stride_h: i32,
        depth_multiplier: i32,
        activation: i8,
        dilation_w: i32,
        dilation_h: i32,
    },
    FullyConnected {
        activation: i8,
        keep_num_dims: bool,
    },
    Pool2D {
        padding: i8,
        stride_w: i32,
        stride_h: i32,
        filter_w: i32,
        filter_h: i32,
    },
    LeakyRelu {
        alpha: f32,
    },
}

impl OptionsDef {
    pub fn options_type(&self) -> BuiltinOptions {
        match self {
            OptionsDef::None => BuiltinOptions::None,
            OptionsDef::Conv2D { .. } => BuiltinOptions::Conv2DOptions,
            OptionsDef::DepthwiseConv2D { .. } => BuiltinOptions::DepthwiseConv2DOptions,
            OptionsDef::FullyConnected { .. } => BuiltinOptions::FullyConnectedOptions,
            OptionsDef::Pool2D { .. } => BuiltinOptions::Pool2DOptions,
            OptionsDef::LeakyRelu { .. } => BuiltinOptions::LeakyReluOptions,
        }
    }
}

/// An operator entry of the plan
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorDef {
    pub opcode_index: u32,
    pub inputs: Vec<i32>,
    pub outputs: Vec<i32>,
    pub options: OptionsDef,
}

/// A model lowered to TFLite tables
#[derive(Debug, Clone, PartialEq)]
pub struct GraphPlan {
    pub tensors: Vec<TensorDef>,
    pub buffers: Vec<Vec<u8>>,
    pub opcodes: Vec<BuiltinOperator>,
    pub operators: Vec<OperatorDef>,
    pub inputs: Vec<i32>,
    pub outputs: Vec<i32>,
}

impl GraphPlan {
    fn empty() -> Self {
        Self {
            tensors: Vec::new(),
            buffers: vec![Vec::new()],
            opcodes: Vec::new(),
            operators: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Lower a sequential model
    pub fn from_model(model: &Sequential) -> Result<Self, SerializeError> {
        let shapes = model.shapes()?;
        let mut plan = Self::empty();

        let input = plan.add_tensor(
            "serving_default_input:0".to_string(),
            &model.input().full_shape(),
            None,
        )?;
        plan.inputs.push(input);

        let mut current = input;
        for (i, layer) in model.layers().iter().enumerate() {
            let prefix = format!("{}/{}", model.name(), layer.name);
            current = plan.lower_layer(layer, &prefix, current, &shapes[i], &shapes[i + 1])?;
        }

        plan.outputs.push(current);
        Ok(plan)
    }

    /// Total bytes of constant data
    pub fn constant_bytes(&self) -> usize {
        self.buffers.iter().map(Vec::len).sum()
    }

    fn add_tensor(
        &mut self,
        name: String,
        shape: &[usize],
        data: Option<(TFLiteDataType, Vec<u8>)>,
    ) -> Result<i32, SerializeError> {
        let shape = shape
            .iter()
            .map(|&d| {
                i32::try_from(d).map_err(|_| {
                    SerializeError::Failed(format!("dimension {} of {} exceeds i32", d, name))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let (dtype, buffer) = match data {
            Some((dtype, bytes)) => {
                self.buffers.push(bytes);
                (dtype, (self.buffers.len() - 1) as u32)
            }
            None => (TFLiteDataType::Float32, 0),
        };

        self.tensors.push(TensorDef {
            name,
            shape,
            dtype,
            buffer,
        });
        Ok((self.tensors.len() - 1) as i32)
    }

    fn add_constant(&mut self, name: String, tensor: &Tensor) -> Result<i32, SerializeError> {
        let dtype = TFLiteDataType::try_from(tensor.dtype).map_err(|dtype| {
            SerializeError::Failed(format!("{} has unsupported dtype {}", name, dtype.name()))
        })?;
        if !tensor.is_consistent() {
            return Err(SerializeError::Failed(format!(
                "{} has {} bytes for shape {:?}",
                name,
                tensor.data.len(),
                tensor.shape
            )));
        }
        self.add_tensor(name, &tensor.shape, Some((dtype, tensor.data.clone())))
    }

    fn add_operator(
        &mut self,
        op: BuiltinOperator,
        inputs: Vec<i32>,
        outputs: Vec<i32>,
        options: OptionsDef,
    ) {
        let opcode_index = match self.opcodes.iter().position(|o| *o == op) {
            Some(index) => index,
            None => {
                self.opcodes.push(op);
                self.opcodes.len() - 1
            }
        };

        self.operators.push(OperatorDef {
            opcode_index: opcode_index as u32,
            inputs,
            outputs,
            options,
        });
    }

    /// Emit the operators of one layer, returning its output tensor index
    fn lower_layer(
        &mut self,
        layer: &Layer,
        prefix: &str,
        input: i32,
        input_shape: &[usize],
        output_shape: &[usize],
    ) -> Result<i32, SerializeError> {
        let params = layer.param_shapes(input_shape)?;
        let param = |p: Param| checked_param(layer, &params, p);

        // Convolutions always carry a bias input; a missing one is zeros
        let conv_bias =
            |plan: &mut Self, use_bias: bool, channels: usize| -> Result<i32, SerializeError> {
                let name = format!("{}/bias", prefix);
                if use_bias {
                    plan.add_constant(name, param(Param::Bias)?)
                } else {
                    let zeros = Tensor::zeros("bias", vec![channels]).ok_or_else(|| {
                        SerializeError::Failed(format!(
                            "{} bias of {} channels overflows",
                            prefix, channels
                        ))
                    })?;
                    plan.add_constant(name, &zeros)
                }
            };

        let dims = |v: [usize; 2]| -> Result<(i32, i32), SerializeError> {
            Ok((to_i32(v[0])?, to_i32(v[1])?))
        };

        let output = match &layer.kind {
            LayerKind::Conv2D {
                filters,
                strides,
                padding,
                dilation,
                use_bias,
                activation,
                ..
            } => {
                let kernel =
                    self.add_constant(format!("{}/kernel", prefix), param(Param::Kernel)?)?;
                let bias = conv_bias(self, *use_bias, *filters)?;
                let (fused, name) = fused_output(*activation, prefix);
                let out = self.add_tensor(name, output_shape, None)?;
                let (stride_h, stride_w) = dims(*strides)?;
                let (dilation_h, dilation_w) = dims(*dilation)?;
                self.add_operator(
                    BuiltinOperator::Conv2D,
                    vec![input, kernel, bias],
                    vec![out],
                    OptionsDef::Conv2D {
                        padding: padding_code(*padding),
                        stride_w,
                        stride_h,
                        activation: fused,
                        dilation_w,
                        dilation_h,
                    },
                );
                self.finish_activation(*activation, prefix, out, output_shape)?
            }
            LayerKind::DepthwiseConv2D {
                depth_multiplier,
                strides,
                padding,
                dilation,
                use_bias,
                activation,
                ..
            } => {
                let channels = output_shape.last().copied().unwrap_or(0);
                let kernel =
                    self.add_constant(format!("{}/kernel", prefix), param(Param::Kernel)?)?;
                let bias = conv_bias(self, *use_bias, channels)?;
                let (fused, name) = fused_output(*activation, prefix);
                let out = self.add_tensor(name, output_shape, None)?;
                let (stride_h, stride_w) = dims(*strides)?;
                let (dilation_h, dilation_w) = dims(*dilation)?;
                let depth_multiplier = to_i32(*depth_multiplier)?;
                self.add_operator(
                    BuiltinOperator::DepthwiseConv2D,
                    vec![input, kernel, bias],
                    vec![out],
                    OptionsDef::DepthwiseConv2D {
                        padding: padding_code(*padding),
                        stride_w,
                        stride_h,
                        depth_multiplier,
                        activation: fused,
                        dilation_w,
                        dilation_h,
                    },
                );
                self.finish_activation(*activation, prefix, out, output_shape)?
            }
            LayerKind::Dense {
                use_bias,
                activation,
                ..
            } => {
                let kernel =
                    self.add_constant(format!("{}/kernel", prefix), param(Param::Kernel)?)?;
                let bias = if *use_bias {
                    self.add_constant(format!("{}/bias", prefix), param(Param::Bias)?)?
                } else {
                    OPTIONAL_INPUT
                };
                let (fused, name) = fused_output(*activation, prefix);
                let out = self.add_tensor(name, output_shape, None)?;
                self.add_operator(
                    BuiltinOperator::FullyConnected,
                    vec![input, kernel, bias],
                    vec![out],
                    OptionsDef::FullyConnected {
                        activation: fused,
                        keep_num_dims: output_shape.len() > 2,
                    },
                );
                self.finish_activation(*activation, prefix, out, output_shape)?
            }
            LayerKind::MaxPool2D {
                pool_size,
                strides,
                padding,
            } => self.lower_pool(
                BuiltinOperator::MaxPool2D,
                pool_size,
                strides,
                *padding,
                prefix,
                input,
                output_shape,
            )?,
            LayerKind::AvgPool2D {
                pool_size,
                strides,
                padding,
            } => self.lower_pool(
                BuiltinOperator::AveragePool2D,
                pool_size,
                strides,
                *padding,
                prefix,
                input,
                output_shape,
            )?,
            LayerKind::Relu => {
                self.lower_unary(BuiltinOperator::Relu, prefix, input, output_shape, OptionsDef::None)?
            }
            LayerKind::Relu6 => {
                self.lower_unary(BuiltinOperator::Relu6, prefix, input, output_shape, OptionsDef::None)?
            }
            LayerKind::Sigmoid => self.lower_unary(
                BuiltinOperator::Logistic,
                prefix,
                input,
                output_shape,
                OptionsDef::None,
            )?,
            LayerKind::Tanh => {
                self.lower_unary(BuiltinOperator::Tanh, prefix, input, output_shape, OptionsDef::None)?
            }
            LayerKind::LeakyRelu { alpha } => self.lower_unary(
                BuiltinOperator::LeakyRelu,
                prefix,
                input,
                output_shape,
                OptionsDef::LeakyRelu { alpha: *alpha },
            )?,
        };

        Ok(output)
    }

    #[allow(clippy::too_many_arguments)]
    fn lower_pool(
        &mut self,
        op: BuiltinOperator,
        pool_size: &[usize; 2],
        strides: &Option<[usize; 2]>,
        padding: Padding,
        prefix: &str,
        input: i32,
        output_shape: &[usize],
    ) -> Result<i32, SerializeError> {
        let strides = strides.unwrap_or(*pool_size);
        let options = OptionsDef::Pool2D {
            padding: padding_code(padding),
            stride_w: to_i32(strides[1])?,
            stride_h: to_i32(strides[0])?,
            filter_w: to_i32(pool_size[1])?,
            filter_h: to_i32(pool_size[0])?,
        };
        self.lower_unary(op, prefix, input, output_shape, options)
    }

    fn lower_unary(
        &mut self,
        op: BuiltinOperator,
        prefix: &str,
        input: i32,
        output_shape: &[usize],
        options: OptionsDef,
    ) -> Result<i32, SerializeError> {
        let out = self.add_tensor(format!("{}/output", prefix), output_shape, None)?;
        self.add_operator(op, vec![input], vec![out], options);
        Ok(out)
    }

    /// Append a LOGISTIC op when the activation could not be fused
    fn finish_activation(
        &mut self,
        activation: Activation,
        prefix: &str,
        output: i32,
        shape: &[usize],
    ) -> Result<i32, SerializeError> {
        if fused_activation_code(activation).is_some() {
            return Ok(output);
        }
        self.lower_unary(BuiltinOperator::Logistic, prefix, output, shape, OptionsDef::None)
    }
}

/// Look up a layer parameter and check it against the inferred shape
fn checked_param<'a>(
    layer: &'a Layer,
    params: &[(Param, Vec<usize>)],
    param: Param,
) -> Result<&'a Tensor, SerializeError> {
    let tensor = layer
        .param(param)
        .ok_or_else(|| SerializeError::MissingParameter {
            layer: layer.name.clone(),
            param: param.to_string(),
        })?;
    let expected = params.iter().find(|(p, _)| *p == param).map(|(_, s)| s);
    if expected != Some(&tensor.shape) {
        return Err(SerializeError::Failed(format!(
            "{}/{} has shape {:?}, expected {:?}",
            layer.name, param, tensor.shape, expected
        )));
    }
    Ok(tensor)
}

fn to_i32(value: usize) -> Result<i32, SerializeError> {
    i32::try_from(value).map_err(|_| SerializeError::Failed(format!("{} exceeds i32", value)))
}

/// Fused activation code and output tensor name for a layer
fn fused_output(activation: Activation, prefix: &str) -> (i8, String) {
    match fused_activation_code(activation) {
        Some(code) => (code, format!("{}/output", prefix)),
        None => (0, format!("{}/pre_activation", prefix)),
    }
}

/// Serializes models to `.tflite`
#[derive(Debug, Clone)]
pub struct TFLiteWriter {
    description: String,
    min_runtime_version: String,
}

impl Default for TFLiteWriter {
    fn default() -> Self {
        Self {
            description: DEFAULT_DESCRIPTION.to_string(),
            min_runtime_version: DEFAULT_MIN_RUNTIME_VERSION.to_string(),
        }
    }
}

impl TFLiteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_min_runtime_version(mut self, version: impl Into<String>) -> Self {
        self.min_runtime_version = version.into();
        self
    }

    /// Emit a lowered plan as FlatBuffer bytes
    pub fn emit(&self, plan: &GraphPlan) -> Vec<u8> {
        let mut fbb = FlatBufferBuilder::with_capacity(plan.constant_bytes() + 1024);

        let operator_codes: Vec<_> = plan
            .opcodes
            .iter()
            .map(|op| {
                let start = fbb.start_table();
                fbb.push_slot_always::<i8>(field(0), op.deprecated_code());
                fbb.push_slot::<i32>(field(2), 1, 1);
                fbb.push_slot_always::<i32>(field(3), op.code());
                fbb.end_table(start)
            })
            .collect();

        let tensors: Vec<_> = plan
            .tensors
            .iter()
            .map(|tensor| {
                let shape = fbb.create_vector(&tensor.shape);
                let name = fbb.create_string(&tensor.name);
                let start = fbb.start_table();
                fbb.push_slot_always(field(0), shape);
                fbb.push_slot::<i8>(field(1), tensor.dtype as i8, 0);
                fbb.push_slot::<u32>(field(2), tensor.buffer, 0);
                fbb.push_slot_always(field(3), name);
                fbb.end_table(start)
            })
            .collect();

        let operators: Vec<_> = plan
            .operators
            .iter()
            .map(|op| {
                let inputs = fbb.create_vector(&op.inputs);
                let outputs = fbb.create_vector(&op.outputs);
                let options = write_options(&mut fbb, &op.options);
                let start = fbb.start_table();
                fbb.push_slot::<u32>(field(0), op.opcode_index, 0);
                fbb.push_slot_always(field(1), inputs);
                fbb.push_slot_always(field(2), outputs);
                if let Some(options) = options {
                    fbb.push_slot_always::<u8>(field(3), op.options.options_type() as u8);
                    fbb.push_slot_always(field(4), options);
                }
                fbb.end_table(start)
            })
            .collect();

        let subgraph = {
            let tensors = fbb.create_vector(&tensors);
            let inputs = fbb.create_vector(&plan.inputs);
            let outputs = fbb.create_vector(&plan.outputs);
            let operators = fbb.create_vector(&operators);
            let name = fbb.create_string(SUBGRAPH_NAME);
            let start = fbb.start_table();
            fbb.push_slot_always(field(0), tensors);
            fbb.push_slot_always(field(1), inputs);
            fbb.push_slot_always(field(2), outputs);
            fbb.push_slot_always(field(3), operators);
            fbb.push_slot_always(field(4), name);
            fbb.end_table(start)
        };

        // The runtime version string lives in its own trailing buffer
        let mut version_bytes = vec![0u8; MIN_RUNTIME_VERSION_LEN];
        let raw = self.min_runtime_version.as_bytes();
        let len = raw.len().min(MIN_RUNTIME_VERSION_LEN);
        version_bytes[..len].copy_from_slice(&raw[..len]);
        let version_buffer_index = plan.buffers.len() as u32;

        let buffers: Vec<_> = plan
            .buffers
            .iter()
            .chain(std::iter::once(&version_bytes))
            .map(|data| {
                let data = (!data.is_empty()).then(|| fbb.create_vector(data));
                let start = fbb.start_table();
                if let Some(data) = data {
                    fbb.push_slot_always(field(0), data);
                }
                fbb.end_table(start)
            })
            .collect();

        let metadata = {
            let name = fbb.create_string(MIN_RUNTIME_VERSION_KEY);
            let start = fbb.start_table();
            fbb.push_slot_always(field(0), name);
            fbb.push_slot::<u32>(field(1), version_buffer_index, 0);
            fbb.end_table(start)
        };

        let operator_codes = fbb.create_vector(&operator_codes);
        let subgraphs = fbb.create_vector(&[subgraph]);
        let description = fbb.create_string(&self.description);
        let buffers = fbb.create_vector(&buffers);
        let metadata = fbb.create_vector(&[metadata]);

        let start = fbb.start_table();
        fbb.push_slot::<u32>(field(0), TFLITE_SCHEMA_VERSION, 0);
        fbb.push_slot_always(field(1), operator_codes);
        fbb.push_slot_always(field(2), subgraphs);
        fbb.push_slot_always(field(3), description);
        fbb.push_slot_always(field(4), buffers);
        fbb.push_slot_always(field(6), metadata);
        let model = fbb.end_table(start);

        fbb.finish(model, Some(TFLITE_FILE_IDENTIFIER));
        fbb.finished_data().to_vec()
    }
}

/// Write a builtin options table, if the operator has one
fn write_options(
    fbb: &mut FlatBufferBuilder,
    options: &OptionsDef,
) -> Option<WIPOffset<TableFinishedWIPOffset>> {
    let table = match *options {
        OptionsDef::None => return None,
        OptionsDef::Conv2D {
            padding,
            stride_w,
            stride_h,
            activation,
            dilation_w,
            dilation_h,
        } => {
            let start = fbb.start_table();
            fbb.push_slot::<i8>(field(0), padding, 0);
            fbb.push_slot::<i32>(field(1), stride_w, 0);
            fbb.push_slot::<i32>(field(2), stride_h, 0);
            fbb.push_slot::<i8>(field(3), activation, 0);
            fbb.push_slot::<i32>(field(4), dilation_w, 1);
            fbb.push_slot::<i32>(field(5), dilation_h, 1);
            fbb.end_table(start)
        }
        OptionsDef::DepthwiseConv2D {
            padding,
            stride_w,
            stride_h,
            depth_multiplier,
            activation,
            dilation_w,
            dilation_h,
        } => {
            let start = fbb.start_table();
            fbb.push_slot::<i8>(field(0), padding, 0);
            fbb.push_slot::<i32>(field(1), stride_w, 0);
            fbb.push_slot::<i32>(field(2), stride_h, 0);
            fbb.push_slot::<i32>(field(3), depth_multiplier, 0);
            fbb.push_slot::<i8>(field(4), activation, 0);
            fbb.push_slot::<i32>(field(5), dilation_w, 1);
            fbb.push_slot::<i32>(field(6), dilation_h, 1);
            fbb.end_table(start)
        }
        OptionsDef::FullyConnected {
            activation,
            keep_num_dims,
        } => {
            let start = fbb.start_table();
            fbb.push_slot::<i8>(field(0), activation, 0);
            fbb.push_slot::<bool>(field(2), keep_num_dims, false);
            fbb.end_table(start)
        }
        OptionsDef::Pool2D {
            padding,
            stride_w,
            stride_h,
            filter_w,
            filter_h,
        } => {
            let start = fbb.start_table();
            fbb.push_slot::<i8>(field(0), padding, 0);
            fbb.push_slot::<i32>(field(1), stride_w, 0);
            fbb.push_slot::<i32>(field(2), stride_h, 0);
            fbb.push_slot::<i32>(field(3), filter_w, 0);
            fbb.push_slot::<i32>(field(4), filter_h, 0);
            fbb.end_table(start)
        }
        OptionsDef::LeakyRelu { alpha } => {
            let start = fbb.start_table();
            fbb.push_slot::<f32>(field(0), alpha, 0.0);
            fbb.end_table(start)
        }
    };
    Some(table)
}

impl ModelWriter for TFLiteWriter {
    fn format_id(&self) -> &'static str {
        "tflite"
    }

    fn extension(&self) -> &'static str {
        TFLITE_EXTENSION
    }

    fn write(&self, model: &Sequential) -> Result<Vec<u8>, SerializeError> {
        let plan = GraphPlan::from_model(model)?;
        tracing::debug!(
            tensors = plan.tensors.len(),
            operators = plan.operators.len(),
            constant_bytes = plan.constant_bytes(),
            "lowered model to TFLite tables"
        );
        Ok(self.emit(&plan))
    }
}
