//! TFLite schema constants
//!
//! Enum values and table field slots from the TensorFlow Lite FlatBuffer
//! schema (`schema.fbs`, version 3) for the subset of operators tflconv
//! emits.

use tflconv_core::{Activation, DataType, Padding};

/// File identifier stored at bytes 4..8 of every model
pub const TFLITE_FILE_IDENTIFIER: &str = "TFL3";

/// Schema version written to `Model.version`
pub const TFLITE_SCHEMA_VERSION: u32 = 3;

pub const TFLITE_EXTENSION: &str = "tflite";

/// Builtin codes above this value only fit in `OperatorCode.builtin_code`
pub const PLACEHOLDER_FOR_GREATER_OP_CODES: i8 = 127;

/// vtable slot offset of the `index`th field of a table
pub const fn field(index: u16) -> u16 {
    4 + 2 * index
}

/// TFLite tensor element types (`TensorType`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TFLiteDataType {
    Float32 = 0,
    Float16 = 1,
    Int32 = 2,
    UInt8 = 3,
    Int64 = 4,
    String = 5,
    Bool = 6,
    Int16 = 7,
    Complex64 = 8,
    Int8 = 9,
    Float64 = 10,
    Complex128 = 11,
    UInt64 = 12,
    Resource = 13,
    Variant = 14,
    UInt32 = 15,
    UInt16 = 16,
    Int4 = 17,
}

impl TFLiteDataType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Float32),
            1 => Some(Self::Float16),
            2 => Some(Self::Int32),
            3 => Some(Self::UInt8),
            4 => Some(Self::Int64),
            5 => Some(Self::String),
            6 => Some(Self::Bool),
            7 => Some(Self::Int16),
            8 => Some(Self::Complex64),
            9 => Some(Self::Int8),
            10 => Some(Self::Float64),
            11 => Some(Self::Complex128),
            12 => Some(Self::UInt64),
            13 => Some(Self::Resource),
            14 => Some(Self::Variant),
            15 => Some(Self::UInt32),
            16 => Some(Self::UInt16),
            17 => Some(Self::Int4),
            _ => None,
        }
    }

    /// Short lowercase name, matching [`DataType::name`] where both exist
    pub fn name(&self) -> &'static str {
        match self {
            TFLiteDataType::Float32 => "f32",
            TFLiteDataType::Float16 => "f16",
            TFLiteDataType::Int32 => "i32",
            TFLiteDataType::UInt8 => "u8",
            TFLiteDataType::Int64 => "i64",
            TFLiteDataType::String => "string",
            TFLiteDataType::Bool => "bool",
            TFLiteDataType::Int16 => "i16",
            TFLiteDataType::Complex64 => "c64",
            TFLiteDataType::Int8 => "i8",
            TFLiteDataType::Float64 => "f64",
            TFLiteDataType::Complex128 => "c128",
            TFLiteDataType::UInt64 => "u64",
            TFLiteDataType::Resource => "resource",
            TFLiteDataType::Variant => "variant",
            TFLiteDataType::UInt32 => "u32",
            TFLiteDataType::UInt16 => "u16",
            TFLiteDataType::Int4 => "i4",
        }
    }
}

impl TryFrom<DataType> for TFLiteDataType {
    type Error = DataType;

    fn try_from(dtype: DataType) -> Result<Self, Self::Error> {
        match dtype {
            DataType::Float32 => Ok(TFLiteDataType::Float32),
            DataType::Float16 => Ok(TFLiteDataType::Float16),
            DataType::Float64 => Ok(TFLiteDataType::Float64),
            DataType::Int8 => Ok(TFLiteDataType::Int8),
            DataType::UInt8 => Ok(TFLiteDataType::UInt8),
            DataType::Int16 => Ok(TFLiteDataType::Int16),
            DataType::UInt16 => Ok(TFLiteDataType::UInt16),
            DataType::Int32 => Ok(TFLiteDataType::Int32),
            DataType::UInt32 => Ok(TFLiteDataType::UInt32),
            DataType::Int64 => Ok(TFLiteDataType::Int64),
            DataType::UInt64 => Ok(TFLiteDataType::UInt64),
            DataType::Bool => Ok(TFLiteDataType::Bool),
            // No bfloat16 tensor type in the schema
            DataType::BFloat16 => Err(dtype),
        }
    }
}

/// Builtin operator codes (`BuiltinOperator`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum BuiltinOperator {
    AveragePool2D = 1,
    Conv2D = 3,
    DepthwiseConv2D = 4,
    FullyConnected = 9,
    Logistic = 14,
    MaxPool2D = 17,
    Relu = 19,
    Relu6 = 21,
    Tanh = 28,
    LeakyRelu = 98,
}

impl BuiltinOperator {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::AveragePool2D),
            3 => Some(Self::Conv2D),
            4 => Some(Self::DepthwiseConv2D),
            9 => Some(Self::FullyConnected),
            14 => Some(Self::Logistic),
            17 => Some(Self::MaxPool2D),
            19 => Some(Self::Relu),
            21 => Some(Self::Relu6),
            28 => Some(Self::Tanh),
            98 => Some(Self::LeakyRelu),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    /// Value for the legacy `deprecated_builtin_code` byte
    pub fn deprecated_code(self) -> i8 {
        let code = self.code();
        if code < PLACEHOLDER_FOR_GREATER_OP_CODES as i32 {
            code as i8
        } else {
            PLACEHOLDER_FOR_GREATER_OP_CODES
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BuiltinOperator::AveragePool2D => "AVERAGE_POOL_2D",
            BuiltinOperator::Conv2D => "CONV_2D",
            BuiltinOperator::DepthwiseConv2D => "DEPTHWISE_CONV_2D",
            BuiltinOperator::FullyConnected => "FULLY_CONNECTED",
            BuiltinOperator::Logistic => "LOGISTIC",
            BuiltinOperator::MaxPool2D => "MAX_POOL_2D",
            BuiltinOperator::Relu => "RELU",
            BuiltinOperator::Relu6 => "RELU6",
            BuiltinOperator::Tanh => "TANH",
            BuiltinOperator::LeakyRelu => "LEAKY_RELU",
        }
    }
}

/// Builtin options union tags (`BuiltinOptions`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BuiltinOptions {
    None = 0,
    Conv2DOptions = 1,
    DepthwiseConv2DOptions = 2,
    Pool2DOptions = 5,
    FullyConnectedOptions = 8,
    LeakyReluOptions = 75,
}

/// `Padding` enum values
pub fn padding_code(padding: Padding) -> i8 {
    match padding {
        Padding::Same => 0,
        Padding::Valid => 1,
    }
}

/// `ActivationFunctionType` value for a fusable activation
///
/// Sigmoid has no fused form and returns `None`.
pub fn fused_activation_code(activation: Activation) -> Option<i8> {
    match activation {
        Activation::Linear => Some(0),
        Activation::Relu => Some(1),
        Activation::Relu6 => Some(3),
        Activation::Tanh => Some(4),
        Activation::Sigmoid => None,
    }
}
