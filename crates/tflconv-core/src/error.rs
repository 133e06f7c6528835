//! Error types for tflconv

use thiserror::Error;

/// Errors while reading a checkpoint or model file
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Unknown format: {0}")]
    UnknownFormat(String),

    #[error("Unsupported format: {0}")]
    Unsupported(String),

    #[error("Malformed data: {0}")]
    Malformed(String),

    #[error("Unsupported dtype {dtype} for tensor {name}")]
    UnsupportedDType { name: String, dtype: String },

    #[error("Duplicate tensor name: {0}")]
    DuplicateTensor(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors while building or validating the layer graph
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Duplicate layer name: {0}")]
    DuplicateLayer(String),

    #[error("Invalid layer {layer}: {reason}")]
    InvalidLayer { layer: String, reason: String },

    #[error("Cannot infer output shape of layer {layer}: {reason}")]
    ShapeInference { layer: String, reason: String },
}

/// Errors while copying checkpoint tensors into layer parameters
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Source tensor not found in checkpoint: {0}")]
    MissingSource(String),

    #[error("Unknown target layer: {0}")]
    UnknownLayer(String),

    #[error("Layer {layer} has no parameter {param}")]
    UnknownParam { layer: String, param: String },

    #[error("Parameter {layer}/{param} is bound more than once")]
    DuplicateBinding { layer: String, param: String },

    #[error("Shape mismatch for {source_name}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        source_name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    #[error("Tensor {name} has dtype {dtype:?}, expected a float type")]
    UnsupportedDType {
        name: String,
        dtype: crate::types::DataType,
    },

    #[error("Tensor {name} is malformed: {reason}")]
    MalformedTensor { name: String, reason: String },

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Errors during serialization
#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("Serialization failed: {0}")]
    Failed(String),

    #[error("Layer {layer} is missing its {param} parameter")]
    MissingParameter { layer: String, param: String },

    #[error(transparent)]
    Graph(#[from] GraphError),
}
