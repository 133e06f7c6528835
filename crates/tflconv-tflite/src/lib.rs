//! tflconv TFLite - TensorFlow Lite format support
//!
//! This crate serializes a [`tflconv_core::Sequential`] model into a
//! `.tflite` FlatBuffer and reads `.tflite` files back for inspection.

pub mod parser;
pub mod schema;
pub mod writer;

// Re-export main types
pub use parser::{
    is_tflite, TFLiteMetadata, TFLiteModel, TFLiteOperator, TFLiteOptions, TFLiteParser,
    TFLiteSubgraph, TFLiteTensor,
};
pub use schema::{
    BuiltinOperator, BuiltinOptions, TFLiteDataType, TFLITE_EXTENSION, TFLITE_FILE_IDENTIFIER,
    TFLITE_SCHEMA_VERSION,
};
pub use writer::{GraphPlan, TFLiteWriter};
