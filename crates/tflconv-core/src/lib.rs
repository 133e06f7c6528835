//! tflconv Core - Shared primitives for checkpoint conversion
//!
//! This crate provides the foundational types used by the format-specific
//! crates (tflconv-pytorch, tflconv-safetensors, tflconv-tflite): the
//! in-memory checkpoint, the sequential layer graph that gets serialized to
//! the mobile format, and the weight transfer between the two.

pub mod checkpoint;
pub mod error;
pub mod graph;
pub mod hash;
pub mod traits;
pub mod transfer;
pub mod types;

// Re-export commonly used types
pub use checkpoint::{Checkpoint, KeyRemap};
pub use error::{GraphError, ParseError, SerializeError, TransferError};
pub use graph::{Activation, InputSpec, Layer, LayerKind, Padding, ParamSpec, Sequential};
pub use hash::{hash_to_hex, sha256};
pub use traits::{CheckpointLoader, ModelWriter};
pub use transfer::{permute, transfer_weights, Layout, Param, TransferReport, WeightBinding};
pub use types::{DataType, Tensor, TensorInfo};
