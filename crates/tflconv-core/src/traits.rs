//! Core traits for tflconv

use crate::checkpoint::Checkpoint;
use crate::error::{ParseError, SerializeError};
use crate::graph::Sequential;
use std::path::Path;

/// A readable checkpoint format (PyTorch, SafeTensors, ...)
pub trait CheckpointLoader: Send + Sync {
    /// Format identifier (e.g., "pytorch", "safetensors")
    fn format_id(&self) -> &'static str;

    /// File extensions this format handles
    fn extensions(&self) -> &[&'static str];

    /// Check whether the leading bytes of a file look like this format
    fn sniff(&self, head: &[u8]) -> bool;

    /// Load every tensor of the checkpoint at `path`
    fn load(&self, path: &Path) -> Result<Checkpoint, ParseError>;
}

/// Serializes a layer graph to a mobile inference format
pub trait ModelWriter: Send + Sync {
    /// Format identifier (e.g., "tflite")
    fn format_id(&self) -> &'static str;

    /// Conventional file extension
    fn extension(&self) -> &'static str;

    /// Serialize the model to bytes
    fn write(&self, model: &Sequential) -> Result<Vec<u8>, SerializeError>;
}
