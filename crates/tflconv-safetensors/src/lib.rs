//! tflconv SafeTensors - HuggingFace SafeTensors format support
//!
//! SafeTensors is a simple, safe format for storing tensors: an 8-byte
//! header length, a JSON header, then raw little-endian tensor data.

pub mod parser;

pub use parser::{
    is_safetensors, serialize_safetensors, SafeTensorMeta, SafeTensorsLoader, SafeTensorsModel,
    SafeTensorsParser, SAFETENSORS_EXTENSIONS,
};
