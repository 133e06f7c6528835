//! SafeTensors parser
//!
//! Parses HuggingFace SafeTensors files into a [`Checkpoint`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tflconv_core::{Checkpoint, CheckpointLoader, DataType, ParseError, SerializeError, Tensor};

/// File extensions handled by the loader
pub const SAFETENSORS_EXTENSIONS: &[&str] = &["safetensors"];

/// Upper bound on the JSON header, as enforced by the reference implementation
const MAX_HEADER_SIZE: usize = 100 * 1024 * 1024;

/// SafeTensors tensor metadata from JSON header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafeTensorMeta {
    /// Data type string (e.g., "F32", "F16", "BF16", "I8", etc.)
    pub dtype: String,
    /// Tensor shape
    pub shape: Vec<usize>,
    /// Data offsets [start, end] relative to data section
    pub data_offsets: [usize; 2],
}

/// Parsed SafeTensors file
#[derive(Debug, Clone)]
pub struct SafeTensorsModel {
    /// Tensor metadata from header, sorted by name
    pub tensors: BTreeMap<String, SafeTensorMeta>,
    /// Optional metadata (__metadata__ key)
    pub metadata: BTreeMap<String, String>,
    /// Raw tensor data section
    pub data: Vec<u8>,
}

impl SafeTensorsModel {
    /// Convert to a checkpoint; tensors are ordered by name
    pub fn into_checkpoint(self) -> Result<Checkpoint, ParseError> {
        let mut checkpoint = Checkpoint::new("safetensors");
        checkpoint.metadata = self.metadata;

        for (name, meta) in self.tensors {
            let [start, end] = meta.data_offsets;
            let data = self
                .data
                .get(start..end)
                .ok_or_else(|| {
                    ParseError::Malformed(format!("Tensor {} data out of bounds", name))
                })?
                .to_vec();
            let dtype = parse_dtype(&meta.dtype).ok_or_else(|| ParseError::UnsupportedDType {
                name: name.clone(),
                dtype: meta.dtype.clone(),
            })?;

            checkpoint.push(Tensor {
                name,
                shape: meta.shape,
                dtype,
                data,
            })?;
        }

        Ok(checkpoint)
    }
}

/// Parse dtype string to DataType enum
fn parse_dtype(dtype: &str) -> Option<DataType> {
    let dtype = match dtype.to_uppercase().as_str() {
        "F32" | "FLOAT32" => DataType::Float32,
        "F16" | "FLOAT16" => DataType::Float16,
        "BF16" | "BFLOAT16" => DataType::BFloat16,
        "F64" | "FLOAT64" => DataType::Float64,
        "I8" | "INT8" => DataType::Int8,
        "U8" | "UINT8" => DataType::UInt8,
        "I16" | "INT16" => DataType::Int16,
        "U16" | "UINT16" => DataType::UInt16,
        "I32" | "INT32" => DataType::Int32,
        "U32" | "UINT32" => DataType::UInt32,
        "I64" | "INT64" => DataType::Int64,
        "U64" | "UINT64" => DataType::UInt64,
        "BOOL" => DataType::Bool,
        _ => return None,
    };
    Some(dtype)
}

/// Convert DataType back to SafeTensors dtype string
fn dtype_to_string(dtype: DataType) -> &'static str {
    match dtype {
        DataType::Float32 => "F32",
        DataType::Float16 => "F16",
        DataType::BFloat16 => "BF16",
        DataType::Float64 => "F64",
        DataType::Int8 => "I8",
        DataType::UInt8 => "U8",
        DataType::Int16 => "I16",
        DataType::UInt16 => "U16",
        DataType::Int32 => "I32",
        DataType::UInt32 => "U32",
        DataType::Int64 => "I64",
        DataType::UInt64 => "U64",
        DataType::Bool => "BOOL",
    }
}

/// Check whether data looks like a SafeTensors file
pub fn is_safetensors(head: &[u8]) -> bool {
    if head.len() < 9 {
        return false;
    }
    let header_size = u64::from_le_bytes(head[0..8].try_into().unwrap_or([0xff; 8]));
    header_size > 0 && header_size <= MAX_HEADER_SIZE as u64 && head[8] == b'{'
}

/// SafeTensors parser
#[derive(Debug, Clone, Default)]
pub struct SafeTensorsParser;

impl SafeTensorsParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse a SafeTensors file
    pub fn parse(&self, data: &[u8]) -> Result<SafeTensorsModel, ParseError> {
        let (header, header_size) = read_header(data)?;

        let data_start = 8 + header_size;
        let data_len = data.len() - data_start;

        let mut tensors = BTreeMap::new();
        let mut metadata = BTreeMap::new();

        for (key, value) in header {
            if key == "__metadata__" {
                if let serde_json::Value::Object(meta) = value {
                    for (k, v) in meta {
                        if let serde_json::Value::String(s) = v {
                            metadata.insert(k, s);
                        }
                    }
                }
                continue;
            }

            let meta: SafeTensorMeta = serde_json::from_value(value).map_err(|e| {
                ParseError::Malformed(format!("Invalid tensor metadata for {}: {}", key, e))
            })?;
            validate_meta(&key, &meta, data_len)?;
            tensors.insert(key, meta);
        }

        Ok(SafeTensorsModel {
            tensors,
            metadata,
            data: data[data_start..].to_vec(),
        })
    }
}

/// Read and decode the JSON header, returning it with its byte length
fn read_header(
    data: &[u8],
) -> Result<(BTreeMap<String, serde_json::Value>, usize), ParseError> {
    if data.len() < 8 {
        return Err(ParseError::Malformed("File too small".to_string()));
    }

    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&data[0..8]);
    let header_size = u64::from_le_bytes(len_bytes);

    if header_size > MAX_HEADER_SIZE as u64 {
        return Err(ParseError::Malformed(format!(
            "Header too large: {} bytes",
            header_size
        )));
    }
    let header_size = header_size as usize;

    if data.len() < 8 + header_size {
        return Err(ParseError::Malformed(format!(
            "File too small for header: expected {}, got {}",
            8 + header_size,
            data.len()
        )));
    }

    let header_str = std::str::from_utf8(&data[8..8 + header_size])
        .map_err(|e| ParseError::Malformed(format!("Invalid UTF-8 in header: {}", e)))?;

    let header = serde_json::from_str(header_str)
        .map_err(|e| ParseError::Malformed(format!("Invalid JSON header: {}", e)))?;

    Ok((header, header_size))
}

/// Check offsets against the data section and the declared shape
fn validate_meta(name: &str, meta: &SafeTensorMeta, data_len: usize) -> Result<(), ParseError> {
    let [start, end] = meta.data_offsets;
    if start > end || end > data_len {
        return Err(ParseError::Malformed(format!(
            "Tensor {} has offsets [{}, {}] outside data section of {} bytes",
            name, start, end, data_len
        )));
    }

    if let Some(dtype) = parse_dtype(&meta.dtype) {
        let expected = meta
            .shape
            .iter()
            .try_fold(dtype.element_size(), |acc, d| acc.checked_mul(*d));
        if expected != Some(end - start) {
            return Err(ParseError::Malformed(format!(
                "Tensor {} has {} bytes, shape {:?} needs {:?}",
                name,
                end - start,
                meta.shape,
                expected
            )));
        }
    }

    Ok(())
}

/// Serialize a checkpoint to SafeTensors bytes
///
/// Tensors are written sorted by name, so output is deterministic.
pub fn serialize_safetensors(checkpoint: &Checkpoint) -> Result<Vec<u8>, SerializeError> {
    let mut header: BTreeMap<String, serde_json::Value> = BTreeMap::new();

    if !checkpoint.metadata.is_empty() {
        header.insert(
            "__metadata__".to_string(),
            serde_json::to_value(&checkpoint.metadata).map_err(|e| {
                SerializeError::Failed(format!("Failed to serialize metadata: {}", e))
            })?,
        );
    }

    let mut tensors: Vec<_> = checkpoint.tensors.iter().collect();
    tensors.sort_by(|a, b| a.name.cmp(&b.name));

    let mut current_offset = 0usize;
    let mut tensor_data = Vec::with_capacity(checkpoint.total_bytes());

    for tensor in tensors {
        let start = current_offset;
        let end = start + tensor.data.len();

        let meta = SafeTensorMeta {
            dtype: dtype_to_string(tensor.dtype).to_string(),
            shape: tensor.shape.clone(),
            data_offsets: [start, end],
        };

        header.insert(
            tensor.name.clone(),
            serde_json::to_value(&meta).map_err(|e| {
                SerializeError::Failed(format!("Failed to serialize tensor metadata: {}", e))
            })?,
        );

        tensor_data.extend_from_slice(&tensor.data);
        current_offset = end;
    }

    let header_json = serde_json::to_string(&header)
        .map_err(|e| SerializeError::Failed(format!("Failed to serialize header: {}", e)))?;
    let header_bytes = header_json.as_bytes();
    let header_size = header_bytes.len() as u64;

    let mut output = Vec::with_capacity(8 + header_bytes.len() + tensor_data.len());
    output.extend_from_slice(&header_size.to_le_bytes());
    output.extend_from_slice(header_bytes);
    output.extend_from_slice(&tensor_data);

    Ok(output)
}

/// Loads SafeTensors checkpoints from disk
#[derive(Debug, Clone, Default)]
pub struct SafeTensorsLoader {
    parser: SafeTensorsParser,
}

impl SafeTensorsLoader {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CheckpointLoader for SafeTensorsLoader {
    fn format_id(&self) -> &'static str {
        "safetensors"
    }

    fn extensions(&self) -> &[&'static str] {
        SAFETENSORS_EXTENSIONS
    }

    fn sniff(&self, head: &[u8]) -> bool {
        is_safetensors(head)
    }

    fn load(&self, path: &Path) -> Result<Checkpoint, ParseError> {
        let data = std::fs::read(path)?;
        let checkpoint = self.parser.parse(&data)?.into_checkpoint()?;
        tracing::debug!(
            tensors = checkpoint.len(),
            bytes = checkpoint.total_bytes(),
            "loaded SafeTensors checkpoint"
        );
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_checkpoint() -> Checkpoint {
        let mut ckpt = Checkpoint::new("safetensors");
        ckpt.push(Tensor::from_f32("weight", vec![2, 3], &[0.0; 6]))
            .unwrap();
        ckpt.push(Tensor::from_f32("bias", vec![2], &[1.0, 2.0]))
            .unwrap();
        ckpt.metadata
            .insert("format".to_string(), "pt".to_string());
        ckpt
    }

    #[test]
    fn test_parse_dtype() {
        assert_eq!(parse_dtype("F32"), Some(DataType::Float32));
        assert_eq!(parse_dtype("f16"), Some(DataType::Float16));
        assert_eq!(parse_dtype("BF16"), Some(DataType::BFloat16));
        assert_eq!(parse_dtype("I8"), Some(DataType::Int8));
        assert_eq!(parse_dtype("F8_E4M3"), None);
    }

    #[test]
    fn test_serialize_then_load() {
        let bytes = serialize_safetensors(&sample_checkpoint()).unwrap();
        assert!(is_safetensors(&bytes));

        let parsed = SafeTensorsParser::new().parse(&bytes).unwrap();
        assert_eq!(parsed.metadata.get("format").map(String::as_str), Some("pt"));

        let ckpt = parsed.into_checkpoint().unwrap();
        let names: Vec<&str> = ckpt.names().collect();
        assert_eq!(names, vec!["bias", "weight"]);
        assert_eq!(
            ckpt.get("bias").unwrap().to_f32_vec().unwrap(),
            vec![1.0, 2.0]
        );
        assert_eq!(ckpt.get("weight").unwrap().shape, vec![2, 3]);
    }

    #[test]
    fn test_serialize_deterministic() {
        let a = serialize_safetensors(&sample_checkpoint()).unwrap();
        let b = serialize_safetensors(&sample_checkpoint()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_offsets_out_of_range() {
        let header = br#"{"w":{"dtype":"F32","shape":[4],"data_offsets":[0,16]}}"#;
        let mut data = (header.len() as u64).to_le_bytes().to_vec();
        data.extend_from_slice(header);
        data.extend_from_slice(&[0u8; 8]);

        let result = SafeTensorsParser::new().parse(&data);
        assert!(matches!(result, Err(ParseError::Malformed(_))));
    }

    #[test]
    fn test_shape_size_mismatch() {
        let header = br#"{"w":{"dtype":"F32","shape":[3],"data_offsets":[0,8]}}"#;
        let mut data = (header.len() as u64).to_le_bytes().to_vec();
        data.extend_from_slice(header);
        data.extend_from_slice(&[0u8; 8]);

        assert!(SafeTensorsParser::new().parse(&data).is_err());
    }

    #[test]
    fn test_too_small_and_huge_header() {
        let parser = SafeTensorsParser::new();
        assert!(parser.parse(&[0, 0, 0]).is_err());
        assert!(parser.parse(&u64::MAX.to_le_bytes()).is_err());
    }

    #[test]
    fn test_loader_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&serialize_safetensors(&sample_checkpoint()).unwrap())
            .unwrap();

        let loader = SafeTensorsLoader::new();
        let ckpt = loader.load(file.path()).unwrap();
        assert_eq!(ckpt.format, "safetensors");
        assert_eq!(ckpt.len(), 2);
    }
}
