//! PyTorch checkpoint loader
//!
//! Tensor storage is decoded with `candle_core::pickle`. Floating point
//! tensors are widened or narrowed to f32; integer tensors keep their type.
//! Only the zip container written by `torch.save` since 1.6 is readable;
//! older bare-pickle files are detected and rejected with a clear error.

use candle_core::pickle::{PthTensors, TensorInfo};
use candle_core::{DType, Device, Tensor as CandleTensor};
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tflconv_core::{Checkpoint, CheckpointLoader, DataType, ParseError, Tensor};
use zip::ZipArchive;

/// Extensions commonly used for PyTorch checkpoints
pub const PYTORCH_EXTENSIONS: &[&str] = &["pt", "pth", "bin", "ckpt"];

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Check whether data looks like a PyTorch zip checkpoint
pub fn is_pytorch(head: &[u8]) -> bool {
    head.starts_with(ZIP_MAGIC)
}

/// Pickle protocol 2+ header used by pre-1.6 `torch.save`
fn is_legacy_pickle(head: &[u8]) -> bool {
    head.len() >= 2 && head[0] == 0x80 && (2..=5).contains(&head[1])
}

fn invalid(e: impl std::fmt::Display) -> ParseError {
    ParseError::Malformed(format!("Invalid PyTorch checkpoint: {}", e))
}

/// Loads PyTorch checkpoints
#[derive(Debug, Clone, Default)]
pub struct PyTorchLoader {
    /// Nested key holding the tensors (e.g. "state_dict" for Lightning checkpoints)
    state_dict_key: Option<String>,
}

impl PyTorchLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read tensors from a nested dictionary key instead of the top level
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            state_dict_key: Some(key.into()),
        }
    }

    pub fn state_dict_key(&self) -> Option<&str> {
        self.state_dict_key.as_deref()
    }
}

impl CheckpointLoader for PyTorchLoader {
    fn format_id(&self) -> &'static str {
        "pytorch"
    }

    fn extensions(&self) -> &[&'static str] {
        PYTORCH_EXTENSIONS
    }

    fn sniff(&self, head: &[u8]) -> bool {
        is_pytorch(head)
    }

    fn load(&self, path: &Path) -> Result<Checkpoint, ParseError> {
        // Surface missing/unreadable files as IO errors rather than pickle errors
        let mut head = Vec::with_capacity(ZIP_MAGIC.len());
        File::open(path)?
            .take(ZIP_MAGIC.len() as u64)
            .read_to_end(&mut head)?;
        if is_legacy_pickle(&head) {
            return Err(ParseError::Unsupported(
                "legacy (pre-1.6) PyTorch pickle checkpoints cannot be read; \
                 re-save with torch.save(..., _use_new_zipfile_serialization=True)"
                    .into(),
            ));
        }

        let pth = PthTensors::new(path, self.state_dict_key.as_deref()).map_err(invalid)?;

        // Tensors that start part-way into a shared storage are read directly
        let mut archive = if pth
            .tensor_infos()
            .values()
            .any(|info| info.layout.start_offset() > 0)
        {
            Some(open_archive(path)?)
        } else {
            None
        };

        let mut checkpoint = Checkpoint::new(self.format_id());
        if let Some(key) = &self.state_dict_key {
            checkpoint
                .metadata
                .insert("state_dict_key".to_string(), key.clone());
        }

        let mut names: Vec<&String> = pth.tensor_infos().keys().collect();
        names.sort();
        for name in names {
            let info = &pth.tensor_infos()[name];
            let tensor = if info.layout.start_offset() == 0 {
                pth.get(name)
                    .map_err(invalid)?
                    .ok_or_else(|| invalid(format!("tensor {} has no storage", name)))?
            } else {
                let archive = archive
                    .as_mut()
                    .ok_or_else(|| invalid("storage archive is not open"))?;
                read_offset_tensor(archive, info)?
            };

            let tensor = convert_tensor(name, &tensor)?;
            tracing::trace!(name = %tensor.name, shape = ?tensor.shape, "loaded tensor");
            checkpoint.push(tensor)?;
        }

        tracing::debug!(
            tensors = checkpoint.len(),
            bytes = checkpoint.total_bytes(),
            "loaded PyTorch checkpoint"
        );

        Ok(checkpoint)
    }
}

fn open_archive(path: &Path) -> Result<ZipArchive<BufReader<File>>, ParseError> {
    ZipArchive::new(BufReader::new(File::open(path)?)).map_err(invalid)
}

/// Read a tensor that starts part-way into a shared storage
///
/// Storage offsets count elements, so the skip is scaled by the element
/// size before reading.
fn read_offset_tensor(
    archive: &mut ZipArchive<BufReader<File>>,
    info: &TensorInfo,
) -> Result<CandleTensor, ParseError> {
    if !info.layout.is_contiguous() {
        return Err(invalid(format!(
            "tensor {} is a strided view of its storage",
            info.name
        )));
    }

    let size = info.dtype.size_in_bytes();
    let overflow = || invalid(format!("tensor {} exceeds its storage", info.name));
    let skip = info
        .layout
        .start_offset()
        .checked_mul(size)
        .ok_or_else(overflow)?;
    let len = info
        .layout
        .dims()
        .iter()
        .try_fold(size, |acc, &d| acc.checked_mul(d))
        .ok_or_else(overflow)?;

    let mut reader = archive.by_name(&info.path).map_err(invalid)?;
    std::io::copy(&mut reader.by_ref().take(skip as u64), &mut std::io::sink())?;
    let mut data = Vec::new();
    reader.take(len as u64).read_to_end(&mut data)?;
    if data.len() != len {
        return Err(overflow());
    }

    CandleTensor::from_raw_buffer(&data, info.dtype, info.layout.dims(), &Device::Cpu)
        .map_err(invalid)
}

/// Convert a Candle tensor to a core tensor with little-endian data
fn convert_tensor(name: &str, tensor: &CandleTensor) -> Result<Tensor, ParseError> {
    let malformed =
        |e: candle_core::Error| ParseError::Malformed(format!("Tensor {}: {}", name, e));

    let shape = tensor.dims().to_vec();
    let flat = tensor.flatten_all().map_err(malformed)?;

    let (dtype, data) = match tensor.dtype() {
        DType::U8 => (DataType::UInt8, flat.to_vec1::<u8>().map_err(malformed)?),
        DType::U32 => (
            DataType::UInt32,
            to_le_bytes(&flat.to_vec1::<u32>().map_err(malformed)?, u32::to_le_bytes),
        ),
        DType::I64 => (
            DataType::Int64,
            to_le_bytes(&flat.to_vec1::<i64>().map_err(malformed)?, i64::to_le_bytes),
        ),
        DType::F32 => (
            DataType::Float32,
            to_le_bytes(&flat.to_vec1::<f32>().map_err(malformed)?, f32::to_le_bytes),
        ),
        // f16, bf16, f64 and any narrower float types become f32
        _ => {
            let values = flat
                .to_dtype(DType::F32)
                .and_then(|t| t.to_vec1::<f32>())
                .map_err(|_| ParseError::UnsupportedDType {
                    name: name.to_string(),
                    dtype: format!("{:?}", tensor.dtype()),
                })?;
            (DataType::Float32, to_le_bytes(&values, f32::to_le_bytes))
        }
    };

    Ok(Tensor {
        name: name.to_string(),
        shape,
        dtype,
        data,
    })
}

fn to_le_bytes<T: Copy, const N: usize>(values: &[T], f: fn(T) -> [u8; N]) -> Vec<u8> {
    values.iter().flat_map(|v| f(*v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Zip checkpoint holding `generator.conv.weight` [2,2,1,1] = [1,2,3,4] and
    /// `generator.conv.bias` [2] = [0.1,0.2], both views of one 6-element storage
    const FIXTURE: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/conv.pt");

    #[test]
    fn test_is_pytorch() {
        assert!(is_pytorch(b"PK\x03\x04rest"));
        assert!(!is_pytorch(&[0x80, 0x02, 0x8a]));
        assert!(!is_pytorch(b"TFL3"));
        assert!(!is_pytorch(&[]));

        assert!(is_legacy_pickle(&[0x80, 0x02, 0x8a]));
        assert!(!is_legacy_pickle(&[0x80, 0x09]));
    }

    #[test]
    fn test_load_zip_checkpoint() {
        let checkpoint = PyTorchLoader::new().load(Path::new(FIXTURE)).unwrap();

        assert_eq!(checkpoint.format, "pytorch");
        let names: Vec<&str> = checkpoint.names().collect();
        assert_eq!(names, vec!["generator.conv.bias", "generator.conv.weight"]);

        let weight = checkpoint.get("generator.conv.weight").unwrap();
        assert_eq!(weight.shape, vec![2, 2, 1, 1]);
        assert_eq!(weight.to_f32_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_load_tensor_at_storage_offset() {
        let checkpoint = PyTorchLoader::new().load(Path::new(FIXTURE)).unwrap();

        // The bias starts four elements into the shared storage
        let bias = checkpoint.get("generator.conv.bias").unwrap();
        assert_eq!(bias.shape, vec![2]);
        assert_eq!(bias.to_f32_vec().unwrap(), vec![0.1, 0.2]);
    }

    #[test]
    fn test_load_missing_state_dict_key() {
        let result = PyTorchLoader::with_key("state_dict").load(Path::new(FIXTURE));
        assert!(matches!(result, Err(ParseError::Malformed(_))));
    }

    #[test]
    fn test_legacy_pickle_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        // Protocol 2 pickle of an empty dict
        file.write_all(&[0x80, 0x02, b'}', b'q', 0x00, b'.']).unwrap();

        let err = PyTorchLoader::new().load(file.path()).unwrap_err();
        assert!(matches!(err, ParseError::Unsupported(_)));
        assert!(err.to_string().contains("pre-1.6"));
    }

    #[test]
    fn test_convert_f32_tensor() {
        let t = CandleTensor::new(&[[1f32, 2.0], [3.0, 4.0]], &Device::Cpu).unwrap();
        let converted = convert_tensor("w", &t).unwrap();

        assert_eq!(converted.shape, vec![2, 2]);
        assert_eq!(converted.dtype, DataType::Float32);
        assert_eq!(converted.to_f32_vec().unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_convert_half_tensor_widens() {
        let t = CandleTensor::new(&[0.5f32, -2.0], &Device::Cpu)
            .unwrap()
            .to_dtype(DType::F16)
            .unwrap();
        let converted = convert_tensor("h", &t).unwrap();

        assert_eq!(converted.dtype, DataType::Float32);
        assert_eq!(converted.to_f32_vec().unwrap(), vec![0.5, -2.0]);
    }

    #[test]
    fn test_convert_integer_tensor_keeps_type() {
        let t = CandleTensor::new(&[7i64, 9], &Device::Cpu).unwrap();
        let converted = convert_tensor("steps", &t).unwrap();

        assert_eq!(converted.dtype, DataType::Int64);
        assert_eq!(converted.data.len(), 16);
        assert_eq!(&converted.data[..8], &7i64.to_le_bytes());
    }

    #[test]
    fn test_load_missing_file() {
        let loader = PyTorchLoader::new();
        let result = loader.load(Path::new("definitely-missing-checkpoint.pt"));
        assert!(matches!(result, Err(ParseError::Io(_))));
    }

    #[test]
    fn test_load_garbage_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"this is not a checkpoint").unwrap();

        let loader = PyTorchLoader::with_key("state_dict");
        assert_eq!(loader.state_dict_key(), Some("state_dict"));
        assert!(matches!(
            loader.load(file.path()),
            Err(ParseError::Malformed(_))
        ));
    }
}
