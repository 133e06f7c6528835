//! Checkpoint format detection and loading

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tflconv_core::{Checkpoint, CheckpointLoader, ParseError};
use tflconv_pytorch::PyTorchLoader;
use tflconv_safetensors::SafeTensorsLoader;

/// Bytes read from the start of a file for format sniffing
const HEAD_LEN: u64 = 16;

/// Read the leading bytes of a file
pub fn read_head(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(HEAD_LEN as usize);
    File::open(path)?.take(HEAD_LEN).read_to_end(&mut head)?;
    Ok(head)
}

/// Pick a loader by magic bytes, falling back to the file extension
pub fn detect_loader(
    path: &Path,
    head: &[u8],
    state_dict_key: Option<&str>,
) -> Result<Box<dyn CheckpointLoader>> {
    let mut loaders: Vec<Box<dyn CheckpointLoader>> = vec![
        Box::new(SafeTensorsLoader::new()),
        Box::new(match state_dict_key {
            Some(key) => PyTorchLoader::with_key(key),
            None => PyTorchLoader::new(),
        }),
    ];

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    let position = loaders.iter().position(|l| l.sniff(head)).or_else(|| {
        let extension = extension.as_deref()?;
        loaders
            .iter()
            .position(|l| l.extensions().iter().any(|e| *e == extension))
    });

    match position {
        Some(index) => Ok(loaders.swap_remove(index)),
        None => Err(ParseError::UnknownFormat(format!(
            "{} is neither a PyTorch nor a SafeTensors checkpoint",
            path.display()
        ))
        .into()),
    }
}

/// Load a checkpoint, showing a spinner while it is decoded
pub fn load(path: &Path, state_dict_key: Option<&str>, progress: bool) -> Result<Checkpoint> {
    let head = read_head(path)
        .with_context(|| format!("Failed to read checkpoint {}", path.display()))?;
    let loader = detect_loader(path, &head, state_dict_key)?;
    tracing::info!(format = loader.format_id(), path = %path.display(), "loading checkpoint");

    let spinner = if progress {
        ProgressBar::new_spinner()
    } else {
        ProgressBar::hidden()
    };
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        spinner.set_style(style);
    }
    spinner.set_message(format!("Loading {}", path.display()));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let result = loader.load(path).with_context(|| {
        format!(
            "Failed to load {} checkpoint {}",
            loader.format_id(),
            path.display()
        )
    });
    spinner.finish_and_clear();

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_detect_by_magic() {
        let path = Path::new("weights.bin");

        let zip = detect_loader(path, b"PK\x03\x04", None).unwrap();
        assert_eq!(zip.format_id(), "pytorch");

        let mut safetensors = 2u64.to_le_bytes().to_vec();
        safetensors.extend_from_slice(b"{}");
        let loader = detect_loader(path, &safetensors, None).unwrap();
        assert_eq!(loader.format_id(), "safetensors");
    }

    #[test]
    fn test_detect_by_extension() {
        let loader = detect_loader(Path::new("model.SafeTensors"), b"", None).unwrap();
        assert_eq!(loader.format_id(), "safetensors");

        let loader = detect_loader(Path::new("big-lama.pt"), b"", None).unwrap();
        assert_eq!(loader.format_id(), "pytorch");
    }

    #[test]
    fn test_detect_unknown_format() {
        let err = detect_loader(Path::new("notes.txt"), b"hello", None).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<ParseError>(),
            Some(ParseError::UnknownFormat(_))
        ));
    }

    #[test]
    fn test_load_missing_reports_os_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big-lama.pt");

        let err = load(&path, None, false).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to read checkpoint"));

        let io = err.root_cause().downcast_ref::<std::io::Error>().unwrap();
        assert_eq!(io.kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn test_read_head_short_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tiny.pt");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(read_head(&path).unwrap(), b"abc");
    }
}
