//! `tflconv convert` command implementation

use crate::checkpoint;
use crate::config::{ConfigFile, Settings};
use anyhow::{bail, Context, Result};
use clap::Args;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tflconv_core::{hash_to_hex, sha256, transfer_weights, ModelWriter};
use tflconv_tflite::TFLiteWriter;

#[derive(Args, Debug, Default, Clone)]
pub struct ConvertArgs {
    /// Source checkpoint [default: big-lama.pt]
    #[arg(short, long, value_name = "FILE")]
    pub source: Option<PathBuf>,

    /// Output TFLite model [default: lama_model.tflite]
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// TOML file describing input, layers and weight bindings
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Input shape without the batch dimension [default: 512,512,4]
    #[arg(long, value_name = "H,W,C", value_delimiter = ',')]
    pub input_shape: Option<Vec<usize>>,

    /// Batch dimension of the input tensor [default: 1]
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Nested key holding the tensors (e.g. "state_dict")
    #[arg(long, value_name = "KEY")]
    pub state_dict_key: Option<String>,
}

/// Convert a checkpoint into a TFLite model
pub fn run(args: &ConvertArgs, progress: bool) -> Result<()> {
    let config = match &args.config {
        Some(path) => ConfigFile::load(path)?,
        None => ConfigFile::default(),
    };
    let settings = Settings::resolve(args, config)?;

    println!("Converting model...");
    println!("  Source: {}", settings.source.display());
    println!("  Output: {}", settings.output.display());

    let mut checkpoint = checkpoint::load(
        &settings.source,
        settings.state_dict_key.as_deref(),
        progress,
    )?;
    if !settings.key_remap.is_empty() {
        let renamed = checkpoint
            .remap(&settings.key_remap)
            .context("Failed to remap checkpoint keys")?;
        tracing::info!(renamed, "remapped checkpoint keys");
    }
    tracing::info!(
        tensors = checkpoint.len(),
        parameters = checkpoint.parameter_count(),
        "checkpoint loaded"
    );

    let mut model = settings.build_model()?;
    let report = transfer_weights(&mut model, &checkpoint, &settings.weights)
        .context("Failed to transfer weights")?;
    tracing::info!(
        bound = report.bound.len(),
        zero_initialized = report.zero_initialized.len(),
        unused = report.unused.len(),
        "weights transferred"
    );

    let mut writer = TFLiteWriter::new();
    if let Some(description) = &settings.description {
        writer = writer.with_description(description.clone());
    }
    let bytes = writer
        .write(&model)
        .context("Failed to serialize TFLite model")?;

    write_atomic(&settings.output, &bytes)
        .with_context(|| format!("Failed to write {}", settings.output.display()))?;

    println!(
        "  Checkpoint: {} tensors ({} bytes)",
        checkpoint.len(),
        checkpoint.total_bytes()
    );
    println!(
        "  Layers: {} ({} parameters)",
        model.layers().len(),
        model.parameter_count()
    );
    println!(
        "  Weights: {} bound, {} zero-initialized",
        report.bound.len(),
        report.zero_initialized.len()
    );
    if !report.is_complete() {
        tracing::warn!(
            missing = ?report.zero_initialized,
            "model written with zero-initialized parameters"
        );
    }
    println!("  Output size: {} bytes", bytes.len());
    println!("  SHA-256: {}", hash_to_hex(&sha256(&bytes)));
    println!("Model converted successfully!");

    Ok(())
}

/// Write `bytes` to `path` through a temporary file in the same directory
///
/// The destination is either fully written or left untouched.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        bail!("refusing to write an empty model");
    }

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;

    tracing::debug!(path = %path.display(), bytes = bytes.len(), "wrote output");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.tflite");

        write_atomic(&path, b"TFL3 data").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"TFL3 data");

        // Overwrites replace the whole file
        write_atomic(&path, b"new").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_write_atomic_rejects_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("model.tflite");

        assert!(write_atomic(&path, &[]).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_write_atomic_missing_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("missing").join("model.tflite");

        assert!(write_atomic(&path, b"data").is_err());
        assert!(!path.exists());
    }
}
