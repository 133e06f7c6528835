//! `tflconv inspect` command implementation

use crate::checkpoint;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;
use tflconv_core::{hash_to_hex, sha256};
use tflconv_tflite::{is_tflite, BuiltinOperator, TFLiteModel, TFLiteParser};

/// Summary of an inspected file
#[derive(Debug, Serialize)]
struct Report {
    file: String,
    format: String,
    size: usize,
    sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    tensor_count: usize,
    /// Bytes of constant tensor data
    data_bytes: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    operators: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    metadata: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tensors: Option<Vec<TensorRow>>,
}

#[derive(Debug, Serialize)]
struct TensorRow {
    name: String,
    shape: Vec<i64>,
    dtype: String,
    bytes: usize,
}

pub fn run(path: &Path, list_tensors: bool, json: bool) -> Result<()> {
    let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;

    let mut report = if is_tflite(&data) {
        let model = TFLiteParser::new()
            .parse(&data)
            .context("Failed to parse TFLite model")?;
        tflite_report(&model)
    } else {
        let checkpoint = checkpoint::load(path, None, false)?;
        let tensors: Vec<TensorRow> = checkpoint
            .tensor_info()
            .into_iter()
            .map(|info| TensorRow {
                name: info.name,
                shape: info.shape.iter().map(|&d| d as i64).collect(),
                dtype: info.dtype.name().to_string(),
                bytes: info.size,
            })
            .collect();
        Report {
            file: String::new(),
            format: checkpoint.format.clone(),
            size: 0,
            sha256: String::new(),
            description: None,
            tensor_count: checkpoint.len(),
            data_bytes: checkpoint.total_bytes(),
            operators: Vec::new(),
            metadata: checkpoint
                .metadata
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            tensors: Some(tensors),
        }
    };

    report.file = path.display().to_string();
    report.size = data.len();
    report.sha256 = hash_to_hex(&sha256(&data));
    if !list_tensors {
        report.tensors = None;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(())
}

fn tflite_report(model: &TFLiteModel) -> Report {
    let tensors: Vec<TensorRow> = model
        .subgraphs
        .iter()
        .flat_map(|s| &s.tensors)
        .map(|t| TensorRow {
            name: t.name.clone(),
            shape: t.shape.iter().map(|&d| d as i64).collect(),
            dtype: t.dtype.name().to_string(),
            bytes: t.data.len(),
        })
        .collect();

    let operators = model
        .subgraphs
        .iter()
        .flat_map(|s| &s.operators)
        .map(|op| {
            let code = model.operator_codes.get(op.opcode_index as usize).copied();
            match code.and_then(BuiltinOperator::from_code) {
                Some(builtin) => builtin.name().to_string(),
                None => format!("BUILTIN_{}", code.unwrap_or(-1)),
            }
        })
        .collect();

    let metadata = model
        .metadata
        .iter()
        .map(|m| {
            let value = model
                .buffers
                .get(m.buffer as usize)
                .map(|b| String::from_utf8_lossy(b).trim_end_matches('\0').to_string())
                .unwrap_or_default();
            (m.name.clone(), value)
        })
        .collect();

    Report {
        file: String::new(),
        format: format!("tflite (schema v{})", model.version),
        size: 0,
        sha256: String::new(),
        description: model.description.clone(),
        tensor_count: model.tensor_count(),
        data_bytes: tensors.iter().map(|t| t.bytes).sum(),
        operators,
        metadata,
        tensors: Some(tensors),
    }
}

fn print_report(report: &Report) {
    println!("Model Information");
    println!("=================");
    println!();
    println!("File:        {}", report.file);
    println!("Format:      {}", report.format);
    println!("Size:        {} bytes", report.size);
    println!("SHA-256:     {}", report.sha256);
    if let Some(description) = &report.description {
        println!("Description: {}", description);
    }
    println!("Tensors:     {}", report.tensor_count);
    println!("Data:        {} bytes", report.data_bytes);

    if !report.operators.is_empty() {
        println!();
        println!("Operators:");
        for (i, op) in report.operators.iter().enumerate() {
            println!("  [{}] {}", i, op);
        }
    }

    if !report.metadata.is_empty() {
        println!();
        println!("Metadata:");
        for (key, value) in &report.metadata {
            println!("  {}: {}", key, value);
        }
    }

    if let Some(tensors) = &report.tensors {
        println!();
        println!("Tensors:");
        for t in tensors {
            println!("  {} {:?} {} ({} bytes)", t.name, t.shape, t.dtype, t.bytes);
        }
    }
}
