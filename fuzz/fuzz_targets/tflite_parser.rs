//! Fuzz target for the TFLite parser
//!
//! Arbitrary bytes must produce a model or an error, never a panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use tflconv_tflite::TFLiteParser;

fuzz_target!(|data: &[u8]| {
    let parser = TFLiteParser::new();

    if let Ok(model) = parser.parse(data) {
        let _ = model.tensor_count();
        let _ = model.metadata_buffer("min_runtime_version");
    }
});
