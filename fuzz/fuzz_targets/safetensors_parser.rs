#![no_main]

use libfuzzer_sys::fuzz_target;
use tflconv_safetensors::{serialize_safetensors, SafeTensorsParser};

fuzz_target!(|data: &[u8]| {
    let parser = SafeTensorsParser::new();
    let Ok(model) = parser.parse(data) else {
        return;
    };
    let Ok(checkpoint) = model.into_checkpoint() else {
        return;
    };

    // Anything that loads must serialize back to a parseable file
    let bytes = serialize_safetensors(&checkpoint).expect("serialize loaded checkpoint");
    parser.parse(&bytes).expect("reparse serialized checkpoint");
});
