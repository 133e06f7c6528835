//! tflconv PyTorch - PyTorch checkpoint support
//!
//! Loads `.pt`/`.pth` checkpoints (zip archives holding `data.pkl`, as
//! written by PyTorch 1.6 and later) into a [`tflconv_core::Checkpoint`].

mod loader;

pub use loader::{is_pytorch, PyTorchLoader, PYTORCH_EXTENSIONS};
