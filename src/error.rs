//! User-facing failures
//!
//! Most of the crate propagates `anyhow::Error`. The variants here are the
//! failures a user can act on, so their `Display` text doubles as the message
//! printed before the process exits.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FluxGenError {
    #[error("CUDA is required to run FLUX models. Pass --cpu to run on the CPU (very slow).")]
    CudaUnavailable,

    #[error(
        "Failed to load model '{model_id}'.\n\
         The model may be private.\n\
         Please set HuggingFace token:\n\n  \
         export HF_TOKEN=your_huggingface_token\n\n\
         Original error: {source_message}"
    )]
    Unauthorized {
        model_id: String,
        source_message: String,
    },

    #[error("model file not found: {}", .0.display())]
    MissingModelFile(PathBuf),

    #[error(
        "Failed to apply LoRA from '{}'.\n\
         Error: {reason}\n\n\
         Ensure:\n\
         - LoRA is compatible with FLUX\n\
         - .safetensors file is valid",
        .path.display()
    )]
    LoraApplication { path: PathBuf, reason: String },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Whether an error message looks like a hub authentication failure.
pub fn is_auth_error(message: &str) -> bool {
    message.contains("401") || message.to_lowercase().contains("authorization")
}

/// Rewrite authentication failures into [`FluxGenError::Unauthorized`].
///
/// Every other error is returned untouched.
pub fn classify_load_error(model_id: &str, err: anyhow::Error) -> anyhow::Error {
    let message = format!("{err:#}");
    if is_auth_error(&message) {
        FluxGenError::Unauthorized {
            model_id: model_id.to_string(),
            source_message: message,
        }
        .into()
    } else {
        err
    }
}
