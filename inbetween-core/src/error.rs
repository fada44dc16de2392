//! Error types for inbetween-core.

use std::path::PathBuf;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Model weights are not on disk and could not be fetched.
    #[error("checkpoint not found: {}", .0.display())]
    MissingCheckpoint(PathBuf),

    /// Caller-supplied image or tensor has the wrong layout.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// The accelerator ran out of memory.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// The model config names an architecture no loader is registered for.
    #[error("unknown model architecture: {0}")]
    UnknownArchitecture(String),

    /// Candle tensor/model error.
    #[error("candle: {0}")]
    Candle(candle_core::Error),

    /// Image decoding/encoding error.
    #[error("image: {0}")]
    Image(#[from] image::ImageError),

    /// Tokenizer error.
    #[error("tokenizer: {0}")]
    Tokenizer(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    /// HuggingFace Hub error.
    #[error("hf-hub: {0}")]
    HfHub(String),
}

/// Coarse classification of a failed generation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself is unusable; retrying it unchanged will fail again.
    Validation,
    /// Not enough accelerator memory for the request.
    Resource,
    /// Everything else: missing weights, broken config, backend failures.
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::MalformedInput(_) => ErrorKind::Validation,
            Error::ResourceExhausted(_) => ErrorKind::Resource,
            _ => ErrorKind::Internal,
        }
    }
}

const OUT_OF_MEMORY_MARKERS: [&str; 3] = ["out of memory", "OUT_OF_MEMORY", "failed to allocate"];

impl From<candle_core::Error> for Error {
    fn from(error: candle_core::Error) -> Self {
        let message = error.to_string();
        if OUT_OF_MEMORY_MARKERS.iter().any(|m| message.contains(m)) {
            Error::ResourceExhausted(message)
        } else {
            Error::Candle(error)
        }
    }
}

impl From<tokenizers::Error> for Error {
    fn from(error: tokenizers::Error) -> Self {
        Error::Tokenizer(error.to_string())
    }
}

impl From<hf_hub::api::tokio::ApiError> for Error {
    fn from(error: hf_hub::api::tokio::ApiError) -> Self {
        Error::HfHub(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_memory_is_a_resource_error() {
        let message = "CUDA_ERROR_OUT_OF_MEMORY: out of memory";
        let err: Error = candle_core::Error::Msg(message.into()).into();
        assert_eq!(err.kind(), ErrorKind::Resource);
    }

    #[test]
    fn shape_mismatch_stays_a_candle_error() {
        let err: Error = candle_core::Error::Msg("shape mismatch in cat".into()).into();
        assert!(matches!(err, Error::Candle(_)));
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn malformed_input_is_a_validation_error() {
        assert_eq!(Error::MalformedInput("x".into()).kind(), ErrorKind::Validation);
        assert_eq!(
            Error::MissingCheckpoint("checkpoints/model.ckpt".into()).kind(),
            ErrorKind::Internal
        );
    }
}
