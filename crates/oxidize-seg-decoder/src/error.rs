use oxidize_seg_core::TensorError;
use thiserror::Error;

/// Errors raised while configuring or running the decoder.
#[derive(Debug, Error)]
pub enum DecoderError {
    #[error("ASPP expects exactly 3 atrous rates, got {got:?}")]
    InvalidAtrousRates { got: Vec<usize> },

    #[error("Invalid decoder configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Tensor(#[from] TensorError),

    #[error("Config JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type DecoderResult<T> = Result<T, DecoderError>;
