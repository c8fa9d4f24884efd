//! Error taxonomy shared by every GTN crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GtnError>;

#[derive(Debug, Error)]
pub enum GtnError {
    /// A required piece (learners, metrics, curriculum, data) is missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// State was queried before the owning component was prepared.
    #[error("{0} used before it was prepared")]
    NotPrepared(&'static str),

    /// Shape, dtype and device failures from the tensor engine, unmodified.
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl GtnError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
