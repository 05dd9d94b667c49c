//! Error types for the network core

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("Duplicated param name: {0}")]
    DuplicateName(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Weight format error: {0}")]
    Format(String),

    #[error("Shape mismatch for {name}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SafeTensors error: {0}")]
    SafeTensors(#[from] safetensors::SafeTensorError),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    #[error("Array shape error: {0}")]
    Array(#[from] ndarray::ShapeError),
}

/// Coarse error category a caller can branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Topology bug detected while building the network; never recoverable
    Construction,
    /// Unreadable or incompatible weight/config file; fatal to that load
    Format,
    /// Bad branch index, layer name or traversal range; fatal to that call
    InvalidArgument,
    /// Filesystem failure
    Io,
}

impl NetworkError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetworkError::DuplicateName(_) => ErrorKind::Construction,
            NetworkError::Format(_)
            | NetworkError::ShapeMismatch { .. }
            | NetworkError::SafeTensors(_)
            | NetworkError::Yaml(_) => ErrorKind::Format,
            NetworkError::InvalidArgument(_) | NetworkError::Tensor(_) | NetworkError::Array(_) => {
                ErrorKind::InvalidArgument
            }
            NetworkError::Io(_) => ErrorKind::Io,
        }
    }
}

/// Result type for network operations
pub type Result<T> = std::result::Result<T, NetworkError>;
