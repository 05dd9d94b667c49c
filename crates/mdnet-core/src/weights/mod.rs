//! Pretrained weight ingestion
//!
//! Two formats are supported:
//! - **native**: a safetensors checkpoint whose `shared_layers.*` tensors hold
//!   the whole backbone
//! - **foreign**: a MatConvNet model stored as a level-5 MAT-file, of which
//!   only the first three convolutions are used
//!
//! The format is recognised from file content, never from the extension.

pub mod foreign;
pub mod mat;
pub mod native;

use crate::error::{NetworkError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

const SNIFF_LEN: u64 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightFormat {
    Native,
    Foreign,
}

impl WeightFormat {
    /// Recognise a weight file from its leading bytes
    pub fn sniff(head: &[u8]) -> Result<Self> {
        if head.starts_with(mat::MAT5_MAGIC) {
            return Ok(WeightFormat::Foreign);
        }
        if head.starts_with(mat::MAT73_MAGIC) {
            return Err(NetworkError::Format(
                "MAT-file v7.3 (HDF5) is not supported; re-save with -v7".to_string(),
            ));
        }
        if native::looks_like_safetensors(head) {
            return Ok(WeightFormat::Native);
        }
        Err(NetworkError::Format("Unknown model format".to_string()))
    }

    pub fn detect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut head = Vec::with_capacity(SNIFF_LEN as usize);
        File::open(path)?.take(SNIFF_LEN).read_to_end(&mut head)?;
        let format = Self::sniff(&head)?;
        debug!("Detected {:?} weights in {}", format, path.display());
        Ok(format)
    }
}

/// A pretrained weight file to install at construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSource {
    pub path: PathBuf,
    /// Sniffed from content when `None`
    #[serde(default)]
    pub format: Option<WeightFormat>,
}

impl WeightSource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            format: None,
        }
    }

    #[must_use]
    pub fn with_format(mut self, format: WeightFormat) -> Self {
        self.format = Some(format);
        self
    }
}
