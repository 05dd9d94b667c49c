//! Network construction options

use crate::error::{NetworkError, Result};
use crate::weights::WeightSource;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for building an [`MdNet`](crate::MdNet)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Number of domain branches (K), fixed for the lifetime of the network
    pub num_branches: usize,
    /// Run the bbox-regression sub-branch and warp conv2 features before conv3
    pub enable_stn: bool,
    /// Zero the final regression conv and set its bias to the identity transform
    pub zero_init: bool,
    /// Clamp every predicted transform entry to `[-c, c]`; disabled when `None`
    pub theta_clamp: Option<f32>,
    /// Seed for parameter initialisation and dropout masks
    pub seed: u64,
    /// Pretrained weights installed right after construction
    pub weights: Option<WeightSource>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            num_branches: 1,
            enable_stn: false,
            zero_init: true,
            theta_clamp: None,
            seed: 0,
            weights: None,
        }
    }
}

impl NetworkConfig {
    /// Single-branch network used at tracking time
    #[must_use]
    pub fn tracking() -> Self {
        Self::default()
    }

    /// One branch per training video
    #[must_use]
    pub fn pretraining(num_domains: usize) -> Self {
        Self {
            num_branches: num_domains,
            ..Self::default()
        }
    }

    /// Same configuration with a pretrained weight file; the format is sniffed
    #[must_use]
    pub fn with_weights(mut self, path: impl Into<PathBuf>) -> Self {
        self.weights = Some(WeightSource::new(path));
        self
    }

    #[must_use]
    pub fn with_stn(mut self, enable: bool) -> Self {
        self.enable_stn = enable;
        self
    }

    pub fn from_yaml(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_branches == 0 {
            return Err(NetworkError::InvalidArgument(
                "num_branches must be at least 1".to_string(),
            ));
        }
        if let Some(clamp) = self.theta_clamp {
            if !(clamp.is_finite() && clamp > 0.0) {
                return Err(NetworkError::InvalidArgument(format!(
                    "theta_clamp must be positive and finite, got {clamp}"
                )));
            }
        }
        Ok(())
    }
}
