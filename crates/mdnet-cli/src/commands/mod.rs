//! Subcommands and the network options they share

pub mod convert;
pub mod inspect;
pub mod score;

use anyhow::{Context as _, Result};
use clap::Args;
use mdnet_cli::parser::format_from_extension;
use mdnet_core::{MdNet, NetworkConfig, WeightSource};
use std::path::PathBuf;
use tracing::info;

/// Options for constructing the network
#[derive(Args, Debug)]
pub struct NetworkArgs {
    /// YAML network configuration; flags below override it
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Pretrained weights (.safetensors or MatConvNet .mat)
    #[arg(short, long, value_name = "FILE")]
    weights: Option<PathBuf>,

    /// Number of domain branches
    #[arg(long)]
    branches: Option<usize>,

    /// Enable the bbox-regression transform before conv3
    #[arg(long)]
    stn: bool,
}

impl NetworkArgs {
    pub fn build(&self) -> Result<MdNet> {
        let mut config = match &self.config {
            Some(path) => NetworkConfig::from_yaml(path)
                .with_context(|| format!("Failed to read config {}", path.display()))?,
            None => NetworkConfig::tracking(),
        };
        if let Some(branches) = self.branches {
            config.num_branches = branches;
        }
        if self.stn {
            config.enable_stn = true;
        }
        if let Some(path) = &self.weights {
            config.weights = Some(WeightSource {
                path: path.clone(),
                format: format_from_extension(path),
            });
        }

        info!(
            "Building network: {} branches, transform {}",
            config.num_branches,
            if config.enable_stn { "on" } else { "off" }
        );
        MdNet::new(config).context("Failed to build network")
    }
}
