//! Score command implementation

use super::NetworkArgs;
use anyhow::{Context as _, Result};
use clap::Args;
use mdnet_cli::crop::crop_to_tensor;
use mdnet_cli::parser::parse_bbox;
use mdnet_core::{Endpoint, Stage};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Args, Debug)]
pub struct ScoreCommand {
    /// Input image
    #[arg(value_name = "IMAGE")]
    image: PathBuf,

    #[command(flatten)]
    network: NetworkArgs,

    /// Region to crop as x,y,w,h (whole image when omitted)
    #[arg(long)]
    bbox: Option<String>,

    /// Branch (domain) index
    #[arg(long, default_value = "0")]
    branch: usize,

    /// Layer to start from
    #[arg(long, default_value = "conv1")]
    start: String,

    /// Layer to stop after: a backbone stage, fc6 or fc6_softmax
    #[arg(long, default_value = "fc6_softmax")]
    end: String,
}

#[derive(Serialize)]
struct ScoreOutput {
    image: String,
    layer: String,
    shape: Vec<usize>,
    values: Vec<f32>,
}

impl ScoreCommand {
    pub fn execute(self) -> Result<()> {
        let start: Stage = self.start.parse()?;
        let end: Endpoint = self.end.parse()?;
        let bbox = self
            .bbox
            .as_deref()
            .map(parse_bbox)
            .transpose()
            .context("Invalid --bbox")?;

        let image = image::open(&self.image)
            .with_context(|| format!("Failed to open image {}", self.image.display()))?
            .to_rgb8();
        debug!("Loaded {}x{} image", image.width(), image.height());

        let net = self.network.build()?;
        let input = crop_to_tensor(&image, bbox.as_ref(), net.device())?;
        let output = net
            .forward(&input, self.branch, start, end)
            .context("Forward pass failed")?;
        info!("{} -> {} output {:?}", start, end, output.dims());

        let report = ScoreOutput {
            image: self.image.display().to_string(),
            layer: end.to_string(),
            shape: output.dims().to_vec(),
            values: output.flatten_all()?.to_vec1()?,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        Ok(())
    }
}
