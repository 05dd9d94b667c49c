//! Convert command implementation

use anyhow::{Context as _, Result};
use clap::Args;
use mdnet_cli::parser::format_from_extension;
use mdnet_core::{MdNet, NetworkConfig, WeightFormat};
use std::path::PathBuf;
use tracing::info;

#[derive(Args, Debug)]
pub struct ConvertCommand {
    /// Source weight file
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Output checkpoint (defaults to the input with a .safetensors extension)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Force the source format instead of guessing
    #[arg(long, value_parser = parse_format)]
    format: Option<WeightFormat>,
}

fn parse_format(value: &str) -> Result<WeightFormat, String> {
    match value {
        "native" => Ok(WeightFormat::Native),
        "foreign" | "matconvnet" => Ok(WeightFormat::Foreign),
        other => Err(format!("unknown format {other:?}, expected native or foreign")),
    }
}

impl ConvertCommand {
    pub fn execute(self) -> Result<()> {
        if !self.input.exists() {
            anyhow::bail!("Input file does not exist: {}", self.input.display());
        }
        let output = self
            .output
            .clone()
            .unwrap_or_else(|| self.input.with_extension("safetensors"));
        if output == self.input {
            anyhow::bail!("Output would overwrite the input: {}", output.display());
        }

        let format = self.format.or_else(|| format_from_extension(&self.input));
        let mut net = MdNet::new(NetworkConfig::tracking()).context("Failed to build network")?;
        net.load_weights(&self.input, format)
            .with_context(|| format!("Failed to load {}", self.input.display()))?;
        net.save_native_weights(&output)
            .with_context(|| format!("Failed to write {}", output.display()))?;

        info!("Converted {} -> {}", self.input.display(), output.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format() {
        assert_eq!(parse_format("native"), Ok(WeightFormat::Native));
        assert_eq!(parse_format("matconvnet"), Ok(WeightFormat::Foreign));
        assert!(parse_format("onnx").is_err());
    }
}
