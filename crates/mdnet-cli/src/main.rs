//! MDNet CLI - inspect, convert and run the multi-domain tracking network

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

mod commands;

use commands::convert::ConvertCommand;
use commands::inspect::InspectCommand;
use commands::score::ScoreCommand;

#[derive(Parser)]
#[command(
    name = "mdnet",
    version,
    about = "Multi-domain network tracker tools",
    after_help = "EXAMPLES:\n  \
                  # Show topology and which parameters an online update would train\n  \
                  mdnet inspect --weights models/mdnet_vot-otb.safetensors --select fc4,fc5,fc6\n\n  \
                  # Convert a MatConvNet model into a native checkpoint\n  \
                  mdnet convert models/imagenet-vgg-m.mat -o models/vgg-m.safetensors\n\n  \
                  # Score a target crop\n  \
                  mdnet score frame0001.jpg --bbox 306,5,95,65 --weights models/mdnet_vot-otb.safetensors"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the backbone topology and the parameter registry
    Inspect(InspectCommand),

    /// Convert a supported weight file into a native checkpoint
    Convert(ConvertCommand),

    /// Run an image crop through the network and print the output as JSON
    Score(ScoreCommand),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    match cli.command {
        Commands::Inspect(cmd) => cmd.execute(),
        Commands::Convert(cmd) => cmd.execute(),
        Commands::Score(cmd) => cmd.execute(),
    }
}
