//! Inspect command implementation

use super::NetworkArgs;
use anyhow::Result;
use clap::Args;
use mdnet_cli::parser::parse_prefixes;
use mdnet_core::layers::Module;
use mdnet_core::Stage;
use serde::Serialize;

#[derive(Args, Debug)]
pub struct InspectCommand {
    #[command(flatten)]
    network: NetworkArgs,

    /// Comma-separated name prefixes to mark trainable, e.g. "fc4,fc5,fc6"
    #[arg(long)]
    select: Option<String>,

    /// Print JSON instead of a table
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct ParamRow<'a> {
    name: &'a str,
    shape: &'a [usize],
    trainable: bool,
}

#[derive(Serialize)]
struct Report<'a> {
    stages: Vec<(&'static str, Vec<String>)>,
    branches: usize,
    parameter_count: usize,
    parameters: Vec<ParamRow<'a>>,
}

fn describe(module: &Module) -> String {
    match module {
        Module::Conv(conv) => format!("conv(out={}, stride={})", conv.out_channels(), conv.stride()),
        Module::Relu => "relu".to_string(),
        Module::Lrn(_) => "lrn".to_string(),
        Module::MaxPool(_) => "max_pool".to_string(),
        Module::Dropout(dropout) => format!("dropout({})", dropout.probability()),
        Module::Linear(_) => "linear".to_string(),
        Module::BatchNorm(norm) => format!("batch_norm({})", norm.channels()),
    }
}

impl InspectCommand {
    pub fn execute(self) -> Result<()> {
        let mut net = self.network.build()?;
        if let Some(select) = &self.select {
            net.set_learnable_params(&parse_prefixes(select));
        }

        let stages = Stage::ALL
            .into_iter()
            .map(|stage| {
                let modules: Vec<String> = net.stage(stage).modules().iter().map(describe).collect();
                (stage.name(), modules)
            })
            .collect();
        let report = Report {
            stages,
            branches: net.num_branches(),
            parameter_count: net.parameter_count(),
            parameters: net
                .registry()
                .iter()
                .map(|entry| ParamRow {
                    name: &entry.name,
                    shape: &entry.shape,
                    trainable: entry.trainable,
                })
                .collect(),
        };

        if self.json {
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(());
        }

        println!("Backbone:");
        for (name, modules) in &report.stages {
            println!("  {:<10} {}", name, modules.join(" -> "));
        }
        println!(
            "Branches: {} x fc6 (dropout -> linear 512->2)",
            report.branches
        );
        println!("Parameters ({} scalars):", report.parameter_count);
        for row in &report.parameters {
            println!(
                "  [{}] {:<18} {:?}",
                if row.trainable { "x" } else { " " },
                row.name,
                row.shape
            );
        }
        Ok(())
    }
}
