//! Validate command - load the layered configuration and print it

use anyhow::Context;
use clap::Args;
use std::path::Path;
use telemetry_config::PipelineConfig;

#[derive(Args, Debug, Clone)]
pub struct ValidateCommand {
    /// Print only the verdict, not the resolved configuration
    #[arg(long, short)]
    quiet: bool,
}

impl ValidateCommand {
    pub fn execute(&self, config_path: Option<&Path>) -> anyhow::Result<()> {
        let config = PipelineConfig::load(config_path).context("configuration is invalid")?;

        if !self.quiet {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        eprintln!(
            "configuration OK: {} lanes, {} anomaly rules",
            config.engine.lanes,
            config.anomaly.rules.len()
        );
        Ok(())
    }
}
