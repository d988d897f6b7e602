//! Command-line arguments.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use corelib::GridConfig;

use crate::commands::Command;

/// Inspect and simulate partition assignment.
#[derive(Debug, Parser)]
#[command(name = "gridctl", version, about)]
pub struct CliConfig {
    /// JSON config file. Missing fields keep their defaults.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the partition count of the config.
    #[arg(short, long, global = true)]
    pub partitions: Option<u32>,

    /// Override the backup count of the config.
    #[arg(short, long, global = true)]
    pub backups: Option<usize>,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    pub log: String,

    #[command(subcommand)]
    pub command: Command,
}

impl CliConfig {
    /// The grid config after file loading and overrides.
    pub fn grid_config(&self) -> anyhow::Result<GridConfig> {
        let mut config = match &self.config {
            Some(path) => GridConfig::from_json_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => GridConfig::default(),
        };
        if let Some(partitions) = self.partitions {
            config.partition_count = partitions;
        }
        if let Some(backups) = self.backups {
            config.backup_count = backups;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn run(self) -> anyhow::Result<()> {
        let config = self.grid_config()?;
        let result = self.command.execute(&config)?;
        println!("{result}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let cli = CliConfig::parse_from(["gridctl", "-p", "10", "-b", "2", "config"]);
        let config = cli.grid_config().unwrap();
        assert_eq!(config.partition_count, 10);
        assert_eq!(config.backup_count, 2);
        assert_eq!(config.migration.parallelism, 4);
    }

    #[test]
    fn invalid_override_is_rejected() {
        let cli = CliConfig::parse_from(["gridctl", "--partitions", "0", "config"]);
        assert!(cli.grid_config().is_err());
    }

    #[test]
    fn missing_config_file_is_reported() {
        let cli = CliConfig::parse_from(["gridctl", "-c", "/nonexistent/grid.json", "config"]);
        let err = cli.grid_config().unwrap_err();
        assert!(err.to_string().contains("/nonexistent/grid.json"));
    }
}
