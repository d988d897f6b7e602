//! CLI entry point for gridctl.

use clap::Parser;
use gridctl::CliConfig;

fn main() -> anyhow::Result<()> {
    let config = CliConfig::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log.as_str().into()),
        )
        .with_writer(std::io::stderr)
        .init();
    config.run()
}
