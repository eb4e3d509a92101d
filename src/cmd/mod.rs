pub mod decode;
pub mod rules;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Session pipeline core: DNS wire parsing and a field-indexed rule engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Path to the configuration file
    #[arg(
        short,
        long,
        default_value = "/etc/vigil/vigil.toml",
        env = "CONFIG_PATH"
    )]
    config_path: PathBuf,
    #[command(subcommand)]
    inner: Commands,
}

impl Args {
    pub async fn run(self) {
        let config = vigil::config::Config::load(&self.config_path);
        match self.inner {
            Commands::Decode(inner) => inner.run(config),
            Commands::Rules(inner) => inner.run(config).await,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    Decode(decode::Command),
    Rules(rules::Command),
}
