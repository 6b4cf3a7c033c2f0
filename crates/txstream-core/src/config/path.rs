//! Command-line arguments and config path helpers.

use std::path::{Path, PathBuf};

use clap::Parser;

/// Config file used when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "config.yml";

/// Check if a path has a YAML extension.
pub fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext == "yaml" || ext == "yml")
        .unwrap_or(false)
}

#[derive(Parser, Debug)]
#[command(version, about = "Consume transactions from Kafka into the document store")]
pub struct CliArgs {
    /// Path to the application config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,
}
