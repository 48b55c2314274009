//! Configuration loading: toml file merged with command-line overrides.

use std::path::{Path, PathBuf};

use anyhow::Context;
use bank_core::config::BankConfig;

/// Default store directory when neither config nor flag names one.
const DEFAULT_DATA_DIR: &str = "./bank-data";

/// Load configuration from `path` (when given), then apply overrides.
pub fn load(path: Option<&Path>, data_dir: Option<PathBuf>) -> anyhow::Result<BankConfig> {
    let mut config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?
        }
        None => BankConfig::default(),
    };
    if let Some(dir) = data_dir {
        config.data_dir = Some(dir);
    }
    if config.data_dir.is_none() {
        config.data_dir = Some(PathBuf::from(DEFAULT_DATA_DIR));
    }
    Ok(config)
}
