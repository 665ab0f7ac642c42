//! Configuration loading

use std::path::Path;
use anyhow::Result;
use venice_common::config::Config;

/// Load configuration from file, falling back to defaults if it doesn't exist.
pub async fn load(path: &str) -> Result<Config> {
    let path = Path::new(path);

    if path.exists() {
        Config::load(path).await.map_err(|e| anyhow::anyhow!(e))
    } else {
        Ok(Config::default())
    }
}
