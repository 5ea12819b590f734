//! YAML configuration loading for the binary. The result is an immutable
//! snapshot; a reload builds a fresh one and swaps it at the pool.

use std::path::Path;

use anyhow::{Context, Result};

use tailgate_core::Config;

pub fn load(path: Option<&Path>) -> Result<Config> {
    let Some(path) = path else {
        return Ok(Config::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let cfg = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing config {}", path.display()))?;
    Ok(cfg)
}
