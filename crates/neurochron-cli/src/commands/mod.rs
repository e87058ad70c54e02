//! CLI command implementations.

pub mod jobs;

use std::path::Path;

use anyhow::{Context, Result, bail};
use neurochron_config::SystemConfig;

/// Load and validate a system configuration file, printing a summary.
pub fn validate_config(path: &str) -> Result<()> {
    let path = Path::new(path);
    if !path.exists() {
        bail!("configuration file not found: {}", path.display());
    }
    let config = SystemConfig::load(path)
        .with_context(|| format!("invalid configuration: {}", path.display()))?;

    println!("Configuration is valid");
    for line in summary(&config) {
        println!("  {line}");
    }
    Ok(())
}

fn summary(config: &SystemConfig) -> Vec<String> {
    let store = if config.database.url.is_some() {
        "postgres"
    } else {
        "in-memory"
    };
    vec![
        format!("bind:          {}", config.server.bind),
        format!("store:         {store}"),
        format!("workers:       {}", config.dispatcher.workers),
        format!("lease ttl:     {}s", config.dispatcher.lease_ttl.as_secs()),
        format!("preprocessor:  {}", config.preprocessor.image),
        format!("notifier:      {:?}", config.notifier.backend),
    ]
}
