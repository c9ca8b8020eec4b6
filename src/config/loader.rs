use std::path::Path;

use anyhow::{Context, Result};

use crate::config::types::EngineConfig;

/// Load engine configuration from a YAML file, then apply environment overrides.
///
/// A missing file is not an error: the defaults are returned instead.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        tracing::info!(path = %path.display(), "Loaded engine configuration");
        parse_config(&content)?
    } else {
        tracing::debug!(path = %path.display(), "No config file, using defaults");
        EngineConfig::default()
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parse engine configuration from a YAML string.
pub fn parse_config(content: &str) -> Result<EngineConfig> {
    if content.trim().is_empty() {
        return Ok(EngineConfig::default());
    }
    serde_yaml::from_str(content).context("Failed to parse engine configuration")
}

/// Environment knobs take precedence over the file.
pub fn apply_env_overrides(config: &mut EngineConfig) {
    if let Some(v) = env_parse::<usize>("MATLAS_MAX_CONCURRENCY") {
        config.executor.max_concurrent_operations = v.max(1);
    }
    if let Some(v) = env_parse::<u64>("MATLAS_OPERATION_TIMEOUT_SECS") {
        config.executor.operation_timeout_secs = v;
    }
    if let Some(v) = env_parse::<bool>("MATLAS_PRESERVE_EXISTING") {
        config.executor.preserve_existing = v;
    }
    if let Some(v) = env_parse::<u64>("MATLAS_CACHE_TTL_SECS") {
        config.cache.default_ttl_secs = v;
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}
