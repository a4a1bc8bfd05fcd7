use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;

// Publisher service configuration sourced from environment variables.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    // Command channel listener bind address.
    pub bind: SocketAddr,
    // Metrics HTTP listener bind address.
    pub metrics_bind: SocketAddr,
    // Subscribers may request the NaN value filter.
    pub allow_nan_value_filter: bool,
    // The NaN value filter is applied regardless of subscriber request.
    pub force_nan_value_filter: bool,
    // Subscribers may request temporal (historical) subscriptions.
    pub allow_temporal_subscriptions: bool,
    // Subscribers may request metadata refreshes.
    pub allow_metadata_refresh: bool,
    // Compact-format subscriptions use rotating base-time offsets.
    pub use_base_time_offsets: bool,
}

const DEFAULT_CONFIG_PATH: &str = "/usr/local/gridpulse/config.yml";
const DEFAULT_ALLOW_NAN_VALUE_FILTER: bool = true;
const DEFAULT_FORCE_NAN_VALUE_FILTER: bool = false;
const DEFAULT_ALLOW_TEMPORAL_SUBSCRIPTIONS: bool = false;
const DEFAULT_ALLOW_METADATA_REFRESH: bool = true;
const DEFAULT_USE_BASE_TIME_OFFSETS: bool = true;

#[derive(Debug, Deserialize)]
struct PublisherConfigOverride {
    bind: Option<String>,
    metrics_bind: Option<String>,
    allow_nan_value_filter: Option<bool>,
    force_nan_value_filter: Option<bool>,
    allow_temporal_subscriptions: Option<bool>,
    allow_metadata_refresh: Option<bool>,
    use_base_time_offsets: Option<bool>,
}

impl PublisherConfig {
    pub fn from_env() -> Result<Self> {
        // Environment variables provide defaults for local development.
        let bind = std::env::var("GRIDPULSE_BIND")
            .unwrap_or_else(|_| "0.0.0.0:7165".to_string())
            .parse()
            .with_context(|| "parse GRIDPULSE_BIND")?;
        let metrics_bind = std::env::var("GRIDPULSE_METRICS_BIND")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse()
            .with_context(|| "parse GRIDPULSE_METRICS_BIND")?;
        let allow_nan_value_filter = env_bool(
            "GRIDPULSE_ALLOW_NAN_FILTER",
            DEFAULT_ALLOW_NAN_VALUE_FILTER,
        );
        let force_nan_value_filter = env_bool(
            "GRIDPULSE_FORCE_NAN_FILTER",
            DEFAULT_FORCE_NAN_VALUE_FILTER,
        );
        let allow_temporal_subscriptions = env_bool(
            "GRIDPULSE_ALLOW_TEMPORAL",
            DEFAULT_ALLOW_TEMPORAL_SUBSCRIPTIONS,
        );
        let allow_metadata_refresh = env_bool(
            "GRIDPULSE_ALLOW_METADATA_REFRESH",
            DEFAULT_ALLOW_METADATA_REFRESH,
        );
        let use_base_time_offsets = env_bool(
            "GRIDPULSE_USE_BASE_TIME_OFFSETS",
            DEFAULT_USE_BASE_TIME_OFFSETS,
        );
        Ok(Self {
            bind,
            metrics_bind,
            allow_nan_value_filter,
            force_nan_value_filter,
            allow_temporal_subscriptions,
            allow_metadata_refresh,
            use_base_time_offsets,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        let override_path = std::env::var("GRIDPULSE_CONFIG").ok();
        let config_path = override_path
            .clone()
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        let contents = match fs::read_to_string(&config_path) {
            Ok(contents) => Some(contents),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if override_path.is_some() {
                    return Err(err).with_context(|| format!("read GRIDPULSE_CONFIG: {config_path}"));
                }
                None
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read publisher config: {config_path}"));
            }
        };
        if let Some(contents) = contents {
            // YAML overrides allow ops-friendly config files.
            let override_cfg: PublisherConfigOverride =
                serde_yaml::from_str(&contents).with_context(|| "parse publisher config yaml")?;
            if let Some(value) = override_cfg.bind {
                config.bind = value.parse().with_context(|| "parse bind")?;
            }
            if let Some(value) = override_cfg.metrics_bind {
                config.metrics_bind = value.parse().with_context(|| "parse metrics_bind")?;
            }
            if let Some(value) = override_cfg.allow_nan_value_filter {
                config.allow_nan_value_filter = value;
            }
            if let Some(value) = override_cfg.force_nan_value_filter {
                config.force_nan_value_filter = value;
            }
            if let Some(value) = override_cfg.allow_temporal_subscriptions {
                config.allow_temporal_subscriptions = value;
            }
            if let Some(value) = override_cfg.allow_metadata_refresh {
                config.allow_metadata_refresh = value;
            }
            if let Some(value) = override_cfg.use_base_time_offsets {
                config.use_base_time_offsets = value;
            }
        }
        Ok(config)
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_environment() {
        let config = PublisherConfig::from_env().expect("config");
        assert_eq!(config.bind.port(), 7165);
        assert!(config.allow_nan_value_filter);
        assert!(!config.force_nan_value_filter);
        assert!(!config.allow_temporal_subscriptions);
        assert!(config.allow_metadata_refresh);
        assert!(config.use_base_time_offsets);
    }
}
