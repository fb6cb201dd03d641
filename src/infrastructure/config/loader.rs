use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid min_failed_suites_to_skip_retry: {0}. Must be at least 1")]
    InvalidRetryThreshold(usize),

    #[error("Invalid summary limits: size_limit ({0}) and failure_limit ({1}) must be positive")]
    InvalidSummaryLimits(usize, usize),

    #[error(
        "Invalid flake windows: short_window_intervals ({0}) must be positive and not exceed long_window_intervals ({1})"
    )]
    InvalidFlakeWindows(u32, u32),

    #[error("Invalid max_poll_rounds: {0}. Must be at least 1")]
    InvalidPollRounds(u32),

    #[error("Invalid {0} endpoint: {1}. Must be an http(s) URL")]
    InvalidEndpoint(&'static str, String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .tryjob/config.yaml (project config)
    /// 3. .tryjob/local.yaml (project local overrides, optional)
    /// 4. Environment variables (TRYJOB_* prefix, `__` separates sections)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".tryjob/config.yaml"))
            .merge(Yaml::file(".tryjob/local.yaml"))
            .merge(Env::prefixed("TRYJOB_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file, still honoring environment
    /// overrides
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("TRYJOB_").split("__"))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        if config.retry.min_failed_suites_to_skip_retry == 0 {
            return Err(ConfigError::InvalidRetryThreshold(
                config.retry.min_failed_suites_to_skip_retry,
            ));
        }

        if config.summary.size_limit == 0 || config.summary.failure_limit == 0 {
            return Err(ConfigError::InvalidSummaryLimits(
                config.summary.size_limit,
                config.summary.failure_limit,
            ));
        }

        let flakes = &config.flakes;
        if flakes.short_window_intervals == 0 || flakes.short_window_intervals > flakes.long_window_intervals {
            return Err(ConfigError::InvalidFlakeWindows(
                flakes.short_window_intervals,
                flakes.long_window_intervals,
            ));
        }
        if flakes.strong_min_unexpected_recent_verdicts > flakes.recent_verdict_window {
            return Err(ConfigError::ValidationFailed(format!(
                "strong_min_unexpected_recent_verdicts ({}) exceeds recent_verdict_window ({})",
                flakes.strong_min_unexpected_recent_verdicts, flakes.recent_verdict_window
            )));
        }

        if config.remote.max_poll_rounds == 0 {
            return Err(ConfigError::InvalidPollRounds(config.remote.max_poll_rounds));
        }

        for (name, url) in [
            ("failure_rate", &config.analysis.failure_rate_url),
            ("known_flakes", &config.analysis.known_flakes_url),
        ] {
            if let Some(url) = url {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(ConfigError::InvalidEndpoint(name, url.clone()));
                }
            }
        }

        Ok(())
    }
}
