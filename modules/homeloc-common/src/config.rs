use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::error::PipelineError;

/// API keys. Loaded from the environment (and `.env`), never from the TOML file.
#[derive(Debug, Clone)]
pub struct Secrets {
    pub twitterapi_key: String,
    pub google_maps_api_key: String,
}

impl Secrets {
    pub fn from_env() -> std::result::Result<Self, PipelineError> {
        dotenvy::dotenv().ok();

        let secrets = Self {
            twitterapi_key: required_env("TWITTERAPI_KEY")?,
            google_maps_api_key: required_env("GOOGLE_MAPS_API_KEY")?,
        };
        secrets.log_keys();
        Ok(secrets)
    }

    fn log_keys(&self) {
        fn preview(val: &str) -> String {
            let head: String = val.chars().take(5).collect();
            format!("{}...({} chars)", head, val.chars().count())
        }

        tracing::info!("Secrets loaded:");
        tracing::info!("  TWITTERAPI_KEY: {}", preview(&self.twitterapi_key));
        tracing::info!("  GOOGLE_MAPS_API_KEY: {}", preview(&self.google_maps_api_key));
    }
}

fn required_env(name: &str) -> std::result::Result<String, PipelineError> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(PipelineError::Config(format!("{name} is not set"))),
    }
}

/// Backoff schedule for one external collaborator.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub factor: u32,
    pub max_jitter_ms: u64,
}

impl RetrySettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_jitter(&self) -> Duration {
        Duration::from_millis(self.max_jitter_ms)
    }

    fn graph_default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            factor: 2,
            max_jitter_ms: 250,
        }
    }

    fn geocoder_default() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 500,
            factor: 2,
            max_jitter_ms: 0,
        }
    }
}

/// Pipeline tunables. Every field has a default, so an empty TOML file (or no
/// file at all) yields the standard configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    // Layout
    pub raw_data_dir: PathBuf,
    pub state_dir: PathBuf,
    pub final_dir: PathBuf,
    pub posts_file_name: String,
    pub cohorts: Vec<String>,

    // Tiers
    pub star_threshold: u64,
    pub star_follower_ceiling: u64,
    pub star_max_fetch: usize,
    pub suspect_empty_threshold: u64,

    // Fetch engine
    pub threads: usize,
    pub min_request_interval_ms: u64,
    pub page_size: u32,
    pub checkpoint_every_serial: usize,
    pub checkpoint_every_concurrent: usize,
    pub rate_limit_fallback_secs: u64,
    pub rate_limit_margin_secs: u64,
    pub graph_retry: RetrySettings,
    pub fetch_missing_profiles: bool,

    // Geocoding
    pub geocoder_retry: RetrySettings,
    pub geocode_checkpoint_every: usize,
    pub self_report_checkpoint_every: usize,

    // Heuristic thresholds
    pub network_min_count: u32,
    pub text_min_count: u32,
    pub text_min_probability: f64,
    pub city_min_count: u32,
    pub small_sample_max: usize,
    pub state_min_count: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            raw_data_dir: PathBuf::from("raw_x_data"),
            state_dir: PathBuf::from("User_Location_Analysis"),
            final_dir: PathBuf::from("final_user_locations"),
            posts_file_name: "posts_english_2015-2025_all_info.json".to_string(),
            cohorts: [
                "baltimore",
                "buffalo",
                "el paso",
                "fayetteville",
                "portland",
                "rockford",
                "san_francisco",
                "scranton",
                "southbend",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            star_threshold: 1000,
            star_follower_ceiling: 5000,
            star_max_fetch: 200,
            suspect_empty_threshold: 1000,
            threads: 1,
            min_request_interval_ms: 300,
            page_size: 200,
            checkpoint_every_serial: 10,
            checkpoint_every_concurrent: 20,
            rate_limit_fallback_secs: 5,
            rate_limit_margin_secs: 5,
            graph_retry: RetrySettings::graph_default(),
            fetch_missing_profiles: false,
            geocoder_retry: RetrySettings::geocoder_default(),
            geocode_checkpoint_every: 50,
            self_report_checkpoint_every: 10,
            network_min_count: 2,
            text_min_count: 2,
            text_min_probability: 0.9,
            city_min_count: 2,
            small_sample_max: 3,
            state_min_count: 2,
        }
    }
}

impl PipelineConfig {
    /// Load from a TOML file. Missing keys fall back to defaults; unknown keys are rejected.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: PipelineConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), PipelineError> {
        if self.threads == 0 {
            return Err(PipelineError::Config("threads must be at least 1".into()));
        }
        if self.checkpoint_every_serial == 0 || self.checkpoint_every_concurrent == 0 {
            return Err(PipelineError::Config("checkpoint intervals must be at least 1".into()));
        }
        if self.graph_retry.max_attempts == 0 || self.geocoder_retry.max_attempts == 0 {
            return Err(PipelineError::Config("retry max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }

    /// Checkpoint cadence for the fetch engine at the configured thread count.
    pub fn checkpoint_every(&self) -> usize {
        if self.threads > 1 {
            self.checkpoint_every_concurrent
        } else {
            self.checkpoint_every_serial
        }
    }
}
