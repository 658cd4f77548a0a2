//! Configuration for Rookery
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// Rookery - regional bird catalog and identification service
#[derive(Parser, Debug, Clone)]
#[command(name = "rookery")]
#[command(about = "Regional bird catalog, identification and fact service")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Enable development mode (in-memory datastore, no upstream keys required)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "rookery")]
    pub mongodb_db: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Region code the catalog tracks
    #[arg(long, env = "REGION", default_value = "US-ME")]
    pub region: String,

    /// Observation provider API base URL
    #[arg(long, env = "OBSERVATION_API_URL", default_value = "https://api.ebird.org/v2")]
    pub observation_api_url: String,

    /// Observation provider API key
    #[arg(long, env = "OBSERVATION_API_KEY")]
    pub observation_api_key: Option<String>,

    /// Generative content API base URL
    #[arg(long, env = "GENERATOR_API_URL", default_value = "https://api.openai.com/v1")]
    pub generator_api_url: String,

    /// Generative content API key
    #[arg(long, env = "GENERATOR_API_KEY")]
    pub generator_api_key: Option<String>,

    /// Model used for fact generation and photo identification
    #[arg(long, env = "GENERATOR_MODEL", default_value = "gpt-4o-mini")]
    pub generator_model: String,

    /// Stock image search API base URL
    #[arg(long, env = "IMAGE_API_URL", default_value = "https://pixabay.com/api/")]
    pub image_api_url: String,

    /// Stock image search API key
    #[arg(long, env = "IMAGE_API_KEY")]
    pub image_api_key: Option<String>,

    /// Interval between scheduled catalog reconciliation checks, in seconds
    #[arg(long, env = "CATALOG_SYNC_INTERVAL_SECS", default_value = "21600")]
    pub catalog_sync_interval_secs: u64,

    /// Remote call retry ceiling (attempts, including the first)
    #[arg(long, env = "RETRY_MAX_ATTEMPTS", default_value = "5")]
    pub retry_max_attempts: u32,

    /// Base backoff delay in milliseconds; doubles per retry
    #[arg(long, env = "RETRY_BASE_DELAY_MS", default_value = "1000")]
    pub retry_base_delay_ms: u64,

    /// Photo identification request timeout in seconds
    #[arg(long, env = "IDENTIFY_TIMEOUT_SECS", default_value = "25")]
    pub identify_timeout_secs: u64,

    /// Fact generation request timeout in seconds
    #[arg(long, env = "FACTS_TIMEOUT_SECS", default_value = "20")]
    pub facts_timeout_secs: u64,

    /// Observation feed request timeout in seconds
    #[arg(long, env = "OBSERVATIONS_TIMEOUT_SECS", default_value = "15")]
    pub observations_timeout_secs: u64,

    /// Image search request timeout in seconds
    #[arg(long, env = "IMAGES_TIMEOUT_SECS", default_value = "10")]
    pub images_timeout_secs: u64,
}

impl Args {
    pub fn retry_policy(&self, timeout: Duration) -> crate::remote::RetryPolicy {
        crate::remote::RetryPolicy::new(
            self.retry_max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
            timeout,
        )
    }

    pub fn identify_timeout(&self) -> Duration {
        Duration::from_secs(self.identify_timeout_secs)
    }

    pub fn facts_timeout(&self) -> Duration {
        Duration::from_secs(self.facts_timeout_secs)
    }

    pub fn observations_timeout(&self) -> Duration {
        Duration::from_secs(self.observations_timeout_secs)
    }

    pub fn images_timeout(&self) -> Duration {
        Duration::from_secs(self.images_timeout_secs)
    }

    /// Validate configuration at startup
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode {
            if self.observation_api_key.is_none() {
                return Err("OBSERVATION_API_KEY is required in production mode".to_string());
            }
            if self.generator_api_key.is_none() {
                return Err("GENERATOR_API_KEY is required in production mode".to_string());
            }
        }

        if self.retry_max_attempts == 0 {
            return Err("RETRY_MAX_ATTEMPTS must be at least 1".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Args {
        Args::parse_from(["rookery", "--dev-mode"])
    }

    #[test]
    fn dev_mode_needs_no_keys() {
        assert!(base_args().validate().is_ok());
    }

    #[test]
    fn production_requires_upstream_keys() {
        let args = Args::parse_from(["rookery"]);
        assert!(args.validate().is_err());

        let args = Args::parse_from([
            "rookery",
            "--observation-api-key",
            "obs",
            "--generator-api-key",
            "gen",
        ]);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn zero_retry_ceiling_rejected() {
        let args = Args::parse_from(["rookery", "--dev-mode", "--retry-max-attempts", "0"]);
        assert!(args.validate().is_err());
    }
}
