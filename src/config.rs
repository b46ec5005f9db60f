use envconfig::Envconfig;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::reconciler::ReconcilerConfig;

#[derive(Debug, Envconfig, Clone)]
pub struct Config {
    /// API key used for bearer authorization
    #[envconfig(from = "SENDGRID_API_KEY")]
    pub api_key: String,

    /// Base URL of the account API
    #[envconfig(from = "SENDGRID_BASE_URL", default = "https://api.sendgrid.com")]
    pub base_url: String,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,

    /// Fixed backoff between request attempts
    #[envconfig(from = "REQUEST_BACKOFF", default = "5s")]
    pub request_backoff: humantime::Duration,

    /// Pacing of create/delete calls per operation class
    #[envconfig(from = "RATE_LIMIT_INTERVAL", default = "5s")]
    pub rate_limit_interval: humantime::Duration,

    #[envconfig(from = "CREATE_TIMEOUT", default = "20m")]
    pub create_timeout: humantime::Duration,

    #[envconfig(from = "UPDATE_TIMEOUT", default = "20m")]
    pub update_timeout: humantime::Duration,

    /// Sleep before the first convergence probe
    #[envconfig(from = "RECONCILE_DELAY", default = "5s")]
    pub reconcile_delay: humantime::Duration,

    /// Sleep between convergence probes
    #[envconfig(from = "RECONCILE_MIN_TIMEOUT", default = "5s")]
    pub reconcile_min_timeout: humantime::Duration,

    /// Consecutive matching reads required before a change counts as applied
    #[envconfig(from = "RECONCILE_OCCURRENCES", default = "3")]
    pub reconcile_occurrences: u32,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> std::result::Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() {
            return Err(Error::Configuration("API key cannot be empty".to_string()));
        }

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(Error::Configuration(
                "Base URL must start with 'http://' or 'https://'".to_string(),
            ));
        }

        if Duration::from(self.rate_limit_interval).is_zero() {
            return Err(Error::Configuration(
                "Rate limit interval must be greater than 0".to_string(),
            ));
        }

        if self.reconcile_occurrences == 0 {
            return Err(Error::Configuration(
                "Reconcile occurrences must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn request_backoff(&self) -> Duration {
        self.request_backoff.into()
    }

    pub fn rate_limit_interval(&self) -> Duration {
        self.rate_limit_interval.into()
    }

    /// Polling settings for waiting on a freshly created resource.
    pub fn create_reconciler(&self) -> ReconcilerConfig {
        self.reconciler(self.create_timeout.into())
    }

    /// Polling settings for waiting on an updated resource.
    pub fn update_reconciler(&self) -> ReconcilerConfig {
        self.reconciler(self.update_timeout.into())
    }

    fn reconciler(&self, timeout: Duration) -> ReconcilerConfig {
        ReconcilerConfig {
            timeout,
            delay: self.reconcile_delay.into(),
            min_timeout: self.reconcile_min_timeout.into(),
            required_consecutive: self.reconcile_occurrences,
        }
    }
}
