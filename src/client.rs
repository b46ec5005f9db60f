use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::error::Result;
use crate::rate_limiter::RateLimiters;
use crate::reconciler::ReconcilerConfig;
use crate::request::{ExecutionResult, Operation, RequestExecutor, RequestOptions, DEFAULT_BACKOFF};
use crate::transport::{HttpTransport, ReqwestTransport};

/// Header that scopes a call to a subuser's account.
pub const HEADER_ON_BEHALF_OF: &str = "on-behalf-of";

/// Unreserved characters stay as they are; everything else is escaped.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Entry point for resource workflows.
///
/// Cloning is cheap and clones share the transport and the rate limiters,
/// so pacing holds across every task spawned from one client.
#[derive(Clone)]
pub struct Client {
    executor: RequestExecutor,
    limiters: RateLimiters,
    backoff: Duration,
    create: ReconcilerConfig,
    update: ReconcilerConfig,
}

impl Client {
    pub fn new(transport: Arc<dyn HttpTransport>, limiters: RateLimiters) -> Self {
        Self {
            executor: RequestExecutor::new(transport),
            limiters,
            backoff: DEFAULT_BACKOFF,
            create: ReconcilerConfig::default(),
            update: ReconcilerConfig::default(),
        }
    }

    /// Build the reqwest transport and process-wide limiters from `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let transport = ReqwestTransport::new(&config.base_url, &config.api_key)?;

        Ok(Self::new(
            Arc::new(transport),
            RateLimiters::new(config.rate_limit_interval()),
        )
        .with_backoff(config.request_backoff())
        .with_create_reconciler(config.create_reconciler())
        .with_update_reconciler(config.update_reconciler()))
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_create_reconciler(mut self, config: ReconcilerConfig) -> Self {
        self.create = config;
        self
    }

    pub fn with_update_reconciler(mut self, config: ReconcilerConfig) -> Self {
        self.update = config;
        self
    }

    pub fn limiters(&self) -> &RateLimiters {
        &self.limiters
    }

    pub fn create_reconciler(&self) -> &ReconcilerConfig {
        &self.create
    }

    pub fn update_reconciler(&self) -> &ReconcilerConfig {
        &self.update
    }

    /// Request options preloaded with this client's backoff.
    pub fn options(&self) -> RequestOptions {
        RequestOptions::new().with_backoff(self.backoff)
    }

    pub async fn execute(
        &self,
        operation: &Operation,
        options: &RequestOptions,
    ) -> Result<ExecutionResult> {
        self.executor.execute(operation, options).await
    }
}

/// Escape a caller-supplied value for use as one URL path segment.
pub(crate) fn path_segment(value: &str) -> String {
    utf8_percent_encode(value, PATH_SEGMENT).to_string()
}

/// Order-insensitive comparison of two string collections.
pub(crate) fn same_members(a: &[String], b: &[String]) -> bool {
    a.iter().collect::<BTreeSet<_>>() == b.iter().collect::<BTreeSet<_>>()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_members_ignores_order() {
        let a = vec!["mail.send".to_string(), "alerts.read".to_string()];
        let b = vec!["alerts.read".to_string(), "mail.send".to_string()];
        let c = vec!["mail.send".to_string()];

        assert!(same_members(&a, &b));
        assert!(!same_members(&a, &c));
        assert!(same_members(&[], &[]));
    }

    #[test]
    fn test_path_segment_escapes_separators() {
        assert_eq!(path_segment("alice.smith-01_x~"), "alice.smith-01_x~");
        assert_eq!(path_segment("alice smith"), "alice%20smith");
        assert_eq!(path_segment("a/b?c#d"), "a%2Fb%3Fc%23d");
        assert_eq!(path_segment("bob@example.com"), "bob%40example.com");
    }
}
