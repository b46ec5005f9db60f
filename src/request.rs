//! Retrying request execution.
//!
//! An [`Operation`] is issued up to `1 + retries` times over the same bytes.
//! Each attempt is classified into an [`Attempt`]; the first accepted status
//! ends the loop, and a "too many requests" response replaces the next
//! backoff with the time left until the advertised reset.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, trace, warn};

use crate::error::{Error, Result};
use crate::rate_limiter::{self, RateLimiter};
use crate::transport::HttpTransport;

pub use reqwest::Method;

pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRIES: u32 = 0;

pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

/// One HTTP call, fixed at construction time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    method: Method,
    path: String,
    query: BTreeMap<String, String>,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

impl Operation {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Adds the header only when `value` is present and non-empty.
    pub fn with_optional_header(self, name: &str, value: Option<&str>) -> Self {
        match value {
            Some(value) if !value.is_empty() => self.with_header(name, value),
            _ => self,
        }
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_json<T: Serialize + ?Sized>(self, payload: &T) -> Result<Self> {
        let body = serde_json::to_vec(payload)?;
        Ok(self.with_body(body))
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &BTreeMap<String, String> {
        &self.query
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

/// How one operation is executed.
///
/// Scalar settings are last-writer-wins; each `with_status` adds to the
/// acceptable set.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    acceptable: BTreeSet<u16>,
    retries: u32,
    backoff: Duration,
    rate_limiter: Option<RateLimiter>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            acceptable: BTreeSet::new(),
            retries: DEFAULT_RETRIES,
            backoff: DEFAULT_BACKOFF,
            rate_limiter: None,
        }
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.acceptable.insert(status);
        self
    }

    /// Number of additional attempts after the first.
    pub fn with_retry(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_rate_limit(mut self, limiter: &RateLimiter) -> Self {
        self.rate_limiter = Some(limiter.clone());
        self
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    pub fn acceptable(&self) -> &BTreeSet<u16> {
        &self.acceptable
    }

    /// With no acceptable set configured, any status other than
    /// "too many requests" is accepted.
    pub fn accepts(&self, status: u16) -> bool {
        if self.acceptable.is_empty() {
            status != STATUS_TOO_MANY_REQUESTS
        } else {
            self.acceptable.contains(&status)
        }
    }
}

/// Completed HTTP response. Header names are stored lower-cased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub status: u16,
    pub headers: HashMap<String, Vec<String>>,
    pub body: Vec<u8>,
}

impl ExecutionResult {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&[String]> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|values| values.as_slice())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// Backend throttling: wait `resume_after`, then retry the surrounding workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThrottleSignal {
    pub resume_after: Duration,
}

impl ThrottleSignal {
    pub fn new(resume_after: Duration) -> Self {
        Self { resume_after }
    }
}

/// Outcome of a single attempt.
#[derive(Debug)]
pub enum Attempt {
    Success(ExecutionResult),
    TransientFailure(Error),
    Throttled(ThrottleSignal),
}

impl Attempt {
    /// Classify a completed response against `options`, using `now` to
    /// resolve the reset epoch of a throttled response.
    pub fn classify(result: ExecutionResult, options: &RequestOptions, now: SystemTime) -> Self {
        if options.accepts(result.status) {
            return Attempt::Success(result);
        }

        if result.status == STATUS_TOO_MANY_REQUESTS {
            if let Some(wait) = throttle_wait(&result, now) {
                return Attempt::Throttled(ThrottleSignal::new(wait));
            }
        }

        Attempt::TransientFailure(Error::UnexpectedStatus {
            status: result.status,
            body: result.body_text(),
        })
    }
}

/// Time from `now` until one second past the reset epoch advertised by a
/// throttled response. `None` unless exactly one integer value is present.
pub fn throttle_wait(result: &ExecutionResult, now: SystemTime) -> Option<Duration> {
    let values = result.header(RATE_LIMIT_RESET_HEADER)?;
    let [value] = values else {
        return None;
    };

    let reset_secs: u64 = value.trim().parse().ok()?;
    let resume_at = UNIX_EPOCH + Duration::from_secs(reset_secs) + Duration::from_secs(1);

    Some(resume_at.duration_since(now).unwrap_or(Duration::ZERO))
}

/// Issues operations through a transport with retry, backoff and pacing.
#[derive(Clone)]
pub struct RequestExecutor {
    transport: Arc<dyn HttpTransport>,
}

impl RequestExecutor {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    #[instrument(skip_all, fields(method = %operation.method(), path = %operation.path()))]
    pub async fn execute(
        &self,
        operation: &Operation,
        options: &RequestOptions,
    ) -> Result<ExecutionResult> {
        let attempts = options.retries().saturating_add(1);
        let mut wait = Duration::ZERO;
        let mut last_error = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(wait).await;
            }
            wait = options.backoff();

            rate_limiter::acquire(options.rate_limiter()).await;

            let outcome = match self.transport.send(operation).await {
                Ok(result) => Attempt::classify(result, options, SystemTime::now()),
                Err(err) => {
                    warn!(attempt, error = %err, "request failed");
                    Attempt::TransientFailure(err.into())
                }
            };

            match outcome {
                Attempt::Success(result) => {
                    debug!(attempt, status = result.status, "request succeeded");
                    return Ok(result);
                }
                Attempt::Throttled(signal) => {
                    warn!(attempt, resume_after = ?signal.resume_after, "request throttled");
                    wait = signal.resume_after;
                    last_error = Some(Error::Throttled(signal));
                }
                Attempt::TransientFailure(err) => {
                    debug!(attempt, error = %err, "attempt not accepted");
                    last_error = Some(err);
                }
            }
        }

        let err = last_error
            .unwrap_or_else(|| Error::Configuration("request made no attempts".to_string()));
        if let Error::UnexpectedStatus { status, body } = &err {
            trace!(status, body = %body, "unexpected response body");
        }

        Err(err)
    }
}
