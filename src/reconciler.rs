//! Convergence polling against an eventually consistent backend.
//!
//! A [`Reconciler`] repeatedly runs a probe until it reports the desired
//! state on `required_consecutive` back-to-back observations, the probe
//! fails, or the timeout elapses. A throttled probe sleeps out the signal
//! and tries again without touching the consecutive tally.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20 * 60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_REQUIRED_CONSECUTIVE: u32 = 3;

/// What one probe observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Convergence<T> {
    Pending,
    Converged(T),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Sleep before the first probe.
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
    /// Sleep between probes.
    #[serde(with = "humantime_serde")]
    pub min_timeout: Duration,
    pub required_consecutive: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            delay: DEFAULT_POLL_INTERVAL,
            min_timeout: DEFAULT_POLL_INTERVAL,
            required_consecutive: DEFAULT_REQUIRED_CONSECUTIVE,
        }
    }
}

impl ReconcilerConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

pub struct Reconciler {
    resource: String,
    config: ReconcilerConfig,
    cancel: Option<CancellationToken>,
}

impl Reconciler {
    /// `resource` names what is being reconciled in logs and timeout errors.
    pub fn new(resource: impl Into<String>, config: ReconcilerConfig) -> Self {
        Self {
            resource: resource.into(),
            config,
            cancel: None,
        }
    }

    /// Stop at the next sleep once `token` is cancelled. In-flight probes
    /// are allowed to finish.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    #[instrument(skip_all, fields(resource = %self.resource))]
    pub async fn wait_for<T, F, Fut>(&self, mut probe: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Convergence<T>>>,
    {
        let start = Instant::now();
        let deadline = start + self.config.timeout;
        let required = self.config.required_consecutive.max(1);
        let mut consecutive = 0u32;
        let mut probes = 0u32;

        self.pause(self.config.delay, deadline).await?;

        loop {
            if Instant::now() >= deadline {
                warn!(probes, "gave up waiting for convergence");
                return Err(Error::Timeout {
                    resource: self.resource.clone(),
                    elapsed: start.elapsed(),
                });
            }
            self.check_cancelled()?;

            probes += 1;
            match probe().await {
                Ok(Convergence::Converged(value)) => {
                    consecutive += 1;
                    debug!(probes, consecutive, required, "converged observation");
                    if consecutive >= required {
                        info!(probes, elapsed = ?start.elapsed(), "state converged");
                        return Ok(value);
                    }
                    self.pause(self.config.min_timeout, deadline).await?;
                }
                Ok(Convergence::Pending) => {
                    debug!(probes, "still pending");
                    consecutive = 0;
                    self.pause(self.config.min_timeout, deadline).await?;
                }
                Err(err) => match err.throttle_signal() {
                    Some(signal) => {
                        warn!(probes, resume_after = ?signal.resume_after, "probe throttled");
                        self.pause(signal.resume_after, deadline).await?;
                    }
                    None => return Err(err),
                },
            }
        }
    }

    /// Sleep for `duration`, cut short at `deadline` or on cancellation.
    async fn pause(&self, duration: Duration, deadline: Instant) -> Result<()> {
        let wake = (Instant::now() + duration).min(deadline);

        match &self.cancel {
            Some(token) => {
                tokio::select! {
                    _ = time::sleep_until(wake) => Ok(()),
                    _ = token.cancelled() => Err(self.cancelled()),
                }
            }
            None => {
                time::sleep_until(wake).await;
                Ok(())
            }
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(self.cancelled()),
            _ => Ok(()),
        }
    }

    fn cancelled(&self) -> Error {
        Error::Cancelled {
            resource: self.resource.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::ThrottleSignal;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    fn config() -> ReconcilerConfig {
        ReconcilerConfig {
            timeout: Duration::from_secs(120),
            delay: Duration::from_secs(5),
            min_timeout: Duration::from_secs(5),
            required_consecutive: 3,
        }
    }

    /// Probe that replays `script` and counts invocations.
    fn scripted(
        script: Vec<Result<Convergence<u32>>>,
    ) -> (
        Arc<Mutex<u32>>,
        impl FnMut() -> std::future::Ready<Result<Convergence<u32>>>,
    ) {
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let mut script: VecDeque<_> = script.into();
        let probe = move || {
            *counter.lock().unwrap() += 1;
            std::future::ready(script.pop_front().unwrap_or(Ok(Convergence::Pending)))
        };
        (calls, probe)
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_resets_consecutive_count() {
        use Convergence::*;
        let (calls, probe) = scripted(vec![
            Ok(Pending),
            Ok(Converged(1)),
            Ok(Converged(2)),
            Ok(Pending),
            Ok(Converged(3)),
            Ok(Converged(4)),
            Ok(Converged(5)),
        ]);

        let start = Instant::now();
        let value = Reconciler::new("subuser alice", config())
            .wait_for(probe)
            .await
            .unwrap();

        assert_eq!(value, 5);
        assert_eq!(*calls.lock().unwrap(), 7);
        // Initial delay plus six intervals between seven probes.
        assert_eq!(start.elapsed(), Duration::from_secs(35));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_pending_times_out_not_earlier() {
        let (calls, probe) = scripted(Vec::new());
        let start = Instant::now();

        let short = config().with_timeout(Duration::from_secs(62));
        let err = Reconciler::new("api key ci-deploy", short)
            .wait_for(probe)
            .await
            .unwrap_err();

        assert!(start.elapsed() >= Duration::from_secs(62));
        assert!(start.elapsed() < Duration::from_secs(67));
        assert!(*calls.lock().unwrap() >= 11);
        match err {
            Error::Timeout { resource, .. } => assert_eq!(resource, "api key ci-deploy"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_probe_error_stops_immediately() {
        use Convergence::*;
        let (calls, probe) = scripted(vec![
            Ok(Pending),
            Err(Error::Validation("bad payload".into())),
            Ok(Converged(1)),
        ]);

        let err = Reconciler::new("subuser alice", config())
            .wait_for(probe)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_sleeps_signal_and_keeps_tally() {
        use Convergence::*;
        let (calls, probe) = scripted(vec![
            Ok(Converged(1)),
            Err(Error::Throttled(ThrottleSignal::new(Duration::from_secs(30)))),
            Ok(Converged(2)),
            Ok(Converged(3)),
        ]);

        let start = Instant::now();
        let value = Reconciler::new("domain for alice", config())
            .wait_for(probe)
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(*calls.lock().unwrap(), 4);
        // delay 5 + interval 5 + throttle 30 + interval 5
        assert_eq!(start.elapsed(), Duration::from_secs(45));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_at_next_sleep() {
        let (_, probe) = scripted(Vec::new());
        let token = CancellationToken::new();
        let reconciler =
            Reconciler::new("ips for alice", config()).with_cancellation(token.clone());

        let handle = tokio::spawn(async move { reconciler.wait_for(probe).await });
        time::sleep(Duration::from_secs(12)).await;
        token.cancel();

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
    }

    #[test]
    fn test_config_serde_uses_humantime() {
        let json = serde_json::to_value(ReconcilerConfig::default()).unwrap();
        assert_eq!(json["timeout"], "20m");
        assert_eq!(json["delay"], "5s");

        let parsed: ReconcilerConfig = serde_json::from_str(
            r#"{"timeout":"90s","delay":"1s","min_timeout":"2s","required_consecutive":2}"#,
        )
        .unwrap();
        assert_eq!(parsed.timeout, Duration::from_secs(90));
        assert_eq!(parsed.required_consecutive, 2);
    }
}
