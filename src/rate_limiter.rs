use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::debug;

/// Default pacing for account and key mutations.
pub const DEFAULT_LIMIT_INTERVAL: Duration = Duration::from_secs(5);

/// Fixed-interval token source shared by every caller of one operation class.
///
/// Each tick admits exactly one waiter. At most one unclaimed tick is banked,
/// so an idle limiter never releases a burst. Clones share the same ticker.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    name: Arc<str>,
    ticker: Arc<Mutex<Interval>>,
}

impl RateLimiter {
    /// The first tick arrives one full period after construction. Must be
    /// called from within a Tokio runtime.
    pub fn new(name: &str, period: Duration) -> Self {
        let mut ticker = time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        Self {
            name: Arc::from(name),
            ticker: Arc::new(Mutex::new(ticker)),
        }
    }

    /// Suspend until the next tick is handed to this caller. Never fails.
    pub async fn acquire(&self) {
        let mut ticker = self.ticker.lock().await;
        let tick = ticker.tick().await;
        debug!(limiter = %self.name, ?tick, "rate limit token acquired");
    }
}

/// Acquire from `limiter` when one is configured; a no-op otherwise.
pub async fn acquire(limiter: Option<&RateLimiter>) {
    if let Some(limiter) = limiter {
        limiter.acquire().await;
    }
}

/// Limiters for each paced operation class, built once per process and
/// handed to every workflow that needs them.
#[derive(Clone, Debug)]
pub struct RateLimiters {
    pub create_api_key: RateLimiter,
    pub delete_api_key: RateLimiter,
    pub create_subuser: RateLimiter,
    pub delete_subuser: RateLimiter,
}

impl RateLimiters {
    pub fn new(period: Duration) -> Self {
        Self {
            create_api_key: RateLimiter::new("create_api_key", period),
            delete_api_key: RateLimiter::new("delete_api_key", period),
            create_subuser: RateLimiter::new("create_subuser", period),
            delete_subuser: RateLimiter::new("delete_subuser", period),
        }
    }
}

impl Default for RateLimiters {
    fn default() -> Self {
        Self::new(DEFAULT_LIMIT_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_first_acquire_waits_one_period() {
        let limiter = RateLimiter::new("create_api_key", Duration::from_secs(5));
        let start = Instant::now();

        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paces_all_clones_together() {
        let limiter = RateLimiter::new("delete_subuser", Duration::from_secs(5));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire().await;
                Instant::now()
            }));
        }

        let mut admitted = Vec::new();
        for handle in handles {
            admitted.push(handle.await.unwrap() - start);
        }
        admitted.sort();

        assert_eq!(
            admitted,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(15)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_limiter_banks_a_single_tick() {
        let limiter = RateLimiter::new("create_subuser", Duration::from_secs(5));
        time::sleep(Duration::from_secs(30)).await;

        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.acquire().await;
        assert!(start.elapsed() > Duration::ZERO);
        assert!(start.elapsed() <= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_pending_until_tick() {
        let limiter = RateLimiter::new("delete_api_key", Duration::from_secs(5));
        let mut waiter = tokio_test::task::spawn(limiter.acquire());

        tokio_test::assert_pending!(waiter.poll());
        time::advance(Duration::from_secs(4)).await;
        tokio_test::assert_pending!(waiter.poll());
        time::advance(Duration::from_secs(1)).await;
        tokio_test::assert_ready!(waiter.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_without_limiter_is_noop() {
        let start = Instant::now();
        acquire(None).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
