use std::collections::HashMap;
use std::future::Future;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};

/// Fork-join over independent reconcilers.
///
/// Every member runs as its own task. `wait_all` always joins all of them;
/// after the first failure the shared token is cancelled so cooperative
/// members stop at their next sleep, and that first failure is returned.
pub struct ReconciliationGroup {
    tasks: JoinSet<Result<()>>,
    ids: HashMap<Id, String>,
    names: Vec<String>,
    cancel: CancellationToken,
}

impl Default for ReconciliationGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconciliationGroup {
    pub fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            ids: HashMap::new(),
            names: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Start `task`, handing it a token that fires when a sibling fails.
    pub fn spawn<F, Fut>(&mut self, name: impl Into<String>, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let handle = self.tasks.spawn(task(self.cancel.child_token()));

        self.ids.insert(handle.id(), name.clone());
        self.names.push(name);
    }

    /// Start `task` only when its sub-property actually changed.
    pub fn spawn_if<F, Fut>(&mut self, changed: bool, name: impl Into<String>, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if changed {
            self.spawn(name, task);
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub async fn wait_all(mut self) -> Result<()> {
        let mut first_error: Option<Error> = None;

        while let Some(joined) = self.tasks.join_next_with_id().await {
            let (name, err) = match joined {
                Ok((id, Ok(()))) => {
                    debug!(member = %self.member(id), "reconciler finished");
                    continue;
                }
                Ok((id, Err(err))) => (self.member(id), err),
                Err(join_err) => {
                    let name = self.member(join_err.id());
                    error!(member = %name, error = %join_err, "reconciler task aborted");
                    let err = Error::TaskFailed {
                        name: name.clone(),
                        message: join_err.to_string(),
                    };
                    (name, err)
                }
            };

            if first_error.is_none() {
                warn!(member = %name, error = %err, "reconciler failed, cancelling siblings");
                self.cancel.cancel();
                first_error = Some(err);
            } else {
                debug!(member = %name, error = %err, "additional reconciler failure");
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn member(&self, id: Id) -> String {
        self.ids
            .get(&id)
            .cloned()
            .unwrap_or_else(|| format!("task {}", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconciler::{Convergence, Reconciler, ReconcilerConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::{self, Instant};

    #[tokio::test(start_paused = true)]
    async fn test_all_succeed() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut group = ReconciliationGroup::new();

        for (i, name) in ["disabled", "domain", "ips"].into_iter().enumerate() {
            let finished = finished.clone();
            group.spawn(name, move |_| async move {
                time::sleep(Duration::from_secs(i as u64 + 1)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        assert_eq!(group.len(), 3);
        group.wait_all().await.unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_returned_after_all_members_finish() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut group = ReconciliationGroup::new();

        group.spawn("disabled", |_| async {
            time::sleep(Duration::from_secs(1)).await;
            Err(Error::Validation("subuser vanished".into()))
        });
        for name in ["domain", "ips"] {
            let finished = finished.clone();
            group.spawn(name, move |_| async move {
                // Ignores cancellation, like an in-flight remote call.
                time::sleep(Duration::from_secs(30)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let start = Instant::now();
        let err = group.wait_all().await.unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(finished.load(Ordering::SeqCst), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_failure_wins_and_siblings_stop_cooperatively() {
        let config = ReconcilerConfig {
            timeout: Duration::from_secs(600),
            delay: Duration::from_secs(5),
            min_timeout: Duration::from_secs(5),
            required_consecutive: 3,
        };
        let mut group = ReconciliationGroup::new();

        group.spawn("domain", |_| async {
            time::sleep(Duration::from_secs(7)).await;
            Err(Error::Validation("domain lookup failed".into()))
        });
        let pending_config = config.clone();
        group.spawn("ips", move |token| async move {
            Reconciler::new("ips for alice", pending_config)
                .with_cancellation(token)
                .wait_for(|| async { Ok::<_, Error>(Convergence::<()>::Pending) })
                .await
        });

        let start = Instant::now();
        let err = group.wait_all().await.unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_members_are_skipped() {
        let mut group = ReconciliationGroup::new();
        group.spawn_if(false, "disabled", |_| async { Ok(()) });
        group.spawn_if(true, "ips", |_| async { Ok(()) });

        assert_eq!(group.names(), &["ips".to_string()]);
        group.wait_all().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_member_is_named() {
        let mut group = ReconciliationGroup::new();
        group.spawn("disabled", |_| async {
            time::sleep(Duration::from_secs(1)).await;
            Ok(())
        });
        group.spawn("ips", |_| async { panic!("ip listing corrupted") });

        let err = group.wait_all().await.unwrap_err();

        match err {
            Error::TaskFailed { name, message } => {
                assert_eq!(name, "ips");
                assert!(message.contains("panicked"), "{}", message);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_group_succeeds() {
        ReconciliationGroup::new().wait_all().await.unwrap();
    }
}
