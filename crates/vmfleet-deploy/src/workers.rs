//! Bounded fan-out of per-host and per-VM work.
//!
//! Every item is spawned on a [`JoinSet`] and waits for a permit of a
//! shared [`Semaphore`] before running, so at most `parallelism` items
//! run at once. Each item yields its own result; failures are collected,
//! never propagated.
//!
//! Closing the pool (explicitly or when the phase deadline passes)
//! closes the semaphore: queued items resolve to [`ExecError::Cancelled`]
//! without running, and items already running are detached rather than
//! aborted. Items that did not report back are never counted as
//! succeeded.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ExecError;

/// Parallelism used when none is configured.
pub const DEFAULT_MAX_PARALLELISM: usize = 16;

/// Per-item results of one fan-out, in submission order.
#[derive(Debug)]
pub struct FanOutReport<K, T> {
    pub succeeded: Vec<(K, T)>,
    pub failed: Vec<(K, ExecError)>,
}

impl<K, T> FanOutReport<K, T> {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn succeeded_keys(&self) -> impl Iterator<Item = &K> {
        self.succeeded.iter().map(|(k, _)| k)
    }
}

/// Stops a pool from starting queued work.
#[derive(Debug, Clone)]
pub struct CloseHandle(Arc<Semaphore>);

impl CloseHandle {
    pub fn close(&self) {
        self.0.close();
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    timeout: Option<Duration>,
}

impl Default for WorkerPool {
    fn default() -> Self {
        WorkerPool::new(DEFAULT_MAX_PARALLELISM)
    }
}

impl WorkerPool {
    pub fn new(parallelism: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(parallelism.max(1))),
            timeout: None,
        }
    }

    /// Deadline for a whole [`run`](Self::run), counted from its start.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle(Arc::clone(&self.semaphore))
    }

    /// Run `work` on every item and wait for all of them, or for the deadline.
    pub async fn run<K, T, F, Fut>(&self, items: Vec<K>, work: F) -> FanOutReport<K, T>
    where
        K: Clone + Send + 'static,
        T: Send + 'static,
        F: Fn(K) -> Fut,
        Fut: Future<Output = Result<T, ExecError>> + Send + 'static,
    {
        let mut set = JoinSet::new();
        let mut pending: BTreeMap<usize, K> = BTreeMap::new();

        for (idx, item) in items.into_iter().enumerate() {
            pending.insert(idx, item.clone());
            let semaphore = Arc::clone(&self.semaphore);
            let future = work(item);
            set.spawn(async move {
                // Hold onto the permit until the work finishes.
                let output = match semaphore.acquire_owned().await {
                    Ok(permit) => {
                        let output = future.await;
                        drop(permit);
                        output
                    }
                    Err(_) => Err(ExecError::Cancelled),
                };
                (idx, output)
            });
        }

        let deadline = self.timeout.map(|t| (Instant::now() + t, t));
        let mut results: BTreeMap<usize, (K, Result<T, ExecError>)> = BTreeMap::new();

        loop {
            let next = match deadline {
                Some((at, timeout)) => match tokio::time::timeout_at(at, set.join_next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(
                            unfinished = pending.len(),
                            ?timeout,
                            "deadline reached, no further work is started"
                        );
                        self.semaphore.close();
                        set.detach_all();
                        for (idx, key) in std::mem::take(&mut pending) {
                            results.insert(idx, (key, Err(ExecError::TimedOut(timeout))));
                        }
                        break;
                    }
                },
                None => set.join_next().await,
            };

            match next {
                Some(Ok((idx, output))) => {
                    if let Some(key) = pending.remove(&idx) {
                        results.insert(idx, (key, output));
                    }
                }
                Some(Err(e)) => warn!(error = %e, "worker task did not complete"),
                None => break,
            }
        }

        // Whatever is still pending belongs to a task that panicked.
        for (idx, key) in pending {
            results.insert(idx, (key, Err(ExecError::Failed("worker task panicked".into()))));
        }

        let mut report = FanOutReport {
            succeeded: Vec::new(),
            failed: Vec::new(),
        };
        for (_, (key, output)) in results {
            match output {
                Ok(value) => report.succeeded.push((key, value)),
                Err(e) => report.failed.push((key, e)),
            }
        }
        debug!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "fan-out finished"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[tokio::test]
    async fn parallelism_is_bounded() {
        let count = Arc::new(AtomicUsize::new(0));
        let limit = 4;
        let pool = WorkerPool::new(limit);

        let report = pool
            .run((0..40).collect(), |_: u32| {
                let count = count.clone();
                async move {
                    let watermark = count.fetch_add(1, Ordering::SeqCst) + 1;
                    let ms = rand::thread_rng().gen_range(0..5);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    count.fetch_sub(1, Ordering::SeqCst);
                    Ok(watermark)
                }
            })
            .await;

        assert_eq!(report.succeeded.len(), 40);
        for (i, watermark) in &report.succeeded {
            assert!(*watermark <= limit, "item {i} saw {watermark} concurrent items");
        }
    }

    #[tokio::test]
    async fn failures_are_collected_in_order() {
        let pool = WorkerPool::new(8);
        let report = pool
            .run(vec!["a", "b", "c", "d"], |host| async move {
                if host == "b" || host == "d" {
                    Err(ExecError::Unreachable(host.to_string()))
                } else {
                    Ok(host.len())
                }
            })
            .await;

        assert_eq!(report.succeeded_keys().copied().collect::<Vec<_>>(), vec!["a", "c"]);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed[0].0, "b");
        assert!(!report.all_succeeded());
    }

    #[tokio::test]
    async fn deadline_stops_queued_work() {
        let started_second = Arc::new(AtomicBool::new(false));
        let pool = WorkerPool::new(1).with_timeout(Duration::from_millis(50));

        let report = pool
            .run(vec![1u32, 2], |item| {
                let started_second = started_second.clone();
                async move {
                    if item == 1 {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                    } else {
                        started_second.store(true, Ordering::SeqCst);
                    }
                    Ok(())
                }
            })
            .await;

        assert!(report.succeeded.is_empty());
        assert_eq!(report.failed.len(), 2);
        assert!(report
            .failed
            .iter()
            .all(|(_, e)| matches!(e, ExecError::TimedOut(_))));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!started_second.load(Ordering::SeqCst));
        assert!(pool.close_handle().is_closed());
    }

    #[tokio::test]
    async fn closed_pool_cancels_everything() {
        let pool = WorkerPool::new(2);
        pool.close_handle().close();

        let report = pool.run(vec![1, 2, 3], |_| async { Ok(()) }).await;
        assert!(report.succeeded.is_empty());
        assert!(report.failed.iter().all(|(_, e)| *e == ExecError::Cancelled));
    }
}
