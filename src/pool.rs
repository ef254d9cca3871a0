//! Bounded worker pool
//!
//! Fan-out tasks are spawned freely; only leaf work (tool invocations and
//! file writes) holds a permit, so recursive resolution cannot starve the
//! pool of permits while its children wait on them.

use crate::error::{SbError, SbResult};
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::warn;

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    permits: Semaphore,
    workers: usize,
    detached: Mutex<JoinSet<SbResult<()>>>,
}

impl WorkerPool {
    /// Create a pool bounded to `workers` concurrent leaf jobs.
    ///
    /// Zero means one per available CPU.
    pub fn new(workers: usize) -> Self {
        let workers = if workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        } else {
            workers
        };

        Self {
            inner: Arc::new(PoolInner {
                permits: Semaphore::new(workers),
                workers,
                detached: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn workers(&self) -> usize {
        self.inner.workers
    }

    /// Run `fut` while holding one of the pool's permits.
    pub async fn run<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        // The semaphore is never closed, so a failed acquire cannot happen
        let _permit = self.inner.permits.acquire().await.ok();
        fut.await
    }

    /// Spawn a fan-out task and return its handle.
    pub fn submit<F, T>(&self, fut: F) -> JoinHandle<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        tokio::spawn(fut)
    }

    /// Spawn a task whose completion is only observed through [`WorkerPool::wait`].
    pub fn detach<F>(&self, fut: F)
    where
        F: Future<Output = SbResult<()>> + Send + 'static,
    {
        match self.inner.detached.lock() {
            Ok(mut set) => {
                set.spawn(fut);
            }
            Err(poisoned) => {
                poisoned.into_inner().spawn(fut);
            }
        }
    }

    /// Wait for every detached task, including ones detached while waiting.
    ///
    /// Returns the first failure after all tasks have finished.
    pub async fn wait(&self) -> SbResult<()> {
        let mut first_error = None;
        loop {
            let mut set = match self.inner.detached.lock() {
                Ok(mut guard) => std::mem::take(&mut *guard),
                Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
            };
            if set.is_empty() {
                break;
            }

            while let Some(joined) = set.join_next().await {
                let result = joined.map_err(|e| SbError::Task(e.to_string())).and_then(|r| r);
                if let Err(e) = result {
                    warn!("Background task failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Await a submitted task, mapping a panic or cancellation to [`SbError::Task`].
pub async fn join<T>(handle: JoinHandle<T>) -> SbResult<T> {
    handle.await.map_err(|e| SbError::Task(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn zero_workers_uses_parallelism() {
        assert!(WorkerPool::new(0).workers() >= 1);
        assert_eq!(WorkerPool::new(3).workers(), 3);
    }

    #[tokio::test]
    async fn run_bounds_concurrency() {
        let pool = WorkerPool::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool2 = pool.clone();
                let active = active.clone();
                let peak = peak.clone();
                pool.submit(async move {
                    pool2
                        .run(async {
                            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                        })
                        .await
                })
            })
            .collect();

        for handle in handles {
            join(handle).await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn wait_joins_nested_detached_tasks() {
        let pool = WorkerPool::new(2);
        let done = Arc::new(AtomicUsize::new(0));

        let inner_pool = pool.clone();
        let counter = done.clone();
        pool.detach(async move {
            let counter2 = counter.clone();
            inner_pool.detach(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        pool.wait().await.unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn wait_reports_failure_after_draining() {
        let pool = WorkerPool::new(1);
        let done = Arc::new(AtomicUsize::new(0));

        pool.detach(async { Err(SbError::Internal("boom".to_string())) });
        let counter = done.clone();
        pool.detach(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let err = pool.wait().await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(done.load(Ordering::SeqCst), 1);
        // A drained pool waits on nothing
        pool.wait().await.unwrap();
    }
}
