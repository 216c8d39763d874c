//! Blocking task dispatcher
//!
//! Every call that may block (SNMP tools, node agents, file writes, the
//! DHCP reload command) goes through here. Tasks run on tokio's blocking
//! pool, bounded twice: a global worker limit, and a per-destination limit so
//! a single slow switch cannot take every worker.
//!
//! Tasks own their inputs and return self-contained results; the
//! orchestration loop awaits the handle and applies the result itself.

use kestrel_common::Mac;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Why a dispatched task produced no value
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("dispatcher is closed")]
    Closed,

    #[error("task did not finish within {0:?}")]
    Timeout(Duration),

    #[error("task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TaskError::Timeout(_))
    }
}

/// Dispatcher sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherLimits {
    pub workers: usize,
    pub per_destination: usize,
}

impl Default for DispatcherLimits {
    fn default() -> Self {
        Self {
            workers: 16,
            per_destination: 2,
        }
    }
}

struct Inner {
    limits: DispatcherLimits,
    workers: Arc<Semaphore>,
    destinations: Mutex<HashMap<Mac, Arc<Semaphore>>>,
    closed: AtomicBool,
}

/// Cheap to clone; clones share the same limits.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(limits: DispatcherLimits) -> Self {
        let limits = DispatcherLimits {
            workers: limits.workers.max(1),
            per_destination: limits.per_destination.max(1),
        };
        Self {
            inner: Arc::new(Inner {
                limits,
                workers: Arc::new(Semaphore::new(limits.workers)),
                destinations: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Run `task` on the blocking pool.
    ///
    /// `destination` is the switch (or other device) the task talks to, if
    /// any; at most `per_destination` tasks run against one destination at a
    /// time. Tasks waiting for a permit have not started; deadlines set on
    /// the handle only count from the moment the task starts. After
    /// [`Dispatcher::close`] the returned handle resolves to
    /// [`TaskError::Closed`] without running the task.
    pub fn submit<T, F>(&self, destination: Option<Mac>, task: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            debug!("task rejected, dispatcher closed");
            return TaskHandle {
                join: None,
                started: None,
            };
        }

        let workers = self.inner.workers.clone();
        let lane = destination.map(|mac| self.lane(mac));
        let (started_tx, started_rx) = oneshot::channel();

        let join = tokio::spawn(async move {
            let _lane_permit = match lane {
                Some(lane) => Some(lane.acquire_owned().await.map_err(|_| TaskError::Closed)?),
                None => None,
            };
            let _worker_permit = workers.acquire_owned().await.map_err(|_| TaskError::Closed)?;
            let _ = started_tx.send(());

            // Permits are held until the blocking call returns, even if the
            // handle was dropped or timed out
            tokio::task::spawn_blocking(task)
                .await
                .map_err(|e| TaskError::Panicked(e.to_string()))
        });

        TaskHandle {
            join: Some(join),
            started: Some(started_rx),
        }
    }

    fn lane(&self, mac: Mac) -> Arc<Semaphore> {
        let per_destination = self.inner.limits.per_destination;
        // A poisoned map only loses lane sharing, the semaphores stay valid
        let mut lanes = self
            .inner
            .destinations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        lanes
            .entry(mac)
            .or_insert_with(|| Arc::new(Semaphore::new(per_destination)))
            .clone()
    }

    /// Stop accepting new tasks
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Wait until every task already submitted has finished.
    ///
    /// Call after [`Dispatcher::close`]; otherwise new work may keep the
    /// drain waiting.
    pub async fn drain(&self) {
        let all = self.inner.limits.workers as u32;
        match self.inner.workers.acquire_many(all).await {
            Ok(_permits) => debug!("dispatcher drained"),
            Err(_) => warn!("dispatcher semaphore closed while draining"),
        }
    }
}

/// Pending result of a dispatched task
pub struct TaskHandle<T> {
    join: Option<JoinHandle<Result<T, TaskError>>>,
    /// Fires once the task holds its permits
    started: Option<oneshot::Receiver<()>>,
}

impl<T> TaskHandle<T> {
    async fn started(&mut self) {
        if let Some(started) = self.started.as_mut() {
            // An error means the task ended before starting; `join` reports why
            let _ = started.await;
            self.started = None;
        }
    }

    async fn join(&mut self) -> Result<T, TaskError> {
        let Some(join) = self.join.as_mut() else {
            return Err(TaskError::Closed);
        };
        let result = match join.await {
            Ok(result) => result,
            Err(e) => Err(TaskError::Panicked(e.to_string())),
        };
        self.join = None;
        result
    }

    /// Wait for the task without a deadline
    pub async fn wait(mut self) -> Result<T, TaskError> {
        self.join().await
    }

    /// Wait at most `limit` once the task has started; an over-long task
    /// becomes [`TaskError::Timeout`].
    ///
    /// Time spent queued behind other tasks does not count. The blocking
    /// call itself keeps running to completion in the background and keeps
    /// its permits until it does.
    pub async fn wait_timeout(mut self, limit: Duration) -> Result<T, TaskError> {
        match self.try_wait(limit).await {
            Some(result) => result,
            None => Err(TaskError::Timeout(limit)),
        }
    }

    /// Like [`TaskHandle::wait_timeout`] but keeps the handle when the
    /// limit passes (`None`), so the caller can still wait for the task to
    /// finish before touching the same resource again.
    pub async fn try_wait(&mut self, limit: Duration) -> Option<Result<T, TaskError>> {
        self.started().await;
        tokio::time::timeout(limit, self.join()).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn mac(last: u8) -> Mac {
        Mac::new([0, 0, 0, 0, 0, last])
    }

    #[tokio::test]
    async fn test_submit_returns_value() {
        let dispatcher = Dispatcher::new(DispatcherLimits::default());
        let handle = dispatcher.submit(None, || 40 + 2);
        assert_eq!(handle.wait().await, Ok(42));
    }

    #[tokio::test]
    async fn test_wait_timeout() {
        let dispatcher = Dispatcher::new(DispatcherLimits::default());
        let handle = dispatcher.submit(None, || std::thread::sleep(Duration::from_millis(300)));
        let result = handle.wait_timeout(Duration::from_millis(20)).await;
        assert!(result.unwrap_err().is_timeout());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queue_time_not_counted() {
        let limits = DispatcherLimits {
            workers: 1,
            per_destination: 1,
        };
        let dispatcher = Dispatcher::new(limits);
        let first = dispatcher.submit(None, || std::thread::sleep(Duration::from_millis(150)));
        let second = dispatcher.submit(None, || {
            std::thread::sleep(Duration::from_millis(20));
            7
        });

        // Queued for ~150 ms, then runs well within its own limit
        assert_eq!(second.wait_timeout(Duration::from_millis(100)).await, Ok(7));
        first.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_try_wait_keeps_handle() {
        let dispatcher = Dispatcher::new(DispatcherLimits::default());
        let mut handle = dispatcher.submit(None, || {
            std::thread::sleep(Duration::from_millis(100));
            "late"
        });
        assert!(handle.try_wait(Duration::from_millis(10)).await.is_none());
        assert_eq!(handle.wait().await, Ok("late"));
    }

    #[tokio::test]
    async fn test_panic_is_reported() {
        let dispatcher = Dispatcher::new(DispatcherLimits::default());
        let handle = dispatcher.submit(None, || -> u32 { panic!("boom") });
        assert!(matches!(handle.wait().await, Err(TaskError::Panicked(_))));
    }

    #[tokio::test]
    async fn test_closed_rejects() {
        let dispatcher = Dispatcher::new(DispatcherLimits::default());
        dispatcher.close();
        assert!(dispatcher.is_closed());
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        let result = dispatcher
            .submit(None, move || flag.store(true, Ordering::SeqCst))
            .wait()
            .await;
        assert_eq!(result, Err(TaskError::Closed));
        assert!(!ran.load(Ordering::SeqCst));
    }

    async fn peak_concurrency(limits: DispatcherLimits, destinations: &[Option<Mac>]) -> usize {
        let dispatcher = Dispatcher::new(limits);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = destinations
            .iter()
            .map(|dest| {
                let running = running.clone();
                let peak = peak.clone();
                dispatcher.submit(*dest, move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(30));
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for h in handles {
            h.wait().await.unwrap();
        }
        peak.load(Ordering::SeqCst)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_per_destination_limit() {
        let limits = DispatcherLimits {
            workers: 8,
            per_destination: 2,
        };
        let peak = peak_concurrency(limits, &[Some(mac(1)); 6]).await;
        assert!(peak <= 2, "peak {} exceeded per-destination cap", peak);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_global_limit() {
        let limits = DispatcherLimits {
            workers: 3,
            per_destination: 2,
        };
        let dests: Vec<Option<Mac>> = (1..=8).map(|i| Some(mac(i))).collect();
        let peak = peak_concurrency(limits, &dests).await;
        assert!(peak <= 3, "peak {} exceeded worker cap", peak);
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight() {
        let dispatcher = Dispatcher::new(DispatcherLimits::default());
        let done = Arc::new(AtomicBool::new(false));
        let flag = done.clone();
        let _handle = dispatcher.submit(Some(mac(1)), move || {
            std::thread::sleep(Duration::from_millis(50));
            flag.store(true, Ordering::SeqCst);
        });
        // Let the task pick up its permits
        tokio::time::sleep(Duration::from_millis(10)).await;

        dispatcher.close();
        dispatcher.drain().await;
        assert!(done.load(Ordering::SeqCst));
    }
}
