//! Deduplicating, rate-limited work queue
//!
//! Keys are `namespace/name`. A key is queued at most once; a key added while
//! it is being processed is parked and queued again when processing ends, so
//! no two workers ever handle the same key at the same time.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::OperatorConfig;
use crate::error::Result;
use crate::metrics;

/// Per-key handler run by the queue workers
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    async fn reconcile(&self, key: &str) -> Result<()>;
}

/// Retry policy of a queue
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Retries after the first failure before a key is dropped
    pub max_requeues: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &OperatorConfig) -> Self {
        Self {
            max_requeues: config.max_num_requeues,
            base_delay: config.retry_base_delay(),
            max_delay: config.retry_max_delay(),
        }
    }

    /// Delay before the `failures`-th retry: base * 2^(failures-1), capped
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 1u32
            .checked_shl(failures.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    /// Keys waiting to be processed, queued or parked
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
}

pub struct WorkQueue {
    kind: &'static str,
    policy: RetryPolicy,
    state: Mutex<State>,
    notify: Notify,
    shutdown: CancellationToken,
}

impl WorkQueue {
    pub fn new(kind: &'static str, policy: RetryPolicy) -> Arc<Self> {
        Arc::new(Self {
            kind,
            policy,
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // a panic while holding the lock leaves the sets consistent
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue `key` unless it is already waiting
    pub fn add(&self, key: impl Into<String>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let key = key.into();
        let mut state = self.lock();
        if !state.dirty.insert(key.clone()) {
            return;
        }
        if !state.processing.contains(&key) {
            state.queue.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Queue `key` after `delay`
    pub fn add_after(self: &Arc<Self>, key: String, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.add(key),
                _ = queue.shutdown.cancelled() => {}
            }
        });
    }

    /// Count a failure of `key` and queue it again after the backoff delay
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let failures = {
            let mut state = self.lock();
            let failures = state.failures.entry(key.to_string()).or_insert(0);
            *failures += 1;
            *failures
        };
        self.add_after(key.to_string(), self.policy.delay(failures));
    }

    /// Reset the failure count of `key`
    pub fn forget(&self, key: &str) {
        self.lock().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Keys queued and not yet handed to a worker
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the next key. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            if self.shutdown.is_cancelled() {
                return None;
            }
            {
                let mut state = self.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = self.shutdown.cancelled() => return None,
            }
        }
    }

    /// Mark processing of `key` finished, queueing it again if it was added
    /// in the meantime
    pub fn done(&self, key: &str) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub fn shut_down(&self) {
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    /// Run `workers` workers until the queue is shut down
    pub async fn run<R: Reconcile>(self: Arc<Self>, workers: usize, reconciler: Arc<R>) {
        info!(kind = self.kind, workers, "Starting queue workers");
        let handles: Vec<_> = (0..workers.max(1))
            .map(|_| {
                let queue = Arc::clone(&self);
                let reconciler = Arc::clone(&reconciler);
                tokio::spawn(async move { while queue.process_next(reconciler.as_ref()).await {} })
            })
            .collect();
        futures::future::join_all(handles).await;
        info!(kind = self.kind, "Queue workers stopped");
    }

    async fn process_next<R: Reconcile>(self: &Arc<Self>, reconciler: &R) -> bool {
        let Some(key) = self.get().await else {
            return false;
        };

        let result = {
            let _timer = metrics::RECONCILE_DURATION
                .with_label_values(&[self.kind])
                .start_timer();
            metrics::RECONCILIATIONS.with_label_values(&[self.kind]).inc();
            reconciler.reconcile(&key).await
        };
        self.handle_result(&key, result);
        self.done(&key);
        true
    }

    fn handle_result(self: &Arc<Self>, key: &str, result: Result<()>) {
        let err = match result {
            Ok(()) => {
                debug!(kind = self.kind, key, "Processed");
                self.forget(key);
                return;
            }
            Err(e) => e,
        };

        metrics::RECONCILIATION_ERRORS
            .with_label_values(&[self.kind])
            .inc();
        if !err.is_retryable() {
            warn!(kind = self.kind, key, error = %err, "Dropping key, error is not retryable");
            metrics::QUEUE_DROPS.with_label_values(&[self.kind]).inc();
            self.forget(key);
            return;
        }

        let requeues = self.num_requeues(key);
        if requeues < self.policy.max_requeues {
            info!(kind = self.kind, key, requeues, error = %err, "Error syncing key, retrying");
            metrics::QUEUE_RETRIES.with_label_values(&[self.kind]).inc();
            self.add_rate_limited(key);
        } else {
            error!(kind = self.kind, key, error = %err, "Dropping key out of the queue");
            metrics::QUEUE_DROPS.with_label_values(&[self.kind]).inc();
            self.forget(key);
        }
    }
}
