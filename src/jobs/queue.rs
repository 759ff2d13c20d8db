//! In-process job broker.
//!
//! One FIFO channel per [`QueueKind`] and a semaphore sized to the queue's concurrency. A
//! per-queue key registry drops enqueues whose key is already waiting, running, or still
//! retained after finishing (the newest 100 completed and 50 failed keys are kept).
//!
//! Handler errors are logged and counted, never retried, with one exception: when the error
//! chain contains a transient, non-timeout [`FetchError`], the job is re-queued after a backoff
//! until `max_attempts` is reached.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::OnceCell;
use tokio::sync::{mpsc, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Job, QueueKind};
use crate::ingest::types::FetchError;
use crate::retry::RetryPolicy;

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("jobs_enqueued_total", "Jobs accepted by the broker, per queue.");
        describe_counter!("jobs_deduplicated_total", "Enqueues dropped because the key was already known.");
        describe_counter!("jobs_completed_total", "Jobs whose handler returned Ok.");
        describe_counter!("jobs_failed_total", "Jobs whose handler returned an error on the final attempt.");
        describe_histogram!("job_duration_ms", "Handler wall time in milliseconds.");
    });
}

/// Per-execution metadata handed to the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub key: String,
    /// 1-based.
    pub attempt: u32,
    pub max_attempts: u32,
}

impl JobContext {
    /// Whether the broker will run this job again if it fails with `err`. Handlers use this
    /// to hold back terminal state changes until the last attempt.
    pub fn will_retry(&self, err: &anyhow::Error) -> bool {
        self.attempt < self.max_attempts && is_retryable(err)
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job, ctx: JobContext) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    Deduplicated,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub concurrency: HashMap<QueueKind, usize>,
    /// Total attempts for transient fetch failures.
    pub max_attempts: u32,
    pub retry_backoff: RetryPolicy,
    pub keep_completed: usize,
    pub keep_failed: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: QueueKind::ALL
                .iter()
                .map(|q| (*q, q.default_concurrency()))
                .collect(),
            max_attempts: 3,
            retry_backoff: RetryPolicy::new(3, 2_000),
            keep_completed: 100,
            keep_failed: 50,
        }
    }
}

impl QueueConfig {
    pub fn with_concurrency(mut self, queue: QueueKind, n: usize) -> Self {
        self.concurrency.insert(queue, n.max(1));
        self
    }

    fn concurrency_for(&self, queue: QueueKind) -> usize {
        self.concurrency
            .get(&queue)
            .copied()
            .unwrap_or_else(|| queue.default_concurrency())
            .max(1)
    }
}

struct Envelope {
    job: Job,
    key: String,
    attempt: u32,
}

#[derive(Default)]
struct KeyRegistry {
    live: HashSet<String>,
    completed: VecDeque<String>,
    failed: VecDeque<String>,
}

impl KeyRegistry {
    fn knows(&self, key: &str) -> bool {
        self.live.contains(key) || self.completed.iter().any(|k| k == key) || self.failed.iter().any(|k| k == key)
    }

    fn finish(&mut self, key: &str, ok: bool, keep_completed: usize, keep_failed: usize) {
        self.live.remove(key);
        let (list, cap) = if ok {
            (&mut self.completed, keep_completed)
        } else {
            (&mut self.failed, keep_failed)
        };
        list.push_back(key.to_string());
        while list.len() > cap {
            list.pop_front();
        }
    }
}

struct Inner {
    config: QueueConfig,
    senders: HashMap<QueueKind, mpsc::UnboundedSender<Envelope>>,
    registry: Mutex<HashMap<QueueKind, KeyRegistry>>,
    pending: AtomicUsize,
    idle: Notify,
}

impl Inner {
    fn settle(&self, queue: QueueKind, key: &str, ok: bool) {
        if let Ok(mut reg) = self.registry.lock() {
            reg.entry(queue)
                .or_default()
                .finish(key, ok, self.config.keep_completed, self.config.keep_failed);
        }
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Cheap to clone; all clones feed the same queues.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Broker {
    /// Spawn one dispatcher per queue and return the broker plus the dispatcher handles.
    pub fn start(config: QueueConfig, handler: Arc<dyn JobHandler>) -> (Self, Vec<JoinHandle<()>>) {
        ensure_metrics_described();
        let (shutdown, _) = watch::channel(false);
        let mut senders = HashMap::new();
        let mut receivers = Vec::new();
        for q in QueueKind::ALL {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(q, tx);
            receivers.push((q, rx));
        }
        let inner = Arc::new(Inner {
            config,
            senders,
            registry: Mutex::new(HashMap::new()),
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        let handles = receivers
            .into_iter()
            .map(|(queue, rx)| {
                tokio::spawn(dispatch(
                    queue,
                    rx,
                    inner.clone(),
                    handler.clone(),
                    shutdown.subscribe(),
                ))
            })
            .collect();

        info!(
            queues = QueueKind::ALL.len(),
            max_attempts = inner.config.max_attempts,
            "job broker started"
        );
        (
            Self {
                inner,
                shutdown: Arc::new(shutdown),
            },
            handles,
        )
    }

    /// Enqueue under the job's natural key.
    pub fn enqueue(&self, job: Job) -> EnqueueOutcome {
        let key = job.default_key(chrono::Utc::now());
        self.enqueue_with_key(job, key)
    }

    /// Enqueue unless `key` is already waiting, running or retained for this queue.
    pub fn enqueue_with_key(&self, job: Job, key: impl Into<String>) -> EnqueueOutcome {
        let key = key.into();
        let queue = job.queue();
        {
            let Ok(mut reg) = self.inner.registry.lock() else {
                error!(queue = queue.name(), "key registry poisoned, dropping job");
                return EnqueueOutcome::Deduplicated;
            };
            let reg = reg.entry(queue).or_default();
            if reg.knows(&key) {
                counter!("jobs_deduplicated_total", "queue" => queue.name()).increment(1);
                debug!(queue = queue.name(), job_key = %key, "duplicate job key, not enqueued");
                return EnqueueOutcome::Deduplicated;
            }
            reg.live.insert(key.clone());
        }

        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        let sent = self
            .inner
            .senders
            .get(&queue)
            .map(|tx| tx.send(Envelope { job, key: key.clone(), attempt: 1 }).is_ok())
            .unwrap_or(false);
        if !sent {
            warn!(queue = queue.name(), job_key = %key, "queue closed, job dropped");
            self.inner.settle(queue, &key, false);
            return EnqueueOutcome::Deduplicated;
        }
        counter!("jobs_enqueued_total", "queue" => queue.name()).increment(1);
        EnqueueOutcome::Enqueued
    }

    /// Jobs accepted but not yet finished (including retries in backoff).
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Resolve once no job is waiting, running or backing off.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop taking new work. Jobs already running finish normally.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Retry only when the failure is a transient network error that is not a timeout.
fn is_retryable(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<FetchError>())
        .any(|f| f.is_transient() && !f.is_timeout())
}

async fn dispatch(
    queue: QueueKind,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    inner: Arc<Inner>,
    handler: Arc<dyn JobHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let concurrency = inner.config.concurrency_for(queue);
    let slots = Arc::new(Semaphore::new(concurrency));
    debug!(queue = queue.name(), concurrency, "queue dispatcher running");

    loop {
        let permit = tokio::select! {
            p = slots.clone().acquire_owned() => match p {
                Ok(p) => p,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };
        let env = tokio::select! {
            env = rx.recv() => match env {
                Some(env) => env,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        let inner = inner.clone();
        let handler = handler.clone();
        tokio::spawn(run_one(queue, env, inner, handler, permit));
    }
    debug!(queue = queue.name(), "queue dispatcher stopped");
}

/// Runs one attempt. The slot is released as soon as the handler returns, so a retry waiting
/// out its backoff does not hold up the queue.
async fn run_one(
    queue: QueueKind,
    env: Envelope,
    inner: Arc<Inner>,
    handler: Arc<dyn JobHandler>,
    permit: OwnedSemaphorePermit,
) {
    let Envelope { job, key, attempt } = env;
    let ctx = JobContext {
        key: key.clone(),
        attempt,
        max_attempts: inner.config.max_attempts,
    };
    let started = Instant::now();
    info!(queue = queue.name(), job_key = %key, attempt, "job started");

    let result = handler.handle(job.clone(), ctx.clone()).await;
    drop(permit);
    let elapsed_ms = started.elapsed().as_millis() as u64;
    histogram!("job_duration_ms", "queue" => queue.name()).record(elapsed_ms as f64);

    match result {
        Ok(()) => {
            counter!("jobs_completed_total", "queue" => queue.name()).increment(1);
            info!(queue = queue.name(), job_key = %key, elapsed_ms, outcome = "completed", "job finished");
            inner.settle(queue, &key, true);
        }
        Err(e) if ctx.will_retry(&e) => {
            let delay: Duration = inner.config.retry_backoff.delay_for(attempt - 1);
            warn!(
                queue = queue.name(),
                job_key = %key,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %format!("{e:#}"),
                "transient job failure, re-queueing"
            );
            tokio::time::sleep(delay).await;
            let requeued = inner
                .senders
                .get(&queue)
                .map(|tx| {
                    tx.send(Envelope {
                        job,
                        key: key.clone(),
                        attempt: attempt + 1,
                    })
                    .is_ok()
                })
                .unwrap_or(false);
            if !requeued {
                inner.settle(queue, &key, false);
            }
        }
        Err(e) => {
            counter!("jobs_failed_total", "queue" => queue.name()).increment(1);
            error!(queue = queue.name(), job_key = %key, attempt, elapsed_ms, error = %format!("{e:#}"), outcome = "failed", "job failed");
            inner.settle(queue, &key, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_retains_bounded_history() {
        let mut reg = KeyRegistry::default();
        for i in 0..5 {
            let k = format!("k{i}");
            reg.live.insert(k.clone());
            reg.finish(&k, true, 3, 1);
        }
        assert!(!reg.knows("k0"));
        assert!(!reg.knows("k1"));
        assert!(reg.knows("k4"));
        reg.live.insert("f".into());
        reg.finish("f", false, 3, 1);
        assert!(reg.knows("f"));
    }

    #[test]
    fn only_transient_non_timeout_fetch_errors_retry() {
        let status = anyhow::Error::new(FetchError::Status {
            url: "u".into(),
            status: 502,
        })
        .context("fetching article 3");
        assert!(is_retryable(&status));
        let timeout = anyhow::Error::new(FetchError::Timeout {
            url: "u".into(),
            timeout_ms: 5,
        });
        assert!(!is_retryable(&timeout));
        assert!(!is_retryable(&anyhow::anyhow!("plain failure")));
    }
}
