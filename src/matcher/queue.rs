//! Bounded worker pool for matcher jobs.
//!
//! Each job is "re-match query X" or "re-match post Y". The pool keeps
//! an in-flight key set: a submit whose key is already queued or
//! running collapses into a run-again flag, and the job re-enqueues at
//! most once on completion. The same key set serialises the
//! synchronous read-path population against queued work.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::{AppError, AppResult};

use super::Matcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchJob {
    RematchQuery(i64),
    RematchPost(i64),
}

impl std::fmt::Display for MatchJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MatchJob::RematchQuery(id) => write!(f, "query:{}", id),
            MatchJob::RematchPost(id) => write!(f, "post:{}", id),
        }
    }
}

struct QueueShared {
    matcher: Arc<Matcher>,
    /// job -> "run again once this one finishes".
    inflight: Mutex<HashMap<MatchJob, bool>>,
    /// Signalled whenever a job leaves the in-flight set.
    done: Condvar,
    /// Senders for worker-side re-enqueue; taken on shutdown so the
    /// channel disconnects.
    tx: Mutex<Option<SyncSender<MatchJob>>>,
    processed: AtomicU64,
    errors: AtomicU64,
    workers: usize,
}

pub struct MatchQueue {
    tx: Mutex<Option<SyncSender<MatchJob>>>,
    shared: Arc<QueueShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl MatchQueue {
    /// Create the queue and spawn `num_workers` consumer threads.
    pub fn new(matcher: Arc<Matcher>, num_workers: usize, capacity: usize) -> Self {
        let (tx, rx) = sync_channel::<MatchJob>(capacity);
        let rx = Arc::new(Mutex::new(rx));

        let shared = Arc::new(QueueShared {
            matcher,
            inflight: Mutex::new(HashMap::new()),
            done: Condvar::new(),
            tx: Mutex::new(Some(tx.clone())),
            processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            workers: num_workers,
        });

        tracing::info!(workers = num_workers, capacity, "Match queue initialized");

        let mut handles = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let rx = rx.clone();
            let shared = shared.clone();
            let handle = std::thread::Builder::new()
                .name(format!("match-worker-{}", worker_id))
                .spawn(move || {
                    tracing::info!(worker_id, "Match worker started");
                    worker_loop(worker_id, rx, shared);
                    tracing::info!(worker_id, "Match worker stopped");
                })
                .expect("Failed to spawn match worker thread");
            handles.push(handle);
        }

        Self { tx: Mutex::new(Some(tx)), shared, handles: Mutex::new(handles) }
    }

    /// Submit a job. Returns immediately. A duplicate of a queued or
    /// running job collapses into its run-again flag; a full queue
    /// drops the job with a warning.
    pub fn submit(&self, job: MatchJob) {
        {
            let mut inflight = match self.shared.inflight.lock() {
                Ok(g) => g,
                Err(poison) => poison.into_inner(),
            };
            if let Some(rerun) = inflight.get_mut(&job) {
                *rerun = true;
                tracing::debug!(job = %job, "Duplicate job collapsed");
                return;
            }
            inflight.insert(job, false);
        }

        let tx = self.tx.lock().ok().and_then(|g| g.clone());
        let sent = match tx {
            Some(tx) => tx.try_send(job),
            None => Err(TrySendError::Disconnected(job)),
        };

        if let Err(e) = sent {
            self.shared.remove_inflight(&job);
            match e {
                TrySendError::Full(job) => {
                    tracing::warn!(job = %job, "Match queue full, job dropped")
                }
                TrySendError::Disconnected(job) => {
                    tracing::error!(job = %job, "Match queue disconnected, job dropped")
                }
            }
        }
    }

    /// Run `f` under `job`'s key in the calling thread, waiting first
    /// for any queued or running instance of the same key to finish.
    /// Used by the read path so a cache-miss population cannot race an
    /// asynchronous one for the same query.
    pub fn run_sync<T>(&self, job: MatchJob, f: impl FnOnce() -> AppResult<T>) -> AppResult<T> {
        {
            let mut inflight = self
                .shared
                .inflight
                .lock()
                .map_err(|e| AppError::Storage(format!("Queue lock poisoned: {}", e)))?;
            while inflight.contains_key(&job) {
                inflight = self
                    .shared
                    .done
                    .wait(inflight)
                    .map_err(|e| AppError::Storage(format!("Queue lock poisoned: {}", e)))?;
            }
            inflight.insert(job, false);
        }

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
        let rerun = self.shared.remove_inflight(&job);
        if rerun {
            self.submit(job);
        }

        match result {
            Ok(r) => r,
            Err(_) => Err(AppError::Storage(format!("Job {} panicked", job))),
        }
    }

    pub fn stats(&self) -> serde_json::Value {
        let inflight = self.shared.inflight.lock().map(|m| m.len()).unwrap_or(0);
        serde_json::json!({
            "inflight": inflight,
            "processed": self.shared.processed.load(Ordering::Relaxed),
            "errors": self.shared.errors.load(Ordering::Relaxed),
            "workers": self.shared.workers,
        })
    }

    /// Drop all senders so workers drain and exit, then join them.
    pub fn shutdown(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
        if let Ok(mut tx) = self.shared.tx.lock() {
            tx.take();
        }
        if let Ok(mut handles) = self.handles.lock() {
            tracing::info!(count = handles.len(), "Waiting for match workers to finish");
            for handle in handles.drain(..) {
                let _ = handle.join();
            }
            tracing::info!("All match workers stopped");
        }
    }
}

impl QueueShared {
    /// Remove a job from the in-flight set; returns its run-again flag.
    fn remove_inflight(&self, job: &MatchJob) -> bool {
        let rerun = {
            let mut inflight = match self.inflight.lock() {
                Ok(g) => g,
                Err(poison) => poison.into_inner(),
            };
            matches!(inflight.remove(job), Some(true))
        };
        self.done.notify_all();
        rerun
    }

    /// Re-enqueue a job whose run-again flag was set.
    fn requeue(&self, job: MatchJob) {
        {
            let mut inflight = match self.inflight.lock() {
                Ok(g) => g,
                Err(poison) => poison.into_inner(),
            };
            if inflight.contains_key(&job) {
                return;
            }
            inflight.insert(job, false);
        }
        let tx = self.tx.lock().ok().and_then(|g| g.clone());
        match tx {
            Some(tx) if tx.try_send(job).is_ok() => {
                tracing::debug!(job = %job, "Job re-enqueued after collapsed duplicate");
            }
            _ => {
                self.remove_inflight(&job);
                tracing::warn!(job = %job, "Could not re-enqueue collapsed job");
            }
        }
    }
}

fn worker_loop(worker_id: usize, rx: Arc<Mutex<Receiver<MatchJob>>>, shared: Arc<QueueShared>) {
    loop {
        let job = {
            let rx_guard = match rx.lock() {
                Ok(g) => g,
                Err(_) => {
                    tracing::error!(worker_id, "Receiver mutex poisoned, worker exiting");
                    return;
                }
            };
            match rx_guard.recv() {
                Ok(job) => job,
                Err(_) => {
                    tracing::debug!(worker_id, "Channel closed, worker exiting");
                    return;
                }
            }
        };

        let start = std::time::Instant::now();
        tracing::info!(worker_id, job = %job, "Worker picked up job");

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| match job {
            MatchJob::RematchQuery(id) => shared.matcher.populate_query(id),
            MatchJob::RematchPost(id) => shared.matcher.match_post(id),
        }));

        let duration_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(Ok(())) => {
                shared.processed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(worker_id, job = %job, duration_ms, "Job complete");
            }
            Ok(Err(e)) => {
                shared.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(worker_id, job = %job, error = %e, duration_ms, "Job failed");
            }
            Err(panic_payload) => {
                shared.errors.fetch_add(1, Ordering::Relaxed);
                let panic_msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                tracing::error!(worker_id, job = %job, panic_message = %panic_msg, duration_ms, "Job panicked");
            }
        }

        let rerun = shared.remove_inflight(&job);
        if rerun {
            shared.requeue(job);
        }
    }
}
