//! Job Queue - serialized execution against one native handle
//!
//! Each context owns one `JobQueue`. Jobs run strictly in submission order,
//! one at a time:
//!
//! ```text
//! submit ──▶ pending (FIFO) ──▶ operation (blocking pool) ──▶ transform (async side) ──▶ ticket
//!                 ▲                                                              │
//!                 └────────────────────── advance, always ───────────────────────┘
//! ```
//!
//! Submission never blocks: it appends to the pending list and, when no pump
//! is active, spawns one on the runtime captured at construction. The pump
//! drains the list and exits when it is empty.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Queue activity reported to the owning lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueActivity {
    /// A job was dequeued and is about to run
    Started { job: u64 },
    /// The last queued job finished and the pump stopped
    Drained,
}

/// Invoked with the queue's state lock held; must not submit to the queue.
pub type QueueObserver = Arc<dyn Fn(QueueActivity) + Send + Sync>;

type JobFuture = Pin<Box<dyn Future<Output = bool> + Send>>;
type Job = Box<dyn FnOnce() -> JobFuture + Send>;

struct PendingJob {
    id: u64,
    run: Job,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PendingJob>,
    running: bool,
}

/// Lock-free job counters
#[derive(Debug, Default)]
struct QueueMetrics {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    busy_time_ns: AtomicU64,
}

impl QueueMetrics {
    fn record(&self, duration: Duration, ok: bool) {
        if ok {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.busy_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    fn avg_job_ms(&self) -> f64 {
        let finished =
            self.completed.load(Ordering::Relaxed) + self.failed.load(Ordering::Relaxed);
        if finished == 0 {
            return 0.0;
        }
        let total = self.busy_time_ns.load(Ordering::Relaxed);
        (total as f64) / (finished as f64) / 1_000_000.0
    }
}

/// Point-in-time view of a queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub pending: usize,
    pub running: bool,
    pub avg_job_ms: f64,
}

struct QueueInner {
    label: String,
    runtime: Handle,
    state: Mutex<QueueState>,
    observer: Option<QueueObserver>,
    metrics: QueueMetrics,
    next_id: AtomicU64,
}

impl QueueInner {
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().expect("queue state poisoned")
    }

    fn notify(&self, activity: QueueActivity) {
        if let Some(observer) = &self.observer {
            observer(activity);
        }
    }
}

/// Per-context FIFO with at most one job executing
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl JobQueue {
    /// Create a queue whose pump runs on `runtime`.
    pub fn new(label: impl Into<String>, runtime: Handle) -> Self {
        Self::build(label.into(), runtime, None)
    }

    /// Create a queue that reports [`QueueActivity`] to `observer`.
    pub fn with_observer(
        label: impl Into<String>,
        runtime: Handle,
        observer: QueueObserver,
    ) -> Self {
        Self::build(label.into(), runtime, Some(observer))
    }

    fn build(label: String, runtime: Handle, observer: Option<QueueObserver>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                label,
                runtime,
                state: Mutex::new(QueueState::default()),
                observer,
                metrics: QueueMetrics::default(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Enqueue a job and return immediately.
    ///
    /// `operation` runs on the blocking pool with exclusive use of whatever
    /// the queue guards. `transform` runs afterwards on the async side and
    /// turns the raw result into the caller-visible value. The next job
    /// starts only after both have finished, whether they succeeded, failed
    /// or panicked.
    pub fn submit<R, T, Op, Tr>(&self, operation: Op, transform: Tr) -> JobTicket<T>
    where
        R: Send + 'static,
        T: Send + 'static,
        Op: FnOnce() -> Result<R> + Send + 'static,
        Tr: FnOnce(R) -> Result<T> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        let run: Job = Box::new(move || -> JobFuture {
            Box::pin(async move {
                let raw = match task::spawn_blocking(operation).await {
                    Ok(result) => result,
                    Err(e) => Err(Error::engine(format!("job {} panicked: {}", id, e))),
                };
                let outcome = raw.and_then(|value| {
                    catch_unwind(AssertUnwindSafe(|| transform(value))).unwrap_or_else(|_| {
                        Err(Error::engine(format!("job {} result transform panicked", id)))
                    })
                });
                let ok = outcome.is_ok();
                if let Err(e) = &outcome {
                    debug!(job = id, error = %e, "Job failed");
                }
                if tx.send(outcome).is_err() {
                    debug!(job = id, "Job ticket dropped before completion");
                }
                ok
            })
        });

        self.inner.metrics.submitted.fetch_add(1, Ordering::Relaxed);
        let start_pump = {
            let mut state = self.inner.lock_state();
            state.pending.push_back(PendingJob { id, run });
            !std::mem::replace(&mut state.running, true)
        };
        debug!(queue = %self.inner.label, job = id, "Job submitted");

        if start_pump {
            self.inner.runtime.spawn(pump(self.inner.clone()));
        }

        JobTicket { id, rx }
    }

    /// Jobs waiting to start (excluding the one running).
    pub fn pending(&self) -> usize {
        self.inner.lock_state().pending.len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock_state().running
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn stats(&self) -> QueueStats {
        let (pending, running) = {
            let state = self.inner.lock_state();
            (state.pending.len(), state.running)
        };
        let metrics = &self.inner.metrics;
        QueueStats {
            submitted: metrics.submitted.load(Ordering::Relaxed),
            completed: metrics.completed.load(Ordering::Relaxed),
            failed: metrics.failed.load(Ordering::Relaxed),
            pending,
            running,
            avg_job_ms: metrics.avg_job_ms(),
        }
    }
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("label", &self.inner.label)
            .field("stats", &self.stats())
            .finish()
    }
}

async fn pump(inner: Arc<QueueInner>) {
    loop {
        let job = {
            let mut state = inner.lock_state();
            match state.pending.pop_front() {
                Some(job) => {
                    inner.notify(QueueActivity::Started { job: job.id });
                    job
                }
                None => {
                    state.running = false;
                    inner.notify(QueueActivity::Drained);
                    break;
                }
            }
        };

        debug!(queue = %inner.label, job = job.id, "Job started");
        let started = Instant::now();
        let ok = (job.run)().await;
        let elapsed = started.elapsed();
        inner.metrics.record(elapsed, ok);
        if !ok {
            warn!(queue = %inner.label, job = job.id, "Job finished with an error");
        }
        debug!(
            queue = %inner.label,
            job = job.id,
            elapsed_ms = elapsed.as_millis() as u64,
            "Job finished"
        );
    }
}

/// Completion handle for one submitted job
///
/// Resolves exactly once with the job's result. Dropping the ticket does
/// not cancel the job.
#[must_use = "a JobTicket does nothing unless awaited"]
pub struct JobTicket<T> {
    id: u64,
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> JobTicket<T> {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<T> Future for JobTicket<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| {
            received.unwrap_or_else(|_| Err(Error::engine("job was dropped before completion")))
        })
    }
}

impl<T> std::fmt::Debug for JobTicket<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobTicket").field("id", &self.id).finish()
    }
}
