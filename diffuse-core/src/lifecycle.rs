//! Context lifecycle and the session core shared by contexts and upscalers
//!
//! ```text
//! constructing ──▶ ready ──▶ busy ⇄ idle
//!      │             │        │      │
//!      ▼             └────────┴──────┴──▶ disposing ──▶ disposed
//!   disposed
//! ```
//!
//! A [`Session`] owns one native handle, one [`JobQueue`] and one
//! [`EventSink`]. Every engine call, including construction and release, is a
//! queued job so that nothing touches the handle concurrently.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::runtime::Handle;
use tokio::task;
use tracing::{debug, info, warn};

use crate::engine::{Engine, HandleSlot, NativeHandle};
use crate::error::{Error, Result};
use crate::queue::{JobQueue, JobTicket, QueueActivity, QueueStats};
use crate::router::{EventSink, ExecutionScope, LogListener, ProgressListener};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// The construction job is queued or running
    Constructing,
    /// Constructed, no job has run yet
    Ready,
    /// A job is running or queued
    Busy,
    /// The queue is empty
    Idle,
    /// Dispose was requested; queued jobs drain, new ones are rejected
    Disposing,
    /// The handle has been released
    Disposed,
}

impl LifecycleState {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Constructing => "constructing",
            LifecycleState::Ready => "ready",
            LifecycleState::Busy => "busy",
            LifecycleState::Idle => "idle",
            LifecycleState::Disposing => "disposing",
            LifecycleState::Disposed => "disposed",
        }
    }

    /// Whether new jobs may still be submitted.
    pub fn accepts_jobs(self) -> bool {
        !matches!(self, LifecycleState::Disposing | LifecycleState::Disposed)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Thread-safe lifecycle state of one session
#[derive(Debug)]
pub struct Lifecycle {
    label: String,
    state: Mutex<LifecycleState>,
}

impl Lifecycle {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            state: Mutex::new(LifecycleState::Constructing),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LifecycleState> {
        self.state.lock().expect("lifecycle state poisoned")
    }

    fn set(&self, state: &mut LifecycleState, next: LifecycleState) {
        let from = *state;
        if from != next {
            debug!(session = %self.label, %from, to = %next, "Lifecycle transition");
            *state = next;
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.lock()
    }

    /// Apply queue activity. Only `ready`, `busy` and `idle` react to it.
    pub fn observe(&self, activity: QueueActivity) {
        let mut state = self.lock();
        let next = match (*state, activity) {
            (LifecycleState::Ready | LifecycleState::Idle, QueueActivity::Started { .. }) => {
                LifecycleState::Busy
            }
            (LifecycleState::Busy, QueueActivity::Drained) => LifecycleState::Idle,
            (current, _) => current,
        };
        self.set(&mut state, next);
    }

    /// Construction succeeded.
    pub fn constructed(&self) {
        let mut state = self.lock();
        if *state == LifecycleState::Constructing {
            self.set(&mut state, LifecycleState::Ready);
        }
    }

    /// Fail with [`Error::Disposed`] once dispose has been requested.
    pub fn check_submit(&self) -> Result<()> {
        if self.state().accepts_jobs() {
            Ok(())
        } else {
            Err(Error::Disposed)
        }
    }

    /// Enter `disposing`; [`Error::AlreadyDisposed`] on a repeated request.
    pub fn begin_dispose(&self) -> Result<()> {
        let mut state = self.lock();
        if !state.accepts_jobs() {
            return Err(Error::AlreadyDisposed);
        }
        self.set(&mut state, LifecycleState::Disposing);
        Ok(())
    }

    /// Terminal; also used when construction fails.
    pub fn finish_dispose(&self) {
        let mut state = self.lock();
        self.set(&mut state, LifecycleState::Disposed);
    }
}

/// One native handle with its queue and event routing
pub(crate) struct Session {
    label: String,
    engine: Arc<dyn Engine>,
    slot: HandleSlot,
    sink: Arc<EventSink>,
    lifecycle: Arc<Lifecycle>,
    queue: JobQueue,
    /// Orders "check state, then enqueue" against dispose.
    admission: Mutex<()>,
}

impl Session {
    /// Queue the construction job and wait for it.
    ///
    /// Must be called from within a tokio runtime; the queue pump and the
    /// event delivery task run on it. On failure the session is disposed and
    /// the error is reported as [`Error::Construction`].
    pub(crate) async fn open<F>(
        label: String,
        engine: Arc<dyn Engine>,
        log: Option<LogListener>,
        progress: Option<ProgressListener>,
        acquire: F,
    ) -> Result<Arc<Self>>
    where
        F: FnOnce(Arc<dyn Engine>) -> Result<Arc<NativeHandle>> + Send + 'static,
    {
        let runtime = Handle::current();
        let lifecycle = Arc::new(Lifecycle::new(label.clone()));
        let observed = lifecycle.clone();
        let queue = JobQueue::with_observer(
            label.clone(),
            runtime.clone(),
            Arc::new(move |activity| observed.observe(activity)),
        );
        let sink = EventSink::spawn(label.clone(), &runtime, log, progress);

        let session = Arc::new(Self {
            label,
            engine,
            slot: HandleSlot::new(),
            sink,
            lifecycle,
            queue,
            admission: Mutex::new(()),
        });

        let worker = session.clone();
        let ready = session.lifecycle.clone();
        let ticket = session.queue.submit(
            move || {
                let _scope = ExecutionScope::enter(worker.sink.clone());
                let handle = acquire(worker.engine.clone())?;
                worker.slot.install(handle);
                Ok(())
            },
            move |()| {
                ready.constructed();
                Ok(())
            },
        );

        match ticket.await {
            Ok(()) => {
                info!(session = %session.label, engine = session.engine.name(), "Session ready");
                Ok(session)
            }
            Err(e) => {
                session.lifecycle.finish_dispose();
                let sink = session.sink.clone();
                let _ = task::spawn_blocking(move || close_events(&sink)).await;
                let e = match e {
                    Error::Construction(_) => e,
                    other => Error::Construction(other.to_string()),
                };
                info!(session = %session.label, error = %e, "Session construction failed");
                Err(e)
            }
        }
    }

    /// Queue a job against the native handle.
    ///
    /// `operation` runs on the blocking pool with the handle leased and this
    /// session's event sink marked current. Fails immediately with
    /// [`Error::Disposed`] once dispose has been requested.
    pub(crate) fn submit<R, T, Op, Tr>(
        self: &Arc<Self>,
        operation: Op,
        transform: Tr,
    ) -> Result<JobTicket<T>>
    where
        R: Send + 'static,
        T: Send + 'static,
        Op: FnOnce(&NativeHandle) -> Result<R> + Send + 'static,
        Tr: FnOnce(R) -> Result<T> + Send + 'static,
    {
        let _admission = self.admission.lock().expect("admission lock poisoned");
        self.lifecycle.check_submit()?;

        let worker = self.clone();
        Ok(self.queue.submit(
            move || {
                let handle = worker.slot.lease()?;
                let _scope = ExecutionScope::enter(worker.sink.clone());
                operation(&handle)
            },
            transform,
        ))
    }

    /// Queue the release job behind everything already submitted.
    ///
    /// The state flips to `disposing` before this returns, so later submits
    /// fail. Every event emitted by the draining jobs and by the release
    /// itself is delivered before the ticket resolves; after that no listener
    /// runs again.
    pub(crate) fn dispose(self: &Arc<Self>) -> Result<JobTicket<()>> {
        let _admission = self.admission.lock().expect("admission lock poisoned");
        self.lifecycle.begin_dispose()?;
        info!(session = %self.label, pending = self.queue.pending(), "Dispose requested");

        let worker = self.clone();
        let ticket = self.queue.submit(
            move || {
                let released = catch_unwind(AssertUnwindSafe(|| {
                    let _scope = ExecutionScope::enter(worker.sink.clone());
                    drop(worker.slot.take());
                }));
                close_events(&worker.sink);
                worker.lifecycle.finish_dispose();
                info!(session = %worker.label, "Session disposed");
                released.map_err(|_| {
                    warn!(session = %worker.label, "Engine panicked while releasing handle");
                    Error::engine("release panicked")
                })
            },
            |()| Ok(()),
        );
        debug!(session = %self.label, job = ticket.id(), "Release queued");
        Ok(ticket)
    }

    pub(crate) fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub(crate) fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    pub(crate) fn set_log_listener(&self, listener: Option<LogListener>) -> Result<()> {
        self.sink.set_log_listener(listener)
    }

    pub(crate) fn set_progress_listener(&self, listener: Option<ProgressListener>) -> Result<()> {
        self.sink.set_progress_listener(listener)
    }
}

/// Deliver what is queued, then stop routing. Blocks; blocking pool only.
fn close_events(sink: &EventSink) {
    sink.flush_blocking();
    sink.teardown();
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.lifecycle.state() != LifecycleState::Disposed {
            debug!(session = %self.label, "Session dropped without dispose");
        }
        // The handle goes with the slot once this returns.
        self.sink.close();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("label", &self.label)
            .field("engine", &self.engine.name())
            .field("state", &self.state())
            .field("queue", &self.queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::engine::{HandleKind, RawHandle};
    use crate::image::Image;
    use crate::params::Txt2ImgParams;
    use std::num::NonZeroUsize;

    struct PanicOnRelease;

    impl Engine for PanicOnRelease {
        fn name(&self) -> &str {
            "panic-on-release"
        }

        fn construct(&self, _config: &ContextConfig) -> Result<RawHandle> {
            Ok(RawHandle::from_token(NonZeroUsize::new(8).unwrap()))
        }

        fn release(&self, _kind: HandleKind, _handle: RawHandle) {
            panic!("free_sd_ctx crashed");
        }

        fn txt2img(&self, _handle: RawHandle, _params: &Txt2ImgParams) -> Result<Vec<Image>> {
            Ok(Vec::new())
        }

        fn system_info(&self) -> String {
            String::new()
        }
    }

    #[test]
    fn test_state_machine_happy_path() {
        let lifecycle = Lifecycle::new("t");
        assert_eq!(lifecycle.state(), LifecycleState::Constructing);

        // Construction's own queue activity does not leave `constructing`.
        lifecycle.observe(QueueActivity::Started { job: 1 });
        assert_eq!(lifecycle.state(), LifecycleState::Constructing);
        lifecycle.constructed();
        lifecycle.observe(QueueActivity::Drained);
        assert_eq!(lifecycle.state(), LifecycleState::Ready);

        lifecycle.observe(QueueActivity::Started { job: 2 });
        assert_eq!(lifecycle.state(), LifecycleState::Busy);
        lifecycle.observe(QueueActivity::Drained);
        assert_eq!(lifecycle.state(), LifecycleState::Idle);
        lifecycle.observe(QueueActivity::Started { job: 3 });
        assert_eq!(lifecycle.state(), LifecycleState::Busy);
    }

    #[test]
    fn test_dispose_transitions() {
        let lifecycle = Lifecycle::new("t");
        lifecycle.constructed();
        assert!(lifecycle.check_submit().is_ok());

        lifecycle.begin_dispose().unwrap();
        assert_eq!(lifecycle.state(), LifecycleState::Disposing);
        assert_eq!(lifecycle.check_submit(), Err(Error::Disposed));
        assert_eq!(lifecycle.begin_dispose(), Err(Error::AlreadyDisposed));

        // Draining jobs do not pull the state back to busy/idle.
        lifecycle.observe(QueueActivity::Started { job: 9 });
        lifecycle.observe(QueueActivity::Drained);
        assert_eq!(lifecycle.state(), LifecycleState::Disposing);

        lifecycle.finish_dispose();
        assert_eq!(lifecycle.state(), LifecycleState::Disposed);
        assert_eq!(lifecycle.begin_dispose(), Err(Error::AlreadyDisposed));
        assert_eq!(lifecycle.check_submit(), Err(Error::Disposed));
    }

    #[test]
    fn test_failed_construction_is_terminal() {
        let lifecycle = Lifecycle::new("t");
        lifecycle.finish_dispose();
        lifecycle.constructed();
        assert_eq!(lifecycle.state(), LifecycleState::Disposed);
    }

    #[tokio::test]
    async fn test_release_panic_still_disposes() {
        let session = Session::open(
            "t".to_string(),
            Arc::new(PanicOnRelease),
            None,
            None,
            |engine| NativeHandle::acquire(engine, &ContextConfig::default()),
        )
        .await
        .unwrap();

        let err = session.dispose().unwrap().await.unwrap_err();
        assert!(matches!(err, Error::EngineFailure(_)));
        assert_eq!(session.state(), LifecycleState::Disposed);
        assert_eq!(session.set_log_listener(None), Err(Error::Disposed));
        assert_eq!(session.dispose().unwrap_err(), Error::AlreadyDisposed);
    }
}
