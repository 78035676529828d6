//! Callback Router - per-context delivery of engine log and progress events
//!
//! The engine exposes one process-wide log hook and one progress hook with no
//! context argument. Routing is reconstructed from the calling thread: while
//! a job's operation runs on a worker thread, an [`ExecutionScope`] records
//! that context's [`EventSink`] in a thread-local. The global hooks
//! ([`dispatch_log`], [`dispatch_progress`]) look it up and push the event
//! into that sink's channel.
//!
//! Each sink owns one delivery task on the async runtime which invokes the
//! listeners in emission order. Listeners never run on the engine thread.
//! They do run on a runtime worker, so a listener should return quickly;
//! teardown waits for an invocation already in progress.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::os::raw::c_int;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock, Weak};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::ffi;

/// Severity of an engine log line (`sd_log_level_t`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Map the engine's raw level; unknown values are treated as info.
    pub fn from_raw(level: c_int) -> Self {
        match level {
            ffi::SD_LOG_DEBUG => LogLevel::Debug,
            ffi::SD_LOG_WARN => LogLevel::Warn,
            ffi::SD_LOG_ERROR => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sampling progress tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressEvent {
    pub step: i32,
    pub steps: i32,
    /// Seconds spent on the last step
    pub seconds: f32,
}

pub type LogListener = Arc<dyn Fn(LogLevel, &str) + Send + Sync>;
pub type ProgressListener = Arc<dyn Fn(ProgressEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
enum EngineEvent {
    Log(LogLevel, String),
    Progress(ProgressEvent),
}

/// What travels through a sink's channel
enum Delivery {
    Event(EngineEvent),
    /// Answered once every earlier message has been handled
    Marker(oneshot::Sender<()>),
}

#[derive(Default)]
struct Listeners {
    log: Option<LogListener>,
    progress: Option<ProgressListener>,
    closed: bool,
}

/// A context's endpoint for routed engine events
pub struct EventSink {
    label: String,
    listeners: RwLock<Listeners>,
    tx: mpsc::UnboundedSender<Delivery>,
    /// Held while a listener runs; `false` once torn down
    gate: Mutex<bool>,
    cancel: CancellationToken,
    delivery: Mutex<Option<JoinHandle<()>>>,
}

impl EventSink {
    /// Create a sink and start its delivery task on `runtime`.
    pub fn spawn(
        label: impl Into<String>,
        runtime: &Handle,
        log: Option<LogListener>,
        progress: Option<ProgressListener>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let sink = Arc::new(Self {
            label: label.into(),
            listeners: RwLock::new(Listeners {
                log,
                progress,
                closed: false,
            }),
            tx,
            gate: Mutex::new(true),
            cancel: cancel.clone(),
            delivery: Mutex::new(None),
        });

        let task = runtime.spawn(deliver(Arc::downgrade(&sink), rx, cancel));
        *sink.delivery.lock().expect("delivery slot poisoned") = Some(task);
        sink
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Replace the log listener. Visible to the next delivered event.
    pub fn set_log_listener(&self, listener: Option<LogListener>) -> Result<()> {
        let mut listeners = self.listeners.write().expect("listener lock poisoned");
        if listeners.closed {
            return Err(Error::Disposed);
        }
        listeners.log = listener;
        Ok(())
    }

    /// Replace the progress listener. Visible to the next delivered event.
    pub fn set_progress_listener(&self, listener: Option<ProgressListener>) -> Result<()> {
        let mut listeners = self.listeners.write().expect("listener lock poisoned");
        if listeners.closed {
            return Err(Error::Disposed);
        }
        listeners.progress = listener;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.listeners.read().expect("listener lock poisoned").closed
    }

    /// Queue an event for delivery. Dropped when nobody listens for it.
    fn push(&self, event: EngineEvent) {
        let wanted = {
            let listeners = self.listeners.read().expect("listener lock poisoned");
            !listeners.closed
                && match event {
                    EngineEvent::Log(..) => listeners.log.is_some(),
                    EngineEvent::Progress(_) => listeners.progress.is_some(),
                }
        };
        if !wanted {
            trace!(sink = %self.label, "No listener registered, dropping engine event");
            return;
        }
        // Send only fails once the delivery task is gone, i.e. after teardown.
        let _ = self.tx.send(Delivery::Event(event));
    }

    fn mark(&self) -> Option<oneshot::Receiver<()>> {
        if self.is_closed() {
            return None;
        }
        let (done, waiter) = oneshot::channel();
        self.tx.send(Delivery::Marker(done)).ok()?;
        Some(waiter)
    }

    /// Wait until every event queued before this call has been delivered.
    ///
    /// Returns early if delivery is torn down meanwhile.
    pub async fn flush(&self) {
        if let Some(waiter) = self.mark() {
            let _ = waiter.await;
        }
    }

    /// Blocking form of [`flush`](Self::flush), for the blocking pool.
    ///
    /// Must not be called from a listener or an async task.
    pub fn flush_blocking(&self) {
        if let Some(waiter) = self.mark() {
            let _ = waiter.blocking_recv();
        }
    }

    /// Invoke the current listener for one event, on the delivery task.
    fn deliver(&self, event: EngineEvent) {
        let gate = self.gate.lock().unwrap_or_else(|e| e.into_inner());
        if !*gate {
            return;
        }
        let (log, progress) = {
            let listeners = self.listeners.read().expect("listener lock poisoned");
            (listeners.log.clone(), listeners.progress.clone())
        };
        let outcome = catch_unwind(AssertUnwindSafe(|| match event {
            EngineEvent::Log(level, text) => {
                if let Some(listener) = log {
                    listener(level, &text);
                }
            }
            EngineEvent::Progress(tick) => {
                if let Some(listener) = progress {
                    listener(tick);
                }
            }
        }));
        if outcome.is_err() {
            warn!(sink = %self.label, "Listener panicked, event dropped");
        }
        drop(gate);
    }

    /// Abort delivery and drop the listeners. Events still queued are lost.
    ///
    /// Waits for a listener invocation already in progress on another thread;
    /// once this returns no listener runs again for this sink. Blocks, so
    /// call it from the blocking pool.
    pub fn teardown(&self) {
        *self.gate.lock().unwrap_or_else(|e| e.into_inner()) = false;
        self.close();
    }

    /// Abort delivery without waiting on an in-progress invocation.
    ///
    /// Used from `Drop`, which may itself run inside a listener.
    pub fn close(&self) {
        self.cancel.cancel();
        if let Some(task) = self.delivery.lock().expect("delivery slot poisoned").take() {
            task.abort();
        }
        let mut listeners = self.listeners.write().expect("listener lock poisoned");
        if !listeners.closed {
            debug!(sink = %self.label, "Event routing torn down");
        }
        listeners.log = None;
        listeners.progress = None;
        listeners.closed = true;
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink")
            .field("label", &self.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn deliver(
    sink: Weak<EventSink>,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        let event = match message {
            Delivery::Event(event) => event,
            Delivery::Marker(done) => {
                let _ = done.send(());
                continue;
            }
        };
        match sink.upgrade() {
            Some(sink) => sink.deliver(event),
            None => break,
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<EventSink>>> = const { RefCell::new(None) };
}

/// Marks the current thread as executing a job for one sink
///
/// Restores the previous marker on drop, including during unwinding. Not
/// `Send`: it must be dropped on the thread that created it.
pub struct ExecutionScope {
    previous: Option<Arc<EventSink>>,
    _not_send: PhantomData<*const ()>,
}

impl ExecutionScope {
    pub fn enter(sink: Arc<EventSink>) -> Self {
        let previous = CURRENT.with(|current| current.replace(Some(sink)));
        Self {
            previous,
            _not_send: PhantomData,
        }
    }
}

impl Drop for ExecutionScope {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// The sink of the job running on this thread, if any.
pub fn current_sink() -> Option<Arc<EventSink>> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Global log hook. Call from the engine thread during an engine call.
pub fn dispatch_log(level: LogLevel, text: &str) {
    match current_sink() {
        Some(sink) => sink.push(EngineEvent::Log(level, text.to_owned())),
        None => trace!(%level, "Engine log outside any job: {}", text.trim_end()),
    }
}

/// Global progress hook. Call from the engine thread during an engine call.
pub fn dispatch_progress(step: i32, steps: i32, seconds: f32) {
    match current_sink() {
        Some(sink) => sink.push(EngineEvent::Progress(ProgressEvent {
            step,
            steps,
            seconds,
        })),
        None => trace!(step, steps, "Engine progress outside any job"),
    }
}
