//! Reference-counted custody of a native engine handle
//!
//! A [`NativeHandle`] is shared as `Arc<NativeHandle>` between its owning
//! session and whichever job is currently running. Dropping the last `Arc`
//! releases the native resource, so a dispose that arrives mid-job only
//! takes effect once the job lets go of its lease.

use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::{ContextConfig, UpscalerConfig};
use crate::engine::{Engine, HandleKind, RawHandle};
use crate::error::{Error, Result};

pub struct NativeHandle {
    engine: Arc<dyn Engine>,
    kind: HandleKind,
    raw: RawHandle,
}

impl NativeHandle {
    /// Construct a diffusion handle. A failed construction leaves nothing
    /// to release.
    pub fn acquire(engine: Arc<dyn Engine>, config: &ContextConfig) -> Result<Arc<Self>> {
        let raw = engine.construct(config)?;
        debug!(engine = engine.name(), handle = raw.token(), "Diffusion handle acquired");
        Ok(Arc::new(Self {
            engine,
            kind: HandleKind::Diffusion,
            raw,
        }))
    }

    /// Construct an upscaler handle.
    pub fn acquire_upscaler(engine: Arc<dyn Engine>, config: &UpscalerConfig) -> Result<Arc<Self>> {
        let raw = engine.construct_upscaler(config)?;
        debug!(engine = engine.name(), handle = raw.token(), "Upscaler handle acquired");
        Ok(Arc::new(Self {
            engine,
            kind: HandleKind::Upscaler,
            raw,
        }))
    }

    pub fn raw(&self) -> RawHandle {
        self.raw
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    pub fn engine(&self) -> &dyn Engine {
        self.engine.as_ref()
    }
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        debug!(kind = ?self.kind, handle = self.raw.token(), "Releasing native handle");
        self.engine.release(self.kind, self.raw);
    }
}

impl std::fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeHandle")
            .field("engine", &self.engine.name())
            .field("kind", &self.kind)
            .field("raw", &self.raw)
            .finish()
    }
}

/// The session's own reference to its handle
///
/// Empty before construction completes and after dispose takes it.
#[derive(Debug, Default)]
pub struct HandleSlot {
    inner: Mutex<Option<Arc<NativeHandle>>>,
}

impl HandleSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(&self, handle: Arc<NativeHandle>) {
        *self.inner.lock().expect("handle slot poisoned") = Some(handle);
    }

    /// Borrow the handle for one job. Fails with [`Error::Disposed`] once
    /// the slot is empty.
    pub fn lease(&self) -> Result<Arc<NativeHandle>> {
        self.inner
            .lock()
            .expect("handle slot poisoned")
            .clone()
            .ok_or(Error::Disposed)
    }

    /// Remove the session's reference. The native release happens when the
    /// returned `Arc` and any outstanding leases are dropped.
    pub fn take(&self) -> Option<Arc<NativeHandle>> {
        self.inner.lock().expect("handle slot poisoned").take()
    }

    pub fn is_present(&self) -> bool {
        self.inner.lock().expect("handle slot poisoned").is_some()
    }
}
