//! Runtime facade - the entry point hosts hold on to
//!
//! A [`Runtime`] pairs one [`Engine`] with the process-wide hook
//! registration and hands out contexts and upscalers. Context creation must
//! happen inside a tokio runtime: each context's queue pump and event
//! delivery task are spawned on the runtime that created it.

use std::sync::Arc;

use tracing::info;

use crate::config::{ContextConfig, RuntimeConfig, UpscalerConfig};
use crate::context::{Context, Upscaler};
use crate::engine::{Engine, NativeEngine};
use crate::error::Result;
use crate::params::WeightType;
use crate::router::{LogListener, ProgressListener};

#[derive(Clone)]
pub struct Runtime {
    engine: Arc<dyn Engine>,
}

impl Runtime {
    /// Wrap an engine and install its log/progress hooks.
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        engine.install_hooks();
        info!(engine = engine.name(), "Diffusion runtime initialized");
        Self { engine }
    }

    /// Load the native engine library as described by `config`.
    pub fn load(config: &RuntimeConfig) -> Result<Self> {
        let engine = NativeEngine::load(config)?;
        Ok(Self::new(Arc::new(engine)))
    }

    /// Construct a diffusion context.
    ///
    /// Resolves once the model is loaded. Listeners passed here also see the
    /// engine's log lines emitted while loading.
    pub async fn create_context(
        &self,
        config: ContextConfig,
        log: Option<LogListener>,
        progress: Option<ProgressListener>,
    ) -> Result<Context> {
        Context::create(self.engine.clone(), config, log, progress).await
    }

    pub async fn create_upscaler(
        &self,
        config: UpscalerConfig,
        log: Option<LogListener>,
        progress: Option<ProgressListener>,
    ) -> Result<Upscaler> {
        Upscaler::create(self.engine.clone(), config, log, progress).await
    }

    pub fn system_info(&self) -> String {
        self.engine.system_info()
    }

    pub fn physical_cores(&self) -> i32 {
        self.engine.physical_cores()
    }

    /// Engine name of a raw weight type value; `InvalidParameter` for
    /// values outside the known table.
    pub fn weight_type_name(&self, raw: u32) -> Result<String> {
        let ty = WeightType::try_from(raw)?;
        Ok(self.engine.weight_type_name(ty))
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("engine", &self.engine.name())
            .finish()
    }
}
