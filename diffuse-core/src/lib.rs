//! Diffuse Core - binding core for a native image-diffusion engine
//!
//! Hosts a stable-diffusion engine behind a safe, asynchronous API:
//!
//! - Every context owns one native handle, used by one job at a time in
//!   submission order ([`queue::JobQueue`]).
//! - Engine calls run on the blocking pool; results are shaped and delivered
//!   on the async side.
//! - The engine's process-wide log and progress hooks are routed to the
//!   listeners of whichever context is running on the calling thread
//!   ([`router`]).
//! - Native handles are released exactly once, after the last job using
//!   them ([`engine::NativeHandle`]).
//!
//! ```no_run
//! use diffuse_core::{ContextConfig, Runtime, RuntimeConfig, Txt2ImgParams};
//!
//! # async fn run() -> diffuse_core::Result<()> {
//! let runtime = Runtime::load(&RuntimeConfig::default())?;
//! let ctx = runtime
//!     .create_context(ContextConfig::with_model("sd-v1-5.safetensors"), None, None)
//!     .await?;
//! let images = ctx.txt2img(Txt2ImgParams::new("a lighthouse at dusk"))?.await?;
//! assert_eq!(images.len(), 1);
//! ctx.dispose()?.await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod ffi;
pub mod image;
pub mod lifecycle;
pub mod params;
pub mod queue;
pub mod router;
pub mod runtime;

pub use config::{ContextConfig, RuntimeConfig, UpscalerConfig};
pub use context::{Context, Upscaler};
pub use engine::{Engine, HandleKind, NativeEngine, NativeHandle, RawHandle};
pub use error::{Error, Result};
pub use image::Image;
pub use lifecycle::LifecycleState;
pub use params::{
    GenerationRequest, Img2ImgParams, Img2VidParams, SampleMethod, Schedule, Txt2ImgParams,
    WeightType,
};
pub use queue::{JobTicket, QueueStats};
pub use router::{LogLevel, LogListener, ProgressEvent, ProgressListener};
pub use runtime::Runtime;

use tracing::info;
use tracing_subscriber::EnvFilter;

/// Install the `tracing` subscriber (`RUST_LOG`, default `info`).
pub fn init() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install tracing subscriber: {}", e))?;

    info!("Initializing Diffuse v{}", env!("CARGO_PKG_VERSION"));
    Ok(())
}
