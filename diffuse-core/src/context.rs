//! Public context handles
//!
//! [`Context`] and [`Upscaler`] are cheap to clone; clones share one session.
//! Parameters are validated before anything is queued, so a bad request
//! fails from the submitting call and never reaches the engine. Failures
//! that happen while a job runs arrive through its [`JobTicket`] only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::config::{ContextConfig, UpscalerConfig};
use crate::engine::{Engine, NativeHandle};
use crate::error::{Error, Result};
use crate::image::Image;
use crate::lifecycle::{LifecycleState, Session};
use crate::params::{GenerationRequest, Img2ImgParams, Img2VidParams, Txt2ImgParams};
use crate::queue::{JobTicket, QueueStats};
use crate::router::{LogListener, ProgressListener};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

fn session_label(prefix: &str) -> String {
    format!("{}-{}", prefix, NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
}

/// A diffusion model loaded into the engine
#[derive(Clone, Debug)]
pub struct Context {
    session: Arc<Session>,
}

impl Context {
    pub(crate) async fn create(
        engine: Arc<dyn Engine>,
        config: ContextConfig,
        log: Option<LogListener>,
        progress: Option<ProgressListener>,
    ) -> Result<Self> {
        config.validate()?;
        let session = Session::open(session_label("ctx"), engine, log, progress, move |engine| {
            NativeHandle::acquire(engine, &config)
        })
        .await?;
        Ok(Self { session })
    }

    /// Queue any generation request.
    pub fn generate(&self, request: GenerationRequest) -> Result<JobTicket<Vec<Image>>> {
        request.validate()?;
        let kind = request.kind();
        let expected = request.expected_images();
        debug!(context = %self.session.label(), kind, expected, "Generation queued");

        self.session.submit(
            move |handle| {
                let engine = handle.engine();
                match &request {
                    GenerationRequest::TextToImage(params) => engine.txt2img(handle.raw(), params),
                    GenerationRequest::ImageToImage(params) => engine.img2img(handle.raw(), params),
                    GenerationRequest::ImageToVideo(params) => engine.img2vid(handle.raw(), params),
                }
            },
            move |images| check_outputs(kind, expected, images),
        )
    }

    pub fn txt2img(&self, params: Txt2ImgParams) -> Result<JobTicket<Vec<Image>>> {
        self.generate(GenerationRequest::TextToImage(params))
    }

    pub fn img2img(&self, params: Img2ImgParams) -> Result<JobTicket<Vec<Image>>> {
        self.generate(GenerationRequest::ImageToImage(params))
    }

    /// Frames of the generated clip, in order.
    pub fn img2vid(&self, params: Img2VidParams) -> Result<JobTicket<Vec<Image>>> {
        self.generate(GenerationRequest::ImageToVideo(params))
    }

    /// Release the model once every job already queued has finished.
    ///
    /// New submissions fail with [`Error::Disposed`] as soon as this
    /// returns. A second call fails with [`Error::AlreadyDisposed`].
    pub fn dispose(&self) -> Result<JobTicket<()>> {
        self.session.dispose()
    }

    /// Replace (or with `None` remove) the log listener.
    pub fn set_log_listener(&self, listener: Option<LogListener>) -> Result<()> {
        self.session.set_log_listener(listener)
    }

    pub fn set_progress_listener(&self, listener: Option<ProgressListener>) -> Result<()> {
        self.session.set_progress_listener(listener)
    }

    pub fn state(&self) -> LifecycleState {
        self.session.state()
    }

    pub fn stats(&self) -> QueueStats {
        self.session.stats()
    }

    pub fn label(&self) -> &str {
        self.session.label()
    }

    pub fn engine_name(&self) -> &str {
        self.session.engine().name()
    }
}

fn check_outputs(kind: &str, expected: usize, images: Vec<Image>) -> Result<Vec<Image>> {
    if images.len() != expected {
        return Err(Error::engine(format!(
            "{} returned {} images, expected {}",
            kind,
            images.len(),
            expected
        )));
    }
    for image in &images {
        image
            .validate()
            .map_err(|e| Error::engine(format!("{} returned a malformed image: {}", kind, e)))?;
    }
    Ok(images)
}

/// An ESRGAN upscaling model loaded into the engine
#[derive(Clone, Debug)]
pub struct Upscaler {
    session: Arc<Session>,
}

impl Upscaler {
    pub(crate) async fn create(
        engine: Arc<dyn Engine>,
        config: UpscalerConfig,
        log: Option<LogListener>,
        progress: Option<ProgressListener>,
    ) -> Result<Self> {
        config.validate()?;
        let session = Session::open(session_label("upscaler"), engine, log, progress, move |engine| {
            NativeHandle::acquire_upscaler(engine, &config)
        })
        .await?;
        Ok(Self { session })
    }

    /// Queue an upscale of `image` by `factor` (at least 1).
    pub fn upscale(&self, image: Image, factor: u32) -> Result<JobTicket<Image>> {
        image.validate()?;
        if factor == 0 {
            return Err(Error::invalid("upscale factor must be at least 1"));
        }

        self.session.submit(
            move |handle| handle.engine().upscale(handle.raw(), &image, factor),
            |upscaled| {
                upscaled
                    .validate()
                    .map_err(|e| Error::engine(format!("upscale returned a malformed image: {}", e)))?;
                Ok(upscaled)
            },
        )
    }

    pub fn dispose(&self) -> Result<JobTicket<()>> {
        self.session.dispose()
    }

    pub fn set_log_listener(&self, listener: Option<LogListener>) -> Result<()> {
        self.session.set_log_listener(listener)
    }

    pub fn set_progress_listener(&self, listener: Option<ProgressListener>) -> Result<()> {
        self.session.set_progress_listener(listener)
    }

    pub fn state(&self) -> LifecycleState {
        self.session.state()
    }

    pub fn stats(&self) -> QueueStats {
        self.session.stats()
    }
}
