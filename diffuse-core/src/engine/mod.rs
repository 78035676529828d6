//! Engine seam - the compute library as the binding core sees it
//!
//! The core never calls the native library directly. Everything goes through
//! the [`Engine`] trait, which [`NativeEngine`] implements against the
//! dynamically loaded C ABI and which tests implement in-process.
//!
//! # Threading contract
//! - Every method may block for the full length of a compute call.
//! - Generation methods emit log/progress events synchronously on the calling
//!   thread by invoking [`crate::router::dispatch_log`] and
//!   [`crate::router::dispatch_progress`] (directly, or through the hooks
//!   installed by [`Engine::install_hooks`]).
//! - The core guarantees a handle is never used from two threads at once and
//!   is passed to [`Engine::release`] exactly once.

pub mod handle;
pub mod native;

use std::num::NonZeroUsize;
use std::os::raw::c_void;
use std::ptr::NonNull;

use crate::config::{ContextConfig, UpscalerConfig};
use crate::error::{Error, Result};
use crate::image::Image;
use crate::params::{Img2ImgParams, Img2VidParams, Txt2ImgParams, WeightType};

pub use handle::{HandleSlot, NativeHandle};
pub use native::NativeEngine;

/// Which construction entry point produced a handle, and so which release
/// entry point frees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleKind {
    Diffusion,
    Upscaler,
}

/// Opaque, non-null engine resource pointer
///
/// The engine owns what it points at. The core only moves it between
/// threads; [`NativeHandle`] guarantees it is never used concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(NonNull<c_void>);

// The pointer is only dereferenced by the engine, and only from the single
// job that currently owns the context's queue slot.
unsafe impl Send for RawHandle {}
unsafe impl Sync for RawHandle {}

impl RawHandle {
    /// Wrap a pointer returned by a construction call; `None` for null.
    pub fn from_ptr(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// Build a handle from an integer token, for engines that track their
    /// resources by id rather than by pointer.
    pub fn from_token(token: NonZeroUsize) -> Self {
        Self(NonNull::new(token.get() as *mut c_void).expect("non-zero token"))
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }

    pub fn token(self) -> usize {
        self.0.as_ptr() as usize
    }
}

/// The compute library consumed by the binding core
///
/// Only construction, release, text-to-image and system info are required;
/// the remaining operations fail with [`Error::EngineFailure`] unless the
/// engine overrides them.
pub trait Engine: Send + Sync + 'static {
    /// Short identifier used in logs
    fn name(&self) -> &str;

    /// Create a diffusion handle; `Err(Error::Construction)` on failure.
    fn construct(&self, config: &ContextConfig) -> Result<RawHandle>;

    /// Create an upscaler handle; `Err(Error::Construction)` on failure.
    fn construct_upscaler(&self, _config: &UpscalerConfig) -> Result<RawHandle> {
        Err(Error::Construction(format!(
            "upscaling not supported by engine '{}'",
            self.name()
        )))
    }

    /// Free a handle. Called exactly once per successful construction.
    fn release(&self, kind: HandleKind, handle: RawHandle);

    fn txt2img(&self, handle: RawHandle, params: &Txt2ImgParams) -> Result<Vec<Image>>;

    fn img2img(&self, _handle: RawHandle, _params: &Img2ImgParams) -> Result<Vec<Image>> {
        Err(unsupported(self.name(), "img2img"))
    }

    fn img2vid(&self, _handle: RawHandle, _params: &Img2VidParams) -> Result<Vec<Image>> {
        Err(unsupported(self.name(), "img2vid"))
    }

    fn upscale(&self, _handle: RawHandle, _image: &Image, _factor: u32) -> Result<Image> {
        Err(unsupported(self.name(), "upscale"))
    }

    /// Register the process-wide log and progress hooks.
    ///
    /// The runtime calls this once before the first construction. Engines
    /// that call the router directly can leave it empty.
    fn install_hooks(&self) {}

    fn system_info(&self) -> String;

    fn physical_cores(&self) -> i32 {
        std::thread::available_parallelism()
            .map(|n| n.get() as i32)
            .unwrap_or(1)
    }

    fn weight_type_name(&self, ty: WeightType) -> String {
        ty.name().to_string()
    }
}

fn unsupported(engine: &str, op: &str) -> Error {
    Error::engine(format!("{} not supported by engine '{}'", op, engine))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Minimal;

    impl Engine for Minimal {
        fn name(&self) -> &str {
            "minimal"
        }

        fn construct(&self, _config: &ContextConfig) -> Result<RawHandle> {
            Ok(RawHandle::from_token(NonZeroUsize::new(1).unwrap()))
        }

        fn release(&self, _kind: HandleKind, _handle: RawHandle) {}

        fn txt2img(&self, _handle: RawHandle, _params: &Txt2ImgParams) -> Result<Vec<Image>> {
            Ok(Vec::new())
        }

        fn system_info(&self) -> String {
            "minimal".to_string()
        }
    }

    #[test]
    fn test_raw_handle_roundtrip() {
        assert!(RawHandle::from_ptr(std::ptr::null_mut()).is_none());
        let handle = RawHandle::from_token(NonZeroUsize::new(0x40).unwrap());
        assert_eq!(handle.token(), 0x40);
        assert_eq!(RawHandle::from_ptr(handle.as_ptr()), Some(handle));
    }

    #[test]
    fn test_raw_handle_token_is_preserved() {
        for token in [1, 8, 0x1000, usize::MAX] {
            let handle = RawHandle::from_token(NonZeroUsize::new(token).unwrap());
            assert_eq!(handle.token(), token);
        }
    }

    #[test]
    fn test_optional_operations_default_to_failure() {
        let engine = Minimal;
        let handle = engine.construct(&ContextConfig::default()).unwrap();
        let image = Image::filled(8, 8, 3, 0).unwrap();

        assert!(matches!(
            engine.img2img(handle, &Img2ImgParams::new(image.clone(), "x")),
            Err(Error::EngineFailure(_))
        ));
        assert!(matches!(
            engine.upscale(handle, &image, 2),
            Err(Error::EngineFailure(_))
        ));
        assert!(matches!(
            engine.construct_upscaler(&UpscalerConfig::new("e.pth")),
            Err(Error::Construction(_))
        ));
        assert_eq!(engine.weight_type_name(WeightType::Q8_0), "q8_0");
        assert!(engine.physical_cores() >= 1);
    }
}
