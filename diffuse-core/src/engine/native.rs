//! Native engine - [`Engine`] over the dynamically loaded C library
//!
//! All pointers handed to the library are either C strings owned by the
//! calling frame or [`SdImage`] views over Rust-owned images; both outlive the
//! call. Everything the library returns is copied out and freed before the
//! method returns.

use std::ffi::CString;
use std::os::raw::{c_char, c_float, c_int, c_void};
use std::panic::catch_unwind;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Once;

use tracing::{debug, info, warn};

use crate::config::{ContextConfig, RuntimeConfig, UpscalerConfig};
use crate::engine::{Engine, HandleKind, RawHandle};
use crate::error::{Error, Result};
use crate::ffi::{self, EngineLibrary, SdImage};
use crate::image::Image;
use crate::params::{c_string, Img2ImgParams, Img2VidParams, Txt2ImgParams, WeightType};
use crate::router::{self, LogLevel};

/// The engine's log/progress hooks are process-wide; register them once.
static HOOKS: Once = Once::new();

pub struct NativeEngine {
    lib: EngineLibrary,
    path: PathBuf,
}

impl NativeEngine {
    /// Load the engine from an explicit library path.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let lib = EngineLibrary::open(&path)?;
        info!("Engine library loaded from {:?}", path);
        Ok(Self { lib, path })
    }

    /// Probe the configured candidates in order and load the first that
    /// resolves.
    pub fn load(config: &RuntimeConfig) -> Result<Self> {
        let mut last_error = None;
        for candidate in config.candidates() {
            match Self::open(&candidate) {
                Ok(engine) => return Ok(engine),
                Err(e) => {
                    debug!("Engine library candidate {:?} rejected: {}", candidate, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| Error::Library("no engine library candidates".into())))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn threads(&self, requested: i32) -> c_int {
        if requested > 0 {
            requested
        } else {
            unsafe { (self.lib.get_num_physical_cores)() }
        }
    }
}

fn path_arg(field: &str, path: Option<&Path>) -> Result<CString> {
    let text = match path {
        Some(path) => path
            .to_str()
            .ok_or_else(|| Error::invalid(format!("{} is not valid UTF-8", field)))?,
        None => "",
    };
    c_string(field, text)
}

fn control_arg(cond: &Option<Image>) -> Option<SdImage> {
    cond.as_ref().map(SdImage::borrowed)
}

fn control_ptr(view: &Option<SdImage>) -> *const SdImage {
    view.as_ref().map_or(ptr::null(), |v| v as *const SdImage)
}

impl Engine for NativeEngine {
    fn name(&self) -> &str {
        "stable-diffusion.cpp"
    }

    fn construct(&self, config: &ContextConfig) -> Result<RawHandle> {
        let paths = config
            .paths()
            .iter()
            .map(|(field, path)| path_arg(field, *path))
            .collect::<Result<Vec<CString>>>()?;
        let rng = if config.cuda_rng {
            ffi::CUDA_RNG
        } else {
            ffi::STD_DEFAULT_RNG
        };

        let ptr = unsafe {
            (self.lib.new_sd_ctx)(
                paths[0].as_ptr(),
                paths[1].as_ptr(),
                paths[2].as_ptr(),
                paths[3].as_ptr(),
                paths[4].as_ptr(),
                paths[5].as_ptr(),
                paths[6].as_ptr(),
                paths[7].as_ptr(),
                paths[8].as_ptr(),
                paths[9].as_ptr(),
                paths[10].as_ptr(),
                config.vae_decode_only,
                config.vae_tiling,
                config.free_params_immediately,
                self.threads(config.num_threads),
                u32::from(config.weight_type) as c_int,
                rng,
                u32::from(config.schedule) as c_int,
                config.keep_clip_on_cpu,
                config.keep_control_net_on_cpu,
                config.keep_vae_on_cpu,
            )
        };

        RawHandle::from_ptr(ptr).ok_or_else(|| Error::Construction("Context creation failed".into()))
    }

    fn construct_upscaler(&self, config: &UpscalerConfig) -> Result<RawHandle> {
        let path = path_arg("esrganPath", Some(&config.esrgan_path))?;
        let ptr = unsafe {
            (self.lib.new_upscaler_ctx)(
                path.as_ptr(),
                self.threads(config.num_threads),
                u32::from(config.weight_type) as c_int,
            )
        };
        RawHandle::from_ptr(ptr)
            .ok_or_else(|| Error::Construction("Upscaler creation failed".into()))
    }

    fn release(&self, kind: HandleKind, handle: RawHandle) {
        unsafe {
            match kind {
                HandleKind::Diffusion => (self.lib.free_sd_ctx)(handle.as_ptr()),
                HandleKind::Upscaler => (self.lib.free_upscaler_ctx)(handle.as_ptr()),
            }
        }
    }

    fn txt2img(&self, handle: RawHandle, params: &Txt2ImgParams) -> Result<Vec<Image>> {
        let prompt = c_string("prompt", &params.prompt)?;
        let negative = c_string("negativePrompt", &params.negative_prompt)?;
        let id_images = c_string("inputIdImagesPath", &params.input_id_images_path)?;
        let control = control_arg(&params.control_cond);

        unsafe {
            let images = (self.lib.txt2img)(
                handle.as_ptr(),
                prompt.as_ptr(),
                negative.as_ptr(),
                params.clip_skip,
                params.cfg_scale,
                params.guidance,
                params.width as c_int,
                params.height as c_int,
                u32::from(params.sample_method) as c_int,
                params.sample_steps as c_int,
                params.seed,
                params.batch_count as c_int,
                control_ptr(&control),
                params.control_strength,
                params.style_ratio,
                params.normalize_input,
                id_images.as_ptr(),
            );
            ffi::take_images(images, params.batch_count as usize)
        }
    }

    fn img2img(&self, handle: RawHandle, params: &Img2ImgParams) -> Result<Vec<Image>> {
        let prompt = c_string("prompt", &params.prompt)?;
        let negative = c_string("negativePrompt", &params.negative_prompt)?;
        let id_images = c_string("inputIdImagesPath", &params.input_id_images_path)?;
        let control = control_arg(&params.control_cond);

        unsafe {
            let images = (self.lib.img2img)(
                handle.as_ptr(),
                SdImage::borrowed(&params.init_image),
                prompt.as_ptr(),
                negative.as_ptr(),
                params.clip_skip,
                params.cfg_scale,
                params.guidance,
                params.width as c_int,
                params.height as c_int,
                u32::from(params.sample_method) as c_int,
                params.sample_steps as c_int,
                params.strength,
                params.seed,
                params.batch_count as c_int,
                control_ptr(&control),
                params.control_strength,
                params.style_ratio,
                params.normalize_input,
                id_images.as_ptr(),
            );
            ffi::take_images(images, params.batch_count as usize)
        }
    }

    fn img2vid(&self, handle: RawHandle, params: &Img2VidParams) -> Result<Vec<Image>> {
        unsafe {
            let frames = (self.lib.img2vid)(
                handle.as_ptr(),
                SdImage::borrowed(&params.init_image),
                params.width as c_int,
                params.height as c_int,
                params.video_frames as c_int,
                params.motion_bucket_id as c_int,
                params.fps as c_int,
                params.augmentation_level,
                params.min_cfg,
                params.cfg_scale,
                u32::from(params.sample_method) as c_int,
                params.sample_steps as c_int,
                params.strength,
                params.seed,
            );
            ffi::take_images(frames, params.video_frames as usize)
        }
    }

    fn upscale(&self, handle: RawHandle, image: &Image, factor: u32) -> Result<Image> {
        unsafe {
            let upscaled = (self.lib.upscale)(handle.as_ptr(), SdImage::borrowed(image), factor);
            ffi::take_image(upscaled)
        }
    }

    fn install_hooks(&self) {
        HOOKS.call_once(|| {
            unsafe {
                (self.lib.sd_set_log_callback)(Some(log_hook), ptr::null_mut());
                (self.lib.sd_set_progress_callback)(Some(progress_hook), ptr::null_mut());
            }
            debug!("Engine log and progress hooks installed");
        });
    }

    fn system_info(&self) -> String {
        unsafe { ffi::string_from_ptr((self.lib.sd_get_system_info)()) }
    }

    fn physical_cores(&self) -> i32 {
        unsafe { (self.lib.get_num_physical_cores)() }
    }

    fn weight_type_name(&self, ty: WeightType) -> String {
        unsafe { ffi::string_from_ptr((self.lib.sd_type_name)(u32::from(ty) as c_int)) }
    }
}

unsafe extern "C" fn log_hook(level: c_int, text: *const c_char, _data: *mut c_void) {
    // Unwinding into C is undefined behaviour.
    let result = catch_unwind(|| {
        let text = ffi::string_from_ptr(text);
        router::dispatch_log(LogLevel::from_raw(level), &text);
    });
    if result.is_err() {
        warn!("Panic while routing an engine log line");
    }
}

unsafe extern "C" fn progress_hook(step: c_int, steps: c_int, time: c_float, _data: *mut c_void) {
    if catch_unwind(|| router::dispatch_progress(step, steps, time)).is_err() {
        warn!("Panic while routing an engine progress tick");
    }
}
