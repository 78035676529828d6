//! FFI Bridge - C ABI of the stable-diffusion engine library
//!
//! The engine is loaded at runtime with `libloading`, so the crate builds and
//! tests without the native library present. Symbols are resolved once into
//! an [`EngineLibrary`] table; the `Library` is kept alive alongside the
//! copied function pointers.
//!
//! # Memory ownership
//! - Input images are passed as [`SdImage`] views into Rust-owned buffers and
//!   are only read for the duration of the call.
//! - Output arrays and their pixel data are `malloc`ed by the engine and must
//!   be released with `free`; [`take_images`] copies them out and frees them.

use std::ffi::{CStr, OsStr};
use std::os::raw::{c_char, c_float, c_int, c_void};

use libloading::{Library, Symbol};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::image::{byte_len, Image};

/// `sd_log_level_t`
pub const SD_LOG_DEBUG: c_int = 0;
pub const SD_LOG_INFO: c_int = 1;
pub const SD_LOG_WARN: c_int = 2;
pub const SD_LOG_ERROR: c_int = 3;

/// `rng_type_t`
pub const STD_DEFAULT_RNG: c_int = 0;
pub const CUDA_RNG: c_int = 1;

/// `sd_image_t`
///
/// Field layout matches the C struct exactly; `data` points at
/// `width * height * channel` bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SdImage {
    pub width: u32,
    pub height: u32,
    pub channel: u32,
    pub data: *mut u8,
}

impl SdImage {
    /// Borrow a Rust image as an engine input. The view must not outlive
    /// `image`; the engine only reads through `data`.
    pub fn borrowed(image: &Image) -> Self {
        Self {
            width: image.width,
            height: image.height,
            channel: image.channels,
            data: image.data.as_ptr() as *mut u8,
        }
    }
}

pub type LogCallback = unsafe extern "C" fn(level: c_int, text: *const c_char, data: *mut c_void);
pub type ProgressCallback =
    unsafe extern "C" fn(step: c_int, steps: c_int, time: c_float, data: *mut c_void);

pub type NewSdCtxFn = unsafe extern "C" fn(
    model_path: *const c_char,
    clip_l_path: *const c_char,
    clip_g_path: *const c_char,
    t5xxl_path: *const c_char,
    diffusion_model_path: *const c_char,
    vae_path: *const c_char,
    taesd_path: *const c_char,
    control_net_path: *const c_char,
    lora_model_dir: *const c_char,
    embed_dir: *const c_char,
    stacked_id_embed_dir: *const c_char,
    vae_decode_only: bool,
    vae_tiling: bool,
    free_params_immediately: bool,
    n_threads: c_int,
    wtype: c_int,
    rng_type: c_int,
    schedule: c_int,
    keep_clip_on_cpu: bool,
    keep_control_net_cpu: bool,
    keep_vae_on_cpu: bool,
) -> *mut c_void;

pub type FreeCtxFn = unsafe extern "C" fn(ctx: *mut c_void);

pub type Txt2ImgFn = unsafe extern "C" fn(
    ctx: *mut c_void,
    prompt: *const c_char,
    negative_prompt: *const c_char,
    clip_skip: c_int,
    cfg_scale: c_float,
    guidance: c_float,
    width: c_int,
    height: c_int,
    sample_method: c_int,
    sample_steps: c_int,
    seed: i64,
    batch_count: c_int,
    control_cond: *const SdImage,
    control_strength: c_float,
    style_strength: c_float,
    normalize_input: bool,
    input_id_images_path: *const c_char,
) -> *mut SdImage;

pub type Img2ImgFn = unsafe extern "C" fn(
    ctx: *mut c_void,
    init_image: SdImage,
    prompt: *const c_char,
    negative_prompt: *const c_char,
    clip_skip: c_int,
    cfg_scale: c_float,
    guidance: c_float,
    width: c_int,
    height: c_int,
    sample_method: c_int,
    sample_steps: c_int,
    strength: c_float,
    seed: i64,
    batch_count: c_int,
    control_cond: *const SdImage,
    control_strength: c_float,
    style_strength: c_float,
    normalize_input: bool,
    input_id_images_path: *const c_char,
) -> *mut SdImage;

pub type Img2VidFn = unsafe extern "C" fn(
    ctx: *mut c_void,
    init_image: SdImage,
    width: c_int,
    height: c_int,
    video_frames: c_int,
    motion_bucket_id: c_int,
    fps: c_int,
    augmentation_level: c_float,
    min_cfg: c_float,
    cfg_scale: c_float,
    sample_method: c_int,
    sample_steps: c_int,
    strength: c_float,
    seed: i64,
) -> *mut SdImage;

pub type NewUpscalerFn =
    unsafe extern "C" fn(esrgan_path: *const c_char, n_threads: c_int, wtype: c_int) -> *mut c_void;

pub type UpscaleFn =
    unsafe extern "C" fn(ctx: *mut c_void, input_image: SdImage, upscale_factor: u32) -> SdImage;

pub type SetLogCallbackFn = unsafe extern "C" fn(cb: Option<LogCallback>, data: *mut c_void);
pub type SetProgressCallbackFn =
    unsafe extern "C" fn(cb: Option<ProgressCallback>, data: *mut c_void);
pub type NumPhysicalCoresFn = unsafe extern "C" fn() -> i32;
pub type SystemInfoFn = unsafe extern "C" fn() -> *const c_char;
pub type TypeNameFn = unsafe extern "C" fn(ty: c_int) -> *const c_char;

/// Resolved engine entry points
///
/// The function pointers stay valid for as long as `_lib` is loaded, which
/// is the lifetime of this struct.
pub struct EngineLibrary {
    pub new_sd_ctx: NewSdCtxFn,
    pub free_sd_ctx: FreeCtxFn,
    pub txt2img: Txt2ImgFn,
    pub img2img: Img2ImgFn,
    pub img2vid: Img2VidFn,
    pub new_upscaler_ctx: NewUpscalerFn,
    pub free_upscaler_ctx: FreeCtxFn,
    pub upscale: UpscaleFn,
    pub sd_set_log_callback: SetLogCallbackFn,
    pub sd_set_progress_callback: SetProgressCallbackFn,
    pub get_num_physical_cores: NumPhysicalCoresFn,
    pub sd_get_system_info: SystemInfoFn,
    pub sd_type_name: TypeNameFn,
    _lib: Library,
}

impl EngineLibrary {
    /// Load the engine library and resolve every entry point.
    pub fn open(path: impl AsRef<OsStr>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading engine library from {:?}", path);

        // Loading runs the library's initializers; the engine has none with
        // preconditions on our side.
        let lib = unsafe { Library::new(path) }
            .map_err(|e| Error::Library(format!("failed to load {:?}: {}", path, e)))?;

        unsafe {
            let table = Self {
                new_sd_ctx: symbol(&lib, b"new_sd_ctx\0")?,
                free_sd_ctx: symbol(&lib, b"free_sd_ctx\0")?,
                txt2img: symbol(&lib, b"txt2img\0")?,
                img2img: symbol(&lib, b"img2img\0")?,
                img2vid: symbol(&lib, b"img2vid\0")?,
                new_upscaler_ctx: symbol(&lib, b"new_upscaler_ctx\0")?,
                free_upscaler_ctx: symbol(&lib, b"free_upscaler_ctx\0")?,
                upscale: symbol(&lib, b"upscale\0")?,
                sd_set_log_callback: symbol(&lib, b"sd_set_log_callback\0")?,
                sd_set_progress_callback: symbol(&lib, b"sd_set_progress_callback\0")?,
                get_num_physical_cores: symbol(&lib, b"get_num_physical_cores\0")?,
                sd_get_system_info: symbol(&lib, b"sd_get_system_info\0")?,
                sd_type_name: symbol(&lib, b"sd_type_name\0")?,
                _lib: lib,
            };
            debug!("Engine library symbols resolved");
            Ok(table)
        }
    }
}

/// Resolve one symbol and copy the function pointer out of the `Symbol`.
///
/// # Safety
/// `T` must match the C signature of the exported symbol.
unsafe fn symbol<T: Copy>(lib: &Library, name: &[u8]) -> Result<T> {
    let sym: Symbol<T> = lib.get(name).map_err(|e| {
        let printable = String::from_utf8_lossy(&name[..name.len().saturating_sub(1)]);
        Error::Library(format!("engine library missing '{}': {}", printable, e))
    })?;
    Ok(*sym)
}

/// Copy a borrowed C string, tolerating null.
///
/// # Safety
/// `ptr` must be null or point at a NUL-terminated string.
pub unsafe fn string_from_ptr(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

/// Copy one engine-owned image out and free its pixel buffer.
///
/// # Safety
/// `raw.data` must be null or a `malloc`ed buffer of at least
/// `width * height * channel` bytes that nothing else will free.
pub unsafe fn take_image(raw: SdImage) -> Result<Image> {
    if raw.data.is_null() {
        return Err(Error::engine("engine returned an image without data"));
    }
    let copied = byte_len(raw.width, raw.height, raw.channel).map(|len| {
        std::slice::from_raw_parts(raw.data, len).to_vec()
    });
    libc::free(raw.data as *mut c_void);
    Image::new(raw.width, raw.height, raw.channel, copied?)
        .map_err(|e| Error::engine(format!("engine returned a malformed image: {}", e)))
}

/// Copy `count` engine-owned images out, then free the images and the array.
///
/// Every buffer is freed even when one of them is malformed.
///
/// # Safety
/// `array` must be null or a `malloc`ed array of `count` [`SdImage`]s, each
/// satisfying the contract of [`take_image`].
pub unsafe fn take_images(array: *mut SdImage, count: usize) -> Result<Vec<Image>> {
    if array.is_null() {
        return Err(Error::engine("engine returned no images"));
    }
    let mut images = Vec::with_capacity(count);
    let mut first_error = None;
    for i in 0..count {
        match take_image(*array.add(i)) {
            Ok(image) => images.push(image),
            Err(e) => {
                first_error.get_or_insert(e);
            }
        }
    }
    libc::free(array as *mut c_void);
    match first_error {
        Some(e) => Err(e),
        None => Ok(images),
    }
}
