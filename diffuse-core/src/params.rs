//! Generation parameters and engine enum tables
//!
//! Every parameter struct validates itself before it is submitted, so an
//! out-of-range value is reported from the submitting call and never reaches
//! a queue or the engine.

use std::ffi::CString;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::image::Image;

/// Sampler used by the diffusion loop (`sample_method_t`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
#[repr(u32)]
pub enum SampleMethod {
    #[default]
    EulerA = 0,
    Euler = 1,
    Heun = 2,
    Dpm2 = 3,
    Dpmpp2SA = 4,
    Dpmpp2M = 5,
    Dpmpp2Mv2 = 6,
    Lcm = 7,
    Ipndm = 8,
    IpndmV = 9,
}

impl TryFrom<u32> for SampleMethod {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        use SampleMethod::*;
        Ok(match value {
            0 => EulerA,
            1 => Euler,
            2 => Heun,
            3 => Dpm2,
            4 => Dpmpp2SA,
            5 => Dpmpp2M,
            6 => Dpmpp2Mv2,
            7 => Lcm,
            8 => Ipndm,
            9 => IpndmV,
            _ => return Err(Error::invalid(format!("Invalid sampleMethod {}", value))),
        })
    }
}

impl From<SampleMethod> for u32 {
    fn from(value: SampleMethod) -> Self {
        value as u32
    }
}

/// Noise schedule (`schedule_t`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
#[repr(u32)]
pub enum Schedule {
    #[default]
    Default = 0,
    Discrete = 1,
    Karras = 2,
    Ays = 3,
    Gits = 4,
}

impl TryFrom<u32> for Schedule {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            0 => Schedule::Default,
            1 => Schedule::Discrete,
            2 => Schedule::Karras,
            3 => Schedule::Ays,
            4 => Schedule::Gits,
            _ => return Err(Error::invalid("Invalid schedule")),
        })
    }
}

impl From<Schedule> for u32 {
    fn from(value: Schedule) -> Self {
        value as u32
    }
}

/// Tensor weight type (`sd_type_t`, ggml numbering)
///
/// Slots 4 and 5 were removed from ggml and are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
#[repr(u32)]
#[allow(non_camel_case_types)]
pub enum WeightType {
    #[default]
    F32 = 0,
    F16 = 1,
    Q4_0 = 2,
    Q4_1 = 3,
    Q5_0 = 6,
    Q5_1 = 7,
    Q8_0 = 8,
    Q8_1 = 9,
    Q2K = 10,
    Q3K = 11,
    Q4K = 12,
    Q5K = 13,
    Q6K = 14,
    Q8K = 15,
    Iq2Xxs = 16,
    Iq2Xs = 17,
    Iq3Xxs = 18,
    Iq1S = 19,
    Iq4Nl = 20,
    Iq3S = 21,
    Iq2S = 22,
    Iq4Xs = 23,
    I8 = 24,
    I16 = 25,
    I32 = 26,
    I64 = 27,
    F64 = 28,
    Iq1M = 29,
    Bf16 = 30,
    Q4_0_4x4 = 31,
    Q4_0_4x8 = 32,
    Q4_0_8x8 = 33,
}

/// One past the last valid `sd_type_t` value.
pub const WEIGHT_TYPE_COUNT: u32 = 34;

const WEIGHT_TYPES: [(WeightType, &str); 32] = [
    (WeightType::F32, "f32"),
    (WeightType::F16, "f16"),
    (WeightType::Q4_0, "q4_0"),
    (WeightType::Q4_1, "q4_1"),
    (WeightType::Q5_0, "q5_0"),
    (WeightType::Q5_1, "q5_1"),
    (WeightType::Q8_0, "q8_0"),
    (WeightType::Q8_1, "q8_1"),
    (WeightType::Q2K, "q2_K"),
    (WeightType::Q3K, "q3_K"),
    (WeightType::Q4K, "q4_K"),
    (WeightType::Q5K, "q5_K"),
    (WeightType::Q6K, "q6_K"),
    (WeightType::Q8K, "q8_K"),
    (WeightType::Iq2Xxs, "iq2_xxs"),
    (WeightType::Iq2Xs, "iq2_xs"),
    (WeightType::Iq3Xxs, "iq3_xxs"),
    (WeightType::Iq1S, "iq1_s"),
    (WeightType::Iq4Nl, "iq4_nl"),
    (WeightType::Iq3S, "iq3_s"),
    (WeightType::Iq2S, "iq2_s"),
    (WeightType::Iq4Xs, "iq4_xs"),
    (WeightType::I8, "i8"),
    (WeightType::I16, "i16"),
    (WeightType::I32, "i32"),
    (WeightType::I64, "i64"),
    (WeightType::F64, "f64"),
    (WeightType::Iq1M, "iq1_m"),
    (WeightType::Bf16, "bf16"),
    (WeightType::Q4_0_4x4, "q4_0_4x4"),
    (WeightType::Q4_0_4x8, "q4_0_4x8"),
    (WeightType::Q4_0_8x8, "q4_0_8x8"),
];

impl WeightType {
    /// ggml's short name for the type, used when no engine is loaded.
    pub fn name(self) -> &'static str {
        WEIGHT_TYPES
            .iter()
            .find(|(ty, _)| *ty == self)
            .map(|(_, name)| *name)
            .unwrap_or("unknown")
    }
}

impl TryFrom<u32> for WeightType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        WEIGHT_TYPES
            .iter()
            .map(|(ty, _)| *ty)
            .find(|ty| *ty as u32 == value)
            .ok_or_else(|| Error::invalid("Invalid weightType"))
    }
}

impl From<WeightType> for u32 {
    fn from(value: WeightType) -> Self {
        value as u32
    }
}

/// Text-to-image request
#[derive(Debug, Clone, PartialEq)]
pub struct Txt2ImgParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub clip_skip: i32,
    pub cfg_scale: f32,
    pub guidance: f32,
    pub width: u32,
    pub height: u32,
    pub sample_method: SampleMethod,
    pub sample_steps: u32,
    pub seed: i64,
    pub batch_count: u32,
    pub control_cond: Option<Image>,
    pub control_strength: f32,
    pub style_ratio: f32,
    pub normalize_input: bool,
    pub input_id_images_path: String,
}

impl Default for Txt2ImgParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            clip_skip: -1,
            cfg_scale: 7.0,
            guidance: 3.5,
            width: 512,
            height: 512,
            sample_method: SampleMethod::EulerA,
            sample_steps: 20,
            seed: 42,
            batch_count: 1,
            control_cond: None,
            control_strength: 0.9,
            style_ratio: 20.0,
            normalize_input: false,
            input_id_images_path: String::new(),
        }
    }
}

impl Txt2ImgParams {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        check_text("prompt", &self.prompt)?;
        check_text("negativePrompt", &self.negative_prompt)?;
        check_text("inputIdImagesPath", &self.input_id_images_path)?;
        check_dimensions(self.width, self.height)?;
        check_positive("sampleSteps", self.sample_steps)?;
        check_positive("batchCount", self.batch_count)?;
        if let Some(cond) = &self.control_cond {
            cond.validate()?;
        }
        Ok(())
    }
}

/// Image-to-image request
#[derive(Debug, Clone, PartialEq)]
pub struct Img2ImgParams {
    pub init_image: Image,
    pub prompt: String,
    pub negative_prompt: String,
    pub clip_skip: i32,
    pub cfg_scale: f32,
    pub guidance: f32,
    pub width: u32,
    pub height: u32,
    pub sample_method: SampleMethod,
    pub sample_steps: u32,
    pub strength: f32,
    pub seed: i64,
    pub batch_count: u32,
    pub control_cond: Option<Image>,
    pub control_strength: f32,
    pub style_ratio: f32,
    pub normalize_input: bool,
    pub input_id_images_path: String,
}

impl Img2ImgParams {
    /// Defaults match [`Txt2ImgParams`], with the output sized to the input.
    pub fn new(init_image: Image, prompt: impl Into<String>) -> Self {
        let base = Txt2ImgParams::default();
        Self {
            width: init_image.width,
            height: init_image.height,
            init_image,
            prompt: prompt.into(),
            negative_prompt: base.negative_prompt,
            clip_skip: base.clip_skip,
            cfg_scale: base.cfg_scale,
            guidance: base.guidance,
            sample_method: base.sample_method,
            sample_steps: base.sample_steps,
            strength: 0.75,
            seed: base.seed,
            batch_count: base.batch_count,
            control_cond: None,
            control_strength: base.control_strength,
            style_ratio: base.style_ratio,
            normalize_input: base.normalize_input,
            input_id_images_path: base.input_id_images_path,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.init_image.validate()?;
        check_text("prompt", &self.prompt)?;
        check_text("negativePrompt", &self.negative_prompt)?;
        check_text("inputIdImagesPath", &self.input_id_images_path)?;
        check_dimensions(self.width, self.height)?;
        check_positive("sampleSteps", self.sample_steps)?;
        check_positive("batchCount", self.batch_count)?;
        check_unit("strength", self.strength)?;
        if let Some(cond) = &self.control_cond {
            cond.validate()?;
        }
        Ok(())
    }
}

/// Image-to-video request; yields `video_frames` images
#[derive(Debug, Clone, PartialEq)]
pub struct Img2VidParams {
    pub init_image: Image,
    pub width: u32,
    pub height: u32,
    pub video_frames: u32,
    pub motion_bucket_id: u32,
    pub fps: u32,
    pub augmentation_level: f32,
    pub min_cfg: f32,
    pub cfg_scale: f32,
    pub sample_method: SampleMethod,
    pub sample_steps: u32,
    pub strength: f32,
    pub seed: i64,
}

impl Img2VidParams {
    pub fn new(init_image: Image) -> Self {
        Self {
            width: init_image.width,
            height: init_image.height,
            init_image,
            video_frames: 6,
            motion_bucket_id: 127,
            fps: 6,
            augmentation_level: 0.0,
            min_cfg: 1.0,
            cfg_scale: 7.0,
            sample_method: SampleMethod::EulerA,
            sample_steps: 20,
            strength: 0.75,
            seed: 42,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.init_image.validate()?;
        check_dimensions(self.width, self.height)?;
        check_positive("videoFrames", self.video_frames)?;
        check_positive("fps", self.fps)?;
        check_positive("sampleSteps", self.sample_steps)?;
        check_unit("strength", self.strength)?;
        Ok(())
    }
}

/// The generation kinds a [`Context`](crate::Context) accepts
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationRequest {
    TextToImage(Txt2ImgParams),
    ImageToImage(Img2ImgParams),
    ImageToVideo(Img2VidParams),
}

impl GenerationRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            GenerationRequest::TextToImage(_) => "txt2img",
            GenerationRequest::ImageToImage(_) => "img2img",
            GenerationRequest::ImageToVideo(_) => "img2vid",
        }
    }

    /// Number of images a successful run yields.
    pub fn expected_images(&self) -> usize {
        match self {
            GenerationRequest::TextToImage(p) => p.batch_count as usize,
            GenerationRequest::ImageToImage(p) => p.batch_count as usize,
            GenerationRequest::ImageToVideo(p) => p.video_frames as usize,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            GenerationRequest::TextToImage(p) => p.validate(),
            GenerationRequest::ImageToImage(p) => p.validate(),
            GenerationRequest::ImageToVideo(p) => p.validate(),
        }
    }
}

/// Strings handed to the engine must be representable as C strings.
pub(crate) fn check_text(field: &str, value: &str) -> Result<()> {
    if value.as_bytes().contains(&0) {
        return Err(Error::invalid(format!("{} contains a NUL byte", field)));
    }
    Ok(())
}

pub(crate) fn c_string(field: &str, value: &str) -> Result<CString> {
    CString::new(value).map_err(|_| Error::invalid(format!("{} contains a NUL byte", field)))
}

fn check_dimensions(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 || width % 8 != 0 || height % 8 != 0 {
        return Err(Error::invalid(format!(
            "width and height must be non-zero multiples of 8, got {}x{}",
            width, height
        )));
    }
    if width > i32::MAX as u32 || height > i32::MAX as u32 {
        return Err(Error::invalid("width/height out of range"));
    }
    Ok(())
}

fn check_positive(field: &str, value: u32) -> Result<()> {
    if value == 0 || value > i32::MAX as u32 {
        return Err(Error::invalid(format!("{} must be at least 1, got {}", field, value)));
    }
    Ok(())
}

fn check_unit(field: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(Error::invalid(format!("{} must be within 0..=1, got {}", field, value)));
    }
    Ok(())
}
