//! Configuration for the runtime, diffusion contexts and upscalers
//!
//! Context and upscaler configs deserialize from the same camelCase JSON
//! shape the host passes to `createContext` / `createUpscaler`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::params::{check_text, Schedule, WeightType};

/// Environment variable naming the engine shared library.
pub const ENGINE_LIB_ENV: &str = "DIFFUSE_ENGINE_LIB";

/// Base name of the engine library (`libstable-diffusion.so` etc.)
pub const ENGINE_LIB_NAME: &str = "stable-diffusion";

/// Where and how to find the engine library
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Explicit path to the shared library; wins over everything else
    pub library_path: Option<PathBuf>,
    /// Directories probed for the platform-specific library file name
    pub search_paths: Vec<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            library_path: std::env::var_os(ENGINE_LIB_ENV).map(PathBuf::from),
            search_paths: vec![
                PathBuf::from("./lib"),
                PathBuf::from("/usr/local/lib"),
                PathBuf::from("/usr/lib"),
            ],
        }
    }
}

impl RuntimeConfig {
    /// Candidate library files in probe order.
    pub fn candidates(&self) -> Vec<PathBuf> {
        let file_name = libloading::library_filename(ENGINE_LIB_NAME);
        let mut out = Vec::with_capacity(self.search_paths.len() + 2);
        if let Some(path) = &self.library_path {
            out.push(path.clone());
        }
        out.extend(self.search_paths.iter().map(|dir| dir.join(&file_name)));
        // Bare file name defers to the platform loader's own search rules.
        out.push(PathBuf::from(file_name));
        out
    }
}

/// Parameters for constructing a diffusion context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContextConfig {
    pub model: Option<PathBuf>,
    pub clip_l: Option<PathBuf>,
    pub clip_g: Option<PathBuf>,
    pub t5xxl: Option<PathBuf>,
    pub diffusion_model: Option<PathBuf>,
    pub vae: Option<PathBuf>,
    pub taesd: Option<PathBuf>,
    pub control_net: Option<PathBuf>,
    pub lora_dir: Option<PathBuf>,
    pub embed_dir: Option<PathBuf>,
    pub stacked_id_embed_dir: Option<PathBuf>,
    pub vae_decode_only: bool,
    pub vae_tiling: bool,
    pub free_params_immediately: bool,
    /// `-1` lets the engine use every physical core
    pub num_threads: i32,
    pub weight_type: WeightType,
    pub cuda_rng: bool,
    pub schedule: Schedule,
    pub keep_clip_on_cpu: bool,
    pub keep_control_net_on_cpu: bool,
    pub keep_vae_on_cpu: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            model: None,
            clip_l: None,
            clip_g: None,
            t5xxl: None,
            diffusion_model: None,
            vae: None,
            taesd: None,
            control_net: None,
            lora_dir: None,
            embed_dir: None,
            stacked_id_embed_dir: None,
            vae_decode_only: false,
            vae_tiling: false,
            free_params_immediately: false,
            num_threads: -1,
            weight_type: WeightType::F32,
            cuda_rng: false,
            schedule: Schedule::Default,
            keep_clip_on_cpu: false,
            keep_control_net_on_cpu: false,
            keep_vae_on_cpu: false,
        }
    }
}

impl ContextConfig {
    pub fn with_model(model: impl Into<PathBuf>) -> Self {
        Self {
            model: Some(model.into()),
            ..Self::default()
        }
    }

    /// Load a config from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::invalid(format!("failed to read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::invalid(format!("failed to parse {}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Every path field paired with its host-facing name.
    pub fn paths(&self) -> [(&'static str, Option<&Path>); 11] {
        [
            ("model", self.model.as_deref()),
            ("clipL", self.clip_l.as_deref()),
            ("clipG", self.clip_g.as_deref()),
            ("t5xxl", self.t5xxl.as_deref()),
            ("diffusionModel", self.diffusion_model.as_deref()),
            ("vae", self.vae.as_deref()),
            ("taesd", self.taesd.as_deref()),
            ("controlNet", self.control_net.as_deref()),
            ("loraDir", self.lora_dir.as_deref()),
            ("embedDir", self.embed_dir.as_deref()),
            ("stackedIdEmbedDir", self.stacked_id_embed_dir.as_deref()),
        ]
    }

    pub fn validate(&self) -> Result<()> {
        if self.model.is_none() && self.diffusion_model.is_none() {
            return Err(Error::invalid("either model or diffusionModel is required"));
        }
        for (field, path) in self.paths() {
            if let Some(path) = path {
                check_path(field, path)?;
            }
        }
        if self.num_threads == 0 || self.num_threads < -1 {
            return Err(Error::invalid(format!(
                "numThreads must be positive or -1, got {}",
                self.num_threads
            )));
        }
        Ok(())
    }
}

/// Parameters for constructing an ESRGAN upscaler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UpscalerConfig {
    pub esrgan_path: PathBuf,
    pub num_threads: i32,
    pub weight_type: WeightType,
}

impl Default for UpscalerConfig {
    fn default() -> Self {
        Self {
            esrgan_path: PathBuf::new(),
            num_threads: -1,
            weight_type: WeightType::F32,
        }
    }
}

impl UpscalerConfig {
    pub fn new(esrgan_path: impl Into<PathBuf>) -> Self {
        Self {
            esrgan_path: esrgan_path.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.esrgan_path.as_os_str().is_empty() {
            return Err(Error::invalid("esrganPath is required"));
        }
        check_path("esrganPath", &self.esrgan_path)?;
        if self.num_threads == 0 || self.num_threads < -1 {
            return Err(Error::invalid(format!(
                "numThreads must be positive or -1, got {}",
                self.num_threads
            )));
        }
        Ok(())
    }
}

fn check_path(field: &str, path: &Path) -> Result<()> {
    let text = path
        .to_str()
        .ok_or_else(|| Error::invalid(format!("{} is not valid UTF-8", field)))?;
    check_text(field, text)
}
