//! Scripted in-process engine shared by the integration tests.
//!
//! Behaves like the native engine as far as the binding core can tell:
//! construction checks the model file exists, generation emits log lines and
//! one progress tick per sampling step on the calling thread, and every
//! handle is tracked so double releases and concurrent use are detectable.

#![allow(dead_code)]

use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use diffuse_core::router::{dispatch_log, dispatch_progress};
use diffuse_core::{
    ContextConfig, Engine, Error, HandleKind, Image, Img2ImgParams, Img2VidParams, LogLevel,
    LogListener, ProgressEvent, ProgressListener, RawHandle, Result, Runtime, Txt2ImgParams,
    UpscalerConfig,
};
use tempfile::TempDir;

#[derive(Default)]
pub struct ScriptedEngine {
    next_handle: AtomicUsize,
    live: Mutex<HashSet<usize>>,
    pub constructed: AtomicUsize,
    pub released: AtomicUsize,
    /// Engine calls currently running, across all handles
    in_flight: AtomicUsize,
    /// Most engine calls ever running at once on a single handle
    pub max_overlap: AtomicUsize,
    busy_handles: Mutex<HashSet<usize>>,
    /// Prompts in the order the engine saw them
    pub prompts: Mutex<Vec<String>>,
    step_delay: Duration,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Engine whose sampling steps, and each release, take `delay`.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            step_delay: delay,
            ..Self::default()
        })
    }

    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn live_handles(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    fn new_handle(&self) -> RawHandle {
        let token = self.next_handle.fetch_add(1, Ordering::SeqCst) + 1;
        self.live.lock().unwrap().insert(token);
        self.constructed.fetch_add(1, Ordering::SeqCst);
        RawHandle::from_token(NonZeroUsize::new(token * 8).unwrap())
    }

    /// Mark `handle` busy for the duration of `body`; records overlap.
    fn exclusive<T>(&self, handle: RawHandle, body: impl FnOnce() -> T) -> T {
        let token = handle.token() / 8;
        assert!(
            self.live.lock().unwrap().contains(&token),
            "engine call on a released handle"
        );
        if !self.busy_handles.lock().unwrap().insert(token) {
            self.max_overlap.fetch_max(2, Ordering::SeqCst);
        } else {
            self.max_overlap.fetch_max(1, Ordering::SeqCst);
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let out = body();
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.busy_handles.lock().unwrap().remove(&token);
        out
    }

    fn sample(&self, steps: u32) {
        for step in 1..=steps as i32 {
            if !self.step_delay.is_zero() {
                thread::sleep(self.step_delay);
            }
            dispatch_progress(step, steps as i32, self.step_delay.as_secs_f32());
        }
    }
}

fn image_for(seed: i64, width: u32, height: u32, channels: u32) -> Image {
    Image::filled(width, height, channels, (seed % 251) as u8).unwrap()
}

impl Engine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    fn construct(&self, config: &ContextConfig) -> Result<RawHandle> {
        let model = config
            .model
            .clone()
            .or_else(|| config.diffusion_model.clone())
            .unwrap_or_default();
        dispatch_log(LogLevel::Info, &format!("loading model from '{}'", model.display()));
        if !model.is_file() {
            dispatch_log(LogLevel::Error, "init model loader from file failed");
            return Err(Error::Construction("Context creation failed".into()));
        }
        Ok(self.new_handle())
    }

    fn construct_upscaler(&self, config: &UpscalerConfig) -> Result<RawHandle> {
        if !config.esrgan_path.is_file() {
            return Err(Error::Construction("Upscaler creation failed".into()));
        }
        Ok(self.new_handle())
    }

    fn release(&self, kind: HandleKind, handle: RawHandle) {
        let call = match kind {
            HandleKind::Diffusion => "free_sd_ctx",
            HandleKind::Upscaler => "free_upscaler_ctx",
        };
        dispatch_log(LogLevel::Debug, call);
        if !self.step_delay.is_zero() {
            thread::sleep(self.step_delay);
        }
        self.released.fetch_add(1, Ordering::SeqCst);
        let removed = self.live.lock().unwrap().remove(&(handle.token() / 8));
        assert!(removed, "handle released twice");
    }

    fn txt2img(&self, handle: RawHandle, params: &Txt2ImgParams) -> Result<Vec<Image>> {
        self.exclusive(handle, || {
            self.prompts.lock().unwrap().push(params.prompt.clone());
            dispatch_log(LogLevel::Info, &format!("txt2img '{}'", params.prompt));
            if params.prompt == "fail" {
                dispatch_log(LogLevel::Error, "sampling failed");
                return Err(Error::EngineFailure("txt2img failed".into()));
            }
            self.sample(params.sample_steps);
            dispatch_log(LogLevel::Info, "txt2img completed");
            Ok((0..params.batch_count)
                .map(|i| image_for(params.seed + i as i64, params.width, params.height, 3))
                .collect())
        })
    }

    fn img2img(&self, handle: RawHandle, params: &Img2ImgParams) -> Result<Vec<Image>> {
        self.exclusive(handle, || {
            self.prompts.lock().unwrap().push(params.prompt.clone());
            self.sample(params.sample_steps);
            // Identity "denoise": the init image comes straight back.
            Ok(vec![params.init_image.clone(); params.batch_count as usize])
        })
    }

    fn img2vid(&self, handle: RawHandle, params: &Img2VidParams) -> Result<Vec<Image>> {
        self.exclusive(handle, || {
            self.sample(params.sample_steps);
            Ok((0..params.video_frames)
                .map(|i| image_for(i as i64, params.width, params.height, 3))
                .collect())
        })
    }

    fn upscale(&self, handle: RawHandle, image: &Image, factor: u32) -> Result<Image> {
        self.exclusive(handle, || {
            let (w, h, c) = (image.width * factor, image.height * factor, image.channels);
            let mut data = Vec::with_capacity((w * h * c) as usize);
            for y in 0..h {
                for x in 0..w {
                    let src = (((y / factor) * image.width + x / factor) * c) as usize;
                    data.extend_from_slice(&image.data[src..src + c as usize]);
                }
            }
            Image::new(w, h, c, data)
        })
    }

    fn system_info(&self) -> String {
        "System Info: scripted engine\n".to_string()
    }

    fn physical_cores(&self) -> i32 {
        4
    }
}

/// A model file that exists, plus the directory keeping it alive.
pub fn model_file() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.safetensors");
    std::fs::write(&path, b"weights").unwrap();
    (dir, path)
}

pub fn runtime(engine: &Arc<ScriptedEngine>) -> Runtime {
    Runtime::new(engine.clone())
}

/// Small, fast generation parameters.
pub fn quick_params(prompt: &str) -> Txt2ImgParams {
    Txt2ImgParams {
        width: 64,
        height: 64,
        sample_steps: 3,
        ..Txt2ImgParams::new(prompt)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Log(LogLevel, String),
    Progress(ProgressEvent),
}

/// Listeners that append every routed event to a shared list.
pub struct Recorder {
    pub events: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn log_listener(&self) -> LogListener {
        let events = self.events.clone();
        Arc::new(move |level: LogLevel, text: &str| {
            events.lock().unwrap().push(Event::Log(level, text.to_string()))
        })
    }

    pub fn progress_listener(&self) -> ProgressListener {
        let events = self.events.clone();
        Arc::new(move |event: ProgressEvent| events.lock().unwrap().push(Event::Progress(event)))
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn logs(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter_map(|event| match event {
                Event::Log(_, text) => Some(text),
                Event::Progress(_) => None,
            })
            .collect()
    }

    pub fn progress(&self) -> Vec<ProgressEvent> {
        self.snapshot()
            .into_iter()
            .filter_map(|event| match event {
                Event::Progress(p) => Some(p),
                Event::Log(..) => None,
            })
            .collect()
    }

    /// Wait until `done` holds for the recorded events or a second passes.
    pub async fn wait_until(&self, done: impl Fn(&[Event]) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(1);
        while Instant::now() < deadline {
            if done(&self.snapshot()) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        done(&self.snapshot())
    }
}
