//! diffuse - text-to-image from the command line
//!
//! Loads the engine library, constructs one context, runs txt2img and writes
//! every image as a binary PPM (RGB) or PAM (RGBA / grey) file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use diffuse_core::{
    init, ContextConfig, Image, LogLevel, LogListener, ProgressEvent, ProgressListener, Runtime,
    RuntimeConfig, Txt2ImgParams,
};
use tracing::info;

fn print_help() {
    println!("diffuse - stable-diffusion runner v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("USAGE:");
    println!("  diffuse --model <PATH> --prompt <TEXT> [OPTIONS]");
    println!("  diffuse --info [--lib <PATH>]");
    println!();
    println!("OPTIONS:");
    println!("  -h, --help            Print this help message");
    println!("  -v, --version         Print version information");
    println!("      --info            Print engine system info and exit");
    println!("  -m, --model <PATH>    Model weights file");
    println!("  -p, --prompt <TEXT>   Prompt text");
    println!("  -o, --output <PATH>   Output file stem (default: output)");
    println!("  -c, --config <PATH>   JSON context config (camelCase keys)");
    println!("  -b, --batch <N>       Number of images (default: 1)");
    println!("      --lib <PATH>      Engine shared library (or DIFFUSE_ENGINE_LIB)");
    println!();
    println!("Set RUST_LOG to adjust log verbosity.");
}

#[derive(Debug, Default)]
struct Args {
    info: bool,
    model: Option<PathBuf>,
    prompt: Option<String>,
    output: Option<PathBuf>,
    config: Option<PathBuf>,
    lib: Option<PathBuf>,
    batch: Option<u32>,
}

enum Parsed {
    Run(Args),
    Exit,
}

fn parse_args(raw: &[String]) -> Result<Parsed> {
    let mut args = Args::default();
    let mut iter = raw.iter();

    while let Some(arg) = iter.next() {
        let mut value = |name: &str| -> Result<String> {
            iter.next()
                .cloned()
                .with_context(|| format!("{} requires a value", name))
        };
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return Ok(Parsed::Exit);
            }
            "-v" | "--version" => {
                println!("diffuse {}", env!("CARGO_PKG_VERSION"));
                return Ok(Parsed::Exit);
            }
            "--info" => args.info = true,
            "-m" | "--model" => args.model = Some(value(arg)?.into()),
            "-p" | "--prompt" => args.prompt = Some(value(arg)?),
            "-o" | "--output" => args.output = Some(value(arg)?.into()),
            "-c" | "--config" => args.config = Some(value(arg)?.into()),
            "--lib" => args.lib = Some(value(arg)?.into()),
            "-b" | "--batch" => {
                let text = value(arg)?;
                args.batch = Some(
                    text.parse()
                        .with_context(|| format!("invalid batch count '{}'", text))?,
                );
            }
            other => bail!("unrecognized argument '{}'", other),
        }
    }
    Ok(Parsed::Run(args))
}

/// Binary PPM for RGB, PAM for everything else.
fn write_image(path: &Path, image: &Image) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {:?}", path))?;
    let mut out = BufWriter::new(file);
    if image.channels == 3 {
        write!(out, "P6\n{} {}\n255\n", image.width, image.height)?;
    } else {
        let tuple = match image.channels {
            1 => "GRAYSCALE",
            2 => "GRAYSCALE_ALPHA",
            _ => "RGB_ALPHA",
        };
        write!(
            out,
            "P7\nWIDTH {}\nHEIGHT {}\nDEPTH {}\nMAXVAL 255\nTUPLTYPE {}\nENDHDR\n",
            image.width, image.height, image.channels, tuple
        )?;
    }
    out.write_all(image.as_bytes())?;
    out.flush()?;
    Ok(())
}

fn output_path(stem: &Path, index: usize, image: &Image) -> PathBuf {
    let ext = if image.channels == 3 { "ppm" } else { "pam" };
    let name = stem
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    stem.with_file_name(format!("{}-{}.{}", name, index, ext))
}

#[tokio::main]
async fn main() -> Result<()> {
    let raw: Vec<String> = std::env::args().skip(1).collect();
    let args = match parse_args(&raw) {
        Ok(Parsed::Run(args)) => args,
        Ok(Parsed::Exit) => return Ok(()),
        Err(e) => {
            eprintln!("error: {:#}", e);
            eprintln!("Run 'diffuse --help' for usage information.");
            std::process::exit(1);
        }
    };

    init()?;

    let mut runtime_config = RuntimeConfig::default();
    if let Some(lib) = args.lib {
        runtime_config.library_path = Some(lib);
    }
    let runtime = Runtime::load(&runtime_config).context("loading engine library")?;

    if args.info {
        println!("{}", runtime.system_info().trim_end());
        println!("physical cores: {}", runtime.physical_cores());
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => ContextConfig::from_json_file(path)?,
        None => ContextConfig::default(),
    };
    if let Some(model) = args.model {
        config.model = Some(model);
    }
    let Some(prompt) = args.prompt else {
        bail!("--prompt is required");
    };

    let log: LogListener = Arc::new(|level: LogLevel, text: &str| {
        eprintln!("[{}] {}", level, text.trim_end());
    });
    let progress: ProgressListener = Arc::new(|event: ProgressEvent| {
        eprint!("\rstep {}/{} ({:.2}s/it)", event.step, event.steps, event.seconds);
        if event.step >= event.steps {
            eprintln!();
        }
    });

    let ctx = runtime
        .create_context(config, Some(log), Some(progress))
        .await
        .context("creating context")?;
    info!(context = ctx.label(), "Model loaded");

    let mut params = Txt2ImgParams::new(prompt);
    if let Some(batch) = args.batch {
        params.batch_count = batch;
    }
    let images = ctx.txt2img(params)?.await.context("generation failed")?;

    let stem = args.output.unwrap_or_else(|| PathBuf::from("output"));
    for (index, image) in images.iter().enumerate() {
        let path = output_path(&stem, index, image);
        write_image(&path, image)?;
        info!("Wrote {:?} ({}x{}x{})", path, image.width, image.height, image.channels);
    }

    ctx.dispose()?.await?;
    Ok(())
}
