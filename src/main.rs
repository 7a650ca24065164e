use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use kbuffer::{AppConfig, Config, render_snapshot};

/// K-Buffer order-independent transparency demo.
#[derive(Parser, Debug)]
#[command(name = "kbuffer-demo", version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Render one frame with the software K-Buffer into this PNG and exit
    #[arg(long, value_name = "PNG")]
    headless: Option<PathBuf>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    /// Fragments kept per pixel (1-16)
    #[arg(short, long)]
    k: Option<u32>,

    /// STL model drawn as the translucent object
    #[arg(short, long, value_name = "STL")]
    model: Option<PathBuf>,

    /// Orbit steps of 1/60 s before a headless snapshot
    #[arg(long, default_value_t = 0)]
    frames: u32,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => AppConfig::load_from_file(path)?,
        None => AppConfig::default(),
    };

    let width = args.width.unwrap_or(config.width);
    let height = args.height.unwrap_or(config.height);
    config = config.size(width, height);
    if let Some(k) = args.k {
        config.kbuffer.k = k;
    }
    if let Some(model) = args.model {
        config.scene.model = Some(model);
    }
    config.kbuffer = config.kbuffer.sanitized();

    match args.headless {
        Some(path) => {
            render_snapshot(&config.scene, &config.kbuffer, args.frames, &path)?;
        }
        None => kbuffer::run(config)?,
    }
    Ok(())
}
