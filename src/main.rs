//! Snap2LaTeX - screenshot to LaTeX
//!
//! Recognizes mathematical formulas in screen captures with the nougat-latex
//! model. Runs either as a single-worker HTTP inference service or as a small
//! desktop utility.

mod capture;
mod client;
mod config;
mod desktop;
mod inference;
mod server;
mod shared;
mod storage;
mod vision;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::client::ServiceClient;
use crate::config::AppConfig;
use crate::inference::{Response, WorkerOptions};

/// Snap2LaTeX - screenshot to LaTeX
#[derive(Parser, Debug)]
#[command(name = "snap2latex", version)]
#[command(about = "Convert screenshots of equations into LaTeX")]
struct Args {
    /// Configuration file (defaults to the per-user config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level or filter directive (overrides logging.level; RUST_LOG wins)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP inference service
    Serve {
        /// Address to listen on (overrides server.bind)
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },
    /// Run the desktop capture utility (default)
    Desktop,
    /// Recognize one image file with a local model
    Recognize {
        image: PathBuf,
    },
    /// Send one image file to a running service
    Client {
        image: PathBuf,
        /// Service URL (defaults to desktop.server_url, then the local bind address)
        #[arg(short, long)]
        server: Option<String>,
    },
    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => storage::default_config_path()?,
    };
    let (config, loaded) = if matches!(args.command, Some(Command::InitConfig { .. })) {
        (AppConfig::default(), false)
    } else {
        load_or_default(&config_path, args.config.is_some())?
    };

    init_logging(args.log_level.as_deref().unwrap_or(&config.logging.level))?;
    if loaded {
        info!("Loaded configuration from {:?}", config_path);
    } else {
        info!("Using default configuration");
    }

    match args.command.unwrap_or(Command::Desktop) {
        Command::Serve { bind } => run_serve(config, bind),
        Command::Desktop => desktop::run_desktop(config).map(|_| ExitCode::SUCCESS),
        Command::Recognize { image } => run_recognize(&config, &image),
        Command::Client { image, server } => run_client(&config, &image, server),
        Command::InitConfig { force } => init_config(&config_path, force),
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Load configuration, falling back to defaults when the default file is absent.
///
/// An explicitly requested file must exist.
fn load_or_default(path: &Path, explicit: bool) -> Result<(AppConfig, bool)> {
    if path.exists() {
        return Ok((config::load_config(path)?, true));
    }
    if explicit {
        bail!("Config file not found: {:?}", path);
    }
    Ok((AppConfig::default(), false))
}

fn run_serve(config: AppConfig, bind: Option<SocketAddr>) -> Result<ExitCode> {
    let bind = bind.unwrap_or(config.server.bind);
    let options = WorkerOptions {
        skip_abandoned_jobs: config.server.skip_abandoned_jobs,
        ..Default::default()
    };
    let pipeline = inference::start(&config, options)?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime")?;
    runtime.block_on(server::serve(pipeline.queue.clone(), &config.server, bind))?;
    pipeline.shutdown();
    Ok(ExitCode::SUCCESS)
}

fn print_response(response: Response) -> ExitCode {
    match response {
        Response::Recognized(latex) => {
            println!("{}", latex);
            ExitCode::SUCCESS
        }
        Response::Failed(error) => {
            eprintln!("Recognition failed: {}", error);
            ExitCode::FAILURE
        }
    }
}

fn run_recognize(config: &AppConfig, image: &Path) -> Result<ExitCode> {
    let payload = std::fs::read(image).with_context(|| format!("Failed to read {:?}", image))?;
    let pipeline = inference::start(config, WorkerOptions::default())?;
    let response = pipeline.queue.recognize_blocking(payload);
    pipeline.shutdown();
    Ok(print_response(response))
}

fn run_client(config: &AppConfig, image: &Path, server: Option<String>) -> Result<ExitCode> {
    let payload = std::fs::read(image).with_context(|| format!("Failed to read {:?}", image))?;
    let url = server
        .or_else(|| config.desktop.server_url.clone())
        .unwrap_or_else(|| format!("http://{}/", config.server.bind));
    let filename = image
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "image.png".to_string());

    let client = ServiceClient::new(url)?;
    let response = client.recognize_blocking(payload, &filename)?;
    Ok(print_response(response))
}

fn init_config(path: &Path, force: bool) -> Result<ExitCode> {
    if path.exists() && !force {
        bail!("{:?} already exists (use --force to overwrite)", path);
    }
    config::save_config(&AppConfig::default(), path)?;
    println!("Wrote default configuration to {}", path.display());
    Ok(ExitCode::SUCCESS)
}
