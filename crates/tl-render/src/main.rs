//! Timeline render tool
//!
//! Usage:
//!   tl-render render <session.json> -o mix.wav   - Export a saved session
//!   tl-render peaks <file>...                     - Build peak files
//!   tl-render info <file>...                      - Print audio file properties

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use tl_core::EngineConfig;
use tl_engine::peak::PeakEvent;
use tl_engine::{AudioSource, ExportFormat, ExportSpec, PeakManager, PeakState, Session, SessionEvent, TimeRef};

#[derive(Parser)]
#[command(name = "tl-render", about = "Render timeline sessions and build peak files")]
struct Cli {
    /// Engine configuration (JSON); defaults are used when omitted
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export a saved session to a WAV file
    Render {
        /// Session state file
        session: PathBuf,
        /// Output WAV file
        #[arg(short, long)]
        output: PathBuf,
        /// Sample format of the output
        #[arg(short, long, value_enum)]
        format: Option<Format>,
        /// Normalize the peak to the configured target
        #[arg(short, long)]
        normalize: bool,
        /// Range start in seconds
        #[arg(long)]
        start: Option<f64>,
        /// Range end in seconds
        #[arg(long)]
        end: Option<f64>,
    },
    /// Build the peak files of one or more audio files
    Peaks {
        files: Vec<PathBuf>,
        /// Peak directory (overrides the configuration)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },
    /// Print audio file properties
    Info { files: Vec<PathBuf> },
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Wav16,
    Wav24,
    Float,
}

impl From<Format> for ExportFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Wav16 => ExportFormat::Wav16,
            Format::Wav24 => ExportFormat::Wav24,
            Format::Float => ExportFormat::WavFloat,
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Render {
            session,
            output,
            format,
            normalize,
            start,
            end,
        } => render(config, &session, output, format, normalize, start, end),
        Commands::Peaks { files, dir } => build_peaks(&config, &files, dir),
        Commands::Info { files } => print_info(&files),
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    EngineConfig::load_from(path).with_context(|| format!("Failed to load config {}", path.display()))
}

fn render(
    config: EngineConfig,
    session_path: &Path,
    output: PathBuf,
    format: Option<Format>,
    normalize: bool,
    start: Option<f64>,
    end: Option<f64>,
) -> Result<()> {
    let defaults = config.export.clone();
    let session = Session::new(config).context("Failed to create session")?;
    session
        .load_state(session_path)
        .with_context(|| format!("Failed to load session {}", session_path.display()))?;
    report(session.poll_events());

    let mut spec = ExportSpec::with_defaults(output, session.sample_rate(), &defaults).with_normalize(normalize);
    if let Some(format) = format {
        spec.format = format.into();
    }
    spec.start = start.map(TimeRef::from_seconds);
    spec.end = end.map(TimeRef::from_seconds);

    let result = session.export(&mut spec);
    report(session.poll_events());
    result.context("Export failed")?;

    println!(
        "Rendered {} ({:.2} s, peak {:.4})",
        spec.path.display(),
        spec.end.unwrap_or_default().to_seconds() - spec.start.unwrap_or_default().to_seconds(),
        spec.peakvalue
    );
    Ok(())
}

fn build_peaks(config: &EngineConfig, files: &[PathBuf], dir: Option<PathBuf>) -> Result<()> {
    if files.is_empty() {
        bail!("No input files");
    }
    let dir = dir.unwrap_or_else(|| config.peaks.directory.clone());
    let manager = PeakManager::new(&dir).context("Failed to open peak directory")?;

    let mut pending = 0;
    for file in files {
        let source = Arc::new(
            AudioSource::from_file(file).with_context(|| format!("Failed to open {}", file.display()))?,
        );
        manager.request_build(&source);
        pending += manager
            .peaks_for(&source)
            .iter()
            .filter(|p| p.state() != PeakState::Available)
            .count();
    }

    let mut failed = 0;
    while pending > 0 {
        let Some(event) = manager.wait_event(Duration::from_secs(30)) else {
            bail!("Timed out waiting for peak builds");
        };
        match event {
            PeakEvent::Progress { .. } => {}
            PeakEvent::Finished { source, channel } => {
                log::info!("Peaks ready: {} channel {}", source, channel);
                pending -= 1;
            }
            PeakEvent::Failed { source, channel, error } => {
                log::error!("Peaks failed: {} channel {}: {}", source, channel, error);
                failed += 1;
                pending -= 1;
            }
        }
    }

    if failed > 0 {
        bail!("{} peak build(s) failed", failed);
    }
    println!("Peak files written to {}", dir.display());
    Ok(())
}

fn print_info(files: &[PathBuf]) -> Result<()> {
    for file in files {
        let source = AudioSource::from_file(file).with_context(|| format!("Failed to open {}", file.display()))?;
        println!(
            "{}: {} ch, {} Hz, {} bit, {} frames ({:.3} s)",
            file.display(),
            source.channels(),
            source.sample_rate(),
            source.bit_depth(),
            source.num_frames(),
            source.length().to_seconds()
        );
    }
    Ok(())
}

fn report(events: Vec<SessionEvent>) {
    for event in events {
        match event {
            SessionEvent::Message { severity, text } => log::warn!("[{:?}] {}", severity, text),
            SessionEvent::ExportProgress(percent) if percent % 10 == 0 => log::info!("Export {}%", percent),
            _ => {}
        }
    }
}
