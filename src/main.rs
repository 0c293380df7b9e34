//! vtape - record and play byte streams on video tape
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                             vtape                                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │ stdin / file │───▶│ tape chain   │───▶│ video device │       │
//! │  │              │◀───│ codec/framer │◀───│  (DeviceIo)  │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;

use clap::{Args as ClapArgs, Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use vtape::adapters::{
    CompositeEventPublisher, FieldPacer, InMemoryEventCollector, LoggingEventPublisher,
    StdioDevice,
};
use vtape::domain::{DeviceIo, Direction, EventPublisher};
use vtape::error::Result;
use vtape::format::{summary, Density, FormatVariant, VideoStandard};
use vtape::stream::{play, record, IntegrityPolicy, RetryStrategy, StatsSnapshot, StreamNode};
use vtape::TransportConfig;

// =============================================================================
// CLI Arguments
// =============================================================================

/// Store byte streams on an analog video recorder
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(long, env = "VTAPE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "VTAPE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "VTAPE_LOG_JSON")]
    log_json: bool,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Command,
}

/// Flags that take precedence over the configuration file.
#[derive(ClapArgs, Debug, Default)]
struct Overrides {
    /// Video standard
    #[arg(long, value_enum, global = true)]
    standard: Option<VideoStandard>,

    /// Bit density
    #[arg(long, value_enum, global = true)]
    density: Option<Density>,

    /// Sector format
    #[arg(long, value_enum, global = true)]
    format: Option<FormatVariant>,

    /// Advisory I/O timeout in seconds
    #[arg(long, global = true)]
    timeout: Option<u32>,

    /// Handling of damaged sectors on playback
    #[arg(long, value_enum, global = true)]
    integrity: Option<IntegrityPolicy>,

    /// Drive the device in fixed-size records of this many bytes
    #[arg(long, global = true)]
    record_size: Option<usize>,

    /// Admit at most one field per field period
    #[arg(long, global = true)]
    pace: bool,

    /// Put the device in non-blocking mode
    #[arg(long, global = true)]
    nonblocking: bool,

    /// How to wait after a would-block
    #[arg(long, value_enum, global = true)]
    retry: Option<RetryStrategy>,
}

impl Overrides {
    fn apply(&self, config: &mut TransportConfig) {
        if let Some(standard) = self.standard {
            config.mode.standard = Some(standard);
        }
        if let Some(density) = self.density {
            config.mode.density = Some(density);
        }
        if let Some(format) = self.format {
            config.mode.format = Some(format);
        }
        if let Some(timeout) = self.timeout {
            config.mode.timeout_secs = Some(timeout);
        }
        if let Some(integrity) = self.integrity {
            config.integrity = integrity;
        }
        if let Some(size) = self.record_size {
            config.record_size = Some(size);
        }
        if let Some(retry) = self.retry {
            config.retry = retry;
        }
        config.pace |= self.pace;
        config.nonblocking |= self.nonblocking;
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the recording mode
    Mode,

    /// Record application bytes onto tape
    Record {
        /// Video device or capture file
        #[arg(long)]
        device: PathBuf,

        /// Read from this file instead of stdin
        #[arg(long)]
        input: Option<PathBuf>,
    },

    /// Play tape back into application bytes
    Play {
        /// Video device or capture file
        #[arg(long)]
        device: PathBuf,

        /// Write to this file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Read a whole tape and report its integrity
    Check {
        /// Video device or capture file
        #[arg(long)]
        device: PathBuf,
    },

    /// Copy stdin to stdout in non-blocking mode and count would-blocks
    Probe,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("vtape: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => TransportConfig::load(path)?,
        None => TransportConfig::default(),
    };
    args.overrides.apply(&mut config);
    config.validate()?;

    match args.command {
        Command::Mode => {
            print!("{}", summary(config.to_mode_word()));
            Ok(())
        }
        Command::Record { device, input } => run_record(&config, &device, input.as_deref()),
        Command::Play { device, output } => run_play(&config, &device, output.as_deref()),
        Command::Check { device } => run_check(&config, &device),
        Command::Probe => run_probe(),
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // stdout carries tape data, so logs go to stderr
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(io::stderr))
            .init();
    }
}

// =============================================================================
// Commands
// =============================================================================

fn run_record(config: &TransportConfig, path: &Path, input: Option<&Path>) -> Result<()> {
    let mode = config.to_mode_word();
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    let device = open_device(config, file)?;
    let options = config.stream_options(Arc::new(LoggingEventPublisher::new()));

    let mut chain = StreamNode::tape_chain(mode, device, &options)?;
    chain.start(Direction::Write)?;
    info!(%mode, device = %path.display(), "Recording");

    let input: Box<dyn Read + Send> = match input {
        Some(path) => Box::new(File::open(path)?),
        None => Box::new(io::stdin()),
    };
    let began = Instant::now();
    let recorded = record(input, &mut chain, &config.driver(), config.pipeline_buffer)?;

    info!(
        recorded,
        sectors = chain.stats().sectors(),
        elapsed_ms = began.elapsed().as_millis() as u64,
        "Recorded"
    );
    Ok(())
}

fn run_play(config: &TransportConfig, path: &Path, output: Option<&Path>) -> Result<()> {
    let mode = config.to_mode_word();
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let device = open_device(config, file)?;
    let options = config.stream_options(Arc::new(LoggingEventPublisher::new()));

    let mut chain = StreamNode::tape_chain(mode, device, &options)?;
    chain.start(Direction::Read)?;
    info!(%mode, device = %path.display(), "Playing");

    let output: Box<dyn Write + Send> = match output {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(io::stdout()),
    };
    let played = play(&mut chain, output, &config.driver(), config.pipeline_buffer)?;

    info!(played, sectors = chain.stats().sectors(), "Played");
    Ok(())
}

/// Outcome of a `check` run, printed as JSON.
#[derive(Debug, Serialize)]
struct CheckReport {
    mode: String,
    bytes: u64,
    sectors: u64,
    skipped: usize,
    missing: u64,
    invalid: usize,
    damaged: Vec<u64>,
    framer: Option<StatsSnapshot>,
}

fn run_check(config: &TransportConfig, path: &Path) -> Result<()> {
    let mode = config.to_mode_word();
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let device = open_device(config, file)?;

    let collector = Arc::new(InMemoryEventCollector::new());
    let publisher = CompositeEventPublisher::new()
        .with_publisher(LoggingEventPublisher::debug_level())
        .with_publisher(Arc::clone(&collector));
    let options = config.stream_options(Arc::new(publisher) as Arc<dyn EventPublisher>);

    let mut chain = StreamNode::tape_chain(mode, device, &options)?;
    chain.start(Direction::Read)?;

    let driver = config.driver();
    let mut buf = vec![0u8; config.pipeline_buffer];
    let mut bytes = 0u64;
    let result = loop {
        match driver.read(&mut chain, &mut buf) {
            Ok(0) => break Ok(()),
            Ok(n) => bytes += n as u64,
            Err(e) => break Err(e),
        }
    };
    chain.release();
    result?;

    let report = CheckReport {
        mode: mode.to_string(),
        bytes,
        sectors: chain.stats().sectors(),
        skipped: collector.events_of_type("SectorSkipped").len(),
        missing: collector.missing_sectors(),
        invalid: collector.events_of_type("SectorInvalid").len(),
        damaged: collector.damaged_sequences(),
        framer: chain.source().map(|framer| framer.stats().snapshot()),
    };
    let json = serde_json::to_string_pretty(&report)
        .map_err(|e| vtape::Error::Internal(format!("Failed to render report: {}", e)))?;
    println!("{}", json);
    Ok(())
}

fn open_device(config: &TransportConfig, file: File) -> Result<Box<dyn DeviceIo>> {
    #[cfg(unix)]
    let device = {
        if config.nonblocking {
            vtape::adapters::set_nonblocking(file.as_raw_fd(), true)?;
        }
        StdioDevice::with_fd(file, config.transfer_style())?
    };
    #[cfg(not(unix))]
    let device = StdioDevice::new(file, config.transfer_style())?;

    if config.pace {
        Ok(Box::new(FieldPacer::for_mode(device, config.to_mode_word())?))
    } else {
        Ok(Box::new(device))
    }
}

// =============================================================================
// Non-blocking Probe
// =============================================================================

#[cfg(unix)]
fn run_probe() -> Result<()> {
    use std::os::fd::AsFd;
    use vtape::adapters::{set_nonblocking, TransferStyle};
    use vtape::domain::Transfer;

    let stdin = File::from(io::stdin().as_fd().try_clone_to_owned()?);
    let stdout = File::from(io::stdout().as_fd().try_clone_to_owned()?);
    let (in_fd, out_fd) = (stdin.as_raw_fd(), stdout.as_raw_fd());
    set_nonblocking(in_fd, true)?;
    set_nonblocking(out_fd, true)?;

    let mut input = StdioDevice::with_fd(stdin, TransferStyle::Raw)?;
    let mut output = StdioDevice::with_fd(stdout, TransferStyle::Raw)?;
    input.start(Direction::Read)?;
    output.start(Direction::Write)?;

    let mut buf = vec![0u8; 4096];
    let (mut read_blocks, mut write_blocks) = (0u64, 0u64);
    let result = (|| -> Result<()> {
        loop {
            let n = match input.read(&mut buf)? {
                Transfer::Bytes(n) => n,
                Transfer::WouldBlock => {
                    read_blocks += 1;
                    input.wait_ready(Direction::Read, None)?;
                    continue;
                }
                Transfer::EndOfStream => return Ok(()),
            };

            let mut pending = &buf[..n];
            while !pending.is_empty() {
                match output.write(pending)? {
                    Transfer::Bytes(m) => pending = &pending[m..],
                    _ => {
                        write_blocks += 1;
                        output.wait_ready(Direction::Write, None)?;
                    }
                }
            }
        }
    })();

    input.release();
    output.release();
    // The descriptors share their flags with the terminal
    set_nonblocking(in_fd, false)?;
    set_nonblocking(out_fd, false)?;

    eprintln!("read would-blocks: {}", read_blocks);
    eprintln!("write would-blocks: {}", write_blocks);
    result
}

#[cfg(not(unix))]
fn run_probe() -> Result<()> {
    Err(vtape::Error::Config(
        "probe needs non-blocking descriptors, which this platform lacks".into(),
    ))
}
