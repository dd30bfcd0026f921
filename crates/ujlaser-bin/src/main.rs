//! `ujlaser` command line.
//!
//! ```bash
//! # Serve the emulated device on one end of a virtual serial pair
//! ujlaser emulate --port /dev/pts/3
//!
//! # Read and decode the status word of a connected device
//! ujlaser status --port /dev/ttyUSB0
//! ```

mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::info;

use ujlaser_core::config::{LaserConfig, LogFormat, DEFAULT_CONFIG_PATH};
use ujlaser_core::serial;
use ujlaser_driver::LaserController;
use ujlaser_emulator::{serve, EmulatorHandle};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "ujlaser")]
#[command(about = "MicroJewel laser driver and emulator", long_about = None)]
struct Cli {
    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Override the configured log format
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormatArg>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer the MicroJewel protocol on a serial port until Ctrl-C
    Emulate {
        /// Serial device to serve on
        #[arg(long)]
        port: String,

        /// Configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Connect to a device and print its status word
    Status {
        /// Serial device the laser is attached to
        #[arg(long)]
        port: String,

        /// Configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Pretty,
    Compact,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Compact => LogFormat::Compact,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

/// Load the config file, then apply the port and logging overrides.
fn load_config(cli: &Cli, path: Option<&PathBuf>, port: &str) -> Result<LaserConfig> {
    let path = path
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = LaserConfig::load_from(&path)
        .with_context(|| format!("loading {}", path.display()))?;

    config.serial.port = Some(port.to_string());
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format.into();
    }
    config.validate().map_err(anyhow::Error::msg)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.command {
        Commands::Emulate { port, config } | Commands::Status { port, config } => {
            load_config(&cli, config.as_ref(), port)?
        }
    };

    let tracing = logging::TracingConfig::from_config(&config.logging).map_err(anyhow::Error::msg)?;
    logging::init(&tracing).map_err(anyhow::Error::msg)?;

    match cli.command {
        Commands::Emulate { port, .. } => emulate(&port, &config).await,
        Commands::Status { .. } => status(&config).await,
    }
}

async fn emulate(port: &str, config: &LaserConfig) -> Result<()> {
    let stream = serial::open_serial_async(port, config.serial.baud_rate, "emulator")
        .await
        .with_context(|| format!("opening {port}"))?;
    let handle = EmulatorHandle::new(config);
    info!(port, address = %config.device.address, "emulating MicroJewel");

    tokio::select! {
        result = serve(handle, stream) => result.context("emulator link failed")?,
        _ = tokio::signal::ctrl_c() => info!("shutting down"),
    }
    Ok(())
}

async fn status(config: &LaserConfig) -> Result<()> {
    let laser = LaserController::connect(config)
        .await
        .context("connecting to laser")?;

    let identity = laser.identity().await?;
    let status = laser.get_status().await?;
    println!("{identity}");
    print!("{status}");

    laser.close().await?;
    Ok(())
}
