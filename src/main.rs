//! Clap detection service binary
//!
//! Serves the double-clap polling API, lists input devices, or scans a WAV
//! recording for claps.

use anyhow::Context;
use clap::{Parser, Subcommand};
use clap_detector::{
    init_logging, list_input_devices, scan, AppState, CpalOpener, DetectorConfig, DeviceSelector,
    ServerConfig, SourceOpener, WavOpener, WavSource,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "clap-service")]
#[command(about = "Double-clap detection service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Input device: "default", an index from `devices`, or a device name
    #[arg(long, global = true)]
    device: Option<DeviceSelector>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP control API (default)
    Serve {
        /// Address to listen on
        #[arg(long)]
        bind: Option<SocketAddr>,

        /// Replay a WAV file instead of capturing from a device
        #[arg(long)]
        replay: Option<PathBuf>,
    },

    /// List audio input devices
    Devices,

    /// Scan a WAV recording for claps and double claps
    Analyze {
        /// WAV file at the configured sample rate
        file: PathBuf,

        /// Read frames at the pace a live device would deliver them
        #[arg(long)]
        realtime: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();

    let mut config = DetectorConfig::from_env().context("Failed to load detector configuration")?;
    if let Some(device) = cli.device {
        config.device = device;
    }

    match cli.command.unwrap_or(Commands::Serve {
        bind: None,
        replay: None,
    }) {
        Commands::Serve { bind, replay } => {
            let mut server = ServerConfig::from_env().context("Failed to load server configuration")?;
            if let Some(bind) = bind {
                server.bind_addr = bind;
            }

            let opener: Arc<dyn SourceOpener> = match replay {
                Some(path) => {
                    info!("Replaying {} instead of live input", path.display());
                    Arc::new(WavOpener { path })
                }
                None => Arc::new(CpalOpener),
            };

            info!("Starting clap detection service v{}", clap_detector::VERSION);
            clap_detector::serve(server, AppState::new(config, opener)).await?;
            info!("Clap detection service stopped");
        }

        Commands::Devices => {
            let devices = list_input_devices()?;
            if devices.is_empty() {
                println!("No input devices found");
            }
            for device in devices {
                let marker = if device.is_default { " (default)" } else { "" };
                println!("  [{}] {}{}", device.index, device.name, marker);
            }
        }

        Commands::Analyze { file, realtime } => {
            let mut source = WavSource::open(&file, config.sample_rate)
                .with_context(|| format!("Failed to open {}", file.display()))?;
            if realtime {
                source = source.paced(config.frame_duration());
            }
            let report = tokio::task::spawn_blocking(move || scan(&mut source, &config)).await??;

            println!("Frames scanned: {}", report.frames);
            for at in &report.claps {
                println!("  clap        at {:>8.3}s", at.as_secs_f64());
            }
            for at in &report.double_claps {
                println!("  double clap at {:>8.3}s", at.as_secs_f64());
            }
            println!(
                "{} claps, {} double claps",
                report.claps.len(),
                report.double_claps.len()
            );
        }
    }

    Ok(())
}
