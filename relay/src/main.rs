//! Binary entrypoint for the serial camera relay.
//!
//! Commands:
//! - `run [--port <path>] [--server <host:port>]` - capture from the camera
//!   and stream images to the server
//! - `serve [--bind <addr>] [--out <dir>]` - receive images and save them
//! - `check` - load and validate the configuration, then print it
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use relay::config::RelayConfig;
use relay::sink::ImageSink;
use relay::{init_logging, start_pipeline};

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Relay stills from a serial JPEG camera to a TCP image server")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (JSON); defaults apply when omitted
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging (-v, -vv for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the capture and network tasks
    Run {
        /// Camera serial port (e.g., /dev/ttyUSB0)
        #[arg(short, long)]
        port: Option<String>,
        /// Baud rate
        #[arg(short, long)]
        baud: Option<u32>,
        /// Image server as host:port
        #[arg(short, long)]
        server: Option<String>,
    },
    /// Receive images and write them to disk
    Serve {
        /// Listen address
        #[arg(long)]
        bind: Option<String>,
        /// Output directory
        #[arg(short, long)]
        out: Option<String>,
    },
    /// Validate the configuration and print the effective settings
    Check,
}

fn load_config(path: Option<&str>) -> Result<RelayConfig> {
    match path {
        Some(path) => RelayConfig::load(path).with_context(|| format!("loading {}", path)),
        None => Ok(RelayConfig::default()),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    init_logging(config.log_level.as_deref(), cli.verbose);

    match cli.command {
        Commands::Run { port, baud, server } => {
            if let Some(port) = port {
                config.serial.port = port;
            }
            if let Some(baud) = baud {
                config.serial.baud_rate = baud;
            }
            if let Some(server) = server {
                let (host, port) = server
                    .rsplit_once(':')
                    .context("--server must be host:port")?;
                config.server.host = host.to_string();
                config.server.port = port.parse().context("invalid server port")?;
            }
            config.validate()?;

            info!("Starting relay v{}", env!("CARGO_PKG_VERSION"));
            let pipeline = start_pipeline(&config).context("starting pipeline")?;
            pipeline.wait().context("pipeline stopped")?;
        }
        Commands::Serve { bind, out } => {
            if let Some(bind) = bind {
                config.sink.bind = bind;
            }
            if let Some(out) = out {
                config.sink.output_dir = out.into();
            }

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            let sink = runtime.block_on(ImageSink::bind(&config.sink, config.max_image_size))?;
            runtime.block_on(sink.run())?;
        }
        Commands::Check => {
            config.validate()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }
    Ok(())
}
