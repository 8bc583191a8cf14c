//! # Serial Camera Relay Host Runtime
//!
//! Runs the [`camlink`] pipeline on a host machine and provides the receiving
//! end of its TCP protocol.
//!
//! ## Thread Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                           relay run                              │
//! │                                                                  │
//! │  ┌────────────┐  push   ┌───────────┐                            │
//! │  │ uart-rx    │────────►│ ByteQueue │◄── UartTransport           │
//! │  │ (pump)     │         └───────────┘        │                   │
//! │  └────────────┘                              ▼                   │
//! │  ┌──────────────────────────┐   publish  ┌─────────┐             │
//! │  │ capture (tokio, 1 thread)│───────────►│ Mailbox │             │
//! │  └──────────────────────────┘            └────┬────┘             │
//! │  ┌──────────────────────────┐      take       │                  │
//! │  │ network (tokio, 1 thread)│◄────────────────┘ ──► TCP server   │
//! │  └──────────────────────────┘                                    │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The pump thread plays the role of the UART receive interrupt: it only
//! pushes bytes and never blocks on the consumer.

pub mod config;
pub mod net;
pub mod pipeline;
pub mod serial;
pub mod sink;
pub mod timer;

use std::io::Write;

use log::LevelFilter;
use thiserror::Error;

pub use config::RelayConfig;
pub use pipeline::{start_pipeline, Pipeline};

/// Errors surfaced by the host runtime
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("camera error: {0}")]
    Camera(#[from] camlink::CameraError),
    #[error("packet error: {0}")]
    Packet(#[from] camlink::PacketError),
    #[error("{0} thread panicked")]
    ThreadPanicked(&'static str),
}

/// Initialize `env_logger`
///
/// `-v` flags win over the configured level; `RUST_LOG` refines both.
pub fn init_logging(configured: Option<&str>, verbosity: u8) {
    let base_level = match verbosity {
        0 => configured
            .and_then(|level| level.parse().ok())
            .unwrap_or(LevelFilter::Info),
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::new();
    builder.filter_level(base_level);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.format(|fmt, record| {
        let ts = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
    });
    // A second init (tests, embedding) keeps the first logger
    let _ = builder.try_init();
}
