//! JSON configuration for the host runtime.
//!
//! Every section is optional; missing fields take the core's defaults.
//!
//! ```json
//! {
//!   "serial": { "port": "/dev/ttyUSB0", "baud_rate": 115200 },
//!   "server": { "host": "192.168.1.20", "port": 9966 },
//!   "capture": { "capture_interval_ms": 30000, "image_size": "qvga" },
//!   "log_level": "debug"
//! }
//! ```

use std::path::{Path, PathBuf};

use camlink::{
    CameraConfig, CaptureConfig, NetworkConfig, TransportConfig, MAX_CHUNK_SIZE, MAX_IMAGE_SIZE,
};
use camlink::transport::POLL_SLICE_MS;
use serde::{Deserialize, Serialize};

use crate::RelayError;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_SERVER_PORT: u16 = 9966;

/// Read timeout of the serial pump; bounds how late a stop request is seen
pub const SERIAL_POLL_MS: u64 = 10;

/// Sink drops a connection after this much silence
pub const SINK_IDLE_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`
    pub port: String,
    pub baud_rate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

/// Image server the network task connects to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_SERVER_PORT,
        }
    }
}

/// Receiving side settings for `relay serve`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub bind: String,
    /// Directory completed images are written to
    pub output_dir: PathBuf,
    pub idle_timeout_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            bind: format!("0.0.0.0:{}", DEFAULT_SERVER_PORT),
            output_dir: PathBuf::from("images"),
            idle_timeout_ms: SINK_IDLE_TIMEOUT_MS,
        }
    }
}

/// Complete host configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub serial: SerialConfig,
    pub server: ServerConfig,
    pub transport: TransportConfig,
    pub camera: CameraConfig,
    pub capture: CaptureConfig,
    pub network: NetworkConfig,
    pub sink: SinkConfig,
    /// Capture buffer size and largest image the sink accepts
    pub max_image_size: usize,
    /// `error`, `warn`, `info`, `debug` or `trace`
    pub log_level: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            server: ServerConfig::default(),
            transport: TransportConfig::default(),
            camera: CameraConfig::default(),
            capture: CaptureConfig::default(),
            network: NetworkConfig::default(),
            sink: SinkConfig::default(),
            max_image_size: MAX_IMAGE_SIZE,
            log_level: None,
        }
    }
}

impl RelayConfig {
    /// Load and validate a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RelayError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Parse and validate JSON text
    pub fn from_json(content: &str) -> Result<Self, RelayError> {
        let config: RelayConfig = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), RelayError> {
        let invalid = |msg: String| Err(RelayError::InvalidConfig(msg));

        for (name, size) in [
            ("camera.chunk_size", self.camera.chunk_size),
            ("network.chunk_size", self.network.chunk_size),
        ] {
            if size == 0 || usize::from(size) > MAX_CHUNK_SIZE {
                return invalid(format!("{} must be 1..={}, got {}", name, MAX_CHUNK_SIZE, size));
            }
        }
        let slice = self.transport.poll_slice_ms;
        if slice == 0 || slice > POLL_SLICE_MS {
            return invalid(format!(
                "transport.poll_slice_ms must be 1..={}, got {}",
                POLL_SLICE_MS, slice
            ));
        }
        if self.transport.inactivity_timeout_ms == 0 {
            return invalid("transport.inactivity_timeout_ms is zero".to_string());
        }
        if self.serial.port.trim().is_empty() {
            return invalid("serial.port is empty".to_string());
        }
        if self.serial.baud_rate == 0 {
            return invalid("serial.baud_rate is zero".to_string());
        }
        if self.server.host.trim().is_empty() {
            return invalid("server.host is empty".to_string());
        }
        if self.server.port == 0 {
            return invalid("server.port is zero".to_string());
        }
        if self.max_image_size == 0 {
            return invalid("max_image_size is zero".to_string());
        }
        // Lengths are reported by the module as 16 bits
        if self.max_image_size > usize::from(u16::MAX) {
            return invalid(format!(
                "max_image_size {} exceeds the 16-bit image length",
                self.max_image_size
            ));
        }
        if let Some(level) = &self.log_level {
            if level.parse::<log::LevelFilter>().is_err() {
                return invalid(format!("unknown log_level {:?}", level));
            }
        }
        Ok(())
    }

    /// `host:port` of the image server
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
