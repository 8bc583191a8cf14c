//! # Camera Link Core Library
//!
//! This crate provides the core of the serial camera relay:
//!
//! - **Byte Queue**: Interrupt-fed, drop-on-overflow SPSC ring for UART receive
//! - **UART Transport**: Blocking writes and two-tier timeout reads
//! - **Camera Driver**: Command/acknowledgment exchanges and the chunked
//!   bulk image read with envelope validation and retries
//! - **Image Mailbox**: Single-slot, freshest-wins hand-off between tasks
//! - **Packet Framing**: The `PH` chunked TCP framing used to ship images
//! - **Tasks**: The capture loop and the network send loop
//!
//! ## Architecture
//!
//! ```text
//!  UART RX ISR ──► ByteQueue ──► UartTransport ◄──► Camera ◄── capture_task
//!                                                                  │
//!                                                             Mailbox::publish
//!                                                                  │
//!  TCP socket ◄── PacketHeader + payload ◄── send_image ◄── network_task
//! ```
//!
//! Every hardware or network dependency sits behind a trait in [`traits`],
//! so the same driver code runs under an embedded executor or on a host with
//! tokio.

#![cfg_attr(not(feature = "std"), no_std)]

pub mod camera;
pub mod chunk;
pub mod command;
pub mod mailbox;
pub mod packet;
pub mod queue;
pub mod task;
pub mod traits;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export main types for convenience
pub use camera::{Camera, CameraConfig, CameraError};
pub use chunk::{chunks, Chunk, Chunks};
pub use command::{Ack, Command, FrameError, ImageSize};
pub use mailbox::{ImageRecord, Mailbox};
pub use packet::{PacketError, PacketHeader, TransferStep, TransferTracker};
pub use queue::{ByteQueue, QueueStats, RX_QUEUE_SIZE};
pub use task::{
    capture_cycle, capture_task, deliver_next, network_task, send_image, CaptureConfig,
    CycleOutcome, NetworkConfig, SendError, SocketOptions,
};
pub use traits::{Connector, SerialLink, Timer};
pub use transport::{TransportConfig, TransportError, UartTransport};

/// Library version, logged at pipeline start
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Size of one chunk, both for camera bulk reads and for TCP packets
pub const CHUNK_SIZE: usize = 256;

/// Largest chunk size any configuration may request
///
/// Bounds the stack buffer used for one chunk envelope.
pub const MAX_CHUNK_SIZE: usize = 1024;

/// Default ceiling for a captured image (60 KiB)
pub const MAX_IMAGE_SIZE: usize = 60 * 1024;
