//! # Camera Protocol Driver
//!
//! Request/response driver for PTC06 / VC0706-class serial JPEG cameras.
//!
//! Every exchange is synchronous: flush stale input, send one command frame,
//! read the fixed-size reply within a deadline. The module has no flow
//! control, so each boundary carries an explicit timeout and the bulk image
//! read retries each chunk a bounded number of times.
//!
//! ## Capture Sequence
//!
//! ```text
//! init ──► take_picture ──► read_image ──────────────────► clear_cache
//!  (reset,     (freeze +       get_length, then per chunk:     (always)
//!   once)       settle)        flush → read cmd → envelope
//!                              check → copy, ≤ N attempts
//! ```

use core::fmt;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::chunk::{chunks, Chunk};
use crate::command::{
    decode_length, envelope_matches, Ack, Command, FrameError, ImageSize, ACK_LEN,
    CHUNK_ENVELOPE, ENVELOPE_OVERHEAD, JPEG_EOI, JPEG_SOI, LENGTH_REPLY_LEN, LENGTH_REPLY_PREFIX,
};
use crate::traits::SerialLink;
use crate::transport::{Hex, TransportError};
use crate::{CHUNK_SIZE, MAX_CHUNK_SIZE};

/// Wait after power-up before the first command
pub const POWER_UP_SETTLE_MS: u32 = 2500;

/// Deadline for one command's reply
pub const COMMAND_TIMEOUT_MS: u32 = 2000;

/// Wait after freezing a frame before asking for its length
pub const CAPTURE_SETTLE_MS: u32 = 2000;

/// Wait between writing a command and reading its acknowledgment
pub const RESPONSE_DELAY_MS: u32 = 1000;

/// Wait after a completed exchange before the next command
pub const COMMAND_GAP_MS: u32 = 1000;

/// Wait before the single follow-up read of a split reply
pub const PARTIAL_REPLY_DELAY_MS: u32 = 500;

/// Attempts per chunk before the whole transfer is abandoned
pub const MAX_CHUNK_RETRIES: u8 = 3;

/// Backoff between attempts of the same chunk
pub const CHUNK_RETRY_DELAY_MS: u32 = 200;

/// Bytes of the reset banner read for the log
pub const VERSION_TAIL_MAX: usize = 64;

/// Highest frame-buffer address reachable with a 16-bit length
pub const ADDRESS_CEILING: u32 = 0xFFFF;

/// Errors reported by the camera driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CameraError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    /// Fewer reply bytes than the frame requires, even after recovery
    #[error("reply for opcode {opcode:#04x} too short: {received}/{expected} bytes")]
    ShortResponse {
        opcode: u8,
        expected: usize,
        received: usize,
    },
    #[error("acknowledgment mismatch for opcode {opcode:#04x}: {reason}")]
    AckMismatch { opcode: u8, reason: FrameError },
    #[error("malformed length reply: {0}")]
    LengthMalformed(FrameError),
    #[error("chunk at offset {offset} failed after {attempts} attempts")]
    ChunkRetryExhausted { offset: u32, attempts: u8 },
    #[error("image of {needed} bytes does not fit in {capacity} byte buffer")]
    BufferTooSmall { needed: usize, capacity: usize },
    #[error("chunk size {0} outside 1..={max}", max = MAX_CHUNK_SIZE)]
    InvalidChunkSize(u16),
}

/// Timing and retry limits of the driver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub power_up_settle_ms: u32,
    pub command_timeout_ms: u32,
    pub capture_settle_ms: u32,
    pub response_delay_ms: u32,
    pub command_gap_ms: u32,
    pub partial_reply_delay_ms: u32,
    /// Bytes per bulk-read chunk, fixed for a whole transfer
    pub chunk_size: u16,
    pub max_chunk_retries: u8,
    pub chunk_retry_delay_ms: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            power_up_settle_ms: POWER_UP_SETTLE_MS,
            command_timeout_ms: COMMAND_TIMEOUT_MS,
            capture_settle_ms: CAPTURE_SETTLE_MS,
            response_delay_ms: RESPONSE_DELAY_MS,
            command_gap_ms: COMMAND_GAP_MS,
            partial_reply_delay_ms: PARTIAL_REPLY_DELAY_MS,
            chunk_size: CHUNK_SIZE as u16,
            max_chunk_retries: MAX_CHUNK_RETRIES,
            chunk_retry_delay_ms: CHUNK_RETRY_DELAY_MS,
        }
    }
}

/// Why one chunk attempt was rejected
#[derive(Debug, Clone, Copy)]
enum ChunkFault {
    Write(TransportError),
    Short(usize),
    Header,
    Footer,
}

impl fmt::Display for ChunkFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkFault::Write(e) => write!(f, "write failed: {}", e),
            ChunkFault::Short(received) => write!(f, "short reply ({} bytes)", received),
            ChunkFault::Header => f.write_str("bad header"),
            ChunkFault::Footer => f.write_str("bad footer"),
        }
    }
}

/// Driver for one camera module on one serial link
pub struct Camera<L> {
    link: L,
    config: CameraConfig,
}

impl<L: SerialLink> Camera<L> {
    pub fn new(link: L, config: CameraConfig) -> Self {
        Self { link, config }
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Suspend the calling task on the driver's timer
    pub async fn sleep_ms(&mut self, ms: u32) {
        self.link.delay_ms(ms).await
    }

    /// Power-up settle, then reset and confirm the module answers
    ///
    /// Not retried; a failure here means the module is absent or on a
    /// different baud rate.
    pub async fn init(&mut self) -> Result<(), CameraError> {
        info!(
            "camera: waiting {} ms for power-up",
            self.config.power_up_settle_ms
        );
        self.link.delay_ms(self.config.power_up_settle_ms).await;

        match self.exchange(Command::Reset).await {
            Ok(_) => {
                info!("camera: reset acknowledged");
                Ok(())
            }
            Err(e) => {
                error!("camera: reset failed: {}", e);
                Err(e)
            }
        }
    }

    /// Change the module's baud rate until its next power cycle
    pub async fn set_baud_temp(&mut self, code: u16) -> Result<(), CameraError> {
        debug!("camera: temporary baud code {:#06x}", code);
        self.exchange(Command::SetBaudTemp(code)).await.map(drop)
    }

    pub async fn set_size(&mut self, size: ImageSize) -> Result<(), CameraError> {
        debug!("camera: image size {:?}", size);
        self.exchange(Command::SetImageSize(size)).await.map(drop)
    }

    pub async fn set_compression(&mut self, level: u8) -> Result<(), CameraError> {
        debug!("camera: compression {:#04x}", level);
        self.exchange(Command::SetCompression(level)).await.map(drop)
    }

    /// Freeze the current frame, then let the module finish encoding it
    pub async fn take_picture(&mut self) -> Result<(), CameraError> {
        let result = self.exchange(Command::TakePicture).await.map(drop);
        debug!(
            "camera: take picture {}, settling {} ms",
            if result.is_ok() { "acknowledged" } else { "failed" },
            self.config.capture_settle_ms
        );
        // Asking for the length before the module is done returns garbage
        self.link.delay_ms(self.config.capture_settle_ms).await;
        result
    }

    /// Release the frozen frame so the next capture starts clean
    pub async fn clear_cache(&mut self) -> Result<(), CameraError> {
        let result = self.exchange(Command::ClearCache).await.map(drop);
        if let Err(e) = &result {
            warn!("camera: clear cache failed: {}", e);
        }
        result
    }

    /// Length in bytes of the frozen frame
    pub async fn get_length(&mut self) -> Result<u16, CameraError> {
        let command = Command::GetLength;
        self.link.flush();
        self.link.write(&command.encode()).await?;
        self.link.delay_ms(self.config.response_delay_ms).await;

        let mut reply = [0u8; LENGTH_REPLY_LEN];
        let mut received = self
            .link
            .read(&mut reply, self.config.command_timeout_ms)
            .await;

        // The module sometimes pauses after the first four bytes
        if received == LENGTH_REPLY_PREFIX.len() && reply[..4] == LENGTH_REPLY_PREFIX {
            debug!("camera: split length reply, reading remaining 5 bytes");
            self.link.delay_ms(self.config.partial_reply_delay_ms).await;
            received += self
                .link
                .read(&mut reply[4..], self.config.command_timeout_ms)
                .await;
        }

        if received != LENGTH_REPLY_LEN {
            error!(
                "camera: length reply short, {}/{} bytes: {}",
                received,
                LENGTH_REPLY_LEN,
                Hex(&reply[..received])
            );
            return Err(CameraError::ShortResponse {
                opcode: command.opcode(),
                expected: LENGTH_REPLY_LEN,
                received,
            });
        }

        let len = decode_length(&reply).map_err(|e| {
            error!("camera: bad length reply {}: {}", Hex(&reply), e);
            CameraError::LengthMalformed(e)
        })?;
        info!("camera: image length {} bytes", len);

        self.link.delay_ms(self.config.command_gap_ms).await;
        Ok(len)
    }

    /// Read the whole frozen frame into `buf`, returning its length
    ///
    /// On any error the contents of `buf` are unspecified and must be
    /// discarded; there is no partial success.
    pub async fn read_image(&mut self, buf: &mut [u8]) -> Result<usize, CameraError> {
        let chunk_size = self.config.chunk_size;
        if chunk_size == 0 || usize::from(chunk_size) > MAX_CHUNK_SIZE {
            return Err(CameraError::InvalidChunkSize(chunk_size));
        }

        let total = self.get_length().await?;
        let total_len = usize::from(total);
        if total == 0 {
            info!("camera: empty frame buffer, nothing to read");
            return Ok(0);
        }
        if total_len > buf.len() {
            error!(
                "camera: buffer too small, need {} have {}",
                total_len,
                buf.len()
            );
            return Err(CameraError::BufferTooSmall {
                needed: total_len,
                capacity: buf.len(),
            });
        }

        info!(
            "camera: reading {} bytes in {} byte chunks",
            total, chunk_size
        );
        for chunk in chunks(u32::from(total), chunk_size) {
            self.read_chunk(chunk, &mut buf[chunk.range()]).await?;
        }

        info!("camera: read {} bytes", total);
        Ok(total_len)
    }

    /// Read one chunk into `dest`, retrying envelope or length failures
    ///
    /// `dest` is written only after a fully validated attempt.
    async fn read_chunk(&mut self, chunk: Chunk, dest: &mut [u8]) -> Result<(), CameraError> {
        let attempts = self.config.max_chunk_retries.max(1);
        let command = Command::ReadChunk {
            offset: chunk.offset,
            len: chunk.len,
        }
        .encode();

        let mut response = [0u8; MAX_CHUNK_SIZE + ENVELOPE_OVERHEAD];
        let response = &mut response[..usize::from(chunk.len) + ENVELOPE_OVERHEAD];

        for attempt in 1..=attempts {
            if attempt > 1 {
                self.link.delay_ms(self.config.chunk_retry_delay_ms).await;
            }

            match self.chunk_attempt(&command, response).await {
                Ok(()) => {
                    let data = &response[CHUNK_ENVELOPE.len()..response.len() - CHUNK_ENVELOPE.len()];
                    dest.copy_from_slice(data);
                    check_markers(chunk, data);
                    debug!(
                        "camera: chunk offset {} len {} ok (attempt {})",
                        chunk.offset, chunk.len, attempt
                    );
                    return Ok(());
                }
                Err(fault) => warn!(
                    "camera: chunk offset {} len {} attempt {}/{} failed: {}",
                    chunk.offset, chunk.len, attempt, attempts, fault
                ),
            }
        }

        error!(
            "camera: chunk offset {} abandoned after {} attempts",
            chunk.offset, attempts
        );
        Err(CameraError::ChunkRetryExhausted {
            offset: chunk.offset,
            attempts,
        })
    }

    async fn chunk_attempt(&mut self, command: &[u8], response: &mut [u8]) -> Result<(), ChunkFault> {
        self.link.flush();
        self.link.write(command).await.map_err(ChunkFault::Write)?;

        let received = self
            .link
            .read(response, self.config.command_timeout_ms)
            .await;
        if received != response.len() {
            return Err(ChunkFault::Short(received));
        }

        let footer_at = response.len() - CHUNK_ENVELOPE.len();
        if !envelope_matches(&response[..CHUNK_ENVELOPE.len()]) {
            debug!("camera: bad chunk header {}", Hex(&response[..CHUNK_ENVELOPE.len()]));
            return Err(ChunkFault::Header);
        }
        if !envelope_matches(&response[footer_at..]) {
            debug!("camera: bad chunk footer {}", Hex(&response[footer_at..]));
            return Err(ChunkFault::Footer);
        }
        Ok(())
    }

    /// One command/acknowledgment exchange
    async fn exchange(&mut self, command: Command) -> Result<Ack, CameraError> {
        let opcode = command.opcode();
        self.link.flush();
        self.link.write(&command.encode()).await?;
        self.link.delay_ms(self.config.response_delay_ms).await;

        let mut reply = [0u8; ACK_LEN];
        let mut received = self
            .link
            .read(&mut reply, self.config.command_timeout_ms)
            .await;

        if received > 0 && received < ACK_LEN {
            debug!(
                "camera: partial ack for {:#04x} ({} bytes), reading remainder",
                opcode, received
            );
            self.link.delay_ms(self.config.partial_reply_delay_ms).await;
            received += self
                .link
                .read(&mut reply[received..], self.config.command_timeout_ms)
                .await;
        }

        if received != ACK_LEN {
            error!(
                "camera: no ack for {:#04x}, {}/{} bytes",
                opcode, received, ACK_LEN
            );
            return Err(CameraError::ShortResponse {
                opcode,
                expected: ACK_LEN,
                received,
            });
        }
        debug!("camera: ack {}", Hex(&reply));

        let result = Ack::decode(&reply, opcode).map_err(|reason| {
            error!("camera: ack check failed for {:#04x}: {}", opcode, reason);
            CameraError::AckMismatch { opcode, reason }
        });

        if command == Command::Reset {
            self.drain_version_tail().await;
        }

        self.link.delay_ms(self.config.command_gap_ms).await;
        result
    }

    /// Consume the banner the module prints after a reset
    async fn drain_version_tail(&mut self) {
        let mut banner = [0u8; VERSION_TAIL_MAX];
        let len = self
            .link
            .read(&mut banner, self.config.command_timeout_ms)
            .await;
        if len > 0 {
            match core::str::from_utf8(&banner[..len]) {
                Ok(text) => info!("camera: version {}", text.trim()),
                Err(_) => info!("camera: version ({} bytes) {}", len, Hex(&banner[..len])),
            }
        }
        self.link.flush();
    }
}

/// Best-effort JPEG marker check; never fails the transfer
fn check_markers(chunk: Chunk, data: &[u8]) {
    if data.len() < 2 {
        return;
    }
    if chunk.offset == 0 {
        if data[..2] == JPEG_SOI {
            debug!("camera: JPEG start marker present");
        } else {
            warn!(
                "camera: missing JPEG start marker, got {:02X} {:02X}",
                data[0], data[1]
            );
        }
    }
    if chunk.end() >= ADDRESS_CEILING {
        if data[data.len() - 2..] == JPEG_EOI {
            debug!("camera: JPEG end marker present");
        } else {
            warn!("camera: missing JPEG end marker at address ceiling");
        }
    }
}
