//! # Capture & Network Tasks
//!
//! The two long-running loops of the pipeline. They share nothing but the
//! [`Mailbox`]:
//!
//! ```text
//! capture_task                               network_task
//! ────────────                               ────────────
//! init (once)                                loop {
//! loop {                                       take ◄── mailbox
//!   take_picture ─ fail ─► clear, cooldown     connect + keep-alive
//!   read_image into scratch                    for chunk { header, payload, pace }
//!   copy into B ──► publish ──► mailbox        close, release buffer
//!   clear_cache                                post-send delay
//!   wait capture interval                    }
//! }
//! ```
//!
//! Failures at this level are logged and the loop carries on with the next
//! cycle or image. Only a failed camera init ends the capture task.

use core::convert::Infallible;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_io_async::Write;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::camera::{Camera, CameraError};
use crate::chunk::chunks;
use crate::command::ImageSize;
use crate::mailbox::Mailbox;
use crate::packet::{PacketHeader, HEADER_LEN};
use crate::traits::{Connector, SerialLink, Timer};
use crate::{CHUNK_SIZE, MAX_CHUNK_SIZE};

/// Wait between capture cycles
pub const CAPTURE_INTERVAL_MS: u32 = 60_000;

/// Wait after a failed take-picture before trying again
pub const FAILURE_COOLDOWN_MS: u32 = 2000;

/// Gap between consecutive chunk packets
pub const SEND_PACING_MS: u32 = 50;

/// Wait after each image, sent or not, before taking the next
pub const POST_SEND_DELAY_MS: u32 = 1000;

pub const KEEPALIVE_IDLE_S: u32 = 10;
pub const KEEPALIVE_INTERVAL_S: u32 = 5;
pub const KEEPALIVE_COUNT: u32 = 3;

/// Send and receive timeout applied to every connection
pub const SOCKET_TIMEOUT_MS: u32 = 5000;

/// Per-connection socket policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketOptions {
    pub keepalive: bool,
    pub keepalive_idle_s: u32,
    pub keepalive_interval_s: u32,
    pub keepalive_count: u32,
    pub send_timeout_ms: u32,
    pub recv_timeout_ms: u32,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            keepalive: true,
            keepalive_idle_s: KEEPALIVE_IDLE_S,
            keepalive_interval_s: KEEPALIVE_INTERVAL_S,
            keepalive_count: KEEPALIVE_COUNT,
            send_timeout_ms: SOCKET_TIMEOUT_MS,
            recv_timeout_ms: SOCKET_TIMEOUT_MS,
        }
    }
}

/// Network task settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Payload bytes per packet
    pub chunk_size: u16,
    pub pacing_ms: u32,
    pub post_send_delay_ms: u32,
    pub socket: SocketOptions,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE as u16,
            pacing_ms: SEND_PACING_MS,
            post_send_delay_ms: POST_SEND_DELAY_MS,
            socket: SocketOptions::default(),
        }
    }
}

/// Capture task settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub capture_interval_ms: u32,
    pub failure_cooldown_ms: u32,
    /// Resolution applied once after init; module default when unset
    pub image_size: Option<ImageSize>,
    /// Compression level applied once after init; module default when unset
    pub compression: Option<u8>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            capture_interval_ms: CAPTURE_INTERVAL_MS,
            failure_cooldown_ms: FAILURE_COOLDOWN_MS,
            image_size: None,
            compression: None,
        }
    }
}

/// Errors while streaming one image to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SendError {
    #[error("connection to server failed")]
    Connect,
    #[error("header write truncated at offset {offset}")]
    HeaderTruncated { offset: u32 },
    #[error("payload write truncated at offset {offset}")]
    PayloadTruncated { offset: u32 },
    #[error("socket error at offset {offset}: {kind:?}")]
    Io {
        offset: u32,
        kind: embedded_io::ErrorKind,
    },
    #[error("image of {0} bytes cannot be framed")]
    TooLarge(usize),
    #[error("chunk size {0} outside 1..={max}", max = MAX_CHUNK_SIZE)]
    InvalidChunkSize(u16),
}

/// Result of one capture cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// An image was handed to the mailbox
    Published { len: usize, replaced: bool },
    /// The module reported an empty frame buffer
    Empty,
    /// The image was read but no buffer could be allocated for it
    Dropped { len: usize },
    /// Take-picture failed; the next attempt waits the failure cooldown
    CaptureFailed(CameraError),
    /// Length query or bulk read failed
    ReadFailed(CameraError),
}

impl CycleOutcome {
    /// Wait before the next cycle
    pub fn pause_ms(&self, config: &CaptureConfig) -> u32 {
        match self {
            CycleOutcome::CaptureFailed(_) => config.failure_cooldown_ms,
            _ => config.capture_interval_ms,
        }
    }
}

/// One capture cycle: freeze, read, publish, clear the module's cache
///
/// `scratch` receives the raw image and bounds its size. The published
/// buffer is a fresh `B` built from the valid bytes.
pub async fn capture_cycle<L, M, B>(
    camera: &mut Camera<L>,
    mailbox: &Mailbox<M, B>,
    scratch: &mut [u8],
) -> CycleOutcome
where
    L: SerialLink,
    M: RawMutex,
    B: for<'a> TryFrom<&'a [u8]>,
{
    if let Err(e) = camera.take_picture().await {
        error!("capture: take picture failed: {}", e);
        let _ = camera.clear_cache().await;
        return CycleOutcome::CaptureFailed(e);
    }

    let outcome = match camera.read_image(scratch).await {
        Ok(0) => {
            warn!("capture: module returned an empty image");
            CycleOutcome::Empty
        }
        Ok(len) => match B::try_from(&scratch[..len]) {
            Ok(buffer) => {
                let replaced = mailbox.publish(buffer, len);
                info!("capture: published {} byte image", len);
                CycleOutcome::Published { len, replaced }
            }
            Err(_) => {
                error!("capture: no buffer for {} byte image, dropped", len);
                CycleOutcome::Dropped { len }
            }
        },
        Err(e) => {
            error!("capture: image read failed: {}", e);
            CycleOutcome::ReadFailed(e)
        }
    };

    // Leaves the module ready for the next frame whatever happened above
    let _ = camera.clear_cache().await;
    outcome
}

/// Capture loop: init the camera once, then capture forever
///
/// Returns only if the camera does not come up.
pub async fn capture_task<L, M, B>(
    mut camera: Camera<L>,
    mailbox: &Mailbox<M, B>,
    scratch: &mut [u8],
    config: CaptureConfig,
) -> Result<Infallible, CameraError>
where
    L: SerialLink,
    M: RawMutex,
    B: for<'a> TryFrom<&'a [u8]>,
{
    info!("capture: task started, scratch buffer {} bytes", scratch.len());
    camera.init().await?;

    if let Some(size) = config.image_size {
        if let Err(e) = camera.set_size(size).await {
            warn!("capture: set image size failed: {}", e);
        }
    }
    if let Some(level) = config.compression {
        if let Err(e) = camera.set_compression(level).await {
            warn!("capture: set compression failed: {}", e);
        }
    }

    let mut cycle: u32 = 0;
    loop {
        cycle = cycle.wrapping_add(1);
        debug!("capture: cycle {} starting", cycle);

        let outcome = capture_cycle(&mut camera, mailbox, scratch).await;
        let pause = outcome.pause_ms(&config);
        debug!("capture: cycle {} {:?}, next in {} ms", cycle, outcome, pause);
        camera.sleep_ms(pause).await;
    }
}

/// Stream one image over a fresh connection
///
/// The connection is closed on every path once it was opened.
pub async fn send_image<C, D>(
    connector: &mut C,
    timer: &mut D,
    config: &NetworkConfig,
    image: &[u8],
) -> Result<(), SendError>
where
    C: Connector,
    D: Timer,
{
    if config.chunk_size == 0 || usize::from(config.chunk_size) > MAX_CHUNK_SIZE {
        return Err(SendError::InvalidChunkSize(config.chunk_size));
    }
    let total = u32::try_from(image.len()).map_err(|_| SendError::TooLarge(image.len()))?;

    let mut connection = connector.connect(&config.socket).await.map_err(|e| {
        error!("net: connect failed: {:?}", e);
        SendError::Connect
    })?;
    debug!("net: connected, sending {} bytes", total);

    let result = stream_chunks(&mut connection, timer, config, image, total).await;
    connector.close(connection).await;
    result
}

async fn stream_chunks<W, D>(
    connection: &mut W,
    timer: &mut D,
    config: &NetworkConfig,
    image: &[u8],
    total: u32,
) -> Result<(), SendError>
where
    W: Write,
    D: Timer,
{
    for chunk in chunks(total, config.chunk_size) {
        let header = PacketHeader::for_chunk(total, &chunk).encode();
        let offset = chunk.offset;
        let io = |e: W::Error| SendError::Io {
            offset,
            kind: embedded_io::Error::kind(&e),
        };

        let sent = connection.write(&header).await.map_err(io)?;
        if sent != HEADER_LEN {
            error!("net: header truncated at offset {}, {}/{}", offset, sent, HEADER_LEN);
            return Err(SendError::HeaderTruncated { offset });
        }

        let payload = &image[chunk.range()];
        let sent = connection.write(payload).await.map_err(io)?;
        if sent != payload.len() {
            error!(
                "net: payload truncated at offset {}, {}/{}",
                offset,
                sent,
                payload.len()
            );
            return Err(SendError::PayloadTruncated { offset });
        }

        debug!("net: sent {}/{} bytes", chunk.end(), total);
        if !chunk.is_last {
            timer.delay_ms(config.pacing_ms).await;
        }
    }
    info!("net: image of {} bytes sent", total);
    Ok(())
}

/// Take the next image and send it
///
/// Returns `None` when the wake found nothing to send. The image buffer is
/// released before the post-send delay, whatever the outcome.
pub async fn deliver_next<M, B, C, D>(
    mailbox: &Mailbox<M, B>,
    connector: &mut C,
    timer: &mut D,
    config: &NetworkConfig,
) -> Option<Result<(), SendError>>
where
    M: RawMutex,
    B: AsRef<[u8]>,
    C: Connector,
    D: Timer,
{
    let record = match mailbox.take().await {
        Some(record) if record.len > 0 => record,
        Some(_) => {
            warn!("net: skipping empty image");
            return None;
        }
        None => {
            debug!("net: woken with empty mailbox");
            return None;
        }
    };

    let result = send_image(connector, timer, config, record.bytes()).await;
    if let Err(e) = &result {
        error!("net: sending {} byte image failed: {}", record.len, e);
    }
    drop(record);

    timer.delay_ms(config.post_send_delay_ms).await;
    Some(result)
}

/// Network loop: deliver images as they are published
pub async fn network_task<M, B, C, D>(
    mailbox: &Mailbox<M, B>,
    mut connector: C,
    mut timer: D,
    config: NetworkConfig,
) -> Infallible
where
    M: RawMutex,
    B: AsRef<[u8]>,
    C: Connector,
    D: Timer,
{
    info!(
        "net: task started, {} byte chunks, {} ms pacing",
        config.chunk_size, config.pacing_ms
    );
    let (mut sent, mut failed) = (0u32, 0u32);
    loop {
        match deliver_next(mailbox, &mut connector, &mut timer, &config).await {
            Some(Ok(())) => sent = sent.wrapping_add(1),
            Some(Err(_)) => failed = failed.wrapping_add(1),
            None => continue,
        }
        debug!("net: {} images sent, {} failed", sent, failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::opcode;
    use crate::packet::{TransferStep, TransferTracker};
    use crate::testutil::{
        fake_camera, jpeg_image, FakeModule, RecordingConnector, TestTimer, TrackedBuffer,
    };
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use std::vec::Vec;

    type TestMailbox<B> = Mailbox<CriticalSectionRawMutex, B>;

    /// Rebuild the image from alternating header / payload writes
    fn reassemble(writes: &[Vec<u8>]) -> (Vec<u8>, usize) {
        let mut tracker = TransferTracker::new(u32::MAX);
        let mut image = Vec::new();
        let mut last_flags = 0;
        for pair in writes.chunks(2) {
            let header = PacketHeader::decode(&pair[0]).unwrap();
            assert_eq!(usize::from(header.chunk_size), pair[1].len());
            assert_eq!(header.offset as usize, image.len());
            image.extend_from_slice(&pair[1]);
            if header.is_last {
                last_flags += 1;
                assert_eq!(header.end(), header.total_size);
            }
            let step = tracker.accept(&header).unwrap();
            assert_eq!(step == TransferStep::Continue, !header.is_last);
        }
        (image, last_flags)
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_image_framing() {
        let image = jpeg_image(600);
        let mut connector = RecordingConnector::default();

        send_image(&mut connector, &mut TestTimer::new(), &NetworkConfig::default(), &image)
            .await
            .unwrap();

        let writes = connector.writes(0);
        assert_eq!(writes.len(), 6, "header and payload per chunk");
        let (rebuilt, last_flags) = reassemble(&writes);
        assert_eq!(rebuilt, image);
        assert_eq!(last_flags, 1);
        assert_eq!(connector.recorded.lock().unwrap().closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_image_paces_chunks() {
        let image = jpeg_image(1024);
        let mut connector = RecordingConnector::default();
        let timer = TestTimer::new();

        send_image(&mut connector, &mut TestTimer::new(), &NetworkConfig::default(), &image)
            .await
            .unwrap();
        // Four chunks, a pacing gap between each pair
        assert_eq!(timer.now_ms(), 3 * u64::from(SEND_PACING_MS));
    }

    #[tokio::test(start_paused = true)]
    async fn test_truncated_payload_aborts_transfer() {
        let image = jpeg_image(600);
        let mut connector = RecordingConnector {
            accept_bytes: Some(HEADER_LEN + 256 + HEADER_LEN + 100),
            ..RecordingConnector::default()
        };

        let result =
            send_image(&mut connector, &mut TestTimer::new(), &NetworkConfig::default(), &image)
                .await;

        assert_eq!(result, Err(SendError::PayloadTruncated { offset: 256 }));
        assert_eq!(connector.writes(0).len(), 4, "no writes after the failure");
        assert_eq!(connector.recorded.lock().unwrap().closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_truncated_header_aborts_transfer() {
        let mut connector = RecordingConnector {
            accept_bytes: Some(5),
            ..RecordingConnector::default()
        };

        let result = send_image(
            &mut connector,
            &mut TestTimer::new(),
            &NetworkConfig::default(),
            &jpeg_image(100),
        )
        .await;

        assert_eq!(result, Err(SendError::HeaderTruncated { offset: 0 }));
        assert_eq!(connector.recorded.lock().unwrap().closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_delivery_releases_buffer() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mailbox: TestMailbox<TrackedBuffer> = Mailbox::new();
        mailbox.publish(TrackedBuffer::new(300, &drops), 300);

        let mut connector = RecordingConnector {
            refuse: true,
            ..RecordingConnector::default()
        };
        let result = deliver_next(
            &mailbox,
            &mut connector,
            &mut TestTimer::new(),
            &NetworkConfig::default(),
        )
        .await;

        assert_eq!(result, Some(Err(SendError::Connect)));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(connector.recorded.lock().unwrap().refused, 1);
        assert_eq!(connector.recorded.lock().unwrap().closed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_cycle_publishes_image() {
        let image = jpeg_image(700);
        let (module, handle) = FakeModule::new(image.clone());
        let mut camera = fake_camera(module);
        let mailbox: TestMailbox<Vec<u8>> = Mailbox::new();
        let mut scratch = std::vec![0u8; 4096];

        let outcome = capture_cycle(&mut camera, &mailbox, &mut scratch).await;

        assert_eq!(
            outcome,
            CycleOutcome::Published {
                len: 700,
                replaced: false
            }
        );
        let record = mailbox.try_take().unwrap();
        assert_eq!(record.bytes(), image.as_slice());
        assert_eq!(
            handle.opcodes(),
            std::vec![
                opcode::FBUF_CTRL,
                opcode::GET_FBUF_LEN,
                opcode::READ_FBUF,
                opcode::READ_FBUF,
                opcode::READ_FBUF,
                opcode::FBUF_CTRL,
            ]
        );
        assert_eq!(handle.commands()[5], [0x56, 0x00, 0x36, 0x01, 0x03]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_failure_clears_cache_and_cools_down() {
        let (module, handle) = FakeModule::new(jpeg_image(100));
        handle.update(|s| s.wrong_ack_opcode = true);
        let mut camera = fake_camera(module);
        let mailbox: TestMailbox<Vec<u8>> = Mailbox::new();
        let mut scratch = std::vec![0u8; 1024];

        let outcome = capture_cycle(&mut camera, &mailbox, &mut scratch).await;

        assert!(matches!(outcome, CycleOutcome::CaptureFailed(_)));
        assert_eq!(outcome.pause_ms(&CaptureConfig::default()), FAILURE_COOLDOWN_MS);
        assert_eq!(handle.opcodes(), std::vec![opcode::FBUF_CTRL, opcode::FBUF_CTRL]);
        assert!(!mailbox.is_occupied());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_failure_publishes_nothing() {
        let (module, handle) = FakeModule::new(jpeg_image(100));
        handle.update(|s| s.corrupt_footers = 3);
        let mut camera = fake_camera(module);
        let mailbox: TestMailbox<Vec<u8>> = Mailbox::new();
        let mut scratch = std::vec![0u8; 1024];

        let outcome = capture_cycle(&mut camera, &mailbox, &mut scratch).await;

        assert!(matches!(
            outcome,
            CycleOutcome::ReadFailed(CameraError::ChunkRetryExhausted { offset: 0, .. })
        ));
        assert_eq!(outcome.pause_ms(&CaptureConfig::default()), CAPTURE_INTERVAL_MS);
        assert!(!mailbox.is_occupied());
        assert_eq!(handle.opcodes().last(), Some(&opcode::FBUF_CTRL));
    }

    #[tokio::test(start_paused = true)]
    async fn test_image_without_buffer_is_dropped() {
        let (module, handle) = FakeModule::new(jpeg_image(700));
        let mut camera = fake_camera(module);
        let mailbox: TestMailbox<heapless::Vec<u8, 64>> = Mailbox::new();
        let mut scratch = std::vec![0u8; 1024];

        let outcome = capture_cycle(&mut camera, &mailbox, &mut scratch).await;

        assert_eq!(outcome, CycleOutcome::Dropped { len: 700 });
        assert!(!mailbox.is_occupied());
        assert_eq!(handle.opcodes().last(), Some(&opcode::FBUF_CTRL));
        assert_eq!(handle.commands().last().unwrap(), &[0x56, 0x00, 0x36, 0x01, 0x03]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bad_chunk_size_opens_no_connection() {
        for chunk_size in [0, 2048] {
            let mut connector = RecordingConnector::default();
            let config = NetworkConfig {
                chunk_size,
                ..NetworkConfig::default()
            };

            let result =
                send_image(&mut connector, &mut TestTimer::new(), &config, &jpeg_image(600)).await;

            assert_eq!(result, Err(SendError::InvalidChunkSize(chunk_size)));
            let recorded = connector.recorded.lock().unwrap();
            assert!(recorded.connections.is_empty());
            assert_eq!(recorded.refused, 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_delivers_captured_images() {
        let image = jpeg_image(900);
        let (module, handle) = FakeModule::new(image.clone());
        let camera = fake_camera(module);
        let mailbox: TestMailbox<Vec<u8>> = Mailbox::new();
        let mut scratch = std::vec![0u8; 4096];
        let connector = RecordingConnector::default();
        let capture_config = CaptureConfig {
            image_size: Some(ImageSize::Qvga),
            ..CaptureConfig::default()
        };

        let capture = capture_task(camera, &mailbox, &mut scratch, capture_config);
        let network = network_task(
            &mailbox,
            connector.clone(),
            TestTimer::new(),
            NetworkConfig::default(),
        );
        // Two capture intervals of virtual time
        let run = embassy_futures::join::join(capture, network);
        assert!(tokio::time::timeout(Duration::from_secs(130), run)
            .await
            .is_err());

        let recorded = connector.recorded.lock().unwrap().connections.len();
        assert!(recorded >= 2, "{recorded} images delivered");
        for n in 0..recorded {
            let (rebuilt, last_flags) = reassemble(&connector.writes(n));
            assert_eq!(rebuilt, image);
            assert_eq!(last_flags, 1);
        }
        assert_eq!(handle.opcodes()[..2], [opcode::RESET, opcode::WRITE_DATA]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_task_stops_when_camera_absent() {
        let (module, handle) = FakeModule::new(Vec::new());
        handle.update(|s| s.silent = true);
        let camera = fake_camera(module);
        let mailbox: TestMailbox<Vec<u8>> = Mailbox::new();
        let mut scratch = std::vec![0u8; 64];

        let result = capture_task(camera, &mailbox, &mut scratch, CaptureConfig::default()).await;
        assert!(matches!(result, Err(CameraError::ShortResponse { .. })));
        assert_eq!(handle.opcodes(), std::vec![opcode::RESET]);
    }
}
