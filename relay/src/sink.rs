//! # Image Sink
//!
//! Receiving end of the packet stream: accepts connections, reassembles each
//! image from its packets and writes it to disk as
//! `<output_dir>/image_<YYYYmmdd_HHMMSS>_<n>.jpg`.
//!
//! A malformed or out-of-sequence packet closes that connection; other
//! connections are unaffected. Several images may arrive on one connection.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use camlink::packet::HEADER_LEN;
use camlink::{PacketHeader, TransferStep, TransferTracker};
use chrono::{DateTime, Local};
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;

use crate::config::SinkConfig;
use crate::RelayError;

/// File name of the `n`th image saved by this sink
pub fn image_path(dir: &Path, timestamp: DateTime<Local>, n: u64) -> PathBuf {
    dir.join(format!(
        "image_{}_{}.jpg",
        timestamp.format("%Y%m%d_%H%M%S"),
        n
    ))
}

/// Shared state of all connections
#[derive(Debug)]
struct SinkState {
    output_dir: PathBuf,
    max_image_size: u32,
    idle_timeout: Duration,
    saved: AtomicU64,
}

/// TCP server that stores received images
pub struct ImageSink {
    listener: TcpListener,
    state: Arc<SinkState>,
}

impl ImageSink {
    /// Bind the listening socket and create the output directory
    pub async fn bind(config: &SinkConfig, max_image_size: usize) -> Result<Self, RelayError> {
        tokio::fs::create_dir_all(&config.output_dir).await?;
        let listener = TcpListener::bind(&config.bind).await?;
        info!(
            "sink: listening on {}, saving to {}",
            listener.local_addr()?,
            config.output_dir.display()
        );

        Ok(Self {
            listener,
            state: Arc::new(SinkState {
                output_dir: config.output_dir.clone(),
                max_image_size: u32::try_from(max_image_size).unwrap_or(u32::MAX),
                idle_timeout: Duration::from_millis(config.idle_timeout_ms),
                saved: AtomicU64::new(0),
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Images written since start
    pub fn saved(&self) -> u64 {
        self.state.saved.load(Ordering::Relaxed)
    }

    /// Accept connections forever, one task each
    pub async fn run(self) -> Result<(), RelayError> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("sink: accept failed: {}", e);
                    continue;
                }
            };
            info!("sink: connection from {}", peer);

            let state = self.state.clone();
            tokio::spawn(async move {
                match receive_images(stream, &state).await {
                    Ok(count) => info!("sink: {} closed, {} images", peer, count),
                    Err(e) => error!("sink: {} dropped: {}", peer, e),
                }
            });
        }
    }
}

/// Read one exact-size block, `Ok(false)` on a clean end of stream
async fn read_block<R>(reader: &mut R, buf: &mut [u8], idle: Duration) -> Result<bool, RelayError>
where
    R: AsyncRead + Unpin,
{
    match tokio::time::timeout(idle, reader.read_exact(buf)).await {
        Ok(Ok(_)) => Ok(true),
        Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "receive timed out").into()),
    }
}

/// Receive images from one connection until it closes
///
/// Returns the number of images saved.
async fn receive_images<R>(mut reader: R, state: &SinkState) -> Result<u64, RelayError>
where
    R: AsyncRead + Unpin,
{
    let mut tracker = TransferTracker::new(state.max_image_size);
    let mut image: Vec<u8> = Vec::new();
    let mut header = [0u8; HEADER_LEN];
    let mut started = Local::now();
    let mut count = 0;

    loop {
        if !read_block(&mut reader, &mut header, state.idle_timeout).await? {
            if tracker.in_progress() {
                warn!(
                    "sink: stream ended mid-image, {} bytes discarded",
                    tracker.received()
                );
            }
            return Ok(count);
        }

        let packet = PacketHeader::decode(&header)?;
        let step = tracker.accept(&packet)?;
        if packet.offset == 0 {
            image.clear();
            image.reserve(packet.total_size as usize);
            started = Local::now();
        }

        let start = image.len();
        image.resize(start + usize::from(packet.chunk_size), 0);
        if !read_block(&mut reader, &mut image[start..], state.idle_timeout).await? {
            warn!("sink: stream ended inside a payload at offset {}", packet.offset);
            return Ok(count);
        }
        debug!(
            "sink: {}/{} bytes ({}%)",
            packet.end(),
            packet.total_size,
            u64::from(packet.end()) * 100 / u64::from(packet.total_size)
        );

        if let TransferStep::Complete { total } = step {
            let n = state.saved.fetch_add(1, Ordering::Relaxed) + 1;
            let path = image_path(&state.output_dir, started, n);
            // Readers never see a partially written image
            let partial = path.with_extension("jpg.part");
            tokio::fs::write(&partial, &image).await?;
            tokio::fs::rename(&partial, &path).await?;
            info!("sink: saved {} ({} bytes)", path.display(), total);
            count += 1;
            image.clear();
        }
    }
}
