//! # UART Transport
//!
//! Blocking writes to the camera module and deadline-bounded reads from the
//! interrupt-fed [`ByteQueue`]. The transport knows nothing about the camera
//! protocol.
//!
//! ## Read Timeout Policy
//!
//! ```text
//!  start                                       start + timeout_ms
//!    │◄──────────────── overall deadline ──────────────►│
//!    │  b b b b        (silence ≥ inactivity) ──► abort  │
//!    │  each wait is one ≤ poll_slice_ms slice of the    │
//!    │  remaining budget, then both limits are re-checked│
//! ```
//!
//! A read ends when the buffer is full, the overall deadline passes, or no
//! byte has arrived for [`INACTIVITY_TIMEOUT_MS`]. A short result is returned
//! as a count, never as an error.

use core::fmt;

use embassy_futures::select::{select, Either};
use embedded_io_async::Write;
use log::{debug, error, trace};
use serde::{Deserialize, Serialize};

use crate::queue::{ByteQueue, QueueStats};
use crate::traits::{SerialLink, Timer};

/// Silence after which a read gives up even if its deadline has not passed
pub const INACTIVITY_TIMEOUT_MS: u32 = 500;

/// Longest single wait on the byte queue before re-checking the timeouts
pub const POLL_SLICE_MS: u32 = 10;

/// Bytes shown by hex dumps in the logs
const HEX_DUMP_LIMIT: usize = 32;

/// Errors reported by the UART transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// An operation was attempted before [`UartTransport::init`]
    #[error("UART not initialized")]
    NotInitialized,
    /// The hardware accepted fewer bytes than requested
    #[error("write truncated: {written} of {expected} bytes accepted")]
    WriteTruncated { expected: usize, written: usize },
    /// The serial driver reported an error
    #[error("UART I/O error: {0:?}")]
    Io(embedded_io::ErrorKind),
}

/// Timing limits of the transport read loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Abort a read after this much silence
    pub inactivity_timeout_ms: u32,
    /// Upper bound of one wait on the byte queue
    pub poll_slice_ms: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_ms: INACTIVITY_TIMEOUT_MS,
            poll_slice_ms: POLL_SLICE_MS,
        }
    }
}

/// Why a read returned early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadEnd {
    Complete,
    Deadline,
    Inactivity,
}

/// UART transport over an interrupt-fed receive queue
///
/// `T` is the transmit half of the UART, `D` the timer. The receive half is
/// the shared [`ByteQueue`] filled by the interrupt handler.
pub struct UartTransport<'q, T, D, const N: usize> {
    rx: &'q ByteQueue<N>,
    tx: Option<T>,
    timer: D,
    config: TransportConfig,
}

impl<'q, T, D, const N: usize> UartTransport<'q, T, D, N>
where
    T: Write,
    D: Timer,
{
    /// Create a transport that is not yet attached to the UART transmitter
    pub fn new(rx: &'q ByteQueue<N>, timer: D, config: TransportConfig) -> Self {
        Self {
            rx,
            tx: None,
            timer,
            config,
        }
    }

    /// Attach the transmit half and start from an empty receive queue
    pub fn init(&mut self, tx: T) {
        if self.tx.is_some() {
            debug!("uart: already initialized");
            return;
        }
        let stale = self.rx.reset();
        debug!(
            "uart: initialized, rx queue {} bytes, {} stale bytes dropped",
            self.rx.capacity(),
            stale
        );
        self.tx = Some(tx);
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.tx.is_some()
    }

    /// Receive counters maintained by the interrupt producer
    pub fn stats(&self) -> QueueStats {
        self.rx.stats()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    fn elapsed_since(&self, start: u64) -> u64 {
        self.timer.now_ms().saturating_sub(start)
    }
}

impl<'q, T, D, const N: usize> SerialLink for UartTransport<'q, T, D, N>
where
    T: Write,
    D: Timer,
{
    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let tx = self.tx.as_mut().ok_or_else(|| {
            error!("uart: write before init");
            TransportError::NotInitialized
        })?;

        trace!("uart: TX {} bytes: {}", bytes.len(), Hex(bytes));
        let written = tx
            .write(bytes)
            .await
            .map_err(|e| TransportError::Io(embedded_io::Error::kind(&e)))?;

        if written != bytes.len() {
            error!("uart: write truncated, {}/{} bytes", written, bytes.len());
            return Err(TransportError::WriteTruncated {
                expected: bytes.len(),
                written,
            });
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], timeout_ms: u32) -> usize {
        if self.tx.is_none() {
            error!("uart: read before init");
            return 0;
        }

        let rx = self.rx;
        let deadline = u64::from(timeout_ms);
        let inactivity = u64::from(self.config.inactivity_timeout_ms);
        let start = self.timer.now_ms();
        let mut last_rx = start;
        let mut count = 0;

        let end = loop {
            if count == buf.len() {
                break ReadEnd::Complete;
            }
            let elapsed = self.elapsed_since(start);
            if elapsed >= deadline {
                break ReadEnd::Deadline;
            }

            let slice = (deadline - elapsed).min(u64::from(self.config.poll_slice_ms)) as u32;
            match select(rx.pop_wait(), self.timer.delay_ms(slice)).await {
                Either::First(byte) => {
                    buf[count] = byte;
                    count += 1;
                    last_rx = self.timer.now_ms();
                }
                Either::Second(()) => {
                    if self.elapsed_since(last_rx) >= inactivity {
                        break ReadEnd::Inactivity;
                    }
                }
            }
        };

        match end {
            ReadEnd::Complete => trace!("uart: RX {} bytes: {}", count, Hex(&buf[..count])),
            ReadEnd::Deadline | ReadEnd::Inactivity => {
                debug!(
                    "uart: read {:?} timeout after {} ms, {}/{} bytes: {}",
                    end,
                    self.elapsed_since(start),
                    count,
                    buf.len(),
                    Hex(&buf[..count])
                );
                let stats = rx.stats();
                debug!(
                    "uart: RX stats total={} overflow={}",
                    stats.received, stats.overflows
                );
            }
        }
        count
    }

    fn flush(&mut self) {
        if self.tx.is_none() {
            return;
        }
        let dropped = self.rx.reset();
        if dropped > 0 {
            debug!("uart: flushed {} stale bytes", dropped);
        }
    }

    async fn delay_ms(&mut self, ms: u32) {
        self.timer.delay_ms(ms).await
    }
}

/// Hex rendering of the first bytes of a buffer, for log lines
pub struct Hex<'a>(pub &'a [u8]);

impl fmt::Display for Hex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().take(HEX_DUMP_LIMIT).enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        if self.0.len() > HEX_DUMP_LIMIT {
            f.write_str(" ...")?;
        }
        Ok(())
    }
}
