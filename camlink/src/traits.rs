//! # Hardware & Network Seams
//!
//! The core never talks to a peripheral or a TCP/IP stack directly. It goes
//! through the traits in this module, so the driver and task code can run on
//! an embedded executor, on a host with tokio, or against test doubles:
//!
//! - [`Timer`]: monotonic milliseconds plus an async delay
//! - [`SerialLink`]: the UART contract the camera driver relies on
//! - [`Connector`]: opens one TCP connection per image and closes it
//!
//! Serial TX and TCP connections are plain [`embedded_io_async::Write`]
//! implementations.

use core::future::Future;

use embedded_io_async::Write;

use crate::task::SocketOptions;
use crate::transport::TransportError;

/// Monotonic time source and task-level delay
///
/// Delays suspend only the calling task, never the interrupt producer.
pub trait Timer {
    /// Milliseconds since an arbitrary, fixed epoch
    fn now_ms(&self) -> u64;

    /// Suspend the calling task for `ms` milliseconds
    fn delay_ms(&mut self, ms: u32) -> impl Future<Output = ()>;
}

/// Byte-oriented serial link as seen by the camera driver
///
/// [`crate::UartTransport`] is the production implementation.
pub trait SerialLink {
    /// Write all of `bytes`; a short write is an error
    fn write(&mut self, bytes: &[u8]) -> impl Future<Output = Result<(), TransportError>>;

    /// Fill up to `buf.len()` bytes within `timeout_ms`
    ///
    /// Returns the count obtained. A short count is not an error at this
    /// layer; the caller decides whether to retry or abort.
    fn read(&mut self, buf: &mut [u8], timeout_ms: u32) -> impl Future<Output = usize>;

    /// Discard every received byte not yet read
    fn flush(&mut self);

    /// Suspend the calling task for `ms` milliseconds
    fn delay_ms(&mut self, ms: u32) -> impl Future<Output = ()>;
}

/// Opens TCP connections to the image server
///
/// The server address belongs to the implementation; the core only supplies
/// the per-connection socket policy.
pub trait Connector {
    /// An open connection; dropping it must release the socket
    type Connection: Write;

    /// Connection failure, logged by the network task
    type Error: core::fmt::Debug;

    /// Connect and apply `options` (keep-alive and timeouts)
    fn connect(
        &mut self,
        options: &SocketOptions,
    ) -> impl Future<Output = Result<Self::Connection, Self::Error>>;

    /// Close a connection, successful transfer or not
    fn close(&mut self, connection: Self::Connection) -> impl Future<Output = ()>;
}
