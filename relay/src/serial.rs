//! # Serial Port Backend
//!
//! Host stand-ins for the UART peripheral:
//!
//! - [`RxPump`]: a thread that drains the port into the [`ByteQueue`],
//!   doing what the receive interrupt does on a microcontroller
//! - [`SerialTx`]: the transmit half, an [`embedded_io_async::Write`] over a
//!   blocking `std::io::Write`
//!
//! Both halves share one port through [`serialport::SerialPort::try_clone`].

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use camlink::ByteQueue;
use log::{debug, error, info, warn};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::config::{SerialConfig, SERIAL_POLL_MS};
use crate::RelayError;

/// Bytes moved from the port per read call
const PUMP_READ_SIZE: usize = 256;

/// Back-off after a hard read error
const PUMP_ERROR_BACKOFF_MS: u64 = 100;

/// Open the camera's serial port as 8N1 without flow control
pub fn open_port(config: &SerialConfig) -> Result<Box<dyn SerialPort>, RelayError> {
    let port = serialport::new(&config.port, config.baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(Duration::from_millis(SERIAL_POLL_MS))
        .open()?;

    info!(
        "serial: opened {} at {} baud",
        config.port, config.baud_rate
    );
    Ok(port)
}

/// Receive pump thread feeding a [`ByteQueue`]
///
/// Stops and joins on drop.
pub struct RxPump {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RxPump {
    /// Start pumping `reader` into `queue`
    ///
    /// `reader` must time out periodically (the serial port's read timeout)
    /// so the thread notices a stop request.
    pub fn spawn<R, const N: usize>(reader: R, queue: &'static ByteQueue<N>) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let handle = thread::Builder::new()
            .name("uart-rx".to_string())
            .spawn(move || pump(reader, queue, &flag))?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Ask the thread to exit and wait for it
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("serial: rx pump panicked");
            }
        }
    }
}

impl Drop for RxPump {
    fn drop(&mut self) {
        self.stop();
    }
}

fn pump<R: Read, const N: usize>(mut reader: R, queue: &ByteQueue<N>, stop: &AtomicBool) {
    debug!("serial: rx pump started");
    let mut buf = [0u8; PUMP_READ_SIZE];
    let mut last_overflows = 0;

    while !stop.load(Ordering::Acquire) {
        match reader.read(&mut buf) {
            Ok(0) => {
                info!("serial: port closed");
                break;
            }
            Ok(n) => {
                queue.push_slice(&buf[..n]);
                let overflows = queue.stats().overflows;
                if overflows != last_overflows {
                    warn!("serial: rx queue overflow, {} bytes dropped so far", overflows);
                    last_overflows = overflows;
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                error!("serial: read failed: {}", e);
                thread::sleep(Duration::from_millis(PUMP_ERROR_BACKOFF_MS));
            }
        }
    }
    debug!("serial: rx pump stopped");
}

/// Transmit half of the port
pub struct SerialTx<W> {
    port: W,
}

impl<W: io::Write> SerialTx<W> {
    pub fn new(port: W) -> Self {
        Self { port }
    }

    pub fn into_inner(self) -> W {
        self.port
    }
}

impl<W> embedded_io_async::ErrorType for SerialTx<W> {
    type Error = io::Error;
}

impl<W: io::Write> embedded_io_async::Write for SerialTx<W> {
    /// Blocks until the whole frame is handed to the driver
    async fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(buf.len())
    }
}
