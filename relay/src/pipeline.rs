//! # Pipeline Startup
//!
//! Creates the single instances the tasks share (receive queue, mailbox) and
//! starts the capture and network tasks, each on its own thread with a
//! current-thread tokio runtime. Nothing here is global: the queue is leaked
//! once to obtain the `'static` lifetime an interrupt producer requires, and
//! the mailbox is shared by `Arc`.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use camlink::{
    capture_task, network_task, ByteQueue, Camera, Connector, Mailbox, QueueStats, UartTransport,
    RX_QUEUE_SIZE,
};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embedded_io_async::Write;
use log::{error, info};

use crate::config::RelayConfig;
use crate::net::TcpConnector;
use crate::serial::{open_port, RxPump, SerialTx};
use crate::timer::TokioTimer;
use crate::RelayError;

/// Mailbox type shared by the host tasks
pub type RelayMailbox = Mailbox<CriticalSectionRawMutex, Vec<u8>>;

/// Receive queue type fed by the pump thread
pub type RxQueue = ByteQueue<RX_QUEUE_SIZE>;

/// Handles to a running pipeline
pub struct Pipeline {
    queue: &'static RxQueue,
    mailbox: Arc<RelayMailbox>,
    capture: JoinHandle<Result<(), RelayError>>,
    network: JoinHandle<Result<(), RelayError>>,
    rx_pump: Option<RxPump>,
}

impl Pipeline {
    pub fn mailbox(&self) -> &Arc<RelayMailbox> {
        &self.mailbox
    }

    /// Receive counters of the serial queue
    pub fn uart_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Block until a task ends
    ///
    /// The tasks run forever; the capture task returns only when the camera
    /// does not come up, which is reported as the error.
    pub fn wait(mut self) -> Result<(), RelayError> {
        let result = self
            .capture
            .join()
            .map_err(|_| RelayError::ThreadPanicked("capture"))?;
        if let Some(mut pump) = self.rx_pump.take() {
            pump.stop();
        }
        if self.network.is_finished() {
            self.network
                .join()
                .map_err(|_| RelayError::ThreadPanicked("network"))??;
        }
        result
    }
}

/// Open the serial port and start the capture and network tasks
pub fn start_pipeline(config: &RelayConfig) -> Result<Pipeline, RelayError> {
    info!("relay: starting pipeline (camlink {})", camlink::VERSION);

    let port = open_port(&config.serial)?;
    let tx_port = port.try_clone()?;

    let queue: &'static RxQueue = Box::leak(Box::new(ByteQueue::new()));
    let rx_pump = RxPump::spawn(port, queue)?;

    let mut pipeline = spawn_tasks(
        config,
        queue,
        SerialTx::new(tx_port),
        TcpConnector::new(config.server_addr()),
    )?;
    pipeline.rx_pump = Some(rx_pump);
    info!(
        "relay: capturing from {} and sending to {}",
        config.serial.port,
        config.server_addr()
    );
    Ok(pipeline)
}

/// Start both task threads over an already-fed receive queue
pub fn spawn_tasks<T, C>(
    config: &RelayConfig,
    queue: &'static RxQueue,
    tx: T,
    connector: C,
) -> Result<Pipeline, RelayError>
where
    T: Write + Send + 'static,
    C: Connector + Send + 'static,
{
    let mailbox = Arc::new(RelayMailbox::new());

    let capture = {
        let mailbox = mailbox.clone();
        let config = config.clone();
        thread::Builder::new()
            .name("capture".to_string())
            .spawn(move || -> Result<(), RelayError> {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()?;
                runtime.block_on(async move {
                    let mut uart = UartTransport::new(queue, TokioTimer::new(), config.transport);
                    uart.init(tx);
                    let camera = Camera::new(uart, config.camera.clone());
                    let mut scratch = vec![0u8; config.max_image_size];

                    match capture_task(camera, &mailbox, &mut scratch, config.capture).await {
                        Ok(never) => match never {},
                        Err(e) => {
                            error!("relay: capture task stopped: {}", e);
                            Err(RelayError::Camera(e))
                        }
                    }
                })
            })?
    };

    let network = {
        let mailbox = mailbox.clone();
        let network_config = config.network;
        thread::Builder::new()
            .name("network".to_string())
            .spawn(move || -> Result<(), RelayError> {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()?;
                match runtime.block_on(network_task(&mailbox, connector, TokioTimer::new(), network_config)) {}
            })?
    };

    Ok(Pipeline {
        queue,
        mailbox,
        capture,
        network,
        rx_pump: None,
    })
}
