//! Test doubles shared by the unit tests: a tokio-backed timer, inert UART
//! transmitters, a scripted camera module and a recording TCP connector.

use std::boxed::Box;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use std::vec::Vec;

use embedded_io_async::{ErrorType, Write};

use crate::camera::{Camera, CameraConfig};
use crate::command::{encode_length, opcode, Ack, CHUNK_ENVELOPE, LENGTH_REPLY_PREFIX};
use crate::queue::{ByteQueue, RX_QUEUE_SIZE};
use crate::task::SocketOptions;
use crate::traits::{Connector, Timer};
use crate::transport::{TransportConfig, UartTransport};

/// Timer on tokio's clock, so paused-time tests advance it virtually
pub struct TestTimer {
    start: tokio::time::Instant,
}

impl TestTimer {
    pub fn new() -> Self {
        Self {
            start: tokio::time::Instant::now(),
        }
    }
}

impl Timer for TestTimer {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    async fn delay_ms(&mut self, ms: u32) {
        tokio::time::sleep(Duration::from_millis(u64::from(ms))).await
    }
}

/// Receive queue with the `'static` lifetime an interrupt handler would see
pub fn leak_queue<const N: usize>() -> &'static ByteQueue<N> {
    Box::leak(Box::new(ByteQueue::new()))
}

/// Transmitter that accepts everything
#[derive(Default)]
pub struct NullTx;

impl ErrorType for NullTx {
    type Error = Infallible;
}

impl Write for NullTx {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Infallible> {
        Ok(buf.len())
    }
}

/// Transmitter that accepts at most `limit` bytes per write
pub struct ShortTx {
    pub limit: usize,
}

impl ErrorType for ShortTx {
    type Error = Infallible;
}

impl Write for ShortTx {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Infallible> {
        Ok(buf.len().min(self.limit))
    }
}

/// JPEG-shaped test image: start marker, counting pattern, end marker
pub fn jpeg_image(len: usize) -> Vec<u8> {
    let mut image: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
    if len >= 4 {
        image[..2].copy_from_slice(&[0xFF, 0xD8]);
        image[len - 2..].copy_from_slice(&[0xFF, 0xD9]);
    }
    image
}

/// Behavior and fault plan of the emulated module
#[derive(Debug, Default)]
pub struct ModuleState {
    pub image: Vec<u8>,
    /// Every command frame received, in order
    pub commands: Vec<Vec<u8>>,
    pub banner: Vec<u8>,
    /// Never reply
    pub silent: bool,
    /// Echo a wrong opcode in acknowledgments
    pub wrong_ack_opcode: bool,
    /// Send acks as 2 + 3 bytes, the tail after this many ms
    pub split_ack_after_ms: Option<u64>,
    /// Send the length reply as 4 + 5 bytes, the tail after this many ms
    pub split_length_after_ms: Option<u64>,
    /// Send only the first four bytes of the length reply
    pub drop_length_tail: bool,
    /// Chunk replies to spoil, consumed in this order
    pub corrupt_headers: usize,
    pub corrupt_footers: usize,
    pub truncate_chunks: usize,
}

/// Test-side view of a [`FakeModule`] after it moved into a transport
#[derive(Clone)]
pub struct FakeHandle {
    state: Arc<Mutex<ModuleState>>,
    queue: &'static ByteQueue<RX_QUEUE_SIZE>,
}

impl FakeHandle {
    pub fn update(&self, f: impl FnOnce(&mut ModuleState)) {
        f(&mut self.state.lock().unwrap())
    }

    pub fn queue(&self) -> &'static ByteQueue<RX_QUEUE_SIZE> {
        self.queue
    }

    pub fn commands(&self) -> Vec<Vec<u8>> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn opcodes(&self) -> Vec<u8> {
        self.commands().iter().map(|c| c[2]).collect()
    }

    /// `(offset, len)` of every chunk read command received
    pub fn chunk_reads(&self) -> Vec<(u32, u16)> {
        self.commands()
            .iter()
            .filter(|c| c[2] == opcode::READ_FBUF)
            .map(|c| {
                let offset = u32::from_be_bytes([c[6], c[7], c[8], c[9]]);
                let len = u32::from_be_bytes([c[10], c[11], c[12], c[13]]);
                (offset, len as u16)
            })
            .collect()
    }
}

/// Scripted PTC06 emulator
///
/// Acts as the UART transmitter: each written command frame is parsed and the
/// reply is pushed into the receive queue, as the interrupt handler would.
pub struct FakeModule {
    handle: FakeHandle,
}

impl FakeModule {
    pub fn new(image: Vec<u8>) -> (Self, FakeHandle) {
        let handle = FakeHandle {
            state: Arc::new(Mutex::new(ModuleState {
                image,
                banner: b"VC0703 1.00\r\nCtrl infr exist\r\n".to_vec(),
                ..ModuleState::default()
            })),
            queue: leak_queue(),
        };
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }

    /// Reply bytes to send now and an optional delayed tail
    fn respond(&self, frame: &[u8]) -> (Vec<u8>, Option<(u64, Vec<u8>)>) {
        let mut state = self.handle.state.lock().unwrap();
        state.commands.push(frame.to_vec());
        if state.silent || frame.len() < 4 {
            return (Vec::new(), None);
        }

        let op = frame[2];
        match op {
            opcode::GET_FBUF_LEN => {
                let reply = encode_length(state.image.len() as u16);
                if state.drop_length_tail {
                    (LENGTH_REPLY_PREFIX.to_vec(), None)
                } else if let Some(after) = state.split_length_after_ms {
                    (reply[..4].to_vec(), Some((after, reply[4..].to_vec())))
                } else {
                    (reply.to_vec(), None)
                }
            }
            opcode::READ_FBUF => {
                let offset = u32::from_be_bytes([frame[6], frame[7], frame[8], frame[9]]) as usize;
                let len = u32::from_be_bytes([frame[10], frame[11], frame[12], frame[13]]) as usize;
                let end = (offset + len).min(state.image.len());
                let start = offset.min(end);

                let mut reply = CHUNK_ENVELOPE.to_vec();
                reply.extend_from_slice(&state.image[start..end]);
                reply.extend_from_slice(&CHUNK_ENVELOPE);

                if state.corrupt_headers > 0 {
                    state.corrupt_headers -= 1;
                    reply[2] ^= 0xFF;
                } else if state.corrupt_footers > 0 {
                    state.corrupt_footers -= 1;
                    let last = reply.len() - 1;
                    reply[last] ^= 0x01;
                } else if state.truncate_chunks > 0 {
                    state.truncate_chunks -= 1;
                    reply.truncate(reply.len() - 3);
                }
                (reply, None)
            }
            _ => {
                let echoed = if state.wrong_ack_opcode { op ^ 0x01 } else { op };
                let mut reply = Ack {
                    opcode: echoed,
                    status: 0x00,
                }
                .encode()
                .to_vec();
                if op == opcode::RESET {
                    reply.extend_from_slice(&state.banner);
                }
                match state.split_ack_after_ms {
                    Some(after) => {
                        let tail = reply.split_off(2);
                        (reply, Some((after, tail)))
                    }
                    None => (reply, None),
                }
            }
        }
    }
}

impl ErrorType for FakeModule {
    type Error = Infallible;
}

impl Write for FakeModule {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Infallible> {
        let (now, later) = self.respond(buf);
        let queue = self.handle.queue;
        queue.push_slice(&now);
        if let Some((after, tail)) = later {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(after)).await;
                queue.push_slice(&tail);
            });
        }
        Ok(buf.len())
    }
}

pub type FakeCamera = Camera<UartTransport<'static, FakeModule, TestTimer, RX_QUEUE_SIZE>>;

/// Camera driver wired to an emulated module with default timing
pub fn fake_camera(module: FakeModule) -> FakeCamera {
    let mut uart = UartTransport::new(
        module.handle.queue,
        TestTimer::new(),
        TransportConfig::default(),
    );
    uart.init(module);
    Camera::new(uart, CameraConfig::default())
}

/// What a [`RecordingConnector`] saw on its connections
#[derive(Debug, Default)]
pub struct Recorded {
    /// Bytes of each write call, per connection
    pub connections: Vec<Vec<Vec<u8>>>,
    pub closed: usize,
    pub refused: usize,
}

/// TCP connector double that records every write
///
/// `accept_bytes` caps the bytes each connection accepts in total; after that
/// every write is short.
#[derive(Clone, Default)]
pub struct RecordingConnector {
    pub recorded: Arc<Mutex<Recorded>>,
    pub refuse: bool,
    pub accept_bytes: Option<usize>,
}

impl RecordingConnector {
    /// Concatenated bytes written on connection `n`
    pub fn stream(&self, n: usize) -> Vec<u8> {
        self.recorded.lock().unwrap().connections[n].concat()
    }

    pub fn writes(&self, n: usize) -> Vec<Vec<u8>> {
        self.recorded.lock().unwrap().connections[n].clone()
    }
}

pub struct RecordingConnection {
    recorded: Arc<Mutex<Recorded>>,
    index: usize,
    budget: Option<usize>,
}

impl ErrorType for RecordingConnection {
    type Error = Infallible;
}

impl Write for RecordingConnection {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, Infallible> {
        let accepted = match self.budget.as_mut() {
            Some(left) => {
                let n = buf.len().min(*left);
                *left -= n;
                n
            }
            None => buf.len(),
        };
        self.recorded.lock().unwrap().connections[self.index].push(buf[..accepted].to_vec());
        Ok(accepted)
    }
}

impl Connector for RecordingConnector {
    type Connection = RecordingConnection;
    type Error = &'static str;

    async fn connect(&mut self, _options: &SocketOptions) -> Result<RecordingConnection, &'static str> {
        let mut recorded = self.recorded.lock().unwrap();
        if self.refuse {
            recorded.refused += 1;
            return Err("connection refused");
        }
        recorded.connections.push(Vec::new());
        Ok(RecordingConnection {
            recorded: self.recorded.clone(),
            index: recorded.connections.len() - 1,
            budget: self.accept_bytes,
        })
    }

    async fn close(&mut self, _connection: RecordingConnection) {
        self.recorded.lock().unwrap().closed += 1;
    }
}

/// Image buffer that counts its own drops
pub struct TrackedBuffer {
    pub data: Vec<u8>,
    drops: Arc<AtomicUsize>,
}

impl TrackedBuffer {
    pub fn new(len: usize, drops: &Arc<AtomicUsize>) -> Self {
        Self {
            data: vec![0xA5; len],
            drops: drops.clone(),
        }
    }
}

impl AsRef<[u8]> for TrackedBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for TrackedBuffer {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}
