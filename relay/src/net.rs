//! TCP connector for the network task.
//!
//! One connection per image. Keep-alive and socket timeouts come from
//! [`SocketOptions`]; sends are additionally bounded with a tokio timeout,
//! since kernel send timeouts do not apply to non-blocking sockets.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use camlink::{Connector, SocketOptions};
use log::{debug, info, warn};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Opens connections to one fixed server address
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

/// One open connection to the image server
pub struct TcpConnection {
    stream: TcpStream,
    peer: SocketAddr,
    send_timeout: Duration,
    sent: u64,
}

impl TcpConnection {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Bytes written so far
    pub fn sent(&self) -> u64 {
        self.sent
    }
}

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{} timed out", what))
}

/// Apply keep-alive, timeouts and no-delay to a connected stream
pub fn apply_socket_options(stream: &TcpStream, options: &SocketOptions) -> io::Result<()> {
    let socket = SockRef::from(stream);

    socket.set_keepalive(options.keepalive)?;
    if options.keepalive {
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(u64::from(options.keepalive_idle_s)))
            .with_interval(Duration::from_secs(u64::from(options.keepalive_interval_s)));
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        let keepalive = keepalive.with_retries(options.keepalive_count);
        socket.set_tcp_keepalive(&keepalive)?;
    }

    socket.set_write_timeout(duration_ms(options.send_timeout_ms))?;
    socket.set_read_timeout(duration_ms(options.recv_timeout_ms))?;
    socket.set_nodelay(true)?;
    Ok(())
}

/// Zero means no timeout
fn duration_ms(ms: u32) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(u64::from(ms)))
}

impl Connector for TcpConnector {
    type Connection = TcpConnection;
    type Error = io::Error;

    async fn connect(&mut self, options: &SocketOptions) -> io::Result<TcpConnection> {
        let connect = TcpStream::connect(&self.addr);
        let stream = match duration_ms(options.send_timeout_ms) {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| timed_out("connect"))??,
            None => connect.await?,
        };
        apply_socket_options(&stream, options)?;

        let peer = stream.peer_addr()?;
        info!("net: connected to {}", peer);
        Ok(TcpConnection {
            stream,
            peer,
            send_timeout: duration_ms(options.send_timeout_ms).unwrap_or(Duration::MAX),
            sent: 0,
        })
    }

    async fn close(&mut self, mut connection: TcpConnection) {
        if let Err(e) = connection.stream.shutdown().await {
            warn!("net: shutdown of {} failed: {}", connection.peer, e);
        }
        debug!(
            "net: closed {} after {} bytes",
            connection.peer, connection.sent
        );
    }
}

impl embedded_io_async::ErrorType for TcpConnection {
    type Error = io::Error;
}

impl embedded_io_async::Write for TcpConnection {
    async fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        tokio::time::timeout(self.send_timeout, self.stream.write_all(buf))
            .await
            .map_err(|_| timed_out("send"))??;
        self.sent += buf.len() as u64;
        Ok(buf.len())
    }
}
