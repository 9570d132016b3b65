//! TCP session shared by the protocol clients.
//!
//! Wraps one socket plus connect/read deadlines. The read deadline scales
//! with the buffer size (`read_to_ms + bytes/1MiB`), so bulk transfers get
//! proportionally more time. A fired deadline cancels the pending I/O and
//! closes the socket.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Default connect deadline in milliseconds.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
/// Default base read deadline in milliseconds. Zero disables the deadline.
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 5_000;

/// Lifecycle of the underlying socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Connecting,
    Open,
}

enum Conn {
    None,
    Whole(TcpStream),
    /// Read side only; the write half was dropped to send FIN.
    ReadOnly(OwnedReadHalf),
    /// Write side only; the read half was handed to a reader task.
    WriteOnly(OwnedWriteHalf),
}

/// One TCP connection to `host:port` with deadline handling.
pub struct ClientSession {
    host: String,
    port: String,
    connect_timeout_ms: u64,
    read_timeout_ms: u64,
    state: SessionState,
    conn: Conn,
}

impl ClientSession {
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Self {
        ClientSession {
            host: host.into(),
            port: port.into(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            state: SessionState::Closed,
            conn: Conn::None,
        }
    }

    /// Sets the connect and base read deadlines. Zero disables a deadline.
    pub fn set_timeout(&mut self, connect_ms: u64, read_ms: u64) {
        self.connect_timeout_ms = connect_ms;
        self.read_timeout_ms = read_ms;
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.conn, Conn::None)
    }

    /// Resolves and connects under the connect deadline.
    pub async fn connect(&mut self) -> io::Result<()> {
        self.state = SessionState::Connecting;
        let addr = format!("{}:{}", self.host, self.port);
        let attempt = TcpStream::connect(&addr);
        let res = if self.connect_timeout_ms > 0 {
            match tokio::time::timeout(Duration::from_millis(self.connect_timeout_ms), attempt)
                .await
            {
                Ok(r) => r,
                Err(_) => Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connect to {addr} timed out"),
                )),
            }
        } else {
            attempt.await
        };
        match res {
            Ok(stream) => {
                self.conn = Conn::Whole(stream);
                self.state = SessionState::Open;
                Ok(())
            }
            Err(e) => {
                debug!(%addr, error = %e, "connect to host failed");
                self.shutdown(true);
                Err(e)
            }
        }
    }

    /// Writes the whole buffer, connecting first if the socket is closed.
    /// Write errors close the socket.
    pub async fn send_data(&mut self, data: &[u8]) -> io::Result<()> {
        if !self.is_open() {
            self.connect().await?;
        }
        let res = match &mut self.conn {
            Conn::Whole(s) => s.write_all(data).await,
            Conn::WriteOnly(w) => w.write_all(data).await,
            _ => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "session is not writable",
            )),
        };
        if let Err(e) = res {
            warn!(error = %e, "write request data failed");
            self.shutdown(true);
            return Err(e);
        }
        Ok(())
    }

    fn read_deadline(&self, bytes: usize) -> Option<Duration> {
        if self.read_timeout_ms == 0 {
            return None;
        }
        let scaled = self.read_timeout_ms + (bytes as u64) / (1024 * 1024);
        Some(Duration::from_millis(scaled))
    }

    /// Reads at least one byte under the scaled read deadline. `Ok(0)` means
    /// the peer closed; the socket is closed in that case and on errors.
    pub async fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = self.read_deadline(buf.len());
        let res = {
            let read = async {
                match &mut self.conn {
                    Conn::Whole(s) => s.read(buf).await,
                    Conn::ReadOnly(r) => r.read(buf).await,
                    _ => Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "session is not readable",
                    )),
                }
            };
            match deadline {
                Some(d) => tokio::time::timeout(d, read)
                    .await
                    .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))),
                None => read.await,
            }
        };
        match res {
            Ok(0) => {
                self.shutdown(true);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                self.shutdown(true);
                Err(e)
            }
        }
    }

    /// Fills the whole buffer under the scaled read deadline.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let deadline = self.read_deadline(buf.len());
        let res = {
            let read = async {
                match &mut self.conn {
                    Conn::Whole(s) => s.read_exact(buf).await.map(|_| ()),
                    Conn::ReadOnly(r) => r.read_exact(buf).await.map(|_| ()),
                    _ => Err(io::Error::new(
                        io::ErrorKind::NotConnected,
                        "session is not readable",
                    )),
                }
            };
            match deadline {
                Some(d) => tokio::time::timeout(d, read)
                    .await
                    .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"))),
                None => read.await,
            }
        };
        if let Err(e) = res {
            self.shutdown(true);
            return Err(e);
        }
        Ok(())
    }

    /// Splits the connection and hands the read side to the caller; the
    /// session keeps writing. Used by the multiplexing clients, whose single
    /// reader task owns the read half.
    pub fn take_read_half(&mut self) -> Option<OwnedReadHalf> {
        match std::mem::replace(&mut self.conn, Conn::None) {
            Conn::Whole(s) => {
                let (r, w) = s.into_split();
                self.conn = Conn::WriteOnly(w);
                Some(r)
            }
            other => {
                self.conn = other;
                None
            }
        }
    }

    /// `close = true` closes the socket entirely; `close = false` half-closes
    /// the write side (FIN) while reads stay possible. Idempotent.
    pub fn shutdown(&mut self, close: bool) {
        if close {
            self.conn = Conn::None;
            self.state = SessionState::Closed;
            return;
        }
        match std::mem::replace(&mut self.conn, Conn::None) {
            Conn::Whole(s) => {
                let (r, w) = s.into_split();
                drop(w);
                self.conn = Conn::ReadOnly(r);
            }
            Conn::ReadOnly(r) => {
                self.conn = Conn::ReadOnly(r);
            }
            Conn::WriteOnly(_) | Conn::None => {
                self.state = SessionState::Closed;
            }
        }
    }
}
