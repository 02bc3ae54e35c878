//! Framed connection over a byte stream.
//!
//! A [`Connection`] owns a split stream: the write half sits behind a send
//! lock so frames are written whole, and the read half is driven by a single
//! receiver. Closing flips a watch flag that wakes a blocked receiver and
//! shuts the write half down once any in-flight send has finished.

use std::fmt;
use std::str::FromStr;

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, RpcError};
use crate::protocol::{WireFrame, DEFAULT_MAX_PAYLOAD_SIZE};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Stream protocol used to reach a remote endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
}

impl FromStr for Protocol {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            other => Err(RpcError::config(format!("unsupported protocol: {}", other))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

struct FrameReader {
    stream: BoxedReader,
    buffer: BytesMut,
}

pub struct Connection {
    id: Uuid,
    peer: String,
    writer: Mutex<Option<BoxedWriter>>,
    reader: Mutex<FrameReader>,
    closed: watch::Sender<bool>,
    max_payload_size: u32,
}

impl Connection {
    /// Connect to `address` over `protocol`.
    pub async fn open(address: &str, protocol: Protocol) -> Result<Self> {
        match protocol {
            Protocol::Tcp => {
                let stream = TcpStream::connect(address)
                    .await
                    .map_err(|source| RpcError::Connection {
                        address: address.to_string(),
                        source,
                    })?;
                stream.set_nodelay(true)?;
                let connection = Self::from_stream(stream, address);
                info!(connection = %connection.id, "Connected to {} over {}", address, protocol);
                Ok(connection)
            }
        }
    }

    /// Wrap an already established byte stream.
    pub fn from_stream<S>(stream: S, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (closed, _) = watch::channel(false);
        Connection {
            id: Uuid::new_v4(),
            peer: peer.into(),
            writer: Mutex::new(Some(Box::new(write_half))),
            reader: Mutex::new(FrameReader {
                stream: Box::new(read_half),
                buffer: BytesMut::with_capacity(4096),
            }),
            closed,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }

    pub fn with_max_payload_size(mut self, max_payload_size: u32) -> Self {
        self.max_payload_size = max_payload_size;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Write one frame; concurrent senders are serialized.
    pub async fn send<F: WireFrame>(&self, frame: &F) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }
        let bytes = frame.encode();
        if bytes.len() - F::HEADER_SIZE > self.max_payload_size as usize {
            return Err(RpcError::decode(format!(
                "payload size {} exceeds maximum {}",
                bytes.len() - F::HEADER_SIZE,
                self.max_payload_size
            )));
        }

        let mut writer = self.writer.lock().await;
        let stream = writer.as_mut().ok_or(RpcError::ConnectionClosed)?;

        // A frame cut short by cancellation or an I/O error leaves the peer
        // unable to find the next frame boundary.
        let mut guard = PartialWriteGuard {
            connection: self,
            armed: true,
        };
        let written = async {
            stream.write_all(&bytes).await?;
            stream.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!(connection = %self.id, "Write to {} failed: {}", self.peer, e);
            writer.take();
            return Err(e.into());
        }
        guard.armed = false;

        debug!(connection = %self.id, "Sent {} byte frame", bytes.len());
        Ok(())
    }

    /// Wait for the next complete frame.
    ///
    /// Fails with `ConnectionClosed` once the connection is closed locally or
    /// the peer hangs up.
    pub async fn receive<F: WireFrame>(&self) -> Result<F> {
        let mut closed = self.closed.subscribe();
        let mut reader = self.reader.lock().await;
        let FrameReader { stream, buffer } = &mut *reader;

        loop {
            if *closed.borrow() {
                return Err(RpcError::ConnectionClosed);
            }
            if let Some(frame) = F::extract(buffer, self.max_payload_size)? {
                return Ok(frame);
            }

            tokio::select! {
                read = stream.read_buf(buffer) => {
                    let n = read?;
                    if n == 0 {
                        debug!(connection = %self.id, "Peer {} closed the stream", self.peer);
                        return Err(RpcError::ConnectionClosed);
                    }
                    debug!(connection = %self.id, "Read {} bytes, {} buffered", n, buffer.len());
                }
                _ = closed.wait_for(|closed| *closed) => {
                    return Err(RpcError::ConnectionClosed);
                }
            }
        }
    }

    /// Mark the connection closed without waiting for the writer.
    ///
    /// Returns `false` if it was already closed.
    pub fn mark_closed(&self) -> bool {
        !self.closed.send_replace(true)
    }

    /// Close the connection. Closing twice is a no-op.
    pub async fn close(&self) {
        if self.mark_closed() {
            info!(connection = %self.id, "Closing connection to {}", self.peer);
        }
        let mut writer = self.writer.lock().await;
        if let Some(mut stream) = writer.take() {
            if let Err(e) = stream.shutdown().await {
                debug!(connection = %self.id, "Shutdown of write half failed: {}", e);
            }
        }
    }
}

/// Marks the connection closed unless the frame was fully written.
struct PartialWriteGuard<'a> {
    connection: &'a Connection,
    armed: bool,
}

impl Drop for PartialWriteGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.connection.mark_closed() {
            warn!(
                connection = %self.connection.id,
                "Frame to {} was cut short, closing connection",
                self.connection.peer
            );
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}
