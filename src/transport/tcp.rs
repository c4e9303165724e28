//! TCP transport: one JSON frame per line.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use super::{Connector, ServerAddr, Transport};
use crate::error::{Error, Result};
use crate::protocol::frame::{self, Frame, RawLine};

pub struct TcpTransport {
    peer: String,
    reader: Mutex<BufReader<OwnedReadHalf>>,
    writer: Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();

        Self {
            peer,
            reader: Mutex::new(BufReader::new(read_half)),
            writer: Mutex::new(write_half),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn peer(&self) -> &str {
        &self.peer
    }

    async fn send(&self, frame: &Frame) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::transport(format!("link to {} is closed", self.peer)));
        }
        let line = frame::encode(frame)?;

        let mut writer = self.writer.lock().await;
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::transport(format!("write to {}: {}", self.peer, e)))?;
        writer
            .flush()
            .await
            .map_err(|e| Error::transport(format!("flush to {}: {}", self.peer, e)))
    }

    async fn recv(&self) -> Result<Option<Frame>> {
        let mut reader = self.reader.lock().await;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }

            let raw = frame::read_line(&mut *reader)
                .await
                .map_err(|e| Error::transport(format!("read from {}: {}", self.peer, e)))?;

            // Bad lines are dropped; the link stays up.
            let bytes = match raw {
                RawLine::Eof => return Ok(None),
                RawLine::Oversize(len) => {
                    tracing::warn!("Dropping {} byte line from {}", len, self.peer);
                    continue;
                }
                RawLine::Line(bytes) => bytes,
            };
            let line = match std::str::from_utf8(&bytes) {
                Ok(line) => line,
                Err(e) => {
                    tracing::warn!("Dropping non-UTF-8 line from {}: {}", self.peer, e);
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            match frame::decode(line) {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) => tracing::warn!("Dropping malformed frame from {}: {}", self.peer, e),
            }
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!("Shutdown of link to {} failed: {}", self.peer, e);
        }
    }
}

/// Opens plain TCP links.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, addr: &ServerAddr) -> Result<Arc<dyn Transport>> {
        let stream = TcpStream::connect((addr.host.as_str(), addr.port))
            .await
            .map_err(|e| Error::transport(format!("connect to {}: {}", addr, e)))?;
        tracing::debug!("Connected to {}", addr);
        Ok(Arc::new(TcpTransport::new(stream)))
    }
}
