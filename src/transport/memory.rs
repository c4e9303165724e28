//! In-process transport over channels. Used for embedding and tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, Mutex};

use super::Transport;
use crate::error::{Error, Result};
use crate::protocol::Frame;

pub struct MemoryTransport {
    peer: String,
    tx: StdMutex<Option<mpsc::UnboundedSender<Frame>>>,
    rx: Mutex<mpsc::UnboundedReceiver<Frame>>,
    closed: AtomicBool,
}

/// Two connected ends. `a` sees `b_name` as its peer and vice versa.
pub fn pair(a_name: &str, b_name: &str) -> (MemoryTransport, MemoryTransport) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();

    let a = MemoryTransport {
        peer: b_name.to_string(),
        tx: StdMutex::new(Some(a_tx)),
        rx: Mutex::new(a_rx),
        closed: AtomicBool::new(false),
    };
    let b = MemoryTransport {
        peer: a_name.to_string(),
        tx: StdMutex::new(Some(b_tx)),
        rx: Mutex::new(b_rx),
        closed: AtomicBool::new(false),
    };
    (a, b)
}

impl MemoryTransport {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn peer(&self) -> &str {
        &self.peer
    }

    async fn send(&self, frame: &Frame) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .map_err(|_| Error::transport("memory link poisoned"))?
            .clone();
        match tx {
            Some(tx) => tx
                .send(frame.clone())
                .map_err(|_| Error::transport(format!("{} hung up", self.peer))),
            None => Err(Error::transport(format!("link to {} is closed", self.peer))),
        }
    }

    async fn recv(&self) -> Result<Option<Frame>> {
        if self.is_closed() {
            return Ok(None);
        }
        Ok(self.rx.lock().await.recv().await)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
    }
}
