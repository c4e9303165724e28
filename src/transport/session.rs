//! A live binding of an agent identity to one transport on one server.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{ServerAddr, Transport};
use crate::error::Result;
use crate::protocol::{AgentId, Frame};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Something read from a session, tagged with the session it came from.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub session: u64,
    pub event: InboundEvent,
}

#[derive(Debug, Clone)]
pub enum InboundEvent {
    Frame(Frame),
    /// The link ended; carries the error text if it failed.
    Closed(Option<String>),
}

pub struct Session {
    id: u64,
    agent: AgentId,
    server: ServerAddr,
    server_name: String,
    transport: Arc<dyn Transport>,
    pump: Mutex<Option<JoinHandle<()>>>,
    opened_at: DateTime<Utc>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("agent", &self.agent)
            .field("server", &self.server)
            .field("server_name", &self.server_name)
            .finish()
    }
}

impl Session {
    /// Wrap an already handshaken transport.
    pub fn new(
        agent: AgentId,
        server: ServerAddr,
        server_name: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst),
            agent,
            server,
            server_name: server_name.into(),
            transport,
            pump: Mutex::new(None),
            opened_at: Utc::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn agent(&self) -> &AgentId {
        &self.agent
    }

    pub fn server(&self) -> &ServerAddr {
        &self.server
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Start forwarding frames into `inbound`. Calling twice is a no-op.
    pub fn start(&self, inbound: mpsc::Sender<Inbound>) {
        let Ok(mut pump) = self.pump.lock() else {
            return;
        };
        if pump.is_some() {
            return;
        }

        let id = self.id;
        let transport = self.transport.clone();
        *pump = Some(tokio::spawn(async move {
            loop {
                let event = match transport.recv().await {
                    Ok(Some(frame)) => InboundEvent::Frame(frame),
                    Ok(None) => InboundEvent::Closed(None),
                    Err(e) => InboundEvent::Closed(Some(e.to_string())),
                };
                let done = matches!(event, InboundEvent::Closed(_));
                if inbound.send(Inbound { session: id, event }).await.is_err() || done {
                    break;
                }
            }
            tracing::debug!("Session {} pump stopped", id);
        }));
    }

    pub async fn send(&self, frame: &Frame) -> Result<()> {
        self.transport.send(frame).await
    }

    /// Stop the pump, say goodbye and close the link.
    pub async fn close(&self) {
        if let Ok(mut pump) = self.pump.lock() {
            if let Some(handle) = pump.take() {
                handle.abort();
            }
        }
        let _ = self.transport.send(&Frame::Bye).await;
        self.transport.close().await;
        tracing::info!("Closed session {} to {}", self.id, self.server);
    }
}
