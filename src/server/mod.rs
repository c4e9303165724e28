//! Relay server agents connect to.
//!
//! Each connection handshakes (`hello` -> `welcome`/`reject`), then the
//! server relays its messages: broadcasts to every other connected agent,
//! direct messages to their recipient only. One live connection per agent
//! identity; a second one is rejected until the first goes away.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::protocol::{AgentId, Frame, Message, Scope};
use crate::transport::{TcpTransport, Transport};

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

struct Peer {
    conn: u64,
    tx: mpsc::UnboundedSender<Frame>,
    routes: Vec<String>,
    connected_at: DateTime<Utc>,
}

/// Connected agent, as listed by [`Hub::agents`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub agent: AgentId,
    pub routes: Vec<String>,
    pub connected_at: DateTime<Utc>,
}

/// Registry of live connections.
pub struct Hub {
    name: String,
    peers: Mutex<HashMap<AgentId, Peer>>,
    next_conn: AtomicU64,
}

impl Hub {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            peers: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<AgentId, Peer>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `agent` for a new connection. Fails if it is already live.
    fn join(&self, agent: &AgentId, routes: Vec<String>, tx: mpsc::UnboundedSender<Frame>) -> Option<u64> {
        let mut peers = self.lock();
        if peers.contains_key(agent) {
            return None;
        }
        let conn = self.next_conn.fetch_add(1, Ordering::SeqCst);
        peers.insert(
            agent.clone(),
            Peer {
                conn,
                tx,
                routes,
                connected_at: Utc::now(),
            },
        );
        Some(conn)
    }

    fn leave(&self, agent: &AgentId, conn: u64) {
        let mut peers = self.lock();
        if peers.get(agent).map(|p| p.conn) == Some(conn) {
            peers.remove(agent);
        }
    }

    fn set_routes(&self, agent: &AgentId, conn: u64, routes: Vec<String>) {
        if let Some(peer) = self.lock().get_mut(agent) {
            if peer.conn == conn {
                peer.routes = routes;
            }
        }
    }

    /// Forward a message; returns how many agents it was queued for.
    pub fn relay(&self, message: &Message) -> usize {
        let frame = Frame::message(message.clone());
        let peers = self.lock();
        match &message.scope {
            Scope::Broadcast => peers
                .iter()
                .filter(|(id, _)| **id != message.from)
                .filter(|(_, p)| p.tx.send(frame.clone()).is_ok())
                .count(),
            Scope::Direct { to } => match peers.get(to) {
                Some(p) if p.tx.send(frame).is_ok() => 1,
                _ => {
                    tracing::debug!("No live agent {} for message {}", to, message.id);
                    0
                }
            },
        }
    }

    pub fn agents(&self) -> Vec<AgentSummary> {
        let mut agents: Vec<AgentSummary> = self
            .lock()
            .iter()
            .map(|(id, p)| AgentSummary {
                agent: id.clone(),
                routes: p.routes.clone(),
                connected_at: p.connected_at,
            })
            .collect();
        agents.sort_by(|a, b| a.agent.cmp(&b.agent));
        agents
    }

    pub fn is_connected(&self, agent: &AgentId) -> bool {
        self.lock().contains_key(agent)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct RelayServer {
    listener: TcpListener,
    hub: Arc<Hub>,
    handshake_timeout: Duration,
}

impl RelayServer {
    pub async fn bind(host: &str, port: u16, name: impl Into<String>) -> Result<Self> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| Error::transport(format!("bind {}:{}: {}", host, port, e)))?;
        Ok(Self {
            listener,
            hub: Arc::new(Hub::new(name)),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        })
    }

    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn hub(&self) -> Arc<Hub> {
        self.hub.clone()
    }

    /// Accept connections until the task is dropped.
    pub async fn run(self) -> Result<()> {
        tracing::info!("Relay {} listening on {}", self.hub.name(), self.local_addr()?);
        loop {
            let (stream, remote) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    continue;
                }
            };
            let hub = self.hub.clone();
            let timeout = self.handshake_timeout;
            tokio::spawn(async move {
                if let Err(e) = serve_connection(hub, stream, timeout).await {
                    tracing::debug!("Connection from {} ended: {}", remote, e);
                }
            });
        }
    }

    /// Run in the background.
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }
}

async fn serve_connection(hub: Arc<Hub>, stream: TcpStream, handshake_timeout: Duration) -> Result<()> {
    let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(stream));

    let hello = match tokio::time::timeout(handshake_timeout, transport.recv()).await {
        Ok(frame) => frame?,
        Err(_) => {
            transport.close().await;
            return Err(Error::Handshake("no hello in time".to_string()));
        }
    };
    let (agent, routes) = match hello {
        Some(Frame::Hello { agent, routes }) if !agent.as_str().is_empty() => (agent, routes),
        Some(other) => {
            let reason = format!("expected hello, got {}", other.kind());
            let _ = transport.send(&Frame::Reject { reason: reason.clone() }).await;
            transport.close().await;
            return Err(Error::Handshake(reason));
        }
        None => return Ok(()),
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let Some(conn) = hub.join(&agent, routes, tx.clone()) else {
        let reason = format!("identity {} is already connected", agent);
        tracing::info!("Rejecting {}: {}", transport.peer(), reason);
        let _ = transport.send(&Frame::Reject { reason: reason.clone() }).await;
        transport.close().await;
        return Err(Error::Handshake(reason));
    };
    // Queued first so nothing relayed can overtake it.
    let _ = tx.send(Frame::Welcome {
        server: hub.name().to_string(),
    });
    drop(tx);
    tracing::info!("{} joined {} from {}", agent, hub.name(), transport.peer());

    let writer_transport = transport.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = writer_transport.send(&frame).await {
                tracing::debug!("Write to {} failed: {}", writer_transport.peer(), e);
                break;
            }
        }
    });

    let result = read_loop(&hub, &agent, conn, transport.as_ref()).await;

    hub.leave(&agent, conn);
    writer.abort();
    transport.close().await;
    tracing::info!("{} left {}", agent, hub.name());
    result
}

async fn read_loop(hub: &Hub, agent: &AgentId, conn: u64, transport: &dyn Transport) -> Result<()> {
    loop {
        match transport.recv().await? {
            Some(Frame::Message { message }) => {
                if message.from != *agent {
                    tracing::warn!("{} sent a message as {}; dropped", agent, message.from);
                    continue;
                }
                let n = hub.relay(&message);
                tracing::debug!("{} {} -> {} recipients", agent, message.class(), n);
            }
            Some(Frame::Routes { routes }) => {
                tracing::debug!("{} announced {} routes", agent, routes.len());
                hub.set_routes(agent, conn, routes);
            }
            Some(Frame::Bye) | None => return Ok(()),
            Some(other) => {
                tracing::debug!("Ignoring {} frame from {}", other.kind(), agent);
            }
        }
    }
}
