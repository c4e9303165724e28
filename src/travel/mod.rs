//! Session migration between servers.
//!
//! The coordinator owns the agent's one live [`Session`]. Travelling opens and
//! handshakes a new session first; only once it is confirmed and the routes
//! are replayed does the old one close. Any failure on the way closes the new
//! link, leaves the old session untouched and reverts the phase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::core::{Dispatcher, RelationshipBook, RouteTable};
use crate::decision::{Decision, DecisionContext, DecisionPolicy};
use crate::error::{Error, Result};
use crate::protocol::{AgentId, Frame};
use crate::transport::{self, Connector, Inbound, ServerAddr, Session, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TravelPhase {
    /// On the home server.
    Local,
    /// Opening and handshaking a new session.
    Connecting,
    /// New session confirmed; replaying routes.
    Traveling,
    /// On a server other than home.
    Remote,
    /// The last attempt failed; reverting.
    Failed,
}

impl TravelPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TravelPhase::Local => "local",
            TravelPhase::Connecting => "connecting",
            TravelPhase::Traveling => "traveling",
            TravelPhase::Remote => "remote",
            TravelPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for TravelPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record of one travel attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TravelReport {
    pub from: Option<ServerAddr>,
    pub to: ServerAddr,
    pub reason: String,
    pub success: bool,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    /// Relationships dropped on arrival.
    pub forgotten: usize,
}

pub struct TravelCoordinator {
    agent: AgentId,
    connector: Arc<dyn Connector>,
    routes: Arc<RouteTable>,
    book: Arc<RelationshipBook>,
    inbound: mpsc::Sender<Inbound>,
    connect_timeout: Duration,
    gate: Option<DecisionPolicy>,
    dispatcher: Option<Arc<Dispatcher>>,
    home: RwLock<Option<ServerAddr>>,
    phase: RwLock<TravelPhase>,
    session: RwLock<Option<Arc<Session>>>,
    history: Mutex<Vec<TravelReport>>,
    listening: AtomicBool,
    // Serializes travel attempts.
    travel_lock: tokio::sync::Mutex<()>,
}

impl TravelCoordinator {
    pub fn new(
        agent: AgentId,
        connector: Arc<dyn Connector>,
        routes: Arc<RouteTable>,
        book: Arc<RelationshipBook>,
        inbound: mpsc::Sender<Inbound>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            agent,
            connector,
            routes,
            book,
            inbound,
            connect_timeout,
            gate: None,
            dispatcher: None,
            home: RwLock::new(None),
            phase: RwLock::new(TravelPhase::Local),
            session: RwLock::new(None),
            history: Mutex::new(Vec::new()),
            listening: AtomicBool::new(false),
            travel_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_gate(mut self, gate: DecisionPolicy) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Lanes of this dispatcher are dropped on arrival, before the book
    /// forgets, so no queued message from the old server lands afterwards.
    pub fn with_dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn agent(&self) -> &AgentId {
        &self.agent
    }

    pub fn phase(&self) -> TravelPhase {
        *self.phase.read().unwrap_or_else(|e| e.into_inner())
    }

    fn set_phase(&self, phase: TravelPhase) {
        let mut current = self.phase.write().unwrap_or_else(|e| e.into_inner());
        if *current != phase {
            tracing::debug!("{} travel phase {} -> {}", self.agent, *current, phase);
            *current = phase;
        }
    }

    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn session_id(&self) -> Option<u64> {
        self.session().map(|s| s.id())
    }

    pub fn home(&self) -> Option<ServerAddr> {
        self.home.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn history(&self) -> Vec<TravelReport> {
        self.history.lock().map(|h| h.clone()).unwrap_or_default()
    }

    /// In listen mode only the travel command is acted on.
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub fn set_listening(&self, listening: bool) {
        self.listening.store(listening, Ordering::SeqCst);
    }

    /// Connect to the home server. This is the first session; there is
    /// nothing to fall back to, so failure is returned as is.
    pub async fn start(&self, home: ServerAddr) -> Result<Arc<Session>> {
        let _guard = self.travel_lock.lock().await;
        let session = Arc::new(self.open(&home).await?);
        session.start(self.inbound.clone());

        *self.home.write().unwrap_or_else(|e| e.into_inner()) = Some(home.clone());
        let previous = self
            .session
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .replace(session.clone());
        if let Some(previous) = previous {
            previous.close().await;
        }
        self.set_phase(TravelPhase::Local);
        tracing::info!("{} connected to {} ({})", self.agent, home, session.server_name());
        Ok(session)
    }

    async fn greet(&self, addr: &ServerAddr) -> Result<(Arc<dyn Transport>, String)> {
        let transport = self.connector.connect(addr).await?;
        match transport::handshake(transport.as_ref(), &self.agent, self.routes.manifest()).await {
            Ok(server_name) => Ok((transport, server_name)),
            Err(e) => {
                transport.close().await;
                Err(e)
            }
        }
    }

    /// Connect and handshake within the connect timeout.
    async fn open(&self, addr: &ServerAddr) -> Result<Session> {
        let (transport, server_name) = match tokio::time::timeout(self.connect_timeout, self.greet(addr)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::transport(format!(
                    "connect to {} timed out after {:?}",
                    addr, self.connect_timeout
                )))
            }
        };
        Ok(Session::new(self.agent.clone(), addr.clone(), server_name, transport))
    }

    /// Move the agent's session to `destination`.
    ///
    /// On failure the previous session stays live and the phase reverts.
    pub async fn travel_to(&self, destination: ServerAddr, reason: &str) -> Result<TravelReport> {
        let _guard = self.travel_lock.lock().await;
        let started_at = Utc::now();
        let clock = Instant::now();
        let before = self.phase();
        let old = self.session();
        let from = old.as_ref().map(|s| s.server().clone());

        if from.as_ref() == Some(&destination) {
            return Err(Error::Travel(format!("already at {}", destination)));
        }

        tracing::info!("[travel] {} {} -> {} ({})", self.agent, display_addr(&from), destination, reason);
        self.set_phase(TravelPhase::Connecting);

        let result = self.arrive(&destination).await;
        let mut report = TravelReport {
            from,
            to: destination.clone(),
            reason: reason.to_string(),
            success: false,
            error: None,
            started_at,
            elapsed_ms: 0,
            forgotten: 0,
        };

        match result {
            Ok(ref new) => {
                *self.session.write().unwrap_or_else(|e| e.into_inner()) = Some(new.clone());
                if let Some(dispatcher) = &self.dispatcher {
                    let dropped = dispatcher.reset().await;
                    tracing::debug!("{} dropped {} dispatch lanes", self.agent, dropped);
                }
                report.forgotten = self.book.reset();
                if let Some(old) = old {
                    old.close().await;
                }
                let home = self.home();
                self.set_phase(if home.as_ref() == Some(&destination) {
                    TravelPhase::Local
                } else {
                    TravelPhase::Remote
                });
                self.set_listening(false);
                report.success = true;
                tracing::info!(
                    "[travel] {} arrived at {} ({}), forgot {} relationships",
                    self.agent,
                    destination,
                    new.server_name(),
                    report.forgotten
                );
            }
            Err(ref e) => {
                self.set_phase(TravelPhase::Failed);
                tracing::warn!("[travel] {} to {} failed: {}; staying", self.agent, destination, e);
                report.error = Some(e.to_string());
                self.set_phase(before);
            }
        }

        report.elapsed_ms = clock.elapsed().as_millis() as u64;
        if let Ok(mut history) = self.history.lock() {
            history.push(report.clone());
        }

        match result {
            Ok(_) => Ok(report),
            Err(e) => Err(Error::Travel(format!("{}: {}", destination, e))),
        }
    }

    /// Open, handshake and replay. The returned session is already pumping.
    async fn arrive(&self, destination: &ServerAddr) -> Result<Arc<Session>> {
        let session = self.open(destination).await?;
        self.set_phase(TravelPhase::Traveling);

        let routes = self.routes.manifest();
        let replay = tokio::time::timeout(self.connect_timeout, session.send(&Frame::Routes { routes })).await;
        match replay {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                session.transport().close().await;
                return Err(e);
            }
            Err(_) => {
                session.transport().close().await;
                return Err(Error::transport("route replay timed out"));
            }
        }

        let session = Arc::new(session);
        session.start(self.inbound.clone());
        Ok(session)
    }

    pub fn has_gate(&self) -> bool {
        self.gate.is_some()
    }

    /// Ask the decision gate whether to move. Without a gate the answer is stay.
    pub async fn consider(&self, ctx: &DecisionContext) -> Decision {
        match &self.gate {
            Some(gate) => gate.consult(ctx).await,
            None => Decision::stay(),
        }
    }

    /// Send on the current session.
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        match self.session() {
            Some(session) => session.send(frame).await,
            None => Err(Error::transport("no active session")),
        }
    }

    /// Close the current session, if any.
    pub async fn close(&self) {
        let session = self.session.write().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(session) = session {
            session.close().await;
        }
    }
}

fn display_addr(addr: &Option<ServerAddr>) -> String {
    addr.as_ref().map(|a| a.to_string()).unwrap_or_else(|| "nowhere".to_string())
}
