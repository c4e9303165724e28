//! Agent runtime: one identity, one live session, hooks, dispatch and travel.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use crate::config::{DecisionSettings, Settings};
use crate::core::flow::RelationshipRow;
use crate::core::hooks::{SenderAllowlist, StampSender, ValidateEnvelope};
use crate::core::relationship::{RelationState, Stance};
use crate::core::sending;
use crate::core::{
    composer_fn, handler_fn, Direction, Dispatcher, Draft, FlowGraph, HandlerContext, HookAction,
    HookPipeline, MessageHook, Outbox, Outgoing, RelationshipBook, RoutePattern, RouteSpec, RouteTable,
    SendContext, SendRoutes, TransitionTable,
};
use crate::decision::{CachedHook, DecisionContext, DecisionHook, DecisionPolicy, KeywordPolicy, LlmPolicy};
use crate::error::{Error, Result};
use crate::protocol::{AgentId, Content, Frame, Message, MessageClass};
use crate::providers::{self, Provider};
use crate::transport::{Connector, Inbound, InboundEvent, ServerAddr, TcpConnector};
use crate::travel::{TravelCoordinator, TravelPhase};
use crate::writer::{self, StatusKind, Writer};

const INBOUND_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub id: AgentId,
    pub home: ServerAddr,
    /// Default target of the travel command.
    pub destination: Option<ServerAddr>,
    pub connect_timeout: Duration,
    pub allowed_prefixes: Vec<String>,
    pub listen: bool,
    /// Greet back new peers and tell them about state changes.
    pub status_replies: bool,
    pub goal: Option<String>,
    /// Clock broadcast period.
    pub broadcast_every: Option<Duration>,
    /// Period of good/bad notes to classified peers.
    pub reputation_every: Option<Duration>,
}

impl AgentOptions {
    pub fn new(id: impl Into<AgentId>, home: ServerAddr) -> Self {
        Self {
            id: id.into(),
            home,
            destination: None,
            connect_timeout: Duration::from_secs(5),
            allowed_prefixes: Vec::new(),
            listen: false,
            status_replies: true,
            goal: None,
            broadcast_every: None,
            reputation_every: None,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            id: AgentId::new(settings.agent.name.clone()),
            home: settings.server.addr(),
            destination: settings.travel.destination.clone(),
            connect_timeout: settings.travel.connect_timeout(),
            allowed_prefixes: settings.agent.allowed_prefixes.clone(),
            listen: settings.agent.listen,
            status_replies: settings.agent.status_replies,
            goal: settings.agent.goal.clone(),
            broadcast_every: settings.agent.broadcast_every_ms.map(Duration::from_millis),
            reputation_every: settings.agent.reputation_every_ms.map(Duration::from_millis),
        }
    }
}

/// The completion provider behind the `llm` backend; `None` for the others.
pub fn build_provider(settings: &DecisionSettings) -> Result<Option<Arc<dyn Provider>>> {
    if settings.backend != "llm" {
        return Ok(None);
    }
    providers::create_provider(settings)
        .map(Some)
        .map_err(|e| Error::Config(e.to_string()))
}

/// Build the decision gate described by `settings`; `None` for backend `none`.
pub fn build_policy(
    settings: &DecisionSettings,
    provider: Option<Arc<dyn Provider>>,
    goal: Option<&str>,
) -> Result<Option<DecisionPolicy>> {
    let hook: Arc<dyn DecisionHook> = match settings.backend.as_str() {
        "none" => return Ok(None),
        "keywords" => Arc::new(KeywordPolicy::new()),
        "llm" => {
            let provider = provider.ok_or_else(|| Error::Config("the llm backend needs a provider".to_string()))?;
            let mut policy = LlmPolicy::new(provider).classify(settings.classify);
            if let Some(model) = &settings.model {
                policy = policy.model(model.clone());
            }
            if let Some(goal) = goal {
                policy = policy.goal(goal);
            }
            Arc::new(policy)
        }
        other => return Err(Error::Config(format!("unknown decision backend '{}'", other))),
    };
    let hook: Arc<dyn DecisionHook> = if settings.cache {
        Arc::new(CachedHook::new(hook))
    } else {
        hook
    };
    Ok(Some(
        DecisionPolicy::new(hook, settings.timeout()).with_min_confidence(settings.min_confidence),
    ))
}

/// What the dashboard's `/state` endpoint shows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: AgentId,
    pub outside_goal: String,
    pub listening: bool,
    pub phase: TravelPhase,
    pub server: Option<String>,
    pub rows: Vec<RelationshipRow>,
}

pub struct Agent {
    options: AgentOptions,
    routes: Arc<RouteTable>,
    table: Arc<TransitionTable>,
    book: Arc<RelationshipBook>,
    hooks: HookPipeline,
    dispatcher: Arc<Dispatcher>,
    travel: TravelCoordinator,
    writer: Arc<Writer>,
    outbox: Outbox,
    inbound_rx: Mutex<Option<mpsc::Receiver<Inbound>>>,
    outgoing_rx: Mutex<Option<mpsc::UnboundedReceiver<Outgoing>>>,
    shutdown: Notify,
}

impl Agent {
    pub fn new(options: AgentOptions, connector: Arc<dyn Connector>, gate: Option<DecisionPolicy>) -> Self {
        Self::with_table(options, connector, gate, TransitionTable::standard())
    }

    pub fn with_table(
        options: AgentOptions,
        connector: Arc<dyn Connector>,
        gate: Option<DecisionPolicy>,
        table: TransitionTable,
    ) -> Self {
        let id = options.id.clone();
        let table = Arc::new(table);
        let routes = Arc::new(RouteTable::new());
        let book = Arc::new(RelationshipBook::new(id.clone(), table.clone()));
        let (outbox, outgoing_rx) = Outbox::channel(id.clone());
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);

        let dispatcher = Arc::new(match &gate {
            Some(gate) => Dispatcher::with_gate(routes.clone(), book.clone(), outbox.clone(), gate.clone()),
            None => Dispatcher::new(routes.clone(), book.clone(), outbox.clone()),
        });
        let mut travel = TravelCoordinator::new(
            id.clone(),
            connector,
            routes.clone(),
            book.clone(),
            inbound_tx,
            options.connect_timeout,
        )
        .with_dispatcher(dispatcher.clone());
        if let Some(gate) = gate {
            travel = travel.with_gate(gate);
        }
        travel.set_listening(options.listen);

        let mut hooks = HookPipeline::new();
        hooks.add(Direction::Receive, 0, Arc::new(ValidateEnvelope::new(id.clone())));
        if !options.allowed_prefixes.is_empty() {
            hooks.add(
                Direction::Receive,
                1,
                Arc::new(SenderAllowlist::new(options.allowed_prefixes.clone())),
            );
        }
        hooks.add(Direction::Send, 0, Arc::new(StampSender::new(id)));

        let writer = Arc::new(Writer::new(options.goal.clone().unwrap_or_default()));
        if options.status_replies {
            install_status_replies(&routes, dispatcher.senders(), writer.clone());
        }
        if let Err(e) = install_clock_routes(
            dispatcher.senders(),
            writer.clone(),
            options.broadcast_every,
            options.reputation_every,
        ) {
            tracing::warn!("Clock routes not installed: {}", e);
        }

        Self {
            options,
            routes,
            table,
            book,
            hooks,
            dispatcher,
            travel,
            writer,
            outbox,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            outgoing_rx: Mutex::new(Some(outgoing_rx)),
            shutdown: Notify::new(),
        }
    }

    /// TCP agent configured from settings. Without a configured goal one is
    /// generated, by the model when the `llm` backend is on.
    pub async fn from_settings(settings: &Settings) -> Result<Self> {
        let provider = build_provider(&settings.decision)?;
        let mut options = AgentOptions::from_settings(settings);
        let goal = match options.goal.clone() {
            Some(goal) => goal,
            None => {
                let goal = writer::outside_goal(
                    provider.as_deref(),
                    settings.decision.model.as_deref(),
                    writer::WRITE_TIMEOUT,
                )
                .await;
                tracing::info!("[outside_goal] {}", goal);
                options.goal = Some(goal.clone());
                goal
            }
        };
        let gate = build_policy(&settings.decision, provider.clone(), Some(&goal))?;
        let agent = Self::new(options, Arc::new(TcpConnector), gate);
        if let Some(provider) = provider {
            agent.writer.use_llm(provider, settings.decision.model.clone());
        }
        Ok(agent)
    }

    pub fn id(&self) -> &AgentId {
        &self.options.id
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn book(&self) -> &Arc<RelationshipBook> {
        &self.book
    }

    pub fn travel(&self) -> &TravelCoordinator {
        &self.travel
    }

    pub fn outbox(&self) -> Outbox {
        self.outbox.clone()
    }

    /// Clock and move-triggered send routes.
    pub fn senders(&self) -> &Arc<SendRoutes> {
        self.dispatcher.senders()
    }

    pub fn writer(&self) -> &Arc<Writer> {
        &self.writer
    }

    /// Add a hook. Only possible before the agent is shared.
    pub fn add_hook(&mut self, direction: Direction, priority: i32, hook: Arc<dyn MessageHook>) {
        self.hooks.add(direction, priority, hook);
    }

    pub fn flow_graph(&self) -> FlowGraph {
        FlowGraph::project(&self.routes, &self.table, &self.book)
    }

    pub fn state(&self) -> AgentState {
        AgentState {
            agent_id: self.options.id.clone(),
            outside_goal: self.writer.goal(),
            listening: self.travel.is_listening(),
            phase: self.travel.phase(),
            server: self.travel.session().map(|s| s.server_name().to_string()),
            rows: self.flow_graph().relationships,
        }
    }

    /// Ask a running agent to stop.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Connect home and serve until shut down.
    ///
    /// Fails with [`Error::Transport`] when the only session is lost and
    /// there is no home to fall back to.
    pub async fn run(&self) -> Result<()> {
        let mut inbound = take(&self.inbound_rx)?;
        let mut outgoing = take(&self.outgoing_rx)?;

        self.travel.start(self.options.home.clone()).await?;
        self.announce().await;

        let result = loop {
            let due = self.senders().next_due();
            tokio::select! {
                _ = self.shutdown.notified() => break Ok(()),
                Some(item) = inbound.recv() => {
                    if Some(item.session) != self.travel.session_id() {
                        tracing::trace!("Dropping event from stale session {}", item.session);
                        continue;
                    }
                    match item.event {
                        InboundEvent::Frame(Frame::Message { message }) => self.receive(message).await,
                        InboundEvent::Frame(Frame::Bye) => tracing::info!("Server said bye"),
                        InboundEvent::Frame(other) => tracing::debug!("Ignoring {} frame", other.kind()),
                        InboundEvent::Closed(reason) => {
                            if let Err(e) = self.recover(reason).await {
                                break Err(e);
                            }
                        }
                    }
                }
                Some(out) = outgoing.recv() => self.handle_outgoing(out).await,
                _ = until(due) => self.fire_clock(),
            }
        };

        self.dispatcher.shutdown().await;
        self.travel.close().await;
        tracing::info!("{} stopped", self.options.id);
        result
    }

    /// Compose due clock routes in the background. Their drafts leave
    /// through the outbox like handler replies.
    fn fire_clock(&self) {
        let due = self.senders().take_due(Instant::now());
        if due.is_empty() {
            return;
        }
        if self.travel.is_listening() || self.travel.session().is_none() {
            tracing::trace!("Skipping {} clock routes", due.len());
            return;
        }
        let relationships = self.book.snapshot();
        for route in due {
            let ctx = SendContext {
                local: self.options.id.clone(),
                route: route.name.clone(),
                outcome: None,
                peer: None,
                relationships: relationships.clone(),
            };
            let outbox = self.outbox.clone();
            tokio::spawn(async move {
                for draft in sending::compose(&route, ctx).await {
                    if let Err(e) = outbox.send(draft.into_message(outbox.local().clone())) {
                        tracing::warn!("{} ({}) could not queue: {}", route.id, route.name, e);
                        break;
                    }
                }
            });
        }
    }

    /// The live session ended. Away from home, go back; otherwise give up.
    async fn recover(&self, reason: Option<String>) -> Result<()> {
        let server = self
            .travel
            .session()
            .map(|s| s.server().to_string())
            .unwrap_or_else(|| "server".to_string());
        let detail = reason.map(|r| format!(": {}", r)).unwrap_or_default();
        tracing::warn!("Session to {} lost{}", server, detail);

        if self.travel.phase() == TravelPhase::Remote {
            if let Some(home) = self.travel.home() {
                if self.travel.travel_to(home, "session lost").await.is_ok() {
                    self.announce().await;
                    return Ok(());
                }
            }
        }
        Err(Error::Transport(format!("session to {} lost{}", server, detail)))
    }

    async fn receive(&self, message: Message) {
        let message = match self.hooks.run(Direction::Receive, message).await {
            HookAction::Continue(m) => m,
            HookAction::Drop(_) => return,
        };

        if message.content.is_travel() {
            tracing::info!("[recv] travel command from {}", message.from);
            let destination = message
                .content
                .data
                .clone()
                .and_then(|d| serde_json::from_value::<ServerAddr>(d).ok())
                .or_else(|| self.options.destination.clone());
            match destination {
                Some(dest) => self.go(dest, &format!("command from {}", message.from)).await,
                None => tracing::warn!("Travel command without a destination; staying"),
            }
            return;
        }

        if self.travel.is_listening() {
            tracing::debug!("Listening; ignoring {} from {}", message.class(), message.from);
            return;
        }
        self.dispatcher.on_message(message);
    }

    async fn handle_outgoing(&self, out: Outgoing) {
        match out {
            Outgoing::Send(message) => self.send(message).await,
            Outgoing::Travel { reason } => {
                let Some(dest) = self.options.destination.clone() else {
                    tracing::warn!("Travel requested ({}) without a destination", reason);
                    return;
                };
                if self.travel.has_gate() {
                    let ctx = DecisionContext::new("travel", self.options.id.clone())
                        .with_text(reason.clone())
                        .with_hint(format!("Move to {} or stay on the current server.", dest));
                    if !self.travel.consider(&ctx).await.is_move() {
                        tracing::info!("[decide] travel ({}) -> stay", reason);
                        return;
                    }
                }
                self.go(dest, &reason).await;
            }
        }
    }

    async fn go(&self, dest: ServerAddr, reason: &str) {
        match self.travel.travel_to(dest, reason).await {
            Ok(_) => self.announce().await,
            Err(e) => tracing::warn!("{}", e),
        }
    }

    async fn send(&self, message: Message) {
        let message = match self.hooks.run(Direction::Send, message).await {
            HookAction::Continue(m) => m,
            HookAction::Drop(_) => return,
        };
        if let Err(e) = self.travel.send(&Frame::message(message)).await {
            tracing::warn!("Send failed: {}", e);
        }
    }

    /// Tell everyone on the current server we are here.
    async fn announce(&self) {
        let text = format!("{} is here", self.options.id);
        self.send(Message::broadcast(
            self.options.id.clone(),
            Content::new(MessageClass::Register, text),
        ))
        .await;
    }
}

fn take<T>(slot: &Mutex<Option<T>>) -> Result<T> {
    slot.lock()
        .ok()
        .and_then(|mut s| s.take())
        .ok_or_else(|| Error::Other("agent is already running".to_string()))
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Greet back new peers, and tell peers when they move.
pub fn install_status_replies(routes: &RouteTable, senders: &SendRoutes, writer: Arc<Writer>) {
    routes.register_spec(
        RouteSpec::new(RoutePattern::Arrow {
            from: RelationState::Unregistered,
            to: RelationState::Registered,
        })
        // Broadcast registrations get a direct one back; direct ones are already replies.
        .when(|m: &Message| m.recipient().is_none()),
        handler_fn(|ctx: HandlerContext| async move {
            let text = format!("{} registered you", ctx.outbox.local());
            ctx.outbox
                .reply(&ctx.message, Content::new(MessageClass::Register, text))
        }),
    );
    let moves = [
        (RelationState::Registered, RelationState::Contact),
        (RelationState::Registered, RelationState::Banned),
        (RelationState::Contact, RelationState::Friend),
    ];
    for (from, to) in moves {
        let Some(kind) = StatusKind::for_move(to) else {
            continue;
        };
        let writer = writer.clone();
        senders.register_on_move(
            RoutePattern::Arrow { from, to },
            composer_fn(move |ctx: SendContext| {
                let writer = writer.clone();
                async move {
                    let mut drafts = Vec::new();
                    if let Some(peer) = ctx.peer {
                        drafts.push(Draft::to(peer, Content::text(writer.status(kind).await)));
                    }
                    Ok::<_, Error>(drafts)
                }
            }),
        );
    }
}

/// Register the `clock` broadcast and the `reputation` notes for the given
/// periods. Reputation notes go to every peer with a good or bad stance.
pub fn install_clock_routes(
    senders: &SendRoutes,
    writer: Arc<Writer>,
    broadcast_every: Option<Duration>,
    reputation_every: Option<Duration>,
) -> Result<()> {
    if let Some(period) = broadcast_every {
        let writer = writer.clone();
        senders.register_every(
            "clock",
            period,
            composer_fn(move |_ctx: SendContext| {
                let writer = writer.clone();
                async move { Ok::<_, Error>(vec![Draft::broadcast(Content::text(writer.broadcast().await))]) }
            }),
        )?;
    }
    if let Some(period) = reputation_every {
        senders.register_every(
            "reputation",
            period,
            composer_fn(move |ctx: SendContext| {
                let writer = writer.clone();
                async move {
                    let mut drafts = Vec::new();
                    for record in ctx.relationships {
                        let kind = match record.stance {
                            Stance::Good | Stance::VeryGood => StatusKind::GoodFlag,
                            Stance::Bad => StatusKind::BadFlag,
                            Stance::Neutral => continue,
                        };
                        drafts.push(Draft::to(record.peer, Content::text(writer.status(kind).await)));
                    }
                    Ok::<_, Error>(drafts)
                }
            }),
        )?;
    }
    Ok(())
}
