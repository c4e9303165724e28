//! Inbound message dispatch.
//!
//! Every peer gets its own lane: a task draining an mpsc queue, so messages
//! from one peer are handled strictly in arrival order while different peers
//! proceed concurrently. Per message the dispatcher proposes a relationship
//! transition, lets the decision gate veto it, commits, then runs the
//! matching route handlers one after another, and finally the send routes
//! listening for that move. A lane that stays idle is closed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::relationship::{RelationshipBook, TransitionOutcome};
use super::routing::RouteTable;
use super::sending::{self, SendContext, SendRoutes};
use crate::decision::{Decision, DecisionContext, DecisionPolicy};
use crate::error::{Error, Result};
use crate::protocol::{AgentId, Content, Message};

/// Work handed back to the agent by handlers.
#[derive(Debug, Clone)]
pub enum Outgoing {
    Send(Message),
    Travel { reason: String },
}

/// Handle through which handlers reply and raise travel requests. Whatever
/// goes in here leaves through the agent's current session.
#[derive(Debug, Clone)]
pub struct Outbox {
    local: AgentId,
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl Outbox {
    pub fn channel(local: AgentId) -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { local, tx }, rx)
    }

    pub fn local(&self) -> &AgentId {
        &self.local
    }

    pub fn send(&self, message: Message) -> Result<()> {
        self.tx
            .send(Outgoing::Send(message))
            .map_err(|_| Error::transport("outbox closed"))
    }

    pub fn reply(&self, to: &Message, content: Content) -> Result<()> {
        self.send(to.reply(self.local.clone(), content))
    }

    pub fn direct(&self, to: AgentId, content: Content) -> Result<()> {
        self.send(Message::direct(self.local.clone(), to, content))
    }

    pub fn broadcast(&self, content: Content) -> Result<()> {
        self.send(Message::broadcast(self.local.clone(), content))
    }

    pub fn request_travel(&self, reason: impl Into<String>) -> Result<()> {
        self.tx
            .send(Outgoing::Travel {
                reason: reason.into(),
            })
            .map_err(|_| Error::transport("outbox closed"))
    }
}

/// What a handler gets to see.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub message: Message,
    /// The committed outcome: a vetoed move shows up as `old -> old`.
    pub outcome: TransitionOutcome,
    pub decision: Option<Decision>,
    pub outbox: Outbox,
}

#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub outcome: TransitionOutcome,
    pub decision: Option<Decision>,
    pub invoked: usize,
    pub failed: usize,
    /// Messages queued by send routes for this move.
    pub sent: usize,
}

struct Shared {
    routes: Arc<RouteTable>,
    senders: Arc<SendRoutes>,
    book: Arc<RelationshipBook>,
    gate: Option<DecisionPolicy>,
    outbox: Outbox,
}

impl Shared {
    async fn process(&self, message: Message) -> DispatchReport {
        let peer = message.from.clone();
        let proposed = self.book.propose(&peer, &message);

        let mut decision = None;
        let mut outcome = proposed;
        if proposed.changed() {
            if let Some(gate) = &self.gate {
                let ctx = DecisionContext::new(proposed.kind(), self.book.local().clone())
                    .with_peer(peer.clone())
                    .with_text(message.content.text.clone())
                    .with_hint(format!("{} on {}", proposed.class, proposed.kind()));
                let d = gate.consult(&ctx).await;
                if let Some(classification) = d.classification {
                    let (old, new) = self.book.apply_stance(&peer, classification);
                    if old != new {
                        tracing::debug!("stance toward {}: {} -> {}", peer, old, new);
                    }
                }
                if !d.is_move() {
                    tracing::info!("[decide] {} {} -> stay", peer, proposed.kind());
                    outcome = proposed.unchanged();
                }
                decision = Some(d);
            }
        }

        if outcome.changed() && !self.book.commit(&peer, &outcome, &message.id) {
            outcome = outcome.unchanged();
        }

        let matched = self.routes.matches(&message, &outcome);
        let mut report = DispatchReport {
            outcome,
            decision,
            invoked: 0,
            failed: 0,
            sent: 0,
        };

        for route in matched {
            let ctx = HandlerContext {
                message: message.clone(),
                outcome,
                decision,
                outbox: self.outbox.clone(),
            };
            let handler = route.handler.clone();
            // A separate task contains panics; awaiting it keeps handlers sequential.
            match tokio::spawn(async move { handler.handle(ctx).await }).await {
                Ok(Ok(())) => report.invoked += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    tracing::warn!("route {} ({}) failed on {}: {}", route.id, route.pattern, message.id, e);
                }
                Err(e) if e.is_panic() => {
                    report.failed += 1;
                    tracing::error!("route {} ({}) panicked on {}", route.id, route.pattern, message.id);
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!("route {} ({}) cancelled: {}", route.id, route.pattern, e);
                }
            }
        }

        for route in self.senders.on_move(&outcome) {
            let ctx = SendContext {
                local: self.book.local().clone(),
                route: route.name.clone(),
                outcome: Some(outcome),
                peer: Some(peer.clone()),
                relationships: self.book.snapshot(),
            };
            for draft in sending::compose(&route, ctx).await {
                match self.outbox.send(draft.into_message(self.book.local().clone())) {
                    Ok(()) => report.sent += 1,
                    Err(e) => tracing::warn!("{} ({}) could not queue: {}", route.id, route.name, e),
                }
            }
        }

        tracing::debug!(
            "dispatched {} from {} ({}): {} ok, {} failed, {} sent",
            message.id,
            peer,
            report.outcome.kind(),
            report.invoked,
            report.failed,
            report.sent
        );
        report
    }
}

/// How long a lane waits for its next message before closing.
pub const LANE_IDLE: Duration = Duration::from_secs(60);

struct Lane {
    id: u64,
    tx: mpsc::UnboundedSender<Message>,
    handle: JoinHandle<()>,
}

type Lanes = Arc<Mutex<HashMap<AgentId, Lane>>>;

fn lock_lanes(lanes: &Mutex<HashMap<AgentId, Lane>>) -> MutexGuard<'_, HashMap<AgentId, Lane>> {
    lanes.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    lanes: Lanes,
    next_lane: AtomicU64,
    idle: Duration,
}

impl Dispatcher {
    pub fn new(routes: Arc<RouteTable>, book: Arc<RelationshipBook>, outbox: Outbox) -> Self {
        Self::build(routes, book, outbox, None)
    }

    /// Consult `gate` before committing any state change.
    pub fn with_gate(routes: Arc<RouteTable>, book: Arc<RelationshipBook>, outbox: Outbox, gate: DecisionPolicy) -> Self {
        Self::build(routes, book, outbox, Some(gate))
    }

    fn build(routes: Arc<RouteTable>, book: Arc<RelationshipBook>, outbox: Outbox, gate: Option<DecisionPolicy>) -> Self {
        Self {
            shared: Arc::new(Shared {
                routes,
                senders: Arc::new(SendRoutes::new()),
                book,
                gate,
                outbox,
            }),
            lanes: Arc::new(Mutex::new(HashMap::new())),
            next_lane: AtomicU64::new(0),
            idle: LANE_IDLE,
        }
    }

    /// Close lanes after `idle` without messages.
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle = idle;
        self
    }

    /// Send routes fired after committed moves.
    pub fn senders(&self) -> &Arc<SendRoutes> {
        &self.shared.senders
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.shared.routes
    }

    pub fn book(&self) -> &Arc<RelationshipBook> {
        &self.shared.book
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<AgentId, Lane>> {
        lock_lanes(&self.lanes)
    }

    /// Queue `message` on its sender's lane. Must be called in arrival order.
    pub fn on_message(&self, message: Message) {
        let peer = message.from.clone();
        let mut lanes = self.lock();

        let message = match lanes.get(&peer) {
            Some(lane) => match lane.tx.send(message) {
                Ok(()) => return,
                // Lane task is gone; fall through and start a fresh one.
                Err(mpsc::error::SendError(message)) => message,
            },
            None => message,
        };

        let id = self.next_lane.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        // Queued before the task starts, so it cannot idle out empty.
        let _ = tx.send(message);
        let handle = tokio::spawn(run_lane(
            self.shared.clone(),
            self.lanes.clone(),
            peer.clone(),
            id,
            rx,
            self.idle,
        ));
        tracing::trace!("opened lane for {}", peer);
        lanes.insert(peer, Lane { id, tx, handle });
    }

    /// Dispatch inline, bypassing the lanes.
    pub async fn process_now(&self, message: Message) -> DispatchReport {
        self.shared.process(message).await
    }

    pub fn lane_count(&self) -> usize {
        self.lock().len()
    }

    /// Close all lanes and wait for queued messages to drain.
    pub async fn shutdown(&self) {
        let lanes: Vec<(AgentId, Lane)> = self.lock().drain().collect();
        for (peer, lane) in lanes {
            drop(lane.tx);
            if let Err(e) = lane.handle.await {
                tracing::warn!("lane for {} ended abnormally: {}", peer, e);
            }
        }
    }

    /// Abort all lanes, dropping whatever they still had queued, and wait
    /// until none of them can touch the relationship book again. Returns
    /// the number of lanes closed.
    pub async fn reset(&self) -> usize {
        let lanes: Vec<(AgentId, Lane)> = self.lock().drain().collect();
        let count = lanes.len();
        for (peer, lane) in lanes {
            lane.handle.abort();
            match lane.handle.await {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => tracing::trace!("lane for {} aborted", peer),
                Err(e) => tracing::warn!("lane for {} ended abnormally: {}", peer, e),
            }
        }
        count
    }
}

async fn run_lane(
    shared: Arc<Shared>,
    lanes: Lanes,
    peer: AgentId,
    id: u64,
    mut rx: mpsc::UnboundedReceiver<Message>,
    idle: Duration,
) {
    loop {
        let message = match tokio::time::timeout(idle, rx.recv()).await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(_) => {
                // Senders queue under the map lock, so an empty queue seen
                // under it stays empty once this lane is unlisted.
                let pending = {
                    let mut map = lock_lanes(&lanes);
                    match rx.try_recv() {
                        Ok(message) => Some(message),
                        Err(_) => {
                            if map.get(&peer).map(|lane| lane.id) == Some(id) {
                                map.remove(&peer);
                            }
                            None
                        }
                    }
                };
                match pending {
                    Some(message) => message,
                    None => {
                        tracing::trace!("lane for {} idle, closed", peer);
                        return;
                    }
                }
            }
        };
        shared.process(message).await;
    }
    tracing::trace!("lane for {} closed", peer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::relationship::{RelationState, Stance, TransitionTable};
    use crate::core::routing::handler_fn;
    use crate::core::sending::{composer_fn, Draft};
    use crate::decision::testing::FixedHook;
    use crate::decision::Classification;
    use crate::protocol::{MessageClass, Scope};
    use std::time::Duration;

    fn setup() -> (Arc<RouteTable>, Arc<RelationshipBook>, Outbox, mpsc::UnboundedReceiver<Outgoing>) {
        let me = AgentId::new("me");
        let routes = Arc::new(RouteTable::new());
        let book = Arc::new(RelationshipBook::new(me.clone(), Arc::new(TransitionTable::standard())));
        let (outbox, rx) = Outbox::channel(me);
        (routes, book, outbox, rx)
    }

    fn msg(from: &str, class: MessageClass, text: &str) -> Message {
        Message::broadcast(from, Content::new(class, text))
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &str) -> Arc<dyn crate::core::routing::Handler> {
        let log = log.clone();
        let tag = tag.to_string();
        handler_fn(move |ctx: HandlerContext| {
            let log = log.clone();
            let tag = tag.clone();
            async move {
                log.lock().unwrap().push(format!("{}:{}", tag, ctx.outcome.kind()));
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_register_then_contact() {
        let (routes, book, outbox, _rx) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        routes.register_str("registered --> contact", recorder(&log, "arrow")).unwrap();
        routes.register_str("contact", recorder(&log, "state")).unwrap();
        let dispatcher = Dispatcher::new(routes, book.clone(), outbox);

        let first = dispatcher.process_now(msg("peer", MessageClass::Register, "hi")).await;
        assert_eq!(first.outcome.new, RelationState::Registered);
        assert_eq!(first.invoked, 0);

        let second = dispatcher.process_now(msg("peer", MessageClass::Contact, "hello")).await;
        assert_eq!(second.invoked, 2);
        assert_eq!(book.state_of(&AgentId::new("peer")), RelationState::Contact);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["arrow:registered->contact", "state:registered->contact"]
        );
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let (routes, book, outbox, _rx) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        routes.register_str("*", handler_fn(|_ctx| async { Err::<(), _>(Error::handler("boom")) })).unwrap();
        routes
            .register_str(
                "*",
                handler_fn(|ctx: HandlerContext| async move {
                    if ctx.outcome.changed() {
                        panic!("handler panic");
                    }
                    Ok(())
                }),
            )
            .unwrap();
        routes.register_str("*", recorder(&log, "after")).unwrap();
        let dispatcher = Dispatcher::new(routes, book, outbox);

        let report = dispatcher.process_now(msg("peer", MessageClass::Register, "hi")).await;
        assert_eq!(report.failed, 2);
        assert_eq!(report.invoked, 1);
        assert_eq!(*log.lock().unwrap(), vec!["after:unregistered->registered"]);

        // The dispatcher keeps working after a panic.
        let report = dispatcher.process_now(msg("peer", MessageClass::Chat, "again")).await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.invoked, 2);
    }

    #[tokio::test]
    async fn test_per_peer_fifo_under_delays() {
        let (routes, book, outbox, _rx) = setup();
        let seen: Arc<Mutex<Vec<(String, usize)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        routes
            .register_str(
                "*",
                handler_fn(move |ctx: HandlerContext| {
                    let sink = sink.clone();
                    async move {
                        let seq: usize = ctx.message.content.text.parse().unwrap();
                        // Later messages finish faster: a non-FIFO lane would reorder.
                        tokio::time::sleep(Duration::from_millis(((10 - seq) % 4) as u64 * 3)).await;
                        sink.lock().unwrap().push((ctx.message.from.to_string(), seq));
                        Ok(())
                    }
                }),
            )
            .unwrap();
        let dispatcher = Dispatcher::new(routes, book.clone(), outbox);

        let peers = ["a", "b", "c", "d"];
        for seq in 0..10 {
            for peer in peers {
                dispatcher.on_message(msg(peer, MessageClass::Chat, &seq.to_string()));
            }
        }
        assert_eq!(dispatcher.lane_count(), 4);
        dispatcher.shutdown().await;
        assert_eq!(dispatcher.lane_count(), 0);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 40);
        for peer in peers {
            let order: Vec<usize> = seen.iter().filter(|(p, _)| p == peer).map(|(_, s)| *s).collect();
            assert_eq!(order, (0..10).collect::<Vec<_>>(), "peer {}", peer);
            assert_eq!(book.record(&AgentId::new(peer)).unwrap().messages, 10);
        }
    }

    #[tokio::test]
    async fn test_gate_vetoes_and_classifies() {
        let (routes, book, outbox, _rx) = setup();
        let log = Arc::new(Mutex::new(Vec::new()));
        routes.register_str("registered --> contact", recorder(&log, "arrow")).unwrap();
        routes.register_str("registered", recorder(&log, "stayed")).unwrap();

        let stay = Decision {
            verdict: crate::decision::Verdict::Stay,
            classification: Some(Classification::Bad),
            confidence: 1.0,
        };
        let gate = DecisionPolicy::new(Arc::new(FixedHook::Answer(stay)), Duration::from_secs(1));
        let dispatcher = Dispatcher::with_gate(routes, book.clone(), outbox, gate);
        let peer = AgentId::new("peer");

        let first = dispatcher.process_now(msg("peer", MessageClass::Register, "hi")).await;
        assert_eq!(first.outcome.new, RelationState::Unregistered);

        // Without a committed registration there is nothing to move from; seed it.
        book.transition(&peer, &msg("peer", MessageClass::Register, "hi"));
        let report = dispatcher.process_now(msg("peer", MessageClass::Contact, "hello")).await;
        assert_eq!(report.outcome.kind(), "registered->registered");
        assert!(!report.decision.unwrap().is_move());
        assert_eq!(book.state_of(&peer), RelationState::Registered);
        assert_eq!(book.record(&peer).unwrap().stance, Stance::Bad);
        assert_eq!(*log.lock().unwrap(), vec!["stayed:registered->registered"]);
    }

    #[tokio::test]
    async fn test_handlers_reply_through_outbox() {
        let (routes, book, outbox, mut rx) = setup();
        routes
            .register_str(
                "*",
                handler_fn(|ctx: HandlerContext| async move {
                    ctx.outbox.reply(&ctx.message, Content::text("ack"))?;
                    ctx.outbox.request_travel("asked to leave")
                }),
            )
            .unwrap();
        let dispatcher = Dispatcher::new(routes, book, outbox);
        dispatcher.process_now(msg("peer", MessageClass::Chat, "ping")).await;

        match rx.recv().await.unwrap() {
            Outgoing::Send(m) => {
                assert_eq!(m.from.as_str(), "me");
                assert_eq!(m.scope, Scope::Direct { to: AgentId::new("peer") });
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(rx.recv().await.unwrap(), Outgoing::Travel { .. }));
    }

    #[tokio::test]
    async fn test_reset_drops_queued_backlog() {
        let (routes, book, outbox, _rx) = setup();
        routes
            .register_str(
                "*",
                handler_fn(|_ctx: HandlerContext| async {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok(())
                }),
            )
            .unwrap();
        let dispatcher = Dispatcher::new(routes, book.clone(), outbox);

        dispatcher.on_message(msg("old_peer", MessageClass::Register, "hi"));
        dispatcher.on_message(msg("old_peer", MessageClass::Contact, "hello"));
        dispatcher.on_message(msg("old_peer", MessageClass::Chat, "still here"));
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(dispatcher.reset().await, 1);
        book.reset();
        assert_eq!(dispatcher.lane_count(), 0);

        // Nothing left behind may write the forgotten peer back.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(book.snapshot().is_empty());
        assert_eq!(book.state_of(&AgentId::new("old_peer")), RelationState::Unregistered);
    }

    #[tokio::test]
    async fn test_idle_lanes_close() {
        let (routes, book, outbox, _rx) = setup();
        let dispatcher = Dispatcher::new(routes, book.clone(), outbox).with_idle_timeout(Duration::from_millis(20));

        for peer in ["a", "b", "c"] {
            dispatcher.on_message(msg(peer, MessageClass::Register, "hi"));
        }
        assert_eq!(dispatcher.lane_count(), 3);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(dispatcher.lane_count(), 0);
        assert_eq!(book.snapshot().len(), 3);

        // A closed lane reopens on the next message.
        dispatcher.on_message(msg("a", MessageClass::Contact, "back"));
        assert_eq!(dispatcher.lane_count(), 1);
        dispatcher.shutdown().await;
        assert_eq!(book.state_of(&AgentId::new("a")), RelationState::Contact);
    }

    #[tokio::test]
    async fn test_move_sends_follow_commits() {
        let (routes, book, outbox, mut rx) = setup();
        let dispatcher = Dispatcher::new(routes, book, outbox);
        dispatcher
            .senders()
            .register_on_move_str(
                "registered --> contact",
                composer_fn(|ctx: SendContext| async move {
                    let drafts = match ctx.peer {
                        Some(peer) => vec![Draft::to(peer, Content::text("welcome"))],
                        None => Vec::new(),
                    };
                    Ok::<_, Error>(drafts)
                }),
            )
            .unwrap();

        let report = dispatcher.process_now(msg("peer", MessageClass::Register, "hi")).await;
        assert_eq!(report.sent, 0);
        let report = dispatcher.process_now(msg("peer", MessageClass::Contact, "hello")).await;
        assert_eq!(report.sent, 1);
        // Unchanged outcomes fire nothing.
        let report = dispatcher.process_now(msg("peer", MessageClass::Contact, "again")).await;
        assert_eq!(report.sent, 0);

        match rx.recv().await.unwrap() {
            Outgoing::Send(m) => {
                assert_eq!(m.from.as_str(), "me");
                assert_eq!(m.scope, Scope::Direct { to: AgentId::new("peer") });
                assert_eq!(m.content.text, "welcome");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }
}
