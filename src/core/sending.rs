//! Send routes: messages the agent originates itself, either on a clock or
//! when a relationship moves.

use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use super::relationship::{RelationshipRecord, TransitionOutcome};
use super::routing::RoutePattern;
use crate::error::{Error, Result};
use crate::protocol::{AgentId, Content, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SendRouteId(u64);

impl fmt::Display for SendRouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "send#{}", self.0)
    }
}

/// One message a composer wants sent. `to: None` is a broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub to: Option<AgentId>,
    pub content: Content,
}

impl Draft {
    pub fn broadcast(content: Content) -> Self {
        Self { to: None, content }
    }

    pub fn to(peer: AgentId, content: Content) -> Self {
        Self {
            to: Some(peer),
            content,
        }
    }

    pub fn into_message(self, from: AgentId) -> Message {
        match self.to {
            Some(to) => Message::direct(from, to, self.content),
            None => Message::broadcast(from, self.content),
        }
    }
}

/// What a composer gets to see.
#[derive(Debug, Clone)]
pub struct SendContext {
    pub local: AgentId,
    pub route: String,
    /// The committed move, for move-triggered routes.
    pub outcome: Option<TransitionOutcome>,
    /// The peer that moved, for move-triggered routes.
    pub peer: Option<AgentId>,
    pub relationships: Vec<RelationshipRecord>,
}

#[async_trait]
pub trait Composer: Send + Sync {
    async fn compose(&self, ctx: SendContext) -> Result<Vec<Draft>>;
}

struct FnComposer<F>(F);

#[async_trait]
impl<F, Fut> Composer for FnComposer<F>
where
    F: Fn(SendContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<Draft>>> + Send + 'static,
{
    async fn compose(&self, ctx: SendContext) -> Result<Vec<Draft>> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a composer.
pub fn composer_fn<F, Fut>(f: F) -> Arc<dyn Composer>
where
    F: Fn(SendContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<Draft>>> + Send + 'static,
{
    Arc::new(FnComposer(f))
}

#[derive(Debug, Clone, PartialEq)]
pub enum SendTrigger {
    /// Fire every period, first one period after registration.
    Every(Duration),
    /// Fire after a committed transition the pattern accepts.
    OnMove(RoutePattern),
}

struct SendRoute {
    id: SendRouteId,
    name: String,
    trigger: SendTrigger,
    composer: Arc<dyn Composer>,
    next_due: Option<Instant>,
}

/// A route selected to fire.
#[derive(Clone)]
pub struct DueRoute {
    pub id: SendRouteId,
    pub name: String,
    pub composer: Arc<dyn Composer>,
}

/// Read-only view of a send route.
#[derive(Debug, Clone, PartialEq)]
pub struct SendRouteInfo {
    pub id: SendRouteId,
    pub name: String,
    pub trigger: SendTrigger,
}

/// Registry of send routes, ordered by registration.
#[derive(Default)]
pub struct SendRoutes {
    routes: Mutex<Vec<SendRoute>>,
    next_id: AtomicU64,
}

impl SendRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SendRoute>> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn insert(&self, name: String, trigger: SendTrigger, composer: Arc<dyn Composer>) -> SendRouteId {
        let id = SendRouteId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let next_due = match &trigger {
            SendTrigger::Every(period) => Some(Instant::now() + *period),
            SendTrigger::OnMove(_) => None,
        };
        tracing::debug!("Registered {} '{}' ({:?})", id, name, trigger);
        self.lock().push(SendRoute {
            id,
            name,
            trigger,
            composer,
            next_due,
        });
        id
    }

    /// Run `composer` every `period`. The period must be positive.
    pub fn register_every(
        &self,
        name: impl Into<String>,
        period: Duration,
        composer: Arc<dyn Composer>,
    ) -> Result<SendRouteId> {
        let name = name.into();
        if period.is_zero() {
            return Err(Error::Config(format!("send route '{}' needs a positive period", name)));
        }
        Ok(self.insert(name, SendTrigger::Every(period), composer))
    }

    /// Run `composer` after every committed move `pattern` accepts.
    pub fn register_on_move(&self, pattern: RoutePattern, composer: Arc<dyn Composer>) -> SendRouteId {
        self.insert(pattern.label(), SendTrigger::OnMove(pattern), composer)
    }

    pub fn register_on_move_str(&self, route: &str, composer: Arc<dyn Composer>) -> Result<SendRouteId> {
        Ok(self.register_on_move(RoutePattern::parse(route)?, composer))
    }

    pub fn deregister(&self, id: SendRouteId) -> bool {
        let mut routes = self.lock();
        let before = routes.len();
        routes.retain(|r| r.id != id);
        routes.len() != before
    }

    /// Earliest deadline among clock routes.
    pub fn next_due(&self) -> Option<Instant> {
        self.lock().iter().filter_map(|r| r.next_due).min()
    }

    /// Clock routes due at `now`, each rescheduled one period later.
    pub fn take_due(&self, now: Instant) -> Vec<DueRoute> {
        let mut due = Vec::new();
        for route in self.lock().iter_mut() {
            let (SendTrigger::Every(period), Some(deadline)) = (&route.trigger, route.next_due) else {
                continue;
            };
            if deadline <= now {
                route.next_due = Some(now + *period);
                due.push(DueRoute {
                    id: route.id,
                    name: route.name.clone(),
                    composer: route.composer.clone(),
                });
            }
        }
        due
    }

    /// Move routes for a committed outcome. Nothing for an unchanged one.
    pub fn on_move(&self, outcome: &TransitionOutcome) -> Vec<DueRoute> {
        if !outcome.changed() {
            return Vec::new();
        }
        self.lock()
            .iter()
            .filter(|r| matches!(&r.trigger, SendTrigger::OnMove(p) if p.accepts(outcome)))
            .map(|r| DueRoute {
                id: r.id,
                name: r.name.clone(),
                composer: r.composer.clone(),
            })
            .collect()
    }

    pub fn routes(&self) -> Vec<SendRouteInfo> {
        self.lock()
            .iter()
            .map(|r| SendRouteInfo {
                id: r.id,
                name: r.name.clone(),
                trigger: r.trigger.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Run a composer in its own task. Errors and panics yield no drafts.
pub async fn compose(route: &DueRoute, ctx: SendContext) -> Vec<Draft> {
    let composer = route.composer.clone();
    match tokio::spawn(async move { composer.compose(ctx).await }).await {
        Ok(Ok(drafts)) => drafts,
        Ok(Err(e)) => {
            tracing::warn!("{} ({}) failed: {}", route.id, route.name, e);
            Vec::new()
        }
        Err(e) => {
            tracing::error!("{} ({}) aborted: {}", route.id, route.name, e);
            Vec::new()
        }
    }
}
