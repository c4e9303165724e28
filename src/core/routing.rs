//! Receive routes for roamlink.
//!
//! Handles:
//! - Route patterns (`contact`, `register --> contact`, `*`)
//! - Registration and removal of (pattern, predicate, handler) routes
//! - Deterministic matching in registration order

use async_trait::async_trait;
use regex::Regex;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::dispatcher::HandlerContext;
use super::relationship::{RelationState, TransitionOutcome};
use crate::error::{Error, Result};
use crate::protocol::Message;

/// Handle returned by [`RouteTable::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteId(u64);

impl RouteId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RouteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "route#{}", self.0)
    }
}

/// Which relationship activity a route listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutePattern {
    /// Every message.
    Any,
    /// Messages after which the relationship is in this state.
    State(RelationState),
    /// Messages that moved the relationship from one state to another.
    Arrow { from: RelationState, to: RelationState },
}

fn arrow_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(\w+)\s*-+>\s*(\w+)\s*$").expect("arrow regex is valid"))
}

impl RoutePattern {
    /// Parse a route string.
    ///
    /// # Examples
    ///
    /// ```
    /// use roamlink::core::routing::RoutePattern;
    /// use roamlink::core::relationship::RelationState;
    ///
    /// let p = RoutePattern::parse("register --> contact").unwrap();
    /// assert_eq!(p, RoutePattern::Arrow { from: RelationState::Registered, to: RelationState::Contact });
    /// ```
    pub fn parse(route: &str) -> Result<Self> {
        let route = route.trim();
        if route == "*" {
            return Ok(RoutePattern::Any);
        }
        if let Some(caps) = arrow_regex().captures(route) {
            let from = caps[1].parse()?;
            let to = caps[2].parse()?;
            return Ok(RoutePattern::Arrow { from, to });
        }
        if route.contains('>') || (route.contains('-') && route.contains(' ')) {
            return Err(Error::Other(format!("malformed route '{}'", route)));
        }
        Ok(RoutePattern::State(route.parse()?))
    }

    /// Canonical label, as announced to servers and shown in the flow graph.
    pub fn label(&self) -> String {
        match self {
            RoutePattern::Any => "*".to_string(),
            RoutePattern::State(s) => s.to_string(),
            RoutePattern::Arrow { from, to } => format!("{} --> {}", from, to),
        }
    }

    pub fn accepts(&self, outcome: &TransitionOutcome) -> bool {
        match self {
            RoutePattern::Any => true,
            RoutePattern::State(s) => outcome.new == *s,
            RoutePattern::Arrow { from, to } => outcome.old == *from && outcome.new == *to,
        }
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

/// Extra content test on top of the pattern.
pub type Predicate = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Work run for a matched message.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: HandlerContext) -> Result<()>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, ctx: HandlerContext) -> Result<()> {
        (self.0)(ctx).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Description of a route before it is registered.
pub struct RouteSpec {
    pattern: RoutePattern,
    predicate: Option<Predicate>,
    exclusive: bool,
}

impl RouteSpec {
    pub fn new(pattern: RoutePattern) -> Self {
        Self {
            pattern,
            predicate: None,
            exclusive: false,
        }
    }

    pub fn parse(route: &str) -> Result<Self> {
        Ok(Self::new(RoutePattern::parse(route)?))
    }

    /// Only match messages for which `predicate` holds.
    pub fn when<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&Message) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// Stop matching further routes once this one matched.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }
}

struct Route {
    id: RouteId,
    pattern: RoutePattern,
    predicate: Option<Predicate>,
    exclusive: bool,
    handler: Arc<dyn Handler>,
}

impl Route {
    fn accepts(&self, message: &Message, outcome: &TransitionOutcome) -> bool {
        self.pattern.accepts(outcome) && self.predicate.as_ref().map_or(true, |p| p(message))
    }
}

/// A route selected for one message.
#[derive(Clone)]
pub struct MatchedRoute {
    pub id: RouteId,
    pub pattern: RoutePattern,
    pub handler: Arc<dyn Handler>,
}

impl fmt::Debug for MatchedRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchedRoute")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .finish()
    }
}

/// Read-only view of a registered route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo {
    pub id: RouteId,
    pub pattern: RoutePattern,
    pub exclusive: bool,
    pub filtered: bool,
}

/// Registry of receive routes, ordered by registration.
///
/// Lookups share a read lock; registration takes the write lock briefly.
pub struct RouteTable {
    routes: RwLock<Vec<Route>>,
    next_id: AtomicU64,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Route>> {
        self.routes.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Route>> {
        self.routes.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a handler for a pattern.
    pub fn register(&self, pattern: RoutePattern, handler: Arc<dyn Handler>) -> RouteId {
        self.register_spec(RouteSpec::new(pattern), handler)
    }

    /// Register from a route string such as `"register --> contact"`.
    pub fn register_str(&self, route: &str, handler: Arc<dyn Handler>) -> Result<RouteId> {
        Ok(self.register_spec(RouteSpec::parse(route)?, handler))
    }

    pub fn register_spec(&self, spec: RouteSpec, handler: Arc<dyn Handler>) -> RouteId {
        let id = RouteId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.write().push(Route {
            id,
            pattern: spec.pattern,
            predicate: spec.predicate,
            exclusive: spec.exclusive,
            handler,
        });
        tracing::debug!("Registered {} on '{}'", id, spec.pattern);
        id
    }

    /// Remove a route. Returns whether it existed.
    pub fn deregister(&self, id: RouteId) -> bool {
        let mut routes = self.write();
        let before = routes.len();
        routes.retain(|r| r.id != id);
        let removed = routes.len() != before;
        if removed {
            tracing::debug!("Deregistered {}", id);
        }
        removed
    }

    /// Handlers accepting `message`, in registration order.
    ///
    /// Pure: reads the table only. An exclusive route ends the list.
    pub fn matches(&self, message: &Message, outcome: &TransitionOutcome) -> Vec<MatchedRoute> {
        let mut matched = Vec::new();
        for route in self.read().iter() {
            if !route.accepts(message, outcome) {
                continue;
            }
            matched.push(MatchedRoute {
                id: route.id,
                pattern: route.pattern,
                handler: route.handler.clone(),
            });
            if route.exclusive {
                break;
            }
        }
        matched
    }

    pub fn routes(&self) -> Vec<RouteInfo> {
        self.read()
            .iter()
            .map(|r| RouteInfo {
                id: r.id,
                pattern: r.pattern,
                exclusive: r.exclusive,
                filtered: r.predicate.is_some(),
            })
            .collect()
    }

    /// Route labels in registration order, duplicates removed.
    pub fn manifest(&self) -> Vec<String> {
        let mut labels: Vec<String> = Vec::new();
        for route in self.read().iter() {
            let label = route.pattern.label();
            if !labels.contains(&label) {
                labels.push(label);
            }
        }
        labels
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Content, MessageClass};

    fn noop() -> Arc<dyn Handler> {
        handler_fn(|_ctx| async { Ok(()) })
    }

    fn outcome(old: RelationState, new: RelationState) -> TransitionOutcome {
        TransitionOutcome {
            old,
            new,
            class: MessageClass::Contact,
        }
    }

    #[test]
    fn test_parse_patterns() {
        assert_eq!(RoutePattern::parse("*").unwrap(), RoutePattern::Any);
        assert_eq!(
            RoutePattern::parse("contact").unwrap(),
            RoutePattern::State(RelationState::Contact)
        );
        assert_eq!(
            RoutePattern::parse("contact-->friend").unwrap(),
            RoutePattern::Arrow {
                from: RelationState::Contact,
                to: RelationState::Friend
            }
        );
        assert_eq!(
            RoutePattern::parse("register --> ban").unwrap().label(),
            "registered --> banned"
        );

        assert!(RoutePattern::parse("register --> nowhere").is_err());
        assert!(RoutePattern::parse("a > b > c").is_err());
        assert!(RoutePattern::parse("clock").is_err());
    }

    #[test]
    fn test_match_order_and_determinism() {
        let table = RouteTable::new();
        let a = table.register_str("contact", noop()).unwrap();
        let b = table.register_str("*", noop()).unwrap();
        let c = table.register_str("register --> contact", noop()).unwrap();
        table.register_str("friend", noop()).unwrap();

        let msg = Message::broadcast("trader", Content::new(MessageClass::Contact, "hi"));
        let o = outcome(RelationState::Registered, RelationState::Contact);

        let first: Vec<RouteId> = table.matches(&msg, &o).iter().map(|m| m.id).collect();
        let second: Vec<RouteId> = table.matches(&msg, &o).iter().map(|m| m.id).collect();
        assert_eq!(first, vec![a, b, c]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_predicate_and_exclusive() {
        let table = RouteTable::new();
        let hello = table.register_spec(
            RouteSpec::parse("register --> contact")
                .unwrap()
                .when(|m| m.content.text == "Hello")
                .exclusive(),
            noop(),
        );
        let any = table.register(RoutePattern::Any, noop());
        let o = outcome(RelationState::Registered, RelationState::Contact);

        let msg = Message::broadcast("trader", Content::new(MessageClass::Contact, "Hello"));
        let ids: Vec<_> = table.matches(&msg, &o).iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![hello]);

        let msg = Message::broadcast("trader", Content::new(MessageClass::Contact, "Howdy"));
        let ids: Vec<_> = table.matches(&msg, &o).iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![any]);
    }

    #[test]
    fn test_deregister_and_manifest() {
        let table = RouteTable::new();
        let a = table.register_str("contact", noop()).unwrap();
        table.register_str("contact", noop()).unwrap();
        table.register_str("register --> contact", noop()).unwrap();

        assert_eq!(table.manifest(), vec!["contact", "registered --> contact"]);
        assert!(table.deregister(a));
        assert!(!table.deregister(a));
        assert_eq!(table.len(), 2);

        let msg = Message::broadcast("trader", Content::new(MessageClass::Contact, "x"));
        let o = outcome(RelationState::Contact, RelationState::Contact);
        assert_eq!(table.matches(&msg, &o).len(), 1);
    }
}
