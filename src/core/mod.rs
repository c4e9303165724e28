//! Core engine: routes, relationships, dispatch, hooks, send routes and the flow graph.

pub mod dispatcher;
pub mod flow;
pub mod hooks;
pub mod relationship;
pub mod routing;
pub mod sending;

pub use dispatcher::{DispatchReport, Dispatcher, HandlerContext, Outbox, Outgoing};
pub use flow::FlowGraph;
pub use hooks::{Direction, HookAction, HookPipeline, MessageHook};
pub use relationship::{
    RelationState, RelationshipBook, RelationshipRecord, Stance, TransitionOutcome, TransitionTable,
};
pub use routing::{handler_fn, Handler, RouteId, RoutePattern, RouteSpec, RouteTable};
pub use sending::{composer_fn, Composer, Draft, SendContext, SendRouteId, SendRoutes, SendTrigger};
