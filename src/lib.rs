//! roamlink library root.
//!
//! Agents exchange classed messages over a relay, keep one relationship
//! state machine per peer, run registered routes on transitions, and can
//! move their live session from one server to another.

pub mod agent;
pub mod cli;
pub mod config;
pub mod core;
pub mod decision;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod providers;
pub mod server;
pub mod transport;
pub mod travel;
pub mod web;
pub mod writer;

pub use agent::{Agent, AgentOptions, AgentState};
pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use core::{Dispatcher, FlowGraph, RelationState, RelationshipBook, RouteTable};
pub use decision::{Decision, DecisionHook, DecisionPolicy};
pub use error::{Error, Result};
pub use protocol::{AgentId, Content, Message, MessageClass};
pub use providers::Provider;
pub use server::RelayServer;
pub use travel::{TravelCoordinator, TravelPhase};
pub use web::run_dashboard;
