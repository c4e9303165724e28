//! Agent communication protocol for roamlink.
//!
//! This module defines what travels between an agent and a server:
//! - Agent identities and message classes
//! - Messages with a broadcast or direct scope
//! - Wire frames and their line codec

pub mod envelope;
pub mod frame;
pub mod types;

pub use envelope::{Message, MessageBuilder, Scope};
pub use frame::Frame;
pub use types::{AgentId, Content, MessageClass, TRAVEL_COMMAND};
