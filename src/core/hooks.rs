//! Send and receive hooks.
//!
//! Hooks run in priority order (lower first, then registration order). Each
//! sees the message as left by the previous one and may rewrite it or drop it.

use async_trait::async_trait;
use std::sync::Arc;

use crate::protocol::{AgentId, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone)]
pub enum HookAction {
    /// Continue with this (possibly rewritten) message.
    Continue(Message),
    /// Drop the message, with a reason for the log.
    Drop(String),
}

#[async_trait]
pub trait MessageHook: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(&self, message: Message) -> HookAction;
}

struct Entry {
    priority: i32,
    hook: Arc<dyn MessageHook>,
}

#[derive(Default)]
pub struct HookPipeline {
    send: Vec<Entry>,
    receive: Vec<Entry>,
}

impl HookPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, direction: Direction, priority: i32, hook: Arc<dyn MessageHook>) {
        let hooks = match direction {
            Direction::Send => &mut self.send,
            Direction::Receive => &mut self.receive,
        };
        // Stable insert keeps registration order among equal priorities.
        let at = hooks.partition_point(|e| e.priority <= priority);
        hooks.insert(at, Entry { priority, hook });
    }

    pub async fn run(&self, direction: Direction, mut message: Message) -> HookAction {
        let hooks = match direction {
            Direction::Send => &self.send,
            Direction::Receive => &self.receive,
        };
        for entry in hooks {
            match entry.hook.apply(message).await {
                HookAction::Continue(next) => message = next,
                HookAction::Drop(reason) => {
                    tracing::debug!("[hook:{:?}] {} dropped message: {}", direction, entry.hook.name(), reason);
                    return HookAction::Drop(reason);
                }
            }
        }
        HookAction::Continue(message)
    }

    pub fn len(&self, direction: Direction) -> usize {
        match direction {
            Direction::Send => self.send.len(),
            Direction::Receive => self.receive.len(),
        }
    }
}

/// Receive hook: drops direct messages addressed to someone else and
/// messages without a sender.
pub struct ValidateEnvelope {
    local: AgentId,
}

impl ValidateEnvelope {
    pub fn new(local: AgentId) -> Self {
        Self { local }
    }
}

#[async_trait]
impl MessageHook for ValidateEnvelope {
    fn name(&self) -> &str {
        "validate"
    }

    async fn apply(&self, message: Message) -> HookAction {
        if message.from.as_str().is_empty() {
            return HookAction::Drop("missing sender".to_string());
        }
        if !message.is_for(&self.local) {
            return HookAction::Drop(format!("addressed to {:?}", message.recipient()));
        }
        HookAction::Continue(message)
    }
}

/// Receive hook: only senders whose id starts with an allowed prefix get
/// through. Travel commands always pass. An empty list allows everyone.
pub struct SenderAllowlist {
    prefixes: Vec<String>,
}

impl SenderAllowlist {
    pub fn new(prefixes: Vec<String>) -> Self {
        Self { prefixes }
    }
}

#[async_trait]
impl MessageHook for SenderAllowlist {
    fn name(&self) -> &str {
        "check_sender"
    }

    async fn apply(&self, message: Message) -> HookAction {
        if self.prefixes.is_empty()
            || message.content.is_travel()
            || message.from.has_prefix_in(&self.prefixes)
        {
            HookAction::Continue(message)
        } else {
            tracing::info!("[hook:recv] reject from:{} kind:{}", message.from, message.class());
            HookAction::Drop(format!("sender {} not allowed", message.from))
        }
    }
}

/// Send hook: stamps the local identity as sender.
pub struct StampSender {
    local: AgentId,
}

impl StampSender {
    pub fn new(local: AgentId) -> Self {
        Self { local }
    }
}

#[async_trait]
impl MessageHook for StampSender {
    fn name(&self) -> &str {
        "sign"
    }

    async fn apply(&self, mut message: Message) -> HookAction {
        message.from = self.local.clone();
        HookAction::Continue(message)
    }
}
