//! Pluggable stay/move and classification decisions.
//!
//! A [`DecisionHook`] is a black box; [`DecisionPolicy`] is how the rest of
//! the crate calls one: bounded in time, and any failure, timeout or
//! low-confidence answer reads as "stay".

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::protocol::AgentId;

pub mod cache;
pub mod keywords;
pub mod llm;

pub use cache::CachedHook;
pub use keywords::KeywordPolicy;
pub use llm::LlmPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Stay,
    Move,
}

impl Verdict {
    /// Parse a one-token model answer.
    pub fn parse(token: &str) -> Option<Self> {
        match normalize_token(token).as_str() {
            "stay" => Some(Verdict::Stay),
            "move" => Some(Verdict::Move),
            _ => None,
        }
    }
}

/// How a peer seems to treat us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Good,
    Bad,
    Neutral,
}

impl Classification {
    pub fn parse(token: &str) -> Option<Self> {
        match normalize_token(token).as_str() {
            "good" => Some(Classification::Good),
            "bad" => Some(Classification::Bad),
            "neutral" => Some(Classification::Neutral),
            _ => None,
        }
    }
}

fn normalize_token(token: &str) -> String {
    token
        .trim()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .trim_matches(|c: char| !c.is_alphanumeric())
        .to_lowercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub verdict: Verdict,
    pub classification: Option<Classification>,
    pub confidence: f32,
}

impl Decision {
    pub fn stay() -> Self {
        Self {
            verdict: Verdict::Stay,
            classification: None,
            confidence: 0.0,
        }
    }

    pub fn moving(confidence: f32) -> Self {
        Self {
            verdict: Verdict::Move,
            classification: None,
            confidence,
        }
    }

    pub fn with_classification(mut self, classification: Classification) -> Self {
        self.classification = Some(classification);
        self
    }

    pub fn is_move(&self) -> bool {
        self.verdict == Verdict::Move
    }
}

/// What a decision is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionContext {
    /// Decision point, e.g. `registered->contact` or `travel`.
    pub kind: String,
    pub agent: AgentId,
    pub peer: Option<AgentId>,
    pub text: String,
    /// Guidance for the policy.
    pub hint: String,
}

impl DecisionContext {
    pub fn new(kind: impl Into<String>, agent: AgentId) -> Self {
        Self {
            kind: kind.into(),
            agent,
            peer: None,
            text: String::new(),
            hint: String::new(),
        }
    }

    pub fn with_peer(mut self, peer: AgentId) -> Self {
        self.peer = Some(peer);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = hint.into();
        self
    }
}

#[async_trait]
pub trait DecisionHook: Send + Sync {
    fn name(&self) -> &str;

    async fn decide(&self, ctx: &DecisionContext) -> Result<Decision>;
}

/// Time-bounded, fail-safe access to a hook.
#[derive(Clone)]
pub struct DecisionPolicy {
    hook: Arc<dyn DecisionHook>,
    timeout: Duration,
    min_confidence: f32,
}

impl fmt::Debug for DecisionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecisionPolicy")
            .field("hook", &self.hook.name())
            .field("timeout", &self.timeout)
            .field("min_confidence", &self.min_confidence)
            .finish()
    }
}

impl DecisionPolicy {
    pub fn new(hook: Arc<dyn DecisionHook>, timeout: Duration) -> Self {
        Self {
            hook,
            timeout,
            min_confidence: 0.0,
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f32) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn hook_name(&self) -> &str {
        self.hook.name()
    }

    /// Ask once. Never fails: errors and timeouts come back as stay.
    pub async fn consult(&self, ctx: &DecisionContext) -> Decision {
        match tokio::time::timeout(self.timeout, self.hook.decide(ctx)).await {
            Ok(Ok(decision)) if decision.confidence >= self.min_confidence => {
                tracing::debug!(
                    "{} decided {:?} on {} ({:.2})",
                    self.hook.name(),
                    decision.verdict,
                    ctx.kind,
                    decision.confidence
                );
                decision
            }
            Ok(Ok(decision)) => {
                tracing::debug!(
                    "{} below confidence on {} ({:.2} < {:.2}), staying",
                    self.hook.name(),
                    ctx.kind,
                    decision.confidence,
                    self.min_confidence
                );
                Decision {
                    verdict: Verdict::Stay,
                    ..decision
                }
            }
            Ok(Err(e)) => {
                tracing::warn!("{} failed on {}: {}, staying", self.hook.name(), ctx.kind, e);
                Decision::stay()
            }
            Err(_) => {
                tracing::warn!(
                    "{} timed out on {} after {:?}, staying",
                    self.hook.name(),
                    ctx.kind,
                    self.timeout
                );
                Decision::stay()
            }
        }
    }
}
