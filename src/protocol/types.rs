//! Identity, message classes and content carried by the protocol.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Reserved command text that asks an agent to travel.
pub const TRAVEL_COMMAND: &str = "/travel";

/// Stable identity of an agent process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id starts with any of the given prefixes.
    pub fn has_prefix_in(&self, prefixes: &[String]) -> bool {
        prefixes.iter().any(|p| self.0.starts_with(p.as_str()))
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Message class tag used by the transition table.
///
/// Unknown wire kinds collapse to `Chat`, which no default rule consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageClass {
    Register,
    Contact,
    Friend,
    Ban,
    Travel,
    Chat,
}

impl MessageClass {
    pub const ALL: [MessageClass; 6] = [
        MessageClass::Register,
        MessageClass::Contact,
        MessageClass::Friend,
        MessageClass::Ban,
        MessageClass::Travel,
        MessageClass::Chat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageClass::Register => "register",
            MessageClass::Contact => "contact",
            MessageClass::Friend => "friend",
            MessageClass::Ban => "ban",
            MessageClass::Travel => "travel",
            MessageClass::Chat => "chat",
        }
    }

    pub fn from_kind(kind: &str) -> Self {
        match kind.trim().to_lowercase().as_str() {
            "register" => MessageClass::Register,
            "contact" => MessageClass::Contact,
            "friend" => MessageClass::Friend,
            "ban" => MessageClass::Ban,
            "travel" => MessageClass::Travel,
            _ => MessageClass::Chat,
        }
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for MessageClass {
    fn from(s: String) -> Self {
        Self::from_kind(&s)
    }
}

impl From<MessageClass> for String {
    fn from(c: MessageClass) -> Self {
        c.as_str().to_string()
    }
}

/// Application payload of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default = "default_kind")]
    pub kind: MessageClass,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

fn default_kind() -> MessageClass {
    MessageClass::Chat
}

impl Content {
    pub fn new(kind: MessageClass, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            data: None,
        }
    }

    /// Free text; `/travel` is tagged as a travel command.
    pub fn text(text: impl Into<String>) -> Self {
        let text = text.into();
        let kind = if is_travel_command(&text) {
            MessageClass::Travel
        } else {
            MessageClass::Chat
        };
        Self::new(kind, text)
    }

    pub fn travel() -> Self {
        Self::new(MessageClass::Travel, TRAVEL_COMMAND)
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Effective class: the command token wins over the declared kind.
    pub fn class(&self) -> MessageClass {
        if is_travel_command(&self.text) {
            MessageClass::Travel
        } else {
            self.kind
        }
    }

    pub fn is_travel(&self) -> bool {
        self.class() == MessageClass::Travel
    }
}

fn is_travel_command(text: &str) -> bool {
    text.trim() == TRAVEL_COMMAND
}
