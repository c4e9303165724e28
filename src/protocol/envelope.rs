//! Messages exchanged between agents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{AgentId, Content, MessageClass};

/// Who a message is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Broadcast,
    Direct { to: AgentId },
}

/// A message as sent on the wire. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID (ULID)
    pub id: String,
    /// Sender agent
    pub from: AgentId,
    /// Recipient scope
    pub scope: Scope,
    /// Payload
    pub content: Content,
    /// Creation time
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Message to every agent on the server.
    pub fn broadcast(from: impl Into<AgentId>, content: Content) -> Self {
        Self {
            id: generate_id(),
            from: from.into(),
            scope: Scope::Broadcast,
            content,
            timestamp: Utc::now(),
        }
    }

    /// Message to a single agent.
    pub fn direct(from: impl Into<AgentId>, to: impl Into<AgentId>, content: Content) -> Self {
        Self {
            id: generate_id(),
            from: from.into(),
            scope: Scope::Direct { to: to.into() },
            content,
            timestamp: Utc::now(),
        }
    }

    /// Build a reply addressed back to the sender of this message.
    pub fn reply(&self, from: impl Into<AgentId>, content: Content) -> Self {
        Self::direct(from, self.from.clone(), content)
    }

    pub fn class(&self) -> MessageClass {
        self.content.class()
    }

    pub fn recipient(&self) -> Option<&AgentId> {
        match &self.scope {
            Scope::Broadcast => None,
            Scope::Direct { to } => Some(to),
        }
    }

    /// Broadcasts are for everyone; direct messages only for their recipient.
    pub fn is_for(&self, agent: &AgentId) -> bool {
        match &self.scope {
            Scope::Broadcast => true,
            Scope::Direct { to } => to == agent,
        }
    }
}

/// Builder for messages with a fluent API.
pub struct MessageBuilder {
    from: AgentId,
    to: Option<AgentId>,
    content: Option<Content>,
    timestamp: Option<DateTime<Utc>>,
}

impl MessageBuilder {
    pub fn from(agent: impl Into<AgentId>) -> Self {
        Self {
            from: agent.into(),
            to: None,
            content: None,
            timestamp: None,
        }
    }

    pub fn to(mut self, agent: impl Into<AgentId>) -> Self {
        self.to = Some(agent.into());
        self
    }

    pub fn content(mut self, content: Content) -> Self {
        self.content = Some(content);
        self
    }

    pub fn kind(self, kind: MessageClass, text: impl Into<String>) -> Self {
        self.content(Content::new(kind, text))
    }

    pub fn text(self, text: impl Into<String>) -> Self {
        self.content(Content::text(text))
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn build(self) -> Result<Message, &'static str> {
        let content = self.content.ok_or("Content is required")?;
        let scope = match self.to {
            Some(to) => Scope::Direct { to },
            None => Scope::Broadcast,
        };
        Ok(Message {
            id: generate_id(),
            from: self.from,
            scope,
            content,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
        })
    }
}

fn generate_id() -> String {
    ulid::Ulid::new().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope() {
        let me = AgentId::new("scout");
        let other = AgentId::new("trader");

        let msg = Message::broadcast("trader", Content::text("hello"));
        assert!(msg.is_for(&me));
        assert!(msg.recipient().is_none());

        let msg = Message::direct("trader", "scout", Content::text("hello"));
        assert!(msg.is_for(&me));
        assert!(!msg.is_for(&other));
    }

    #[test]
    fn test_builder() {
        let msg = MessageBuilder::from("scout")
            .to("trader")
            .kind(MessageClass::Register, "Hello")
            .build()
            .unwrap();

        assert_eq!(msg.from.as_str(), "scout");
        assert_eq!(msg.recipient().map(|a| a.as_str()), Some("trader"));
        assert_eq!(msg.class(), MessageClass::Register);
        assert!(!msg.id.is_empty());

        assert!(MessageBuilder::from("scout").build().is_err());
    }

    #[test]
    fn test_reply_goes_back() {
        let msg = Message::broadcast("trader", Content::new(MessageClass::Contact, "hi"));
        let reply = msg.reply("scout", Content::text("noted"));
        assert_eq!(reply.recipient(), Some(&AgentId::new("trader")));
        assert_eq!(reply.from, AgentId::new("scout"));
    }

    #[test]
    fn test_wire_shape() {
        let msg = Message::direct("a", "b", Content::new(MessageClass::Ban, "go away"));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["scope"]["direct"]["to"], "b");
        assert_eq!(json["content"]["kind"], "ban");
    }
}
