//! Framed, ordered delivery between an agent and a server.
//!
//! A [`Transport`] moves whole [`Frame`]s over one persistent connection.
//! [`Connector`] opens new ones; [`handshake`] presents an agent identity on a
//! freshly opened link.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::protocol::{AgentId, Frame};

pub mod memory;
pub mod session;
pub mod tcp;

pub use memory::MemoryTransport;
pub use session::{Inbound, InboundEvent, Session};
pub use tcp::{TcpConnector, TcpTransport};

/// Host and port of a server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl ServerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One persistent, ordered link.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Printable remote end, for logs.
    fn peer(&self) -> &str;

    async fn send(&self, frame: &Frame) -> Result<()>;

    /// Next frame in arrival order; `None` once the link is closed.
    async fn recv(&self) -> Result<Option<Frame>>;

    /// Close the link. Idempotent.
    async fn close(&self);
}

/// Opens transports to servers.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: &ServerAddr) -> Result<Arc<dyn Transport>>;
}

/// Present `agent` on a fresh link and wait for the server's answer.
///
/// Returns the server's self-reported name. Callers bound this with a timeout.
pub async fn handshake(
    transport: &dyn Transport,
    agent: &AgentId,
    routes: Vec<String>,
) -> Result<String> {
    transport
        .send(&Frame::Hello {
            agent: agent.clone(),
            routes,
        })
        .await?;

    match transport.recv().await? {
        Some(Frame::Welcome { server }) => {
            tracing::debug!("{} welcomed by {} ({})", agent, server, transport.peer());
            Ok(server)
        }
        Some(Frame::Reject { reason }) => Err(Error::Handshake(reason)),
        Some(other) => Err(Error::Handshake(format!(
            "expected welcome, got {}",
            other.kind()
        ))),
        None => Err(Error::transport(format!(
            "{} closed during handshake",
            transport.peer()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handshake_welcome() {
        let (agent_end, server_end) = memory::pair("agent", "server");

        let server = tokio::spawn(async move {
            match server_end.recv().await.unwrap() {
                Some(Frame::Hello { agent, routes }) => {
                    assert_eq!(agent.as_str(), "scout");
                    assert_eq!(routes, vec!["register".to_string()]);
                }
                other => panic!("unexpected {:?}", other),
            }
            server_end
                .send(&Frame::Welcome {
                    server: "hub".to_string(),
                })
                .await
                .unwrap();
        });

        let name = handshake(&agent_end, &AgentId::new("scout"), vec!["register".to_string()])
            .await
            .unwrap();
        assert_eq!(name, "hub");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_reject_and_close() {
        let (agent_end, server_end) = memory::pair("agent", "server");
        server_end
            .send(&Frame::Reject {
                reason: "duplicate".to_string(),
            })
            .await
            .unwrap();
        let err = handshake(&agent_end, &AgentId::new("scout"), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handshake(r) if r == "duplicate"));

        let (agent_end, server_end) = memory::pair("agent", "server");
        server_end.close().await;
        let err = handshake(&agent_end, &AgentId::new("scout"), vec![])
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }

    #[test]
    fn test_server_addr_display() {
        assert_eq!(ServerAddr::new("127.0.0.1", 8888).to_string(), "127.0.0.1:8888");
    }
}
