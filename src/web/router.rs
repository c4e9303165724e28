//! Route definitions for the dashboard server.

use axum::{extract::State, routing::get, Json, Router};
use std::sync::Arc;

use crate::agent::{Agent, AgentState};
use crate::core::FlowGraph;
use crate::travel::TravelReport;

/// Create the API router.
pub fn create_api_router() -> Router<Arc<Agent>> {
    Router::new()
        .route("/graph", get(graph))
        .route("/state", get(state))
        .route("/travel", get(travel_history))
}

/// Create the full app router. The JSON endpoints are served both at the
/// root and under `/api`.
pub fn create_app_router(agent: Arc<Agent>) -> Router {
    Router::new()
        .merge(create_api_router())
        .nest("/api", create_api_router())
        .route("/health", get(health_check))
        .with_state(agent)
}

async fn graph(State(agent): State<Arc<Agent>>) -> Json<FlowGraph> {
    Json(agent.flow_graph())
}

async fn state(State(agent): State<Arc<Agent>>) -> Json<AgentState> {
    Json(agent.state())
}

async fn travel_history(State(agent): State<Arc<Agent>>) -> Json<Vec<TravelReport>> {
    Json(agent.travel().history())
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentOptions;
    use crate::core::{handler_fn, HandlerContext};
    use crate::protocol::{AgentId, Content, Message, MessageClass};
    use crate::transport::{ServerAddr, TcpConnector};
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn agent() -> Arc<Agent> {
        let agent = Agent::new(
            AgentOptions::new("dash", ServerAddr::new("127.0.0.1", 1)),
            Arc::new(TcpConnector),
            None,
        );
        agent
            .routes()
            .register_str("registered --> contact", handler_fn(|_ctx: HandlerContext| async { Ok(()) }))
            .unwrap();
        Arc::new(agent)
    }

    async fn get_json(app: Router, uri: &str) -> serde_json::Value {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn test_graph_endpoint() {
        let agent = agent();
        let peer = AgentId::new("p");
        agent
            .book()
            .transition(&peer, &Message::broadcast("p", Content::new(MessageClass::Register, "hi")));

        let graph = get_json(create_app_router(agent.clone()), "/graph").await;
        assert_eq!(graph["agent"], "dash");
        assert_eq!(graph["nodes"].as_array().unwrap().len(), 5);
        assert_eq!(graph["relationships"][0]["peer"], "p");
        assert_eq!(graph["relationships"][0]["state"], "registered");

        let same = get_json(create_app_router(agent), "/api/graph").await;
        assert_eq!(same["edges"], graph["edges"]);
    }

    #[tokio::test]
    async fn test_state_endpoint_before_connecting() {
        let state = get_json(create_app_router(agent()), "/state").await;
        assert_eq!(state["agent_id"], "dash");
        assert_eq!(state["phase"], "local");
        assert_eq!(state["listening"], false);
        assert!(state["server"].is_null());
        assert!(state["rows"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_health() {
        let response = create_app_router(agent())
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
