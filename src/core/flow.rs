//! Flow graph: a read-only projection of routes, relationship states and
//! observed transitions, rebuilt on demand for the dashboard.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::relationship::{RelationState, RelationshipBook, Stance, TransitionTable};
use super::routing::{RoutePattern, RouteTable};
use crate::protocol::{AgentId, MessageClass};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowGraph {
    pub agent: AgentId,
    pub generated_at: DateTime<Utc>,
    pub nodes: Vec<FlowNode>,
    pub edges: Vec<FlowEdge>,
    pub routes: Vec<FlowRoute>,
    pub relationships: Vec<RelationshipRow>,
}

/// One relationship state and how many peers sit in it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowNode {
    pub state: RelationState,
    pub peers: usize,
    /// Routes listening on this state.
    pub routes: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEdge {
    pub from: RelationState,
    pub to: RelationState,
    /// Message class driving the move; `None` for an observed move the
    /// table does not declare.
    pub class: Option<MessageClass>,
    pub declared: bool,
    pub observed: u64,
    /// Arrow routes bound to this edge.
    pub routes: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRoute {
    pub id: u64,
    pub label: String,
    pub exclusive: bool,
    pub filtered: bool,
}

/// Dashboard row for one peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRow {
    pub peer: AgentId,
    pub state: RelationState,
    pub stance: Stance,
    pub messages: u64,
    /// Seconds since the last message.
    pub last_seen_s: i64,
    pub last_message: String,
}

impl FlowGraph {
    pub fn project(routes: &RouteTable, table: &TransitionTable, book: &RelationshipBook) -> Self {
        let now = Utc::now();
        let route_infos = routes.routes();
        let records = book.snapshot();
        let mut observed = book.observed();

        let nodes = RelationState::ALL
            .iter()
            .map(|&state| FlowNode {
                state,
                peers: records.iter().filter(|r| r.state == state).count(),
                routes: route_infos
                    .iter()
                    .filter(|r| r.pattern == RoutePattern::State(state))
                    .map(|r| r.id.value())
                    .collect(),
            })
            .collect();

        let arrow_routes = |from: RelationState, to: RelationState| -> Vec<u64> {
            route_infos
                .iter()
                .filter(|r| r.pattern == RoutePattern::Arrow { from, to })
                .map(|r| r.id.value())
                .collect()
        };

        let mut edges: Vec<FlowEdge> = table
            .rules()
            .into_iter()
            .map(|(from, class, to)| FlowEdge {
                from,
                to,
                class: Some(class),
                declared: true,
                observed: observed.remove(&(from, to)).unwrap_or(0),
                routes: arrow_routes(from, to),
            })
            .collect();
        edges.extend(observed.into_iter().map(|((from, to), count)| FlowEdge {
            from,
            to,
            class: None,
            declared: false,
            observed: count,
            routes: arrow_routes(from, to),
        }));

        let relationships = records
            .into_iter()
            .map(|r| RelationshipRow {
                last_seen_s: (now - r.last_seen).num_seconds().max(0),
                peer: r.peer,
                state: r.state,
                stance: r.stance,
                messages: r.messages,
                last_message: r.last_message,
            })
            .collect();

        Self {
            agent: book.local().clone(),
            generated_at: now,
            nodes,
            edges,
            routes: route_infos
                .iter()
                .map(|r| FlowRoute {
                    id: r.id.value(),
                    label: r.pattern.label(),
                    exclusive: r.exclusive,
                    filtered: r.filtered,
                })
                .collect(),
            relationships,
        }
    }

    pub fn edge(&self, from: RelationState, to: RelationState) -> Option<&FlowEdge> {
        self.edges.iter().find(|e| e.from == from && e.to == to)
    }

    pub fn total_observed(&self) -> u64 {
        self.edges.iter().map(|e| e.observed).sum()
    }
}
