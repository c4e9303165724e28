//! Per-peer relationship state.
//!
//! Each (local agent, peer) pair has one [`RelationState`], advanced by a
//! static [`TransitionTable`] keyed on (state, message class), plus a
//! [`Stance`] that records how the local agent regards the peer. Pairs the
//! table does not define leave the state alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::decision::Classification;
use crate::error::Error;
use crate::protocol::{AgentId, Message, MessageClass};

/// Stage of interaction with one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationState {
    Unregistered,
    Registered,
    Contact,
    Friend,
    Banned,
}

impl RelationState {
    pub const ALL: [RelationState; 5] = [
        RelationState::Unregistered,
        RelationState::Registered,
        RelationState::Contact,
        RelationState::Friend,
        RelationState::Banned,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationState::Unregistered => "unregistered",
            RelationState::Registered => "registered",
            RelationState::Contact => "contact",
            RelationState::Friend => "friend",
            RelationState::Banned => "banned",
        }
    }
}

impl Default for RelationState {
    fn default() -> Self {
        Self::Unregistered
    }
}

impl fmt::Display for RelationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationState {
    type Err = Error;

    /// Accepts the state names plus the verb forms used in route strings
    /// (`register`, `ban`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "unregistered" | "new" => Ok(RelationState::Unregistered),
            "register" | "registered" => Ok(RelationState::Registered),
            "contact" => Ok(RelationState::Contact),
            "friend" => Ok(RelationState::Friend),
            "ban" | "banned" => Ok(RelationState::Banned),
            other => Err(Error::NotFound(format!("relation state '{}'", other))),
        }
    }
}

/// How the local agent regards a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stance {
    Neutral,
    Good,
    Bad,
    VeryGood,
}

impl Default for Stance {
    fn default() -> Self {
        Self::Neutral
    }
}

impl Stance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stance::Neutral => "neutral",
            Stance::Good => "good",
            Stance::Bad => "bad",
            Stance::VeryGood => "very_good",
        }
    }

    /// Fixed stance rules: neutral moves either way, good can deepen.
    pub fn advance(self, classification: Classification) -> Stance {
        match (self, classification) {
            (Stance::Neutral, Classification::Good) => Stance::Good,
            (Stance::Neutral, Classification::Bad) => Stance::Bad,
            (Stance::Good, Classification::Good) => Stance::VeryGood,
            (stance, _) => stance,
        }
    }
}

impl fmt::Display for Stance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static rule set. Built once, never mutated afterwards.
#[derive(Debug, Clone)]
pub struct TransitionTable {
    rules: HashMap<(RelationState, MessageClass), RelationState>,
}

impl TransitionTable {
    pub fn builder() -> TransitionTableBuilder {
        TransitionTableBuilder::default()
    }

    /// `register -> contact -> friend`, with `ban` reachable from every
    /// registered stage.
    pub fn standard() -> Self {
        Self::builder()
            .rule(RelationState::Unregistered, MessageClass::Register, RelationState::Registered)
            .rule(RelationState::Registered, MessageClass::Contact, RelationState::Contact)
            .rule(RelationState::Registered, MessageClass::Ban, RelationState::Banned)
            .rule(RelationState::Contact, MessageClass::Friend, RelationState::Friend)
            .rule(RelationState::Contact, MessageClass::Ban, RelationState::Banned)
            .rule(RelationState::Friend, MessageClass::Ban, RelationState::Banned)
            .build()
    }

    /// Defined target, if any.
    pub fn next(&self, state: RelationState, class: MessageClass) -> Option<RelationState> {
        self.rules.get(&(state, class)).copied()
    }

    /// Total version of [`next`](Self::next): undefined pairs are no-ops.
    pub fn apply(&self, state: RelationState, class: MessageClass) -> RelationState {
        self.next(state, class).unwrap_or(state)
    }

    /// All rules, sorted for stable output.
    pub fn rules(&self) -> Vec<(RelationState, MessageClass, RelationState)> {
        let mut rules: Vec<_> = self
            .rules
            .iter()
            .map(|(&(from, class), &to)| (from, class, to))
            .collect();
        rules.sort();
        rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::standard()
    }
}

#[derive(Debug, Default)]
pub struct TransitionTableBuilder {
    rules: HashMap<(RelationState, MessageClass), RelationState>,
}

impl TransitionTableBuilder {
    /// Add a rule; a later rule for the same (state, class) replaces the earlier one.
    pub fn rule(mut self, from: RelationState, class: MessageClass, to: RelationState) -> Self {
        if let Some(prev) = self.rules.insert((from, class), to) {
            tracing::warn!("Rule {} + {} redefined: {} -> {}", from, class, prev, to);
        }
        self
    }

    pub fn build(self) -> TransitionTable {
        TransitionTable { rules: self.rules }
    }
}

/// One observed state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from: RelationState,
    pub to: RelationState,
    pub class: MessageClass,
    pub message_id: String,
    pub at: DateTime<Utc>,
}

/// Result of applying one message to a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub old: RelationState,
    pub new: RelationState,
    pub class: MessageClass,
}

impl TransitionOutcome {
    pub fn changed(&self) -> bool {
        self.old != self.new
    }

    /// Same state on both sides: what a refused move looks like.
    pub fn unchanged(&self) -> TransitionOutcome {
        TransitionOutcome {
            old: self.old,
            new: self.old,
            class: self.class,
        }
    }

    /// `"registered->contact"`, used as the decision kind.
    pub fn kind(&self) -> String {
        format!("{}->{}", self.old, self.new)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub local: AgentId,
    pub peer: AgentId,
    pub state: RelationState,
    pub stance: Stance,
    pub history: Vec<Transition>,
    pub messages: u64,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub last_message: String,
}

impl RelationshipRecord {
    fn new(local: AgentId, peer: AgentId) -> Self {
        let now = Utc::now();
        Self {
            local,
            peer,
            state: RelationState::default(),
            stance: Stance::default(),
            history: Vec::new(),
            messages: 0,
            first_seen: now,
            last_seen: now,
            last_message: String::new(),
        }
    }
}

/// All relationships of one local agent.
///
/// Callers serialize work per peer (the dispatcher's lanes); the lock here
/// only guards the map itself.
pub struct RelationshipBook {
    local: AgentId,
    table: Arc<TransitionTable>,
    records: Mutex<HashMap<AgentId, RelationshipRecord>>,
}

impl RelationshipBook {
    pub fn new(local: AgentId, table: Arc<TransitionTable>) -> Self {
        Self {
            local,
            table,
            records: Mutex::new(HashMap::new()),
        }
    }

    pub fn local(&self) -> &AgentId {
        &self.local
    }

    pub fn table(&self) -> &Arc<TransitionTable> {
        &self.table
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<AgentId, RelationshipRecord>> {
        // A panic while holding this lock leaves the map itself consistent.
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Compute what `message` would do to the relationship with `peer`,
    /// creating the record on first contact. Nothing is committed.
    pub fn propose(&self, peer: &AgentId, message: &Message) -> TransitionOutcome {
        let mut records = self.lock();
        let record = records
            .entry(peer.clone())
            .or_insert_with(|| RelationshipRecord::new(self.local.clone(), peer.clone()));

        record.messages += 1;
        record.last_seen = Utc::now();
        record.last_message = message.content.text.clone();

        let class = message.class();
        TransitionOutcome {
            old: record.state,
            new: self.table.apply(record.state, class),
            class,
        }
    }

    /// Commit a proposal. Ignored if the record moved since it was proposed.
    pub fn commit(&self, peer: &AgentId, outcome: &TransitionOutcome, message_id: &str) -> bool {
        if !outcome.changed() {
            return false;
        }
        let mut records = self.lock();
        let Some(record) = records.get_mut(peer) else {
            return false;
        };
        if record.state != outcome.old {
            tracing::warn!(
                "Stale transition for {}: expected {}, found {}",
                peer,
                outcome.old,
                record.state
            );
            return false;
        }

        record.state = outcome.new;
        record.history.push(Transition {
            from: outcome.old,
            to: outcome.new,
            class: outcome.class,
            message_id: message_id.to_string(),
            at: Utc::now(),
        });
        tracing::debug!("{} sees {}: {} -> {}", self.local, peer, outcome.old, outcome.new);
        true
    }

    /// Propose and commit in one step.
    pub fn transition(&self, peer: &AgentId, message: &Message) -> TransitionOutcome {
        let outcome = self.propose(peer, message);
        self.commit(peer, &outcome, &message.id);
        outcome
    }

    /// Advance the stance toward `peer`; returns (old, new).
    pub fn apply_stance(&self, peer: &AgentId, classification: Classification) -> (Stance, Stance) {
        let mut records = self.lock();
        let record = records
            .entry(peer.clone())
            .or_insert_with(|| RelationshipRecord::new(self.local.clone(), peer.clone()));
        let old = record.stance;
        record.stance = old.advance(classification);
        (old, record.stance)
    }

    pub fn state_of(&self, peer: &AgentId) -> RelationState {
        self.lock().get(peer).map(|r| r.state).unwrap_or_default()
    }

    pub fn record(&self, peer: &AgentId) -> Option<RelationshipRecord> {
        self.lock().get(peer).cloned()
    }

    /// All records, ordered by peer.
    pub fn snapshot(&self) -> Vec<RelationshipRecord> {
        let mut records: Vec<_> = self.lock().values().cloned().collect();
        records.sort_by(|a, b| a.peer.cmp(&b.peer));
        records
    }

    /// Observed transition counts across all peers.
    pub fn observed(&self) -> BTreeMap<(RelationState, RelationState), u64> {
        let mut counts = BTreeMap::new();
        for record in self.lock().values() {
            for t in &record.history {
                *counts.entry((t.from, t.to)).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Forget every relationship. Returns how many were dropped.
    pub fn reset(&self) -> usize {
        let mut records = self.lock();
        let dropped = records.len();
        records.clear();
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Content;

    fn msg(from: &str, class: MessageClass) -> Message {
        Message::broadcast(from, Content::new(class, class.as_str()))
    }

    fn book() -> RelationshipBook {
        RelationshipBook::new(AgentId::new("me"), Arc::new(TransitionTable::standard()))
    }

    #[test]
    fn test_register_then_contact() {
        let book = book();
        let peer = AgentId::new("trader");

        let first = book.transition(&peer, &msg("trader", MessageClass::Register));
        assert_eq!(first.old, RelationState::Unregistered);
        assert_eq!(first.new, RelationState::Registered);
        assert_eq!(book.state_of(&peer), RelationState::Registered);

        let second = book.transition(&peer, &msg("trader", MessageClass::Contact));
        assert_eq!((second.old, second.new), (RelationState::Registered, RelationState::Contact));
        assert_eq!(book.state_of(&peer), RelationState::Contact);

        let record = book.record(&peer).unwrap();
        assert_eq!(record.history.len(), 2);
        assert_eq!(record.messages, 2);
    }

    #[test]
    fn test_undefined_pairs_are_noops() {
        let table = TransitionTable::standard();
        for state in RelationState::ALL {
            for class in MessageClass::ALL {
                if table.next(state, class).is_none() {
                    assert_eq!(table.apply(state, class), state);
                }
            }
        }

        let book = book();
        let peer = AgentId::new("trader");
        let outcome = book.transition(&peer, &msg("trader", MessageClass::Friend));
        assert!(!outcome.changed());
        assert!(book.record(&peer).unwrap().history.is_empty());
    }

    #[test]
    fn test_final_state_is_left_fold() {
        let table = TransitionTable::standard();
        let sequences = [
            vec![MessageClass::Register, MessageClass::Contact, MessageClass::Friend],
            vec![MessageClass::Contact, MessageClass::Register, MessageClass::Ban, MessageClass::Friend],
            vec![MessageClass::Register, MessageClass::Chat, MessageClass::Contact, MessageClass::Ban],
            vec![MessageClass::Friend, MessageClass::Contact, MessageClass::Register],
        ];

        for (i, seq) in sequences.iter().enumerate() {
            let book = book();
            let peer = AgentId::new(format!("peer{}", i));
            for class in seq {
                book.transition(&peer, &msg(peer.as_str(), *class));
            }
            let expected = seq
                .iter()
                .fold(RelationState::Unregistered, |s, c| table.apply(s, *c));
            assert_eq!(book.state_of(&peer), expected, "sequence {:?}", seq);
        }
    }

    #[test]
    fn test_stale_commit_is_ignored() {
        let book = book();
        let peer = AgentId::new("trader");
        let proposal = book.propose(&peer, &msg("trader", MessageClass::Register));
        book.transition(&peer, &msg("trader", MessageClass::Register));
        assert!(!book.commit(&peer, &proposal, "late"));
        assert_eq!(book.record(&peer).unwrap().history.len(), 1);
    }

    #[test]
    fn test_stance() {
        let book = book();
        let peer = AgentId::new("trader");
        assert_eq!(book.apply_stance(&peer, Classification::Good), (Stance::Neutral, Stance::Good));
        assert_eq!(book.apply_stance(&peer, Classification::Bad), (Stance::Good, Stance::Good));
        assert_eq!(book.apply_stance(&peer, Classification::Good), (Stance::Good, Stance::VeryGood));
        assert_eq!(Stance::Neutral.advance(Classification::Neutral), Stance::Neutral);
    }

    #[test]
    fn test_state_names() {
        assert_eq!("register".parse::<RelationState>().unwrap(), RelationState::Registered);
        assert_eq!("Banned".parse::<RelationState>().unwrap(), RelationState::Banned);
        assert!("listen".parse::<RelationState>().is_err());
    }

    #[test]
    fn test_reset_and_observed() {
        let book = book();
        for peer in ["a", "b"] {
            book.transition(&AgentId::new(peer), &msg(peer, MessageClass::Register));
        }
        let observed = book.observed();
        assert_eq!(observed[&(RelationState::Unregistered, RelationState::Registered)], 2);

        assert_eq!(book.reset(), 2);
        assert!(book.is_empty());
        assert_eq!(book.state_of(&AgentId::new("a")), RelationState::Unregistered);
    }
}
