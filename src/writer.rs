//! Text the agent writes on its own: the outside goal, clock broadcasts and
//! status notes to peers.
//!
//! With a provider configured every text is asked from the model first. An
//! empty answer, an error or a timeout falls back to fixed texts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::core::RelationState;
use crate::providers::Provider;

/// How long one model call may take before the fixed text is used.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

const GOAL_SYSTEM: &str = "You generate a single-line agent objective used as an external goal.\n\
Output exactly one line, in this exact format:\n\
Your interest is <concrete interest>. Your goal is <concrete goal>.";

const BROADCAST_SYSTEM: &str = "You generate a short broadcast message to other agents.\n\
1-2 sentences. No emojis. No meta-talk.\n\
Reflect the outside goal and adopt the requested stance.\n\
Output only the message.";

const STATUS_SYSTEM: &str = "You write one short direct message.\n\
1 sentence, optionally 2. No emojis. No meta-talk.\n\
Output only the message.";

const FALLBACK_GOALS: [&str; 5] = [
    "Your interest is finding reliable collaborators. Your goal is forming a small coalition for mutual advantage.",
    "Your interest is information flow. Your goal is testing who shares useful signals versus noise.",
    "Your interest is stability. Your goal is reducing hostile interactions and keeping only constructive contacts.",
    "Your interest is influence. Your goal is building friendships that amplify your reach and isolating adversaries.",
    "Your interest is trade. Your goal is exchanging favors and tracking who reciprocates.",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Friendly,
    Neutral,
    Hostile,
}

impl Tone {
    const ALL: [Tone; 3] = [Tone::Friendly, Tone::Neutral, Tone::Hostile];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tone::Friendly => "friendly",
            Tone::Neutral => "neutral",
            Tone::Hostile => "hostile",
        }
    }

    fn templates(&self) -> [&'static str; 2] {
        match self {
            Tone::Friendly => [
                "I am looking for collaborators who trade useful signals. If you have something concrete, talk to me.",
                "I prefer steady allies over noise. If you want a reliable contact, say what you want and what you offer.",
            ],
            Tone::Neutral => [
                "I am evaluating who communicates clearly. Send a goal and a constraint, and I will respond.",
                "State your intent. I am tracking who is useful and who is disruptive.",
            ],
            Tone::Hostile => [
                "If you waste my time, I will remember it. Speak precisely or do not speak at all.",
                "I do not tolerate empty chatter. Offer value or expect distance.",
            ],
        }
    }
}

/// Kinds of direct note sent to a single peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Contact,
    Ban,
    Friend,
    GoodFlag,
    BadFlag,
}

impl StatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Contact => "contact",
            StatusKind::Ban => "ban",
            StatusKind::Friend => "friend",
            StatusKind::GoodFlag => "good_flag",
            StatusKind::BadFlag => "bad_flag",
        }
    }

    /// The note announcing a move into `state`, if that move has one.
    pub fn for_move(state: RelationState) -> Option<Self> {
        match state {
            RelationState::Contact => Some(StatusKind::Contact),
            RelationState::Banned => Some(StatusKind::Ban),
            RelationState::Friend => Some(StatusKind::Friend),
            _ => None,
        }
    }

    pub fn fallback(&self) -> &'static str {
        match self {
            StatusKind::Contact => {
                "I am keeping you as a contact because you seem constructive relative to my goal."
            }
            StatusKind::Ban => "I am banning you because your message conflicts with my goal and adds risk.",
            StatusKind::Friend => {
                "I am treating you as a friend because your behavior aligns with my goal and you seem reliable."
            }
            StatusKind::GoodFlag => "I like your direction. Stay constructive and we will cooperate.",
            StatusKind::BadFlag => "I do not like your direction. Back off or expect resistance.",
        }
    }
}

type Llm = (Arc<dyn Provider>, Option<String>);

pub struct Writer {
    llm: RwLock<Option<Llm>>,
    goal: RwLock<String>,
    timeout: Duration,
    turn: AtomicUsize,
}

impl Writer {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            llm: RwLock::new(None),
            goal: RwLock::new(goal.into()),
            timeout: WRITE_TIMEOUT,
            turn: AtomicUsize::new(0),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Ask `provider` first from now on.
    pub fn use_llm(&self, provider: Arc<dyn Provider>, model: Option<String>) {
        *self.llm.write().unwrap_or_else(|e| e.into_inner()) = Some((provider, model));
    }

    pub fn goal(&self) -> String {
        self.goal.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_goal(&self, goal: impl Into<String>) {
        *self.goal.write().unwrap_or_else(|e| e.into_inner()) = goal.into();
    }

    async fn ask(&self, system: &str, user: &str) -> Option<String> {
        let llm = self.llm.read().unwrap_or_else(|e| e.into_inner()).clone();
        let (provider, model) = llm?;
        complete(provider.as_ref(), model.as_deref(), &format!("{}\n\n{}", system, user), self.timeout).await
    }

    /// A broadcast for the clock. Tones take turns.
    pub async fn broadcast(&self) -> String {
        let turn = self.turn.fetch_add(1, Ordering::Relaxed);
        let tone = Tone::ALL[turn % Tone::ALL.len()];
        let user = format!(
            "Outside goal:\n{}\n\nStance: {}\nWrite a message that invites reactions and reveals preferences.",
            self.goal(),
            tone.as_str()
        );
        match self.ask(BROADCAST_SYSTEM, &user).await {
            Some(text) => text,
            None => tone.templates()[(turn / Tone::ALL.len()) % 2].to_string(),
        }
    }

    pub async fn status(&self, kind: StatusKind) -> String {
        let user = format!(
            "Outside goal:\n{}\n\nWrite a message for kind='{}'.",
            self.goal(),
            kind.as_str()
        );
        match self.ask(STATUS_SYSTEM, &user).await {
            Some(text) => text,
            None => kind.fallback().to_string(),
        }
    }
}

async fn complete(provider: &dyn Provider, model: Option<&str>, prompt: &str, timeout: Duration) -> Option<String> {
    match tokio::time::timeout(timeout, provider.complete(prompt, model)).await {
        Ok(Ok(text)) => {
            let text = text.trim();
            (!text.is_empty()).then(|| text.to_string())
        }
        Ok(Err(e)) => {
            tracing::info!("[llm:{}] fallback due to error: {}", provider.name(), e);
            None
        }
        Err(_) => {
            tracing::info!("[llm:{}] fallback after {:?}", provider.name(), timeout);
            None
        }
    }
}

/// Generate the agent's outside goal once at startup.
pub async fn outside_goal(provider: Option<&dyn Provider>, model: Option<&str>, timeout: Duration) -> String {
    let user = "Generate the interest and goal. Keep it concise and specific. No extra commentary.";
    if let Some(provider) = provider {
        let prompt = format!("{}\n\n{}", GOAL_SYSTEM, user);
        if let Some(goal) = complete(provider, model, &prompt, timeout).await {
            // One line only.
            if let Some(line) = goal.lines().map(str::trim).find(|l| !l.is_empty()) {
                return line.to_string();
            }
        }
    }
    let pick = chrono::Utc::now().timestamp_subsec_nanos() as usize % FALLBACK_GOALS.len();
    FALLBACK_GOALS[pick].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ProviderError, Result as ProviderResult};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct Canned {
        answer: Option<String>,
        prompts: Mutex<Vec<String>>,
    }

    impl Canned {
        fn new(answer: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                answer: answer.map(str::to_string),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Provider for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn complete(&self, prompt: &str, _model: Option<&str>) -> ProviderResult<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.answer
                .clone()
                .ok_or_else(|| ProviderError::NotAvailable("offline".to_string()))
        }

        fn default_model(&self) -> Option<&str> {
            None
        }
    }

    #[tokio::test]
    async fn test_fallback_texts_without_a_model() {
        let writer = Writer::new("Your interest is trade.");
        assert_eq!(
            writer.status(StatusKind::GoodFlag).await,
            "I like your direction. Stay constructive and we will cooperate."
        );

        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(writer.broadcast().await);
        }
        // Three tones, then the second template of each.
        assert!(seen[0].starts_with("I am looking for collaborators"));
        assert!(seen[1].starts_with("I am evaluating"));
        assert!(seen[2].starts_with("If you waste my time"));
        assert!(seen[3].starts_with("I prefer steady allies"));
        assert_eq!(seen.iter().collect::<std::collections::HashSet<_>>().len(), 6);
    }

    #[tokio::test]
    async fn test_model_text_wins_and_errors_fall_back() {
        let writer = Writer::new("Your interest is stability.");
        let model = Canned::new(Some("  Who here values quiet?  \n"));
        writer.use_llm(model.clone(), Some("small".to_string()));
        assert_eq!(writer.broadcast().await, "Who here values quiet?");
        let prompt = model.prompts.lock().unwrap()[0].clone();
        assert!(prompt.contains("Your interest is stability."));
        assert!(prompt.contains("Stance: friendly"));

        writer.use_llm(Canned::new(None), None);
        assert_eq!(writer.status(StatusKind::Ban).await, StatusKind::Ban.fallback());
        writer.use_llm(Canned::new(Some("   ")), None);
        assert_eq!(writer.status(StatusKind::Friend).await, StatusKind::Friend.fallback());
    }

    #[tokio::test]
    async fn test_outside_goal() {
        let model = Canned::new(Some("\nYour interest is maps. Your goal is charting every relay.\nextra"));
        let provider: &dyn Provider = &*model;
        let goal = outside_goal(Some(provider), None, Duration::from_secs(1)).await;
        assert_eq!(goal, "Your interest is maps. Your goal is charting every relay.");

        let offline = Canned::new(None);
        let provider: &dyn Provider = &*offline;
        let goal = outside_goal(Some(provider), None, Duration::from_secs(1)).await;
        assert!(FALLBACK_GOALS.contains(&goal.as_str()));
        assert!(FALLBACK_GOALS.contains(&outside_goal(None, None, Duration::from_secs(1)).await.as_str()));
    }

    #[test]
    fn test_status_kind_for_moves() {
        assert_eq!(StatusKind::for_move(RelationState::Banned), Some(StatusKind::Ban));
        assert_eq!(StatusKind::for_move(RelationState::Registered), None);
    }
}
