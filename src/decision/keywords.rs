//! Keyword scoring policy. Deterministic, offline, always answers.

use async_trait::async_trait;

use super::{Classification, Decision, DecisionContext, DecisionHook, Verdict};
use crate::error::Result;

const POSITIVE: &[&str] = &[
    "hello", "hi", "hey", "contact", "collab", "cooperate", "ally", "friend", "like", "good",
    "help",
];
const NEGATIVE: &[&str] = &[
    "ban", "banned", "block", "hate", "enemy", "bad", "don't like", "dont like", "go away",
    "shut up",
];
const BAD_FLAGS: &[&str] = &["ban", "banned", "block", "hate", "don't like", "dont like", "enemy"];
const GOOD_FLAGS: &[&str] = &["friend", "contact", "ally", "like", "good", "welcome"];

#[derive(Debug, Clone, Default)]
pub struct KeywordPolicy;

impl KeywordPolicy {
    pub fn new() -> Self {
        Self
    }

    /// +1 per positive word, -2 per negative word.
    pub fn score(text: &str) -> i32 {
        let t = text.to_lowercase();
        let pos = POSITIVE.iter().filter(|w| t.contains(*w)).count() as i32;
        let neg = NEGATIVE.iter().filter(|w| t.contains(*w)).count() as i32;
        pos - 2 * neg
    }

    pub fn classify(text: &str) -> Classification {
        let t = text.to_lowercase();
        if BAD_FLAGS.iter().any(|w| t.contains(w)) {
            Classification::Bad
        } else if GOOD_FLAGS.iter().any(|w| t.contains(w)) {
            Classification::Good
        } else {
            Classification::Neutral
        }
    }

    /// Verdict for a decision kind such as `registered->contact`.
    pub fn verdict(kind: &str, text: &str) -> Verdict {
        let score = Self::score(text);
        let target = kind.rsplit("->").next().unwrap_or("").trim();
        let moving = match target {
            // First contact is always recorded.
            "registered" => true,
            "contact" | "friend" | "good" | "very_good" => score >= 1,
            "banned" | "bad" => score <= -1,
            _ if kind == "travel" => text.to_lowercase().contains("travel"),
            _ => false,
        };
        if moving {
            Verdict::Move
        } else {
            Verdict::Stay
        }
    }
}

#[async_trait]
impl DecisionHook for KeywordPolicy {
    fn name(&self) -> &str {
        "keywords"
    }

    async fn decide(&self, ctx: &DecisionContext) -> Result<Decision> {
        let verdict = Self::verdict(&ctx.kind, &ctx.text);
        let confidence = if Self::score(&ctx.text) == 0 { 0.5 } else { 0.75 };
        Ok(Decision {
            verdict,
            classification: Some(Self::classify(&ctx.text)),
            confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AgentId;

    #[test]
    fn test_score() {
        assert_eq!(KeywordPolicy::score("Hello friend"), 2);
        assert!(KeywordPolicy::score("I don't like you") < 0);
        assert_eq!(KeywordPolicy::score("the weather"), 0);
    }

    #[test]
    fn test_verdicts() {
        assert_eq!(KeywordPolicy::verdict("unregistered->registered", "zzz"), Verdict::Move);
        assert_eq!(KeywordPolicy::verdict("registered->contact", "Hello"), Verdict::Move);
        assert_eq!(KeywordPolicy::verdict("registered->contact", "go away"), Verdict::Stay);
        assert_eq!(KeywordPolicy::verdict("registered->banned", "I don't like you"), Verdict::Move);
        assert_eq!(KeywordPolicy::verdict("contact->friend", "ok"), Verdict::Stay);
        assert_eq!(KeywordPolicy::verdict("travel", "time to travel"), Verdict::Move);
        assert_eq!(KeywordPolicy::verdict("mystery", "hello"), Verdict::Stay);
    }

    #[tokio::test]
    async fn test_decide_classifies() {
        let ctx = DecisionContext::new("registered->contact", AgentId::new("me"))
            .with_text("Welcome, ally");
        let d = KeywordPolicy::new().decide(&ctx).await.unwrap();
        assert!(d.is_move());
        assert_eq!(d.classification, Some(Classification::Good));
        assert_eq!(KeywordPolicy::classify("I hate this"), Classification::Bad);
    }
}
