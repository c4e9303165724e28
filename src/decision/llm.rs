//! Decision policy backed by a text completion provider.

use async_trait::async_trait;
use std::sync::Arc;

use super::{Classification, Decision, DecisionContext, DecisionHook, KeywordPolicy, Verdict};
use crate::error::Result;
use crate::providers::Provider;

const MOVE_SYSTEM: &str = "You are a strict controller deciding state transitions in a multi-agent simulation.\n\
Return exactly one token: move or stay.\n\
No punctuation, no explanation.";

const CLASSIFY_SYSTEM: &str = "You classify how the sender seems to treat us.\n\
Return exactly one token: good, bad, or neutral.\n\
No explanation.";

/// Asks the model for a one-token verdict. Unparseable answers and backend
/// errors fall back to keyword scoring, so this hook only fails if the
/// fallback does.
pub struct LlmPolicy {
    provider: Arc<dyn Provider>,
    model: Option<String>,
    goal: String,
    classify: bool,
    fallback: KeywordPolicy,
}

impl LlmPolicy {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            model: None,
            goal: String::new(),
            classify: false,
            fallback: KeywordPolicy::new(),
        }
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// The agent's outside goal, included in every prompt.
    pub fn goal(mut self, goal: impl Into<String>) -> Self {
        self.goal = goal.into();
        self
    }

    /// Also ask the model for a good/bad/neutral classification.
    pub fn classify(mut self, enabled: bool) -> Self {
        self.classify = enabled;
        self
    }

    fn move_prompt(&self, ctx: &DecisionContext) -> String {
        let from = ctx.peer.as_ref().map(|p| p.as_str()).unwrap_or("unknown");
        format!(
            "{}\n\nOutside goal:\n{}\n\nDecision kind: {}\nContext: {}\n\nIncoming message from {}:\n{}\n\nToken:",
            MOVE_SYSTEM, self.goal, ctx.kind, ctx.hint, from, ctx.text
        )
    }

    fn classify_prompt(&self, ctx: &DecisionContext) -> String {
        let from = ctx.peer.as_ref().map(|p| p.as_str()).unwrap_or("unknown");
        format!(
            "{}\n\nOutside goal:\n{}\n\nMessage from {}:\n{}\n\nToken:",
            CLASSIFY_SYSTEM, self.goal, from, ctx.text
        )
    }

    async fn ask(&self, prompt: &str) -> Option<String> {
        match self.provider.complete(prompt, self.model.as_deref()).await {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::info!("[llm:{}] fallback due to error: {}", self.provider.name(), e);
                None
            }
        }
    }
}

#[async_trait]
impl DecisionHook for LlmPolicy {
    fn name(&self) -> &str {
        "llm"
    }

    async fn decide(&self, ctx: &DecisionContext) -> Result<Decision> {
        let answer = self.ask(&self.move_prompt(ctx)).await;
        let (verdict, confidence) = match answer.as_deref().and_then(Verdict::parse) {
            Some(v) => (v, 0.9),
            None => {
                let fallback = self.fallback.decide(ctx).await?;
                (fallback.verdict, fallback.confidence)
            }
        };

        let classification = if self.classify {
            self.ask(&self.classify_prompt(ctx))
                .await
                .as_deref()
                .and_then(Classification::parse)
        } else {
            None
        }
        .unwrap_or_else(|| KeywordPolicy::classify(&ctx.text));

        Ok(Decision {
            verdict,
            classification: Some(classification),
            confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::AgentId;
    use crate::providers::{ProviderError, Result as ProviderResult};
    use std::sync::Mutex;

    struct Scripted {
        answers: Mutex<Vec<ProviderResult<String>>>,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(answers: Vec<ProviderResult<String>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers),
                prompts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Provider for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn complete(&self, prompt: &str, _model: Option<&str>) -> ProviderResult<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            let mut answers = self.answers.lock().unwrap();
            if answers.is_empty() {
                Err(ProviderError::ApiError("script exhausted".to_string()))
            } else {
                answers.remove(0)
            }
        }

        fn default_model(&self) -> Option<&str> {
            None
        }
    }

    fn ctx(text: &str) -> DecisionContext {
        DecisionContext::new("registered->contact", AgentId::new("me"))
            .with_peer(AgentId::new("Scout_2"))
            .with_text(text)
            .with_hint("register->contact")
    }

    #[tokio::test]
    async fn test_model_answer_wins() {
        let provider = Scripted::new(vec![Ok("Stay".to_string()), Ok("bad".to_string())]);
        let policy = LlmPolicy::new(provider.clone())
            .goal("trade signals")
            .classify(true);

        let d = policy.decide(&ctx("hello friend")).await.unwrap();
        assert_eq!(d.verdict, Verdict::Stay);
        assert_eq!(d.classification, Some(Classification::Bad));

        let prompts = provider.prompts.lock().unwrap();
        assert!(prompts[0].contains("Decision kind: registered->contact"));
        assert!(prompts[0].contains("trade signals"));
        assert!(prompts[1].contains("good, bad, or neutral"));
    }

    #[tokio::test]
    async fn test_garbage_and_errors_fall_back() {
        let provider = Scripted::new(vec![Ok("perhaps?".to_string())]);
        let d = LlmPolicy::new(provider).decide(&ctx("hello friend")).await.unwrap();
        assert_eq!(d.verdict, Verdict::Move);
        assert_eq!(d.classification, Some(Classification::Good));

        let provider = Scripted::new(vec![Err(ProviderError::ApiError("down".to_string()))]);
        let d = LlmPolicy::new(provider).decide(&ctx("go away")).await.unwrap();
        assert_eq!(d.verdict, Verdict::Stay);
    }
}
