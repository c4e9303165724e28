//! Memoising wrapper around another hook.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{Decision, DecisionContext, DecisionHook};
use crate::error::Result;

/// Remembers successful decisions per `kind|peer|text`. Failures are not
/// cached, so a flaky backend gets asked again next time.
pub struct CachedHook {
    inner: Arc<dyn DecisionHook>,
    entries: Mutex<HashMap<String, Decision>>,
}

impl CachedHook {
    pub fn new(inner: Arc<dyn DecisionHook>) -> Self {
        Self {
            inner,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn key(ctx: &DecisionContext) -> String {
        let peer = ctx.peer.as_ref().map(|p| p.as_str()).unwrap_or("");
        format!("{}|{}|{}", ctx.kind, peer, ctx.text)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    fn get(&self, key: &str) -> Option<Decision> {
        self.entries.lock().ok()?.get(key).copied()
    }
}

#[async_trait]
impl DecisionHook for CachedHook {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn decide(&self, ctx: &DecisionContext) -> Result<Decision> {
        let key = Self::key(ctx);
        if let Some(hit) = self.get(&key) {
            tracing::trace!("decision cache hit: {}", key);
            return Ok(hit);
        }

        let decision = self.inner.decide(ctx).await?;
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key, decision);
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::protocol::AgentId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl DecisionHook for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn decide(&self, _ctx: &DecisionContext) -> Result<Decision> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                return Err(Error::Decision("cold".to_string()));
            }
            Ok(Decision::moving(1.0))
        }
    }

    fn ctx(text: &str) -> DecisionContext {
        DecisionContext::new("registered->contact", AgentId::new("me"))
            .with_peer(AgentId::new("peer"))
            .with_text(text)
    }

    #[tokio::test]
    async fn test_hits_skip_inner() {
        let inner = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail_first: false,
        });
        let cached = CachedHook::new(inner.clone());

        cached.decide(&ctx("hello")).await.unwrap();
        cached.decide(&ctx("hello")).await.unwrap();
        cached.decide(&ctx("other")).await.unwrap();

        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cached.len(), 2);
        assert_eq!(CachedHook::key(&ctx("hello")), "registered->contact|peer|hello");
    }

    #[tokio::test]
    async fn test_errors_not_cached() {
        let inner = Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail_first: true,
        });
        let cached = CachedHook::new(inner.clone());

        assert!(cached.decide(&ctx("hello")).await.is_err());
        assert!(cached.is_empty());
        assert!(cached.decide(&ctx("hello")).await.unwrap().is_move());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }
}
