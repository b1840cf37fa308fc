use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Per-session cancellation tokens observed at every suspension point of
/// the workflow. Cancelling is cooperative: in-flight tool calls finish,
/// then the agent yields.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, session_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .write()
            .await
            .insert(session_id.to_string(), token.clone());
        token
    }

    pub async fn cancel(&self, session_id: &str) -> bool {
        let tokens = self.tokens.read().await;
        if let Some(token) = tokens.get(session_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    pub async fn remove(&self, session_id: &str) {
        self.tokens.write().await.remove(session_id);
    }

    pub async fn is_active(&self, session_id: &str) -> bool {
        self.tokens.read().await.contains_key(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_reaches_the_registered_token() {
        let registry = CancellationRegistry::new();
        let token = registry.create("s-1").await;
        assert!(!token.is_cancelled());
        assert!(registry.cancel("s-1").await);
        assert!(token.is_cancelled());
        registry.remove("s-1").await;
        assert!(!registry.cancel("s-1").await);
    }
}
