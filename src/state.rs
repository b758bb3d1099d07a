use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

/// Which key space a context operation addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StateScope {
    /// Private to one node id; survives redeploys of that id.
    Node(String),
    /// Shared by the whole process.
    Global,
}

/// Context storage reachable from sandboxed code through the side channel.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, scope: &StateScope, key: &str) -> Option<Value>;
    /// Setting `null` deletes the key.
    async fn set(&self, scope: &StateScope, key: &str, value: Value);
    async fn keys(&self, scope: &StateScope) -> Vec<String>;
    async fn clear(&self, scope: &StateScope);

    fn name(&self) -> &'static str;
}

impl fmt::Debug for dyn StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateStore")
            .field("impl", &self.name())
            .finish()
    }
}

#[derive(Default)]
pub struct InMemoryState {
    store: RwLock<HashMap<StateScope, HashMap<String, Value>>>,
}

impl InMemoryState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl StateStore for InMemoryState {
    async fn get(&self, scope: &StateScope, key: &str) -> Option<Value> {
        self.store
            .read()
            .await
            .get(scope)
            .and_then(|entries| entries.get(key).cloned())
    }

    async fn set(&self, scope: &StateScope, key: &str, value: Value) {
        let mut store = self.store.write().await;
        if value.is_null() {
            if let Some(entries) = store.get_mut(scope) {
                entries.remove(key);
                if entries.is_empty() {
                    store.remove(scope);
                }
            }
            return;
        }
        store
            .entry(scope.clone())
            .or_default()
            .insert(key.to_string(), value);
    }

    async fn keys(&self, scope: &StateScope) -> Vec<String> {
        let mut keys: Vec<String> = self
            .store
            .read()
            .await
            .get(scope)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    async fn clear(&self, scope: &StateScope) {
        self.store.write().await.remove(scope);
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_node_and_global_scopes_are_separate() {
        let state = InMemoryState::new();
        let node = StateScope::Node("n1".into());
        state.set(&node, "count", json!(1)).await;
        state.set(&StateScope::Global, "count", json!(99)).await;

        assert_eq!(state.get(&node, "count").await, Some(json!(1)));
        assert_eq!(state.get(&StateScope::Global, "count").await, Some(json!(99)));
        assert_eq!(state.get(&StateScope::Node("n2".into()), "count").await, None);
    }

    #[tokio::test]
    async fn test_null_deletes_and_clear_drops_scope() {
        let state = InMemoryState::new();
        let node = StateScope::Node("n1".into());
        state.set(&node, "a", json!("x")).await;
        state.set(&node, "b", json!("y")).await;
        state.set(&node, "a", Value::Null).await;
        assert_eq!(state.keys(&node).await, vec!["b".to_string()]);

        state.clear(&node).await;
        assert!(state.keys(&node).await.is_empty());
    }
}
