use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace};

pub type SubscriptionId = u64;

type Handler = Arc<dyn Fn(Event) + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("no subscriber for `{0}`")]
    NoSubscribers(String),
    #[error("request `{0}` timed out after {1:?}")]
    Timeout(String, Duration),
    #[error("request `{0}` was dropped without a reply")]
    Unanswered(String),
}

/// One-shot reply slot shared by every handler that sees a request.
/// Only the first call to [`Reply::send`] resolves the caller.
#[derive(Clone)]
pub struct Reply(Arc<Mutex<Option<oneshot::Sender<Value>>>>);

impl Reply {
    fn new(tx: oneshot::Sender<Value>) -> Self {
        Reply(Arc::new(Mutex::new(Some(tx))))
    }

    pub fn send(&self, value: Value) -> bool {
        let sender = match self.0.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match sender {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }
}

/// What a handler receives: the channel name, the payload (or request
/// params) and, for requests, the reply slot.
#[derive(Clone)]
pub struct Event {
    name: Arc<str>,
    payload: Value,
    reply: Option<Reply>,
}

impl Event {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Alias of [`Event::payload`] for request handlers.
    pub fn params(&self) -> &Value {
        &self.payload
    }

    pub fn is_request(&self) -> bool {
        self.reply.is_some()
    }

    /// Resolve the pending request. Later calls are no-ops and return false.
    pub fn reply(&self, value: Value) -> bool {
        match &self.reply {
            Some(reply) => reply.send(value),
            None => false,
        }
    }
}

/// Named-event pub/sub between the engine and external controllers.
pub struct EventBridge {
    handlers: DashMap<String, Vec<(SubscriptionId, Handler)>>,
    next_id: AtomicU64,
}

impl fmt::Debug for EventBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBridge")
            .field("events", &self.handlers.len())
            .finish()
    }
}

impl Default for EventBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBridge {
    pub fn new() -> Self {
        Self {
            handlers: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn on<F>(&self, name: &str, handler: F) -> SubscriptionId
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .entry(name.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        debug!(event = name, subscription = id, "bridge subscription added");
        id
    }

    pub fn off(&self, name: &str, id: SubscriptionId) -> bool {
        let mut removed = false;
        if let Some(mut list) = self.handlers.get_mut(name) {
            let before = list.len();
            list.retain(|(sid, _)| *sid != id);
            removed = list.len() != before;
        }
        self.handlers.remove_if(name, |_, list| list.is_empty());
        removed
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        self.handlers.get(name).map(|l| l.len()).unwrap_or(0)
    }

    pub fn clear(&self) {
        self.handlers.clear();
    }

    /// Fire-and-forget broadcast. Returns how many handlers saw the event.
    pub fn emit(&self, name: &str, payload: Value) -> usize {
        let event = Event {
            name: Arc::from(name),
            payload,
            reply: None,
        };
        self.dispatch(event)
    }

    /// Request/reply. Exactly one handler is expected to reply; if none do
    /// the call fails instead of waiting forever.
    pub async fn request(
        &self,
        name: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, BridgeError> {
        if self.subscriber_count(name) == 0 {
            return Err(BridgeError::NoSubscribers(name.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        let event = Event {
            name: Arc::from(name),
            payload: params,
            reply: Some(Reply::new(tx)),
        };
        self.dispatch(event);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(BridgeError::Unanswered(name.to_string())),
            Err(_) => Err(BridgeError::Timeout(name.to_string(), timeout)),
        }
    }

    fn dispatch(&self, event: Event) -> usize {
        // Snapshot so handlers may subscribe or emit without holding the shard lock.
        let handlers: Vec<Handler> = match self.handlers.get(event.name()) {
            Some(list) => list.iter().map(|(_, h)| h.clone()).collect(),
            None => return 0,
        };
        trace!(event = event.name(), handlers = handlers.len(), "bridge dispatch");
        let count = handlers.len();
        for handler in handlers {
            handler(event.clone());
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_reaches_every_subscriber() {
        let bridge = EventBridge::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = hits.clone();
            bridge.on("notification", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(bridge.emit("notification", json!({"msg": 1})), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(bridge.emit("nobody", json!(null)), 0);
    }

    #[test]
    fn test_off_removes_only_that_handler() {
        let bridge = EventBridge::new();
        let a = bridge.on("x", |_| {});
        let _b = bridge.on("x", |_| {});
        assert!(bridge.off("x", a));
        assert!(!bridge.off("x", a));
        assert_eq!(bridge.subscriber_count("x"), 1);
    }

    #[tokio::test]
    async fn test_request_first_reply_wins() {
        let bridge = EventBridge::new();
        bridge.on("rpc_echo", |event| {
            assert!(event.reply(event.params().clone()));
            assert!(!event.reply(json!("second")));
        });
        bridge.on("rpc_echo", |event| {
            assert!(!event.reply(json!("late")));
        });
        let value = bridge
            .request("rpc_echo", json!({"a": 1}), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_request_without_subscribers_fails_fast() {
        let bridge = EventBridge::new();
        let err = bridge
            .request("rpc_missing", json!(null), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::NoSubscribers("rpc_missing".into()));
    }

    #[tokio::test]
    async fn test_request_dropped_without_reply() {
        let bridge = EventBridge::new();
        bridge.on("rpc_silent", |_event| {});
        let err = bridge
            .request("rpc_silent", json!(null), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Unanswered(_)));
    }

    #[tokio::test]
    async fn test_request_times_out_when_reply_is_held() {
        let bridge = EventBridge::new();
        let parked = Arc::new(Mutex::new(Vec::new()));
        let keep = parked.clone();
        bridge.on("rpc_slow", move |event| keep.lock().unwrap().push(event));
        let err = bridge
            .request("rpc_slow", json!(null), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_, _)));
        assert_eq!(parked.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_async_handler_replies_later() {
        let bridge = EventBridge::new();
        bridge.on("rpc_later", |event| {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                event.reply(json!(200));
            });
        });
        let value = bridge
            .request("rpc_later", json!(null), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(value, json!(200));
    }
}
