pub mod protocol;
pub mod throttle;
pub mod worker;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::config::Settings;
use crate::state::{StateScope, StateStore};
use protocol::{HostMessage, LogLevel, RpcRequest, SandboxEvent};
use throttle::{Admit, Rollover, Throttle};
use worker::{WorkerConfig, WorkerHandle};

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("{message}")]
    Script {
        message: String,
        stack: Option<String>,
    },
    #[error("function timed out after {0:?}")]
    Timeout(Duration),
    #[error("sandbox worker terminated unexpectedly")]
    Crashed,
    #[error("could not start sandbox worker: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Where forwarded channel events end up, normally the owning node.
pub trait Outlet: Send + Sync {
    fn log(&self, level: LogLevel, text: &str);
    fn status(&self, status: Value);
    fn send(&self, msg: Value);
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub name: String,
    pub initialize: Option<String>,
    pub denylist: Vec<String>,
    pub rpc_timeout: Duration,
    pub throttle_interval: Duration,
    pub throttle_burst: u32,
}

impl SandboxConfig {
    pub fn from_settings(name: &str, initialize: Option<String>, settings: &Settings) -> Self {
        Self {
            name: name.to_string(),
            initialize,
            denylist: settings.sandbox_denylist.clone(),
            rpc_timeout: settings.sandbox_rpc_timeout,
            throttle_interval: settings.throttle_interval,
            throttle_burst: settings.throttle_burst,
        }
    }

    fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            name: self.name.clone(),
            initialize: self.initialize.clone(),
            denylist: self.denylist.clone(),
            rpc_timeout: self.rpc_timeout,
        }
    }
}

/// Host side of one node's isolated execution context. The worker thread is
/// started lazily and replaced after a timeout or crash.
pub struct Sandbox {
    config: SandboxConfig,
    node_id: String,
    states: Arc<dyn StateStore>,
    outlet: Arc<dyn Outlet>,
    worker: Option<WorkerHandle>,
    next_exec: u64,
    throttle: Throttle,
    contexts_started: u64,
}

impl Sandbox {
    pub fn new(
        config: SandboxConfig,
        node_id: &str,
        states: Arc<dyn StateStore>,
        outlet: Arc<dyn Outlet>,
    ) -> Self {
        let throttle = Throttle::new(config.throttle_interval, config.throttle_burst);
        Self {
            config,
            node_id: node_id.to_string(),
            states,
            outlet,
            worker: None,
            next_exec: 0,
            throttle,
            contexts_started: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// How many execution contexts have been created so far.
    pub fn contexts_started(&self) -> u64 {
        self.contexts_started
    }

    /// Runs `func` against `msg`. Exactly one of a value or an error comes
    /// back; a worker that misses the deadline is killed.
    #[tracing::instrument(level = "debug", skip(self, func, msg), fields(node = %self.node_id))]
    pub async fn invoke(&mut self, func: &str, msg: Value, timeout: Duration) -> Result<Value, SandboxError> {
        if self.worker.is_none() {
            self.worker = Some(WorkerHandle::spawn(self.config.worker())?);
            self.contexts_started += 1;
            debug!(contexts = self.contexts_started, "sandbox context created");
        }
        self.next_exec += 1;
        let exec_id = self.next_exec;
        let posted = self.worker.as_ref().is_some_and(|w| {
            w.post(HostMessage::Invoke {
                exec_id,
                func: func.to_string(),
                msg,
            })
        });
        if !posted {
            self.terminate();
            return Err(SandboxError::Crashed);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let Some(worker) = self.worker.as_mut() else {
                return Err(SandboxError::Crashed);
            };
            let event = match tokio::time::timeout_at(deadline, worker.next_event()).await {
                Err(_) => {
                    warn!(?timeout, "sandbox did not answer in time, terminating");
                    self.terminate();
                    return Err(SandboxError::Timeout(timeout));
                }
                Ok(None) => {
                    self.terminate();
                    return Err(SandboxError::Crashed);
                }
                Ok(Some(event)) => event,
            };
            match event {
                SandboxEvent::Result { exec_id: id, value } if id == exec_id => {
                    self.flush();
                    return Ok(value);
                }
                SandboxEvent::Error {
                    exec_id: id,
                    message,
                    stack,
                } if id == exec_id => {
                    self.flush();
                    return Err(SandboxError::Script { message, stack });
                }
                SandboxEvent::Result { exec_id: id, .. } | SandboxEvent::Error { exec_id: id, .. } => {
                    trace!(stale = id, "discarding answer to an abandoned invocation");
                }
                SandboxEvent::InitError { message } => {
                    self.outlet
                        .log(LogLevel::Warn, &format!("initialize failed: {message}"));
                }
                SandboxEvent::Rpc {
                    correlation,
                    request,
                } => {
                    let value = answer(&self.states, &self.node_id, request).await;
                    if let Some(worker) = self.worker.as_ref() {
                        worker.post(HostMessage::Reply { correlation, value });
                    }
                }
                other => self.forward(other),
            }
        }
    }

    /// Kills the current worker; the next invocation starts a fresh one.
    pub fn terminate(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }

    fn forward(&mut self, event: SandboxEvent) {
        if let Some(rollover) = self.throttle.roll(Instant::now()) {
            self.release(rollover);
        }
        let status = match &event {
            SandboxEvent::Status(value) => Some(value),
            _ => None,
        };
        if event.is_throttled() && self.throttle.admit(status) != Admit::Pass {
            return;
        }
        match event {
            SandboxEvent::Log { level, text } => self.outlet.log(level, &text),
            SandboxEvent::Status(value) => self.outlet.status(value),
            SandboxEvent::Send(msg) => self.outlet.send(msg),
            _ => {}
        }
    }

    fn flush(&mut self) {
        if let Some(rollover) = self.throttle.take() {
            self.release(rollover);
        }
    }

    fn release(&self, rollover: Rollover) {
        if rollover.suppressed > 0 {
            self.outlet.log(
                LogLevel::Warn,
                &format!("{} sandbox events suppressed by rate limit", rollover.suppressed),
            );
        }
        if let Some(status) = rollover.status {
            self.outlet.status(status);
        }
    }
}

/// Serves one side-channel request from the state store.
async fn answer(states: &Arc<dyn StateStore>, node_id: &str, request: RpcRequest) -> Result<Value, String> {
    let node = StateScope::Node(node_id.to_string());
    let (scope, key) = match &request {
        RpcRequest::ContextGet { key } | RpcRequest::ContextSet { key, .. } => (&node, key),
        RpcRequest::GlobalGet { key } | RpcRequest::GlobalSet { key, .. } => {
            (&StateScope::Global, key)
        }
    };
    if key.is_empty() {
        return Err("context key must not be empty".to_string());
    }
    let key = key.clone();
    match request {
        RpcRequest::ContextGet { .. } | RpcRequest::GlobalGet { .. } => {
            Ok(states.get(scope, &key).await.unwrap_or(Value::Null))
        }
        RpcRequest::ContextSet { value, .. } | RpcRequest::GlobalSet { value, .. } => {
            states.set(scope, &key, value).await;
            Ok(Value::Null)
        }
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::InMemoryState;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        logs: Mutex<Vec<(LogLevel, String)>>,
        statuses: Mutex<Vec<Value>>,
        sent: Mutex<Vec<Value>>,
    }

    impl Outlet for Recording {
        fn log(&self, level: LogLevel, text: &str) {
            self.logs.lock().unwrap().push((level, text.to_string()));
        }
        fn status(&self, status: Value) {
            self.statuses.lock().unwrap().push(status);
        }
        fn send(&self, msg: Value) {
            self.sent.lock().unwrap().push(msg);
        }
    }

    fn config(initialize: Option<&str>, burst: u32) -> SandboxConfig {
        SandboxConfig {
            name: "test".into(),
            initialize: initialize.map(str::to_string),
            denylist: vec!["eval".into(), "import".into()],
            rpc_timeout: Duration::from_secs(2),
            throttle_interval: Duration::from_secs(60),
            throttle_burst: burst,
        }
    }

    fn sandbox(initialize: Option<&str>, burst: u32) -> (Sandbox, Arc<Recording>, Arc<InMemoryState>) {
        let outlet = Arc::new(Recording::default());
        let states = InMemoryState::new();
        let sandbox = Sandbox::new(config(initialize, burst), "fn1", states.clone(), outlet.clone());
        (sandbox, outlet, states)
    }

    const LONG: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_result_is_returned() {
        let (mut sb, _, _) = sandbox(None, 50);
        let out = sb
            .invoke("msg.payload = msg.payload * 2; msg", json!({"payload": 2}), LONG)
            .await
            .unwrap();
        assert_eq!(out["payload"], json!(4));
    }

    #[tokio::test]
    async fn test_initialize_locals_persist_body_locals_do_not() {
        let (mut sb, _, _) = sandbox(Some("let counter = 0;"), 50);
        let body = "counter += 1; let temp = counter; msg.payload = temp; msg";
        assert_eq!(sb.invoke(body, json!({}), LONG).await.unwrap()["payload"], json!(1));
        assert_eq!(sb.invoke(body, json!({}), LONG).await.unwrap()["payload"], json!(2));

        let err = sb.invoke("temp", json!({}), LONG).await.unwrap_err();
        assert!(matches!(err, SandboxError::Script { .. }));
    }

    #[tokio::test]
    async fn test_script_error_does_not_kill_the_context() {
        let (mut sb, _, _) = sandbox(Some("let seen = 10;"), 50);
        let err = sb.invoke("throw \"boom\";", json!({}), LONG).await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        assert_eq!(sb.invoke("seen", json!({}), LONG).await.unwrap(), json!(10));
        assert_eq!(sb.contexts_started(), 1);
    }

    #[tokio::test]
    async fn test_hung_body_times_out_and_next_call_gets_fresh_context() {
        let (mut sb, _, _) = sandbox(Some("let counter = 0;"), 50);
        let body = "counter += 1; counter";
        assert_eq!(sb.invoke(body, json!({}), LONG).await.unwrap(), json!(1));

        let err = sb
            .invoke("loop { }", json!({}), Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
        assert!(!sb.is_running());

        assert_eq!(sb.invoke(body, json!({}), LONG).await.unwrap(), json!(1));
        assert_eq!(sb.contexts_started(), 2);
    }

    #[tokio::test]
    async fn test_context_access_goes_through_the_side_channel() {
        let (mut sb, _, states) = sandbox(None, 50);
        let out = sb
            .invoke(
                "context_set(\"k\", 5); global_set(\"g\", \"shared\"); context_get(\"k\") + 1",
                json!({}),
                LONG,
            )
            .await
            .unwrap();
        assert_eq!(out, json!(6));
        assert_eq!(states.get(&StateScope::Node("fn1".into()), "k").await, Some(json!(5)));
        assert_eq!(states.get(&StateScope::Global, "g").await, Some(json!("shared")));

        let err = sb.invoke("context_get(\"\")", json!({}), LONG).await.unwrap_err();
        assert!(err.to_string().contains("must not be empty"));
    }

    #[tokio::test]
    async fn test_denylisted_symbols_are_unavailable() {
        let (mut sb, _, _) = sandbox(None, 50);
        let err = sb.invoke("eval(\"40 + 2\")", json!({}), LONG).await.unwrap_err();
        assert!(matches!(err, SandboxError::Script { .. }));
    }

    #[tokio::test]
    async fn test_channel_events_are_throttled_but_errors_are_not() {
        let (mut sb, outlet, _) = sandbox(None, 3);
        sb.invoke("for i in 0..10 { node_log(`line ${i}`); } node_status(#{text: \"busy\"}); ()", json!({}), LONG)
            .await
            .unwrap();
        let logs = outlet.logs.lock().unwrap().clone();
        let infos = logs.iter().filter(|(l, _)| *l == LogLevel::Info).count();
        assert_eq!(infos, 3);
        assert!(logs.iter().any(|(l, t)| *l == LogLevel::Warn && t.contains("7 sandbox events suppressed")));
        assert_eq!(outlet.statuses.lock().unwrap().as_slice(), [json!({"text": "busy"})]);

        let err = sb.invoke("throw \"still reported\"", json!({}), LONG).await.unwrap_err();
        assert!(err.to_string().contains("still reported"));
    }

    #[tokio::test]
    async fn test_node_send_and_print_are_forwarded() {
        let (mut sb, outlet, _) = sandbox(None, 50);
        sb.invoke("print(\"hello\"); node_send(#{payload: 1}); ()", json!({}), LONG)
            .await
            .unwrap();
        assert_eq!(outlet.sent.lock().unwrap().as_slice(), [json!({"payload": 1})]);
        assert_eq!(outlet.logs.lock().unwrap()[0].1, "hello");
    }
}
