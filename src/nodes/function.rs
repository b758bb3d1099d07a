use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::message::Message;
use crate::node::{Completion, Node, NodeContext, NodeError, NodeStatus, Outputs};
use crate::nodes::{number_property, seconds};
use crate::registry::NodeSetup;
use crate::sandbox::protocol::LogLevel;
use crate::sandbox::{Outlet, Sandbox, SandboxConfig};
use crate::state::StateStore;

/// Turns a function result into per-port messages.
///
/// An object goes to port 0, an array spreads over the ports (each entry a
/// message, an array of messages or null) and null sends nothing.
pub fn map_result(value: Value, outputs: usize, original: Option<&Message>) -> Result<Outputs, NodeError> {
    let to_message = |value: Value| -> Result<Message, NodeError> {
        match value {
            Value::Object(_) => {
                let mut msg = Message::from_value(value);
                if let Some(original) = original {
                    msg.adopt_handles(original);
                }
                Ok(msg)
            }
            other => Err(NodeError::InvalidInput(format!(
                "function returned `{other}` where a message object was expected"
            ))),
        }
    };

    match value {
        Value::Null => Ok(Outputs::none()),
        Value::Object(_) => Ok(Outputs::from(to_message(value)?)),
        Value::Array(ports) => {
            let mut mapped = Vec::with_capacity(ports.len().min(outputs));
            for port in ports.into_iter().take(outputs.max(1)) {
                mapped.push(match port {
                    Value::Null => None,
                    Value::Array(list) => Some(
                        list.into_iter()
                            .filter(|m| !m.is_null())
                            .map(&to_message)
                            .collect::<Result<Vec<_>, _>>()?,
                    ),
                    single => Some(vec![to_message(single)?]),
                });
            }
            Ok(Outputs::ports(mapped))
        }
        other => Err(NodeError::InvalidInput(format!(
            "function returned `{other}` where a message object was expected"
        ))),
    }
}

/// Forwards sandbox channel events to the owning node.
struct NodeOutlet {
    ctx: NodeContext,
    outputs: usize,
}

impl Outlet for NodeOutlet {
    fn log(&self, level: LogLevel, text: &str) {
        match level {
            LogLevel::Info => self.ctx.log(text),
            LogLevel::Warn => self.ctx.warn(text),
        }
    }

    fn status(&self, status: Value) {
        let status = match status {
            Value::String(text) => NodeStatus {
                text: Some(text),
                ..NodeStatus::default()
            },
            other => serde_json::from_value(other).unwrap_or_default(),
        };
        self.ctx.status(status);
    }

    fn send(&self, msg: Value) {
        match map_result(msg, self.outputs, None) {
            Ok(outputs) => self.ctx.send(outputs),
            Err(err) => self.ctx.warn(&err.to_string()),
        }
    }
}

/// Runs user code in a [`Sandbox`]. Messages are queued to a per-node
/// invoker task, so one invocation runs at a time and the router never waits.
pub struct FunctionNode {
    func: Arc<str>,
    outputs: usize,
    timeout: Duration,
    sandbox: SandboxConfig,
    states: Arc<dyn StateStore>,
    queue: Option<UnboundedSender<Message>>,
    task: Option<JoinHandle<()>>,
}

impl FunctionNode {
    pub fn create(setup: &NodeSetup<'_>) -> Result<Box<dyn Node>, NodeError> {
        let settings = &setup.engine.settings;
        let func = setup
            .definition
            .config_str("func")
            .filter(|f| !f.trim().is_empty())
            .unwrap_or("msg");
        let outputs = setup
            .config("outputs")
            .and_then(Value::as_u64)
            .unwrap_or(1) as usize;
        let timeout = match number_property(setup, "timeout")? {
            Some(secs) if secs > 0.0 => seconds("timeout", secs)?,
            _ => settings.sandbox_timeout,
        };
        let initialize = setup
            .definition
            .config_str("initialize")
            .map(str::to_string);
        Ok(Box::new(Self {
            func: Arc::from(func),
            outputs,
            timeout,
            sandbox: SandboxConfig::from_settings(&setup.definition.id, initialize, settings),
            states: setup.engine.states.clone(),
            queue: None,
            task: None,
        }))
    }
}

#[async_trait]
impl Node for FunctionNode {
    fn start(&mut self, ctx: &NodeContext) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        let outlet = Arc::new(NodeOutlet {
            ctx: ctx.clone(),
            outputs: self.outputs,
        });
        let mut sandbox = Sandbox::new(self.sandbox.clone(), ctx.id(), self.states.clone(), outlet);
        let ctx = ctx.clone();
        let cancel = ctx.cancellation();
        let func = self.func.clone();
        let (timeout, outputs) = (self.timeout, self.outputs);

        self.task = Some(tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(msg) => msg,
                        None => break,
                    },
                };
                match sandbox.invoke(&func, msg.to_value(), timeout).await {
                    Ok(value) => match map_result(value, outputs, Some(&msg)) {
                        Ok(out) => {
                            ctx.send(out);
                            ctx.done(Some(msg));
                        }
                        Err(err) => ctx.error(err, Some(msg)),
                    },
                    Err(err) => ctx.error(NodeError::from(err), Some(msg)),
                }
            }
            sandbox.terminate();
            debug!(node = %ctx.id(), "function invoker stopped");
        }));
        self.queue = Some(tx);
    }

    fn on_input(&mut self, msg: Message, _ctx: &NodeContext) -> Result<Completion, NodeError> {
        match &self.queue {
            Some(queue) => queue
                .send(msg)
                .map(|_| Completion::Pending)
                .map_err(|_| NodeError::Internal("function invoker has stopped".into())),
            None => Err(NodeError::Internal("function node was not started".into())),
        }
    }

    async fn close(&mut self) {
        self.queue = None;
        if let Some(task) = self.task.take() {
            task.abort();
            if let Err(err) = task.await {
                if !err.is_cancelled() {
                    warn!("function invoker ended abnormally: {err}");
                }
            }
        }
    }
}
