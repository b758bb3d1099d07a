use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bridge::EventBridge;
use crate::message::Message;
use crate::router::RouterCommand;
use crate::sandbox::SandboxError;

pub type NodeId = String;

/// Whether `on_input` finished with the message or will report completion
/// later through [`NodeContext::done`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Done,
    Pending,
}

/// Out-of-band commands delivered by the control plane.
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    /// Fire the node as if its trigger button was pressed, optionally with
    /// a replacement payload.
    Trigger(Option<Value>),
    SetActive(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlReply {
    Triggered,
    Enabled,
    Disabled,
    Unsupported,
    NotFound,
}

impl ControlReply {
    /// Numeric status returned over the RPC bridge.
    pub fn code(&self) -> u16 {
        match self {
            ControlReply::Triggered | ControlReply::Enabled => 200,
            ControlReply::Disabled => 201,
            ControlReply::Unsupported | ControlReply::NotFound => 404,
        }
    }
}

/// Messages emitted by one `send` call, indexed by output port.
/// `None` on a port means nothing is sent there this turn.
#[derive(Debug, Clone, Default)]
pub struct Outputs(pub Vec<Option<Vec<Message>>>);

impl Outputs {
    pub fn none() -> Self {
        Outputs(Vec::new())
    }

    pub fn port(index: usize, msg: Message) -> Self {
        let mut ports = vec![None; index + 1];
        ports[index] = Some(vec![msg]);
        Outputs(ports)
    }

    pub fn ports(ports: Vec<Option<Vec<Message>>>) -> Self {
        Outputs(ports)
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|p| p.as_ref().is_none_or(|m| m.is_empty()))
    }
}

impl From<Message> for Outputs {
    fn from(msg: Message) -> Self {
        Outputs(vec![Some(vec![msg])])
    }
}

impl From<Vec<Option<Message>>> for Outputs {
    fn from(ports: Vec<Option<Message>>) -> Self {
        Outputs(ports.into_iter().map(|m| m.map(|m| vec![m])).collect())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NodeStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fill: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shape: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl NodeStatus {
    pub fn new(fill: &str, shape: &str, text: impl Into<String>) -> Self {
        Self {
            fill: Some(fill.to_string()),
            shape: Some(shape.to_string()),
            text: Some(text.into()),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new("red", "ring", text)
    }

    pub fn clear() -> Self {
        Self::default()
    }
}

#[derive(Debug)]
pub enum NodeError {
    NotFound,
    InvalidInput(String),
    ExecutionFailed(String),
    Sandbox(SandboxError),
    Internal(String),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeError::NotFound => write!(f, "Node not found"),
            NodeError::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            NodeError::ExecutionFailed(msg) => write!(f, "Processing error: {}", msg),
            NodeError::Sandbox(err) => write!(f, "{}", err),
            NodeError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for NodeError {}

impl From<SandboxError> for NodeError {
    fn from(err: SandboxError) -> Self {
        NodeError::Sandbox(err)
    }
}

/// The node contract. Only `on_input` is required; the other hooks default
/// to no-ops so a node type implements just the ones it needs.
///
/// `on_input` runs on the router task and must not block. Nodes that wait on
/// timers or I/O spawn the work, return [`Completion::Pending`] and report
/// back through a clone of their [`NodeContext`].
#[async_trait]
pub trait Node: Send {
    /// Called once after the node is installed in the router.
    fn start(&mut self, _ctx: &NodeContext) {}

    fn on_input(&mut self, msg: Message, ctx: &NodeContext) -> Result<Completion, NodeError>;

    fn control(&mut self, _control: Control, _ctx: &NodeContext) -> ControlReply {
        ControlReply::Unsupported
    }

    /// Release timers, workers and sockets. The context's cancellation token
    /// has already fired when this runs.
    async fn close(&mut self) {}
}

/// Capability handed to each node instance: everything it may do to the
/// outside world goes through here.
#[derive(Clone)]
pub struct NodeContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    id: NodeId,
    node_type: String,
    name: Option<String>,
    scope: String,
    instance: u64,
    router: UnboundedSender<RouterCommand>,
    cancel: CancellationToken,
    bridge: Arc<EventBridge>,
}

impl NodeContext {
    pub(crate) fn new(
        id: &str,
        node_type: &str,
        name: Option<String>,
        scope: &str,
        instance: u64,
        router: UnboundedSender<RouterCommand>,
        bridge: Arc<EventBridge>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: id.to_string(),
                node_type: node_type.to_string(),
                name,
                scope: scope.to_string(),
                instance,
                router,
                cancel: CancellationToken::new(),
                bridge,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn node_type(&self) -> &str {
        &self.inner.node_type
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn scope(&self) -> &str {
        &self.inner.scope
    }

    pub fn instance(&self) -> u64 {
        self.inner.instance
    }

    pub fn bridge(&self) -> &Arc<EventBridge> {
        &self.inner.bridge
    }

    /// Token that fires when the node is being closed.
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub(crate) fn cancel(&self) {
        self.inner.cancel.cancel();
    }

    pub fn send(&self, outputs: impl Into<Outputs>) {
        let outputs = outputs.into();
        if outputs.is_empty() {
            return;
        }
        self.post(RouterCommand::Send {
            from: self.inner.id.clone(),
            instance: self.inner.instance,
            outputs,
        });
    }

    pub fn status(&self, status: NodeStatus) {
        self.post(RouterCommand::Status {
            from: self.inner.id.clone(),
            instance: self.inner.instance,
            status,
        });
    }

    /// Raise a runtime error, routed to the nearest catch node.
    pub fn error(&self, error: impl fmt::Display, msg: Option<Message>) {
        self.post(RouterCommand::Error {
            from: self.inner.id.clone(),
            instance: self.inner.instance,
            error: error.to_string(),
            msg,
        });
    }

    /// Report that a pending message has been fully handled.
    pub fn done(&self, msg: Option<Message>) {
        self.post(RouterCommand::Done {
            from: self.inner.id.clone(),
            instance: self.inner.instance,
            msg,
        });
    }

    pub fn log(&self, text: &str) {
        info!(node = %self.inner.id, node_type = %self.inner.node_type, "{text}");
        self.publish_log("info", text);
    }

    pub fn warn(&self, text: &str) {
        warn!(node = %self.inner.id, node_type = %self.inner.node_type, "{text}");
        self.publish_log("warn", text);
    }

    /// Publish on a named bridge channel.
    pub fn broadcast(&self, channel: &str, payload: Value) -> usize {
        self.inner.bridge.emit(channel, payload)
    }

    fn publish_log(&self, level: &str, text: &str) {
        self.inner.bridge.emit(
            "log",
            json!({
                "level": level,
                "id": self.inner.id,
                "type": self.inner.node_type,
                "name": self.inner.name,
                "msg": text,
            }),
        );
    }

    fn post(&self, command: RouterCommand) {
        // The router only goes away during engine shutdown.
        let _ = self.inner.router.send(command);
    }
}

impl fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeContext")
            .field("id", &self.inner.id)
            .field("type", &self.inner.node_type)
            .field("scope", &self.inner.scope)
            .field("instance", &self.inner.instance)
            .finish()
    }
}
