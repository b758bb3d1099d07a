use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::bridge::EventBridge;
use crate::flow::compiler::WireMap;
use crate::message::Message;
use crate::node::{Completion, Control, ControlReply, Node, NodeContext, NodeId, NodeStatus, Outputs};
use crate::signal::{SignalBus, SignalKind};

/// Errors bouncing between the same node and its catch handler are dropped
/// after this many hops.
const MAX_ERROR_HOPS: u64 = 10;

/// Deliveries processed before the router yields to other tasks.
const YIELD_EVERY: usize = 256;

/// A live node owned by the router.
pub struct NodeSlot {
    pub ctx: NodeContext,
    pub node: Box<dyn Node>,
    /// Set when the node runs degraded (unknown type or failed factory).
    pub fault: Option<String>,
}

impl NodeSlot {
    pub fn id(&self) -> &str {
        self.ctx.id()
    }
}

pub enum RouterCommand {
    Send {
        from: NodeId,
        instance: u64,
        outputs: Outputs,
    },
    Error {
        from: NodeId,
        instance: u64,
        error: String,
        msg: Option<Message>,
    },
    Status {
        from: NodeId,
        instance: u64,
        status: NodeStatus,
    },
    Done {
        from: NodeId,
        instance: u64,
        msg: Option<Message>,
    },
    Control {
        id: NodeId,
        control: Control,
        reply: oneshot::Sender<ControlReply>,
    },
    /// Replace the wiring and add freshly instantiated nodes.
    Install {
        wires: Arc<WireMap>,
        bus: Arc<SignalBus>,
        slots: Vec<NodeSlot>,
        reply: oneshot::Sender<()>,
    },
    /// Remove nodes and hand them back for closing.
    Detach {
        ids: HashSet<NodeId>,
        reply: oneshot::Sender<Vec<NodeSlot>>,
    },
    Shutdown {
        reply: oneshot::Sender<Vec<NodeSlot>>,
    },
}

/// Cheap handle to the router task.
#[derive(Clone)]
pub struct RouterHandle {
    tx: UnboundedSender<RouterCommand>,
}

impl RouterHandle {
    pub fn spawn(bridge: Arc<EventBridge>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let router = Router::new(bridge);
        let task = tokio::spawn(router.run(rx));
        (Self { tx }, task)
    }

    pub fn sender(&self) -> UnboundedSender<RouterCommand> {
        self.tx.clone()
    }

    pub async fn install(&self, wires: Arc<WireMap>, bus: Arc<SignalBus>, slots: Vec<NodeSlot>) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(RouterCommand::Install { wires, bus, slots, reply })
            .is_err()
        {
            return false;
        }
        rx.await.is_ok()
    }

    pub async fn detach(&self, ids: HashSet<NodeId>) -> Vec<NodeSlot> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RouterCommand::Detach { ids, reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub async fn control(&self, id: &str, control: Control) -> ControlReply {
        let (reply, rx) = oneshot::channel();
        let command = RouterCommand::Control {
            id: id.to_string(),
            control,
            reply,
        };
        if self.tx.send(command).is_err() {
            return ControlReply::NotFound;
        }
        rx.await.unwrap_or(ControlReply::NotFound)
    }

    pub async fn shutdown(&self) -> Vec<NodeSlot> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(RouterCommand::Shutdown { reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

struct Delivery {
    to: NodeId,
    msg: Message,
}

/// Single scheduling domain for every delivery. Nodes live in an arena keyed
/// by id and deliveries go through a FIFO work queue, so cycles never grow
/// the call stack.
struct Router {
    slots: HashMap<NodeId, NodeSlot>,
    wires: Arc<WireMap>,
    bus: Arc<SignalBus>,
    queue: VecDeque<Delivery>,
    errored: HashSet<NodeId>,
    bridge: Arc<EventBridge>,
    running: bool,
}

impl Router {
    fn new(bridge: Arc<EventBridge>) -> Self {
        Self {
            slots: HashMap::new(),
            wires: Arc::default(),
            bus: Arc::default(),
            queue: VecDeque::new(),
            errored: HashSet::new(),
            bridge,
            running: true,
        }
    }

    async fn run(mut self, mut rx: UnboundedReceiver<RouterCommand>) {
        debug!("router started");
        while self.running {
            let Some(command) = rx.recv().await else {
                break;
            };
            self.handle(command);

            let mut processed = 0usize;
            while self.running {
                let Some(delivery) = self.queue.pop_front() else {
                    break;
                };
                self.deliver(delivery);
                // Commands raised synchronously by that delivery join the queue
                // before the next one runs, preserving per-origin order.
                while self.running {
                    match rx.try_recv() {
                        Ok(command) => self.handle(command),
                        Err(_) => break,
                    }
                }
                processed += 1;
                if processed % YIELD_EVERY == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }
        debug!(remaining = self.slots.len(), "router stopped");
    }

    fn handle(&mut self, command: RouterCommand) {
        match command {
            RouterCommand::Send { from, instance, outputs } => {
                if self.is_live(&from, instance) {
                    self.route(&from, outputs);
                } else {
                    trace!(node = %from, "dropping send from stale instance");
                }
            }
            RouterCommand::Error { from, instance, error, msg } => {
                if self.is_live(&from, instance) {
                    self.raise_error(&from, error, msg);
                }
            }
            RouterCommand::Status { from, instance, status } => {
                if self.is_live(&from, instance) {
                    self.raise_status(&from, status);
                }
            }
            RouterCommand::Done { from, instance, msg } => {
                if self.is_live(&from, instance) {
                    self.complete(&from, msg);
                }
            }
            RouterCommand::Control { id, control, reply } => {
                let result = match self.slots.get_mut(&id) {
                    Some(slot) => slot.node.control(control, &slot.ctx),
                    None => ControlReply::NotFound,
                };
                let _ = reply.send(result);
            }
            RouterCommand::Install { wires, bus, slots, reply } => {
                self.install(wires, bus, slots);
                let _ = reply.send(());
            }
            RouterCommand::Detach { ids, reply } => {
                let detached = self.detach(&ids);
                let _ = reply.send(detached);
            }
            RouterCommand::Shutdown { reply } => {
                let ids: HashSet<NodeId> = self.slots.keys().cloned().collect();
                let detached = self.detach(&ids);
                self.running = false;
                let _ = reply.send(detached);
            }
        }
    }

    fn is_live(&self, id: &str, instance: u64) -> bool {
        self.slots
            .get(id)
            .is_some_and(|slot| slot.ctx.instance() == instance)
    }

    fn install(&mut self, wires: Arc<WireMap>, bus: Arc<SignalBus>, slots: Vec<NodeSlot>) {
        self.wires = wires;
        self.bus = bus;
        let mut started = Vec::with_capacity(slots.len());
        for slot in slots {
            let id = slot.id().to_string();
            if let Some(previous) = self.slots.insert(id.clone(), slot) {
                warn!(node = %id, "replaced a node that was never detached");
                previous.ctx.cancel();
            }
            started.push(id);
        }
        for id in started {
            let Some(slot) = self.slots.get_mut(&id) else {
                continue;
            };
            slot.node.start(&slot.ctx);
            if let Some(fault) = slot.fault.clone() {
                self.publish_status(&id, &NodeStatus::error(fault));
            }
        }
    }

    fn detach(&mut self, ids: &HashSet<NodeId>) -> Vec<NodeSlot> {
        self.queue.retain(|d| !ids.contains(&d.to));
        let mut detached = Vec::with_capacity(ids.len());
        for id in ids {
            self.errored.remove(id);
            if let Some(slot) = self.slots.remove(id) {
                slot.ctx.cancel();
                detached.push(slot);
            }
        }
        detached
    }

    /// Fans `outputs` out along the wires. Ports go in ascending order and
    /// targets in wire order; every destination but the last use of a message
    /// gets its own clone.
    fn route(&mut self, from: &str, outputs: Outputs) {
        let wires = self.wires.clone();
        let mut plan: Vec<(usize, &String)> = Vec::new();
        let mut messages: Vec<Option<Message>> = Vec::new();
        let mut uses: Vec<usize> = Vec::new();
        for (port, msgs) in outputs.0.into_iter().enumerate() {
            let Some(msgs) = msgs else {
                continue;
            };
            let targets = wires.targets(from, port);
            if targets.is_empty() {
                continue;
            }
            let first = messages.len();
            for msg in msgs {
                messages.push(Some(msg));
                uses.push(targets.len());
            }
            for target in targets {
                for index in first..messages.len() {
                    plan.push((index, target));
                }
            }
        }

        let mut deliveries = Vec::with_capacity(plan.len());
        for (index, target) in plan {
            uses[index] -= 1;
            let msg = if uses[index] == 0 {
                messages[index].take()
            } else {
                messages[index].clone()
            };
            if let Some(msg) = msg {
                deliveries.push(Delivery {
                    to: target.clone(),
                    msg,
                });
            }
        }
        self.queue.extend(deliveries);
    }

    /// Runs one delivery. `on_input` consumes the message, so when a catch or
    /// complete listener covers the target the input is copied up front:
    /// error and completion signals carry the message as it arrived, not as
    /// the node left it. Targets without such a listener are never copied.
    fn deliver(&mut self, delivery: Delivery) {
        let Delivery { to, msg } = delivery;
        let keep_copy = self.bus.resolve(SignalKind::Catch, &to).is_some()
            || self.bus.resolve(SignalKind::Complete, &to).is_some();
        let Some(slot) = self.slots.get_mut(&to) else {
            trace!(node = %to, "dropping delivery to missing node");
            return;
        };
        let copy = keep_copy.then(|| msg.clone());
        match slot.node.on_input(msg, &slot.ctx) {
            Ok(Completion::Done) => self.complete(&to, copy),
            Ok(Completion::Pending) => {}
            Err(err) => self.raise_error(&to, err.to_string(), copy),
        }
    }

    fn complete(&mut self, id: &str, msg: Option<Message>) {
        if self.errored.remove(id) {
            self.publish_status(id, &NodeStatus::clear());
        }
        let Some(msg) = msg else {
            return;
        };
        if let Some(listener) = self.bus.resolve(SignalKind::Complete, id) {
            self.queue.push_back(Delivery {
                to: listener.to_string(),
                msg,
            });
        }
    }

    fn source(&self, id: &str) -> Value {
        match self.slots.get(id) {
            Some(slot) => json!({
                "id": id,
                "type": slot.ctx.node_type(),
                "name": slot.ctx.name(),
            }),
            None => json!({ "id": id }),
        }
    }

    fn raise_error(&mut self, origin: &str, error: String, msg: Option<Message>) {
        self.errored.insert(origin.to_string());
        self.publish_status(origin, &NodeStatus::error(error.clone()));

        let mut msg = msg.unwrap_or_else(|| Message::new(Value::Null));
        let previous = msg.get("error").and_then(|e| e.get("source"));
        let hops = match previous {
            Some(src) if src.get("id").and_then(Value::as_str) == Some(origin) => {
                src.get("count").and_then(Value::as_u64).unwrap_or(1) + 1
            }
            _ => 1,
        };
        if hops > MAX_ERROR_HOPS {
            error!(node = %origin, "error loop detected, dropping: {error}");
            return;
        }
        let mut source = self.source(origin);
        source["count"] = json!(hops);
        msg.set("error", json!({ "message": error, "source": source }));

        match self.bus.resolve(SignalKind::Catch, origin) {
            Some(listener) => {
                let to = listener.to_string();
                self.queue.push_back(Delivery { to, msg });
            }
            None => {
                let source = self.source(origin);
                error!(node = %origin, "uncaught error: {error}");
                self.bridge.emit(
                    "log",
                    json!({
                        "level": "error",
                        "id": origin,
                        "type": source.get("type"),
                        "name": source.get("name"),
                        "msg": error,
                    }),
                );
            }
        }
    }

    fn raise_status(&mut self, origin: &str, status: NodeStatus) {
        self.publish_status(origin, &status);
        if let Some(listener) = self.bus.resolve(SignalKind::Status, origin) {
            let mut body = serde_json::to_value(&status).unwrap_or_else(|_| json!({}));
            body["source"] = self.source(origin);
            let mut msg = Message::new(Value::Null);
            msg.remove("payload");
            msg.set("status", body);
            let to = listener.to_string();
            self.queue.push_back(Delivery { to, msg });
        }
    }

    fn publish_status(&self, id: &str, status: &NodeStatus) {
        self.bridge
            .emit("status", json!({ "id": id, "status": status }));
    }
}
