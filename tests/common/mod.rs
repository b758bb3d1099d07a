#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use wireflow::config::Settings;
use wireflow::engine::{Engine, EngineContext};
use wireflow::flow::document::FlowDocument;
use wireflow::message::Message;
use wireflow::node::{Completion, Control, ControlReply, Node, NodeContext, NodeError};
use wireflow::registry::{NodeRegistry, NodeTypeSpec};
use wireflow::store::{FlowStore, MemoryFlowStore};

/// Key of the shared handle attached by [`Source`].
pub const HANDLE: &str = "res";

/// Messages seen by probe nodes, tagged with the probe id.
pub type Seen = Arc<Mutex<Vec<(String, Message)>>>;

/// Records every input and forwards it.
struct Probe {
    seen: Seen,
}

impl Node for Probe {
    fn on_input(&mut self, msg: Message, ctx: &NodeContext) -> Result<Completion, NodeError> {
        self.seen.lock().unwrap().push((ctx.id().to_string(), msg.clone()));
        ctx.send(msg);
        Ok(Completion::Done)
    }
}

/// Overwrites `payload.x` on its own copy, then records it.
struct Mutator {
    seen: Seen,
}

impl Node for Mutator {
    fn on_input(&mut self, mut msg: Message, ctx: &NodeContext) -> Result<Completion, NodeError> {
        if let Some(payload) = msg.get_mut("payload") {
            payload["x"] = json!(99);
        }
        self.seen.lock().unwrap().push((ctx.id().to_string(), msg));
        Ok(Completion::Done)
    }
}

/// Emits `{x: 1}` carrying a shared handle when triggered.
struct Source;

impl Node for Source {
    fn on_input(&mut self, msg: Message, ctx: &NodeContext) -> Result<Completion, NodeError> {
        ctx.send(msg);
        Ok(Completion::Done)
    }

    fn control(&mut self, control: Control, ctx: &NodeContext) -> ControlReply {
        match control {
            Control::Trigger(payload) => {
                let mut msg = Message::new(payload.unwrap_or_else(|| json!({"x": 1})));
                msg.set_handle(HANDLE, Arc::new(AtomicUsize::new(0)));
                ctx.send(msg);
                ControlReply::Triggered
            }
            Control::SetActive(_) => ControlReply::Unsupported,
        }
    }
}

/// Always fails.
struct Failing;

impl Node for Failing {
    fn on_input(&mut self, _msg: Message, _ctx: &NodeContext) -> Result<Completion, NodeError> {
        Err(NodeError::ExecutionFailed("deliberate failure".into()))
    }
}

/// Forwards until the shared counter reaches its limit.
struct Bounce {
    hits: Arc<AtomicUsize>,
    limit: usize,
}

impl Node for Bounce {
    fn on_input(&mut self, msg: Message, ctx: &NodeContext) -> Result<Completion, NodeError> {
        let n = self.hits.fetch_add(1, Ordering::SeqCst) + 1;
        if n < self.limit {
            ctx.send(msg);
        }
        Ok(Completion::Done)
    }
}

/// Spoils its input, then fails.
struct Spoiler;

impl Node for Spoiler {
    fn on_input(&mut self, mut msg: Message, _ctx: &NodeContext) -> Result<Completion, NodeError> {
        msg.set_payload(json!("spoiled"));
        Err(NodeError::ExecutionFailed("spoiled it".into()))
    }
}

/// Never finishes closing.
struct Stuck;

#[async_trait]
impl Node for Stuck {
    fn on_input(&mut self, msg: Message, ctx: &NodeContext) -> Result<Completion, NodeError> {
        ctx.send(msg);
        Ok(Completion::Done)
    }

    async fn close(&mut self) {
        std::future::pending::<()>().await;
    }
}

/// Lifecycle bookkeeping of [`Counted`] nodes.
#[derive(Default)]
pub struct Lifecycle {
    pub created: Mutex<Vec<(String, usize)>>,
    pub closed: Mutex<Vec<(String, usize)>>,
    serial: AtomicUsize,
}

impl Lifecycle {
    pub fn created(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn closed(&self) -> usize {
        self.closed.lock().unwrap().len()
    }

    pub fn created_for(&self, id: &str) -> usize {
        self.created.lock().unwrap().iter().filter(|(n, _)| n == id).count()
    }
}

struct Counted {
    id: String,
    serial: usize,
    life: Arc<Lifecycle>,
}

#[async_trait]
impl Node for Counted {
    fn on_input(&mut self, msg: Message, ctx: &NodeContext) -> Result<Completion, NodeError> {
        ctx.send(msg);
        Ok(Completion::Done)
    }

    async fn close(&mut self) {
        self.life
            .closed
            .lock()
            .unwrap()
            .push((self.id.clone(), self.serial));
    }
}

/// Shared observation points of a test engine.
#[derive(Clone, Default)]
pub struct Harness {
    pub seen: Seen,
    pub bounces: Arc<AtomicUsize>,
    pub life: Arc<Lifecycle>,
}

impl Harness {
    /// Built-in types plus the test types `probe`, `mutator`, `source`,
    /// `failing`, `spoiler`, `bounce` (limit 10 000), `counted`, `stuck`,
    /// and the factories that always fail: `broken` (error) and `panicky`.
    pub fn registry(&self) -> NodeRegistry {
        let mut registry = NodeRegistry::with_builtins();

        let seen = self.seen.clone();
        registry.register(NodeTypeSpec::new("probe", 1, 1, move |_| {
            Ok(Box::new(Probe { seen: seen.clone() }) as Box<dyn Node>)
        }));
        let seen = self.seen.clone();
        registry.register(NodeTypeSpec::new("mutator", 1, 0, move |_| {
            Ok(Box::new(Mutator { seen: seen.clone() }) as Box<dyn Node>)
        }));
        registry.register(NodeTypeSpec::new("source", 0, 1, |_| {
            Ok(Box::new(Source) as Box<dyn Node>)
        }));
        registry.register(NodeTypeSpec::new("failing", 1, 1, |_| {
            Ok(Box::new(Failing) as Box<dyn Node>)
        }));
        registry.register(NodeTypeSpec::new("spoiler", 1, 1, |_| {
            Ok(Box::new(Spoiler) as Box<dyn Node>)
        }));
        registry.register(NodeTypeSpec::new("stuck", 1, 1, |_| {
            Ok(Box::new(Stuck) as Box<dyn Node>)
        }));
        registry.register(NodeTypeSpec::new("broken", 1, 1, |_| {
            Err(NodeError::InvalidInput("broken config".into()))
        }));
        registry.register(NodeTypeSpec::new("panicky", 1, 1, |_| -> Result<Box<dyn Node>, NodeError> {
            panic!("factory blew up")
        }));
        let hits = self.bounces.clone();
        registry.register(NodeTypeSpec::new("bounce", 1, 1, move |_| {
            Ok(Box::new(Bounce {
                hits: hits.clone(),
                limit: 10_000,
            }) as Box<dyn Node>)
        }));
        let life = self.life.clone();
        registry.register(NodeTypeSpec::new("counted", 1, 1, move |setup| {
            let serial = life.serial.fetch_add(1, Ordering::SeqCst);
            let id = setup.definition.id.clone();
            life.created.lock().unwrap().push((id.clone(), serial));
            Ok(Box::new(Counted {
                id,
                serial,
                life: life.clone(),
            }) as Box<dyn Node>)
        }));
        registry
    }

    pub fn engine(&self, settings: Settings) -> Engine {
        self.engine_with_store(settings, Arc::new(MemoryFlowStore::default()))
    }

    pub fn engine_with_store(&self, settings: Settings, store: Arc<dyn FlowStore>) -> Engine {
        Engine::new(EngineContext::new(settings, self.registry()), store)
    }

    pub fn seen_by(&self, id: &str) -> Vec<Message> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == id)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

pub fn doc(value: Value) -> FlowDocument {
    FlowDocument::parse(value).unwrap().0
}

/// Polls `cond` until it holds or `within` elapses.
pub async fn wait_for(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
