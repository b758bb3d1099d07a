use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::engine::EngineContext;
use crate::flow::compiler::{Blueprint, CompileWarning, compile};
use crate::flow::diff::{self, RebuildPlan};
use crate::flow::document::FlowDocument;
use crate::flow::{DeployError, DeployMode};
use crate::logger::instrument_deploy;
use crate::node::{Control, ControlReply};
use crate::registry::NodeRegistry;
use crate::router::{NodeSlot, RouterHandle};
use crate::state::StateScope;
use crate::store::FlowStore;

/// Lifecycle of one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationState {
    Compiling,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for GenerationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GenerationState::Compiling => "compiling",
            GenerationState::Starting => "starting",
            GenerationState::Running => "running",
            GenerationState::Stopping => "stopping",
            GenerationState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Outcome of a successful deploy.
#[derive(Debug, Clone)]
pub struct DeployReport {
    pub generation: u64,
    pub mode: DeployMode,
    pub started: usize,
    pub stopped: usize,
    pub warnings: Vec<CompileWarning>,
    pub cycles: Vec<Vec<String>>,
}

impl DeployReport {
    pub fn to_json(&self) -> Value {
        json!({
            "generation": self.generation,
            "mode": self.mode,
            "started": self.started,
            "stopped": self.stopped,
            "warnings": self.warnings.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "cycles": self.cycles,
        })
    }
}

struct Current {
    generation: u64,
    blueprint: Arc<Blueprint>,
    /// Deployed document, credentials included.
    document: FlowDocument,
}

/// Owns the running generation and replaces it on deploy.
pub struct FlowManager {
    engine: EngineContext,
    store: Arc<dyn FlowStore>,
    router: RouterHandle,
    current: Mutex<Current>,
    state: watch::Sender<(u64, GenerationState)>,
    stopped: AtomicBool,
}

impl FlowManager {
    pub fn new(engine: EngineContext, store: Arc<dyn FlowStore>, router: RouterHandle) -> Self {
        let (state, _) = watch::channel((0, GenerationState::Stopped));
        Self {
            engine,
            store,
            router,
            current: Mutex::new(Current {
                generation: 0,
                blueprint: Arc::default(),
                document: FlowDocument::default(),
            }),
            state,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn store(&self) -> &Arc<dyn FlowStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.engine.registry
    }

    /// Generation number and state, as last announced.
    pub fn state(&self) -> (u64, GenerationState) {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<(u64, GenerationState)> {
        self.state.subscribe()
    }

    /// Deployed document without credentials.
    pub async fn flows(&self) -> FlowDocument {
        self.current.lock().await.document.without_credentials()
    }

    pub async fn blueprint(&self) -> Arc<Blueprint> {
        self.current.lock().await.blueprint.clone()
    }

    /// Loads the stored document and credentials and deploys them in full.
    pub async fn load(&self) -> Result<DeployReport, DeployError> {
        let mut doc = self.store.get_flows().await?;
        let credentials = self.store.get_credentials().await?;
        doc.merge_credentials(&credentials);
        info!(nodes = doc.len(), "loaded flows from store");
        self.deploy(doc, DeployMode::Full).await
    }

    /// Parses a deploy body, persists it (credentials split out) and deploys it.
    pub async fn set_flows(&self, body: Value, mode: DeployMode) -> Result<DeployReport, DeployError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(DeployError::ShuttingDown);
        }
        let (mut doc, parse_warnings) = FlowDocument::parse(body)?;

        let submitted = doc.split_credentials();
        let ids: HashSet<&str> = doc.iter().map(|d| d.id.as_str()).collect();
        let mut credentials: Map<String, Value> = self
            .store
            .get_credentials()
            .await?
            .into_iter()
            .filter(|(id, _)| ids.contains(id.as_str()))
            .collect();
        credentials.extend(submitted);

        self.store.save_flows(&doc, mode).await?;
        self.store.save_credentials(&credentials).await?;
        doc.merge_credentials(&credentials);

        let mut report = self.deploy(doc, mode).await?;
        let mut warnings = parse_warnings;
        warnings.append(&mut report.warnings);
        report.warnings = warnings;
        Ok(report)
    }

    /// Replaces the running generation with `doc`.
    #[tracing::instrument(skip_all, fields(mode = %mode, nodes = doc.len()))]
    pub async fn deploy(&self, doc: FlowDocument, mode: DeployMode) -> Result<DeployReport, DeployError> {
        instrument_deploy(&format!("deploy:{mode}"), self.replace(doc, mode)).await
    }

    async fn replace(&self, doc: FlowDocument, mode: DeployMode) -> Result<DeployReport, DeployError> {
        let mut current = self.current.lock().await;
        if self.stopped.load(Ordering::SeqCst) {
            return Err(DeployError::ShuttingDown);
        }
        let old_generation = current.generation;
        let generation = old_generation + 1;

        self.announce(generation, GenerationState::Compiling);
        let blueprint = compile(&doc, &self.engine.registry);
        let plan = diff::plan(&current.blueprint, &blueprint, mode);
        debug!(stop = plan.stop.len(), start = plan.start.len(), "rebuild plan");

        if old_generation > 0 {
            self.announce(old_generation, GenerationState::Stopping);
        }
        let stopped = self.stop_nodes(&plan).await;
        self.forget_removed(&current.blueprint, &blueprint).await;
        if old_generation > 0 {
            self.announce(old_generation, GenerationState::Stopped);
        }

        self.announce(generation, GenerationState::Starting);
        let (slots, mut factory_warnings) =
            blueprint.instantiate(&self.engine, &self.router, Some(&plan.start));
        let started = slots.len();
        if !self
            .router
            .install(blueprint.wires().clone(), blueprint.bus().clone(), slots)
            .await
        {
            self.stopped.store(true, Ordering::SeqCst);
            return Err(DeployError::ShuttingDown);
        }
        self.announce(generation, GenerationState::Running);

        let mut warnings = blueprint.warnings().to_vec();
        warnings.append(&mut factory_warnings);
        let cycles = blueprint.cycles().to_vec();
        if !cycles.is_empty() {
            info!(count = cycles.len(), "flow graph contains cycles");
        }

        current.generation = generation;
        current.blueprint = Arc::new(blueprint);
        current.document = doc;

        Ok(DeployReport {
            generation,
            mode,
            started,
            stopped,
            warnings,
            cycles,
        })
    }

    /// Sends a control command to one live node.
    pub async fn control(&self, id: &str, control: Control) -> ControlReply {
        self.router.control(id, control).await
    }

    /// Closes every node and stops the router. Later deploys fail.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let current = self.current.lock().await;
        self.announce(current.generation, GenerationState::Stopping);
        let slots = self.router.shutdown().await;
        let closed = self.close_all(slots).await;
        self.announce(current.generation, GenerationState::Stopped);
        info!(closed, "all flows stopped");
    }

    async fn stop_nodes(&self, plan: &RebuildPlan) -> usize {
        if plan.stop.is_empty() {
            return 0;
        }
        let slots = self.router.detach(plan.stop.clone()).await;
        self.close_all(slots).await
    }

    /// Closes detached nodes concurrently, each bounded by the close timeout.
    /// A close that overruns is abandoned.
    async fn close_all(&self, slots: Vec<NodeSlot>) -> usize {
        let limit = self.engine.settings.close_timeout;
        let count = slots.len();
        let closes = slots.into_iter().map(|mut slot| async move {
            let finished = tokio::time::timeout(limit, slot.node.close()).await.is_ok();
            if !finished {
                warn!(node = %slot.id(), "close did not finish within {limit:?}; skipped");
            }
        });
        join_all(closes).await;
        count
    }

    async fn forget_removed(&self, old: &Blueprint, new: &Blueprint) {
        for node in old.nodes() {
            if new.node(node.id()).is_none() {
                self.engine
                    .states
                    .clear(&StateScope::Node(node.id().to_string()))
                    .await;
            }
        }
    }

    fn announce(&self, generation: u64, state: GenerationState) {
        info!(generation, %state, "generation state");
        self.state.send_replace((generation, state));
        self.engine
            .bridge
            .emit("runtime-state", json!({ "generation": generation, "state": state }));
    }
}
