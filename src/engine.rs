use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bridge::EventBridge;
use crate::config::Settings;
use crate::flow::DeployError;
use crate::flow::manager::{DeployReport, FlowManager};
use crate::registry::NodeRegistry;
use crate::router::RouterHandle;
use crate::rpc;
use crate::state::{InMemoryState, StateStore};
use crate::store::FlowStore;

/// Everything a component may need, passed explicitly at construction.
#[derive(Clone, Debug)]
pub struct EngineContext {
    pub settings: Arc<Settings>,
    pub bridge: Arc<EventBridge>,
    pub states: Arc<dyn StateStore>,
    pub registry: Arc<NodeRegistry>,
}

impl EngineContext {
    pub fn new(settings: Settings, registry: NodeRegistry) -> Self {
        Self {
            settings: Arc::new(settings),
            bridge: Arc::new(EventBridge::new()),
            states: InMemoryState::new(),
            registry: Arc::new(registry),
        }
    }

    pub fn with_states(mut self, states: Arc<dyn StateStore>) -> Self {
        self.states = states;
        self
    }
}

/// A running engine: router task, lifecycle manager and RPC handlers.
pub struct Engine {
    context: EngineContext,
    manager: Arc<FlowManager>,
    router_task: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(context: EngineContext, store: Arc<dyn FlowStore>) -> Self {
        let (router, router_task) = RouterHandle::spawn(context.bridge.clone());
        let manager = Arc::new(FlowManager::new(context.clone(), store, router));
        rpc::register(&context, &manager);
        Self {
            context,
            manager,
            router_task: Mutex::new(Some(router_task)),
        }
    }

    /// Initialises the store and deploys whatever it holds.
    pub async fn start(&self) -> Result<DeployReport, DeployError> {
        self.manager.store().init(&self.context.settings).await?;
        let report = self.manager.load().await?;
        info!(
            generation = report.generation,
            nodes = report.started,
            "engine started"
        );
        Ok(report)
    }

    pub fn manager(&self) -> &Arc<FlowManager> {
        &self.manager
    }

    pub fn bridge(&self) -> &Arc<EventBridge> {
        &self.context.bridge
    }

    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    /// Stops every node, drops all bridge subscribers and waits for the router.
    pub async fn shutdown(&self) {
        self.manager.stop().await;
        self.context.bridge.clear();
        if let Some(task) = self.router_task.lock().await.take() {
            if let Err(err) = task.await {
                warn!("router task ended abnormally: {err}");
            }
        }
        info!("engine stopped");
    }
}
