//! Engine handlers on the event bridge. Each one answers a request event
//! with exactly one `reply`.

use std::future::Future;
use std::sync::{Arc, Weak};

use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::bridge::Event;
use crate::engine::EngineContext;
use crate::flow::DeployMode;
use crate::flow::manager::FlowManager;
use crate::node::{Control, ControlReply};

pub const LOAD_FLOWS: &str = "rpc_loadFlows";
pub const SAVE_FLOWS: &str = "rpc_saveFlows";
pub const GET_NODE_LIST: &str = "rpc_getNodeList";
pub const GET_FLOWS: &str = "rpc_getFlows";
pub const INJECT: &str = "rpc_inject";
pub const INJECT_TEXT: &str = "rpc_inject_text";

/// Subscribes all engine handlers. The manager is held weakly so the bridge
/// never keeps a stopped engine alive.
pub fn register(engine: &EngineContext, manager: &Arc<FlowManager>) {
    let bridge = &engine.bridge;

    bridge.on(LOAD_FLOWS, handler(manager, |manager, _params| async move {
        match manager.load().await {
            Ok(report) => report.to_json(),
            Err(err) => err.to_json(),
        }
    }));

    bridge.on(SAVE_FLOWS, handler(manager, |manager, params| async move {
        let (body, mode) = match params {
            Value::Object(mut map) => {
                let mode = map
                    .remove("deploymentType")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                (map.remove("flows").unwrap_or(Value::Null), mode)
            }
            other => (other, String::new()),
        };
        let mode = match mode.parse::<DeployMode>() {
            Ok(mode) => mode,
            Err(err) => return err.to_json(),
        };
        match manager.set_flows(body, mode).await {
            Ok(report) => report.to_json(),
            Err(err) => err.to_json(),
        }
    }));

    let registry = engine.registry.clone();
    bridge.on(GET_NODE_LIST, move |event: Event| {
        let list = serde_json::to_value(registry.list()).unwrap_or(Value::Null);
        event.reply(list);
    });

    bridge.on(GET_FLOWS, handler(manager, |manager, _params| async move {
        serde_json::to_value(manager.flows().await).unwrap_or(Value::Null)
    }));

    bridge.on(INJECT, handler(manager, |manager, params| async move {
        let Some(id) = node_id(&params) else {
            return json!(ControlReply::NotFound.code());
        };
        let payload = params.get("payload").cloned();
        json!(manager.control(&id, Control::Trigger(payload)).await.code())
    }));

    bridge.on(INJECT_TEXT, handler(manager, |manager, params| async move {
        let Some(id) = node_id(&params) else {
            return json!(ControlReply::NotFound.code());
        };
        let text = params
            .get("text")
            .or_else(|| params.get("payload"))
            .and_then(Value::as_str)
            .map(|t| Value::String(t.to_string()));
        json!(manager.control(&id, Control::Trigger(text)).await.code())
    }));

    for node_type in engine.registry.toggleable() {
        bridge.on(&format!("rpc_{node_type}"), handler(manager, |manager, params| async move {
            let Some(id) = node_id(&params) else {
                return json!(ControlReply::NotFound.code());
            };
            let active = match params.get("state").and_then(Value::as_str) {
                Some("enable") => true,
                Some("disable") => false,
                other => {
                    debug!(node = %id, state = ?other, "unknown toggle state");
                    return json!(ControlReply::NotFound.code());
                }
            };
            json!(manager.control(&id, Control::SetActive(active)).await.code())
        }));
    }
}

fn node_id(params: &Value) -> Option<String> {
    params.get("id").and_then(Value::as_str).map(str::to_string)
}

/// Adapts an async handler to the bridge: the work runs on its own task and
/// its result becomes the reply. Events sent without a reply slot are ignored.
fn handler<F, Fut>(manager: &Arc<FlowManager>, f: F) -> impl Fn(Event) + Send + Sync + 'static
where
    F: Fn(Arc<FlowManager>, Value) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Value> + Send + 'static,
{
    let manager: Weak<FlowManager> = Arc::downgrade(manager);
    move |event: Event| {
        if !event.is_request() {
            return;
        }
        let Some(manager) = manager.upgrade() else {
            warn!(event = event.name(), "engine is gone; request dropped");
            return;
        };
        let f = f.clone();
        tokio::spawn(async move {
            let value = f(manager, event.params().clone()).await;
            event.reply(value);
        });
    }
}
