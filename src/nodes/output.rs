use serde_json::{Value, json};

use crate::message::Message;
use crate::node::{Completion, Control, ControlReply, Node, NodeContext, NodeError};
use crate::registry::NodeSetup;

/// Publishes every message on the bridge channel named after its node type,
/// so a host can show, speak or play it. Can be switched off at runtime.
pub struct BroadcastNode {
    channel: String,
    active: bool,
}

impl BroadcastNode {
    pub fn create(setup: &NodeSetup<'_>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(Self {
            channel: setup.definition.node_type.clone(),
            active: setup
                .config("active")
                .and_then(Value::as_bool)
                .unwrap_or(true),
        }))
    }
}

impl Node for BroadcastNode {
    fn on_input(&mut self, msg: Message, ctx: &NodeContext) -> Result<Completion, NodeError> {
        if self.active {
            ctx.broadcast(
                &self.channel,
                json!({
                    "id": ctx.id(),
                    "name": ctx.name(),
                    "topic": msg.topic(),
                    "msg": msg,
                }),
            );
        }
        Ok(Completion::Done)
    }

    fn control(&mut self, control: Control, _ctx: &NodeContext) -> ControlReply {
        match control {
            Control::SetActive(true) => {
                self.active = true;
                ControlReply::Enabled
            }
            Control::SetActive(false) => {
                self.active = false;
                ControlReply::Disabled
            }
            Control::Trigger(_) => ControlReply::Unsupported,
        }
    }
}
