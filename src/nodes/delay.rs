use std::time::Duration;

use crate::message::Message;
use crate::node::{Completion, Node, NodeContext, NodeError};
use crate::nodes::{number_property, seconds};
use crate::registry::NodeSetup;

/// Holds each message for a fixed time before passing it on. Pending
/// messages are dropped when the node closes.
pub struct DelayNode {
    delay: Duration,
}

impl DelayNode {
    pub fn create(setup: &NodeSetup<'_>) -> Result<Box<dyn Node>, NodeError> {
        let amount = number_property(setup, "timeout")?.unwrap_or(5.0);
        let unit = match setup.definition.config_str("timeoutUnits").unwrap_or("seconds") {
            "milliseconds" => 0.001,
            "seconds" => 1.0,
            "minutes" => 60.0,
            "hours" => 3600.0,
            "days" => 86400.0,
            other => {
                return Err(NodeError::InvalidInput(format!("unknown time unit `{other}`")));
            }
        };
        if amount < 0.0 {
            return Err(NodeError::InvalidInput("delay must not be negative".into()));
        }
        Ok(Box::new(Self {
            delay: seconds("timeout", amount * unit)?,
        }))
    }
}

impl Node for DelayNode {
    fn on_input(&mut self, msg: Message, ctx: &NodeContext) -> Result<Completion, NodeError> {
        let ctx = ctx.clone();
        let cancel = ctx.cancellation();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    ctx.send(msg.clone());
                    ctx.done(Some(msg));
                }
            }
        });
        Ok(Completion::Pending)
    }
}
