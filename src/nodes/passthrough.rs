use crate::message::Message;
use crate::node::{Completion, Node, NodeContext, NodeError};

/// Forwards every message unchanged on port 0. Stands in for unknown or
/// broken node types and backs the catch/status/complete observers.
pub struct Passthrough;

impl Node for Passthrough {
    fn on_input(&mut self, msg: Message, ctx: &NodeContext) -> Result<Completion, NodeError> {
        ctx.send(msg);
        Ok(Completion::Done)
    }
}
