//! Node types shipped with the engine.

pub mod delay;
pub mod function;
pub mod inject;
pub mod output;
pub mod passthrough;

use std::time::Duration;

use serde_json::Value;

use crate::node::NodeError;
use crate::registry::{NodeRegistry, NodeSetup, NodeTypeSpec};
use crate::signal::SignalKind;

/// Channels that output-style nodes publish on, one node type each.
pub const BROADCAST_TYPES: [&str; 5] = ["debug", "notification", "espeak", "vibrate", "oscillator"];

pub fn register_builtins(registry: &mut NodeRegistry) {
    registry.register(NodeTypeSpec::new("inject", 0, 1, inject::InjectNode::create));
    registry.register(NodeTypeSpec::new("delay", 1, 1, delay::DelayNode::create));
    registry.register(
        NodeTypeSpec::new("function", 1, 1, function::FunctionNode::create).dynamic_outputs(),
    );
    for name in BROADCAST_TYPES {
        registry.register(NodeTypeSpec::new(name, 1, 0, output::BroadcastNode::create).toggleable());
    }
    for (name, kind) in [
        ("catch", SignalKind::Catch),
        ("status", SignalKind::Status),
        ("complete", SignalKind::Complete),
    ] {
        registry.register(
            NodeTypeSpec::new(name, 0, 1, |_: &NodeSetup<'_>| {
                Ok(Box::new(passthrough::Passthrough) as Box<dyn crate::node::Node>)
            })
            .signal(kind),
        );
    }
}

/// Longest timer a node may configure, about 136 years.
const MAX_SECONDS: f64 = u32::MAX as f64;

/// Reads a duration property that may be a number or a numeric string.
/// Infinite and NaN values are rejected.
pub(crate) fn number_property(setup: &NodeSetup<'_>, key: &str) -> Result<Option<f64>, NodeError> {
    let value = match setup.config(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::String(s)) if s.trim().is_empty() => return Ok(None),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => Some(
            s.trim()
                .parse::<f64>()
                .map_err(|_| NodeError::InvalidInput(format!("`{key}` is not a number: {s}")))?,
        ),
        Some(other) => {
            return Err(NodeError::InvalidInput(format!("`{key}` is not a number: {other}")));
        }
    };
    match value {
        Some(v) if !v.is_finite() => Err(NodeError::InvalidInput(format!("`{key}` must be finite"))),
        other => Ok(other),
    }
}

/// Converts configured seconds into a timer duration.
pub(crate) fn seconds(key: &str, secs: f64) -> Result<Duration, NodeError> {
    if secs > MAX_SECONDS {
        return Err(NodeError::InvalidInput(format!("`{key}` is too large: {secs}")));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|err| NodeError::InvalidInput(format!("`{key}` is not a valid duration: {err}")))
}
