use std::sync::Arc;
use std::time::Duration;

use serde_json::{Number, Value};
use tracing::debug;

use crate::message::Message;
use crate::node::{Completion, Control, ControlReply, Node, NodeContext, NodeError};
use crate::nodes::{number_property, seconds};
use crate::registry::NodeSetup;

#[derive(Debug, Clone, PartialEq)]
enum PropValue {
    Fixed(Value),
    /// Milliseconds since the epoch, taken when the node fires.
    Timestamp,
}

#[derive(Debug, Clone, PartialEq)]
struct Property {
    name: String,
    value: PropValue,
}

fn typed_value(raw: Option<&Value>, kind: &str) -> Result<PropValue, NodeError> {
    let text = match raw {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    let value = match kind {
        "date" => return Ok(PropValue::Timestamp),
        "str" => Value::String(text),
        "num" => {
            let n: f64 = text
                .trim()
                .parse()
                .map_err(|_| NodeError::InvalidInput(format!("not a number: {text}")))?;
            if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
                Value::from(n as i64)
            } else {
                Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
            }
        }
        "bool" => match text.trim() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            other => return Err(NodeError::InvalidInput(format!("not a boolean: {other}"))),
        },
        "json" => match raw {
            Some(Value::String(s)) => serde_json::from_str(s)
                .map_err(|e| NodeError::InvalidInput(format!("invalid JSON: {e}")))?,
            Some(other) => other.clone(),
            None => Value::Null,
        },
        other => {
            return Err(NodeError::InvalidInput(format!(
                "unsupported value type `{other}`"
            )));
        }
    };
    Ok(PropValue::Fixed(value))
}

/// Emits a message when triggered, once after deploy, or on a repeat interval.
pub struct InjectNode {
    props: Arc<Vec<Property>>,
    once: Option<Duration>,
    repeat: Option<Duration>,
}

impl InjectNode {
    pub fn create(setup: &NodeSetup<'_>) -> Result<Box<dyn Node>, NodeError> {
        let mut props = Vec::new();
        match setup.config("props") {
            Some(Value::Array(list)) => {
                for prop in list {
                    let Some(name) = prop.get("p").and_then(Value::as_str) else {
                        continue;
                    };
                    let (raw, kind) = if name == "payload" && prop.get("v").is_none() {
                        (setup.config("payload"), setup.definition.config_str("payloadType"))
                    } else if name == "topic" && prop.get("v").is_none() {
                        (setup.config("topic"), Some("str"))
                    } else {
                        (prop.get("v"), prop.get("vt").and_then(Value::as_str))
                    };
                    props.push(Property {
                        name: name.to_string(),
                        value: typed_value(raw, kind.unwrap_or("str"))?,
                    });
                }
            }
            _ => {
                let kind = setup.definition.config_str("payloadType").unwrap_or("date");
                props.push(Property {
                    name: "payload".to_string(),
                    value: typed_value(setup.config("payload"), kind)?,
                });
                if let Some(topic) = setup.definition.config_str("topic").filter(|t| !t.is_empty()) {
                    props.push(Property {
                        name: "topic".to_string(),
                        value: PropValue::Fixed(Value::String(topic.to_string())),
                    });
                }
            }
        }

        let once = match setup.config("once").and_then(Value::as_bool) {
            Some(true) => {
                let delay = number_property(setup, "onceDelay")?.unwrap_or(0.1);
                Some(seconds("onceDelay", delay.max(0.0))?)
            }
            _ => None,
        };
        let repeat = match number_property(setup, "repeat")? {
            Some(secs) if secs > 0.0 => Some(seconds("repeat", secs)?),
            _ => None,
        };

        Ok(Box::new(Self {
            props: Arc::new(props),
            once,
            repeat,
        }))
    }
}

fn build(props: &[Property], payload: Option<Value>) -> Message {
    let mut msg = Message::new(Value::Null);
    for prop in props {
        let value = match &prop.value {
            PropValue::Fixed(v) => v.clone(),
            PropValue::Timestamp => Value::from(chrono::Utc::now().timestamp_millis()),
        };
        msg.set(&prop.name, value);
    }
    if let Some(payload) = payload {
        msg.set_payload(payload);
    }
    msg
}

impl Node for InjectNode {
    fn start(&mut self, ctx: &NodeContext) {
        if self.once.is_none() && self.repeat.is_none() {
            return;
        }
        let ctx = ctx.clone();
        let props = self.props.clone();
        let (once, repeat) = (self.once, self.repeat);
        let cancel = ctx.cancellation();
        tokio::spawn(async move {
            if let Some(delay) = once {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => ctx.send(build(&props, None)),
                }
            }
            if let Some(every) = repeat {
                let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => ctx.send(build(&props, None)),
                    }
                }
            }
            debug!(node = %ctx.id(), "inject timer stopped");
        });
    }

    fn on_input(&mut self, _msg: Message, ctx: &NodeContext) -> Result<Completion, NodeError> {
        ctx.send(build(&self.props, None));
        Ok(Completion::Done)
    }

    fn control(&mut self, control: Control, ctx: &NodeContext) -> ControlReply {
        match control {
            Control::Trigger(payload) => {
                ctx.send(build(&self.props, payload));
                ControlReply::Triggered
            }
            Control::SetActive(_) => ControlReply::Unsupported,
        }
    }
}
