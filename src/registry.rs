use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::engine::EngineContext;
use crate::flow::document::NodeDefinition;
use crate::node::{Node, NodeError};
use crate::nodes;
use crate::signal::SignalKind;

/// What a factory gets to build one instance.
pub struct NodeSetup<'a> {
    pub definition: &'a NodeDefinition,
    pub engine: &'a EngineContext,
}

impl NodeSetup<'_> {
    pub fn config(&self, key: &str) -> Option<&Value> {
        self.definition.config.get(key)
    }
}

pub type NodeFactory =
    Arc<dyn Fn(&NodeSetup<'_>) -> Result<Box<dyn Node>, NodeError> + Send + Sync>;

/// Capability descriptor of one node type.
#[derive(Clone)]
pub struct NodeTypeSpec {
    pub name: String,
    pub inputs: usize,
    pub outputs: usize,
    /// Output count comes from the numeric `outputs` property of each definition.
    pub dynamic_outputs: bool,
    pub signal: Option<SignalKind>,
    /// Accepts `rpc_<type>` enable/disable requests.
    pub toggleable: bool,
    pub factory: NodeFactory,
}

impl NodeTypeSpec {
    pub fn new<F>(name: &str, inputs: usize, outputs: usize, factory: F) -> Self
    where
        F: Fn(&NodeSetup<'_>) -> Result<Box<dyn Node>, NodeError> + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            inputs,
            outputs,
            dynamic_outputs: false,
            signal: None,
            toggleable: false,
            factory: Arc::new(factory),
        }
    }

    pub fn dynamic_outputs(mut self) -> Self {
        self.dynamic_outputs = true;
        self
    }

    pub fn signal(mut self, kind: SignalKind) -> Self {
        self.signal = Some(kind);
        self
    }

    pub fn toggleable(mut self) -> Self {
        self.toggleable = true;
        self
    }

    /// Output port count for one definition of this type.
    pub fn outputs_for(&self, definition: &NodeDefinition) -> usize {
        if self.dynamic_outputs {
            if let Some(n) = definition.config.get("outputs").and_then(Value::as_u64) {
                return n as usize;
            }
        }
        self.outputs
    }

    pub fn info(&self) -> NodeTypeInfo {
        NodeTypeInfo {
            name: self.name.clone(),
            inputs: self.inputs,
            outputs: self.outputs,
            toggleable: self.toggleable,
            signal: self.signal,
        }
    }
}

impl fmt::Debug for NodeTypeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeTypeSpec")
            .field("name", &self.name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("signal", &self.signal)
            .finish()
    }
}

/// Public view of a registered type, served by `rpc_getNodeList` and `GET /nodes`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeTypeInfo {
    pub name: String,
    pub inputs: usize,
    pub outputs: usize,
    pub toggleable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<SignalKind>,
}

#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    types: BTreeMap<String, Arc<NodeTypeSpec>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every node type shipped with the engine.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        nodes::register_builtins(&mut registry);
        registry
    }

    /// Adds or replaces a type.
    pub fn register(&mut self, spec: NodeTypeSpec) {
        self.types.insert(spec.name.clone(), Arc::new(spec));
    }

    pub fn get(&self, name: &str) -> Option<Arc<NodeTypeSpec>> {
        self.types.get(name).cloned()
    }

    pub fn list(&self) -> Vec<NodeTypeInfo> {
        self.types.values().map(|spec| spec.info()).collect()
    }

    pub fn toggleable(&self) -> impl Iterator<Item = &str> {
        self.types
            .values()
            .filter(|spec| spec.toggleable)
            .map(|spec| spec.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition(value: Value) -> NodeDefinition {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_builtins_are_registered() {
        let registry = NodeRegistry::with_builtins();
        for name in ["inject", "function", "delay", "debug", "catch", "status", "complete"] {
            assert!(registry.get(name).is_some(), "missing {name}");
        }
        assert_eq!(registry.get("catch").unwrap().signal, Some(SignalKind::Catch));
        let toggles: Vec<&str> = registry.toggleable().collect();
        assert!(toggles.contains(&"debug"));
        assert!(toggles.contains(&"notification"));
    }

    #[test]
    fn test_dynamic_outputs_follow_definition() {
        let registry = NodeRegistry::with_builtins();
        let spec = registry.get("function").unwrap();
        let def = definition(json!({"id": "f", "type": "function", "outputs": 3}));
        assert_eq!(spec.outputs_for(&def), 3);
        let def = definition(json!({"id": "f", "type": "function"}));
        assert_eq!(spec.outputs_for(&def), 1);
    }
}
