use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use petgraph::algo::tarjan_scc;
use petgraph::graphmap::DiGraphMap;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::engine::EngineContext;
use crate::flow::DeployError;
use crate::flow::document::{FlowDocument, NodeDefinition};
use crate::node::{Node, NodeContext};
use crate::nodes::passthrough::Passthrough;
use crate::registry::{NodeRegistry, NodeSetup, NodeTypeSpec};
use crate::router::{NodeSlot, RouterHandle};
use crate::signal::{Listener, ROOT_SCOPE, SignalBus};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Non-fatal problems found while compiling. None of them abort a deploy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileWarning {
    #[error("entry {index} skipped: {reason}")]
    MalformedEntry { index: usize, reason: String },
    #[error("duplicate node id `{0}` skipped")]
    DuplicateId(String),
    #[error("node `{id}` has unknown type `{node_type}`; running as passthrough")]
    UnknownType { id: String, node_type: String },
    #[error("node `{id}` ({node_type}) failed to initialise: {reason}; running as passthrough")]
    FactoryFailed {
        id: String,
        node_type: String,
        reason: String,
    },
    #[error("wire {from}[{port}] -> `{target}` does not resolve; dropped")]
    UnresolvedWire {
        from: String,
        port: usize,
        target: String,
    },
    #[error("node `{from}` wires port {port} but only has {outputs} outputs; dropped")]
    PortOutOfRange {
        from: String,
        port: usize,
        outputs: usize,
    },
    #[error("wire {from} -> `{target}` targets a node without inputs; dropped")]
    NoInputs { from: String, target: String },
    #[error("node `{id}` names unknown flow `{z}`; placed in the root scope")]
    UnknownScope { id: String, z: String },
}

/// Resolved `(source, port) -> [target...]` mapping of one generation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct WireMap(BTreeMap<String, Vec<Vec<String>>>);

impl WireMap {
    pub fn ports(&self, from: &str) -> &[Vec<String>] {
        self.0.get(from).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn targets(&self, from: &str, port: usize) -> &[String] {
        self.ports(from)
            .get(port)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn edges(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().flat_map(|(from, ports)| {
            ports
                .iter()
                .flatten()
                .map(move |to| (from.as_str(), to.as_str()))
        })
    }

    pub fn graph(&self) -> DiGraphMap<&str, ()> {
        let mut graph = DiGraphMap::new();
        for id in self.ids() {
            graph.add_node(id);
        }
        for (from, to) in self.edges() {
            graph.add_edge(from, to, ());
        }
        graph
    }

    /// Writes the resolved wires back over `base`.
    pub fn to_document(&self, base: &FlowDocument) -> FlowDocument {
        FlowDocument(
            base.iter()
                .map(|def| {
                    let mut def = def.clone();
                    if let Some(ports) = self.0.get(&def.id) {
                        def.wires = Some(ports.clone());
                    }
                    def
                })
                .collect(),
        )
    }
}

impl FromIterator<(String, Vec<Vec<String>>)> for WireMap {
    fn from_iter<I: IntoIterator<Item = (String, Vec<Vec<String>>)>>(iter: I) -> Self {
        WireMap(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone)]
pub struct CompiledNode {
    pub definition: NodeDefinition,
    /// `None` for unknown types, which run as a passthrough stub.
    pub spec: Option<Arc<NodeTypeSpec>>,
    pub scope: String,
    pub inputs: usize,
    pub outputs: usize,
}

impl CompiledNode {
    pub fn id(&self) -> &str {
        &self.definition.id
    }
}

/// A validated generation plan: resolved nodes, wires and scopes. Instances
/// are created from it by [`Blueprint::instantiate`].
#[derive(Debug, Default)]
pub struct Blueprint {
    nodes: Vec<CompiledNode>,
    index: HashMap<String, usize>,
    wires: Arc<WireMap>,
    bus: Arc<SignalBus>,
    cycles: Vec<Vec<String>>,
    warnings: Vec<CompileWarning>,
}

impl Blueprint {
    pub fn nodes(&self) -> &[CompiledNode] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&CompiledNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn wires(&self) -> &Arc<WireMap> {
        &self.wires
    }

    pub fn bus(&self) -> &Arc<SignalBus> {
        &self.bus
    }

    /// Strongly connected components (and self loops). Informational only.
    pub fn cycles(&self) -> &[Vec<String>] {
        &self.cycles
    }

    pub fn warnings(&self) -> &[CompileWarning] {
        &self.warnings
    }

    /// Creates fresh instances for the nodes in `only` (all nodes when `None`).
    /// A failing or panicking factory degrades to a passthrough with a warning.
    pub fn instantiate(
        &self,
        engine: &EngineContext,
        router: &RouterHandle,
        only: Option<&HashSet<String>>,
    ) -> (Vec<NodeSlot>, Vec<CompileWarning>) {
        let mut slots = Vec::new();
        let mut warnings = Vec::new();
        for compiled in &self.nodes {
            let def = &compiled.definition;
            if only.is_some_and(|only| !only.contains(&def.id)) {
                continue;
            }
            let ctx = NodeContext::new(
                &def.id,
                &def.node_type,
                def.name.clone(),
                &compiled.scope,
                NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed),
                router.sender(),
                engine.bridge.clone(),
            );
            let setup = NodeSetup {
                definition: def,
                engine,
            };
            let (node, fault): (Box<dyn Node>, Option<String>) = match &compiled.spec {
                Some(spec) => match build(spec, &setup) {
                    Ok(node) => (node, None),
                    Err(reason) => {
                        warn!(node = %def.id, node_type = %def.node_type, "factory failed: {reason}");
                        warnings.push(CompileWarning::FactoryFailed {
                            id: def.id.clone(),
                            node_type: def.node_type.clone(),
                            reason: reason.clone(),
                        });
                        (Box::new(Passthrough), Some(reason))
                    }
                },
                None => (
                    Box::new(Passthrough),
                    Some(format!("unknown type {}", def.node_type)),
                ),
            };
            slots.push(NodeSlot { ctx, node, fault });
        }
        (slots, warnings)
    }
}

/// Runs a node factory, turning an error or a panic into a reason string.
fn build(spec: &NodeTypeSpec, setup: &NodeSetup<'_>) -> Result<Box<dyn Node>, String> {
    match panic::catch_unwind(AssertUnwindSafe(|| (spec.factory)(setup))) {
        Ok(Ok(node)) => Ok(node),
        Ok(Err(err)) => Err(err.to_string()),
        Err(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(format!("factory panicked: {detail}"))
        }
    }
}

fn is_container(def: &NodeDefinition) -> bool {
    matches!(def.node_type.as_str(), "tab" | "subflow")
}

/// Definitions that are editor-only and never run.
fn is_inert(def: &NodeDefinition) -> bool {
    is_container(def) || def.node_type == "group" || def.node_type == "comment"
}

fn scope_disabled(
    scope: &str,
    containers: &HashMap<&str, &NodeDefinition>,
    parents: &HashMap<String, String>,
) -> bool {
    let mut current = scope;
    let mut seen = HashSet::new();
    while current != ROOT_SCOPE && seen.insert(current) {
        if let Some(container) = containers.get(current) {
            if container.config.get("disabled").and_then(Value::as_bool) == Some(true) {
                return true;
            }
        }
        current = parents.get(current).map(String::as_str).unwrap_or(ROOT_SCOPE);
    }
    false
}

/// Parses a raw deploy body and compiles it.
pub fn compile_value(value: Value, registry: &NodeRegistry) -> Result<Blueprint, DeployError> {
    let (doc, mut warnings) = FlowDocument::parse(value)?;
    let mut blueprint = compile(&doc, registry);
    warnings.append(&mut blueprint.warnings);
    blueprint.warnings = warnings;
    Ok(blueprint)
}

/// Resolves types, wires and scopes of a parsed document. Per-node problems
/// degrade to warnings.
pub fn compile(doc: &FlowDocument, registry: &NodeRegistry) -> Blueprint {
    let mut warnings = Vec::new();

    let containers: HashMap<&str, &NodeDefinition> = doc
        .iter()
        .filter(|d| is_container(d))
        .map(|d| (d.id.as_str(), d))
        .collect();
    let parents: HashMap<String, String> = containers
        .values()
        .map(|c| {
            let parent = match c.z.as_deref() {
                Some(z) if z != c.id && containers.contains_key(z) => z.to_string(),
                _ => ROOT_SCOPE.to_string(),
            };
            (c.id.clone(), parent)
        })
        .collect();

    let mut nodes = Vec::new();
    let mut index = HashMap::new();
    let mut skipped = HashSet::new();
    for def in doc.iter() {
        if is_inert(def) {
            continue;
        }
        let scope = match def.z.as_deref() {
            Some(z) if containers.contains_key(z) => z.to_string(),
            Some(z) if !z.is_empty() => {
                warnings.push(CompileWarning::UnknownScope {
                    id: def.id.clone(),
                    z: z.to_string(),
                });
                ROOT_SCOPE.to_string()
            }
            _ => ROOT_SCOPE.to_string(),
        };
        if def.is_disabled() || scope_disabled(&scope, &containers, &parents) {
            debug!(node = %def.id, "skipping disabled node");
            skipped.insert(def.id.as_str());
            continue;
        }
        let spec = registry.get(&def.node_type);
        let (inputs, outputs) = match &spec {
            Some(spec) => (spec.inputs, spec.outputs_for(def)),
            None => {
                warnings.push(CompileWarning::UnknownType {
                    id: def.id.clone(),
                    node_type: def.node_type.clone(),
                });
                (1, def.wires().len())
            }
        };
        index.insert(def.id.clone(), nodes.len());
        nodes.push(CompiledNode {
            definition: def.clone(),
            spec,
            scope,
            inputs,
            outputs,
        });
    }

    let mut wires = BTreeMap::new();
    for node in &nodes {
        let mut ports = Vec::new();
        for (port, targets) in node.definition.wires().iter().enumerate() {
            if port >= node.outputs {
                if !targets.is_empty() {
                    warnings.push(CompileWarning::PortOutOfRange {
                        from: node.id().to_string(),
                        port,
                        outputs: node.outputs,
                    });
                }
                continue;
            }
            let mut kept = Vec::with_capacity(targets.len());
            for target in targets {
                match index.get(target) {
                    Some(&i) if nodes[i].inputs == 0 => warnings.push(CompileWarning::NoInputs {
                        from: node.id().to_string(),
                        target: target.clone(),
                    }),
                    Some(_) => kept.push(target.clone()),
                    None if skipped.contains(target.as_str()) => {}
                    None => warnings.push(CompileWarning::UnresolvedWire {
                        from: node.id().to_string(),
                        port,
                        target: target.clone(),
                    }),
                }
            }
            ports.push(kept);
        }
        wires.insert(node.id().to_string(), ports);
    }
    let wires = WireMap(wires);

    let cycles = find_cycles(&wires);

    let listeners = nodes
        .iter()
        .enumerate()
        .filter_map(|(order, node)| {
            let kind = node.spec.as_ref()?.signal?;
            let targets = match node.definition.config.get("scope") {
                Some(Value::Array(ids)) => Some(
                    ids.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect(),
                ),
                _ => None,
            };
            Some(Listener {
                id: node.id().to_string(),
                kind,
                scope: node.scope.clone(),
                targets,
                order,
            })
        })
        .collect();
    let node_scope = nodes
        .iter()
        .map(|n| (n.id().to_string(), n.scope.clone()))
        .collect();
    let bus = SignalBus::new(parents, node_scope, listeners);

    for warning in &warnings {
        warn!("{warning}");
    }

    Blueprint {
        nodes,
        index,
        wires: Arc::new(wires),
        bus: Arc::new(bus),
        cycles,
        warnings,
    }
}

fn find_cycles(wires: &WireMap) -> Vec<Vec<String>> {
    let graph = wires.graph();
    let mut cycles: Vec<Vec<String>> = tarjan_scc(&graph)
        .into_iter()
        .filter(|component| {
            component.len() > 1 || graph.contains_edge(component[0], component[0])
        })
        .map(|component| {
            let mut ids: Vec<String> = component.into_iter().map(str::to_string).collect();
            ids.sort();
            ids
        })
        .collect();
    cycles.sort();
    cycles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalKind;
    use serde_json::json;

    fn compile_json(value: Value) -> Blueprint {
        compile_value(value, &NodeRegistry::with_builtins()).unwrap()
    }

    #[test]
    fn test_unknown_type_degrades_to_stub() {
        let bp = compile_json(json!([
            {"id": "a", "type": "inject", "wires": [["b"]]},
            {"id": "b", "type": "no-such-type", "wires": [["c"]]},
            {"id": "c", "type": "debug"}
        ]));
        assert!(bp.node("b").unwrap().spec.is_none());
        assert_eq!(bp.wires().targets("b", 0), ["c".to_string()]);
        assert!(matches!(bp.warnings()[0], CompileWarning::UnknownType { .. }));
    }

    #[test]
    fn test_bad_wires_are_dropped_with_warnings() {
        let bp = compile_json(json!([
            {"id": "a", "type": "inject", "wires": [["missing", "b", "i2"], ["b"]]},
            {"id": "b", "type": "debug"},
            {"id": "i2", "type": "inject"}
        ]));
        assert_eq!(bp.wires().ports("a"), [vec!["b".to_string()]]);
        assert_eq!(bp.warnings().len(), 3);
        assert!(bp.warnings().iter().any(|w| matches!(w, CompileWarning::NoInputs { target, .. } if target == "i2")));
        assert!(bp.warnings().iter().any(|w| matches!(w, CompileWarning::PortOutOfRange { port: 1, .. })));
    }

    #[test]
    fn test_disabled_nodes_and_flows_are_skipped_silently() {
        let bp = compile_json(json!([
            {"id": "t1", "type": "tab"},
            {"id": "t2", "type": "tab", "disabled": true},
            {"id": "a", "type": "inject", "z": "t1", "wires": [["b", "c"]]},
            {"id": "b", "type": "debug", "z": "t1", "d": true},
            {"id": "c", "type": "debug", "z": "t2"}
        ]));
        assert!(bp.node("b").is_none());
        assert!(bp.node("c").is_none());
        assert!(bp.wires().targets("a", 0).is_empty());
        assert!(bp.warnings().is_empty());
    }

    #[test]
    fn test_cycles_are_reported_not_rejected() {
        let bp = compile_json(json!([
            {"id": "f1", "type": "function", "wires": [["f2"]]},
            {"id": "f2", "type": "function", "wires": [["f1"]]},
            {"id": "f3", "type": "function", "wires": [["f3"]]}
        ]));
        assert_eq!(
            bp.cycles(),
            [vec!["f1".to_string(), "f2".to_string()], vec!["f3".to_string()]]
        );
        assert_eq!(bp.nodes().len(), 3);
    }

    #[test]
    fn test_nested_scopes_feed_the_signal_bus() {
        let bp = compile_json(json!([
            {"id": "tab", "type": "tab"},
            {"id": "sf", "type": "subflow", "z": "tab"},
            {"id": "inner", "type": "function", "z": "sf"},
            {"id": "sf_catch", "type": "catch", "z": "sf"},
            {"id": "root_catch", "type": "catch"},
            {"id": "outer", "type": "function", "z": "tab"},
            {"id": "stray", "type": "function", "z": "nowhere"}
        ]));
        let bus = bp.bus();
        assert_eq!(bus.resolve(SignalKind::Catch, "inner"), Some("sf_catch"));
        assert_eq!(bus.resolve(SignalKind::Catch, "outer"), Some("root_catch"));
        assert_eq!(bus.scope_of("stray"), ROOT_SCOPE);
        assert!(bp.warnings().iter().any(|w| matches!(w, CompileWarning::UnknownScope { .. })));
    }

    #[test]
    fn test_wire_map_round_trip() {
        let (doc, _) = FlowDocument::parse(json!([
            {"id": "a", "type": "inject", "wires": [["b", "ghost"]]},
            {"id": "b", "type": "function", "outputs": 2, "wires": [["c"], ["d", "c"]]},
            {"id": "c", "type": "debug"},
            {"id": "d", "type": "delay", "wires": [["b"]]}
        ]))
        .unwrap();
        let registry = NodeRegistry::with_builtins();
        let first = compile(&doc, &registry);
        let rewritten = first.wires().to_document(&doc);
        let second = compile(&rewritten, &registry);
        assert_eq!(first.wires(), second.wires());
        assert!(second.warnings().is_empty());
    }
}
