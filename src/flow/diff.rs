use std::collections::HashSet;

use petgraph::Direction;
use petgraph::visit::Bfs;

use crate::flow::DeployMode;
use crate::flow::compiler::Blueprint;

/// Which live instances a deploy stops and which definitions it starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildPlan {
    pub stop: HashSet<String>,
    pub start: HashSet<String>,
}

impl RebuildPlan {
    pub fn is_empty(&self) -> bool {
        self.stop.is_empty() && self.start.is_empty()
    }
}

/// Ids whose definition or scope differs between the two generations,
/// including added and removed nodes.
pub fn changed_nodes(old: &Blueprint, new: &Blueprint) -> HashSet<String> {
    let mut changed = HashSet::new();
    for node in old.nodes() {
        match new.node(node.id()) {
            Some(next) if next.definition == node.definition && next.scope == node.scope => {}
            _ => {
                changed.insert(node.id().to_string());
            }
        }
    }
    for node in new.nodes() {
        if old.node(node.id()).is_none() {
            changed.insert(node.id().to_string());
        }
    }
    changed
}

/// Computes the rebuild set. `Full` replaces everything. The incremental
/// modes rebuild the changed nodes, everything downstream of them and their
/// direct upstream neighbours, looking at both the old and the new wiring.
pub fn plan(old: &Blueprint, new: &Blueprint, mode: DeployMode) -> RebuildPlan {
    let old_ids: HashSet<String> = old.nodes().iter().map(|n| n.id().to_string()).collect();
    let new_ids: HashSet<String> = new.nodes().iter().map(|n| n.id().to_string()).collect();

    if mode == DeployMode::Full {
        return RebuildPlan {
            stop: old_ids,
            start: new_ids,
        };
    }

    let mut seeds = changed_nodes(old, new);
    if mode == DeployMode::Flows {
        let scopes: HashSet<String> = seeds
            .iter()
            .flat_map(|id| [old.node(id), new.node(id)])
            .flatten()
            .map(|n| n.scope.clone())
            .collect();
        for node in old.nodes().iter().chain(new.nodes()) {
            if scopes.contains(&node.scope) {
                seeds.insert(node.id().to_string());
            }
        }
    }

    let mut rebuild = seeds.clone();
    for blueprint in [old, new] {
        let graph = blueprint.wires().graph();
        for seed in &seeds {
            if !graph.contains_node(seed.as_str()) {
                continue;
            }
            let mut bfs = Bfs::new(&graph, seed.as_str());
            while let Some(id) = bfs.next(&graph) {
                rebuild.insert(id.to_string());
            }
            for upstream in graph.neighbors_directed(seed.as_str(), Direction::Incoming) {
                rebuild.insert(upstream.to_string());
            }
        }
    }

    RebuildPlan {
        stop: rebuild.intersection(&old_ids).cloned().collect(),
        start: rebuild.intersection(&new_ids).cloned().collect(),
    }
}
