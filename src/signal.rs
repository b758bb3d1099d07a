use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Root scope: nodes that live outside every tab and subflow.
pub const ROOT_SCOPE: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Catch,
    Status,
    Complete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Listener {
    pub id: String,
    pub kind: SignalKind,
    pub scope: String,
    /// `None` listens to the whole enclosing scope.
    pub targets: Option<HashSet<String>>,
    pub order: usize,
}

impl Listener {
    fn accepts(&self, origin: &str) -> bool {
        self.id != origin
            && self
                .targets
                .as_ref()
                .is_none_or(|targets| targets.contains(origin))
    }
}

/// Routes error, status and completion signals to the nearest listener,
/// walking from the origin's scope out to the root.
#[derive(Debug, Default)]
pub struct SignalBus {
    parents: HashMap<String, String>,
    node_scope: HashMap<String, String>,
    listeners: HashMap<(SignalKind, String), Vec<Listener>>,
    listener_ids: HashSet<(SignalKind, String)>,
}

impl SignalBus {
    pub fn new(
        parents: HashMap<String, String>,
        node_scope: HashMap<String, String>,
        listeners: Vec<Listener>,
    ) -> Self {
        let mut grouped: HashMap<(SignalKind, String), Vec<Listener>> = HashMap::new();
        let mut listener_ids = HashSet::new();
        for listener in listeners {
            listener_ids.insert((listener.kind, listener.id.clone()));
            grouped
                .entry((listener.kind, listener.scope.clone()))
                .or_default()
                .push(listener);
        }
        // Explicit target lists outrank catch-alls in the same scope.
        for list in grouped.values_mut() {
            list.sort_by_key(|l| (l.targets.is_none(), l.order));
        }
        Self {
            parents,
            node_scope,
            listeners: grouped,
            listener_ids,
        }
    }

    pub fn scope_of(&self, node: &str) -> &str {
        self.node_scope
            .get(node)
            .map(String::as_str)
            .unwrap_or(ROOT_SCOPE)
    }

    pub fn has_listeners(&self, kind: SignalKind) -> bool {
        self.listener_ids.iter().any(|(k, _)| *k == kind)
    }

    /// The single listener that should receive a signal of `kind` raised by
    /// `origin`, if any.
    pub fn resolve(&self, kind: SignalKind, origin: &str) -> Option<&str> {
        if self.listener_ids.contains(&(kind, origin.to_string())) {
            return None;
        }
        let mut scope = self.scope_of(origin).to_string();
        let mut seen = HashSet::new();
        loop {
            if let Some(list) = self.listeners.get(&(kind, scope.clone())) {
                if let Some(hit) = list.iter().find(|l| l.accepts(origin)) {
                    return Some(&hit.id);
                }
            }
            if scope == ROOT_SCOPE || !seen.insert(scope.clone()) {
                return None;
            }
            scope = self
                .parents
                .get(&scope)
                .cloned()
                .unwrap_or_else(|| ROOT_SCOPE.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listener(id: &str, kind: SignalKind, scope: &str, targets: Option<&[&str]>, order: usize) -> Listener {
        Listener {
            id: id.into(),
            kind,
            scope: scope.into(),
            targets: targets.map(|t| t.iter().map(|s| s.to_string()).collect()),
            order,
        }
    }

    fn bus(listeners: Vec<Listener>) -> SignalBus {
        let parents = HashMap::from([
            ("tab1".to_string(), ROOT_SCOPE.to_string()),
            ("sub".to_string(), "tab1".to_string()),
        ]);
        let node_scope = HashMap::from([
            ("a".to_string(), "sub".to_string()),
            ("b".to_string(), "tab1".to_string()),
            ("c".to_string(), ROOT_SCOPE.to_string()),
        ]);
        SignalBus::new(parents, node_scope, listeners)
    }

    #[test]
    fn test_innermost_scope_wins() {
        let bus = bus(vec![
            listener("root_catch", SignalKind::Catch, ROOT_SCOPE, None, 0),
            listener("sub_catch", SignalKind::Catch, "sub", None, 1),
        ]);
        assert_eq!(bus.resolve(SignalKind::Catch, "a"), Some("sub_catch"));
        assert_eq!(bus.resolve(SignalKind::Catch, "b"), Some("root_catch"));
        assert_eq!(bus.resolve(SignalKind::Status, "a"), None);
    }

    #[test]
    fn test_explicit_targets_rank_before_catch_all() {
        let bus = bus(vec![
            listener("all", SignalKind::Catch, "tab1", None, 0),
            listener("only_b", SignalKind::Catch, "tab1", Some(&["b"]), 1),
            listener("only_x", SignalKind::Catch, "tab1", Some(&["x"]), 2),
        ]);
        assert_eq!(bus.resolve(SignalKind::Catch, "b"), Some("only_b"));
        assert_eq!(bus.resolve(SignalKind::Catch, "a"), Some("all"));
    }

    #[test]
    fn test_listener_does_not_observe_its_own_kind() {
        let bus = bus(vec![
            listener("st1", SignalKind::Status, "tab1", None, 0),
            listener("st2", SignalKind::Status, ROOT_SCOPE, None, 1),
        ]);
        assert_eq!(bus.resolve(SignalKind::Status, "st1"), None);
        assert_eq!(bus.resolve(SignalKind::Status, "b"), Some("st1"));
    }

    #[test]
    fn test_unmatched_signal_resolves_to_none() {
        let bus = bus(vec![listener("only_x", SignalKind::Catch, ROOT_SCOPE, Some(&["x"]), 0)]);
        assert_eq!(bus.resolve(SignalKind::Catch, "c"), None);
        assert!(bus.has_listeners(SignalKind::Catch));
        assert!(!bus.has_listeners(SignalKind::Complete));
    }
}
