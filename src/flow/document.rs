use std::collections::HashSet;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::flow::DeployError;
use crate::flow::compiler::CompileWarning;

/// One node (or tab/subflow container) in the flow document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NodeDefinition {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Id of the enclosing tab or subflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<String>,
    /// `wires[port]` lists downstream node ids in delivery order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wires: Option<Vec<Vec<String>>>,
    /// Type specific properties.
    #[serde(flatten)]
    pub config: Map<String, Value>,
}

impl NodeDefinition {
    pub fn wires(&self) -> &[Vec<String>] {
        self.wires.as_deref().unwrap_or_default()
    }

    /// `d: true` in the document.
    pub fn is_disabled(&self) -> bool {
        self.config.get("d").and_then(Value::as_bool).unwrap_or(false)
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }
}

/// The wire-level flow document: an ordered array of definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct FlowDocument(pub Vec<NodeDefinition>);

impl FlowDocument {
    /// Parses a deploy body leniently. Only a body that is not an array (or
    /// an object with a `flows` array) is rejected; bad entries are skipped
    /// with a warning.
    pub fn parse(value: Value) -> Result<(Self, Vec<CompileWarning>), DeployError> {
        let entries = match value {
            Value::Array(entries) => entries,
            Value::Object(mut wrapper) => match wrapper.remove("flows") {
                Some(Value::Array(entries)) => entries,
                _ => {
                    return Err(DeployError::Malformed(
                        "expected an array of nodes".to_string(),
                    ));
                }
            },
            _ => {
                return Err(DeployError::Malformed(
                    "expected an array of nodes".to_string(),
                ));
            }
        };

        let mut warnings = Vec::new();
        let mut seen = HashSet::new();
        let mut definitions = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            match serde_json::from_value::<NodeDefinition>(entry) {
                Ok(def) if def.id.is_empty() => warnings.push(CompileWarning::MalformedEntry {
                    index,
                    reason: "empty id".to_string(),
                }),
                Ok(def) => {
                    if seen.insert(def.id.clone()) {
                        definitions.push(def);
                    } else {
                        warnings.push(CompileWarning::DuplicateId(def.id));
                    }
                }
                Err(err) => warnings.push(CompileWarning::MalformedEntry {
                    index,
                    reason: err.to_string(),
                }),
            }
        }
        Ok((FlowDocument(definitions), warnings))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<(Self, Vec<CompileWarning>), DeployError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| DeployError::Malformed(e.to_string()))?;
        Self::parse(value)
    }

    pub fn get(&self, id: &str) -> Option<&NodeDefinition> {
        self.0.iter().find(|d| d.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeDefinition> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Removes every `credentials` property, returning them keyed by node id.
    pub fn split_credentials(&mut self) -> Map<String, Value> {
        let mut credentials = Map::new();
        for def in &mut self.0 {
            if let Some(creds) = def.config.remove("credentials") {
                if !creds.is_null() {
                    credentials.insert(def.id.clone(), creds);
                }
            }
        }
        credentials
    }

    pub fn merge_credentials(&mut self, credentials: &Map<String, Value>) {
        for def in &mut self.0 {
            if let Some(creds) = credentials.get(&def.id) {
                def.config.insert("credentials".to_string(), creds.clone());
            }
        }
    }

    /// Copy with credentials removed, safe to hand to callers.
    pub fn without_credentials(&self) -> Self {
        let mut copy = self.clone();
        copy.split_credentials();
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_rejects_non_array() {
        assert!(FlowDocument::parse(json!({"id": "x"})).is_err());
        assert!(FlowDocument::parse(json!("nope")).is_err());
        assert!(FlowDocument::from_slice(b"{not json").is_err());
    }

    #[test]
    fn test_parse_accepts_wrapped_flows() {
        let (doc, warnings) =
            FlowDocument::parse(json!({"rev": "1", "flows": [{"id": "a", "type": "debug"}]})).unwrap();
        assert_eq!(doc.len(), 1);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_bad_entries_become_warnings() {
        let (doc, warnings) = FlowDocument::parse(json!([
            {"id": "a", "type": "inject", "wires": [["b"]]},
            {"type": "missing-id"},
            42,
            {"id": "a", "type": "debug"},
            {"id": "b", "type": "debug"}
        ]))
        .unwrap();
        assert_eq!(doc.len(), 2);
        assert_eq!(warnings.len(), 3);
        assert!(matches!(warnings[2], CompileWarning::DuplicateId(ref id) if id == "a"));
    }

    #[test]
    fn test_round_trip_preserves_config_and_absent_fields() {
        let original = json!([
            {"id": "t1", "type": "tab", "label": "Flow 1"},
            {"id": "n1", "type": "inject", "z": "t1", "name": "", "wires": [["n2"]], "repeat": "", "payload": "1"}
        ]);
        let (doc, _) = FlowDocument::parse(original.clone()).unwrap();
        assert_eq!(serde_json::to_value(&doc).unwrap(), original);
    }

    #[test]
    fn test_credentials_split_and_merge() {
        let (mut doc, _) = FlowDocument::parse(json!([
            {"id": "a", "type": "mqtt", "credentials": {"user": "u", "password": "p"}},
            {"id": "b", "type": "debug"}
        ]))
        .unwrap();
        let creds = doc.split_credentials();
        assert_eq!(creds.len(), 1);
        assert!(doc.get("a").unwrap().config.get("credentials").is_none());

        doc.merge_credentials(&creds);
        assert_eq!(doc.get("a").unwrap().config["credentials"]["user"], "u");
        assert!(doc.without_credentials().get("a").unwrap().config.get("credentials").is_none());
    }
}
