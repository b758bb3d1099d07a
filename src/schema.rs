use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use schemars::schema_for;
use serde_json::Value;

use crate::flow::document::FlowDocument;
use crate::node::NodeStatus;

/// JSON schema of the deployable flow document.
pub fn flow_schema() -> Value {
    serde_json::to_value(schema_for!(FlowDocument)).unwrap_or(Value::Null)
}

pub fn status_schema() -> Value {
    serde_json::to_value(schema_for!(NodeStatus)).unwrap_or(Value::Null)
}

/// Writes every schema into `out_dir`, returning the files written.
pub fn write_schema(out_dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(out_dir)?;
    let mut written = Vec::new();
    for (name, schema) in [("flow", flow_schema()), ("status", status_schema())] {
        let path = out_dir.join(format!("{name}.schema.json"));
        fs::write(&path, serde_json::to_string_pretty(&schema)?)?;
        written.push(path);
    }
    Ok(written)
}
