pub mod compiler;
pub mod diff;
pub mod document;
pub mod manager;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::store::StoreError;

/// How much of the running generation a deploy replaces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    #[default]
    Full,
    /// Rebuild changed nodes and everything wired to them.
    Nodes,
    /// Rebuild every scope that contains a changed node.
    Flows,
}

impl FromStr for DeployMode {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "full" => Ok(DeployMode::Full),
            "nodes" => Ok(DeployMode::Nodes),
            "flows" => Ok(DeployMode::Flows),
            other => Err(DeployError::InvalidDeploymentType(other.to_string())),
        }
    }
}

impl fmt::Display for DeployMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployMode::Full => write!(f, "full"),
            DeployMode::Nodes => write!(f, "nodes"),
            DeployMode::Flows => write!(f, "flows"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("invalid flow document: {0}")]
    Malformed(String),
    #[error("unknown deployment type `{0}`")]
    InvalidDeploymentType(String),
    #[error("flow storage failed: {0}")]
    Store(#[from] StoreError),
    #[error("engine is shutting down")]
    ShuttingDown,
}

impl DeployError {
    pub fn code(&self) -> &'static str {
        match self {
            DeployError::Malformed(_) => "invalid_flows",
            DeployError::InvalidDeploymentType(_) => "invalid_deployment_type",
            DeployError::Store(_) => "storage_failed",
            DeployError::ShuttingDown => "shutting_down",
        }
    }

    /// Structured form returned to deploy callers.
    pub fn to_json(&self) -> Value {
        json!({ "error": self.code(), "message": self.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_mode_parsing() {
        assert_eq!("full".parse::<DeployMode>().unwrap(), DeployMode::Full);
        assert_eq!("".parse::<DeployMode>().unwrap(), DeployMode::Full);
        assert_eq!("Nodes".parse::<DeployMode>().unwrap(), DeployMode::Nodes);
        assert_eq!("flows".parse::<DeployMode>().unwrap(), DeployMode::Flows);
        let err = "partial".parse::<DeployMode>().unwrap_err();
        assert_eq!(err.code(), "invalid_deployment_type");
    }

    #[test]
    fn test_error_json_shape() {
        let err = DeployError::Malformed("expected an array".into());
        let value = err.to_json();
        assert_eq!(value["error"], "invalid_flows");
        assert_eq!(value["message"], "invalid flow document: expected an array");
    }
}
