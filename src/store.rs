use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::Settings;
use crate::flow::DeployMode;
use crate::flow::document::FlowDocument;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path} does not hold a flow document: {message}")]
    Invalid { path: PathBuf, message: String },
    #[error("invalid YAML in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml_bw::Error,
    },
}

/// Persistence for the deployed flow document and its credentials.
#[async_trait]
pub trait FlowStore: Send + Sync {
    async fn init(&self, _settings: &Settings) -> Result<(), StoreError> {
        Ok(())
    }
    async fn get_flows(&self) -> Result<FlowDocument, StoreError>;
    async fn save_flows(&self, doc: &FlowDocument, mode: DeployMode) -> Result<(), StoreError>;
    async fn get_credentials(&self) -> Result<Map<String, Value>, StoreError>;
    async fn save_credentials(&self, credentials: &Map<String, Value>) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Json,
    Yaml,
}

impl Format {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Format::Yaml,
            _ => Format::Json,
        }
    }
}

/// Keeps flows in one file and credentials beside it in `<stem>_cred.<ext>`.
/// The extension picks JSON or YAML.
#[derive(Debug, Clone)]
pub struct FileFlowStore {
    flows: PathBuf,
    credentials: PathBuf,
    format: Format,
}

impl FileFlowStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let flows = path.into();
        let format = Format::for_path(&flows);
        let stem = flows
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("flows");
        let ext = flows
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("json");
        let credentials = flows.with_file_name(format!("{stem}_cred.{ext}"));
        Self {
            flows,
            credentials,
            format,
        }
    }

    pub fn path(&self) -> &Path {
        &self.flows
    }

    pub fn credentials_path(&self) -> &Path {
        &self.credentials
    }

    async fn read(&self, path: &Path) -> Result<Option<Value>, StoreError> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        let value = match self.format {
            Format::Json => serde_json::from_slice(&bytes).map_err(|source| StoreError::Json {
                path: path.to_path_buf(),
                source,
            })?,
            Format::Yaml => {
                let text = String::from_utf8_lossy(&bytes);
                serde_yaml_bw::from_str(&text).map_err(|source| StoreError::Yaml {
                    path: path.to_path_buf(),
                    source,
                })?
            }
        };
        Ok(Some(value))
    }

    async fn write<T: serde::Serialize + Sync>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        let bytes = match self.format {
            Format::Json => serde_json::to_vec_pretty(value).map_err(|source| StoreError::Json {
                path: path.to_path_buf(),
                source,
            })?,
            Format::Yaml => serde_yaml_bw::to_string(value)
                .map_err(|source| StoreError::Yaml {
                    path: path.to_path_buf(),
                    source,
                })?
                .into_bytes(),
        };
        let io = |source: std::io::Error| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io)?;
        }
        // Write then rename so a crash never leaves a half written file.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(io)?;
        tokio::fs::rename(&tmp, path).await.map_err(io)?;
        Ok(())
    }
}

#[async_trait]
impl FlowStore for FileFlowStore {
    async fn init(&self, _settings: &Settings) -> Result<(), StoreError> {
        info!("flow store at {}", self.flows.display());
        Ok(())
    }

    async fn get_flows(&self) -> Result<FlowDocument, StoreError> {
        let Some(value) = self.read(&self.flows).await? else {
            debug!("no flows at {}, starting empty", self.flows.display());
            return Ok(FlowDocument::default());
        };
        FlowDocument::parse(value)
            .map(|(doc, _)| doc)
            .map_err(|e| StoreError::Invalid {
                path: self.flows.clone(),
                message: e.to_string(),
            })
    }

    async fn save_flows(&self, doc: &FlowDocument, mode: DeployMode) -> Result<(), StoreError> {
        debug!(%mode, nodes = doc.len(), "saving flows");
        self.write(&self.flows, doc).await
    }

    async fn get_credentials(&self) -> Result<Map<String, Value>, StoreError> {
        match self.read(&self.credentials).await? {
            Some(Value::Object(map)) => Ok(map),
            _ => Ok(Map::new()),
        }
    }

    async fn save_credentials(&self, credentials: &Map<String, Value>) -> Result<(), StoreError> {
        self.write(&self.credentials, credentials).await
    }
}

/// Volatile store for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemoryFlowStore {
    flows: RwLock<FlowDocument>,
    credentials: RwLock<Map<String, Value>>,
}

impl MemoryFlowStore {
    pub fn new(doc: FlowDocument) -> Self {
        Self {
            flows: RwLock::new(doc),
            credentials: RwLock::default(),
        }
    }
}

#[async_trait]
impl FlowStore for MemoryFlowStore {
    async fn get_flows(&self) -> Result<FlowDocument, StoreError> {
        Ok(self.flows.read().await.clone())
    }

    async fn save_flows(&self, doc: &FlowDocument, _mode: DeployMode) -> Result<(), StoreError> {
        *self.flows.write().await = doc.clone();
        Ok(())
    }

    async fn get_credentials(&self) -> Result<Map<String, Value>, StoreError> {
        Ok(self.credentials.read().await.clone())
    }

    async fn save_credentials(&self, credentials: &Map<String, Value>) -> Result<(), StoreError> {
        *self.credentials.write().await = credentials.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn doc() -> FlowDocument {
        FlowDocument::parse(json!([
            {"id": "a", "type": "inject", "wires": [["b"]], "repeat": "1"},
            {"id": "b", "type": "debug"}
        ]))
        .unwrap()
        .0
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = FileFlowStore::new(dir.path().join("flows.json"));
        assert!(store.get_flows().await.unwrap().is_empty());
        assert!(store.get_credentials().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_json_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileFlowStore::new(dir.path().join("flows.json"));
        store.save_flows(&doc(), DeployMode::Full).await.unwrap();
        assert_eq!(store.get_flows().await.unwrap(), doc());
        assert!(!dir.path().join("flows.tmp").exists());
    }

    #[tokio::test]
    async fn test_yaml_round_trip_and_credentials_file() {
        let dir = TempDir::new().unwrap();
        let store = FileFlowStore::new(dir.path().join("nested/flows.yaml"));
        store.save_flows(&doc(), DeployMode::Nodes).await.unwrap();
        assert_eq!(store.get_flows().await.unwrap(), doc());

        let mut creds = Map::new();
        creds.insert("a".into(), json!({"token": "s3cret"}));
        store.save_credentials(&creds).await.unwrap();
        assert_eq!(
            store.credentials_path(),
            dir.path().join("nested/flows_cred.yaml")
        );
        assert_eq!(store.get_credentials().await.unwrap(), creds);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flows.json");
        std::fs::write(&path, "{nope").unwrap();
        let store = FileFlowStore::new(path);
        assert!(matches!(
            store.get_flows().await,
            Err(StoreError::Json { .. })
        ));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryFlowStore::default();
        store.save_flows(&doc(), DeployMode::Full).await.unwrap();
        assert_eq!(store.get_flows().await.unwrap().len(), 2);
    }
}
