//! State-database contract.
//!
//! The bridge writes its observable points into an external state database.
//! That database is an opaque collaborator: all the bridge needs is
//! create-if-absent, acknowledged/unacknowledged value writes, existence
//! checks and tree deletion, captured by the [`StateStore`] trait.
//!
//! [`MemoryStore`] is the in-process implementation backing tests and
//! standalone runs.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Store error types.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backend rejected or failed the operation.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A value could not be serialized for the backend.
    #[error("store serialization error: {0}")]
    Serialization(String),
}

/// Declared type of an observable point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointType {
    Boolean,
    Number,
    Text,
    /// A grouping node with no value of its own (device / channel).
    Channel,
}

impl PointType {
    /// Infer the declared type for a telemetry value. Objects and arrays are
    /// materialized as JSON text.
    pub fn infer(value: &Value) -> Self {
        match value {
            Value::Bool(_) => Self::Boolean,
            Value::Number(_) => Self::Number,
            _ => Self::Text,
        }
    }
}

/// Contract the bridge requires from the state database.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create the point if it does not exist yet. Idempotent.
    async fn upsert_point(&self, path: &str, declared_type: PointType, name: &str) -> Result<()>;

    /// Write a value unconditionally.
    async fn write_value(&self, path: &str, value: Value, acknowledged: bool) -> Result<()>;

    /// Write a value only if it differs from the stored one (or the stored
    /// acknowledgement flag differs).
    async fn write_value_if_changed(
        &self,
        path: &str,
        value: Value,
        acknowledged: bool,
    ) -> Result<()>;

    /// Whether a point exists at `path`.
    async fn object_exists(&self, path: &str) -> Result<bool>;

    /// Remove the point at `path` and everything below it.
    async fn delete_tree(&self, path: &str) -> Result<()>;

    /// Top-level path segments currently present in the store.
    async fn roots(&self) -> Result<Vec<String>>;
}

/// One stored point with its last written value.
#[derive(Debug, Clone)]
pub struct PointEntry {
    pub declared_type: PointType,
    pub name: String,
    pub value: Option<Value>,
    pub acknowledged: bool,
    /// Number of value writes that actually hit this point.
    pub writes: u64,
}

/// In-memory [`StateStore`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    points: RwLock<HashMap<String, PointEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a single point, for assertions.
    pub async fn point(&self, path: &str) -> Option<PointEntry> {
        self.points.read().await.get(path).cloned()
    }

    /// Last written value of a point.
    pub async fn value(&self, path: &str) -> Option<Value> {
        self.points
            .read()
            .await
            .get(path)
            .and_then(|p| p.value.clone())
    }

    /// All paths under a prefix, sorted.
    pub async fn paths_under(&self, prefix: &str) -> Vec<String> {
        let mut paths: Vec<String> = self
            .points
            .read()
            .await
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect();
        paths.sort();
        paths
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn upsert_point(&self, path: &str, declared_type: PointType, name: &str) -> Result<()> {
        let mut points = self.points.write().await;
        points.entry(path.to_string()).or_insert_with(|| PointEntry {
            declared_type,
            name: name.to_string(),
            value: None,
            acknowledged: false,
            writes: 0,
        });
        Ok(())
    }

    async fn write_value(&self, path: &str, value: Value, acknowledged: bool) -> Result<()> {
        let mut points = self.points.write().await;
        let entry = points.entry(path.to_string()).or_insert_with(|| PointEntry {
            declared_type: PointType::infer(&value),
            name: path.to_string(),
            value: None,
            acknowledged: false,
            writes: 0,
        });
        entry.value = Some(value);
        entry.acknowledged = acknowledged;
        entry.writes += 1;
        Ok(())
    }

    async fn write_value_if_changed(
        &self,
        path: &str,
        value: Value,
        acknowledged: bool,
    ) -> Result<()> {
        {
            let points = self.points.read().await;
            if let Some(entry) = points.get(path) {
                if entry.value.as_ref() == Some(&value) && entry.acknowledged == acknowledged {
                    return Ok(());
                }
            }
        }
        self.write_value(path, value, acknowledged).await
    }

    async fn object_exists(&self, path: &str) -> Result<bool> {
        Ok(self.points.read().await.contains_key(path))
    }

    async fn delete_tree(&self, path: &str) -> Result<()> {
        let child_prefix = format!("{path}.");
        let mut points = self.points.write().await;
        points.retain(|p, _| p != path && !p.starts_with(&child_prefix));
        Ok(())
    }

    async fn roots(&self) -> Result<Vec<String>> {
        let points = self.points.read().await;
        let mut roots: Vec<String> = points
            .keys()
            .map(|p| p.split('.').next().unwrap_or(p).to_string())
            .collect();
        roots.sort();
        roots.dedup();
        Ok(roots)
    }
}
