//! Keyed record storage for [`Function`]s.

use async_trait::async_trait;
use faas_common::{FaasError, Function, FunctionStatus, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

#[async_trait]
pub trait FunctionStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Function>>;
    /// All records, oldest first.
    async fn list(&self) -> Result<Vec<Function>>;
    async fn list_by_status(&self, status: FunctionStatus) -> Result<Vec<Function>>;
    async fn upsert(&self, function: &Function) -> Result<()>;
    /// Hard delete; `NotFound` when there is no such record.
    async fn delete(&self, id: &str) -> Result<()>;
}

fn sorted(records: impl Iterator<Item = Function>) -> Vec<Function> {
    let mut records: Vec<Function> = records.collect();
    records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    records
}

// In-memory storage implementation for development/testing
#[derive(Default)]
pub struct InMemoryFunctionStore {
    functions: Arc<RwLock<HashMap<String, Function>>>,
}

impl InMemoryFunctionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FunctionStore for InMemoryFunctionStore {
    async fn get(&self, id: &str) -> Result<Option<Function>> {
        Ok(self.functions.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Function>> {
        Ok(sorted(self.functions.read().await.values().cloned()))
    }

    async fn list_by_status(&self, status: FunctionStatus) -> Result<Vec<Function>> {
        Ok(sorted(
            self.functions
                .read()
                .await
                .values()
                .filter(|f| f.status == status)
                .cloned(),
        ))
    }

    async fn upsert(&self, function: &Function) -> Result<()> {
        self.functions
            .write()
            .await
            .insert(function.id.clone(), function.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.functions
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| FaasError::NotFound(id.to_string()))
    }
}

/// Records kept in a single JSON file so they survive process restarts.
///
/// Every mutation rewrites the whole file through a temp file and rename; the
/// in-memory copy only changes once the write has succeeded.
pub struct JsonFileFunctionStore {
    path: PathBuf,
    functions: RwLock<HashMap<String, Function>>,
}

impl JsonFileFunctionStore {
    /// Open the store, starting empty when the file does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let functions = match tokio::fs::read_to_string(&path).await {
            Ok(content) if content.trim().is_empty() => HashMap::new(),
            Ok(content) => {
                let records: Vec<Function> = serde_json::from_str(&content).map_err(|e| {
                    FaasError::Storage(format!("Corrupt function store {}: {e}", path.display()))
                })?;
                records.into_iter().map(|f| (f.id.clone(), f)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(FaasError::Storage(format!(
                    "Failed to read function store {}: {e}",
                    path.display()
                )))
            }
        };
        info!(path = %path.display(), records = functions.len(), "Opened function store");

        Ok(Self {
            path,
            functions: RwLock::new(functions),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[instrument(skip(self, functions), fields(path = %self.path.display()))]
    async fn persist(&self, functions: &HashMap<String, Function>) -> Result<()> {
        let records = sorted(functions.values().cloned());
        let json = serde_json::to_vec_pretty(&records)
            .map_err(|e| FaasError::Storage(format!("Failed to encode function store: {e}")))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FaasError::Storage(format!("Failed to create store dir: {e}")))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| FaasError::Storage(format!("Failed to write function store: {e}")))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| FaasError::Storage(format!("Failed to replace function store: {e}")))?;
        debug!(records = records.len(), "Persisted function store");
        Ok(())
    }
}

#[async_trait]
impl FunctionStore for JsonFileFunctionStore {
    async fn get(&self, id: &str) -> Result<Option<Function>> {
        Ok(self.functions.read().await.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Function>> {
        Ok(sorted(self.functions.read().await.values().cloned()))
    }

    async fn list_by_status(&self, status: FunctionStatus) -> Result<Vec<Function>> {
        Ok(sorted(
            self.functions
                .read()
                .await
                .values()
                .filter(|f| f.status == status)
                .cloned(),
        ))
    }

    async fn upsert(&self, function: &Function) -> Result<()> {
        let mut functions = self.functions.write().await;
        let mut next = functions.clone();
        next.insert(function.id.clone(), function.clone());
        self.persist(&next).await?;
        *functions = next;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut functions = self.functions.write().await;
        if !functions.contains_key(id) {
            return Err(FaasError::NotFound(id.to_string()));
        }
        let mut next = functions.clone();
        next.remove(id);
        self.persist(&next).await?;
        *functions = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use faas_common::Provisioned;

    fn function(id: &str) -> Function {
        Function::new(
            id.to_string(),
            format!("name-{id}"),
            "function.handler.run".to_string(),
            format!("/tmp/faas/{id}"),
        )
    }

    async fn exercise_store(store: &dyn FunctionStore) {
        let mut a = function("a");
        let b = function("b");
        store.upsert(&a).await.unwrap();
        store.upsert(&b).await.unwrap();

        a.mark_running(Provisioned {
            backend_handle: "c1".to_string(),
            endpoint: "localhost:1".to_string(),
        });
        store.upsert(&a).await.unwrap();

        assert_eq!(store.get("a").await.unwrap(), Some(a.clone()));
        assert_eq!(store.list().await.unwrap().len(), 2);

        let running = store.list_by_status(FunctionStatus::Running).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, "a");

        store.delete("b").await.unwrap();
        assert!(store.get("b").await.unwrap().is_none());
        assert!(matches!(
            store.delete("b").await.unwrap_err(),
            FaasError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_in_memory_store() {
        exercise_store(&InMemoryFunctionStore::new()).await;
    }

    #[tokio::test]
    async fn test_json_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileFunctionStore::open(dir.path().join("functions.json"))
            .await
            .unwrap();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn test_json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("functions.json");

        let store = JsonFileFunctionStore::open(&path).await.unwrap();
        assert!(store.list().await.unwrap().is_empty());

        let mut f = function("persisted");
        f.mark_running(Provisioned {
            backend_handle: "c9".to_string(),
            endpoint: "localhost:9".to_string(),
        });
        store.upsert(&f).await.unwrap();
        drop(store);

        let reopened = JsonFileFunctionStore::open(&path).await.unwrap();
        let records = reopened.list().await.unwrap();
        assert_eq!(records, vec![f]);
    }

    #[tokio::test]
    async fn test_json_store_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("functions.json");
        tokio::fs::write(&path, "{not json").await.unwrap();

        let err = JsonFileFunctionStore::open(&path).await.err().unwrap();
        assert!(matches!(err, FaasError::Storage(_)));
    }

    #[tokio::test]
    async fn test_list_is_ordered_by_creation() {
        let store = InMemoryFunctionStore::new();
        let mut older = function("z-old");
        older.created_at = older.created_at - chrono::Duration::seconds(60);
        let newer = function("a-new");
        store.upsert(&newer).await.unwrap();
        store.upsert(&older).await.unwrap();

        let ids: Vec<String> = store.list().await.unwrap().into_iter().map(|f| f.id).collect();
        assert_eq!(ids, vec!["z-old".to_string(), "a-new".to_string()]);
    }
}
