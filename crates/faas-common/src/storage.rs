//! Durable storage for uploaded handler code.

use crate::{FaasError, Result, HANDLER_FILE_NAME};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

/// Byte storage for handler code, addressed by function id.
///
/// The returned location is opaque to callers and is passed back verbatim to
/// `load`, `delete` and to the orchestrator.
#[async_trait]
pub trait CodeStorage: Send + Sync {
    async fn store(&self, function_id: &str, code: &[u8]) -> Result<String>;
    async fn load(&self, location: &str) -> Result<Vec<u8>>;
    async fn delete(&self, location: &str) -> Result<()>;
}

/// Keeps each function's code in `<root>/<function_id>/handler.py`.
///
/// The location is the function's directory so that it can be bind-mounted
/// into a worker as-is.
#[derive(Debug, Clone)]
pub struct LocalCodeStorage {
    root: PathBuf,
}

impl LocalCodeStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl CodeStorage for LocalCodeStorage {
    #[instrument(skip(self, code), fields(bytes = code.len()))]
    async fn store(&self, function_id: &str, code: &[u8]) -> Result<String> {
        if function_id.is_empty() || function_id.contains(['/', '\\']) || function_id == ".." {
            return Err(FaasError::Validation(format!(
                "invalid function id for code storage: '{function_id}'"
            )));
        }

        let func_dir = self.root.join(function_id);
        tokio::fs::create_dir_all(&func_dir)
            .await
            .map_err(|e| FaasError::Storage(format!("Failed to create function dir: {e}")))?;

        tokio::fs::write(func_dir.join(HANDLER_FILE_NAME), code)
            .await
            .map_err(|e| FaasError::Storage(format!("Failed to save handler code: {e}")))?;

        // Docker bind mounts need an absolute host path.
        let location = match tokio::fs::canonicalize(&func_dir).await {
            Ok(abs) => abs,
            Err(_) => func_dir,
        };
        debug!(location = %location.display(), "Stored handler code");
        Ok(location.to_string_lossy().into_owned())
    }

    async fn load(&self, location: &str) -> Result<Vec<u8>> {
        let path = Path::new(location).join(HANDLER_FILE_NAME);
        tokio::fs::read(&path).await.map_err(|e| {
            FaasError::Storage(format!("Failed to read handler file {}: {e}", path.display()))
        })
    }

    async fn delete(&self, location: &str) -> Result<()> {
        match tokio::fs::remove_dir_all(location).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FaasError::Storage(format!(
                "Failed to delete function code directory {location}: {e}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalCodeStorage::new(dir.path());

        let location = storage.store("fn123", b"print('hi')").await.unwrap();
        assert!(location.ends_with("fn123"));
        assert!(Path::new(&location).join(HANDLER_FILE_NAME).exists());

        let code = storage.load(&location).await.unwrap();
        assert_eq!(code, b"print('hi')");

        storage.delete(&location).await.unwrap();
        assert!(!Path::new(&location).exists());

        // Deleting again is fine.
        storage.delete(&location).await.unwrap();
    }

    #[tokio::test]
    async fn test_store_overwrites_existing_code() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalCodeStorage::new(dir.path());

        let first = storage.store("fn1", b"v1").await.unwrap();
        let second = storage.store("fn1", b"v2").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(storage.load(&second).await.unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalCodeStorage::new(dir.path());

        let err = storage.store("../escape", b"x").await.unwrap_err();
        assert!(matches!(err, FaasError::Validation(_)));
    }

    #[tokio::test]
    async fn test_load_missing_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalCodeStorage::new(dir.path());

        let missing = dir.path().join("nope");
        let err = storage.load(&missing.to_string_lossy()).await.unwrap_err();
        assert!(matches!(err, FaasError::Storage(_)));
    }
}
