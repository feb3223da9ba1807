//! Object store abstraction. Two always-available backends — an
//! in-process filesystem store for tests and single-box deployments, and an
//! HTTP/REST store against an Azure-Blob-Storage-compatible endpoint — plus
//! an optional S3 backend behind the `blob_s3` feature.

use async_trait::async_trait;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct PutOptions {
    /// Fails the put if an object already exists at `path` (the
    /// "collision is a permanent error" upload semantics).
    pub fail_if_exists: bool,
    pub content_type: &'static str,
    pub metadata: Vec<(String, String)>,
}

impl Default for PutOptions {
    fn default() -> Self {
        Self {
            fail_if_exists: true,
            content_type: "application/octet-stream",
            metadata: Vec::new(),
        }
    }
}

/// A path-addressed, prefix-listable byte store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, path: &str, bytes: Vec<u8>, opts: PutOptions) -> Result<()>;
    async fn get(&self, path: &str) -> Result<Vec<u8>>;
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
    async fn exists(&self, path: &str) -> Result<bool>;
}

/// Filesystem-rooted implementation. Used directly in single-box deployments
/// and exercised in tests via `tempfile::TempDir`.
pub struct LocalFsStore {
    root: std::path::PathBuf,
}

impl LocalFsStore {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> std::path::PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl ObjectStore for LocalFsStore {
    async fn put(&self, path: &str, bytes: Vec<u8>, opts: PutOptions) -> Result<()> {
        let full = self.resolve(path);
        if opts.fail_if_exists && tokio::fs::try_exists(&full).await.unwrap_or(false) {
            return Err(crate::error::PipelineError::permanent_storage(format!(
                "object already exists at {path}"
            )));
        }
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&full, bytes).await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.resolve(path)).await?)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.resolve(prefix);
        let mut out = Vec::new();
        let mut stack = vec![dir];
        while let Some(current) = stack.pop() {
            let Ok(mut entries) = tokio::fs::read_dir(&current).await else { continue };
            while let Some(entry) = entries.next_entry().await.transpose() {
                let Ok(entry) = entry else { continue };
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Ok(relative) = path.strip_prefix(&self.root) {
                    out.push(relative.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.resolve(path)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsStore::new(dir.path());
        store.put("a/b/c.bin", vec![1, 2, 3], PutOptions::default()).await.unwrap();
        let bytes = store.get("a/b/c.bin").await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn collision_is_rejected_when_fail_if_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsStore::new(dir.path());
        store.put("x.bin", vec![1], PutOptions::default()).await.unwrap();
        let result = store.put("x.bin", vec![2], PutOptions::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn list_finds_nested_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsStore::new(dir.path());
        store
            .put("raw_events/yyyy=2025/mm=01/dd=01/events_a.bin", vec![1], PutOptions::default())
            .await
            .unwrap();
        store
            .put("raw_events/yyyy=2025/mm=01/dd=02/events_b.bin", vec![1], PutOptions::default())
            .await
            .unwrap();
        let found = store.list("raw_events/yyyy=2025").await.unwrap();
        assert_eq!(found.len(), 2);
    }
}
