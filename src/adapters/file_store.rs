//! Filesystem-backed `RuntimeStore`: one file per key under a base
//! directory, for hosts that need the persisted state to actually
//! survive a restart rather than living only in process memory.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;

use crate::ports::runtime_store::{RuntimeStore, StoreError};

/// Stores each key as a file named after the key with `.`-segments kept
/// intact (the key space is flat and dotted, e.g. `runtime.things.t1`, so
/// no directory nesting is needed); values are written atomically via a
/// temp-file-then-rename so a crash mid-write never leaves a torn value.
pub struct FileRuntimeStore {
    base_dir: PathBuf,
}

impl FileRuntimeStore {
    /// Construct a store rooted at `base_dir`, creating it if absent.
    pub async fn new(base_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).await.map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Self { base_dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty() || key.contains('/') || key.contains("..") {
            return Err(StoreError::Backend(format!("invalid store key: {key}")));
        }
        Ok(self.base_dir.join(key))
    }
}

#[async_trait]
impl RuntimeStore for FileRuntimeStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, value).await.map_err(|e| StoreError::Backend(e.to_string()))?;
        fs::rename(&tmp_path, &path).await.map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Backend(e.to_string())),
        }
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut entries = fs::read_dir(&self.base_dir).await.map_err(|e| StoreError::Backend(e.to_string()))?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| StoreError::Backend(e.to_string()))? {
            let file_name = entry.file_name();
            let Some(name) = file_name.to_str() else { continue };
            if name.ends_with(".tmp") {
                continue;
            }
            if name.starts_with(prefix) {
                keys.push(name.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRuntimeStore::new(dir.path()).await.unwrap();
        store.put("runtime.things.t1", b"{}").await.unwrap();
        assert_eq!(store.get("runtime.things.t1").await.unwrap(), Some(b"{}".to_vec()));
        store.delete("runtime.things.t1").await.unwrap();
        assert_eq!(store.get("runtime.things.t1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_prefix_ignores_temp_files_left_by_a_partial_write() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRuntimeStore::new(dir.path()).await.unwrap();
        store.put("runtime.things.t1", b"1").await.unwrap();
        fs::write(dir.path().join("runtime.things.t2.tmp"), b"stale").await.unwrap();

        let keys = store.list_prefix("runtime.things.").await.unwrap();
        assert_eq!(keys, vec!["runtime.things.t1".to_string()]);
    }

    #[tokio::test]
    async fn a_key_containing_a_path_separator_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileRuntimeStore::new(dir.path()).await.unwrap();
        assert!(store.put("runtime/things/t1", b"x").await.is_err());
    }
}
