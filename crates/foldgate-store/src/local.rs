// SPDX-License-Identifier: Apache-2.0

use crate::{ObjectStore, StoreError, StoreErrorCode};
use async_trait::async_trait;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Filesystem-backed store: writes go to a sibling `.part` file, are synced,
/// then renamed into place so a single `put` is atomic; `move_object` is a
/// plain rename within the root.
pub struct LocalFsStore {
    root: PathBuf,
}

impl LocalFsStore {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, logical: &str) -> Result<PathBuf, StoreError> {
        if logical.is_empty()
            || logical.starts_with('/')
            || logical.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
        {
            return Err(StoreError::new(
                StoreErrorCode::Validation,
                format!("unsafe object path: {logical}"),
            ));
        }
        Ok(self.root.join(logical))
    }

    fn ensure_parent(path: &Path) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StoreError::new(StoreErrorCode::Io, e.to_string()))?;
        }
        Ok(())
    }
}

fn write_and_sync(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let mut file =
        File::create(path).map_err(|e| StoreError::new(StoreErrorCode::Io, e.to_string()))?;
    file.write_all(bytes)
        .map_err(|e| StoreError::new(StoreErrorCode::Io, e.to_string()))?;
    file.sync_all()
        .map_err(|e| StoreError::new(StoreErrorCode::Io, e.to_string()))
}

#[async_trait]
impl ObjectStore for LocalFsStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let target = self.resolve(path)?;
        Self::ensure_parent(&target)?;
        let part = target.with_extension("part");
        write_and_sync(&part, bytes)?;
        fs::rename(&part, &target).map_err(|e| StoreError::new(StoreErrorCode::Io, e.to_string()))
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        let target = self.resolve(path)?;
        fs::read(&target).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::new(StoreErrorCode::NotFound, format!("missing object: {path}"))
            } else {
                StoreError::new(StoreErrorCode::Io, e.to_string())
            }
        })
    }

    async fn move_object(&self, src: &str, dst: &str) -> Result<(), StoreError> {
        let from = self.resolve(src)?;
        let to = self.resolve(dst)?;
        if !from.exists() {
            return Err(StoreError::new(
                StoreErrorCode::NotFound,
                format!("missing object: {src}"),
            ));
        }
        Self::ensure_parent(&to)?;
        fs::rename(&from, &to).map_err(|e| StoreError::new(StoreErrorCode::Io, e.to_string()))
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        Ok(self.resolve(path)?.is_file())
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        let target = self.resolve(path)?;
        match fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::new(StoreErrorCode::Io, e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempdir().expect("tempdir");
        let store = LocalFsStore::new(dir.path().to_path_buf());
        store.put("jobs/j1/results.json", b"abc").await.expect("put");
        let bytes = store.get("jobs/j1/results.json").await.expect("get");
        assert_eq!(bytes, b"abc");
    }

    #[tokio::test]
    async fn move_relocates_the_object() {
        let dir = tempdir().expect("tempdir");
        let store = LocalFsStore::new(dir.path().to_path_buf());
        store.put("tmp/t1/a.json", b"x").await.expect("put");
        store
            .move_object("tmp/t1/a.json", "jobs/j1/a.json")
            .await
            .expect("move");
        assert!(!store.exists("tmp/t1/a.json").await.expect("exists"));
        assert!(store.exists("jobs/j1/a.json").await.expect("exists"));
    }

    #[tokio::test]
    async fn traversal_segments_are_rejected() {
        let dir = tempdir().expect("tempdir");
        let store = LocalFsStore::new(dir.path().to_path_buf());
        for path in ["../escape", "/abs", "a//b", "a/./b", "a/../b"] {
            let err = store.put(path, b"x").await.expect_err("must reject");
            assert_eq!(err.code, StoreErrorCode::Validation);
        }
    }

    #[tokio::test]
    async fn delete_of_missing_object_is_noop() {
        let dir = tempdir().expect("tempdir");
        let store = LocalFsStore::new(dir.path().to_path_buf());
        store.delete("jobs/none.json").await.expect("noop delete");
    }
}
