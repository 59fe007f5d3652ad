// SPDX-License-Identifier: Apache-2.0

use crate::{ObjectStore, StoreError, StoreErrorCode};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Map-backed store for tests and single-process deployments. Also the
/// substrate for fault injection: set `fail_moves_after` to make the Nth
/// and later `move_object` calls fail, which is how mid-finalize crashes
/// are simulated.
#[derive(Default)]
pub struct InMemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    pub move_calls: AtomicU64,
    pub fail_moves_after: Option<u64>,
}

impl InMemoryStore {
    #[must_use]
    pub fn failing_after_moves(n: u64) -> Self {
        Self {
            fail_moves_after: Some(n),
            ..Self::default()
        }
    }

    pub async fn list_prefix(&self, prefix: &str) -> Vec<String> {
        self.objects
            .lock()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn put(&self, path: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.objects
            .lock()
            .await
            .insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>, StoreError> {
        self.objects
            .lock()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| {
                StoreError::new(StoreErrorCode::NotFound, format!("missing object: {path}"))
            })
    }

    async fn move_object(&self, src: &str, dst: &str) -> Result<(), StoreError> {
        let call = self.move_calls.fetch_add(1, Ordering::Relaxed);
        if let Some(budget) = self.fail_moves_after {
            if call >= budget {
                return Err(StoreError::new(
                    StoreErrorCode::Io,
                    "injected move failure",
                ));
            }
        }
        let mut objects = self.objects.lock().await;
        let bytes = objects.remove(src).ok_or_else(|| {
            StoreError::new(StoreErrorCode::NotFound, format!("missing object: {src}"))
        })?;
        objects.insert(dst.to_string(), bytes);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, StoreError> {
        Ok(self.objects.lock().await.contains_key(path))
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.objects.lock().await.remove(path);
        Ok(())
    }
}
