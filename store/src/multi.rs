use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{read_all, reader, Headers, ObjectReader, Store, StoreError};

/// Fans writes out to every configured backend and serves reads from the
/// first backend that has the key.
///
/// Writes are all-or-nothing from the caller's perspective: the first
/// backend failure aborts the put and is returned as-is. An object already
/// written to an earlier backend is not rolled back; re-running the put is
/// the recovery path, since every backend put is idempotent.
pub struct MultiStore {
    stores: Vec<Arc<dyn Store>>,
}

impl MultiStore {
    pub fn new(stores: Vec<Arc<dyn Store>>) -> Result<Self, StoreError> {
        if stores.is_empty() {
            return Err(StoreError::InvalidConfig(
                "multi store requires at least one backend".to_owned(),
            ));
        }
        Ok(Self { stores })
    }
}

#[async_trait]
impl Store for MultiStore {
    async fn put(
        &self,
        key: &str,
        payload: ObjectReader,
        headers: &Headers,
    ) -> Result<(), StoreError> {
        // The stream can only be consumed once; buffer it to replay into
        // each backend.
        let bytes = read_all(payload).await?;
        for store in &self.stores {
            store
                .put(key, reader(Cursor::new(bytes.clone())), headers)
                .await?;
        }
        Ok(())
    }

    async fn get(&self, key: &str, headers: &Headers) -> Result<ObjectReader, StoreError> {
        // Absence moves on to the next backend; a real backend failure is
        // returned immediately, matching the fail-fast write path.
        for store in &self.stores {
            match store.get(key, headers).await {
                Ok(found) => return Ok(found),
                Err(StoreError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(StoreError::NotFound(key.to_owned()))
    }
}
