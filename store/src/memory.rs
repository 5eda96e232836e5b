use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::{read_all, reader, Headers, ObjectReader, Store, StoreError};

/// An in-memory store, for tests and wiring experiments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Bytes>>,
    fail_writes: bool,
    fail_reads: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose writes always fail, for exercising fan-out behavior.
    pub fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    /// A store whose reads always fail, for exercising fall-through
    /// behavior.
    pub fn failing_reads() -> Self {
        Self {
            fail_reads: true,
            ..Self::default()
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().expect("poisoned").contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self
            .objects
            .lock()
            .expect("poisoned")
            .keys()
            .cloned()
            .collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put(
        &self,
        key: &str,
        payload: ObjectReader,
        _headers: &Headers,
    ) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::Remote("write rejected".to_owned()));
        }
        let bytes = read_all(payload).await?;
        self.objects
            .lock()
            .expect("poisoned")
            .insert(key.to_owned(), bytes.into());
        Ok(())
    }

    async fn get(&self, key: &str, _headers: &Headers) -> Result<ObjectReader, StoreError> {
        if self.fail_reads {
            return Err(StoreError::Remote("read rejected".to_owned()));
        }
        let bytes = self
            .objects
            .lock()
            .expect("poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_owned()))?;
        Ok(reader(Cursor::new(bytes.to_vec())))
    }
}
