use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::{reader, Headers, ObjectReader, Store, StoreError};

/// A store rooted at a local directory. Keys map to relative paths.
///
/// Writes are staged to a sibling temporary file and renamed into place, so
/// a cancelled or failed put never leaves a partial object at the target
/// key.
#[derive(Clone, Debug)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl Store for FileStore {
    async fn put(
        &self,
        key: &str,
        mut reader: ObjectReader,
        _headers: &Headers,
    ) -> Result<(), StoreError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let staging = staging_path(&path);
        let result = write_staged(&staging, &mut reader).await;
        if let Err(err) = result {
            let _ = fs::remove_file(&staging).await;
            return Err(err);
        }

        fs::rename(&staging, &path).await?;
        tracing::debug!(key, path = %path.display(), "stored object");
        Ok(())
    }

    async fn get(&self, key: &str, _headers: &Headers) -> Result<ObjectReader, StoreError> {
        let path = self.path_for(key);
        match fs::File::open(&path).await {
            Ok(file) => Ok(reader(file)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_owned()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

async fn write_staged(staging: &Path, reader: &mut ObjectReader) -> Result<(), StoreError> {
    let mut file = fs::File::create(staging).await?;
    tokio::io::copy(reader, &mut file).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_all;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let headers = Headers::default();

        store
            .put("1/preflight/42.json", reader(&b"payload"[..]), &headers)
            .await
            .unwrap();

        let loaded = read_all(store.get("1/preflight/42.json", &headers).await.unwrap())
            .await
            .unwrap();
        assert_eq!(loaded, b"payload");

        // No staging file left behind.
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("1/preflight"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec!["42.json"]);
    }

    #[tokio::test]
    async fn overwrite_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let headers = Headers::default();

        store.put("k", reader(&b"one"[..]), &headers).await.unwrap();
        store.put("k", reader(&b"two"[..]), &headers).await.unwrap();

        let loaded = read_all(store.get("k", &headers).await.unwrap()).await.unwrap();
        assert_eq!(loaded, b"two");
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let result = store.get("absent", &Headers::default()).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
