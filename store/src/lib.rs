//! A small composable object store for prover artifacts.
//!
//! Leaf stores put and get opaque byte streams under string keys: a
//! filesystem store rooted at a directory and an S3-compatible object store.
//! On top of the leaves, [`MultiStore`] fans writes out to several backends
//! and serves reads from the first one that answers, and [`CompressStore`]
//! transparently compresses payloads, deriving the final object key from the
//! content type and encoding recorded in [`Headers`].

mod compress;
mod file;
mod memory;
mod multi;
mod s3;

pub use compress::CompressStore;
pub use file::FileStore;
pub use memory::MemoryStore;
pub use multi::MultiStore;
pub use s3::{S3Config, S3Store};

use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// A streaming payload flowing in or out of a store.
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// Boxes any reader into an [`ObjectReader`].
pub fn reader<R: AsyncRead + Send + 'static>(reader: R) -> ObjectReader {
    Box::pin(reader)
}

/// Errors surfaced by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key does not exist in any configured backend.
    #[error("key {0} not found")]
    NotFound(String),

    #[error("store i/o failure: {0}")]
    Io(#[from] std::io::Error),

    /// An object-storage request failed after transport-level retries.
    #[error("object storage failure: {0}")]
    Remote(String),

    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),
}

/// The serialization format of a stored artifact.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ContentType {
    #[default]
    Json,
    Protobuf,
}

impl ContentType {
    /// The MIME name recorded in headers.
    pub const fn mime(&self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Protobuf => "application/protobuf",
        }
    }

    /// The file extension appended to object keys.
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Protobuf => "protobuf",
        }
    }
}

impl FromStr for ContentType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "protobuf" => Ok(Self::Protobuf),
            other => Err(StoreError::InvalidConfig(format!(
                "invalid content type: {other}"
            ))),
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// The compression applied to a stored artifact.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ContentEncoding {
    Gzip,
    Zlib,
    Flate,
    #[default]
    Plain,
}

impl ContentEncoding {
    /// The file extension appended to object keys; `None` for plain.
    pub const fn extension(&self) -> Option<&'static str> {
        match self {
            Self::Gzip => Some("gzip"),
            Self::Zlib => Some("zlib"),
            Self::Flate => Some("flate"),
            Self::Plain => None,
        }
    }
}

impl FromStr for ContentEncoding {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gzip" => Ok(Self::Gzip),
            "zlib" => Ok(Self::Zlib),
            "flate" => Ok(Self::Flate),
            "" => Ok(Self::Plain),
            other => Err(StoreError::InvalidConfig(format!(
                "invalid content encoding: {other}"
            ))),
        }
    }
}

impl fmt::Display for ContentEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension().unwrap_or(""))
    }
}

/// Object metadata travelling with every put and get.
#[derive(Clone, Debug, Default)]
pub struct Headers {
    pub content_type: ContentType,
    pub content_encoding: ContentEncoding,
    pub key_value: BTreeMap<String, String>,
}

impl Headers {
    pub fn new(content_type: ContentType, content_encoding: ContentEncoding) -> Self {
        Self {
            content_type,
            content_encoding,
            key_value: BTreeMap::new(),
        }
    }
}

/// A key-value store of byte streams.
#[async_trait]
pub trait Store: Send + Sync {
    /// Stores the payload under `key`. The write is durable when this
    /// returns; a failed write leaves nothing at `key`.
    async fn put(
        &self,
        key: &str,
        reader: ObjectReader,
        headers: &Headers,
    ) -> Result<(), StoreError>;

    /// Retrieves the payload stored under `key`.
    async fn get(&self, key: &str, headers: &Headers) -> Result<ObjectReader, StoreError>;
}

#[async_trait]
impl<T: Store + ?Sized> Store for std::sync::Arc<T> {
    async fn put(
        &self,
        key: &str,
        reader: ObjectReader,
        headers: &Headers,
    ) -> Result<(), StoreError> {
        (**self).put(key, reader, headers).await
    }

    async fn get(&self, key: &str, headers: &Headers) -> Result<ObjectReader, StoreError> {
        (**self).get(key, headers).await
    }
}

/// Drains a reader to completion. Convenience for callers that need the
/// whole payload in memory (deserialization, fan-out).
pub async fn read_all(mut reader: ObjectReader) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await?;
    Ok(buf)
}
