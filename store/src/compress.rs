use async_compression::tokio::bufread::{
    DeflateDecoder, DeflateEncoder, GzipDecoder, GzipEncoder, ZlibDecoder, ZlibEncoder,
};
use async_trait::async_trait;
use tokio::io::BufReader;

use crate::{reader, ContentEncoding, Headers, ObjectReader, Store, StoreError};

/// Wraps any inner store with streaming compression.
///
/// The payload is piped through the encoder as it is written, never buffered
/// whole. The encoding is recorded in the object's headers, and the final
/// object key carries the content-type and encoding extensions:
/// `<key>.<content-type>[.<encoding>]`.
pub struct CompressStore<S> {
    inner: S,
    encoding: ContentEncoding,
}

impl<S: Store> CompressStore<S> {
    pub fn new(inner: S, encoding: ContentEncoding) -> Self {
        Self { inner, encoding }
    }

    /// The object key derived from the logical key and headers.
    pub fn object_key(key: &str, headers: &Headers) -> String {
        let mut out = format!("{key}.{}", headers.content_type.extension());
        if let Some(ext) = headers.content_encoding.extension() {
            out.push('.');
            out.push_str(ext);
        }
        out
    }
}

#[async_trait]
impl<S: Store> Store for CompressStore<S> {
    async fn put(
        &self,
        key: &str,
        payload: ObjectReader,
        headers: &Headers,
    ) -> Result<(), StoreError> {
        let mut headers = headers.clone();
        headers.content_encoding = self.encoding;

        let buffered = BufReader::new(payload);
        let encoded: ObjectReader = match self.encoding {
            ContentEncoding::Gzip => reader(GzipEncoder::new(buffered)),
            ContentEncoding::Zlib => reader(ZlibEncoder::new(buffered)),
            ContentEncoding::Flate => reader(DeflateEncoder::new(buffered)),
            ContentEncoding::Plain => reader(buffered),
        };

        let key = Self::object_key(key, &headers);
        self.inner.put(&key, encoded, &headers).await
    }

    async fn get(&self, key: &str, headers: &Headers) -> Result<ObjectReader, StoreError> {
        let mut headers = headers.clone();
        headers.content_encoding = self.encoding;

        let key = Self::object_key(key, &headers);
        let stored = self.inner.get(&key, &headers).await?;

        let buffered = BufReader::new(stored);
        Ok(match headers.content_encoding {
            ContentEncoding::Gzip => reader(GzipDecoder::new(buffered)),
            ContentEncoding::Zlib => reader(ZlibDecoder::new(buffered)),
            ContentEncoding::Flate => reader(DeflateDecoder::new(buffered)),
            ContentEncoding::Plain => reader(buffered),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{read_all, ContentType, MemoryStore};

    fn payload() -> Vec<u8> {
        // Compressible content.
        b"prover input prover input prover input prover input".repeat(64)
    }

    async fn round_trip(encoding: ContentEncoding) {
        let inner = Arc::new(MemoryStore::new());
        let store = CompressStore::new(inner.clone(), encoding);
        let headers = Headers::new(ContentType::Json, ContentEncoding::Plain);

        store
            .put("1/42", reader(std::io::Cursor::new(payload())), &headers)
            .await
            .unwrap();

        let loaded = read_all(store.get("1/42", &headers).await.unwrap())
            .await
            .unwrap();
        assert_eq!(loaded, payload());
    }

    #[tokio::test]
    async fn gzip_round_trip() {
        round_trip(ContentEncoding::Gzip).await;
    }

    #[tokio::test]
    async fn zlib_round_trip() {
        round_trip(ContentEncoding::Zlib).await;
    }

    #[tokio::test]
    async fn flate_round_trip() {
        round_trip(ContentEncoding::Flate).await;
    }

    #[tokio::test]
    async fn plain_round_trip() {
        round_trip(ContentEncoding::Plain).await;
    }

    #[tokio::test]
    async fn object_keys_carry_type_and_encoding() {
        let inner = Arc::new(MemoryStore::new());
        let store = CompressStore::new(inner.clone(), ContentEncoding::Gzip);
        let headers = Headers::new(ContentType::Protobuf, ContentEncoding::Plain);

        store
            .put("1/42", reader(std::io::Cursor::new(payload())), &headers)
            .await
            .unwrap();
        assert!(inner.contains("1/42.protobuf.gzip"));

        let store = CompressStore::new(inner.clone(), ContentEncoding::Plain);
        let headers = Headers::new(ContentType::Json, ContentEncoding::Plain);
        store
            .put("1/42", reader(std::io::Cursor::new(payload())), &headers)
            .await
            .unwrap();
        assert!(inner.contains("1/42.json"));
    }

    #[tokio::test]
    async fn compressed_objects_are_smaller() {
        let inner = Arc::new(MemoryStore::new());
        let store = CompressStore::new(inner.clone(), ContentEncoding::Gzip);
        let headers = Headers::new(ContentType::Json, ContentEncoding::Plain);

        store
            .put("k", reader(std::io::Cursor::new(payload())), &headers)
            .await
            .unwrap();

        let stored_headers = Headers::new(ContentType::Json, ContentEncoding::Gzip);
        let raw = read_all(inner.get("k.json.gzip", &stored_headers).await.unwrap())
            .await
            .unwrap();
        assert!(raw.len() < payload().len() / 4);
    }
}
