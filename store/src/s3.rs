use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use crate::{read_all, reader, Headers, ObjectReader, Store, StoreError};

/// Connection settings for an S3-compatible object store.
#[derive(Clone, Debug, Default)]
pub struct S3Config {
    pub bucket: String,
    pub key_prefix: Option<String>,
    pub region: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
}

/// An object store backed by an S3 bucket under an optional key prefix.
///
/// Objects are uploaded with a single `PutObject`, so a cancelled or failed
/// put leaves nothing behind at the target key.
#[derive(Debug)]
pub struct S3Store {
    client: Client,
    bucket: String,
    key_prefix: String,
}

impl S3Store {
    pub async fn new(config: S3Config) -> Result<Self, StoreError> {
        if config.bucket.is_empty() {
            return Err(StoreError::InvalidConfig("missing s3 bucket".to_owned()));
        }

        let mut loader = aws_config::from_env();
        if let Some(region) = config.region.clone() {
            loader = loader.region(Region::new(region));
        }
        if let (Some(access_key), Some(secret_key)) =
            (config.access_key.clone(), config.secret_key.clone())
        {
            loader = loader.credentials_provider(Credentials::new(
                access_key, secret_key, None, None, "prover-inputs",
            ));
        }
        let sdk_config = loader.load().await;

        Ok(Self {
            client: Client::new(&sdk_config),
            bucket: config.bucket,
            key_prefix: config.key_prefix.unwrap_or_default(),
        })
    }

    fn object_key(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_owned()
        } else {
            format!("{}/{key}", self.key_prefix.trim_end_matches('/'))
        }
    }
}

#[async_trait]
impl Store for S3Store {
    async fn put(
        &self,
        key: &str,
        payload: ObjectReader,
        headers: &Headers,
    ) -> Result<(), StoreError> {
        let body = read_all(payload).await?;
        let key = self.object_key(key);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(headers.content_type.mime())
            .set_content_encoding(
                headers
                    .content_encoding
                    .extension()
                    .map(ToOwned::to_owned),
            )
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| StoreError::Remote(err.to_string()))?;

        tracing::debug!(bucket = %self.bucket, key, "uploaded object");
        Ok(())
    }

    async fn get(&self, key: &str, _headers: &Headers) -> Result<ObjectReader, StoreError> {
        let object_key = self.object_key(key);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|err| match &err {
                SdkError::ServiceError(service) if service.err().is_no_such_key() => {
                    StoreError::NotFound(key.to_owned())
                }
                _ => StoreError::Remote(err.to_string()),
            })?;

        Ok(reader(output.body.into_async_read()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_bucket_is_rejected() {
        let err = S3Store::new(S3Config::default()).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidConfig(_)));
    }

    #[test]
    fn key_prefix_is_applied() {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .build();
        let store = S3Store {
            client: Client::from_conf(config),
            bucket: "bucket".to_owned(),
            key_prefix: "inputs/".to_owned(),
        };
        assert_eq!(store.object_key("1/42.json"), "inputs/1/42.json");
        assert_eq!(store.object_key("plain"), "inputs/plain");
    }
}
