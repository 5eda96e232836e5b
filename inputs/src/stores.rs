//! Typed stores for the two pipeline artifacts, layered over the generic
//! object store.
//!
//! Layout mirrors the documented artifact tree:
//! `<root>/<chain-id>/preflight/<block>.json` for heavy inputs and
//! `<root>/<chain-id>/<block>.<content-type>[.<encoding>]` for final inputs.

use std::io::Cursor;
use std::sync::Arc;

use prost::Message;
use prover_store::{
    read_all, reader, CompressStore, ContentEncoding, ContentType, Headers, Store,
};

use crate::input::{HeavyProverInput, ProverInput};
use crate::proto;
use crate::stages::StageError;

/// Persists heavy prover inputs as plain JSON on the configured store.
pub struct HeavyProverInputStore {
    store: Arc<dyn Store>,
}

impl HeavyProverInputStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    fn key(chain_id: u64, block_number: u64) -> String {
        format!("{chain_id}/preflight/{block_number}.json")
    }

    pub async fn store(&self, input: &HeavyProverInput) -> Result<(), StageError> {
        let key = Self::key(input.chain_config.chain_id, input.block.number());
        let payload = serde_json::to_vec(input)?;
        let headers = Headers::new(ContentType::Json, ContentEncoding::Plain);
        self.store
            .put(&key, reader(Cursor::new(payload)), &headers)
            .await?;
        tracing::info!(key, "stored heavy prover input");
        Ok(())
    }

    pub async fn load(
        &self,
        chain_id: u64,
        block_number: u64,
    ) -> Result<HeavyProverInput, StageError> {
        let key = Self::key(chain_id, block_number);
        let headers = Headers::new(ContentType::Json, ContentEncoding::Plain);
        let payload = read_all(self.store.get(&key, &headers).await?).await?;
        Ok(serde_json::from_slice(&payload)?)
    }
}

/// Persists final prover inputs in the configured content type and
/// encoding. The compression wrapper derives the final object key.
pub struct ProverInputStore {
    store: CompressStore<Arc<dyn Store>>,
    content_type: ContentType,
}

impl ProverInputStore {
    pub fn new(store: Arc<dyn Store>, content_type: ContentType, encoding: ContentEncoding) -> Self {
        Self {
            store: CompressStore::new(store, encoding),
            content_type,
        }
    }

    fn key(chain_id: u64, block_number: u64) -> String {
        format!("{chain_id}/{block_number}")
    }

    fn encode(&self, input: &ProverInput) -> Result<Vec<u8>, StageError> {
        match self.content_type {
            ContentType::Json => Ok(serde_json::to_vec(input)?),
            ContentType::Protobuf => {
                let message = proto::ProverInput::try_from(input)?;
                Ok(message.encode_to_vec())
            }
        }
    }

    fn decode(&self, payload: &[u8]) -> Result<ProverInput, StageError> {
        match self.content_type {
            ContentType::Json => Ok(serde_json::from_slice(payload)?),
            ContentType::Protobuf => {
                let message = proto::ProverInput::decode(payload).map_err(|err| {
                    StageError::InvalidInput(format!("malformed protobuf artifact: {err}"))
                })?;
                ProverInput::try_from(&message)
            }
        }
    }

    pub async fn store(&self, input: &ProverInput) -> Result<(), StageError> {
        let block = input.block().ok_or_else(|| {
            StageError::InvalidInput("prover input carries no block".to_owned())
        })?;
        let key = Self::key(input.chain_config.chain_id, block.number());
        let payload = self.encode(input)?;
        let headers = Headers::new(self.content_type, ContentEncoding::Plain);
        self.store
            .put(&key, reader(Cursor::new(payload)), &headers)
            .await?;
        tracing::info!(key, content_type = %self.content_type, "stored prover input");
        Ok(())
    }

    pub async fn load(
        &self,
        chain_id: u64,
        block_number: u64,
    ) -> Result<ProverInput, StageError> {
        let key = Self::key(chain_id, block_number);
        let headers = Headers::new(self.content_type, ContentEncoding::Plain);
        let payload = read_all(self.store.get(&key, &headers).await?).await?;
        self.decode(&payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{Block, Witness};
    use alloy_genesis::ChainConfig;
    use prover_store::MemoryStore;
    use reth_primitives::Header;

    fn sample_input() -> ProverInput {
        ProverInput::new(
            ChainConfig {
                chain_id: 1,
                ..Default::default()
            },
            Block {
                header: Header {
                    number: 42,
                    ..Default::default()
                },
                ..Default::default()
            },
            Witness::default(),
            None,
        )
    }

    #[tokio::test]
    async fn heavy_store_round_trips_under_preflight_key() {
        let backend = Arc::new(MemoryStore::new());
        let store = HeavyProverInputStore::new(backend.clone());

        let heavy = HeavyProverInput {
            chain_config: ChainConfig {
                chain_id: 1,
                ..Default::default()
            },
            block: Block {
                header: Header {
                    number: 42,
                    ..Default::default()
                },
                ..Default::default()
            },
            ancestors: vec![],
            codes: vec![],
            pre_state_proofs: vec![],
            post_state_proofs: vec![],
        };

        store.store(&heavy).await.unwrap();
        assert!(backend.contains("1/preflight/42.json"));
        assert_eq!(store.load(1, 42).await.unwrap(), heavy);
    }

    #[tokio::test]
    async fn json_store_round_trips() {
        let backend = Arc::new(MemoryStore::new()) as Arc<dyn Store>;
        let store = ProverInputStore::new(backend, ContentType::Json, ContentEncoding::Gzip);

        let input = sample_input();
        store.store(&input).await.unwrap();
        assert_eq!(store.load(1, 42).await.unwrap(), input);
    }

    #[tokio::test]
    async fn protobuf_store_round_trips() {
        let backend = Arc::new(MemoryStore::new());
        let store = ProverInputStore::new(
            backend.clone() as Arc<dyn Store>,
            ContentType::Protobuf,
            ContentEncoding::Plain,
        );

        let input = sample_input();
        store.store(&input).await.unwrap();
        assert!(backend.contains("1/42.protobuf"));
        assert_eq!(store.load(1, 42).await.unwrap(), input);
    }

    #[tokio::test]
    async fn missing_artifact_is_invalid_input() {
        let backend = Arc::new(MemoryStore::new()) as Arc<dyn Store>;
        let store = ProverInputStore::new(backend, ContentType::Json, ContentEncoding::Plain);
        assert!(matches!(
            store.load(1, 7).await.unwrap_err(),
            StageError::InvalidInput(_)
        ));
    }
}
