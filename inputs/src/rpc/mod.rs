//! The remote chain client: a cached, concurrency-bounded view over an
//! archive node's JSON-RPC surface.

mod db;
pub mod retry;

pub use db::RpcStateDb;

use std::num::NonZeroUsize;
use std::sync::Arc;

use alloy::providers::Provider;
use alloy::rpc::types::{Block as RpcBlock, BlockId, BlockNumberOrTag, BlockTransactionsKind, EIP1186AccountProofResponse};
use alloy::transports::Transport;
use alloy_primitives::{Address, Bytes, B256, U256};
use lru::LruCache;
use reth_primitives::Header;
use tokio::sync::{Mutex, Semaphore};

use crate::stages::StageError;

const BLOCK_CACHE_SIZE: usize = 1024;
/// The alloy HTTP provider keeps an unbounded connection pool; parallelism
/// is bounded here instead.
const MAX_PARALLEL_REQUESTS: usize = 64;

/// A shared provider wrapper caching blocks and bounding request
/// parallelism.
pub struct ChainClient<P, T> {
    provider: Arc<P>,
    semaphore: Arc<Semaphore>,
    blocks_by_number: Mutex<LruCache<u64, RpcBlock>>,
    _phantom: std::marker::PhantomData<T>,
}

fn count_request(method: &'static str, ok: bool) {
    let status = if ok { "ok" } else { "error" };
    metrics::counter!("rpc_requests_total", "method" => method, "status" => status).increment(1);
}

fn transient(err: impl std::fmt::Display) -> StageError {
    StageError::Transient(err.to_string())
}

impl<P, T> ChainClient<P, T>
where
    P: Provider<T>,
    T: Transport + Clone,
{
    pub fn new(provider: P) -> Self {
        Self {
            provider: Arc::new(provider),
            semaphore: Arc::new(Semaphore::new(MAX_PARALLEL_REQUESTS)),
            blocks_by_number: Mutex::new(LruCache::new(
                NonZeroUsize::new(BLOCK_CACHE_SIZE).expect("nonzero cache size"),
            )),
            _phantom: std::marker::PhantomData,
        }
    }

    async fn permit(&self) -> Result<tokio::sync::SemaphorePermit<'_>, StageError> {
        self.semaphore.acquire().await.map_err(transient)
    }

    pub async fn chain_id(&self) -> Result<u64, StageError> {
        let _permit = self.permit().await?;
        let result = self.provider.get_chain_id().await;
        count_request("eth_chainId", result.is_ok());
        result.map_err(transient)
    }

    /// Resolves a block tag (`latest`, `safe`, a number, ...) to a concrete
    /// block number.
    pub async fn resolve_number(&self, id: BlockNumberOrTag) -> Result<u64, StageError> {
        if let BlockNumberOrTag::Number(number) = id {
            return Ok(number);
        }
        let block = self.block(id.into(), BlockTransactionsKind::Hashes).await?;
        Ok(block.header.number)
    }

    /// Retrieves a block, serving repeat requests from an LRU cache.
    pub async fn block(
        &self,
        id: BlockId,
        kind: BlockTransactionsKind,
    ) -> Result<RpcBlock, StageError> {
        if let BlockId::Number(BlockNumberOrTag::Number(number)) = id {
            if let Some(cached) = self.blocks_by_number.lock().await.get(&number) {
                // Only a full-transaction cache entry can serve a full
                // request.
                let full_enough = !matches!(kind, BlockTransactionsKind::Full)
                    || cached.transactions.as_transactions().is_some();
                if full_enough {
                    return Ok(cached.clone());
                }
            }
        }

        let _permit = self.permit().await?;
        let result = self.provider.get_block(id, kind).await;
        count_request("eth_getBlockByNumber", result.is_ok());
        let block = result
            .map_err(transient)?
            .ok_or_else(|| StageError::InvalidInput(format!("block {id:?} does not exist")))?;

        self.blocks_by_number
            .lock()
            .await
            .put(block.header.number, block.clone());
        Ok(block)
    }

    /// Retrieves a header converted to its primitive form.
    pub async fn header(&self, number: u64) -> Result<Header, StageError> {
        let block = self
            .block(number.into(), BlockTransactionsKind::Hashes)
            .await?;
        header_from_rpc(block.header)
    }

    pub async fn block_hash(&self, number: u64) -> Result<B256, StageError> {
        let block = self
            .block(number.into(), BlockTransactionsKind::Hashes)
            .await?;
        Ok(block.header.hash)
    }

    /// `eth_getProof` for an account and a set of storage slots at a block.
    pub async fn proof(
        &self,
        address: Address,
        slots: Vec<B256>,
        block: u64,
    ) -> Result<EIP1186AccountProofResponse, StageError> {
        let _permit = self.permit().await?;
        let result = self
            .provider
            .get_proof(address, slots)
            .block_id(block.into())
            .await;
        count_request("eth_getProof", result.is_ok());
        result.map_err(transient)
    }

    pub async fn code(&self, address: Address, block: u64) -> Result<Bytes, StageError> {
        let _permit = self.permit().await?;
        let result = self.provider.get_code_at(address).block_id(block.into()).await;
        count_request("eth_getCode", result.is_ok());
        result.map_err(transient)
    }

    pub async fn storage(
        &self,
        address: Address,
        slot: B256,
        block: u64,
    ) -> Result<U256, StageError> {
        let _permit = self.permit().await?;
        let result = self
            .provider
            .get_storage_at(address, slot.into())
            .block_id(block.into())
            .await;
        count_request("eth_getStorageAt", result.is_ok());
        result.map_err(transient)
    }

    /// Fetches an uncle header by the nephew block id and uncle index.
    pub async fn uncle(&self, block: BlockId, index: u64) -> Result<Header, StageError> {
        let _permit = self.permit().await?;
        let result = self.provider.get_uncle(block, index).await;
        count_request("eth_getUncleByBlockHashAndIndex", result.is_ok());
        let uncle = result
            .map_err(transient)?
            .ok_or_else(|| StageError::InvalidInput(format!("uncle {index} of {block:?} not found")))?;
        header_from_rpc(uncle.header)
    }
}

/// Converts an RPC header into its primitive form.
pub fn header_from_rpc(header: alloy::rpc::types::Header) -> Result<Header, StageError> {
    Header::try_from(header)
        .map_err(|err| StageError::InvalidInput(format!("malformed header from rpc: {err}")))
}

/// Converts a full RPC block (with uncle headers fetched separately) into
/// the artifact block model.
pub fn block_from_rpc(
    block: RpcBlock,
    uncles: Vec<Header>,
) -> Result<crate::input::Block, StageError> {
    let header = header_from_rpc(block.header)?;
    let transactions = block
        .transactions
        .into_transactions()
        .map(|tx| {
            reth_primitives::TransactionSigned::try_from(tx)
                .map_err(|err| StageError::InvalidInput(format!("malformed transaction: {err}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(crate::input::Block {
        header,
        transactions,
        uncles,
        withdrawals: block.withdrawals.map(reth_primitives::Withdrawals::new),
    })
}
