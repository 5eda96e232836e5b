use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use alloy::providers::Provider;
use alloy::rpc::types::BlockTransactionsKind;
use alloy::transports::Transport;
use alloy_primitives::{Address, Bytes, B256};
use futures::{StreamExt, TryStreamExt};
use reth_primitives::Header;

use crate::chain;
use crate::evm::{instrumented, BlockProcessor, EthProcessor, ExecParams, RefDb, TrackingDb};
use crate::input::HeavyProverInput;
use crate::rpc::{block_from_rpc, ChainClient, RpcStateDb};
use crate::stages::StageError;

/// Remote proof, code and header fetches run this many requests in
/// parallel. Ordering does not matter: every fetch contributes to a set.
const FETCH_CONCURRENCY: usize = 16;

/// The preflight stage: execute the block against remote-backed state,
/// record every access, and collect the raw proofs, bytecodes and ancestor
/// headers into a [`HeavyProverInput`].
pub struct Preflighter<P, T> {
    client: Arc<ChainClient<P, T>>,
}

impl<P, T> Preflighter<P, T>
where
    P: Provider<T>,
    T: Transport + Clone,
{
    pub fn new(client: Arc<ChainClient<P, T>>) -> Self {
        Self { client }
    }

    pub async fn preflight(&self, block_number: u64) -> Result<HeavyProverInput, StageError> {
        let started = Instant::now();

        let chain_id = self.client.chain_id().await?;
        let chain_config = chain::config_for(chain_id)?;
        let chain_spec = chain::spec_from_config(&chain_config)?;

        let parent_number = block_number.checked_sub(1).ok_or_else(|| {
            StageError::InvalidInput("the genesis block has no pre-state to prove".to_owned())
        })?;

        let rpc_block = self
            .client
            .block(block_number.into(), BlockTransactionsKind::Full)
            .await?;
        let mut uncles = Vec::with_capacity(rpc_block.uncles.len());
        for index in 0..rpc_block.uncles.len() {
            uncles.push(
                self.client
                    .uncle(block_number.into(), index as u64)
                    .await?,
            );
        }
        let block = block_from_rpc(rpc_block, uncles)?;
        let recovered = block.recover_senders().ok_or_else(|| {
            StageError::InvalidInput("failed to recover transaction senders".to_owned())
        })?;

        // Execute against remote state, behind an access tracker.
        let rpc_db = RpcStateDb::new(self.client.clone(), parent_number);
        let tracker = TrackingDb::new(RefDb(&rpc_db));
        let processor = instrumented(EthProcessor, chain_id);
        let result = processor.process(ExecParams {
            chain_spec: chain_spec.clone(),
            block: &recovered,
            total_difficulty: chain::total_difficulty_for(&chain_spec, block.header.difficulty),
            db: RefDb(&tracker),
        })?;
        let record = tracker.into_record();

        // The post-state itself is discarded; only the touched, modified and
        // destructed sets survive into the proof fetches below.
        let mut accesses: BTreeMap<Address, BTreeSet<B256>> = record.accounts;
        accesses.entry(block.header.beneficiary).or_default();
        for withdrawal in block.withdrawals.iter().flat_map(|w| w.iter()) {
            accesses.entry(withdrawal.address).or_default();
        }

        let mut deletions: BTreeMap<Address, BTreeSet<B256>> = BTreeMap::new();
        for (address, account) in result.state.state.iter() {
            let slots = accesses.entry(*address).or_default();
            for (slot, value) in account.storage.iter() {
                let slot = B256::from(*slot);
                slots.insert(slot);
                if value.present_value.is_zero() && !value.previous_or_original_value.is_zero() {
                    deletions.entry(*address).or_default().insert(slot);
                }
            }
            if account.was_destroyed() || account.info.is_none() {
                deletions.entry(*address).or_default();
            }
        }

        let pre_state_proofs = self
            .fetch_proofs(accesses, parent_number)
            .await?;
        // Destructed accounts and cleared slots additionally need proofs of
        // absence against the post-state root, to support reconstructing the
        // post trie by subtraction.
        let post_state_proofs = self.fetch_proofs(deletions, block_number).await?;

        let codes = collect_codes(&record.code_hashes, rpc_db.known_codes())?;
        let ancestors = self
            .fetch_ancestors(parent_number, record.block_hashes.iter().min().copied())
            .await?;

        metrics::histogram!("preflight_duration_seconds").record(started.elapsed().as_secs_f64());
        tracing::info!(
            block = block_number,
            accounts = pre_state_proofs.len(),
            deletions = post_state_proofs.len(),
            codes = codes.len(),
            ancestors = ancestors.len(),
            "preflight collected state",
        );

        Ok(HeavyProverInput {
            chain_config,
            block,
            ancestors,
            codes,
            pre_state_proofs,
            post_state_proofs,
        })
    }

    async fn fetch_proofs(
        &self,
        accounts: BTreeMap<Address, BTreeSet<B256>>,
        block: u64,
    ) -> Result<Vec<alloy::rpc::types::EIP1186AccountProofResponse>, StageError> {
        futures::stream::iter(accounts.into_iter().map(|(address, slots)| {
            let client = self.client.clone();
            async move {
                client
                    .proof(address, slots.into_iter().collect(), block)
                    .await
            }
        }))
        .buffered(FETCH_CONCURRENCY)
        .try_collect()
        .await
    }

    async fn fetch_ancestors(
        &self,
        parent_number: u64,
        lowest_touched: Option<u64>,
    ) -> Result<Vec<Header>, StageError> {
        let lowest = lowest_touched.unwrap_or(parent_number).min(parent_number);
        let mut ancestors: Vec<Header> =
            futures::stream::iter((lowest..=parent_number).map(|number| {
                let client = self.client.clone();
                async move { client.header(number).await }
            }))
            .buffered(FETCH_CONCURRENCY)
            .try_collect()
            .await?;
        ancestors.sort_by(|a, b| b.number.cmp(&a.number));
        Ok(ancestors)
    }
}

fn collect_codes(
    observed: &BTreeSet<B256>,
    known: std::collections::HashMap<B256, revm::primitives::Bytecode>,
) -> Result<Vec<Bytes>, StageError> {
    observed
        .iter()
        .map(|hash| {
            known
                .get(hash)
                .map(|code| code.original_bytes())
                .ok_or_else(|| {
                    StageError::Internal(format!("code {hash} was observed but never fetched"))
                })
        })
        .collect()
}
