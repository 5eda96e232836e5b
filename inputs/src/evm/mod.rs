//! The execution seam: a thin wrapper over the block-level state-transition
//! function, pluggable over any read-only state database.

mod tracker;
mod witness;

pub use tracker::{AccessRecord, TrackingDb};
pub use witness::{build_code_map, validate_ancestors, MissingAccess, StateUpdate, WitnessState};

use std::sync::Arc;

use alloy_primitives::{Address, B256, U256};
use reth_chainspec::ChainSpec;
use reth_evm::execute::{BlockExecutorProvider, Executor};
use reth_evm_ethereum::execute::EthExecutorProvider;
use reth_primitives::{BlockWithSenders, Receipt, Request};
use reth_storage_errors::provider::ProviderError;
use revm::db::states::BundleState;
use revm::db::{DatabaseRef, WrapDatabaseRef};
use revm::primitives::{AccountInfo, Bytecode};

use crate::stages::StageError;

/// Everything a single block execution needs.
pub struct ExecParams<'a, DB> {
    pub chain_spec: Arc<ChainSpec>,
    pub block: &'a BlockWithSenders,
    pub total_difficulty: U256,
    pub db: DB,
}

/// The outcome of a block execution, before any state commitment.
pub struct ProcessResult {
    pub state: BundleState,
    pub receipts: Vec<Receipt>,
    pub requests: Vec<Request>,
    pub gas_used: u64,
}

/// A block-level state-transition function over a pluggable state database.
pub trait BlockProcessor {
    fn process<DB>(&self, params: ExecParams<'_, DB>) -> Result<ProcessResult, StageError>
    where
        DB: DatabaseRef<Error = ProviderError>;
}

/// The Ethereum state-transition function.
#[derive(Clone, Copy, Debug, Default)]
pub struct EthProcessor;

impl BlockProcessor for EthProcessor {
    fn process<DB>(&self, params: ExecParams<'_, DB>) -> Result<ProcessResult, StageError>
    where
        DB: DatabaseRef<Error = ProviderError>,
    {
        let executor = EthExecutorProvider::ethereum(params.chain_spec.clone())
            .executor(WrapDatabaseRef(params.db));
        let output = executor
            .execute((params.block, params.total_difficulty).into())
            .map_err(|err| StageError::Internal(format!("block execution failed: {err}")))?;

        Ok(ProcessResult {
            state: output.state,
            receipts: output.receipts,
            requests: output.requests,
            gas_used: output.gas_used,
        })
    }
}

/// Attaches `chain.id`, `block.number` and `block.hash` to everything the
/// wrapped processor emits.
pub struct Tagged<P> {
    inner: P,
    chain_id: u64,
}

/// Logs execution start and outcome around the wrapped processor.
pub struct Logged<P> {
    inner: P,
}

/// The standard decoration: tagging inside, logging outside.
pub fn instrumented<P: BlockProcessor>(processor: P, chain_id: u64) -> Logged<Tagged<P>> {
    Logged {
        inner: Tagged {
            inner: processor,
            chain_id,
        },
    }
}

impl<P: BlockProcessor> BlockProcessor for Tagged<P> {
    fn process<DB>(&self, params: ExecParams<'_, DB>) -> Result<ProcessResult, StageError>
    where
        DB: DatabaseRef<Error = ProviderError>,
    {
        let span = tracing::info_span!(
            "block_execution",
            chain.id = self.chain_id,
            block.number = params.block.number,
            block.hash = %params.block.header.hash_slow(),
        );
        let _entered = span.enter();
        self.inner.process(params)
    }
}

impl<P: BlockProcessor> BlockProcessor for Logged<P> {
    fn process<DB>(&self, params: ExecParams<'_, DB>) -> Result<ProcessResult, StageError>
    where
        DB: DatabaseRef<Error = ProviderError>,
    {
        tracing::info!(txs = params.block.body.len(), "executing block");
        match self.inner.process(params) {
            Ok(result) => {
                tracing::info!(gas_used = result.gas_used, "block execution succeeded");
                Ok(result)
            }
            Err(err) => {
                tracing::error!(%err, "block execution failed");
                Err(err)
            }
        }
    }
}

/// Borrows a [`DatabaseRef`] as a database of its own.
pub struct RefDb<'a, D>(pub &'a D);

impl<D: DatabaseRef> DatabaseRef for RefDb<'_, D> {
    type Error = D::Error;

    fn basic_ref(&self, address: Address) -> Result<Option<AccountInfo>, Self::Error> {
        self.0.basic_ref(address)
    }

    fn code_by_hash_ref(&self, code_hash: B256) -> Result<Bytecode, Self::Error> {
        self.0.code_by_hash_ref(code_hash)
    }

    fn storage_ref(&self, address: Address, index: U256) -> Result<U256, Self::Error> {
        self.0.storage_ref(address, index)
    }

    fn block_hash_ref(&self, number: u64) -> Result<B256, Self::Error> {
        self.0.block_hash_ref(number)
    }
}
