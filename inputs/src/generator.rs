//! The pipeline orchestrator: wires the three stages to the artifact
//! stores, one flow per (chain, block).

use std::sync::Arc;

use alloy::providers::Provider;
use alloy::rpc::types::BlockNumberOrTag;
use alloy::transports::Transport;

use crate::include::Include;
use crate::rpc::ChainClient;
use crate::stages::{ExecutionReport, Executor, Preflighter, Preparer, StageError};
use crate::stores::{HeavyProverInputStore, ProverInputStore};

/// Generates, persists and verifies prover inputs.
///
/// Stages always hand artifacts to each other through the stores, never in
/// memory: a store write completes before the next stage begins, so each
/// stage is independently re-runnable and the slow archive-RPC work is paid
/// once.
pub struct Generator<P, T> {
    client: Option<Arc<ChainClient<P, T>>>,
    chain_id: Option<u64>,
    include: Include,
    heavy_store: HeavyProverInputStore,
    input_store: ProverInputStore,
}

impl<P, T> Generator<P, T>
where
    P: Provider<T>,
    T: Transport + Clone,
{
    pub fn new(
        client: Option<Arc<ChainClient<P, T>>>,
        chain_id: Option<u64>,
        include: Include,
        heavy_store: HeavyProverInputStore,
        input_store: ProverInputStore,
    ) -> Self {
        Self {
            client,
            chain_id,
            include,
            heavy_store,
            input_store,
        }
    }

    /// Resolves the chain id, preferring the remote node's answer over the
    /// configured one. Must be called before any stage.
    pub async fn start(&mut self) -> Result<(), StageError> {
        if let Some(client) = &self.client {
            let chain_id = client.chain_id().await?;
            if let Some(configured) = self.chain_id {
                if configured != chain_id {
                    return Err(StageError::InvalidInput(format!(
                        "configured chain id {configured} but the node reports {chain_id}"
                    )));
                }
            }
            self.chain_id = Some(chain_id);
        }
        if self.chain_id.is_none() {
            return Err(StageError::InvalidInput(
                "no chain configured: provide --chain-rpc-url or --chain-id".to_owned(),
            ));
        }
        Ok(())
    }

    fn chain_id(&self) -> Result<u64, StageError> {
        self.chain_id
            .ok_or_else(|| StageError::InvalidInput("generator was not started".to_owned()))
    }

    fn client(&self) -> Result<&Arc<ChainClient<P, T>>, StageError> {
        self.client.as_ref().ok_or_else(|| {
            StageError::InvalidInput("this stage requires --chain-rpc-url".to_owned())
        })
    }

    async fn resolve(&self, block: BlockNumberOrTag) -> Result<u64, StageError> {
        match block {
            BlockNumberOrTag::Number(number) => Ok(number),
            tag => self.client()?.resolve_number(tag).await,
        }
    }

    /// Runs the full pipeline for one block.
    pub async fn generate(
        &self,
        block: BlockNumberOrTag,
    ) -> Result<ExecutionReport, StageError> {
        let number = self.preflight(block).await?;
        self.prepare(BlockNumberOrTag::Number(number)).await?;
        self.execute(BlockNumberOrTag::Number(number)).await
    }

    /// Executes the block against remote state and persists the heavy
    /// input. Returns the resolved block number.
    pub async fn preflight(&self, block: BlockNumberOrTag) -> Result<u64, StageError> {
        let number = self.resolve(block).await?;
        let preflighter = Preflighter::new(self.client()?.clone());
        let heavy = preflighter.preflight(number).await?;
        self.heavy_store.store(&heavy).await?;
        Ok(number)
    }

    /// Derives and persists the final prover input from a stored heavy
    /// input.
    pub async fn prepare(&self, block: BlockNumberOrTag) -> Result<(), StageError> {
        let number = self.resolve(block).await?;
        let heavy = self.heavy_store.load(self.chain_id()?, number).await?;
        let input = Preparer::new(self.include).prepare(&heavy)?;
        self.input_store.store(&input).await
    }

    /// Replays a stored prover input and verifies it against the header.
    pub async fn execute(&self, block: BlockNumberOrTag) -> Result<ExecutionReport, StageError> {
        let number = self.resolve(block).await?;
        let input = self.input_store.load(self.chain_id()?, number).await?;
        Executor::new().execute(&input)
    }
}
