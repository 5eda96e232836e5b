use std::time::Instant;

use alloy_primitives::{Bloom, B256};
use prover_mpt::NodeBag;
use reth_primitives::proofs::calculate_receipt_root;
use reth_trie::HashedPostState;

use crate::chain;
use crate::evm::{
    build_code_map, instrumented, validate_ancestors, BlockProcessor, EthProcessor, ExecParams,
    RefDb, WitnessState,
};
use crate::input::ProverInput;
use crate::stages::StageError;

/// What a successful replay produced, all verified against the header.
#[derive(Clone, Debug)]
pub struct ExecutionReport {
    pub block_number: u64,
    pub state_root: B256,
    pub receipts_root: B256,
    pub gas_used: u64,
    pub logs_bloom: Bloom,
}

/// The execute stage: rebuild the in-memory state from a final artifact's
/// witness, replay the block, and verify every derived header field.
pub struct Executor;

impl Executor {
    pub fn new() -> Self {
        Self
    }

    pub fn execute(&self, input: &ProverInput) -> Result<ExecutionReport, StageError> {
        let started = Instant::now();

        let block = input
            .block()
            .ok_or_else(|| StageError::InvalidInput("prover input carries no block".to_owned()))?;
        let chain_spec = chain::spec_from_config(&input.chain_config)?;

        let parent = input
            .witness
            .ancestors
            .first()
            .ok_or_else(|| StageError::InvalidInput("witness carries no ancestors".to_owned()))?
            .clone();
        let ancestor_hashes = validate_ancestors(&block.header, &input.witness.ancestors)?;

        let mut bag = NodeBag::default();
        for node in &input.witness.state {
            bag.insert_node(node.to_vec());
        }
        let codes = build_code_map(&input.witness.codes)?;
        let state = WitnessState::new(bag, parent.state_root, codes, ancestor_hashes);

        let recovered = block.recover_senders().ok_or_else(|| {
            StageError::InvalidInput("failed to recover transaction senders".to_owned())
        })?;
        let processor = instrumented(EthProcessor, input.chain_config.chain_id);
        let result = processor
            .process(ExecParams {
                chain_spec: chain_spec.clone(),
                block: &recovered,
                total_difficulty: chain::total_difficulty_for(
                    &chain_spec,
                    block.header.difficulty,
                ),
                db: RefDb(&state),
            })
            .map_err(|err| match state.take_missing() {
                Some(missing) => missing.into_stage_error(),
                None => err,
            })?;

        // Post-state root.
        let post = HashedPostState::from_bundle_state(&result.state.state);
        let update = state.commit(&post).map_err(|err| match state.take_missing() {
            Some(missing) => missing.into_stage_error(),
            None => err,
        })?;
        if update.root != block.header.state_root {
            return Err(StageError::ReplayMismatch {
                field: "stateRoot",
                expected: block.header.state_root.to_string(),
                actual: update.root.to_string(),
            });
        }

        // Receipts root, gas used and logs bloom.
        let receipts_with_bloom: Vec<_> = result
            .receipts
            .iter()
            .map(|receipt| receipt.clone().with_bloom())
            .collect();
        let receipts_root = calculate_receipt_root(&receipts_with_bloom);
        if receipts_root != block.header.receipts_root {
            return Err(StageError::ReplayMismatch {
                field: "receiptsRoot",
                expected: block.header.receipts_root.to_string(),
                actual: receipts_root.to_string(),
            });
        }

        if result.gas_used != block.header.gas_used {
            return Err(StageError::ReplayMismatch {
                field: "gasUsed",
                expected: block.header.gas_used.to_string(),
                actual: result.gas_used.to_string(),
            });
        }

        let mut logs_bloom = Bloom::default();
        for receipt in &receipts_with_bloom {
            logs_bloom.accrue_bloom(&receipt.bloom);
        }
        if logs_bloom != block.header.logs_bloom {
            return Err(StageError::ReplayMismatch {
                field: "logsBloom",
                expected: format!("{:#x}", block.header.logs_bloom),
                actual: format!("{logs_bloom:#x}"),
            });
        }

        metrics::histogram!("execute_duration_seconds").record(started.elapsed().as_secs_f64());
        tracing::info!(
            block = block.number(),
            gas_used = result.gas_used,
            "replay verified against header",
        );

        Ok(ExecutionReport {
            block_number: block.number(),
            state_root: update.root,
            receipts_root,
            gas_used: result.gas_used,
            logs_bloom,
        })
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{Block, Witness};
    use alloy_genesis::ChainConfig;
    use reth_primitives::Header;

    fn minimal_input() -> ProverInput {
        let parent = Header {
            number: 41,
            gas_limit: 30_000_000,
            ..Default::default()
        };
        let header = Header {
            number: 42,
            parent_hash: parent.hash_slow(),
            gas_limit: 30_000_000,
            ..Default::default()
        };
        ProverInput::new(
            ChainConfig {
                chain_id: 1337,
                london_block: Some(0),
                ..Default::default()
            },
            Block {
                header,
                ..Default::default()
            },
            Witness {
                ancestors: vec![parent],
                ..Default::default()
            },
            None,
        )
    }

    #[test]
    fn missing_block_is_invalid_input() {
        let mut input = minimal_input();
        input.blocks.clear();
        assert!(matches!(
            Executor::new().execute(&input).unwrap_err(),
            StageError::InvalidInput(_)
        ));
    }

    #[test]
    fn missing_ancestors_is_invalid_input() {
        let mut input = minimal_input();
        input.witness.ancestors.clear();
        assert!(matches!(
            Executor::new().execute(&input).unwrap_err(),
            StageError::InvalidInput(_)
        ));
    }

    #[test]
    fn broken_ancestor_link_is_proof_invalid() {
        let mut input = minimal_input();
        input.witness.ancestors[0].parent_hash = alloy_primitives::B256::repeat_byte(0xbe);
        input.blocks[0].header.parent_hash = alloy_primitives::B256::repeat_byte(0xef);
        assert!(matches!(
            Executor::new().execute(&input).unwrap_err(),
            StageError::ProofInvalid(_)
        ));
    }
}
