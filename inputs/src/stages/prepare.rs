use std::collections::BTreeMap;
use std::time::Instant;

use alloy::rpc::types::{AccessList, AccessListItem, EIP1186AccountProofResponse};
use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use prover_mpt::{verify, NodeBag, StateAccount, EMPTY_ROOT_HASH};
use reth_trie::HashedPostState;

use crate::chain;
use crate::evm::{
    build_code_map, instrumented, validate_ancestors, BlockProcessor, EthProcessor, ExecParams,
    RefDb, TrackingDb, WitnessState,
};
use crate::include::Include;
use crate::input::{
    Account, AccountState, Extra, HeavyProverInput, ProverInput, StateDiff, StorageDiff, Witness,
};
use crate::stages::StageError;

/// The prepare stage: re-execute the block against state seeded purely from
/// the recorded proofs, and distill the minimal witness that makes the
/// re-execution reach the block's post-state root.
pub struct Preparer {
    include: Include,
}

impl Preparer {
    pub fn new(include: Include) -> Self {
        Self { include }
    }

    pub fn prepare(&self, input: &HeavyProverInput) -> Result<ProverInput, StageError> {
        let started = Instant::now();
        let chain_spec = chain::spec_from_config(&input.chain_config)?;

        let parent = input
            .parent()
            .ok_or_else(|| StageError::InvalidInput("no ancestor headers".to_owned()))?
            .clone();
        let ancestor_hashes = validate_ancestors(&input.block.header, &input.ancestors)?;

        verify_proofs(parent.state_root, &input.pre_state_proofs)?;

        // Seed the content-addressed bag: every pre-state proof node, plus
        // the short-node variants from the post-state proofs that deletions
        // need when a branch collapses.
        let mut bag = NodeBag::default();
        for proof in &input.pre_state_proofs {
            bag.insert_proof(&proof.account_proof);
            for storage_proof in &proof.storage_proof {
                bag.insert_proof(&storage_proof.proof);
            }
        }
        for proof in &input.post_state_proofs {
            bag.insert_short_node_variants(&proof.account_proof)?;
            for storage_proof in &proof.storage_proof {
                bag.insert_short_node_variants(&storage_proof.proof)?;
            }
        }

        let codes = build_code_map(&input.codes)?;
        let state = WitnessState::new(bag, parent.state_root, codes.clone(), ancestor_hashes);
        let tracker = TrackingDb::new(RefDb(&state));

        let recovered = input.block.recover_senders().ok_or_else(|| {
            StageError::InvalidInput("failed to recover transaction senders".to_owned())
        })?;
        let processor = instrumented(EthProcessor, input.chain_config.chain_id);
        let result = processor
            .process(ExecParams {
                chain_spec: chain_spec.clone(),
                block: &recovered,
                total_difficulty: chain::total_difficulty_for(
                    &chain_spec,
                    input.block.header.difficulty,
                ),
                db: RefDb(&tracker),
            })
            .map_err(|err| match state.take_missing() {
                Some(missing) => missing.into_stage_error(),
                None => err,
            })?;

        // Commit the overlay and assert the post-state root. A mismatch here
        // means the heavy input itself is unsound.
        let post = HashedPostState::from_bundle_state(&result.state.state);
        let update = state.commit(&post).map_err(|err| match state.take_missing() {
            Some(missing) => missing.into_stage_error(),
            None => err,
        })?;
        if update.root != input.block.header.state_root {
            return Err(StageError::PostStateMismatch {
                expected: input.block.header.state_root,
                actual: update.root,
            });
        }

        let witness = self.build_witness(input, &state, &parent)?;
        let extra = self.build_extra(input, &tracker.into_record(), &result.state, update.committed);

        metrics::histogram!("prepare_duration_seconds").record(started.elapsed().as_secs_f64());
        metrics::counter!("witness_nodes_total").increment(witness.state.len() as u64);
        metrics::counter!("witness_bytes_total").increment(witness.state_bytes() as u64);
        tracing::info!(
            block = input.block.number(),
            nodes = witness.state.len(),
            bytes = witness.state_bytes(),
            codes = witness.codes.len(),
            ancestors = witness.ancestors.len(),
            "derived minimal witness",
        );

        Ok(ProverInput::new(
            input.chain_config.clone(),
            input.block.clone(),
            witness,
            extra,
        ))
    }

    /// The minimal witness: exactly the bag nodes the execution and the
    /// post-root computation resolved, the ancestors down to the lowest
    /// `BLOCKHASH` target, and the bytecodes whose hash was observed.
    /// Nodes that were fetched but never resolved are left out.
    fn build_witness(
        &self,
        input: &HeavyProverInput,
        state: &WitnessState,
        parent: &reth_primitives::Header,
    ) -> Result<Witness, StageError> {
        let bag = state.bag();
        let mut nodes = Vec::new();
        for hash in bag.touched() {
            let bytes = bag.get(&hash).ok_or_else(|| {
                StageError::Internal(format!("touched node {hash} has no bytes"))
            })?;
            nodes.push(bytes.clone());
        }

        let lowest = state.lowest_ancestor_used().unwrap_or(parent.number);
        let ancestors = input
            .ancestors
            .iter()
            .filter(|header| header.number >= lowest)
            .cloned()
            .collect();

        let code_map = build_code_map(&input.codes)?;
        let codes = state
            .used_codes()
            .into_iter()
            .filter_map(|hash| code_map.get(&hash).map(|code| code.original_bytes()))
            .collect();

        Ok(Witness {
            state: nodes,
            ancestors,
            codes,
        })
    }

    fn build_extra(
        &self,
        input: &HeavyProverInput,
        record: &crate::evm::AccessRecord,
        bundle: &revm::db::states::BundleState,
        committed: Vec<Bytes>,
    ) -> Option<Extra> {
        if self.include == Include::NONE {
            return None;
        }

        let mut extra = Extra::default();

        if self.include.contains(Include::ACCESS_LIST) {
            let items = record
                .accounts
                .iter()
                .map(|(address, slots)| AccessListItem {
                    address: *address,
                    storage_keys: slots.iter().copied().collect(),
                })
                .collect();
            extra.access_list = Some(AccessList(items));
        }

        if self.include.contains(Include::PRE_STATE) {
            extra.pre_state = Some(pre_state_annex(input));
        }

        if self.include.contains(Include::STATE_DIFFS) {
            extra.state_diffs = Some(state_diffs_annex(bundle));
        }

        if self.include.contains(Include::COMMITTED) {
            extra.committed = Some(committed);
        }

        (!extra.is_empty()).then_some(extra)
    }
}

/// Verifies every account and storage proof against the pre-state root.
fn verify_proofs(
    state_root: B256,
    proofs: &[EIP1186AccountProofResponse],
) -> Result<(), StageError> {
    for proof in proofs {
        let key = keccak256(proof.address);
        let proven = verify(state_root, key, &proof.account_proof).map_err(|err| {
            StageError::ProofInvalid(format!("account proof for {}: {err}", proof.address))
        })?;

        match proven {
            Some(encoded) => {
                let account: StateAccount =
                    alloy_rlp::decode_exact(&encoded).map_err(|err| {
                        StageError::ProofInvalid(format!(
                            "account leaf for {}: {err}",
                            proof.address
                        ))
                    })?;
                let claimed = StateAccount {
                    nonce: proof.nonce,
                    balance: proof.balance,
                    storage_root: proof.storage_hash,
                    code_hash: proof.code_hash,
                };
                if account != claimed {
                    return Err(StageError::ProofInvalid(format!(
                        "account proof for {} proves a different account record",
                        proof.address
                    )));
                }
            }
            None => {
                // Proven absence; nothing further to cross-check.
            }
        }

        for storage_proof in &proof.storage_proof {
            let slot = storage_proof.key.0;
            let value = verify(proof.storage_hash, keccak256(slot), &storage_proof.proof)
                .map_err(|err| {
                    StageError::ProofInvalid(format!(
                        "storage proof for {} slot {slot}: {err}",
                        proof.address
                    ))
                })?;
            let proven_value = match value {
                Some(encoded) => alloy_rlp::decode_exact::<U256>(&encoded).map_err(|err| {
                    StageError::ProofInvalid(format!("storage leaf payload: {err}"))
                })?,
                None => U256::ZERO,
            };
            if proven_value != storage_proof.value {
                return Err(StageError::ProofInvalid(format!(
                    "storage proof for {} slot {slot} proves {proven_value}, rpc claimed {}",
                    proof.address, storage_proof.value
                )));
            }
        }
    }
    Ok(())
}

fn pre_state_annex(input: &HeavyProverInput) -> BTreeMap<Address, AccountState> {
    let code_by_hash: BTreeMap<B256, &Bytes> = input
        .codes
        .iter()
        .map(|code| (keccak256(code), code))
        .collect();

    input
        .pre_state_proofs
        .iter()
        .map(|proof| {
            let storage = proof
                .storage_proof
                .iter()
                .map(|sp| (sp.key.0, B256::from(sp.value)))
                .collect();
            let state = AccountState {
                balance: proof.balance,
                code_hash: proof.code_hash,
                code: code_by_hash.get(&proof.code_hash).map(|c| (*c).clone()),
                nonce: proof.nonce,
                storage_hash: proof.storage_hash,
                storage,
            };
            (proof.address, state)
        })
        .collect()
}

fn state_diffs_annex(bundle: &revm::db::states::BundleState) -> Vec<StateDiff> {
    let accounts: BTreeMap<&Address, _> = bundle.state.iter().collect();
    accounts
        .into_iter()
        .map(|(address, account)| {
            let storage: BTreeMap<&U256, _> = account.storage.iter().collect();
            StateDiff {
                address: *address,
                pre_account: account.original_info.as_ref().map(account_record),
                post_account: account.info.as_ref().map(account_record),
                storage: storage
                    .into_iter()
                    .map(|(slot, value)| StorageDiff {
                        slot: B256::from(*slot),
                        pre_value: B256::from(value.previous_or_original_value),
                        post_value: B256::from(value.present_value),
                    })
                    .collect(),
            }
        })
        .collect()
}

fn account_record(info: &revm::primitives::AccountInfo) -> Account {
    Account {
        balance: info.balance,
        code_hash: info.code_hash,
        nonce: info.nonce,
        // The bundle does not carry storage roots; the canonical empty root
        // stands in, matching accounts with untouched storage.
        storage_hash: EMPTY_ROOT_HASH,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prover_mpt::{PartialTrie, KECCAK_EMPTY};

    /// Builds a tiny account trie and an RPC-shaped proof for one account.
    fn proof_fixture() -> (B256, EIP1186AccountProofResponse) {
        let address = Address::repeat_byte(0x11);
        let account = StateAccount {
            nonce: 5,
            balance: U256::from(1_000u64),
            storage_root: EMPTY_ROOT_HASH,
            code_hash: KECCAK_EMPTY,
        };

        let bag = NodeBag::default();
        let mut trie = PartialTrie::empty();
        trie.insert(keccak256(address), alloy_rlp::encode(account), &bag)
            .unwrap();
        // Neighbors so the proof has depth.
        for i in 0u8..8 {
            trie.insert(
                keccak256(Address::repeat_byte(i)),
                alloy_rlp::encode(StateAccount::default()),
                &bag,
            )
            .unwrap();
        }
        let root = trie.root().unwrap();

        let mut proof_bag = NodeBag::default();
        for (_, rlp) in trie.nodes().unwrap() {
            proof_bag.insert_node(rlp);
        }
        let account_proof = prover_mpt::prove(root, keccak256(address), &proof_bag).unwrap();

        let response = EIP1186AccountProofResponse {
            address,
            balance: account.balance,
            nonce: account.nonce,
            code_hash: account.code_hash,
            storage_hash: account.storage_root,
            account_proof,
            storage_proof: vec![],
        };
        (root, response)
    }

    #[test]
    fn valid_proofs_pass() {
        let (root, proof) = proof_fixture();
        verify_proofs(root, &[proof]).unwrap();
    }

    #[test]
    fn mismatched_account_record_fails() {
        let (root, mut proof) = proof_fixture();
        proof.balance = U256::from(999u64);
        let err = verify_proofs(root, &[proof]).unwrap_err();
        assert!(matches!(err, StageError::ProofInvalid(_)));
    }

    #[test]
    fn tampered_proof_node_fails() {
        let (root, mut proof) = proof_fixture();
        let last = proof.account_proof.len() - 1;
        let mut bytes = proof.account_proof[last].to_vec();
        bytes[5] ^= 0x01;
        proof.account_proof[last] = bytes.into();
        let err = verify_proofs(root, &[proof]).unwrap_err();
        assert!(matches!(err, StageError::ProofInvalid(_)));
    }
}
