//! The prover input data model.
//!
//! [`HeavyProverInput`] is the intermediate artifact produced by the
//! preflight stage: raw RPC proofs, bytecodes and ancestor headers, heavy
//! but self-contained. [`ProverInput`] is the final artifact: the block plus
//! the minimal witness sufficient to re-execute it offline.

use std::collections::BTreeMap;

use alloy::rpc::types::{AccessList, EIP1186AccountProofResponse};
use alloy_genesis::ChainConfig;
use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use reth_primitives::{
    Block as PrimitiveBlock, BlockWithSenders, Header, TransactionSigned, Withdrawals,
};
use serde::{Deserialize, Serialize};

/// Version identifier stamped into every [`ProverInput`]; bump on breaking
/// schema changes (mirrored by the protobuf schema).
pub const PROVER_INPUT_VERSION: &str = "1.0";

/// An EVM block: header, body transactions, uncle headers and withdrawals.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub header: Header,
    pub transactions: Vec<TransactionSigned>,
    pub uncles: Vec<Header>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub withdrawals: Option<Withdrawals>,
}

impl Block {
    pub fn number(&self) -> u64 {
        self.header.number
    }

    /// The block hash, computed from the header.
    pub fn hash(&self) -> B256 {
        self.header.hash_slow()
    }

    /// Converts into the primitive block type the executor consumes.
    pub fn to_primitive(&self) -> PrimitiveBlock {
        PrimitiveBlock {
            header: self.header.clone(),
            body: self.transactions.clone(),
            ommers: self.uncles.clone(),
            withdrawals: self.withdrawals.clone(),
            requests: None,
        }
    }

    /// Recovers transaction senders, which the executor needs up front.
    pub fn recover_senders(&self) -> Option<BlockWithSenders> {
        self.to_primitive().with_recovered_senders()
    }
}

impl From<PrimitiveBlock> for Block {
    fn from(block: PrimitiveBlock) -> Self {
        Self {
            header: block.header,
            transactions: block.body,
            uncles: block.ommers,
            withdrawals: block.withdrawals,
        }
    }
}

/// The minimal data needed to re-execute a block without network access.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Witness {
    /// Partial pre-state: RLP-encoded MPT nodes, sorted by hash.
    pub state: Vec<Bytes>,
    /// Chain of headers from the parent down to the earliest `BLOCKHASH`
    /// target, by descending number.
    pub ancestors: Vec<Header>,
    /// Contract bytecodes whose hash was observed during execution, sorted
    /// by code hash.
    pub codes: Vec<Bytes>,
}

impl Witness {
    /// Applies the canonical ordering: nodes by hash, codes by hash,
    /// ancestors by descending block number, duplicates removed.
    pub fn canonicalize(&mut self) {
        self.state.sort_by_key(|node| keccak256(node));
        self.state.dedup();
        self.codes.sort_by_key(|code| keccak256(code));
        self.codes.dedup();
        self.ancestors.sort_by(|a, b| b.number.cmp(&a.number));
        self.ancestors.dedup_by_key(|header| header.number);
    }

    /// Total byte size of the state nodes, for metrics.
    pub fn state_bytes(&self) -> usize {
        self.state.iter().map(|node| node.len()).sum()
    }
}

/// The final artifact handed to a prover or verifier.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProverInput {
    pub version: String,
    pub blocks: Vec<Block>,
    pub witness: Witness,
    pub chain_config: ChainConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<Extra>,
}

impl ProverInput {
    pub fn new(
        chain_config: ChainConfig,
        block: Block,
        mut witness: Witness,
        extra: Option<Extra>,
    ) -> Self {
        witness.canonicalize();
        Self {
            version: PROVER_INPUT_VERSION.to_owned(),
            blocks: vec![block],
            witness,
            chain_config,
            extra,
        }
    }

    /// The single block this input proves.
    pub fn block(&self) -> Option<&Block> {
        self.blocks.first()
    }
}

/// Optional debug annex of a [`ProverInput`], gated by the inclusion mask.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extra {
    /// Addresses and storage slots accessed during execution.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_list: Option<AccessList>,
    /// Pre-state of accounts changed by the block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_state: Option<BTreeMap<Address, AccountState>>,
    /// Per-account state differences introduced by the block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_diffs: Option<Vec<StateDiff>>,
    /// Trie nodes created while committing the post-state.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub committed: Option<Vec<Bytes>>,
}

impl Extra {
    pub fn is_empty(&self) -> bool {
        self.access_list.is_none()
            && self.pre_state.is_none()
            && self.state_diffs.is_none()
            && self.committed.is_none()
    }
}

/// A point-in-time account record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub balance: U256,
    pub code_hash: B256,
    pub nonce: u64,
    pub storage_hash: B256,
}

/// An account's pre-state, with the storage values read from it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountState {
    pub balance: U256,
    pub code_hash: B256,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<Bytes>,
    pub nonce: u64,
    pub storage_hash: B256,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub storage: BTreeMap<B256, B256>,
}

/// The difference execution made to one account.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDiff {
    pub address: Address,
    /// `None` when the account was created by this block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_account: Option<Account>,
    /// `None` when the account was destructed by this block.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_account: Option<Account>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub storage: Vec<StorageDiff>,
}

/// The difference execution made to one storage slot.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageDiff {
    #[serde(rename = "storageKey")]
    pub slot: B256,
    pub pre_value: B256,
    pub post_value: B256,
}

/// The heavy intermediate artifact produced by preflight: everything the
/// prepare stage needs, in raw RPC form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeavyProverInput {
    pub chain_config: ChainConfig,
    pub block: Block,
    /// Headers from `block.parent` down to the earliest `BLOCKHASH` target,
    /// by descending number.
    pub ancestors: Vec<Header>,
    /// Bytecode of every code hash observed during execution.
    pub codes: Vec<Bytes>,
    /// A proof per touched account (with its touched slots) against the
    /// parent state root.
    pub pre_state_proofs: Vec<EIP1186AccountProofResponse>,
    /// Proofs against the post-state root for destructed accounts and
    /// deleted slots.
    pub post_state_proofs: Vec<EIP1186AccountProofResponse>,
}

impl HeavyProverInput {
    /// The parent header, which every pre-state proof verifies against.
    pub fn parent(&self) -> Option<&Header> {
        self.ancestors.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(number: u64) -> Header {
        Header {
            number,
            gas_limit: 30_000_000,
            ..Default::default()
        }
    }

    #[test]
    fn witness_canonicalization_sorts_and_dedups() {
        let node_a = Bytes::from_static(b"node a");
        let node_b = Bytes::from_static(b"node b");
        let (first, second) = if keccak256(&node_a) < keccak256(&node_b) {
            (node_a.clone(), node_b.clone())
        } else {
            (node_b.clone(), node_a.clone())
        };

        let mut witness = Witness {
            state: vec![second.clone(), first.clone(), second.clone()],
            ancestors: vec![header(5), header(7), header(5), header(6)],
            codes: vec![],
        };
        witness.canonicalize();

        assert_eq!(witness.state, vec![first, second]);
        let numbers: Vec<u64> = witness.ancestors.iter().map(|h| h.number).collect();
        assert_eq!(numbers, vec![7, 6, 5]);
    }

    #[test]
    fn prover_input_json_round_trips() {
        let input = ProverInput::new(
            ChainConfig {
                chain_id: 1,
                ..Default::default()
            },
            Block {
                header: header(42),
                ..Default::default()
            },
            Witness {
                state: vec![Bytes::from_static(b"some node")],
                ancestors: vec![header(41)],
                codes: vec![Bytes::from_static(b"code")],
            },
            None,
        );

        let encoded = serde_json::to_string(&input).unwrap();
        let decoded: ProverInput = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, input);
        assert_eq!(decoded.version, PROVER_INPUT_VERSION);
        assert_eq!(decoded.block().unwrap().number(), 42);
    }

    #[test]
    fn extra_annex_is_omitted_when_absent() {
        let input = ProverInput::new(
            ChainConfig::default(),
            Block::default(),
            Witness::default(),
            None,
        );
        let encoded = serde_json::to_string(&input).unwrap();
        assert!(!encoded.contains("extra"));

        let with_extra = ProverInput::new(
            ChainConfig::default(),
            Block::default(),
            Witness::default(),
            Some(Extra {
                committed: Some(vec![Bytes::from_static(b"node")]),
                ..Default::default()
            }),
        );
        let encoded = serde_json::to_string(&with_extra).unwrap();
        assert!(encoded.contains("committed"));
    }

    #[test]
    fn heavy_input_json_round_trips() {
        let heavy = HeavyProverInput {
            chain_config: ChainConfig {
                chain_id: 1,
                ..Default::default()
            },
            block: Block {
                header: header(42),
                ..Default::default()
            },
            ancestors: vec![header(41), header(40)],
            codes: vec![Bytes::from_static(b"code")],
            pre_state_proofs: vec![],
            post_state_proofs: vec![],
        };

        let encoded = serde_json::to_vec(&heavy).unwrap();
        let decoded: HeavyProverInput = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(decoded, heavy);
        assert_eq!(decoded.parent().unwrap().number, 41);
    }
}
