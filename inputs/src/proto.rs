//! Protobuf mirror of the JSON artifact schema.
//!
//! The message layout follows the JSON one field for field; hashes and
//! bloom filters are fixed-width bytes, big integers are 32-byte big-endian,
//! transactions are their canonical EIP-2718 envelopes, and the chain config
//! (a geth-defined JSON object) rides along verbatim. The schema is
//! versioned through the artifact's top-level `version` field.

use alloy_primitives::{Address, Bloom, Bytes, B256, U256};
use prost::Message;
use reth_primitives::TransactionSigned;

use crate::input;
use crate::stages::StageError;

#[derive(Clone, PartialEq, Message)]
pub struct ProverInput {
    #[prost(string, tag = "1")]
    pub version: String,
    #[prost(message, repeated, tag = "2")]
    pub blocks: Vec<Block>,
    #[prost(message, optional, tag = "3")]
    pub witness: Option<Witness>,
    /// The geth-style chain config as canonical JSON.
    #[prost(bytes = "vec", tag = "4")]
    pub chain_config: Vec<u8>,
    /// The optional debug annex as canonical JSON.
    #[prost(bytes = "vec", optional, tag = "5")]
    pub extra: Option<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Block {
    #[prost(message, optional, tag = "1")]
    pub header: Option<Header>,
    /// EIP-2718 transaction envelopes.
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub transactions: Vec<Vec<u8>>,
    #[prost(message, repeated, tag = "3")]
    pub uncles: Vec<Header>,
    #[prost(message, repeated, tag = "4")]
    pub withdrawals: Vec<Withdrawal>,
    /// Distinguishes "no withdrawals list" (pre-Shanghai) from an empty one.
    #[prost(bool, tag = "5")]
    pub has_withdrawals: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct Witness {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub state: Vec<Vec<u8>>,
    #[prost(message, repeated, tag = "2")]
    pub ancestors: Vec<Header>,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub codes: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Header {
    #[prost(bytes = "vec", tag = "1")]
    pub parent_hash: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub ommers_hash: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub beneficiary: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub state_root: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub transactions_root: Vec<u8>,
    #[prost(bytes = "vec", tag = "6")]
    pub receipts_root: Vec<u8>,
    #[prost(bytes = "vec", optional, tag = "7")]
    pub withdrawals_root: Option<Vec<u8>>,
    #[prost(bytes = "vec", tag = "8")]
    pub logs_bloom: Vec<u8>,
    /// 32-byte big-endian.
    #[prost(bytes = "vec", tag = "9")]
    pub difficulty: Vec<u8>,
    #[prost(uint64, tag = "10")]
    pub number: u64,
    #[prost(uint64, tag = "11")]
    pub gas_limit: u64,
    #[prost(uint64, tag = "12")]
    pub gas_used: u64,
    #[prost(uint64, tag = "13")]
    pub timestamp: u64,
    #[prost(bytes = "vec", tag = "14")]
    pub mix_hash: Vec<u8>,
    #[prost(uint64, tag = "15")]
    pub nonce: u64,
    #[prost(uint64, optional, tag = "16")]
    pub base_fee_per_gas: Option<u64>,
    #[prost(uint64, optional, tag = "17")]
    pub blob_gas_used: Option<u64>,
    #[prost(uint64, optional, tag = "18")]
    pub excess_blob_gas: Option<u64>,
    #[prost(bytes = "vec", optional, tag = "19")]
    pub parent_beacon_block_root: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "20")]
    pub requests_root: Option<Vec<u8>>,
    #[prost(bytes = "vec", tag = "21")]
    pub extra_data: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct Withdrawal {
    #[prost(uint64, tag = "1")]
    pub index: u64,
    #[prost(uint64, tag = "2")]
    pub validator_index: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub address: Vec<u8>,
    #[prost(uint64, tag = "4")]
    pub amount: u64,
}

fn bad(field: &str, err: impl std::fmt::Display) -> StageError {
    StageError::InvalidInput(format!("protobuf field {field}: {err}"))
}

fn b256(bytes: &[u8], field: &str) -> Result<B256, StageError> {
    B256::try_from(bytes).map_err(|_| bad(field, format!("expected 32 bytes, got {}", bytes.len())))
}

fn address(bytes: &[u8], field: &str) -> Result<Address, StageError> {
    Address::try_from(bytes)
        .map_err(|_| bad(field, format!("expected 20 bytes, got {}", bytes.len())))
}

impl From<&reth_primitives::Header> for Header {
    fn from(header: &reth_primitives::Header) -> Self {
        Self {
            parent_hash: header.parent_hash.to_vec(),
            ommers_hash: header.ommers_hash.to_vec(),
            beneficiary: header.beneficiary.to_vec(),
            state_root: header.state_root.to_vec(),
            transactions_root: header.transactions_root.to_vec(),
            receipts_root: header.receipts_root.to_vec(),
            withdrawals_root: header.withdrawals_root.map(|root| root.to_vec()),
            logs_bloom: header.logs_bloom.to_vec(),
            difficulty: header.difficulty.to_be_bytes::<32>().to_vec(),
            number: header.number,
            gas_limit: header.gas_limit,
            gas_used: header.gas_used,
            timestamp: header.timestamp,
            mix_hash: header.mix_hash.to_vec(),
            nonce: header.nonce,
            base_fee_per_gas: header.base_fee_per_gas,
            blob_gas_used: header.blob_gas_used,
            excess_blob_gas: header.excess_blob_gas,
            parent_beacon_block_root: header.parent_beacon_block_root.map(|root| root.to_vec()),
            requests_root: header.requests_root.map(|root| root.to_vec()),
            extra_data: header.extra_data.to_vec(),
        }
    }
}

impl TryFrom<&Header> for reth_primitives::Header {
    type Error = StageError;

    fn try_from(header: &Header) -> Result<Self, Self::Error> {
        Ok(Self {
            parent_hash: b256(&header.parent_hash, "parent_hash")?,
            ommers_hash: b256(&header.ommers_hash, "ommers_hash")?,
            beneficiary: address(&header.beneficiary, "beneficiary")?,
            state_root: b256(&header.state_root, "state_root")?,
            transactions_root: b256(&header.transactions_root, "transactions_root")?,
            receipts_root: b256(&header.receipts_root, "receipts_root")?,
            withdrawals_root: header
                .withdrawals_root
                .as_deref()
                .map(|root| b256(root, "withdrawals_root"))
                .transpose()?,
            logs_bloom: Bloom::try_from(header.logs_bloom.as_slice())
                .map_err(|_| bad("logs_bloom", "expected 256 bytes"))?,
            difficulty: U256::try_from_be_slice(&header.difficulty)
                .ok_or_else(|| bad("difficulty", "expected at most 32 bytes"))?,
            number: header.number,
            gas_limit: header.gas_limit,
            gas_used: header.gas_used,
            timestamp: header.timestamp,
            mix_hash: b256(&header.mix_hash, "mix_hash")?,
            nonce: header.nonce,
            base_fee_per_gas: header.base_fee_per_gas,
            blob_gas_used: header.blob_gas_used,
            excess_blob_gas: header.excess_blob_gas,
            parent_beacon_block_root: header
                .parent_beacon_block_root
                .as_deref()
                .map(|root| b256(root, "parent_beacon_block_root"))
                .transpose()?,
            requests_root: header
                .requests_root
                .as_deref()
                .map(|root| b256(root, "requests_root"))
                .transpose()?,
            extra_data: Bytes::copy_from_slice(&header.extra_data),
        })
    }
}

impl TryFrom<&input::Block> for Block {
    type Error = StageError;

    fn try_from(block: &input::Block) -> Result<Self, Self::Error> {
        let transactions = block
            .transactions
            .iter()
            .map(|tx| {
                let mut buf = Vec::new();
                tx.encode_enveloped(&mut buf);
                buf
            })
            .collect();
        Ok(Self {
            header: Some(Header::from(&block.header)),
            transactions,
            uncles: block.uncles.iter().map(Header::from).collect(),
            withdrawals: block
                .withdrawals
                .iter()
                .flat_map(|w| w.iter())
                .map(|w| Withdrawal {
                    index: w.index,
                    validator_index: w.validator_index,
                    address: w.address.to_vec(),
                    amount: w.amount,
                })
                .collect(),
            has_withdrawals: block.withdrawals.is_some(),
        })
    }
}

impl TryFrom<&Block> for input::Block {
    type Error = StageError;

    fn try_from(block: &Block) -> Result<Self, Self::Error> {
        let header = block
            .header
            .as_ref()
            .ok_or_else(|| bad("header", "missing"))?;
        let transactions = block
            .transactions
            .iter()
            .map(|envelope| {
                TransactionSigned::decode_enveloped(&mut envelope.as_slice())
                    .map_err(|err| bad("transactions", err))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let withdrawals = block
            .has_withdrawals
            .then(|| {
                block
                    .withdrawals
                    .iter()
                    .map(|w| {
                        Ok(reth_primitives::Withdrawal {
                            index: w.index,
                            validator_index: w.validator_index,
                            address: address(&w.address, "withdrawal address")?,
                            amount: w.amount,
                        })
                    })
                    .collect::<Result<Vec<_>, StageError>>()
                    .map(reth_primitives::Withdrawals::new)
            })
            .transpose()?;

        Ok(Self {
            header: header.try_into()?,
            transactions,
            uncles: block
                .uncles
                .iter()
                .map(reth_primitives::Header::try_from)
                .collect::<Result<Vec<_>, _>>()?,
            withdrawals,
        })
    }
}

impl TryFrom<&input::ProverInput> for ProverInput {
    type Error = StageError;

    fn try_from(input: &input::ProverInput) -> Result<Self, Self::Error> {
        Ok(Self {
            version: input.version.clone(),
            blocks: input
                .blocks
                .iter()
                .map(Block::try_from)
                .collect::<Result<Vec<_>, _>>()?,
            witness: Some(Witness {
                state: input.witness.state.iter().map(|n| n.to_vec()).collect(),
                ancestors: input.witness.ancestors.iter().map(Header::from).collect(),
                codes: input.witness.codes.iter().map(|c| c.to_vec()).collect(),
            }),
            chain_config: serde_json::to_vec(&input.chain_config)?,
            extra: input
                .extra
                .as_ref()
                .map(serde_json::to_vec)
                .transpose()?,
        })
    }
}

impl TryFrom<&ProverInput> for input::ProverInput {
    type Error = StageError;

    fn try_from(message: &ProverInput) -> Result<Self, Self::Error> {
        let witness = message
            .witness
            .as_ref()
            .ok_or_else(|| bad("witness", "missing"))?;
        Ok(Self {
            version: message.version.clone(),
            blocks: message
                .blocks
                .iter()
                .map(input::Block::try_from)
                .collect::<Result<Vec<_>, _>>()?,
            witness: input::Witness {
                state: witness.state.iter().map(|n| Bytes::from(n.clone())).collect(),
                ancestors: witness
                    .ancestors
                    .iter()
                    .map(reth_primitives::Header::try_from)
                    .collect::<Result<Vec<_>, _>>()?,
                codes: witness.codes.iter().map(|c| Bytes::from(c.clone())).collect(),
            },
            chain_config: serde_json::from_slice(&message.chain_config)?,
            extra: message
                .extra
                .as_deref()
                .map(serde_json::from_slice)
                .transpose()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{Extra, Witness as InputWitness, PROVER_INPUT_VERSION};
    use alloy_genesis::ChainConfig;

    fn sample() -> input::ProverInput {
        let parent = reth_primitives::Header {
            number: 41,
            gas_limit: 30_000_000,
            base_fee_per_gas: Some(7),
            ..Default::default()
        };
        let header = reth_primitives::Header {
            number: 42,
            parent_hash: parent.hash_slow(),
            gas_limit: 30_000_000,
            base_fee_per_gas: Some(7),
            withdrawals_root: Some(prover_mpt::EMPTY_ROOT_HASH),
            ..Default::default()
        };
        input::ProverInput::new(
            ChainConfig {
                chain_id: 1,
                ..Default::default()
            },
            input::Block {
                header,
                withdrawals: Some(reth_primitives::Withdrawals::new(vec![
                    reth_primitives::Withdrawal {
                        index: 1,
                        validator_index: 2,
                        address: Address::repeat_byte(0x33),
                        amount: 1_000_000,
                    },
                ])),
                ..Default::default()
            },
            InputWitness {
                state: vec![Bytes::from_static(b"node")],
                ancestors: vec![parent],
                codes: vec![Bytes::from_static(b"code")],
            },
            Some(Extra {
                committed: Some(vec![Bytes::from_static(b"committed node")]),
                ..Default::default()
            }),
        )
    }

    #[test]
    fn prover_input_proto_round_trips() {
        let input = sample();
        let message = ProverInput::try_from(&input).unwrap();
        let encoded = message.encode_to_vec();
        let decoded = ProverInput::decode(encoded.as_slice()).unwrap();
        let restored = input::ProverInput::try_from(&decoded).unwrap();
        assert_eq!(restored, input);
        assert_eq!(restored.version, PROVER_INPUT_VERSION);
    }

    #[test]
    fn encoding_is_deterministic() {
        let input = sample();
        let a = ProverInput::try_from(&input).unwrap().encode_to_vec();
        let b = ProverInput::try_from(&input).unwrap().encode_to_vec();
        assert_eq!(a, b);
    }

    #[test]
    fn truncated_hash_is_rejected() {
        let input = sample();
        let mut message = ProverInput::try_from(&input).unwrap();
        message.blocks[0].header.as_mut().unwrap().state_root.pop();
        let err = input::ProverInput::try_from(&message).unwrap_err();
        assert!(matches!(err, StageError::InvalidInput(_)));
    }

    #[test]
    fn missing_withdrawals_stay_missing() {
        let mut input = sample();
        input.blocks[0].withdrawals = None;
        let message = ProverInput::try_from(&input).unwrap();
        assert!(!message.blocks[0].has_withdrawals);
        let restored = input::ProverInput::try_from(&message).unwrap();
        assert_eq!(restored.blocks[0].withdrawals, None);
    }
}
