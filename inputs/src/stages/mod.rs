//! The three pipeline stages and their shared error taxonomy.

mod execute;
mod preflight;
mod prepare;

pub use execute::{ExecutionReport, Executor};
pub use preflight::Preflighter;
pub use prepare::Preparer;

use alloy_primitives::{Address, B256};
use prover_mpt::MptError;
use prover_store::StoreError;
use thiserror::Error;

/// Stage-level failures. Every leaf error is folded into one of these kinds
/// so callers can map outcomes to exit codes and retries uniformly.
#[derive(Debug, Error)]
pub enum StageError {
    /// Malformed flags or artifact payloads.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A network or store failure that survived transport-level retries.
    #[error("transient failure: {0}")]
    Transient(String),

    /// A state access not covered by the witness.
    #[error("missing witness for account {address}{}", slot.map(|s| format!(" slot {s}")).unwrap_or_default())]
    MissingWitness {
        address: Address,
        slot: Option<B256>,
    },

    /// A `BLOCKHASH` target outside the provided ancestor chain.
    #[error("missing ancestor header for block {0}")]
    MissingAncestor(u64),

    /// A proof that fails to verify against its claimed root.
    #[error("invalid proof: {0}")]
    ProofInvalid(String),

    /// The executor's post-state root disagrees with the block header.
    #[error("post-state root mismatch: expected {expected}, actual {actual}")]
    PostStateMismatch { expected: B256, actual: B256 },

    /// A replayed block disagrees with its header on a derived field.
    #[error("replay mismatch on {field}: expected {expected}, actual {actual}")]
    ReplayMismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },

    /// A broken invariant; never masked.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<MptError> for StageError {
    fn from(err: MptError) -> Self {
        match err {
            MptError::MissingNode(hash) => {
                StageError::ProofInvalid(format!("witness is missing trie node {hash}"))
            }
            other => StageError::ProofInvalid(other.to_string()),
        }
    }
}

impl From<StoreError> for StageError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => {
                StageError::InvalidInput(format!("artifact {key} not found"))
            }
            StoreError::InvalidConfig(msg) => StageError::InvalidInput(msg),
            other => StageError::Transient(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StageError {
    fn from(err: serde_json::Error) -> Self {
        StageError::InvalidInput(format!("malformed artifact payload: {err}"))
    }
}

/// The process exit code mandated for this failure.
pub fn exit_code(err: &StageError) -> i32 {
    match err {
        StageError::InvalidInput(_) => 2,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(exit_code(&StageError::InvalidInput("x".into())), 2);
        assert_eq!(exit_code(&StageError::Transient("x".into())), 1);
        assert_eq!(
            exit_code(&StageError::PostStateMismatch {
                expected: B256::ZERO,
                actual: B256::ZERO,
            }),
            1
        );
    }

    #[test]
    fn missing_witness_names_the_access() {
        let err = StageError::MissingWitness {
            address: Address::repeat_byte(0xaa),
            slot: Some(B256::repeat_byte(0x01)),
        };
        let message = err.to_string();
        assert!(message.contains("0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"));
        assert!(message.contains("slot"));
    }

    #[test]
    fn store_not_found_is_invalid_input() {
        let err: StageError = StoreError::NotFound("1/42.json".into()).into();
        assert!(matches!(err, StageError::InvalidInput(_)));
    }
}
