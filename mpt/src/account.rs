use alloy_primitives::{b256, B256, U256};
use alloy_rlp::{RlpDecodable, RlpEncodable};

pub use alloy_trie::EMPTY_ROOT_HASH;

/// Keccak-256 hash of the empty byte string, i.e. the `code_hash` of an
/// account with no code.
pub const KECCAK_EMPTY: B256 =
    b256!("c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470");

/// An account record as stored in the state trie, i.e. the RLP payload of an
/// account leaf.
#[derive(Clone, Copy, Debug, Eq, PartialEq, RlpEncodable, RlpDecodable)]
pub struct StateAccount {
    pub nonce: u64,
    pub balance: U256,
    pub storage_root: B256,
    pub code_hash: B256,
}

impl Default for StateAccount {
    fn default() -> Self {
        Self {
            nonce: 0,
            balance: U256::ZERO,
            storage_root: EMPTY_ROOT_HASH,
            code_hash: KECCAK_EMPTY,
        }
    }
}

impl StateAccount {
    /// Returns `true` for the canonical empty account (EIP-158).
    pub fn is_empty(&self) -> bool {
        self.nonce == 0
            && self.balance.is_zero()
            && self.storage_root == EMPTY_ROOT_HASH
            && self.code_hash == KECCAK_EMPTY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_rlp_round_trip() {
        let account = StateAccount {
            nonce: 7,
            balance: U256::from(1_000_000_000u64),
            storage_root: EMPTY_ROOT_HASH,
            code_hash: KECCAK_EMPTY,
        };
        let encoded = alloy_rlp::encode(account);
        let decoded: StateAccount = alloy_rlp::decode_exact(&encoded).unwrap();
        assert_eq!(decoded, account);
    }

    #[test]
    fn default_account_is_empty() {
        assert!(StateAccount::default().is_empty());
        let mut account = StateAccount::default();
        account.nonce = 1;
        assert!(!account.is_empty());
    }
}
