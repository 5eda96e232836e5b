//! Hexary Merkle-Patricia-Trie support for prover input generation.
//!
//! While there are other Ethereum trie libraries, they are not a good fit
//! when the trie at hand is a *partial* one reconstructed from `eth_getProof`
//! responses: most of the node set is unknown and only referenced by hash,
//! yet the partial trie must still produce the exact same root as the full
//! one, and mutations (to compute a post-state root) must be able to page
//! missing nodes in from a witness on demand.
//!
//! The building blocks are:
//! - [`Node`], the RLP codec for branch / extension / leaf nodes, including
//!   embedded children shorter than 32 bytes and value-in-branch payloads;
//! - [`NodeBag`], a content-addressed `hash -> bytes` collection seeded from
//!   proofs, which records every node it resolves;
//! - [`PartialTrie`], a mutable trie rooted at a digest that materializes
//!   nodes from a bag as keys are read, inserted or removed;
//! - [`prove`] / [`verify`], proof extraction and stateless verification.

mod account;
mod bag;
mod node;
mod proof;
mod trie;

pub use account::{StateAccount, EMPTY_ROOT_HASH, KECCAK_EMPTY};
pub use bag::NodeBag;
pub use node::Node;
pub use proof::{prove, verify};
pub use trie::PartialTrie;

use alloy_primitives::B256;
use thiserror::Error;

/// The result type of trie operations.
pub type MptResult<T> = Result<T, MptError>;

/// Errors raised by trie codec, proof and traversal operations.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum MptError {
    /// A node's RLP encoding is not a valid trie node.
    #[error("invalid trie node encoding: {0}")]
    BadEncoding(String),

    /// A node's bytes do not hash to the reference that pointed at them.
    #[error("trie node hash mismatch (expected {expected}, got {actual})")]
    HashMismatch { expected: B256, actual: B256 },

    /// A referenced node is not present in the bag.
    #[error("missing trie node {0}")]
    MissingNode(B256),

    /// A proof is exhausted before the key's subtree is reached.
    #[error("key {key} cannot be resolved against root {root}")]
    KeyNotResolved { root: B256, key: B256 },
}
