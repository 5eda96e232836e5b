use alloy_primitives::{keccak256, B256};
use bytes::Bytes;
use nybbles::Nibbles;

use crate::{MptError, MptResult, Node, NodeBag};

/// RPC responses use either the canonical empty root or all zeroes for an
/// empty trie.
fn is_empty_root(root: B256) -> bool {
    root == crate::EMPTY_ROOT_HASH || root == B256::ZERO
}

/// Extracts the proof path for `key` from a bag-backed trie rooted at
/// `root`: the ordered list of hashed nodes from the root towards the key,
/// ending early when the key is proven absent.
///
/// Proving consumes the bag (every node on the path must be present);
/// verifying does not.
pub fn prove(root: B256, key: B256, bag: &NodeBag) -> MptResult<Vec<Bytes>> {
    let path = Nibbles::unpack(key);
    let mut remaining = &path[..];
    let mut proof = Vec::new();
    let mut next = root;

    loop {
        let bytes = match bag.get(&next) {
            Some(bytes) => bytes.clone(),
            None if proof.is_empty() && is_empty_root(next) => return Ok(proof),
            None => return Err(MptError::MissingNode(next)),
        };
        bag.touch(next);
        proof.push(bytes.clone());

        let mut node = Node::decode(&bytes)?;
        // Walk embedded children without leaving the current proof element.
        loop {
            match node {
                Node::Empty => return Ok(proof),
                Node::Digest(digest) => {
                    next = digest;
                    break;
                }
                Node::Leaf { .. } => return Ok(proof),
                Node::Extension { path: ext_path, child } => {
                    match remaining.strip_prefix(&ext_path[..]) {
                        Some(rest) => {
                            remaining = rest;
                            node = *child;
                        }
                        None => return Ok(proof),
                    }
                }
                Node::Branch { children, .. } => match remaining.split_first() {
                    None => return Ok(proof),
                    Some((nibble, rest)) => {
                        remaining = rest;
                        node = children[*nibble as usize].clone();
                    }
                },
            }
        }
    }
}

/// Verifies a proof path for `key` against `root`, returning the proven
/// value, or `None` when the proof shows the key is absent.
///
/// Verification is stateless: nodes are checked against the hash that
/// referenced them, in order, so a tampered node surfaces as
/// [`MptError::HashMismatch`] and a truncated proof as
/// [`MptError::KeyNotResolved`].
pub fn verify<T: AsRef<[u8]>>(root: B256, key: B256, proof: &[T]) -> MptResult<Option<Vec<u8>>> {
    let path = Nibbles::unpack(key);
    let mut remaining = &path[..];
    let mut expected = root;
    let mut nodes = proof.iter();

    if is_empty_root(root) && proof.is_empty() {
        return Ok(None);
    }

    loop {
        let bytes = nodes
            .next()
            .ok_or(MptError::KeyNotResolved { root, key })?
            .as_ref();
        let actual = keccak256(bytes);
        if actual != expected {
            return Err(MptError::HashMismatch { expected, actual });
        }

        let mut node = Node::decode(bytes)?;
        loop {
            match node {
                Node::Empty => return Ok(None),
                Node::Digest(digest) => {
                    expected = digest;
                    break;
                }
                Node::Leaf { path: leaf_path, value } => {
                    return Ok((&leaf_path[..] == remaining).then_some(value));
                }
                Node::Extension { path: ext_path, child } => {
                    match remaining.strip_prefix(&ext_path[..]) {
                        Some(rest) => {
                            remaining = rest;
                            node = *child;
                        }
                        None => return Ok(None),
                    }
                }
                Node::Branch { children, value } => match remaining.split_first() {
                    None => return Ok(value),
                    Some((nibble, rest)) => {
                        remaining = rest;
                        node = children[*nibble as usize].clone();
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PartialTrie;
    use alloy_primitives::U256;

    fn seeded_trie(n: usize) -> (B256, NodeBag, Vec<(B256, Vec<u8>)>) {
        let entries: Vec<(B256, Vec<u8>)> = (0..n)
            .map(|i| {
                let key = keccak256(i.to_be_bytes());
                let value = alloy_rlp::encode(U256::from(i as u64 + 1));
                (key, value)
            })
            .collect();

        let empty_bag = NodeBag::default();
        let mut trie = PartialTrie::empty();
        for (key, value) in &entries {
            trie.insert(*key, value.clone(), &empty_bag).unwrap();
        }
        let root = trie.root().unwrap();

        let mut bag = NodeBag::default();
        for (_, rlp) in trie.nodes().unwrap() {
            bag.insert_node(rlp);
        }
        (root, bag, entries)
    }

    #[test]
    fn prove_then_verify_every_key() {
        let (root, bag, entries) = seeded_trie(64);
        for (key, value) in &entries {
            let proof = prove(root, *key, &bag).unwrap();
            assert!(!proof.is_empty());
            assert_eq!(verify(root, *key, &proof).unwrap().as_ref(), Some(value));
        }
    }

    #[test]
    fn absence_proof_verifies_to_none() {
        let (root, bag, _) = seeded_trie(64);
        let absent = keccak256(b"absent key");
        let proof = prove(root, absent, &bag).unwrap();
        assert_eq!(verify(root, absent, &proof).unwrap(), None);
    }

    #[test]
    fn empty_trie_proves_absence_with_no_nodes() {
        let bag = NodeBag::default();
        let key = keccak256(b"anything");
        let proof = prove(crate::EMPTY_ROOT_HASH, key, &bag).unwrap();
        assert!(proof.is_empty());
        assert_eq!(verify(crate::EMPTY_ROOT_HASH, key, &proof).unwrap(), None);
    }

    #[test]
    fn tampered_node_fails_with_hash_mismatch() {
        let (root, bag, entries) = seeded_trie(16);
        let key = entries[3].0;
        let proof = prove(root, key, &bag).unwrap();

        let mut tampered: Vec<Vec<u8>> = proof.iter().map(|b| b.to_vec()).collect();
        let last = tampered.len() - 1;
        tampered[last][10] ^= 0xff;

        assert!(matches!(
            verify(root, key, &tampered).unwrap_err(),
            MptError::HashMismatch { .. }
        ));
    }

    #[test]
    fn truncated_proof_fails_with_key_not_resolved() {
        let (root, bag, entries) = seeded_trie(64);
        let key = entries[5].0;
        let mut proof = prove(root, key, &bag).unwrap();
        assert!(proof.len() > 1, "need a multi-node path");
        proof.pop();

        assert_eq!(
            verify(root, key, &proof).unwrap_err(),
            MptError::KeyNotResolved { root, key }
        );
    }

    #[test]
    fn proof_against_wrong_root_fails() {
        let (root, bag, entries) = seeded_trie(16);
        let key = entries[0].0;
        let proof = prove(root, key, &bag).unwrap();
        let wrong_root = keccak256(b"wrong");
        assert!(matches!(
            verify(wrong_root, key, &proof).unwrap_err(),
            MptError::HashMismatch { .. }
        ));
    }

    #[test]
    fn missing_bag_node_fails_proving() {
        let (root, _, entries) = seeded_trie(16);
        let empty_bag = NodeBag::default();
        assert_eq!(
            prove(root, entries[0].0, &empty_bag).unwrap_err(),
            MptError::MissingNode(root)
        );
    }
}
