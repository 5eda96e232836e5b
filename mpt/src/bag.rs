use std::collections::{BTreeSet, HashMap};

use alloy_primitives::{keccak256, B256};
use bytes::Bytes;
use parking_lot::Mutex;

use crate::{account::EMPTY_ROOT_HASH, MptError, MptResult, Node};

/// A content-addressed bag of RLP-encoded trie nodes.
///
/// Trie nodes reference each other through hashes, never through pointers, so
/// a flat `hash -> bytes` map plus on-demand decoding is all that is needed
/// to reconstruct any subtree. The bag additionally records every node it
/// resolves; the touched set is what ends up in a minimal witness.
#[derive(Debug, Default)]
pub struct NodeBag {
    nodes: HashMap<B256, Bytes>,
    touched: Mutex<BTreeSet<B256>>,
}

impl NodeBag {
    /// Inserts a single encoded node, returning its hash.
    pub fn insert_node(&mut self, bytes: impl Into<Bytes>) -> B256 {
        let bytes = bytes.into();
        let hash = keccak256(&bytes);
        self.nodes.insert(hash, bytes);
        hash
    }

    /// Inserts every node of a proof path.
    pub fn insert_proof<I, T>(&mut self, proof: I)
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        for node in proof {
            self.insert_node(node.as_ref().to_vec());
        }
    }

    /// Inserts path-shortened variants of the leaf and extension nodes found
    /// in a proof (including ones embedded in branch nodes).
    ///
    /// Deleting a key can collapse a branch, merging its remaining child into
    /// a node with a longer path than anything the pre-state proofs contain.
    /// The collapsed forms appear in post-state proofs; their front-truncated
    /// variants are exactly the intermediate nodes a deletion walks through.
    pub fn insert_short_node_variants<I, T>(&mut self, proof: I) -> MptResult<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        for encoded in proof {
            let node = Node::decode(encoded.as_ref())?;
            match node {
                Node::Leaf { .. } | Node::Extension { .. } => self.insert_path_variants(&node)?,
                Node::Branch { children, .. } => {
                    for child in children.iter() {
                        if matches!(child, Node::Leaf { .. } | Node::Extension { .. }) {
                            self.insert_path_variants(child)?;
                        }
                    }
                }
                Node::Empty | Node::Digest(_) => {}
            }
        }
        Ok(())
    }

    fn insert_path_variants(&mut self, node: &Node) -> MptResult<()> {
        let path = match node {
            Node::Leaf { path, .. } | Node::Extension { path, .. } => path.clone(),
            _ => return Ok(()),
        };
        for skip in 1..=path.len() {
            let variant = match node {
                Node::Leaf { value, .. } => Node::Leaf {
                    path: path.slice(skip..),
                    value: value.clone(),
                },
                Node::Extension { child, .. } => {
                    if path.len() == skip {
                        // An extension cannot have an empty path.
                        continue;
                    }
                    Node::Extension {
                        path: path.slice(skip..),
                        child: child.clone(),
                    }
                }
                _ => unreachable!(),
            };
            let encoded = variant.rlp()?;
            let hash = keccak256(&encoded);
            self.nodes.entry(hash).or_insert_with(|| encoded.into());
        }
        Ok(())
    }

    /// Decodes the node behind `hash`, marking it as touched. The empty root
    /// resolves to [`Node::Empty`] without a bag entry.
    pub fn resolve(&self, hash: B256) -> MptResult<Node> {
        if hash == EMPTY_ROOT_HASH || hash == B256::ZERO {
            return Ok(Node::Empty);
        }
        let bytes = self.nodes.get(&hash).ok_or(MptError::MissingNode(hash))?;
        self.touched.lock().insert(hash);
        Node::decode(bytes)
    }

    /// The raw bytes behind `hash`, without touching it.
    pub fn get(&self, hash: &B256) -> Option<&Bytes> {
        self.nodes.get(hash)
    }

    pub fn contains(&self, hash: &B256) -> bool {
        self.nodes.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Hashes of every node resolved so far, in ascending order.
    pub fn touched(&self) -> Vec<B256> {
        self.touched.lock().iter().copied().collect()
    }

    /// Marks a node as touched without resolving it.
    pub fn touch(&self, hash: B256) {
        if self.nodes.contains_key(&hash) {
            self.touched.lock().insert(hash);
        }
    }
}
