use alloy_primitives::B256;
use nybbles::Nibbles;

use crate::{MptResult, Node, NodeBag};

/// A mutable trie rooted at a digest, materializing nodes from a [`NodeBag`]
/// as operations walk into them.
///
/// Only the paths an operation actually traverses are resolved; everything
/// else stays a [`Node::Digest`], which is what keeps the in-memory footprint
/// proportional to the witness rather than to the state.
#[derive(Clone, Debug, Default)]
pub struct PartialTrie {
    root: Node,
}

fn concat(prefix: &[u8], suffix: &[u8]) -> Nibbles {
    let mut nibbles = Vec::with_capacity(prefix.len() + suffix.len());
    nibbles.extend_from_slice(prefix);
    nibbles.extend_from_slice(suffix);
    Nibbles::from_nibbles(nibbles)
}

fn prepend(nibble: u8, path: &[u8]) -> Nibbles {
    concat(&[nibble], path)
}

impl PartialTrie {
    /// A trie whose entire content is behind `root`.
    pub fn from_root(root: B256) -> Self {
        Self {
            root: Node::Digest(root),
        }
    }

    /// An empty trie.
    pub fn empty() -> Self {
        Self { root: Node::Empty }
    }

    /// The root commitment of the trie in its current state.
    pub fn root(&self) -> MptResult<B256> {
        self.root.hash()
    }

    /// Looks up `key`, resolving digests through `bag` without mutating the
    /// trie. `Ok(None)` is a proven absence; an unresolvable digest on the
    /// path is [`MptError::MissingNode`](crate::MptError::MissingNode).
    pub fn get(&self, key: B256, bag: &NodeBag) -> MptResult<Option<Vec<u8>>> {
        let path = Nibbles::unpack(key);
        lookup(&self.root, &path, bag)
    }

    /// Inserts or updates `key`, materializing the touched path.
    pub fn insert(&mut self, key: B256, value: Vec<u8>, bag: &NodeBag) -> MptResult<()> {
        let path = Nibbles::unpack(key);
        let root = std::mem::take(&mut self.root);
        self.root = insert_node(root, &path, value, bag)?;
        Ok(())
    }

    /// Removes `key` if present, collapsing branches per Ethereum trie rules.
    /// Collapsing may need to resolve an untouched sibling from the bag.
    pub fn remove(&mut self, key: B256, bag: &NodeBag) -> MptResult<bool> {
        let path = Nibbles::unpack(key);
        let root = std::mem::take(&mut self.root);
        let (root, removed) = remove_node(root, &path, bag)?;
        self.root = root;
        Ok(removed)
    }

    /// Every resolved node of the trie as `(hash, rlp)` pairs. Embedded
    /// children (encodings shorter than 32 bytes) live inside their parent
    /// and are not reported separately.
    pub fn nodes(&self) -> MptResult<Vec<(B256, Vec<u8>)>> {
        let mut out = Vec::new();
        collect(&self.root, &mut out)?;
        Ok(out)
    }
}

fn lookup(node: &Node, path: &[u8], bag: &NodeBag) -> MptResult<Option<Vec<u8>>> {
    match node {
        Node::Empty => Ok(None),
        Node::Digest(digest) => lookup(&bag.resolve(*digest)?, path, bag),
        Node::Leaf { path: leaf_path, value } => {
            Ok((&leaf_path[..] == path).then(|| value.clone()))
        }
        Node::Extension { path: ext_path, child } => match path.strip_prefix(&ext_path[..]) {
            Some(rest) => lookup(child, rest, bag),
            None => Ok(None),
        },
        Node::Branch { children, value } => match path.split_first() {
            None => Ok(value.clone()),
            Some((nibble, rest)) => lookup(&children[*nibble as usize], rest, bag),
        },
    }
}

fn insert_node(node: Node, path: &[u8], value: Vec<u8>, bag: &NodeBag) -> MptResult<Node> {
    match node {
        Node::Empty => Ok(Node::Leaf {
            path: Nibbles::from_nibbles(path),
            value,
        }),
        Node::Digest(digest) => insert_node(bag.resolve(digest)?, path, value, bag),
        Node::Leaf {
            path: leaf_path,
            value: leaf_value,
        } => {
            let common = common_prefix(&leaf_path, path);
            if common == leaf_path.len() && common == path.len() {
                return Ok(Node::Leaf {
                    path: leaf_path,
                    value,
                });
            }
            let mut children: [Node; 16] = Default::default();
            let mut branch_value = None;
            if leaf_path.len() == common {
                branch_value = Some(leaf_value);
            } else {
                children[leaf_path[common] as usize] = Node::Leaf {
                    path: leaf_path.slice(common + 1..),
                    value: leaf_value,
                };
            }
            if path.len() == common {
                branch_value = Some(value);
            } else {
                children[path[common] as usize] = Node::Leaf {
                    path: Nibbles::from_nibbles(&path[common + 1..]),
                    value,
                };
            }
            Ok(wrap_prefix(
                &path[..common],
                Node::Branch {
                    children: Box::new(children),
                    value: branch_value,
                },
            ))
        }
        Node::Extension {
            path: ext_path,
            child,
        } => {
            let common = common_prefix(&ext_path, path);
            if common == ext_path.len() {
                let child = insert_node(*child, &path[common..], value, bag)?;
                return Ok(Node::Extension {
                    path: ext_path,
                    child: Box::new(child),
                });
            }
            let mut children: [Node; 16] = Default::default();
            let ext_rest = ext_path.slice(common + 1..);
            children[ext_path[common] as usize] = if ext_rest.is_empty() {
                *child
            } else {
                Node::Extension {
                    path: ext_rest,
                    child,
                }
            };
            let mut branch_value = None;
            if path.len() == common {
                branch_value = Some(value);
            } else {
                children[path[common] as usize] = Node::Leaf {
                    path: Nibbles::from_nibbles(&path[common + 1..]),
                    value,
                };
            }
            Ok(wrap_prefix(
                &path[..common],
                Node::Branch {
                    children: Box::new(children),
                    value: branch_value,
                },
            ))
        }
        Node::Branch { mut children, value: branch_value } => match path.split_first() {
            None => Ok(Node::Branch {
                children,
                value: Some(value),
            }),
            Some((nibble, rest)) => {
                let idx = *nibble as usize;
                let child = std::mem::take(&mut children[idx]);
                children[idx] = insert_node(child, rest, value, bag)?;
                Ok(Node::Branch {
                    children,
                    value: branch_value,
                })
            }
        },
    }
}

fn remove_node(node: Node, path: &[u8], bag: &NodeBag) -> MptResult<(Node, bool)> {
    match node {
        Node::Empty => Ok((Node::Empty, false)),
        Node::Digest(digest) => remove_node(bag.resolve(digest)?, path, bag),
        Node::Leaf {
            path: leaf_path,
            value,
        } => {
            if &leaf_path[..] == path {
                Ok((Node::Empty, true))
            } else {
                Ok((Node::Leaf { path: leaf_path, value }, false))
            }
        }
        Node::Extension {
            path: ext_path,
            child,
        } => match path.strip_prefix(&ext_path[..]) {
            Some(rest) => {
                let (new_child, removed) = remove_node(*child, rest, bag)?;
                if !removed {
                    return Ok((
                        Node::Extension {
                            path: ext_path,
                            child: Box::new(new_child),
                        },
                        false,
                    ));
                }
                Ok((merge_extension(&ext_path, new_child)?, true))
            }
            None => Ok((Node::Extension { path: ext_path, child }, false)),
        },
        Node::Branch { mut children, value } => match path.split_first() {
            None => {
                if value.is_none() {
                    return Ok((Node::Branch { children, value }, false));
                }
                Ok((collapse_branch(children, None, bag)?, true))
            }
            Some((nibble, rest)) => {
                let idx = *nibble as usize;
                let child = std::mem::take(&mut children[idx]);
                let (new_child, removed) = remove_node(child, rest, bag)?;
                children[idx] = new_child;
                if !removed {
                    return Ok((Node::Branch { children, value }, false));
                }
                Ok((collapse_branch(children, value, bag)?, true))
            }
        },
    }
}

/// Rebuilds a branch after one of its slots was emptied. A branch with a
/// single remaining child (or only a value) is folded into a shorter node.
fn collapse_branch(
    children: Box<[Node; 16]>,
    value: Option<Vec<u8>>,
    bag: &NodeBag,
) -> MptResult<Node> {
    let mut occupied = (0..16).filter(|&i| !matches!(children[i], Node::Empty));
    let first = occupied.next();
    let second = occupied.next();

    match (first, second, value) {
        (None, _, None) => Ok(Node::Empty),
        (None, _, Some(value)) => Ok(Node::Leaf {
            path: Nibbles::default(),
            value,
        }),
        (Some(idx), None, None) => {
            let mut children = children;
            let child = std::mem::take(&mut children[idx]);
            let child = match child {
                // An unresolvable sibling must be a branch: leaf and
                // extension siblings are always present as short-node
                // variants, and a branch keeps its hash under the new
                // extension either way.
                Node::Digest(digest) => match bag.resolve(digest) {
                    Ok(resolved) => resolved,
                    Err(crate::MptError::MissingNode(_)) => {
                        return Ok(Node::Extension {
                            path: Nibbles::from_nibbles([idx as u8]),
                            child: Box::new(Node::Digest(digest)),
                        })
                    }
                    Err(err) => return Err(err),
                },
                resolved => resolved,
            };
            match child {
                Node::Leaf { path, value } => Ok(Node::Leaf {
                    path: prepend(idx as u8, &path),
                    value,
                }),
                Node::Extension { path, child } => Ok(Node::Extension {
                    path: prepend(idx as u8, &path),
                    child,
                }),
                branch @ Node::Branch { .. } => Ok(Node::Extension {
                    path: Nibbles::from_nibbles([idx as u8]),
                    child: Box::new(branch),
                }),
                Node::Empty | Node::Digest(_) => unreachable!("occupied slot resolved to empty"),
            }
        }
        (_, _, value) => Ok(Node::Branch { children, value }),
    }
}

/// Splices an extension's path onto whatever its child collapsed into.
fn merge_extension(ext_path: &Nibbles, child: Node) -> MptResult<Node> {
    match child {
        Node::Empty => Ok(Node::Empty),
        Node::Leaf { path, value } => Ok(Node::Leaf {
            path: concat(ext_path, &path),
            value,
        }),
        Node::Extension { path, child } => Ok(Node::Extension {
            path: concat(ext_path, &path),
            child,
        }),
        branch @ Node::Branch { .. } => Ok(Node::Extension {
            path: ext_path.clone(),
            child: Box::new(branch),
        }),
        digest @ Node::Digest(_) => {
            // A removal below always materializes the node it returns.
            Ok(Node::Extension {
                path: ext_path.clone(),
                child: Box::new(digest),
            })
        }
    }
}

fn wrap_prefix(prefix: &[u8], node: Node) -> Node {
    if prefix.is_empty() {
        node
    } else {
        Node::Extension {
            path: Nibbles::from_nibbles(prefix),
            child: Box::new(node),
        }
    }
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

fn collect(node: &Node, out: &mut Vec<(B256, Vec<u8>)>) -> MptResult<()> {
    match node {
        Node::Empty | Node::Digest(_) => Ok(()),
        Node::Leaf { .. } => push_if_hashed(node, out),
        Node::Extension { child, .. } => {
            collect(child, out)?;
            push_if_hashed(node, out)
        }
        Node::Branch { children, .. } => {
            for child in children.iter() {
                collect(child, out)?;
            }
            push_if_hashed(node, out)
        }
    }
}

fn push_if_hashed(node: &Node, out: &mut Vec<(B256, Vec<u8>)>) -> MptResult<()> {
    let encoded = node.rlp()?;
    if encoded.len() >= 32 {
        out.push((alloy_primitives::keccak256(&encoded), encoded));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{keccak256, B256, U256};
    use alloy_trie::{HashBuilder, EMPTY_ROOT_HASH};

    /// Deterministic pseudo-random 32-byte keys.
    fn test_keys(n: usize) -> Vec<B256> {
        (0..n).map(|i| keccak256(i.to_be_bytes())).collect()
    }

    fn test_value(key: &B256) -> Vec<u8> {
        alloy_rlp::encode(U256::from_be_bytes(key.0) >> 96)
    }

    /// Ground-truth root over sorted leaves, via `alloy-trie`'s hash builder.
    fn reference_root(entries: &[(B256, Vec<u8>)]) -> B256 {
        let mut sorted = entries.to_vec();
        sorted.sort_by_key(|(k, _)| *k);
        let mut builder = HashBuilder::default();
        for (key, value) in &sorted {
            builder.add_leaf(Nibbles::unpack(key), value);
        }
        builder.root()
    }

    fn build_trie(entries: &[(B256, Vec<u8>)]) -> PartialTrie {
        let bag = NodeBag::default();
        let mut trie = PartialTrie::empty();
        for (key, value) in entries {
            trie.insert(*key, value.clone(), &bag).unwrap();
        }
        trie
    }

    fn entries(n: usize) -> Vec<(B256, Vec<u8>)> {
        test_keys(n)
            .into_iter()
            .map(|k| (k, test_value(&k)))
            .collect()
    }

    #[test]
    fn empty_trie_root() {
        assert_eq!(PartialTrie::empty().root().unwrap(), EMPTY_ROOT_HASH);
    }

    #[test]
    fn single_leaf_matches_reference() {
        let entries = entries(1);
        assert_eq!(build_trie(&entries).root().unwrap(), reference_root(&entries));
    }

    #[test]
    fn insert_roots_match_reference_at_every_step() {
        let all = entries(64);
        let bag = NodeBag::default();
        let mut trie = PartialTrie::empty();
        for i in 0..all.len() {
            let (key, value) = &all[i];
            trie.insert(*key, value.clone(), &bag).unwrap();
            assert_eq!(trie.root().unwrap(), reference_root(&all[..=i]), "step {i}");
        }
    }

    #[test]
    fn overwrite_updates_value() {
        let all = entries(8);
        let bag = NodeBag::default();
        let mut trie = build_trie(&all);
        let (key, _) = all[3];
        trie.insert(key, b"replacement".to_vec(), &bag).unwrap();
        assert_eq!(trie.get(key, &bag).unwrap().unwrap(), b"replacement");

        let mut updated = all.clone();
        updated[3].1 = b"replacement".to_vec();
        assert_eq!(trie.root().unwrap(), reference_root(&updated));
    }

    #[test]
    fn get_proves_absence() {
        let all = entries(16);
        let bag = NodeBag::default();
        let trie = build_trie(&all);
        let absent = keccak256(b"not inserted");
        assert_eq!(trie.get(absent, &bag).unwrap(), None);
    }

    #[test]
    fn deletions_match_reference() {
        let all = entries(32);
        let bag = NodeBag::default();
        let mut trie = build_trie(&all);

        for i in 0..16 {
            let removed = trie.remove(all[i].0, &bag).unwrap();
            assert!(removed);
            assert_eq!(
                trie.root().unwrap(),
                reference_root(&all[i + 1..]),
                "after deleting {i}"
            );
        }
    }

    #[test]
    fn removing_absent_key_is_a_no_op() {
        let all = entries(8);
        let bag = NodeBag::default();
        let mut trie = build_trie(&all);
        let root = trie.root().unwrap();
        assert!(!trie.remove(keccak256(b"absent"), &bag).unwrap());
        assert_eq!(trie.root().unwrap(), root);
    }

    #[test]
    fn delete_to_empty() {
        let all = entries(2);
        let bag = NodeBag::default();
        let mut trie = build_trie(&all);
        assert!(trie.remove(all[0].0, &bag).unwrap());
        assert!(trie.remove(all[1].0, &bag).unwrap());
        assert_eq!(trie.root().unwrap(), EMPTY_ROOT_HASH);
    }

    #[test]
    fn operations_resolve_through_a_bag() {
        // Build the full trie, dump its nodes into a bag, then operate on a
        // digest-rooted trie that must page everything in on demand.
        let all = entries(48);
        let full = build_trie(&all);
        let root = full.root().unwrap();

        let mut bag = NodeBag::default();
        for (_, rlp) in full.nodes().unwrap() {
            bag.insert_node(rlp);
        }

        let trie = PartialTrie::from_root(root);
        for (key, value) in &all {
            assert_eq!(trie.get(*key, &bag).unwrap().as_ref(), Some(value));
        }

        // Mutations against the same bag reproduce reference roots.
        let mut trie = PartialTrie::from_root(root);
        let extra = (keccak256(b"extra"), b"extra value".to_vec());
        trie.insert(extra.0, extra.1.clone(), &bag).unwrap();
        let mut updated = all.clone();
        updated.push(extra.clone());
        assert_eq!(trie.root().unwrap(), reference_root(&updated));

        trie.remove(extra.0, &bag).unwrap();
        trie.remove(all[7].0, &bag).unwrap();
        let mut remaining = all.clone();
        remaining.remove(7);
        assert_eq!(trie.root().unwrap(), reference_root(&remaining));
    }

    #[test]
    fn missing_node_surfaces_during_walk() {
        let all = entries(48);
        let full = build_trie(&all);
        let root = full.root().unwrap();

        // Seed the bag with everything except one node.
        let nodes = full.nodes().unwrap();
        let dropped = nodes[nodes.len() / 2].0;
        let mut bag = NodeBag::default();
        for (hash, rlp) in nodes {
            if hash != dropped {
                bag.insert_node(rlp);
            }
        }

        let trie = PartialTrie::from_root(root);
        let mut missing = 0;
        for (key, _) in &all {
            if let Err(crate::MptError::MissingNode(hash)) = trie.get(*key, &bag) {
                assert_eq!(hash, dropped);
                missing += 1;
            }
        }
        assert!(missing > 0, "dropped node was on no path");
    }

    #[test]
    fn deletion_with_witness_limited_to_one_path() {
        // A witness carries only the deleted key's pre-state path. Collapsing
        // the branch needs the untouched sibling, which is only available as
        // a short-node variant of the *post-state* absence proof.
        let all = entries(64);
        let full = build_trie(&all);
        let pre_root = full.root().unwrap();

        let mut full_bag = NodeBag::default();
        for (_, rlp) in full.nodes().unwrap() {
            full_bag.insert_node(rlp);
        }

        for victim in [0usize, 13, 37, 63] {
            let (key, _) = all[victim];

            let mut remaining = all.clone();
            remaining.remove(victim);
            let post_root = reference_root(&remaining);

            // Pre-state proof path for the deleted key only.
            let mut bag = NodeBag::default();
            bag.insert_proof(crate::prove(pre_root, key, &full_bag).unwrap());

            // Post-state absence proof, contributed as short-node variants.
            let post = build_trie(&remaining);
            let mut post_bag = NodeBag::default();
            for (_, rlp) in post.nodes().unwrap() {
                post_bag.insert_node(rlp);
            }
            bag.insert_short_node_variants(crate::prove(post_root, key, &post_bag).unwrap())
                .unwrap();

            let mut trie = PartialTrie::from_root(pre_root);
            assert!(trie.remove(key, &bag).unwrap(), "victim {victim}");
            assert_eq!(trie.root().unwrap(), post_root, "victim {victim}");
        }
    }

    #[test]
    fn value_in_branch_is_supported() {
        // Variable-length keys force a branch node carrying a value.
        let bag = NodeBag::default();
        let mut trie = PartialTrie::empty();
        let short = Nibbles::from_nibbles([0x1, 0x2]);
        let long = Nibbles::from_nibbles([0x1, 0x2, 0x3, 0x4]);

        let root = insert_node(
            Node::Empty,
            &short,
            b"short".to_vec(),
            &bag,
        )
        .unwrap();
        let root = insert_node(root, &long, b"long".to_vec(), &bag).unwrap();
        trie.root = root;

        assert_eq!(lookup(&trie.root, &short, &bag).unwrap().unwrap(), b"short");
        assert_eq!(lookup(&trie.root, &long, &bag).unwrap().unwrap(), b"long");

        // Removing the longer key folds the branch value back into a leaf.
        let (root, removed) = remove_node(std::mem::take(&mut trie.root), &long, &bag).unwrap();
        assert!(removed);
        assert_eq!(lookup(&root, &short, &bag).unwrap().unwrap(), b"short");
    }
}
