use alloy_primitives::{keccak256, B256};
use alloy_rlp::{Header, EMPTY_STRING_CODE};
use nybbles::Nibbles;

use crate::{account::EMPTY_ROOT_HASH, MptError, MptResult};

/// A single node of a hexary Merkle-Patricia-Trie.
///
/// Children are stored by value: an unresolved subtree is a [`Node::Digest`],
/// an embedded child (RLP shorter than 32 bytes) is decoded in place.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum Node {
    /// The empty trie.
    #[default]
    Empty,
    /// The keccak256 reference of a subtree whose bytes are not loaded.
    Digest(B256),
    /// A 17-item node: 16 children plus an optional value payload.
    Branch {
        children: Box<[Node; 16]>,
        value: Option<Vec<u8>>,
    },
    /// A shared nibble path followed by a single child.
    Extension { path: Nibbles, child: Box<Node> },
    /// A terminal path with its value payload.
    Leaf { path: Nibbles, value: Vec<u8> },
}

/// A borrowed RLP item: header metadata plus payload and raw (header
/// included) byte views.
struct Item<'a> {
    list: bool,
    payload: &'a [u8],
    raw: &'a [u8],
}

fn next_item<'a>(buf: &mut &'a [u8]) -> MptResult<Item<'a>> {
    let start = *buf;
    let header = Header::decode(buf).map_err(|e| MptError::BadEncoding(e.to_string()))?;
    if buf.len() < header.payload_length {
        return Err(MptError::BadEncoding("truncated payload".to_owned()));
    }
    let payload = &buf[..header.payload_length];
    *buf = &buf[header.payload_length..];
    let raw = &start[..start.len() - buf.len()];
    Ok(Item {
        list: header.list,
        payload,
        raw,
    })
}

fn rlp_string(payload: &[u8], out: &mut Vec<u8>) {
    if payload.len() == 1 && payload[0] < EMPTY_STRING_CODE {
        out.push(payload[0]);
    } else {
        Header {
            list: false,
            payload_length: payload.len(),
        }
        .encode(out);
        out.extend_from_slice(payload);
    }
}

/// Decodes a hex-prefix encoded path, returning the nibbles and whether the
/// node is a leaf.
fn decode_path(bytes: &[u8]) -> MptResult<(Nibbles, bool)> {
    let first = *bytes
        .first()
        .ok_or_else(|| MptError::BadEncoding("empty path".to_owned()))?;
    let flag = first >> 4;
    if flag > 3 {
        return Err(MptError::BadEncoding(format!("invalid path prefix {first:#04x}")));
    }
    let is_leaf = flag & 2 != 0;
    let odd = flag & 1 != 0;
    let nibbles = Nibbles::unpack(bytes);
    let skip = if odd { 1 } else { 2 };
    Ok((nibbles.slice(skip..), is_leaf))
}

impl Node {
    /// Decodes a node from its RLP encoding, recursing into embedded
    /// children.
    pub fn decode(bytes: &[u8]) -> MptResult<Self> {
        let mut buf = bytes;
        let node = Self::decode_any(&mut buf)?;
        if !buf.is_empty() {
            return Err(MptError::BadEncoding("trailing bytes after node".to_owned()));
        }
        Ok(node)
    }

    fn decode_any(buf: &mut &[u8]) -> MptResult<Self> {
        let item = next_item(buf)?;
        if !item.list {
            return if item.payload.is_empty() {
                Ok(Node::Empty)
            } else {
                Err(MptError::BadEncoding("top-level node is a string".to_owned()))
            };
        }

        let mut payload = item.payload;
        let mut items = Vec::with_capacity(17);
        while !payload.is_empty() {
            items.push(next_item(&mut payload)?);
        }

        match items.len() {
            2 => {
                if items[0].list {
                    return Err(MptError::BadEncoding("path item is a list".to_owned()));
                }
                let (path, is_leaf) = decode_path(items[0].payload)?;
                if is_leaf {
                    if items[1].list {
                        return Err(MptError::BadEncoding("leaf value is a list".to_owned()));
                    }
                    Ok(Node::Leaf {
                        path,
                        value: items[1].payload.to_vec(),
                    })
                } else {
                    Ok(Node::Extension {
                        path,
                        child: Box::new(Self::decode_child(&items[1])?),
                    })
                }
            }
            17 => {
                let mut children: [Node; 16] = Default::default();
                for (i, child) in children.iter_mut().enumerate() {
                    *child = Self::decode_child(&items[i])?;
                }
                if items[16].list {
                    return Err(MptError::BadEncoding("branch value is a list".to_owned()));
                }
                let value = (!items[16].payload.is_empty()).then(|| items[16].payload.to_vec());
                Ok(Node::Branch {
                    children: Box::new(children),
                    value,
                })
            }
            n => Err(MptError::BadEncoding(format!("node list of length {n}"))),
        }
    }

    fn decode_child(item: &Item<'_>) -> MptResult<Self> {
        if item.list {
            // Embedded child, RLP shorter than 32 bytes.
            let mut raw = item.raw;
            return Self::decode_any(&mut raw);
        }
        match item.payload.len() {
            0 => Ok(Node::Empty),
            32 => Ok(Node::Digest(B256::from_slice(item.payload))),
            n => Err(MptError::BadEncoding(format!("child reference of {n} bytes"))),
        }
    }

    /// The RLP encoding of this node. A [`Node::Digest`] has no encoding of
    /// its own; encountering one here means a caller tried to serialize an
    /// unresolved subtree.
    pub fn rlp(&self) -> MptResult<Vec<u8>> {
        let mut payload = Vec::new();
        match self {
            Node::Empty => return Ok(vec![EMPTY_STRING_CODE]),
            Node::Digest(digest) => return Err(MptError::MissingNode(*digest)),
            Node::Branch { children, value } => {
                for child in children.iter() {
                    child.encode_ref(&mut payload)?;
                }
                match value {
                    Some(value) => rlp_string(value, &mut payload),
                    None => payload.push(EMPTY_STRING_CODE),
                }
            }
            Node::Extension { path, child } => {
                rlp_string(&path.encode_path_leaf(false), &mut payload);
                child.encode_ref(&mut payload)?;
            }
            Node::Leaf { path, value } => {
                rlp_string(&path.encode_path_leaf(true), &mut payload);
                rlp_string(value, &mut payload);
            }
        }

        let mut out = Vec::with_capacity(payload.len() + 4);
        Header {
            list: true,
            payload_length: payload.len(),
        }
        .encode(&mut out);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Appends this node's reference to a parent payload: inline if the
    /// encoding is shorter than 32 bytes, by hash otherwise.
    fn encode_ref(&self, out: &mut Vec<u8>) -> MptResult<()> {
        match self {
            Node::Empty => out.push(EMPTY_STRING_CODE),
            Node::Digest(digest) => rlp_string(digest.as_slice(), out),
            _ => {
                let encoded = self.rlp()?;
                if encoded.len() < 32 {
                    out.extend_from_slice(&encoded);
                } else {
                    rlp_string(keccak256(&encoded).as_slice(), out);
                }
            }
        }
        Ok(())
    }

    /// The keccak256 commitment of this node. The empty trie hashes to the
    /// well-known empty root.
    pub fn hash(&self) -> MptResult<B256> {
        match self {
            Node::Empty => Ok(EMPTY_ROOT_HASH),
            Node::Digest(digest) => Ok(*digest),
            _ => Ok(keccak256(self.rlp()?)),
        }
    }

    /// Whether this node is resolved, i.e. not a bare digest reference.
    pub fn is_resolved(&self) -> bool {
        !matches!(self, Node::Digest(_))
    }
}
