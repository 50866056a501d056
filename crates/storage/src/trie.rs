//! Merkle Patricia Trie over a content-addressed node store
//!
//! Nodes are serialized with bincode and stored under the Keccak256 hash of
//! their encoding. Children are always referenced by hash, which lets a light
//! client fetch any single node from an untrusted peer and verify it against
//! the reference it followed.
//!
//! [`MerkleTrie`] builds tries into a [`NodeStore`]; [`lookup`] walks a trie
//! that may be only partially present locally and reports the first missing
//! node on the key path.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::store::NodeStore;
use crate::{keccak256, Hash, Result, StorageError, EMPTY_ROOT, ZERO_HASH};

/// Nibble representation for trie paths
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Nibbles(Vec<u8>);

impl Nibbles {
    /// Create nibbles from bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut nibbles = Vec::with_capacity(bytes.len() * 2);
        for byte in bytes {
            nibbles.push(byte >> 4);
            nibbles.push(byte & 0x0f);
        }
        Nibbles(nibbles)
    }

    /// Wrap raw nibble values (each must be < 16)
    pub fn from_nibbles(nibbles: Vec<u8>) -> Self {
        debug_assert!(nibbles.iter().all(|n| *n < 16));
        Nibbles(nibbles)
    }

    /// Raw nibble values
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Get the length
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First nibble, if any
    pub fn first(&self) -> Option<u8> {
        self.0.first().copied()
    }

    /// Get a slice
    pub fn slice(&self, start: usize) -> Nibbles {
        Nibbles(self.0[start.min(self.0.len())..].to_vec())
    }

    /// Check whether `prefix` is a prefix of these nibbles
    pub fn starts_with(&self, prefix: &Nibbles) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Get common prefix length with another nibbles
    pub fn common_prefix_len(&self, other: &Nibbles) -> usize {
        self.0
            .iter()
            .zip(other.0.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// Encode nibbles with prefix for compact encoding
    /// - For leaf nodes: prefix with 0x20 (even length) or 0x3 (odd length)
    /// - For extension nodes: prefix with 0x00 (even length) or 0x1 (odd length)
    pub fn encode_compact(&self, is_leaf: bool) -> Vec<u8> {
        let odd = self.0.len() % 2 == 1;
        let mut result = Vec::with_capacity((self.0.len() + 2) / 2);

        let prefix = match (is_leaf, odd) {
            (false, false) => 0x00,
            (false, true) => 0x01,
            (true, false) => 0x02,
            (true, true) => 0x03,
        };

        let rest = if odd {
            result.push((prefix << 4) | self.0[0]);
            &self.0[1..]
        } else {
            result.push(prefix << 4);
            &self.0[..]
        };
        for pair in rest.chunks(2) {
            result.push((pair[0] << 4) | pair.get(1).copied().unwrap_or(0));
        }

        result
    }

    /// Decode compact encoding, returning the nibbles and the leaf flag
    pub fn decode_compact(data: &[u8]) -> (Nibbles, bool) {
        if data.is_empty() {
            return (Nibbles(vec![]), false);
        }

        let prefix = data[0] >> 4;
        let is_leaf = prefix >= 2;
        let odd = prefix % 2 == 1;

        let mut nibbles = Vec::with_capacity(data.len() * 2);

        if odd {
            nibbles.push(data[0] & 0x0f);
        }

        for &byte in &data[1..] {
            nibbles.push(byte >> 4);
            nibbles.push(byte & 0x0f);
        }

        (Nibbles(nibbles), is_leaf)
    }
}

/// Trie node types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrieNode {
    /// Empty node
    Empty,
    /// Leaf node with path suffix and value
    Leaf {
        /// Path suffix (compact encoded)
        path: Vec<u8>,
        /// Value stored at this leaf
        value: Vec<u8>,
    },
    /// Extension node with shared path prefix
    Extension {
        /// Shared path prefix (compact encoded)
        path: Vec<u8>,
        /// Hash of child node
        child: Hash,
    },
    /// Branch node with 16 children and optional value
    Branch {
        /// Children (16 slots for each nibble 0-f)
        children: [Option<Hash>; 16],
        /// Value if this node is also a leaf
        value: Option<Vec<u8>>,
    },
}

impl TrieNode {
    /// Compute the hash of this node
    pub fn hash(&self) -> Hash {
        keccak256(&self.encode())
    }

    /// Encode the node for storage
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    /// Decode a node from bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        bincode::deserialize(data).map_err(|e| StorageError::Serialization(e.to_string()))
    }

    /// Hashes of all children referenced by this node
    pub fn child_hashes(&self) -> Vec<Hash> {
        match self {
            TrieNode::Empty | TrieNode::Leaf { .. } => Vec::new(),
            TrieNode::Extension { child, .. } => vec![*child],
            TrieNode::Branch { children, .. } => children.iter().flatten().copied().collect(),
        }
    }
}

/// Outcome of walking a key path through a possibly incomplete local trie
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The key resolves to this value
    Found(Bytes),
    /// The trie proves the key is not present
    Absent,
    /// A node on the key path is not in the local store
    Missing {
        /// Hash of the first missing node
        hash: Hash,
        /// Number of nibbles consumed before reaching it
        depth: usize,
    },
}

/// Walk `key` from `root` using only locally stored nodes.
pub fn lookup<S: NodeStore + ?Sized>(store: &S, root: Hash, key: &[u8]) -> Result<Lookup> {
    let path = Nibbles::from_bytes(key);
    let mut current = root;
    let mut offset = 0;

    loop {
        if current == EMPTY_ROOT || current == ZERO_HASH {
            return Ok(Lookup::Absent);
        }
        let Some(data) = store.get(&current)? else {
            return Ok(Lookup::Missing {
                hash: current,
                depth: offset,
            });
        };
        let remaining = &path.0[offset..];

        match TrieNode::decode(&data)? {
            TrieNode::Empty => return Ok(Lookup::Absent),
            TrieNode::Leaf {
                path: leaf_path,
                value,
            } => {
                let (leaf_nibbles, _) = Nibbles::decode_compact(&leaf_path);
                return Ok(if leaf_nibbles.0 == remaining {
                    Lookup::Found(Bytes::from(value))
                } else {
                    Lookup::Absent
                });
            }
            TrieNode::Extension {
                path: ext_path,
                child,
            } => {
                let (ext_nibbles, _) = Nibbles::decode_compact(&ext_path);
                if !remaining.starts_with(&ext_nibbles.0) {
                    return Ok(Lookup::Absent);
                }
                offset += ext_nibbles.len();
                current = child;
            }
            TrieNode::Branch { children, value } => {
                let Some(&nibble) = remaining.first() else {
                    return Ok(value.map_or(Lookup::Absent, |v| Lookup::Found(Bytes::from(v))));
                };
                match children[nibble as usize] {
                    Some(child) => {
                        offset += 1;
                        current = child;
                    }
                    None => return Ok(Lookup::Absent),
                }
            }
        }
    }
}

/// Merkle Patricia Trie writing its nodes into a [`NodeStore`]
pub struct MerkleTrie<S: NodeStore> {
    /// Node storage (hash -> encoded node)
    store: Arc<S>,
    /// Current root hash
    root: RwLock<Hash>,
}

impl<S: NodeStore> MerkleTrie<S> {
    /// Create a new empty trie
    pub fn new(store: Arc<S>) -> Self {
        Self::open(store, EMPTY_ROOT)
    }

    /// Open a trie at an existing root
    pub fn open(store: Arc<S>, root: Hash) -> Self {
        Self {
            store,
            root: RwLock::new(root),
        }
    }

    /// Get the current root hash
    pub fn root(&self) -> Hash {
        *self.root.read()
    }

    /// The backing store
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Check if the trie is empty
    pub fn is_empty(&self) -> bool {
        *self.root.read() == EMPTY_ROOT
    }

    /// Insert a key-value pair
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let key_nibbles = Nibbles::from_bytes(key);
        let current_root = *self.root.read();

        let new_root = self.insert_at(current_root, key_nibbles, value)?;
        *self.root.write() = new_root;

        Ok(())
    }

    /// Get a value by key. Fails if a node on the path is not stored.
    pub fn get(&self, key: &[u8]) -> Result<Option<Bytes>> {
        match lookup(self.store.as_ref(), self.root(), key)? {
            Lookup::Found(value) => Ok(Some(value)),
            Lookup::Absent => Ok(None),
            Lookup::Missing { hash, .. } => Err(StorageError::NotFound(format!(
                "trie node {}",
                hex::encode(hash)
            ))),
        }
    }

    fn insert_at(&self, node_hash: Hash, path: Nibbles, value: &[u8]) -> Result<Hash> {
        if node_hash == EMPTY_ROOT {
            return self.store_node(TrieNode::Leaf {
                path: path.encode_compact(true),
                value: value.to_vec(),
            });
        }

        match self.get_node(&node_hash)? {
            TrieNode::Empty => self.store_node(TrieNode::Leaf {
                path: path.encode_compact(true),
                value: value.to_vec(),
            }),
            TrieNode::Leaf {
                path: leaf_path,
                value: leaf_value,
            } => {
                let (leaf_nibbles, _) = Nibbles::decode_compact(&leaf_path);

                if leaf_nibbles == path {
                    return self.store_node(TrieNode::Leaf {
                        path: leaf_path,
                        value: value.to_vec(),
                    });
                }

                let common_len = leaf_nibbles.common_prefix_len(&path);
                let mut children: [Option<Hash>; 16] = Default::default();
                let mut branch_value = None;

                self.place_in_branch(&mut children, &mut branch_value, &leaf_nibbles, common_len, &leaf_value)?;
                self.place_in_branch(&mut children, &mut branch_value, &path, common_len, value)?;

                let branch_hash = self.store_node(TrieNode::Branch {
                    children,
                    value: branch_value,
                })?;
                self.with_prefix(&path, common_len, branch_hash)
            }
            TrieNode::Extension {
                path: ext_path,
                child,
            } => {
                let (ext_nibbles, _) = Nibbles::decode_compact(&ext_path);
                let common_len = ext_nibbles.common_prefix_len(&path);

                if common_len == ext_nibbles.len() {
                    let new_child = self.insert_at(child, path.slice(common_len), value)?;
                    return self.store_node(TrieNode::Extension {
                        path: ext_path,
                        child: new_child,
                    });
                }

                // Split the extension at the divergence point
                let mut children: [Option<Hash>; 16] = Default::default();
                let nibble = ext_nibbles.0[common_len] as usize;
                if common_len + 1 < ext_nibbles.len() {
                    children[nibble] = Some(self.store_node(TrieNode::Extension {
                        path: ext_nibbles.slice(common_len + 1).encode_compact(false),
                        child,
                    })?);
                } else {
                    children[nibble] = Some(child);
                }

                let mut branch_value = None;
                self.place_in_branch(&mut children, &mut branch_value, &path, common_len, value)?;

                let branch_hash = self.store_node(TrieNode::Branch {
                    children,
                    value: branch_value,
                })?;
                self.with_prefix(&path, common_len, branch_hash)
            }
            TrieNode::Branch {
                mut children,
                value: branch_value,
            } => match path.first() {
                None => self.store_node(TrieNode::Branch {
                    children,
                    value: Some(value.to_vec()),
                }),
                Some(nibble) => {
                    let child_hash = children[nibble as usize].unwrap_or(EMPTY_ROOT);
                    let new_child = self.insert_at(child_hash, path.slice(1), value)?;
                    children[nibble as usize] = Some(new_child);
                    self.store_node(TrieNode::Branch {
                        children,
                        value: branch_value,
                    })
                }
            },
        }
    }

    /// Put `value` for `path` below a new branch whose shared prefix is `common_len` long
    fn place_in_branch(
        &self,
        children: &mut [Option<Hash>; 16],
        branch_value: &mut Option<Vec<u8>>,
        path: &Nibbles,
        common_len: usize,
        value: &[u8],
    ) -> Result<()> {
        if common_len >= path.len() {
            *branch_value = Some(value.to_vec());
            return Ok(());
        }
        let nibble = path.0[common_len] as usize;
        children[nibble] = Some(self.store_node(TrieNode::Leaf {
            path: path.slice(common_len + 1).encode_compact(true),
            value: value.to_vec(),
        })?);
        Ok(())
    }

    /// Wrap `child` in an extension for the first `common_len` nibbles of `path`
    fn with_prefix(&self, path: &Nibbles, common_len: usize, child: Hash) -> Result<Hash> {
        if common_len == 0 {
            return Ok(child);
        }
        let prefix = Nibbles(path.0[..common_len].to_vec());
        self.store_node(TrieNode::Extension {
            path: prefix.encode_compact(false),
            child,
        })
    }

    /// Store a node and return its hash
    fn store_node(&self, node: TrieNode) -> Result<Hash> {
        let encoded = node.encode();
        let hash = keccak256(&encoded);
        self.store.put(hash, Bytes::from(encoded))?;
        Ok(hash)
    }

    /// Get a node by hash
    fn get_node(&self, hash: &Hash) -> Result<TrieNode> {
        let data = self
            .store
            .get(hash)?
            .ok_or_else(|| StorageError::NotFound(format!("Node not found: {}", hex::encode(hash))))?;
        TrieNode::decode(&data)
    }
}
