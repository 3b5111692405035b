//! Merkle commitments over block events
//!
//! Leaves are the hex SHA-256 of each event's JSON payload. Internal nodes
//! hash the concatenation of the two children's hex digests. At odd levels
//! the last node is paired with itself. An empty tree commits to the hash of
//! the empty string.

use crate::crypto::hash_hex;
use crate::event::Event;
use crate::Result;

/// Combine two hex digests into their parent
fn hash_pair(left: &str, right: &str) -> String {
    let mut joined = String::with_capacity(left.len() + right.len());
    joined.push_str(left);
    joined.push_str(right);
    hash_hex(joined)
}

/// Leaf digest of one event
pub fn leaf_hash(event: &Event) -> Result<String> {
    Ok(hash_hex(event.payload_bytes()?))
}

/// Merkle root of a list of events
pub fn merkle_root(events: &[Event]) -> Result<String> {
    let leaves = events.iter().map(leaf_hash).collect::<Result<Vec<_>>>()?;
    Ok(MerkleTree::from_leaves(leaves).root())
}

/// Sibling position relative to the running hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Sibling is on the left
    Left,
    /// Sibling is on the right
    Right,
}

/// Inclusion proof for a single event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleProof {
    /// Leaf being proven
    pub leaf_hash: String,
    /// Siblings from the leaf level upwards
    pub siblings: Vec<(Direction, String)>,
    /// Root the proof resolves to
    pub root_hash: String,
}

impl MerkleProof {
    /// Fold the siblings and compare against `root_hash`
    pub fn verify(&self) -> bool {
        let computed = self
            .siblings
            .iter()
            .fold(self.leaf_hash.clone(), |current, (direction, sibling)| match direction {
                Direction::Left => hash_pair(sibling, &current),
                Direction::Right => hash_pair(&current, sibling),
            });
        computed == self.root_hash
    }
}

/// Merkle tree over hex leaves
#[derive(Debug, Clone, Default)]
pub struct MerkleTree {
    leaves: Vec<String>,
}

impl MerkleTree {
    /// Tree over the given leaf digests
    pub fn from_leaves(leaves: Vec<String>) -> Self {
        Self { leaves }
    }

    /// Tree over the events of a block
    pub fn from_events(events: &[Event]) -> Result<Self> {
        let leaves = events.iter().map(leaf_hash).collect::<Result<Vec<_>>>()?;
        Ok(Self::from_leaves(leaves))
    }

    /// Number of leaves
    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    /// Whether the tree has no leaves
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    fn next_level(level: &[String]) -> Vec<String> {
        level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => hash_pair(left, right),
                [only] => hash_pair(only, only),
                _ => unreachable!("chunks(2) yields one or two items"),
            })
            .collect()
    }

    /// Root digest
    pub fn root(&self) -> String {
        if self.leaves.is_empty() {
            return hash_hex("");
        }

        let mut level = self.leaves.clone();
        while level.len() > 1 {
            level = Self::next_level(&level);
        }
        level.swap_remove(0)
    }

    /// Inclusion proof for the leaf at `index`
    pub fn proof(&self, index: usize) -> Option<MerkleProof> {
        let leaf_hash = self.leaves.get(index)?.clone();
        let mut siblings = Vec::new();
        let mut level = self.leaves.clone();
        let mut position = index;

        while level.len() > 1 {
            if position % 2 == 0 {
                let sibling = level.get(position + 1).unwrap_or(&level[position]);
                siblings.push((Direction::Right, sibling.clone()));
            } else {
                siblings.push((Direction::Left, level[position - 1].clone()));
            }
            level = Self::next_level(&level);
            position /= 2;
        }

        Some(MerkleProof {
            leaf_hash,
            siblings,
            root_hash: level.swap_remove(0),
        })
    }
}
