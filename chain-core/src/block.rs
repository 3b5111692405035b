//! Blocks
//!
//! A block is constructed once, sealed under the configured [`BlockPolicy`],
//! and never mutated afterwards. The hash covers every other field; the
//! Merkle root commits to the events in order.

use crate::config::BlockPolicy;
use crate::event::Event;
use crate::merkle::{self, MerkleProof, MerkleTree};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// `previous_hash` of the genesis block
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Largest proof-of-work difficulty accepted (leading zero hex digits)
pub const MAX_DIFFICULTY: u32 = 6;

/// Nonces tried before sealing gives up
pub const MAX_NONCE_ATTEMPTS: u64 = 1 << 28;

/// Sealed block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Position in the chain
    pub index: u64,
    /// SHA-256 over all other fields
    pub hash: String,
    /// Hash of the preceding block, `"0"` for genesis
    pub previous_hash: String,
    /// Creation time (unix seconds, advisory)
    pub timestamp: i64,
    /// Merkle root of `events`
    pub merkle_root: String,
    /// Validator that produced the block
    pub validator_identity: Option<String>,
    /// Proof-of-work nonce, 0 under proof-of-stake
    pub nonce: u64,
    /// Required zero prefix, 0 under proof-of-stake
    pub difficulty: u32,
    /// Payload
    pub events: Vec<Event>,
}

impl Block {
    /// Build and seal a block stamped with the current time
    pub fn new(
        index: u64,
        previous_hash: impl Into<String>,
        events: Vec<Event>,
        validator_identity: Option<String>,
        policy: BlockPolicy,
    ) -> Result<Self> {
        Self::with_timestamp(
            index,
            previous_hash,
            chrono::Utc::now().timestamp(),
            events,
            validator_identity,
            policy,
        )
    }

    /// Build and seal a block with an explicit timestamp
    pub fn with_timestamp(
        index: u64,
        previous_hash: impl Into<String>,
        timestamp: i64,
        events: Vec<Event>,
        validator_identity: Option<String>,
        policy: BlockPolicy,
    ) -> Result<Self> {
        let difficulty = policy.difficulty();
        if difficulty > MAX_DIFFICULTY {
            return Err(Error::Validation(format!(
                "difficulty {} exceeds {}",
                difficulty, MAX_DIFFICULTY
            )));
        }

        let mut block = Self {
            index,
            hash: String::new(),
            previous_hash: previous_hash.into(),
            timestamp,
            merkle_root: merkle::merkle_root(&events)?,
            validator_identity,
            nonce: 0,
            difficulty,
            events,
        };
        block.seal()?;
        Ok(block)
    }

    fn seal(&mut self) -> Result<()> {
        self.seal_within(MAX_NONCE_ATTEMPTS)
    }

    fn seal_within(&mut self, max_attempts: u64) -> Result<()> {
        let events_json = serde_json::to_vec(&self.events)?;
        for nonce in 0..max_attempts {
            self.nonce = nonce;
            let hash = self.hash_with(&events_json);
            if has_zero_prefix(&hash, self.difficulty) {
                self.hash = hash;
                return Ok(());
            }
        }
        Err(Error::Precondition(format!(
            "no nonce below {} meets difficulty {}",
            max_attempts, self.difficulty
        )))
    }

    fn hash_with(&self, events_json: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.index.to_be_bytes());
        hasher.update(self.previous_hash.as_bytes());
        hasher.update(self.timestamp.to_be_bytes());
        hasher.update(events_json);
        hasher.update(self.nonce.to_be_bytes());
        hasher.update(self.merkle_root.as_bytes());
        hasher.update(self.validator_identity.as_deref().unwrap_or("").as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Recompute the block hash from the current fields
    pub fn compute_hash(&self) -> Result<String> {
        Ok(self.hash_with(&serde_json::to_vec(&self.events)?))
    }

    /// Self-consistency check with the reason for the first mismatch
    ///
    /// Event signatures are not checked here.
    pub fn verify(&self) -> Result<()> {
        let merkle_root = merkle::merkle_root(&self.events)?;
        if merkle_root != self.merkle_root {
            return Err(Error::Integrity(format!(
                "block {} merkle root mismatch: stored {}, computed {}",
                self.index, self.merkle_root, merkle_root
            )));
        }

        let hash = self.compute_hash()?;
        if hash != self.hash {
            return Err(Error::Integrity(format!(
                "block {} hash mismatch: stored {}, computed {}",
                self.index, self.hash, hash
            )));
        }

        if !has_zero_prefix(&self.hash, self.difficulty) {
            return Err(Error::Integrity(format!(
                "block {} hash does not meet difficulty {}",
                self.index, self.difficulty
            )));
        }

        Ok(())
    }

    /// Whether the stored hash and Merkle root match recomputation
    pub fn is_valid(&self) -> bool {
        self.verify().is_ok()
    }

    /// Genesis block marker
    pub fn is_genesis(&self) -> bool {
        self.index == 0 && self.previous_hash == GENESIS_PREVIOUS_HASH
    }

    /// Inclusion proof for the event at `position`
    pub fn event_proof(&self, position: usize) -> Result<Option<MerkleProof>> {
        Ok(MerkleTree::from_events(&self.events)?.proof(position))
    }

    /// Persisted JSON form
    pub fn to_payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parse the persisted JSON form
    pub fn from_payload(payload: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(payload)?)
    }
}

fn has_zero_prefix(hash: &str, difficulty: u32) -> bool {
    let difficulty = difficulty as usize;
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}
