//! The chain: an ordered list of committed blocks
//!
//! There is one writer. Blocks are persisted before they become visible in
//! memory, so a failed write leaves the chain exactly as it was.

use crate::block::{Block, GENESIS_PREVIOUS_HASH};
use crate::config::BlockPolicy;
use crate::event::Event;
use crate::metrics::Metrics;
use crate::storage::LedgerStore;
use crate::{Error, Result};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Summary of the chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainStats {
    /// Number of blocks
    pub length: usize,
    /// Events across all blocks
    pub total_events: usize,
    /// Block policy name
    pub consensus: &'static str,
    /// Result of [`Chain::is_valid`]
    pub is_valid: bool,
}

/// Append-only chain backed by a [`LedgerStore`]
#[derive(Debug)]
pub struct Chain {
    store: Arc<dyn LedgerStore>,
    blocks: Vec<Block>,
    policy: BlockPolicy,
    metrics: Metrics,
}

impl Chain {
    /// Load all committed blocks from `store`
    pub fn load(store: Arc<dyn LedgerStore>, policy: BlockPolicy) -> Result<Self> {
        let blocks = store.list_blocks_ordered_by_index()?;
        let metrics = Metrics::new()?;
        metrics.set_chain_length(blocks.len());

        tracing::info!(
            length = blocks.len(),
            consensus = policy.name(),
            "Chain loaded"
        );

        Ok(Self {
            store,
            blocks,
            policy,
            metrics,
        })
    }

    /// Unpersisted genesis block: index 0, previous hash `"0"`, no validator
    pub fn genesis_block(events: Vec<Event>, policy: BlockPolicy) -> Result<Block> {
        Block::new(0, GENESIS_PREVIOUS_HASH, events, None, policy)
    }

    /// Persist the genesis block; the chain must be empty
    pub fn create_genesis(&mut self, events: Vec<Event>) -> Result<&Block> {
        if !self.blocks.is_empty() {
            return Err(Error::Precondition(format!(
                "genesis already exists, chain has {} blocks",
                self.blocks.len()
            )));
        }
        let block = Self::genesis_block(events, self.policy)?;
        self.commit(block)
    }

    /// Seal `events` into a new block on top of the tail and persist it
    pub fn append(&mut self, events: Vec<Event>, validator_identity: Option<String>) -> Result<&Block> {
        let previous_hash = self
            .blocks
            .last()
            .map(|b| b.hash.clone())
            .unwrap_or_else(|| GENESIS_PREVIOUS_HASH.to_string());
        let block = Block::new(
            self.blocks.len() as u64,
            previous_hash,
            events,
            validator_identity,
            self.policy,
        )?;
        self.commit(block)
    }

    fn commit(&mut self, block: Block) -> Result<&Block> {
        let start = Instant::now();

        self.store.insert_block(&block).map_err(|e| match e {
            Error::Persistence(_) => e,
            other => Error::Persistence(other.to_string()),
        })?;

        self.metrics.record_block_appended(
            block.events.len(),
            self.blocks.len() + 1,
            start.elapsed().as_secs_f64(),
        );

        tracing::info!(
            block_index = block.index,
            hash = %block.hash,
            event_count = block.events.len(),
            validator = block.validator_identity.as_deref().unwrap_or("-"),
            "Block appended"
        );

        self.blocks.push(block);
        Ok(&self.blocks[self.blocks.len() - 1])
    }

    /// First integrity violation, walking from index 1
    pub fn validate(&self) -> Result<()> {
        for pair in self.blocks.windows(2) {
            let (previous, current) = (&pair[0], &pair[1]);
            current.verify()?;
            if current.previous_hash != previous.hash {
                return Err(Error::Integrity(format!(
                    "block {} does not link to block {}: expected {}, found {}",
                    current.index, previous.index, previous.hash, current.previous_hash
                )));
            }
        }
        Ok(())
    }

    /// Every block after genesis is self-consistent and linked to its predecessor
    pub fn is_valid(&self) -> bool {
        match self.validate() {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Chain validation failed");
                false
            }
        }
    }

    /// Most recently stated collateral in any genesis allocation
    pub fn collateral_default(&self) -> Result<Decimal> {
        self.blocks
            .iter()
            .rev()
            .flat_map(|block| block.events.iter().rev())
            .find_map(|event| match event {
                Event::GenesisAllocation(genesis) => genesis.collateral,
                _ => None,
            })
            .ok_or_else(|| {
                Error::Precondition("no genesis allocation states a collateral".to_string())
            })
    }

    /// Chain summary
    pub fn stats(&self) -> ChainStats {
        ChainStats {
            length: self.blocks.len(),
            total_events: self.blocks.iter().map(|b| b.events.len()).sum(),
            consensus: self.policy.name(),
            is_valid: self.is_valid(),
        }
    }

    /// Tail block
    pub fn latest_block(&self) -> Option<&Block> {
        self.blocks.last()
    }

    /// Block at `index`
    pub fn block(&self, index: u64) -> Option<&Block> {
        usize::try_from(index).ok().and_then(|i| self.blocks.get(i))
    }

    /// All blocks in order
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Number of blocks
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// No genesis yet
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Block sealing policy
    pub fn policy(&self) -> BlockPolicy {
        self.policy
    }

    /// Backing store
    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    /// Chain metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::event::{Allocation, GenesisAllocation, Transfer};
    use crate::storage::MemoryStore;
    use crate::types::{QueueItem, SettledTransaction, Validator, Wallet};

    fn chain() -> Chain {
        Chain::load(Arc::new(MemoryStore::new()), BlockPolicy::ProofOfStake).unwrap()
    }

    fn genesis(issuer: &KeyPair, collateral: Option<i64>) -> Event {
        let mut genesis = GenesisAllocation::new(
            issuer.public_key_hex(),
            Decimal::from(1_000_000),
            vec![Allocation {
                recipient: issuer.public_key_hex().to_string(),
                amount: Decimal::from(1_000_000),
            }],
        );
        if let Some(c) = collateral {
            genesis = genesis.with_collateral(Decimal::from(c));
        }
        Event::from(genesis).signed(issuer).unwrap()
    }

    fn transfer(amount: i64) -> Event {
        Event::from(Transfer::new("A", "B", Decimal::from(amount), 1))
    }

    #[test]
    fn test_genesis_and_append_link() {
        let issuer = KeyPair::generate();
        let mut chain = chain();
        let genesis_hash = chain.create_genesis(vec![genesis(&issuer, Some(10_000))]).unwrap().hash.clone();

        let block = chain.append(vec![transfer(500)], Some("V".into())).unwrap();
        assert_eq!(block.index, 1);
        assert_eq!(block.previous_hash, genesis_hash);

        assert_eq!(chain.len(), 2);
        assert!(chain.is_valid());
        assert!(chain.block(0).unwrap().is_genesis());
        assert_eq!(chain.latest_block().unwrap().index, 1);
    }

    #[test]
    fn test_second_genesis_is_precondition_error() {
        let issuer = KeyPair::generate();
        let mut chain = chain();
        chain.create_genesis(vec![genesis(&issuer, None)]).unwrap();
        let err = chain.create_genesis(vec![]).unwrap_err();
        assert!(matches!(err, Error::Precondition(_)));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_append_on_empty_chain_uses_sentinel() {
        let mut chain = chain();
        let block = chain.append(vec![transfer(1)], None).unwrap();
        assert_eq!(block.index, 0);
        assert_eq!(block.previous_hash, GENESIS_PREVIOUS_HASH);
    }

    #[test]
    fn test_reload_from_store() {
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryStore::new());
        let mut chain = Chain::load(store.clone(), BlockPolicy::ProofOfStake).unwrap();
        chain.append(vec![transfer(1)], None).unwrap();
        chain.append(vec![transfer(2)], None).unwrap();

        let reloaded = Chain::load(store, BlockPolicy::ProofOfStake).unwrap();
        assert_eq!(reloaded.blocks(), chain.blocks());
        assert!(reloaded.is_valid());
    }

    #[test]
    fn test_broken_link_is_detected() {
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryStore::new());
        store
            .insert_block(&Block::with_timestamp(0, "0", 1, vec![], None, BlockPolicy::ProofOfStake).unwrap())
            .unwrap();
        // Self-consistent, but linked to nothing
        store
            .insert_block(&Block::with_timestamp(1, "feed", 2, vec![], None, BlockPolicy::ProofOfStake).unwrap())
            .unwrap();

        let chain = Chain::load(store, BlockPolicy::ProofOfStake).unwrap();
        assert!(!chain.is_valid());
        let err = chain.validate().unwrap_err();
        assert!(err.to_string().contains("does not link"));
    }

    #[test]
    fn test_collateral_default() {
        let issuer = KeyPair::generate();
        let mut chain = chain();
        assert!(matches!(chain.collateral_default(), Err(Error::Precondition(_))));

        chain.create_genesis(vec![genesis(&issuer, Some(10_000))]).unwrap();
        assert_eq!(chain.collateral_default().unwrap(), Decimal::from(10_000));

        chain.append(vec![genesis(&issuer, Some(25_000))], None).unwrap();
        assert_eq!(chain.collateral_default().unwrap(), Decimal::from(25_000));
    }

    #[test]
    fn test_stats() {
        let mut chain = chain();
        chain.append(vec![transfer(1), transfer(2)], None).unwrap();
        chain.append(vec![transfer(3)], None).unwrap();

        let stats = chain.stats();
        assert_eq!(stats.length, 2);
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.consensus, "proof_of_stake");
        assert!(stats.is_valid);
        assert_eq!(chain.metrics().blocks_total.get(), 2);
    }

    #[derive(Debug, Default)]
    struct RejectingStore {
        inner: MemoryStore,
    }

    impl LedgerStore for RejectingStore {
        fn insert_block(&self, _block: &Block) -> Result<()> {
            Err(Error::Persistence("disk full".into()))
        }
        fn list_blocks_ordered_by_index(&self) -> Result<Vec<Block>> {
            self.inner.list_blocks_ordered_by_index()
        }
        fn insert_queue_item(&self, item: &QueueItem) -> Result<()> {
            self.inner.insert_queue_item(item)
        }
        fn put_queue_item(&self, item: &QueueItem) -> Result<()> {
            self.inner.put_queue_item(item)
        }
        fn find_queue_item_by_hash(&self, hash: &str) -> Result<Option<QueueItem>> {
            self.inner.find_queue_item_by_hash(hash)
        }
        fn list_queue_items(&self) -> Result<Vec<QueueItem>> {
            self.inner.list_queue_items()
        }
        fn upsert_validator(&self, validator: &Validator) -> Result<()> {
            self.inner.upsert_validator(validator)
        }
        fn find_validator_by_public_key(&self, public_key: &str) -> Result<Option<Validator>> {
            self.inner.find_validator_by_public_key(public_key)
        }
        fn list_validators(&self) -> Result<Vec<Validator>> {
            self.inner.list_validators()
        }
        fn find_settled_transaction(&self, hash: &str) -> Result<Option<SettledTransaction>> {
            self.inner.find_settled_transaction(hash)
        }
        fn commit_settlement(&self, transaction: &SettledTransaction, wallets: &[Wallet]) -> Result<()> {
            self.inner.commit_settlement(transaction, wallets)
        }
        fn find_wallet(&self, public_key: &str) -> Result<Option<Wallet>> {
            self.inner.find_wallet(public_key)
        }
        fn upsert_wallet(&self, wallet: &Wallet) -> Result<()> {
            self.inner.upsert_wallet(wallet)
        }
        fn list_wallets(&self) -> Result<Vec<Wallet>> {
            self.inner.list_wallets()
        }
        fn reset(&self) -> Result<()> {
            self.inner.reset()
        }
    }

    #[test]
    fn test_failed_persist_leaves_chain_untouched() {
        let mut chain = Chain::load(Arc::new(RejectingStore::default()), BlockPolicy::ProofOfStake).unwrap();
        let err = chain.append(vec![transfer(1)], None).unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));
        assert!(chain.is_empty());
        assert_eq!(chain.metrics().blocks_total.get(), 0);
    }
}
