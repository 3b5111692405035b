//! Storage layer
//!
//! [`LedgerStore`] is the only way components touch persisted state. Two
//! implementations:
//!
//! - [`MemoryStore`] - everything behind one `RwLock`, used by tests
//! - [`RocksStore`] - RocksDB with one column family per record type
//!
//! # Column Families
//!
//! - `blocks` - Committed blocks (key: index, big endian), JSON
//! - `queue` - Settlement queue items (key: settlement hash), JSON
//! - `validators` - Validator registry (key: public key), bincode
//! - `settled` - Settled transactions (key: settlement hash), bincode
//! - `wallets` - Wallet balances (key: public key), bincode
//!
//! Blocks and queue items embed tagged events, which bincode cannot decode,
//! so they are stored as JSON.

use crate::{
    block::Block,
    error::{Error, Result},
    types::{QueueItem, QueueStatus, SettledTransaction, Validator, Wallet},
    Config,
};
use parking_lot::RwLock;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Persistence interface for the chain, registry and settlement queue
pub trait LedgerStore: Send + Sync + fmt::Debug {
    /// Persist a new block; its index must not be taken
    fn insert_block(&self, block: &Block) -> Result<()>;

    /// All blocks, lowest index first
    fn list_blocks_ordered_by_index(&self) -> Result<Vec<Block>>;

    /// Persist a new queue item; `DuplicateEvent` if its hash is already queued
    fn insert_queue_item(&self, item: &QueueItem) -> Result<()>;

    /// Overwrite an existing queue item
    fn put_queue_item(&self, item: &QueueItem) -> Result<()>;

    /// Queue item by settlement hash
    fn find_queue_item_by_hash(&self, hash: &str) -> Result<Option<QueueItem>>;

    /// All queue items ordered by timestamp, then id
    fn list_queue_items(&self) -> Result<Vec<QueueItem>>;

    /// Insert or replace a validator
    fn upsert_validator(&self, validator: &Validator) -> Result<()>;

    /// Validator by public key
    fn find_validator_by_public_key(&self, public_key: &str) -> Result<Option<Validator>>;

    /// All validators ordered by public key
    fn list_validators(&self) -> Result<Vec<Validator>>;

    /// Settled transaction by settlement hash
    fn find_settled_transaction(&self, hash: &str) -> Result<Option<SettledTransaction>>;

    /// Record a settled transaction together with the wallets it changed, atomically
    ///
    /// `DuplicateEvent` if the hash is already settled; nothing is written then.
    fn commit_settlement(&self, transaction: &SettledTransaction, wallets: &[Wallet]) -> Result<()>;

    /// Wallet by public key
    fn find_wallet(&self, public_key: &str) -> Result<Option<Wallet>>;

    /// Insert or replace a wallet
    fn upsert_wallet(&self, wallet: &Wallet) -> Result<()>;

    /// All wallets ordered by public key
    fn list_wallets(&self) -> Result<Vec<Wallet>>;

    /// Remove every record
    fn reset(&self) -> Result<()>;

    /// Move a queue item through the settlement state machine
    fn update_queue_item_status(
        &self,
        hash: &str,
        status: QueueStatus,
        reason: Option<String>,
    ) -> Result<QueueItem> {
        let mut item = self
            .find_queue_item_by_hash(hash)?
            .ok_or_else(|| Error::NotFound(format!("queue item {}", hash)))?;
        item.transition(status, reason)?;
        self.put_queue_item(&item)?;
        Ok(item)
    }
}

fn sort_queue(items: &mut [QueueItem]) {
    items.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}

#[derive(Debug, Default)]
struct MemoryState {
    blocks: BTreeMap<u64, Block>,
    queue: HashMap<String, QueueItem>,
    validators: BTreeMap<String, Validator>,
    settled: HashMap<String, SettledTransaction>,
    wallets: BTreeMap<String, Wallet>,
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl LedgerStore for MemoryStore {
    fn insert_block(&self, block: &Block) -> Result<()> {
        let mut state = self.state.write();
        if state.blocks.contains_key(&block.index) {
            return Err(Error::Persistence(format!("block {} already stored", block.index)));
        }
        state.blocks.insert(block.index, block.clone());
        Ok(())
    }

    fn list_blocks_ordered_by_index(&self) -> Result<Vec<Block>> {
        Ok(self.state.read().blocks.values().cloned().collect())
    }

    fn insert_queue_item(&self, item: &QueueItem) -> Result<()> {
        let mut state = self.state.write();
        if state.queue.contains_key(&item.event_hash) {
            return Err(Error::DuplicateEvent(item.event_hash.clone()));
        }
        state.queue.insert(item.event_hash.clone(), item.clone());
        Ok(())
    }

    fn put_queue_item(&self, item: &QueueItem) -> Result<()> {
        let mut state = self.state.write();
        match state.queue.get_mut(&item.event_hash) {
            Some(existing) => {
                *existing = item.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("queue item {}", item.event_hash))),
        }
    }

    fn find_queue_item_by_hash(&self, hash: &str) -> Result<Option<QueueItem>> {
        Ok(self.state.read().queue.get(hash).cloned())
    }

    fn list_queue_items(&self) -> Result<Vec<QueueItem>> {
        let mut items: Vec<QueueItem> = self.state.read().queue.values().cloned().collect();
        sort_queue(&mut items);
        Ok(items)
    }

    fn upsert_validator(&self, validator: &Validator) -> Result<()> {
        self.state
            .write()
            .validators
            .insert(validator.public_key.clone(), validator.clone());
        Ok(())
    }

    fn find_validator_by_public_key(&self, public_key: &str) -> Result<Option<Validator>> {
        Ok(self.state.read().validators.get(public_key).cloned())
    }

    fn list_validators(&self) -> Result<Vec<Validator>> {
        Ok(self.state.read().validators.values().cloned().collect())
    }

    fn find_settled_transaction(&self, hash: &str) -> Result<Option<SettledTransaction>> {
        Ok(self.state.read().settled.get(hash).cloned())
    }

    fn commit_settlement(&self, transaction: &SettledTransaction, wallets: &[Wallet]) -> Result<()> {
        let mut state = self.state.write();
        if state.settled.contains_key(&transaction.hash) {
            return Err(Error::DuplicateEvent(transaction.hash.clone()));
        }
        state.settled.insert(transaction.hash.clone(), transaction.clone());
        for wallet in wallets {
            state.wallets.insert(wallet.public_key.clone(), wallet.clone());
        }
        Ok(())
    }

    fn find_wallet(&self, public_key: &str) -> Result<Option<Wallet>> {
        Ok(self.state.read().wallets.get(public_key).cloned())
    }

    fn upsert_wallet(&self, wallet: &Wallet) -> Result<()> {
        self.state
            .write()
            .wallets
            .insert(wallet.public_key.clone(), wallet.clone());
        Ok(())
    }

    fn list_wallets(&self) -> Result<Vec<Wallet>> {
        Ok(self.state.read().wallets.values().cloned().collect())
    }

    fn reset(&self) -> Result<()> {
        *self.state.write() = MemoryState::default();
        Ok(())
    }
}

/// Column family names
const CF_BLOCKS: &str = "blocks";
const CF_QUEUE: &str = "queue";
const CF_VALIDATORS: &str = "validators";
const CF_SETTLED: &str = "settled";
const CF_WALLETS: &str = "wallets";

const COLUMN_FAMILIES: [&str; 5] = [CF_BLOCKS, CF_QUEUE, CF_VALIDATORS, CF_SETTLED, CF_WALLETS];

/// RocksDB-backed store
pub struct RocksStore {
    db: DB,
}

impl fmt::Debug for RocksStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RocksStore")
            .field("path", &self.db.path())
            .finish()
    }
}

impl RocksStore {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;

        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        if config.rocksdb.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name)))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        tracing::info!(
            path = %path.display(),
            column_families = COLUMN_FAMILIES.len(),
            "Opened RocksDB"
        );

        Ok(Self { db })
    }

    fn cf_options(name: &str) -> Options {
        let mut opts = Options::default();
        match name {
            // Append-only and rarely re-read
            CF_BLOCKS | CF_SETTLED => {
                opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
            }
            // Point lookups by hash or key
            _ => {
                opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
                let mut block_opts = rocksdb::BlockBasedOptions::default();
                block_opts.set_bloom_filter(10.0, false);
                opts.set_block_based_table_factory(&block_opts);
            }
        }
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Persistence(format!("Column family {} not found", name)))
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        match self.db.get_cf(self.cf_handle(cf)?, key)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn get_bincode<T: serde::de::DeserializeOwned>(&self, cf: &str, key: &[u8]) -> Result<Option<T>> {
        match self.db.get_cf(self.cf_handle(cf)?, key)? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn scan<T>(&self, cf: &str, decode: impl Fn(&[u8]) -> Result<T>) -> Result<Vec<T>> {
        let mut out = Vec::new();
        for item in self.db.iterator_cf(self.cf_handle(cf)?, IteratorMode::Start) {
            let (_, value) = item?;
            out.push(decode(&value[..])?);
        }
        Ok(out)
    }

    /// Close database (graceful shutdown)
    pub fn close(self) -> Result<()> {
        drop(self.db);
        tracing::info!("RocksDB closed gracefully");
        Ok(())
    }
}

impl LedgerStore for RocksStore {
    fn insert_block(&self, block: &Block) -> Result<()> {
        let cf = self.cf_handle(CF_BLOCKS)?;
        let key = block.index.to_be_bytes();
        if self.db.get_cf(cf, key)?.is_some() {
            return Err(Error::Persistence(format!("block {} already stored", block.index)));
        }

        let value = serde_json::to_vec(block)?;
        self.db.put_cf(cf, key, value)?;

        tracing::debug!(
            block_index = block.index,
            hash = %block.hash,
            event_count = block.events.len(),
            "Block persisted"
        );

        Ok(())
    }

    fn list_blocks_ordered_by_index(&self) -> Result<Vec<Block>> {
        // Big-endian keys iterate in index order
        self.scan(CF_BLOCKS, |value| Ok(serde_json::from_slice(value)?))
    }

    fn insert_queue_item(&self, item: &QueueItem) -> Result<()> {
        let cf = self.cf_handle(CF_QUEUE)?;
        if self.db.get_cf(cf, item.event_hash.as_bytes())?.is_some() {
            return Err(Error::DuplicateEvent(item.event_hash.clone()));
        }
        self.db
            .put_cf(cf, item.event_hash.as_bytes(), serde_json::to_vec(item)?)?;
        Ok(())
    }

    fn put_queue_item(&self, item: &QueueItem) -> Result<()> {
        let cf = self.cf_handle(CF_QUEUE)?;
        if self.db.get_cf(cf, item.event_hash.as_bytes())?.is_none() {
            return Err(Error::NotFound(format!("queue item {}", item.event_hash)));
        }
        self.db
            .put_cf(cf, item.event_hash.as_bytes(), serde_json::to_vec(item)?)?;
        Ok(())
    }

    fn find_queue_item_by_hash(&self, hash: &str) -> Result<Option<QueueItem>> {
        self.get_json(CF_QUEUE, hash.as_bytes())
    }

    fn list_queue_items(&self) -> Result<Vec<QueueItem>> {
        let mut items = self.scan(CF_QUEUE, |value| Ok(serde_json::from_slice(value)?))?;
        sort_queue(&mut items);
        Ok(items)
    }

    fn upsert_validator(&self, validator: &Validator) -> Result<()> {
        let cf = self.cf_handle(CF_VALIDATORS)?;
        self.db.put_cf(
            cf,
            validator.public_key.as_bytes(),
            bincode::serialize(validator)?,
        )?;
        Ok(())
    }

    fn find_validator_by_public_key(&self, public_key: &str) -> Result<Option<Validator>> {
        self.get_bincode(CF_VALIDATORS, public_key.as_bytes())
    }

    fn list_validators(&self) -> Result<Vec<Validator>> {
        self.scan(CF_VALIDATORS, |value| Ok(bincode::deserialize(value)?))
    }

    fn find_settled_transaction(&self, hash: &str) -> Result<Option<SettledTransaction>> {
        self.get_bincode(CF_SETTLED, hash.as_bytes())
    }

    fn commit_settlement(&self, transaction: &SettledTransaction, wallets: &[Wallet]) -> Result<()> {
        let cf_settled = self.cf_handle(CF_SETTLED)?;
        if self.db.get_cf(cf_settled, transaction.hash.as_bytes())?.is_some() {
            return Err(Error::DuplicateEvent(transaction.hash.clone()));
        }

        let mut batch = WriteBatch::default();

        batch.put_cf(
            cf_settled,
            transaction.hash.as_bytes(),
            bincode::serialize(transaction)?,
        );

        let cf_wallets = self.cf_handle(CF_WALLETS)?;
        for wallet in wallets {
            batch.put_cf(cf_wallets, wallet.public_key.as_bytes(), bincode::serialize(wallet)?);
        }

        self.db.write(batch)?;

        Ok(())
    }

    fn find_wallet(&self, public_key: &str) -> Result<Option<Wallet>> {
        self.get_bincode(CF_WALLETS, public_key.as_bytes())
    }

    fn upsert_wallet(&self, wallet: &Wallet) -> Result<()> {
        let cf = self.cf_handle(CF_WALLETS)?;
        self.db
            .put_cf(cf, wallet.public_key.as_bytes(), bincode::serialize(wallet)?)?;
        Ok(())
    }

    fn list_wallets(&self) -> Result<Vec<Wallet>> {
        self.scan(CF_WALLETS, |value| Ok(bincode::deserialize(value)?))
    }

    fn reset(&self) -> Result<()> {
        let mut batch = WriteBatch::default();
        for name in COLUMN_FAMILIES {
            let cf = self.cf_handle(name)?;
            for item in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (key, _) = item?;
                batch.delete_cf(cf, key);
            }
        }
        self.db.write(batch)?;
        tracing::warn!(path = %self.db.path().display(), "Store reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlockPolicy;
    use crate::event::{Event, Transfer};
    use rust_decimal::Decimal;
    use tempfile::TempDir;

    fn rocks_store() -> (RocksStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();
        (RocksStore::open(&config).unwrap(), temp_dir)
    }

    fn block(index: u64) -> Block {
        let events = vec![Event::from(Transfer::new("A", "B", Decimal::from(index as i64 + 1), 10))];
        Block::with_timestamp(index, "prev", 10, events, None, BlockPolicy::ProofOfStake).unwrap()
    }

    fn queue_item(amount: i64, timestamp: i64) -> QueueItem {
        let event = Event::from(Transfer::new("A", "B", Decimal::from(amount), timestamp));
        let entry = event.settlement_entries(0).remove(0);
        QueueItem::pending(&entry, &event, 1)
    }

    fn exercise_blocks(store: &dyn LedgerStore) {
        for index in [2u64, 0, 1, 10] {
            store.insert_block(&block(index)).unwrap();
        }
        let indices: Vec<u64> = store
            .list_blocks_ordered_by_index()
            .unwrap()
            .iter()
            .map(|b| b.index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 10]);

        assert!(matches!(store.insert_block(&block(1)), Err(Error::Persistence(_))));
        assert!(store.list_blocks_ordered_by_index().unwrap()[1].is_valid());
    }

    fn exercise_queue(store: &dyn LedgerStore) {
        let late = queue_item(1, 20);
        let early = queue_item(2, 10);
        store.insert_queue_item(&late).unwrap();
        store.insert_queue_item(&early).unwrap();

        assert!(matches!(store.insert_queue_item(&late), Err(Error::DuplicateEvent(_))));

        let listed = store.list_queue_items().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].event_hash, early.event_hash);

        let updated = store
            .update_queue_item_status(&early.event_hash, QueueStatus::Processing, None)
            .unwrap();
        assert_eq!(updated.status, QueueStatus::Processing);

        let err = store
            .update_queue_item_status(&early.event_hash, QueueStatus::Pending, None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));

        let stored = store.find_queue_item_by_hash(&early.event_hash).unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Processing);
        assert!(store.find_queue_item_by_hash("missing").unwrap().is_none());
    }

    fn exercise_settlement(store: &dyn LedgerStore) {
        let item = queue_item(5, 1);
        let transaction = item.settled();
        let mut from = Wallet::new("A");
        from.apply(Decimal::from(-5));
        let mut to = Wallet::new("B");
        to.apply(Decimal::from(5));

        store.commit_settlement(&transaction, &[from, to]).unwrap();
        assert!(store.find_settled_transaction(&transaction.hash).unwrap().is_some());
        assert_eq!(store.find_wallet("B").unwrap().unwrap().balance, Decimal::from(5));

        // Second commit is rejected and changes nothing
        let mut bogus = Wallet::new("B");
        bogus.apply(Decimal::from(1_000));
        let err = store.commit_settlement(&transaction, &[bogus]).unwrap_err();
        assert!(matches!(err, Error::DuplicateEvent(_)));
        assert_eq!(store.find_wallet("B").unwrap().unwrap().balance, Decimal::from(5));
        assert_eq!(store.list_wallets().unwrap().len(), 2);
    }

    fn exercise_validators(store: &dyn LedgerStore) {
        store.upsert_validator(&Validator::new("V2", Decimal::from(10))).unwrap();
        store.upsert_validator(&Validator::new("V1", Decimal::from(20))).unwrap();

        let mut updated = Validator::new("V2", Decimal::from(10));
        updated.approved = true;
        store.upsert_validator(&updated).unwrap();

        let listed = store.list_validators().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].public_key, "V1");
        assert!(store.find_validator_by_public_key("V2").unwrap().unwrap().approved);
    }

    fn exercise_all(store: &dyn LedgerStore) {
        exercise_blocks(store);
        exercise_queue(store);
        exercise_settlement(store);
        exercise_validators(store);

        store.reset().unwrap();
        assert!(store.list_blocks_ordered_by_index().unwrap().is_empty());
        assert!(store.list_queue_items().unwrap().is_empty());
        assert!(store.list_validators().unwrap().is_empty());
        assert!(store.list_wallets().unwrap().is_empty());
    }

    #[test]
    fn test_memory_store() {
        exercise_all(&MemoryStore::new());
    }

    #[test]
    fn test_rocks_store() {
        let (store, _temp) = rocks_store();
        exercise_all(&store);
    }

    #[test]
    fn test_rocks_store_reopens_with_data() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        let store = RocksStore::open(&config).unwrap();
        store.insert_block(&block(0)).unwrap();
        store.upsert_validator(&Validator::new("V", Decimal::from(1))).unwrap();
        store.close().unwrap();

        let store = RocksStore::open(&config).unwrap();
        assert_eq!(store.list_blocks_ordered_by_index().unwrap().len(), 1);
        assert!(store.find_validator_by_public_key("V").unwrap().is_some());
    }

    #[test]
    fn test_put_unknown_queue_item_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(store.put_queue_item(&queue_item(1, 1)), Err(Error::NotFound(_))));
    }
}
