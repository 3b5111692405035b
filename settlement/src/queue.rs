//! Settlement queue
//!
//! Turns committed chain events into applied ledger effects exactly once.
//!
//! 1. **Extraction**: every settlement entry of every event becomes a
//!    `pending` item unless its hash is already queued or settled
//! 2. **Processing**: items are taken in (timestamp, id) order, validated,
//!    re-authenticated against their source event, applied, and recorded as
//!    settled in one atomic store write
//!
//! A failing item is marked `failed` with a reason and the batch continues.
//! Only a store failure while recording an outcome aborts processing.

use crate::config::QueueConfig;
use crate::Result;
use chain_core::event::short;
use chain_core::{
    Chain, Error as ChainError, Event, LedgerStore, Metrics, QueueItem, QueueStatus,
    ValidatorRegistry, Wallet,
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Counts per status
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// All items
    pub total: usize,
    /// Waiting
    pub pending: usize,
    /// Picked up but not finished (left over from an interrupted run)
    pub processing: usize,
    /// Applied
    pub completed: usize,
    /// Rejected
    pub failed: usize,
}

/// Outcome of [`SettlementQueue::extract_from_chain`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractReport {
    /// Settlement entries looked at
    pub scanned: usize,
    /// New pending items
    pub created: usize,
    /// Entries whose hash was already queued
    pub already_queued: usize,
    /// Entries whose hash was already settled
    pub already_settled: usize,
}

/// Outcome of [`SettlementQueue::process_pending`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessReport {
    /// Pending items picked up
    pub processed: usize,
    /// Items applied
    pub completed: usize,
    /// Items rejected
    pub failed: usize,
    /// Items left in `processing` by an interrupted run, now resolved
    pub interrupted: usize,
}

/// Settlement queue over a [`LedgerStore`]
#[derive(Debug)]
pub struct SettlementQueue {
    store: Arc<dyn LedgerStore>,
    registry: ValidatorRegistry,
    config: QueueConfig,
    metrics: Metrics,
}

impl SettlementQueue {
    /// Queue with its own metrics
    pub fn new(store: Arc<dyn LedgerStore>, registry: ValidatorRegistry, config: QueueConfig) -> Result<Self> {
        Ok(Self {
            store,
            registry,
            config,
            metrics: Metrics::new().map_err(ChainError::from)?,
        })
    }

    /// Report into an existing metrics collector (usually the chain's)
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Queue items for every settlement entry not yet queued or settled
    ///
    /// Safe to re-run: a second pass over the same chain creates nothing.
    pub fn extract_from_chain(&self, chain: &Chain) -> Result<ExtractReport> {
        let mut report = ExtractReport::default();

        for block in chain.blocks() {
            for event in &block.events {
                for entry in event.settlement_entries(block.timestamp) {
                    report.scanned += 1;
                    let hash = entry.hash();

                    if self.store.find_queue_item_by_hash(&hash)?.is_some() {
                        report.already_queued += 1;
                        continue;
                    }
                    if self.store.find_settled_transaction(&hash)?.is_some() {
                        report.already_settled += 1;
                        continue;
                    }

                    let item = QueueItem::pending(&entry, event, block.index);
                    match self.store.insert_queue_item(&item) {
                        Ok(()) => {
                            report.created += 1;
                            tracing::debug!(
                                block_index = block.index,
                                kind = %entry.kind,
                                hash = short(&hash),
                                "Queued settlement entry"
                            );
                        }
                        // Identical entry earlier in this pass
                        Err(ChainError::DuplicateEvent(_)) => report.already_queued += 1,
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        self.metrics.record_extracted(report.created);

        tracing::info!(
            scanned = report.scanned,
            created = report.created,
            already_queued = report.already_queued,
            already_settled = report.already_settled,
            "Extracted settlement entries from chain"
        );

        Ok(report)
    }

    /// Process every pending item, oldest first
    ///
    /// Items an interrupted run left in `processing` are resolved first.
    pub fn process_pending(&self) -> Result<ProcessReport> {
        let mut report = ProcessReport {
            interrupted: self.resolve_interrupted()?,
            ..ProcessReport::default()
        };

        let pending = self
            .store
            .list_queue_items()?
            .into_iter()
            .filter(|item| item.status == QueueStatus::Pending);

        for item in pending {
            report.processed += 1;
            match self.process_item(&item)? {
                QueueStatus::Completed => report.completed += 1,
                _ => report.failed += 1,
            }
        }

        tracing::info!(
            processed = report.processed,
            completed = report.completed,
            failed = report.failed,
            interrupted = report.interrupted,
            "Processed settlement queue"
        );

        Ok(report)
    }

    /// Run one item to a terminal status
    ///
    /// Errors only when the outcome itself cannot be recorded.
    fn process_item(&self, item: &QueueItem) -> Result<QueueStatus> {
        let hash = &item.event_hash;

        if self.store.find_settled_transaction(hash)?.is_some() {
            self.fail(item, "duplicate: already settled".to_string())?;
            return Ok(QueueStatus::Failed);
        }

        let outcome = self
            .store
            .update_queue_item_status(hash, QueueStatus::Processing, None)
            .and_then(|processing| self.settle(&processing));

        match outcome {
            Ok(()) => {
                self.store
                    .update_queue_item_status(hash, QueueStatus::Completed, None)?;
                self.metrics.record_settled();
                tracing::debug!(
                    kind = %item.kind,
                    hash = short(hash),
                    amount = %item.amount,
                    "Settled"
                );
                Ok(QueueStatus::Completed)
            }
            Err(e) => {
                self.fail(item, e.to_string())?;
                Ok(QueueStatus::Failed)
            }
        }
    }

    /// Move `processing` leftovers to a terminal status
    ///
    /// A settled record means the atomic commit landed before the crash, so
    /// the item is `completed`; otherwise nothing was applied and it is
    /// `failed`. There is no way back to `pending`.
    fn resolve_interrupted(&self) -> Result<usize> {
        let leftovers = self.items(Some(QueueStatus::Processing))?;

        for item in &leftovers {
            if self.store.find_settled_transaction(&item.event_hash)?.is_some() {
                self.store
                    .update_queue_item_status(&item.event_hash, QueueStatus::Completed, None)?;
                tracing::info!(
                    hash = short(&item.event_hash),
                    "Interrupted item already settled, marked completed"
                );
            } else {
                self.fail(item, "interrupted: processing did not finish".to_string())?;
            }
        }

        Ok(leftovers.len())
    }

    fn fail(&self, item: &QueueItem, reason: String) -> Result<()> {
        tracing::warn!(
            kind = %item.kind,
            hash = short(&item.event_hash),
            source_block_index = item.source_block_index,
            reason = %reason,
            "Settlement item failed"
        );
        self.store
            .update_queue_item_status(&item.event_hash, QueueStatus::Failed, Some(reason))?;
        self.metrics.record_failed();
        Ok(())
    }

    /// Validate, authenticate and apply one item
    fn settle(&self, item: &QueueItem) -> chain_core::Result<()> {
        self.validate(item)?;
        item.event.authenticate()?;

        let mut wallets: BTreeMap<String, Wallet> = BTreeMap::new();
        match &item.event {
            Event::Transfer(_) => {
                self.adjust(&mut wallets, &item.from, -item.amount)?;
                self.adjust(&mut wallets, &item.to, item.amount)?;
            }
            Event::GenesisAllocation(_) => {
                self.adjust(&mut wallets, &item.to, item.amount)?;
            }
            Event::ValidatorRegistration(registration) => {
                self.registry.register_signed(registration)?;
            }
        }

        let wallets: Vec<Wallet> = wallets.into_values().collect();
        self.store.commit_settlement(&item.settled(), &wallets)
    }

    fn validate(&self, item: &QueueItem) -> chain_core::Result<()> {
        if item.from.trim().is_empty() || item.to.trim().is_empty() {
            return Err(ChainError::Validation("empty from or to address".to_string()));
        }
        if item.amount <= Decimal::ZERO {
            return Err(ChainError::Validation(format!(
                "amount must be positive, got {}",
                item.amount
            )));
        }
        if item.event_hash.len() < self.config.min_hash_len {
            return Err(ChainError::Validation(format!(
                "hash shorter than {} characters",
                self.config.min_hash_len
            )));
        }
        // The item must still describe an entry of its own source event
        let matches_event = item
            .event
            .settlement_entries(item.timestamp)
            .iter()
            .any(|entry| entry.hash() == item.event_hash);
        if !matches_event {
            return Err(ChainError::Integrity(format!(
                "queue item {} does not match its source event",
                short(&item.event_hash)
            )));
        }
        Ok(())
    }

    fn adjust(
        &self,
        wallets: &mut BTreeMap<String, Wallet>,
        public_key: &str,
        delta: Decimal,
    ) -> chain_core::Result<()> {
        if !wallets.contains_key(public_key) {
            let wallet = self
                .store
                .find_wallet(public_key)?
                .unwrap_or_else(|| Wallet::new(public_key));
            wallets.insert(public_key.to_string(), wallet);
        }
        if let Some(wallet) = wallets.get_mut(public_key) {
            wallet.apply(delta);
        }
        Ok(())
    }

    /// Counts per status
    pub fn stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();
        for item in self.store.list_queue_items()? {
            stats.total += 1;
            match item.status {
                QueueStatus::Pending => stats.pending += 1,
                QueueStatus::Processing => stats.processing += 1,
                QueueStatus::Completed => stats.completed += 1,
                QueueStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    /// Items, optionally filtered by status, oldest first
    pub fn items(&self, status: Option<QueueStatus>) -> Result<Vec<QueueItem>> {
        Ok(self
            .store
            .list_queue_items()?
            .into_iter()
            .filter(|item| status.map_or(true, |s| item.status == s))
            .collect())
    }

    /// Metrics this queue reports into
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_core::{Allocation, BlockPolicy, GenesisAllocation, KeyPair, MemoryStore, Transfer, ValidatorRegistration};

    struct Fixture {
        store: Arc<dyn LedgerStore>,
        chain: Chain,
        queue: SettlementQueue,
        issuer: KeyPair,
    }

    fn fixture() -> Fixture {
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryStore::new());
        let chain = Chain::load(store.clone(), BlockPolicy::ProofOfStake).unwrap();
        let registry = ValidatorRegistry::new(store.clone(), Decimal::from(10_000));
        let queue = SettlementQueue::new(store.clone(), registry, QueueConfig::default()).unwrap();
        Fixture {
            store,
            chain,
            queue,
            issuer: KeyPair::generate(),
        }
    }

    fn genesis(issuer: &KeyPair) -> Event {
        Event::from(
            GenesisAllocation::new(
                issuer.public_key_hex(),
                Decimal::from(1_000_000),
                vec![Allocation {
                    recipient: issuer.public_key_hex().to_string(),
                    amount: Decimal::from(1_000_000),
                }],
            )
            .with_collateral(Decimal::from(10_000)),
        )
        .signed(issuer)
        .unwrap()
    }

    fn transfer(from: &KeyPair, to: &str, amount: i64, timestamp: i64) -> Event {
        Event::from(Transfer::new(from.public_key_hex(), to, Decimal::from(amount), timestamp))
            .signed(from)
            .unwrap()
    }

    fn balance(store: &Arc<dyn LedgerStore>, key: &str) -> Decimal {
        store.find_wallet(key).unwrap().map(|w| w.balance).unwrap_or_default()
    }

    #[test]
    fn test_genesis_and_transfer_settle() {
        let mut f = fixture();
        let issuer_key = f.issuer.public_key_hex().to_string();
        f.chain.create_genesis(vec![genesis(&f.issuer)]).unwrap();
        f.chain
            .append(vec![transfer(&f.issuer, "RECIPIENT", 500, 1_700_000_000)], None)
            .unwrap();

        let extracted = f.queue.extract_from_chain(&f.chain).unwrap();
        assert_eq!(extracted.created, 2);

        let report = f.queue.process_pending().unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 0);

        assert_eq!(balance(&f.store, &issuer_key), Decimal::from(999_500));
        assert_eq!(balance(&f.store, "RECIPIENT"), Decimal::from(500));
    }

    #[test]
    fn test_extraction_is_idempotent() {
        let mut f = fixture();
        f.chain.create_genesis(vec![genesis(&f.issuer)]).unwrap();
        f.chain
            .append(vec![transfer(&f.issuer, "A", 1, 10), transfer(&f.issuer, "B", 2, 11)], None)
            .unwrap();
        f.chain
            .append(vec![transfer(&f.issuer, "C", 3, 12), transfer(&f.issuer, "D", 4, 13)], None)
            .unwrap();

        assert_eq!(f.queue.extract_from_chain(&f.chain).unwrap().created, 5);
        let second = f.queue.extract_from_chain(&f.chain).unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.already_queued, 5);
        assert_eq!(f.queue.stats().unwrap().total, 5);
    }

    #[test]
    fn test_settled_entries_are_not_requeued() {
        let mut f = fixture();
        f.chain.create_genesis(vec![genesis(&f.issuer)]).unwrap();
        f.queue.extract_from_chain(&f.chain).unwrap();
        f.queue.process_pending().unwrap();

        // Queue records lost, settled records kept
        let settled: Vec<_> = f
            .queue
            .items(Some(QueueStatus::Completed))
            .unwrap()
            .iter()
            .map(|i| f.store.find_settled_transaction(&i.event_hash).unwrap().unwrap())
            .collect();
        f.store.reset().unwrap();
        for transaction in &settled {
            f.store.commit_settlement(transaction, &[]).unwrap();
        }

        let report = f.queue.extract_from_chain(&f.chain).unwrap();
        assert_eq!(report.created, 0);
        assert_eq!(report.already_settled, 1);
    }

    #[test]
    fn test_second_settlement_attempt_fails_as_duplicate() {
        let mut f = fixture();
        f.chain.create_genesis(vec![genesis(&f.issuer)]).unwrap();
        f.queue.extract_from_chain(&f.chain).unwrap();
        let item = f.queue.items(Some(QueueStatus::Pending)).unwrap().remove(0);

        // Settled by someone else before the queue got to it
        f.store.commit_settlement(&item.settled(), &[]).unwrap();

        let report = f.queue.process_pending().unwrap();
        assert_eq!(report.failed, 1);
        let stored = f.store.find_queue_item_by_hash(&item.event_hash).unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Failed);
        assert!(stored.failure_reason.unwrap().contains("duplicate"));
        assert_eq!(balance(&f.store, f.issuer.public_key_hex()), Decimal::ZERO);
    }

    #[test]
    fn test_forged_transfer_fails_and_batch_continues() {
        let mut f = fixture();
        f.chain.create_genesis(vec![genesis(&f.issuer)]).unwrap();

        let mut forged = transfer(&f.issuer, "THIEF", 900_000, 20);
        if let Event::Transfer(t) = &mut forged {
            t.to = "OTHER_THIEF".into();
        }
        f.chain
            .append(vec![forged, transfer(&f.issuer, "FRIEND", 100, 30)], None)
            .unwrap();

        f.queue.extract_from_chain(&f.chain).unwrap();
        let report = f.queue.process_pending().unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(report.completed, 2);
        assert_eq!(report.failed, 1);

        let failed = f.queue.items(Some(QueueStatus::Failed)).unwrap();
        assert_eq!(failed[0].to, "OTHER_THIEF");
        assert!(failed[0].failure_reason.as_ref().unwrap().contains("Authentication"));
        assert_eq!(balance(&f.store, "OTHER_THIEF"), Decimal::ZERO);
        assert_eq!(balance(&f.store, "FRIEND"), Decimal::from(100));
    }

    #[test]
    fn test_zero_amount_fails_validation() {
        let mut f = fixture();
        f.chain.append(vec![transfer(&f.issuer, "A", 0, 1)], None).unwrap();
        f.queue.extract_from_chain(&f.chain).unwrap();

        let report = f.queue.process_pending().unwrap();
        assert_eq!(report.failed, 1);
        let failed = f.queue.items(Some(QueueStatus::Failed)).unwrap();
        assert!(failed[0].failure_reason.as_ref().unwrap().contains("amount must be positive"));
    }

    #[test]
    fn test_registration_goes_through_registry() {
        let mut f = fixture();
        let validator = KeyPair::generate();
        let registration = Event::from(ValidatorRegistration::new(
            validator.public_key_hex(),
            "10.0.0.7",
            Decimal::from(10_000),
        ))
        .signed(&validator)
        .unwrap();
        f.chain.append(vec![registration], None).unwrap();

        f.queue.extract_from_chain(&f.chain).unwrap();
        let report = f.queue.process_pending().unwrap();
        assert_eq!(report.completed, 1);

        let stored = f.store.find_validator_by_public_key(validator.public_key_hex()).unwrap().unwrap();
        assert_eq!(stored.ip_address.as_deref(), Some("10.0.0.7"));
        // Registration moves no balance
        assert_eq!(balance(&f.store, validator.public_key_hex()), Decimal::ZERO);
    }

    #[test]
    fn test_processing_order_is_by_timestamp() {
        let mut f = fixture();
        f.chain
            .append(vec![transfer(&f.issuer, "LATE", 1, 200), transfer(&f.issuer, "EARLY", 1, 100)], None)
            .unwrap();
        f.queue.extract_from_chain(&f.chain).unwrap();

        let pending = f.queue.items(Some(QueueStatus::Pending)).unwrap();
        assert_eq!(pending[0].to, "EARLY");
        assert_eq!(pending[1].to, "LATE");
    }

    #[test]
    fn test_rerun_processes_nothing_new() {
        let mut f = fixture();
        f.chain.create_genesis(vec![genesis(&f.issuer)]).unwrap();
        f.queue.extract_from_chain(&f.chain).unwrap();
        f.queue.process_pending().unwrap();

        f.queue.extract_from_chain(&f.chain).unwrap();
        let report = f.queue.process_pending().unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(balance(&f.store, f.issuer.public_key_hex()), Decimal::from(1_000_000));

        let stats = f.queue.stats().unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(f.queue.metrics().items_settled.get(), 1);
    }

    #[test]
    fn test_item_interrupted_before_commit_ends_failed() {
        let mut f = fixture();
        f.chain.append(vec![transfer(&f.issuer, "BOB", 25, 40)], None).unwrap();
        f.queue.extract_from_chain(&f.chain).unwrap();
        let item = f.queue.items(Some(QueueStatus::Pending)).unwrap().remove(0);

        // Crash after the status change, before the settlement commit
        f.store
            .update_queue_item_status(&item.event_hash, QueueStatus::Processing, None)
            .unwrap();

        f.queue.extract_from_chain(&f.chain).unwrap();
        let report = f.queue.process_pending().unwrap();
        assert_eq!(report.interrupted, 1);
        assert_eq!(report.processed, 0);

        let stats = f.queue.stats().unwrap();
        assert_eq!(stats.processing, 0);
        assert_eq!(stats.failed, 1);
        let stored = f.store.find_queue_item_by_hash(&item.event_hash).unwrap().unwrap();
        assert!(stored.failure_reason.unwrap().contains("interrupted"));
        assert!(f.store.find_settled_transaction(&item.event_hash).unwrap().is_none());
        assert_eq!(balance(&f.store, "BOB"), Decimal::ZERO);

        // Nothing left to resolve on the next run
        assert_eq!(f.queue.process_pending().unwrap().interrupted, 0);
    }

    #[test]
    fn test_item_interrupted_after_commit_ends_completed() {
        let mut f = fixture();
        f.chain.append(vec![transfer(&f.issuer, "BOB", 25, 40)], None).unwrap();
        f.queue.extract_from_chain(&f.chain).unwrap();
        let item = f.queue.items(Some(QueueStatus::Pending)).unwrap().remove(0);

        // Crash after the settlement commit, before the final status change
        f.store
            .update_queue_item_status(&item.event_hash, QueueStatus::Processing, None)
            .unwrap();
        let mut bob = Wallet::new("BOB");
        bob.apply(Decimal::from(25));
        f.store.commit_settlement(&item.settled(), &[bob]).unwrap();

        let report = f.queue.process_pending().unwrap();
        assert_eq!(report.interrupted, 1);

        let stored = f.store.find_queue_item_by_hash(&item.event_hash).unwrap().unwrap();
        assert_eq!(stored.status, QueueStatus::Completed);
        assert_eq!(balance(&f.store, "BOB"), Decimal::from(25));
    }
}
