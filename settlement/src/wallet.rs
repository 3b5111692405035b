//! Wallet book
//!
//! Wallet records are created here but balances are only ever written by the
//! settlement queue. The book can replay the chain to predict what settled
//! balances should be and report where they differ.

use crate::Result;
use chain_core::event::short;
use chain_core::{Chain, Event, LedgerStore, Wallet};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

/// Outcome of [`WalletBook::sync_from_chain`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WalletSync {
    /// Wallets created at zero
    pub created: usize,
    /// Wallets already present
    pub existing: usize,
}

/// One address whose settled balance differs from the replay
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Discrepancy {
    /// Address
    pub public_key: String,
    /// Balance the chain implies
    pub expected: Decimal,
    /// Balance on record
    pub actual: Decimal,
}

/// Outcome of [`WalletBook::reconcile`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    /// Addresses compared
    pub checked: usize,
    /// Mismatches
    pub discrepancies: Vec<Discrepancy>,
}

impl Reconciliation {
    /// No mismatches
    pub fn is_balanced(&self) -> bool {
        self.discrepancies.is_empty()
    }
}

/// Wallets over a [`LedgerStore`]
#[derive(Debug, Clone)]
pub struct WalletBook {
    store: Arc<dyn LedgerStore>,
}

impl WalletBook {
    /// Book over `store`
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Every address the chain mentions
    pub fn addresses(chain: &Chain) -> BTreeSet<String> {
        let mut addresses = BTreeSet::new();
        for block in chain.blocks() {
            for event in &block.events {
                addresses.insert(event.signer().to_string());
                for entry in event.settlement_entries(block.timestamp) {
                    addresses.insert(entry.from);
                    addresses.insert(entry.to);
                }
            }
        }
        addresses.retain(|a| !a.trim().is_empty());
        addresses
    }

    /// Make sure every address in the chain has a wallet; balances are never touched
    pub fn sync_from_chain(&self, chain: &Chain) -> Result<WalletSync> {
        let mut report = WalletSync::default();

        for address in Self::addresses(chain) {
            if self.store.find_wallet(&address)?.is_some() {
                report.existing += 1;
                continue;
            }
            self.store.upsert_wallet(&Wallet::new(&address))?;
            report.created += 1;
            tracing::debug!(public_key = short(&address), "Wallet created");
        }

        tracing::info!(
            created = report.created,
            existing = report.existing,
            "Wallets synced from chain"
        );

        Ok(report)
    }

    /// Balances the chain implies, replaying what settlement would accept
    ///
    /// Unauthenticated events, blank addresses, non-positive amounts and
    /// repeated settlement hashes contribute nothing.
    pub fn project_balances(chain: &Chain) -> BTreeMap<String, Decimal> {
        let mut balances: BTreeMap<String, Decimal> = BTreeMap::new();
        let mut seen = HashSet::new();

        for block in chain.blocks() {
            for event in &block.events {
                if !event.verify_signature() {
                    continue;
                }
                for entry in event.settlement_entries(block.timestamp) {
                    if entry.from.trim().is_empty()
                        || entry.to.trim().is_empty()
                        || entry.amount <= Decimal::ZERO
                        || !seen.insert(entry.hash())
                    {
                        continue;
                    }
                    match event {
                        Event::Transfer(_) => {
                            *balances.entry(entry.from.clone()).or_default() -= entry.amount;
                            *balances.entry(entry.to.clone()).or_default() += entry.amount;
                        }
                        Event::GenesisAllocation(_) => {
                            *balances.entry(entry.to.clone()).or_default() += entry.amount;
                        }
                        Event::ValidatorRegistration(_) => {}
                    }
                }
            }
        }

        balances
    }

    /// Compare projected balances with settled wallets
    pub fn reconcile(&self, chain: &Chain) -> Result<Reconciliation> {
        let projected = Self::project_balances(chain);
        let actual: BTreeMap<String, Decimal> = self
            .store
            .list_wallets()?
            .into_iter()
            .map(|w| (w.public_key, w.balance))
            .collect();

        let keys: BTreeSet<&String> = projected.keys().chain(actual.keys()).collect();
        let mut report = Reconciliation {
            checked: keys.len(),
            discrepancies: Vec::new(),
        };

        for key in keys {
            let expected = projected.get(key).copied().unwrap_or_default();
            let settled = actual.get(key).copied().unwrap_or_default();
            if expected != settled {
                report.discrepancies.push(Discrepancy {
                    public_key: key.clone(),
                    expected,
                    actual: settled,
                });
            }
        }

        if report.is_balanced() {
            tracing::info!(checked = report.checked, "Wallets reconciled");
        } else {
            tracing::warn!(
                checked = report.checked,
                discrepancies = report.discrepancies.len(),
                "Wallet balances differ from chain replay"
            );
        }

        Ok(report)
    }

    /// Settled balance, zero for unknown addresses
    pub fn balance(&self, public_key: &str) -> Result<Decimal> {
        Ok(self
            .store
            .find_wallet(public_key)?
            .map(|w| w.balance)
            .unwrap_or_default())
    }

    /// All wallets
    pub fn list(&self) -> Result<Vec<Wallet>> {
        Ok(self.store.list_wallets()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_core::{Allocation, BlockPolicy, GenesisAllocation, KeyPair, MemoryStore, Transfer};

    fn setup() -> (Arc<dyn LedgerStore>, Chain, KeyPair) {
        let store: Arc<dyn LedgerStore> = Arc::new(MemoryStore::new());
        let mut chain = Chain::load(store.clone(), BlockPolicy::ProofOfStake).unwrap();
        let issuer = KeyPair::generate();

        let genesis = Event::from(GenesisAllocation::new(
            issuer.public_key_hex(),
            Decimal::from(1_000),
            vec![Allocation {
                recipient: issuer.public_key_hex().to_string(),
                amount: Decimal::from(1_000),
            }],
        ))
        .signed(&issuer)
        .unwrap();
        chain.create_genesis(vec![genesis]).unwrap();

        let transfer = Event::from(Transfer::new(issuer.public_key_hex(), "BOB", Decimal::from(250), 5))
            .signed(&issuer)
            .unwrap();
        let unsigned = Event::from(Transfer::new(issuer.public_key_hex(), "MALLORY", Decimal::from(700), 6));
        chain.append(vec![transfer, unsigned], None).unwrap();

        (store, chain, issuer)
    }

    #[test]
    fn test_projection_skips_unauthenticated_events() {
        let (_store, chain, issuer) = setup();
        let balances = WalletBook::project_balances(&chain);
        assert_eq!(balances[issuer.public_key_hex()], Decimal::from(750));
        assert_eq!(balances["BOB"], Decimal::from(250));
        assert!(!balances.contains_key("MALLORY"));
    }

    #[test]
    fn test_blank_recipient_does_not_unbalance_reconciliation() {
        use crate::config::QueueConfig;
        use crate::queue::SettlementQueue;
        use chain_core::ValidatorRegistry;

        let (store, mut chain, issuer) = setup();
        let to_nobody = Event::from(Transfer::new(issuer.public_key_hex(), "", Decimal::from(10), 7))
            .signed(&issuer)
            .unwrap();
        chain.append(vec![to_nobody], None).unwrap();

        let balances = WalletBook::project_balances(&chain);
        assert_eq!(balances[issuer.public_key_hex()], Decimal::from(750));
        assert!(!balances.contains_key(""));

        let registry = ValidatorRegistry::new(store.clone(), Decimal::from(10_000));
        let queue = SettlementQueue::new(store.clone(), registry, QueueConfig::default()).unwrap();
        queue.extract_from_chain(&chain).unwrap();
        let processed = queue.process_pending().unwrap();
        // Unsigned MALLORY transfer and blank recipient both rejected
        assert_eq!(processed.failed, 2);

        let report = WalletBook::new(store).reconcile(&chain).unwrap();
        assert!(report.is_balanced(), "{:?}", report.discrepancies);
    }

    #[test]
    fn test_sync_creates_zero_wallets_once() {
        let (store, chain, _issuer) = setup();
        let book = WalletBook::new(store.clone());

        let first = book.sync_from_chain(&chain).unwrap();
        assert_eq!(first.created, 3);

        let mut bob = store.find_wallet("BOB").unwrap().unwrap();
        bob.apply(Decimal::from(42));
        store.upsert_wallet(&bob).unwrap();

        let second = book.sync_from_chain(&chain).unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.existing, 3);
        assert_eq!(book.balance("BOB").unwrap(), Decimal::from(42));
    }

    #[test]
    fn test_reconcile_reports_differences() {
        let (store, chain, issuer) = setup();
        let book = WalletBook::new(store.clone());
        book.sync_from_chain(&chain).unwrap();

        let report = book.reconcile(&chain).unwrap();
        assert!(!report.is_balanced());
        assert_eq!(report.discrepancies.len(), 2);

        let mut issuer_wallet = store.find_wallet(issuer.public_key_hex()).unwrap().unwrap();
        issuer_wallet.apply(Decimal::from(750));
        store.upsert_wallet(&issuer_wallet).unwrap();
        let mut bob = store.find_wallet("BOB").unwrap().unwrap();
        bob.apply(Decimal::from(250));
        store.upsert_wallet(&bob).unwrap();

        let report = book.reconcile(&chain).unwrap();
        assert!(report.is_balanced(), "{:?}", report.discrepancies);
        assert_eq!(report.checked, 3);
    }
}
