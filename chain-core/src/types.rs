//! Records persisted next to the chain
//!
//! Amounts are exact decimals and ids are UUIDv7 so that queue items sort by
//! creation time.

use crate::event::{Event, EventKind, SettlementEntry};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Registered validator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Validator {
    /// Public key (unique)
    pub public_key: String,
    /// Self-reported IP address
    pub ip_address: Option<String>,
    /// Staked collateral, never negative
    pub collateral: Decimal,
    /// Approved by an operator
    pub approved: bool,
    /// Registration time
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

impl Validator {
    /// New unapproved validator
    pub fn new(public_key: impl Into<String>, collateral: Decimal) -> Self {
        let now = Utc::now();
        Self {
            public_key: public_key.into(),
            ip_address: None,
            collateral,
            approved: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Collateral slashed to zero
    pub fn is_slashed(&self) -> bool {
        self.collateral.is_zero()
    }
}

/// Settlement queue item status
///
/// ```text
/// pending -> processing -> completed
///    |            |
///    +------------+------> failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    /// Waiting to be processed
    Pending,
    /// Picked up by the processor
    Processing,
    /// Effect applied (terminal)
    Completed,
    /// Rejected or errored (terminal)
    Failed,
}

impl QueueStatus {
    /// Completed and failed items never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Failed)
    }

    /// Whether the state machine allows `self -> next`
    pub fn can_transition_to(&self, next: QueueStatus) -> bool {
        use QueueStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Pending, Failed) | (Processing, Completed) | (Processing, Failed)
        )
    }

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit of settlement work derived from one chain event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// UUIDv7
    pub id: Uuid,
    /// Settlement hash, unique across the queue
    #[serde(rename = "hash")]
    pub event_hash: String,
    /// Debited address
    #[serde(rename = "fromAddress")]
    pub from: String,
    /// Credited address
    #[serde(rename = "toAddress")]
    pub to: String,
    /// Amount
    pub amount: Decimal,
    /// Source event kind
    pub kind: EventKind,
    /// Index of the block the event came from
    pub source_block_index: u64,
    /// Current status
    pub status: QueueStatus,
    /// Unix seconds of the settlement entry
    pub timestamp: i64,
    /// Source event, re-authenticated at apply time
    pub event: Event,
    /// Why the item failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl QueueItem {
    /// Pending item for one settlement entry of `event`
    pub fn pending(entry: &SettlementEntry, event: &Event, source_block_index: u64) -> Self {
        Self {
            id: Uuid::now_v7(),
            event_hash: entry.hash(),
            from: entry.from.clone(),
            to: entry.to.clone(),
            amount: entry.amount,
            kind: entry.kind,
            source_block_index,
            status: QueueStatus::Pending,
            timestamp: entry.timestamp,
            event: event.clone(),
            failure_reason: None,
            updated_at: Utc::now(),
        }
    }

    /// Move to `next`, or `InvalidStateTransition`
    pub fn transition(&mut self, next: QueueStatus, reason: Option<String>) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.failure_reason = reason;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Settled record for this item
    pub fn settled(&self) -> SettledTransaction {
        SettledTransaction {
            hash: self.event_hash.clone(),
            from: self.from.clone(),
            to: self.to.clone(),
            amount: self.amount,
            kind: self.kind,
            source_block_index: self.source_block_index,
            timestamp: self.timestamp,
            settled_at: Utc::now(),
        }
    }
}

/// Effect that has been applied exactly once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettledTransaction {
    /// Settlement hash (unique)
    pub hash: String,
    /// Debited address
    pub from: String,
    /// Credited address
    pub to: String,
    /// Amount
    pub amount: Decimal,
    /// Source event kind
    pub kind: EventKind,
    /// Source block
    pub source_block_index: u64,
    /// Unix seconds of the settlement entry
    pub timestamp: i64,
    /// When it was applied
    pub settled_at: DateTime<Utc>,
}

/// Settled balance of an address
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    /// Owner public key
    pub public_key: String,
    /// Balance; transfers are not balance-checked so this can go negative
    pub balance: Decimal,
    /// First seen
    pub created_at: DateTime<Utc>,
    /// Last balance change
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Empty wallet
    pub fn new(public_key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            public_key: public_key.into(),
            balance: Decimal::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    /// Add `delta` (negative to debit)
    pub fn apply(&mut self, delta: Decimal) {
        self.balance += delta;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Transfer;

    fn item() -> QueueItem {
        let event = Event::from(Transfer::new("A", "B", Decimal::from(10), 5));
        let entry = event.settlement_entries(0).remove(0);
        QueueItem::pending(&entry, &event, 1)
    }

    #[test]
    fn test_valid_transitions() {
        assert!(QueueStatus::Pending.can_transition_to(QueueStatus::Processing));
        assert!(QueueStatus::Pending.can_transition_to(QueueStatus::Failed));
        assert!(QueueStatus::Processing.can_transition_to(QueueStatus::Completed));
        assert!(QueueStatus::Processing.can_transition_to(QueueStatus::Failed));
    }

    #[test]
    fn test_invalid_transitions() {
        assert!(!QueueStatus::Pending.can_transition_to(QueueStatus::Completed));
        assert!(!QueueStatus::Processing.can_transition_to(QueueStatus::Pending));
        assert!(!QueueStatus::Completed.can_transition_to(QueueStatus::Pending));
        assert!(!QueueStatus::Failed.can_transition_to(QueueStatus::Processing));
        assert!(!QueueStatus::Completed.can_transition_to(QueueStatus::Failed));
    }

    #[test]
    fn test_terminal_states() {
        assert!(QueueStatus::Completed.is_terminal());
        assert!(QueueStatus::Failed.is_terminal());
        assert!(!QueueStatus::Pending.is_terminal());
        assert!(!QueueStatus::Processing.is_terminal());
    }

    #[test]
    fn test_item_transition_records_reason() {
        let mut item = item();
        item.transition(QueueStatus::Processing, None).unwrap();
        item.transition(QueueStatus::Failed, Some("bad signature".into())).unwrap();
        assert_eq!(item.status, QueueStatus::Failed);
        assert_eq!(item.failure_reason.as_deref(), Some("bad signature"));

        let err = item.transition(QueueStatus::Pending, None).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_queue_item_json_field_names() {
        let json = serde_json::to_value(item()).unwrap();
        assert_eq!(json["fromAddress"], "A");
        assert_eq!(json["toAddress"], "B");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["sourceBlockIndex"], 1);
        assert_eq!(json["hash"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn test_wallet_may_go_negative() {
        let mut wallet = Wallet::new("A");
        wallet.apply(Decimal::from(-5));
        assert_eq!(wallet.balance, Decimal::from(-5));
    }
}
