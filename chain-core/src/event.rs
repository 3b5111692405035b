//! Events carried in block payloads
//!
//! Every event has a canonical signable form: a fixed, ordered subset of its
//! fields serialized as compact JSON. The signature and any free-text
//! description are never part of it. Amounts are normalized first so that
//! `500` and `500.00` sign identically.

use crate::crypto::{self, KeyPair};
use crate::{Error, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of event, also the JSON `type` tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Initial supply allocation
    GenesisAllocation,
    /// Value transfer between two addresses
    Transfer,
    /// Validator joining with collateral
    ValidatorRegistration,
}

impl EventKind {
    /// Wire tag
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::GenesisAllocation => "genesis_allocation",
            EventKind::Transfer => "transfer",
            EventKind::ValidatorRegistration => "validator_registration",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recipient of a genesis allocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    /// Recipient public key
    pub recipient: String,
    /// Amount credited
    pub amount: Decimal,
}

/// Initial coin allocation, signed by the issuer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenesisAllocation {
    /// Issuer public key
    pub public_key: String,
    /// Total supply declared by the issuer
    pub total_supply: Decimal,
    /// Recipients
    pub allocations: Vec<Allocation>,
    /// Default validator collateral stated by the issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collateral: Option<Decimal>,
    /// Free text, never signed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Hex signature over the canonical form
    #[serde(default)]
    pub signature: String,
}

impl GenesisAllocation {
    /// Unsigned allocation
    pub fn new(
        public_key: impl Into<String>,
        total_supply: Decimal,
        allocations: Vec<Allocation>,
    ) -> Self {
        Self {
            public_key: public_key.into(),
            total_supply,
            allocations,
            collateral: None,
            description: None,
            signature: String::new(),
        }
    }

    /// State the default validator collateral
    pub fn with_collateral(mut self, collateral: Decimal) -> Self {
        self.collateral = Some(collateral);
        self
    }

    /// Attach a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Value transfer; `from` is the sender's public key and the signer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transfer {
    /// Sender public key
    pub from: String,
    /// Recipient public key
    pub to: String,
    /// Amount moved
    pub amount: Decimal,
    /// Creation time (unix seconds)
    pub timestamp: i64,
    /// Free text, never signed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Hex signature over the canonical form
    #[serde(default)]
    pub signature: String,
}

impl Transfer {
    /// Unsigned transfer
    pub fn new(from: impl Into<String>, to: impl Into<String>, amount: Decimal, timestamp: i64) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            amount,
            timestamp,
            description: None,
            signature: String::new(),
        }
    }

    /// Attach a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Validator registration, signed by the registering key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorRegistration {
    /// Validator public key
    pub public_key: String,
    /// Self-reported IP address
    pub ip_address: String,
    /// Collateral staked
    pub collateral: Decimal,
    /// Approval flag at registration time
    #[serde(default)]
    pub approved: bool,
    /// Free text, never signed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Hex signature over the canonical form
    #[serde(default)]
    pub signature: String,
}

impl ValidatorRegistration {
    /// Unsigned, unapproved registration
    pub fn new(public_key: impl Into<String>, ip_address: impl Into<String>, collateral: Decimal) -> Self {
        Self {
            public_key: public_key.into(),
            ip_address: ip_address.into(),
            collateral,
            approved: false,
            description: None,
            signature: String::new(),
        }
    }

    /// Attach a description
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Canonical `{type, publicKey, ipAddress, collateral}` bytes
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let canonical = RegistrationCanonical {
            kind: EventKind::ValidatorRegistration.as_str(),
            public_key: &self.public_key,
            ip_address: &self.ip_address,
            collateral: self.collateral.normalize(),
        };
        Ok(serde_json::to_vec(&canonical)?)
    }

    /// Check the signature against `public_key`
    pub fn authenticate(&self) -> Result<()> {
        authenticate(&self.canonical_bytes()?, &self.signature, &self.public_key)
    }
}

// Canonical forms. Field declaration order is the serialization order.

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenesisCanonical<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    public_key: &'a str,
    total_supply: Decimal,
}

#[derive(Serialize)]
struct TransferCanonical<'a> {
    from: &'a str,
    to: &'a str,
    amount: Decimal,
    timestamp: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RegistrationCanonical<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    public_key: &'a str,
    ip_address: &'a str,
    collateral: Decimal,
}

fn authenticate(canonical: &[u8], signature: &str, public_key: &str) -> Result<()> {
    if signature.is_empty() {
        return Err(Error::Authentication(format!(
            "missing signature for key {}",
            short(public_key)
        )));
    }
    if !crypto::verify(canonical, signature, public_key) {
        return Err(Error::Authentication(format!(
            "signature does not verify for key {}",
            short(public_key)
        )));
    }
    Ok(())
}

/// First 20 chars of a key or hash, for log lines
pub fn short(value: &str) -> &str {
    match value.char_indices().nth(20) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

/// Event carried in a block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Initial supply allocation
    GenesisAllocation(GenesisAllocation),
    /// Value transfer
    Transfer(Transfer),
    /// Validator registration
    ValidatorRegistration(ValidatorRegistration),
}

impl Event {
    /// Event kind
    pub fn kind(&self) -> EventKind {
        match self {
            Event::GenesisAllocation(_) => EventKind::GenesisAllocation,
            Event::Transfer(_) => EventKind::Transfer,
            Event::ValidatorRegistration(_) => EventKind::ValidatorRegistration,
        }
    }

    /// Canonical signable bytes
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            Event::GenesisAllocation(g) => serde_json::to_vec(&GenesisCanonical {
                kind: EventKind::GenesisAllocation.as_str(),
                public_key: &g.public_key,
                total_supply: g.total_supply.normalize(),
            })?,
            Event::Transfer(t) => serde_json::to_vec(&TransferCanonical {
                from: &t.from,
                to: &t.to,
                amount: t.amount.normalize(),
                timestamp: t.timestamp,
            })?,
            Event::ValidatorRegistration(r) => r.canonical_bytes()?,
        };
        Ok(bytes)
    }

    /// Full JSON payload, as stored in the block and hashed into the Merkle root
    pub fn payload_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Public key that must have produced the signature
    pub fn signer(&self) -> &str {
        match self {
            Event::GenesisAllocation(g) => &g.public_key,
            Event::Transfer(t) => &t.from,
            Event::ValidatorRegistration(r) => &r.public_key,
        }
    }

    /// Hex signature
    pub fn signature(&self) -> &str {
        match self {
            Event::GenesisAllocation(g) => &g.signature,
            Event::Transfer(t) => &t.signature,
            Event::ValidatorRegistration(r) => &r.signature,
        }
    }

    fn signature_mut(&mut self) -> &mut String {
        match self {
            Event::GenesisAllocation(g) => &mut g.signature,
            Event::Transfer(t) => &mut t.signature,
            Event::ValidatorRegistration(r) => &mut r.signature,
        }
    }

    /// Sign the canonical form with `keypair`
    ///
    /// The key pair must belong to the event's signer.
    pub fn signed(mut self, keypair: &KeyPair) -> Result<Self> {
        if keypair.public_key_hex() != self.signer() {
            return Err(Error::Authentication(format!(
                "key {} cannot sign a {} for {}",
                short(keypair.public_key_hex()),
                self.kind(),
                short(self.signer())
            )));
        }
        let signature = keypair.sign(&self.canonical_bytes()?)?;
        *self.signature_mut() = signature;
        Ok(self)
    }

    /// Check the signature; `Authentication` error when missing or forged
    pub fn authenticate(&self) -> Result<()> {
        authenticate(&self.canonical_bytes()?, self.signature(), self.signer())
    }

    /// Whether the signature verifies
    pub fn verify_signature(&self) -> bool {
        self.authenticate().is_ok()
    }

    /// Ledger effects this event asks for
    ///
    /// Allocations and registrations take the block timestamp; transfers carry
    /// their own.
    pub fn settlement_entries(&self, block_timestamp: i64) -> Vec<SettlementEntry> {
        match self {
            Event::GenesisAllocation(g) => g
                .allocations
                .iter()
                .map(|a| SettlementEntry {
                    from: g.public_key.clone(),
                    to: a.recipient.clone(),
                    amount: a.amount,
                    timestamp: block_timestamp,
                    kind: EventKind::GenesisAllocation,
                })
                .collect(),
            Event::Transfer(t) => vec![SettlementEntry {
                from: t.from.clone(),
                to: t.to.clone(),
                amount: t.amount,
                timestamp: t.timestamp,
                kind: EventKind::Transfer,
            }],
            Event::ValidatorRegistration(r) => vec![SettlementEntry {
                from: r.public_key.clone(),
                to: r.public_key.clone(),
                amount: r.collateral,
                timestamp: block_timestamp,
                kind: EventKind::ValidatorRegistration,
            }],
        }
    }
}

impl From<GenesisAllocation> for Event {
    fn from(event: GenesisAllocation) -> Self {
        Event::GenesisAllocation(event)
    }
}

impl From<Transfer> for Event {
    fn from(event: Transfer) -> Self {
        Event::Transfer(event)
    }
}

impl From<ValidatorRegistration> for Event {
    fn from(event: ValidatorRegistration) -> Self {
        Event::ValidatorRegistration(event)
    }
}

/// A single ledger effect derived from an event
#[derive(Debug, Clone, PartialEq)]
pub struct SettlementEntry {
    /// Debited (or issuing) address
    pub from: String,
    /// Credited address
    pub to: String,
    /// Amount
    pub amount: Decimal,
    /// Unix seconds
    pub timestamp: i64,
    /// Source event kind
    pub kind: EventKind,
}

impl SettlementEntry {
    /// Dedup key: sha256 over length-prefixed `from, to, amount, timestamp, type`
    pub fn hash(&self) -> String {
        let amount = self.amount.normalize().to_string();
        let timestamp = self.timestamp.to_string();
        let fields = [
            self.from.as_str(),
            self.to.as_str(),
            amount.as_str(),
            timestamp.as_str(),
            self.kind.as_str(),
        ];

        let mut encoded = Vec::new();
        for field in fields {
            encoded.extend_from_slice(&(field.len() as u64).to_be_bytes());
            encoded.extend_from_slice(field.as_bytes());
        }
        crypto::hash_hex(encoded)
    }
}
