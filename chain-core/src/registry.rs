//! Validator registry
//!
//! The registry is the only writer of validator collateral and approval.
//! Validators are never deleted; slashing can take collateral down to zero.

use crate::chain::Chain;
use crate::event::{short, Event, ValidatorRegistration};
use crate::storage::LedgerStore;
use crate::types::Validator;
use crate::{Error, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;

/// Registry summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidatorStats {
    /// All validators
    pub total: usize,
    /// Approved validators
    pub approved: usize,
    /// Awaiting approval
    pub pending: usize,
    /// Sum of collateral
    pub total_collateral: Decimal,
}

/// Outcome of [`ValidatorRegistry::sync_from_chain`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySync {
    /// Newly registered validators
    pub registered: usize,
    /// Registrations already known
    pub existing: usize,
    /// Registrations whose signature did not verify
    pub rejected: usize,
}

/// Validator registry over a [`LedgerStore`]
#[derive(Debug, Clone)]
pub struct ValidatorRegistry {
    store: Arc<dyn LedgerStore>,
    default_collateral: Decimal,
}

impl ValidatorRegistry {
    /// Registry that gives new validators `default_collateral`
    pub fn new(store: Arc<dyn LedgerStore>, default_collateral: Decimal) -> Self {
        Self {
            store,
            default_collateral,
        }
    }

    /// Registry using the chain's store and its stated default collateral
    pub fn from_chain(chain: &Chain) -> Result<Self> {
        Ok(Self::new(chain.store().clone(), chain.collateral_default()?))
    }

    /// Collateral given to validators registered by key alone
    pub fn default_collateral(&self) -> Decimal {
        self.default_collateral
    }

    /// Register by public key; returns the existing validator if already known
    pub fn register(&self, public_key: &str) -> Result<Validator> {
        if let Some(existing) = self.store.find_validator_by_public_key(public_key)? {
            return Ok(existing);
        }

        let validator = Validator::new(public_key, self.default_collateral);
        self.store.upsert_validator(&validator)?;

        tracing::info!(
            public_key = short(public_key),
            collateral = %validator.collateral,
            "Validator registered"
        );

        Ok(validator)
    }

    /// Register from a signed registration event
    ///
    /// The signature is checked first; a forged or unsigned registration is an
    /// `Authentication` error. Registering a known key returns it unchanged.
    pub fn register_signed(&self, registration: &ValidatorRegistration) -> Result<Validator> {
        registration.authenticate()?;

        if let Some(existing) = self
            .store
            .find_validator_by_public_key(&registration.public_key)?
        {
            return Ok(existing);
        }

        if registration.collateral.is_sign_negative() {
            return Err(Error::Validation(format!(
                "negative collateral {} for {}",
                registration.collateral,
                short(&registration.public_key)
            )));
        }

        let mut validator = Validator::new(&registration.public_key, registration.collateral);
        validator.ip_address = Some(registration.ip_address.clone());
        validator.approved = registration.approved;
        self.store.upsert_validator(&validator)?;

        tracing::info!(
            public_key = short(&registration.public_key),
            ip_address = %registration.ip_address,
            collateral = %registration.collateral,
            "Validator registered from signed registration"
        );

        Ok(validator)
    }

    /// Approve a validator; `false` if unknown
    pub fn approve(&self, public_key: &str) -> Result<bool> {
        let Some(mut validator) = self.store.find_validator_by_public_key(public_key)? else {
            return Ok(false);
        };

        validator.approved = true;
        validator.updated_at = Utc::now();
        self.store.upsert_validator(&validator)?;

        tracing::info!(public_key = short(public_key), "Validator approved");
        Ok(true)
    }

    /// Slash collateral; `false` (and no change) if unknown or over-slashed
    pub fn slash(&self, public_key: &str, amount: Decimal) -> Result<bool> {
        match self.try_slash(public_key, amount) {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) | Err(Error::InsufficientCollateral { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Slash collateral, reporting why it could not be done
    pub fn try_slash(&self, public_key: &str, amount: Decimal) -> Result<Validator> {
        if amount.is_sign_negative() {
            return Err(Error::Validation(format!("negative slash amount {}", amount)));
        }

        let mut validator = self
            .store
            .find_validator_by_public_key(public_key)?
            .ok_or_else(|| Error::NotFound(format!("validator {}", short(public_key))))?;

        if amount > validator.collateral {
            tracing::warn!(
                public_key = short(public_key),
                requested = %amount,
                available = %validator.collateral,
                "Slash exceeds collateral"
            );
            return Err(Error::InsufficientCollateral {
                requested: amount.to_string(),
                available: validator.collateral.to_string(),
            });
        }

        validator.collateral -= amount;
        validator.updated_at = Utc::now();
        self.store.upsert_validator(&validator)?;

        tracing::warn!(
            public_key = short(public_key),
            amount = %amount,
            remaining = %validator.collateral,
            "Validator slashed"
        );

        Ok(validator)
    }

    /// Validator by public key
    pub fn get(&self, public_key: &str) -> Result<Option<Validator>> {
        self.store.find_validator_by_public_key(public_key)
    }

    /// Whether the key is registered
    pub fn exists(&self, public_key: &str) -> Result<bool> {
        Ok(self.get(public_key)?.is_some())
    }

    /// Whether the key is registered and approved
    pub fn is_approved(&self, public_key: &str) -> Result<bool> {
        Ok(self.get(public_key)?.map(|v| v.approved).unwrap_or(false))
    }

    /// All validators
    pub fn list(&self) -> Result<Vec<Validator>> {
        self.store.list_validators()
    }

    /// Highest collateral first, at most `limit`
    pub fn by_collateral(&self, limit: usize) -> Result<Vec<Validator>> {
        let mut validators = self.list()?;
        validators.sort_by(|a, b| b.collateral.cmp(&a.collateral));
        validators.truncate(limit);
        Ok(validators)
    }

    /// Registry summary
    pub fn stats(&self) -> Result<ValidatorStats> {
        let validators = self.list()?;
        let approved = validators.iter().filter(|v| v.approved).count();
        Ok(ValidatorStats {
            total: validators.len(),
            approved,
            pending: validators.len() - approved,
            total_collateral: validators.iter().map(|v| v.collateral).sum(),
        })
    }

    /// Register every validly signed registration found in the chain
    pub fn sync_from_chain(&self, chain: &Chain) -> Result<RegistrySync> {
        let mut report = RegistrySync::default();

        for block in chain.blocks() {
            for event in &block.events {
                let Event::ValidatorRegistration(registration) = event else {
                    continue;
                };

                if self.exists(&registration.public_key)? {
                    report.existing += 1;
                    continue;
                }

                match self.register_signed(registration) {
                    Ok(_) => report.registered += 1,
                    Err(Error::Authentication(reason)) | Err(Error::Validation(reason)) => {
                        tracing::warn!(
                            block_index = block.index,
                            public_key = short(&registration.public_key),
                            reason = %reason,
                            "Registration rejected"
                        );
                        report.rejected += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        tracing::info!(
            registered = report.registered,
            existing = report.existing,
            rejected = report.rejected,
            "Validators synced from chain"
        );

        Ok(report)
    }
}
