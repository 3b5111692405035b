//! Ledger initialization pipeline
//!
//! Stages run strictly in order and the first failing stage aborts the rest:
//!
//! 1. **Reset** (optional): wipe the store
//! 2. **Genesis**: load the issuer keys and create the genesis block if the
//!    chain is empty
//! 3. **Simulation** (optional): a demo block of transfers and a signed
//!    validator registration
//! 4. **Wallet sync**: create wallet records for every address
//! 5. **Validator sync**: register validators found in the chain
//! 6. **Extraction**: queue settlement entries
//! 7. **Processing**: settle pending items
//!
//! Individual queue items failing is not a stage failure.

use crate::config::Config;
use crate::queue::{QueueStats, SettlementQueue};
use crate::wallet::{Reconciliation, WalletBook};
use crate::{Error, Result};
use chain_core::{
    Allocation, Chain, ChainStats, Event, GenesisAllocation, KeyPair, LedgerStore, Transfer,
    ValidatorRegistration, ValidatorRegistry, ValidatorStats,
};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

/// Pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Wipe the store
    Reset,
    /// Create the genesis block
    Genesis,
    /// Append demo activity
    Simulation,
    /// Create wallet records
    WalletSync,
    /// Register validators from the chain
    ValidatorSync,
    /// Queue settlement entries
    Extraction,
    /// Settle pending items
    Processing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Reset => "reset",
            Stage::Genesis => "genesis",
            Stage::Simulation => "simulation",
            Stage::WalletSync => "wallet_sync",
            Stage::ValidatorSync => "validator_sync",
            Stage::Extraction => "extraction",
            Stage::Processing => "processing",
        };
        f.write_str(name)
    }
}

/// How a stage ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    /// Ran to completion
    Completed {
        /// What it did
        detail: String,
    },
    /// Not run
    Skipped {
        /// Why
        reason: String,
    },
}

/// One stage in the report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    /// Stage
    pub stage: Stage,
    /// Outcome
    #[serde(flatten)]
    pub outcome: StageOutcome,
}

/// Result of a full pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    /// Issuer public key
    pub issuer_public_key: String,
    /// Stages in execution order
    pub stages: Vec<StageReport>,
    /// Chain summary
    pub chain: ChainStats,
    /// Registry summary
    pub validators: ValidatorStats,
    /// Queue summary
    pub queue: QueueStats,
    /// Settled balances against chain replay
    pub reconciliation: Reconciliation,
}

impl PipelineReport {
    /// Outcome of `stage`
    pub fn outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.stages.iter().find(|s| s.stage == stage).map(|s| &s.outcome)
    }
}

/// Pipeline over a store
#[derive(Debug)]
pub struct Pipeline {
    config: Config,
    store: Arc<dyn LedgerStore>,
}

impl Pipeline {
    /// Pipeline writing into `store`
    pub fn new(config: Config, store: Arc<dyn LedgerStore>) -> Self {
        Self { config, store }
    }

    /// Run every stage
    pub fn run(&self) -> Result<PipelineReport> {
        let mut stages = Vec::new();
        let started = Instant::now();

        if self.config.pipeline.reset {
            run_stage(&mut stages, Stage::Reset, || {
                self.store.reset()?;
                Ok(((), "store wiped".to_string()))
            })?;
        } else {
            skip_stage(&mut stages, Stage::Reset, "disabled");
        }

        let (mut chain, issuer) = run_stage(&mut stages, Stage::Genesis, || self.genesis())?;

        if self.config.pipeline.simulation {
            run_stage(&mut stages, Stage::Simulation, || {
                self.simulate(&mut chain, &issuer).map(|detail| ((), detail))
            })?;
        } else {
            skip_stage(&mut stages, Stage::Simulation, "disabled");
        }

        let wallets = WalletBook::new(self.store.clone());
        run_stage(&mut stages, Stage::WalletSync, || {
            let sync = wallets.sync_from_chain(&chain)?;
            Ok(((), format!("{} created, {} existing", sync.created, sync.existing)))
        })?;

        let registry = run_stage(&mut stages, Stage::ValidatorSync, || {
            let registry = ValidatorRegistry::from_chain(&chain)?;
            let sync = registry.sync_from_chain(&chain)?;
            Ok((
                registry,
                format!(
                    "{} registered, {} existing, {} rejected",
                    sync.registered, sync.existing, sync.rejected
                ),
            ))
        })?;

        let queue = SettlementQueue::new(self.store.clone(), registry.clone(), self.config.queue.clone())?
            .with_metrics(chain.metrics().clone());

        run_stage(&mut stages, Stage::Extraction, || {
            let extract = queue.extract_from_chain(&chain)?;
            Ok((
                (),
                format!(
                    "{} scanned, {} queued, {} already queued, {} already settled",
                    extract.scanned, extract.created, extract.already_queued, extract.already_settled
                ),
            ))
        })?;

        run_stage(&mut stages, Stage::Processing, || {
            let processed = queue.process_pending()?;
            Ok((
                (),
                format!(
                    "{} processed, {} completed, {} failed, {} interrupted resolved",
                    processed.processed, processed.completed, processed.failed, processed.interrupted
                ),
            ))
        })?;

        let report = PipelineReport {
            issuer_public_key: issuer.public_key_hex().to_string(),
            stages,
            chain: chain.stats(),
            validators: registry.stats()?,
            queue: queue.stats()?,
            reconciliation: wallets.reconcile(&chain)?,
        };

        tracing::info!(
            chain_length = report.chain.length,
            chain_valid = report.chain.is_valid,
            validators = report.validators.total,
            completed = report.queue.completed,
            failed = report.queue.failed,
            balanced = report.reconciliation.is_balanced(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pipeline finished"
        );

        Ok(report)
    }

    fn genesis(&self) -> Result<((Chain, KeyPair), String)> {
        let issuer = KeyPair::load_or_generate(&self.config.keys_dir)?;
        let mut chain = Chain::load(self.store.clone(), self.config.ledger.block_policy)?;

        if !chain.is_empty() {
            let detail = format!("genesis already present, chain has {} blocks", chain.len());
            return Ok(((chain, issuer), detail));
        }

        let genesis = &self.config.genesis;
        let event = Event::from(
            GenesisAllocation::new(
                issuer.public_key_hex(),
                genesis.total_supply,
                vec![Allocation {
                    recipient: issuer.public_key_hex().to_string(),
                    amount: genesis.total_supply,
                }],
            )
            .with_collateral(genesis.collateral)
            .with_description(genesis.description.clone()),
        )
        .signed(&issuer)?;

        let hash = chain.create_genesis(vec![event])?.hash.clone();
        let detail = format!(
            "genesis {} allocates {} to issuer",
            chain_core::event::short(&hash),
            genesis.total_supply
        );
        Ok(((chain, issuer), detail))
    }

    fn simulate(&self, chain: &mut Chain, issuer: &KeyPair) -> Result<String> {
        let settings = &self.config.pipeline;
        let recipient = KeyPair::generate();
        let now = chrono::Utc::now().timestamp();

        let transfers = (0..2)
            .map(|i| {
                Event::from(
                    Transfer::new(
                        issuer.public_key_hex(),
                        recipient.public_key_hex(),
                        settings.simulation_amount,
                        now + i,
                    )
                    .with_description(format!("Simulated transfer {}", i + 1)),
                )
                .signed(issuer)
            })
            .collect::<chain_core::Result<Vec<_>>>()?;
        chain.append(transfers, Some(issuer.public_key_hex().to_string()))?;

        let registration = Event::from(
            ValidatorRegistration::new(
                recipient.public_key_hex(),
                settings.simulation_validator_ip.clone(),
                chain.collateral_default()?,
            )
            .with_description("Simulated validator"),
        )
        .signed(&recipient)?;
        chain.append(vec![registration], Some(issuer.public_key_hex().to_string()))?;

        Ok(format!(
            "2 transfers of {} and 1 registration for {}",
            settings.simulation_amount,
            chain_core::event::short(recipient.public_key_hex())
        ))
    }
}

fn run_stage<T>(
    stages: &mut Vec<StageReport>,
    stage: Stage,
    f: impl FnOnce() -> Result<(T, String)>,
) -> Result<T> {
    let start = Instant::now();
    tracing::info!(stage = %stage, "Stage started");

    match f() {
        Ok((value, detail)) => {
            tracing::info!(
                stage = %stage,
                detail = %detail,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Stage completed"
            );
            stages.push(StageReport {
                stage,
                outcome: StageOutcome::Completed { detail },
            });
            Ok(value)
        }
        Err(e) => {
            tracing::error!(stage = %stage, error = %e, "Stage failed, aborting pipeline");
            Err(Error::Pipeline {
                stage: stage.to_string(),
                reason: e.to_string(),
            })
        }
    }
}

fn skip_stage(stages: &mut Vec<StageReport>, stage: Stage, reason: &str) {
    tracing::debug!(stage = %stage, reason, "Stage skipped");
    stages.push(StageReport {
        stage,
        outcome: StageOutcome::Skipped {
            reason: reason.to_string(),
        },
    });
}
