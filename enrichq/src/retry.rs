//! Retry controller
//!
//! Runs bounded extra rounds over everything not yet `success`. Each round
//! resets `failed` rows to `pending`, waits, tops up credentials and dispatches
//! again. The controller stops as soon as a round makes no progress, so
//! permanently unreachable identifiers cannot keep it looping.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::credentials::{CredentialError, CredentialPool, CredentialSet};
use crate::dispatch::{DispatchEngine, DispatchError};
use crate::logger::RunLogger;
use crate::store::{IdentifierStatus, WorkQueue};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_rounds: u32,
    pub round_delay: Duration,
    /// Provisioning is only driven when fewer valid credentials remain
    pub min_credentials: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_rounds: 7,
            round_delay: Duration::from_secs(10),
            min_credentials: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStop {
    /// nothing left to retry
    Drained,
    /// a round ended without reducing pending + failed
    NoProgress,
    MaxRounds,
    CredentialsExhausted,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryReport {
    pub rounds: u32,
    pub reset: usize,
    pub initial_remaining: usize,
    pub final_remaining: usize,
    pub stop: RetryStop,
}

pub struct RetryController {
    store: Arc<WorkQueue>,
    pool: Arc<CredentialPool>,
    engine: Arc<DispatchEngine>,
    logger: Arc<dyn RunLogger>,
    config: RetryConfig,
}

impl RetryController {
    pub fn new(
        store: Arc<WorkQueue>,
        pool: Arc<CredentialPool>,
        engine: Arc<DispatchEngine>,
        logger: Arc<dyn RunLogger>,
        config: RetryConfig,
    ) -> Self {
        Self {
            store,
            pool,
            engine,
            logger,
            config,
        }
    }

    fn remaining(&self) -> Result<usize, DispatchError> {
        Ok(self.store.stats()?.remaining())
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<RetryReport, DispatchError> {
        let initial_remaining = self.remaining()?;
        let mut report = RetryReport {
            rounds: 0,
            reset: 0,
            initial_remaining,
            final_remaining: initial_remaining,
            stop: RetryStop::MaxRounds,
        };

        for round in 1..=self.config.max_rounds {
            let before = self.remaining()?;
            report.final_remaining = before;
            if before == 0 {
                report.stop = RetryStop::Drained;
                return Ok(report);
            }
            if cancel.is_cancelled() {
                report.stop = RetryStop::Cancelled;
                return Ok(report);
            }

            self.logger.info(&format!(
                "Retry round {}/{}: {} identifiers not yet successful",
                round, self.config.max_rounds, before
            ));
            let reset = self.store.reset_failed()?;
            report.reset += reset;
            self.logger
                .info(&format!("Reset {} failed identifiers to pending", reset));

            tokio::select! {
                _ = tokio::time::sleep(self.config.round_delay) => {}
                _ = cancel.cancelled() => {
                    report.stop = RetryStop::Cancelled;
                    return Ok(report);
                }
            }

            let tokens = match self.pool.replenish(self.config.min_credentials).await {
                Ok(tokens) => tokens,
                Err(CredentialError::Cancelled) => {
                    report.stop = RetryStop::Cancelled;
                    return Ok(report);
                }
                Err(e) => {
                    self.logger.error(&format!("Retry stopped: {}", e));
                    report.stop = RetryStop::CredentialsExhausted;
                    return Ok(report);
                }
            };

            let credentials = Arc::new(CredentialSet::new(tokens));
            let pending = self.store.get_by_status(IdentifierStatus::Pending)?;
            let dispatched = self.engine.run(pending, credentials.clone(), cancel).await?;
            self.pool.absorb(&credentials);
            report.rounds = round;

            let after = self.remaining()?;
            report.final_remaining = after;
            debug!("Retry round {}: {} -> {} remaining ({:?})", round, before, after, dispatched);
            self.logger.info(&format!(
                "Retry round {} finished: {} -> {} remaining",
                round, before, after
            ));

            if after == 0 {
                report.stop = RetryStop::Drained;
                return Ok(report);
            }
            if cancel.is_cancelled() {
                report.stop = RetryStop::Cancelled;
                return Ok(report);
            }
            if after >= before {
                self.logger
                    .warn(&format!("Retry round {} made no progress; stopping", round));
                report.stop = RetryStop::NoProgress;
                return Ok(report);
            }
        }

        report.stop = RetryStop::MaxRounds;
        Ok(report)
    }
}
