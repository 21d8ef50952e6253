//! Run coordinator and graceful shutdown
//!
//! The main loop: while pending work exists and nobody asked to stop, top up
//! credentials, dispatch, repeat. Once the queue is drained the retry
//! controller gets its rounds. Every exit path, including errors and
//! cancellation, ends in [`ShutdownGuard::shutdown`].

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::credentials::{CredentialError, CredentialPool, CredentialSet};
use crate::dispatch::{DispatchEngine, DispatchError};
use crate::logger::RunLogger;
use crate::retry::{RetryConfig, RetryController, RetryStop};
use crate::stats::{export_run_summary, RunOutcome, RunSummary};
use crate::store::{IdentifierStatus, WorkQueue};

/// Export, report and release exactly once.
///
/// Safe to call from a signal handler thread and from the coordinator at the
/// same time: the first caller runs the shutdown, later callers block until it
/// has finished and then return `Ok(false)`.
pub struct ShutdownGuard {
    performed: Mutex<bool>,
    done: AtomicBool,
    store: Arc<WorkQueue>,
    logger: Arc<dyn RunLogger>,
    handoff_path: PathBuf,
    summary_path: Option<PathBuf>,
    summary: Mutex<RunSummary>,
    started: Instant,
}

impl ShutdownGuard {
    pub fn new(
        store: Arc<WorkQueue>,
        logger: Arc<dyn RunLogger>,
        handoff_path: impl Into<PathBuf>,
        summary_path: Option<PathBuf>,
    ) -> Self {
        Self {
            performed: Mutex::new(false),
            done: AtomicBool::new(false),
            store,
            logger,
            handoff_path: handoff_path.into(),
            summary_path,
            summary: Mutex::new(RunSummary::new()),
            started: Instant::now(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn update_summary(&self, update: impl FnOnce(&mut RunSummary)) {
        if let Ok(mut summary) = self.summary.lock() {
            update(&mut summary);
        }
    }

    pub fn record_dispatch_round(&self) {
        self.update_summary(|s| s.dispatch_rounds += 1);
    }

    pub fn record_retry_rounds(&self, rounds: u32) {
        self.update_summary(|s| s.retry_rounds += rounds as usize);
    }

    pub fn record_outcome(&self, outcome: RunOutcome) {
        self.update_summary(|s| s.outcome = Some(outcome));
    }

    /// Snapshot of the summary as recorded so far
    pub fn summary(&self) -> RunSummary {
        self.summary.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Run the shutdown sequence if nobody has yet.
    ///
    /// 1. export pending identifiers to the hand-off file
    /// 2. emit final statistics
    /// 3. write the run summary, if configured
    /// 4. close the store
    ///
    /// Every step is attempted even if an earlier one failed; the first error
    /// is returned.
    pub fn shutdown(&self) -> Result<bool> {
        // Held for the whole sequence so a concurrent caller cannot return
        // (and exit the process) while the hand-off is still being written
        let mut performed = self.performed.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *performed {
            debug!("Shutdown already performed");
            return Ok(false);
        }
        *performed = true;

        let mut first_error: Option<anyhow::Error> = None;

        let exported = match self.store.export_pending(&self.handoff_path) {
            Ok(count) => {
                self.logger.info(&format!(
                    "Exported {} pending identifiers to {}",
                    count,
                    self.handoff_path.display()
                ));
                count
            }
            Err(e) => {
                self.logger.error(&format!("Failed to export pending identifiers: {}", e));
                first_error.get_or_insert(anyhow!(e).context("Failed to export pending identifiers"));
                0
            }
        };

        let stats = match self.store.stats() {
            Ok(stats) => {
                self.logger.success(&format!("Final statistics: {}", stats));
                Some(stats)
            }
            Err(e) => {
                self.logger.error(&format!("Failed to read final statistics: {}", e));
                first_error.get_or_insert(anyhow!(e).context("Failed to read final statistics"));
                None
            }
        };

        if let Some(path) = &self.summary_path {
            let mut summary = self.summary();
            summary.pending_exported = exported;
            summary.finalize(stats.unwrap_or_default(), self.started.elapsed().as_secs_f64());
            match export_run_summary(&summary, path) {
                Ok(()) => self
                    .logger
                    .info(&format!("Run summary written to {}", path.display())),
                Err(e) => {
                    self.logger.error(&format!("{:#}", e));
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Err(e) = self.store.close() {
            self.logger.error(&format!("Failed to close work queue: {}", e));
            first_error.get_or_insert(anyhow!(e).context("Failed to close work queue"));
        }

        self.done.store(true, Ordering::Release);
        info!("Shutdown complete");
        match first_error {
            Some(e) => Err(e),
            None => Ok(true),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Credentials wanted before each main-loop dispatch round
    pub min_credentials: usize,
    pub retry: RetryConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            min_credentials: 5,
            retry: RetryConfig::default(),
        }
    }
}

pub struct Coordinator {
    store: Arc<WorkQueue>,
    pool: Arc<CredentialPool>,
    engine: Arc<DispatchEngine>,
    logger: Arc<dyn RunLogger>,
    guard: Arc<ShutdownGuard>,
    config: CoordinatorConfig,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(
        store: Arc<WorkQueue>,
        pool: Arc<CredentialPool>,
        engine: Arc<DispatchEngine>,
        logger: Arc<dyn RunLogger>,
        guard: Arc<ShutdownGuard>,
        config: CoordinatorConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            pool,
            engine,
            logger,
            guard,
            config,
            cancel,
        }
    }

    pub fn shutdown_guard(&self) -> Arc<ShutdownGuard> {
        self.guard.clone()
    }

    /// Run to completion, cancellation or credential exhaustion, then shut down.
    pub async fn run(&self) -> Result<RunOutcome> {
        let driven = self.drive().await;

        let outcome = match &driven {
            Ok(outcome) => *outcome,
            Err(_) => RunOutcome::Aborted,
        };
        self.guard.record_outcome(outcome);
        let shutdown = self.guard.shutdown();

        let outcome = driven.context("Run aborted")?;
        shutdown?;
        self.logger.info(&format!("Run finished: {}", outcome));
        Ok(outcome)
    }

    async fn drive(&self) -> Result<RunOutcome, DispatchError> {
        let outcome = self.main_loop().await?;
        if outcome != RunOutcome::Completed {
            return Ok(outcome);
        }

        let stats = self.store.stats()?;
        if stats.failed == 0 {
            return Ok(RunOutcome::Completed);
        }

        self.logger.info(&format!(
            "Main loop drained; retrying {} failed identifiers",
            stats.failed
        ));
        let retry = RetryController::new(
            self.store.clone(),
            self.pool.clone(),
            self.engine.clone(),
            self.logger.clone(),
            self.config.retry.clone(),
        );
        let report = retry.run(&self.cancel).await?;
        self.guard.record_retry_rounds(report.rounds);
        debug!("Retry report: {:?}", report);

        Ok(match report.stop {
            RetryStop::Cancelled => RunOutcome::Cancelled,
            RetryStop::CredentialsExhausted => RunOutcome::CredentialsExhausted,
            RetryStop::Drained | RetryStop::NoProgress | RetryStop::MaxRounds => RunOutcome::Completed,
        })
    }

    async fn main_loop(&self) -> Result<RunOutcome, DispatchError> {
        let mut round = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }

            let pending = self.store.get_by_status(IdentifierStatus::Pending)?;
            if pending.is_empty() {
                return Ok(RunOutcome::Completed);
            }
            let pending_before = pending.len();

            let tokens = match self.pool.replenish(self.config.min_credentials).await {
                Ok(tokens) => tokens,
                Err(CredentialError::Cancelled) => return Ok(RunOutcome::Cancelled),
                Err(CredentialError::Exhausted) => {
                    self.logger
                        .error("No valid credentials left and nothing to provision; stopping");
                    return Ok(RunOutcome::CredentialsExhausted);
                }
                Err(e) => {
                    self.logger.error(&format!("Credential acquisition failed: {}", e));
                    return Ok(RunOutcome::CredentialsExhausted);
                }
            };

            round += 1;
            self.logger.info(&format!(
                "Dispatch round {}: {} pending identifiers, {} credentials",
                round,
                pending_before,
                tokens.len()
            ));

            let credentials = Arc::new(CredentialSet::new(tokens));
            let report = self.engine.run(pending, credentials.clone(), &self.cancel).await?;
            self.pool.absorb(&credentials);
            self.guard.record_dispatch_round();

            self.logger.info(&format!(
                "Dispatch round {} done: {} processed ({} with data, {} without, {} failed)",
                round, report.processed, report.has_result, report.no_result, report.failed
            ));

            if report.cancelled {
                return Ok(RunOutcome::Cancelled);
            }
            if report.credentials_exhausted {
                self.logger
                    .warn("Every credential in the round was rejected; replenishing");
                continue;
            }

            let pending_after = self.store.stats()?.pending;
            if pending_after >= pending_before {
                self.logger.warn(&format!(
                    "Dispatch round {} made no progress ({} still pending); stopping",
                    round, pending_after
                ));
                return Ok(RunOutcome::Stalled);
            }
        }
    }
}
