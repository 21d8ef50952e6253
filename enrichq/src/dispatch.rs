//! Dispatch engine
//!
//! One dispatch round runs a fixed credential batch against a slice of pending
//! identifiers:
//!
//! - a single producer feeds identifiers into a bounded channel
//! - `workers` tasks share the receiving end and process one identifier at a time
//! - a status ticker reports progress and watches for credential exhaustion
//!
//! Every task of a round shares one [`RoundContext`]. Nothing is global, so
//! several engines can run side by side (tests do).
//!
//! Per identifier: `dequeue -> check credential health -> query -> classify -> persist`.
//! A 200 is terminal (has-result or no-result depending on the decoder). Anything
//! else is a failed attempt; after `max_attempts` the identifier is written
//! `failed`. When every credential of the batch has been rejected the round is
//! cancelled and in-progress identifiers stay `pending`.

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::credentials::CredentialSet;
use crate::logger::RunLogger;
use crate::lookup::{LookupApi, ProfileDecoder, ResponseClass};
use crate::rate_limit::{AttemptDelay, SharedRateLimiter};
use crate::result_sink::ResultSink;
use crate::store::{IdentifierStatus, StoreError, WorkQueue};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("work queue store failed: {0}")]
    Store(#[from] StoreError),

    #[error("dispatch worker failed: {0}")]
    Worker(String),
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub workers: usize,
    pub max_attempts: u32,
    pub attempt_delay: AttemptDelay,
    pub channel_capacity: usize,
    pub status_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 20,
            max_attempts: 5,
            attempt_delay: AttemptDelay::new(Duration::from_millis(200), Duration::from_millis(800)),
            channel_capacity: 256,
            status_interval: Duration::from_secs(5),
        }
    }
}

/// Counts for one dispatch round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub submitted: usize,
    /// identifiers whose attempt loop ran to a terminal write
    pub processed: usize,
    pub has_result: usize,
    pub no_result: usize,
    pub failed: usize,
    /// attempt loops interrupted by cancellation or credential exhaustion
    pub abandoned: usize,
    pub credentials_exhausted: bool,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    HasResult,
    NoResult,
    Failed,
    /// another writer had already moved the row out of pending
    AlreadyTerminal,
    Abandoned,
}

#[derive(Default)]
struct RoundCounters {
    processed: AtomicUsize,
    has_result: AtomicUsize,
    no_result: AtomicUsize,
    failed: AtomicUsize,
    abandoned: AtomicUsize,
}

impl RoundCounters {
    fn record(&self, outcome: Outcome) {
        let counter = match outcome {
            Outcome::HasResult => &self.has_result,
            Outcome::NoResult => &self.no_result,
            Outcome::Failed => &self.failed,
            Outcome::AlreadyTerminal => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Outcome::Abandoned => {
                self.abandoned.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }
}

/// State shared by the producer, the workers and the ticker of one round
struct RoundContext {
    store: Arc<WorkQueue>,
    api: Arc<dyn LookupApi>,
    decoder: Arc<dyn ProfileDecoder>,
    sink: Option<Arc<ResultSink>>,
    limiter: SharedRateLimiter,
    logger: Arc<dyn RunLogger>,
    config: DispatchConfig,
    credentials: Arc<CredentialSet>,
    cancel: CancellationToken,
    counters: RoundCounters,
    fatal: Mutex<Option<StoreError>>,
    total: usize,
}

impl RoundContext {
    fn record_fatal(&self, error: StoreError) {
        if let Ok(mut fatal) = self.fatal.lock() {
            if fatal.is_none() {
                *fatal = Some(error);
            }
        }
        self.cancel.cancel();
    }

    fn take_fatal(&self) -> Option<StoreError> {
        self.fatal.lock().ok().and_then(|mut fatal| fatal.take())
    }

    fn should_stop(&self) -> bool {
        self.cancel.is_cancelled() || self.credentials.is_exhausted()
    }

    fn on_credential_exhausted(&self) {
        self.logger.warn(&format!(
            "All {} credentials in this round were rejected; stopping dispatch",
            self.credentials.len()
        ));
        self.cancel.cancel();
    }

    async fn pause_between_attempts(&self) {
        let delay = self.config.attempt_delay.sample();
        if delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    fn report_progress(&self) {
        let c = &self.counters;
        self.logger.progress(
            c.processed.load(Ordering::Relaxed) as u64,
            self.total as u64,
            &format!(
                "{} with data, {} without, {} failed, {}/{} credentials valid",
                c.has_result.load(Ordering::Relaxed),
                c.no_result.load(Ordering::Relaxed),
                c.failed.load(Ordering::Relaxed),
                self.credentials.valid_count(),
                self.credentials.len()
            ),
        );
    }

    fn report(&self, cancelled: bool) -> DispatchReport {
        let c = &self.counters;
        DispatchReport {
            submitted: self.total,
            processed: c.processed.load(Ordering::Relaxed),
            has_result: c.has_result.load(Ordering::Relaxed),
            no_result: c.no_result.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
            credentials_exhausted: self.credentials.is_exhausted(),
            cancelled,
        }
    }
}

pub struct DispatchEngine {
    store: Arc<WorkQueue>,
    api: Arc<dyn LookupApi>,
    decoder: Arc<dyn ProfileDecoder>,
    sink: Option<Arc<ResultSink>>,
    limiter: SharedRateLimiter,
    logger: Arc<dyn RunLogger>,
    config: DispatchConfig,
}

impl DispatchEngine {
    pub fn new(
        store: Arc<WorkQueue>,
        api: Arc<dyn LookupApi>,
        decoder: Arc<dyn ProfileDecoder>,
        logger: Arc<dyn RunLogger>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            store,
            api,
            decoder,
            sink: None,
            limiter: SharedRateLimiter::unlimited(),
            logger,
            config,
        }
    }

    pub fn with_result_sink(mut self, sink: Arc<ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: SharedRateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Run one dispatch round.
    ///
    /// Returns when every identifier has been handled, when `cancel` fires, or
    /// when the credential batch is exhausted. A store failure aborts the round
    /// and is returned as an error.
    pub async fn run(
        &self,
        identifiers: Vec<String>,
        credentials: Arc<CredentialSet>,
        cancel: &CancellationToken,
    ) -> Result<DispatchReport, DispatchError> {
        let total = identifiers.len();
        let round_cancel = cancel.child_token();

        let ctx = Arc::new(RoundContext {
            store: self.store.clone(),
            api: self.api.clone(),
            decoder: self.decoder.clone(),
            sink: self.sink.clone(),
            limiter: self.limiter.clone(),
            logger: self.logger.clone(),
            config: self.config.clone(),
            credentials,
            cancel: round_cancel.clone(),
            counters: RoundCounters::default(),
            fatal: Mutex::new(None),
            total,
        });

        if total == 0 {
            return Ok(ctx.report(cancel.is_cancelled()));
        }
        if ctx.credentials.is_exhausted() {
            ctx.logger.warn("Dispatch round started without valid credentials");
            return Ok(ctx.report(cancel.is_cancelled()));
        }

        let worker_count = self.config.workers.max(1).min(total);
        info!(
            "Dispatching {} identifiers across {} workers with {} credentials",
            total,
            worker_count,
            ctx.credentials.len()
        );

        let (tx, rx) = mpsc::channel::<String>(self.config.channel_capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let producer = {
            let token = round_cancel.clone();
            tokio::spawn(async move {
                for identifier in identifiers {
                    tokio::select! {
                        sent = tx.send(identifier) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                        _ = token.cancelled() => break,
                    }
                }
                // dropping tx closes the channel
            })
        };

        let ticker_stop = CancellationToken::new();
        let ticker = tokio::spawn(status_ticker(ctx.clone(), ticker_stop.clone()));

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            workers.spawn(worker_loop(worker_id, ctx.clone(), rx.clone()));
        }

        let mut worker_failure = None;
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!("Dispatch worker terminated abnormally: {}", e);
                worker_failure.get_or_insert_with(|| e.to_string());
                round_cancel.cancel();
            }
        }

        ticker_stop.cancel();
        // unblocks the producer if workers stopped early
        round_cancel.cancel();
        let _ = ticker.await;
        let _ = producer.await;

        ctx.report_progress();

        if let Some(error) = ctx.take_fatal() {
            ctx.logger.error(&format!("Dispatch aborted: {}", error));
            return Err(DispatchError::Store(error));
        }
        if let Some(message) = worker_failure {
            return Err(DispatchError::Worker(message));
        }

        let report = ctx.report(cancel.is_cancelled());
        debug!("Dispatch round finished: {:?}", report);
        Ok(report)
    }
}

async fn worker_loop(
    worker_id: usize,
    ctx: Arc<RoundContext>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
) {
    loop {
        if ctx.should_stop() {
            break;
        }

        let next = {
            let mut rx = rx.lock().await;
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => None,
                identifier = rx.recv() => identifier,
            }
        };
        let Some(identifier) = next else {
            break;
        };

        if ctx.should_stop() {
            // stays pending for the next round
            break;
        }

        match process_identifier(&ctx, &identifier).await {
            Ok(outcome) => ctx.counters.record(outcome),
            Err(e) => {
                warn!("Worker {} stopping after store failure on {}: {}", worker_id, identifier, e);
                ctx.record_fatal(e);
                break;
            }
        }
    }
    debug!("Worker {} exiting", worker_id);
}

async fn process_identifier(ctx: &RoundContext, identifier: &str) -> Result<Outcome, StoreError> {
    let max_attempts = ctx.config.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        if attempt > 1 && ctx.should_stop() {
            return Ok(Outcome::Abandoned);
        }
        let Some((index, credential)) = ctx.credentials.next() else {
            return Ok(Outcome::Abandoned);
        };

        ctx.limiter.acquire().await;

        match ctx.api.lookup(identifier, &credential).await {
            Ok(response) => match response.classify() {
                ResponseClass::Success => return persist_success(ctx, identifier, &response.body),
                ResponseClass::AuthRejected => {
                    debug!(
                        "Credential {} rejected with {} on {}",
                        credential, response.status, identifier
                    );
                    if ctx.credentials.mark_invalid(index) {
                        ctx.on_credential_exhausted();
                    }
                }
                ResponseClass::Transient => {
                    debug!(
                        "Attempt {}/{} for {} returned {}",
                        attempt, max_attempts, identifier, response.status
                    );
                }
            },
            Err(e) => {
                debug!("Attempt {}/{} for {} failed: {}", attempt, max_attempts, identifier, e);
            }
        }

        if attempt < max_attempts && !ctx.should_stop() {
            ctx.pause_between_attempts().await;
        }
    }

    if ctx.credentials.is_exhausted() {
        return Ok(Outcome::Abandoned);
    }

    if ctx.store.update_status(identifier, IdentifierStatus::Failed, false, false)? {
        Ok(Outcome::Failed)
    } else {
        Ok(Outcome::AlreadyTerminal)
    }
}

fn persist_success(ctx: &RoundContext, identifier: &str, body: &str) -> Result<Outcome, StoreError> {
    let record = ctx.decoder.decode(identifier, body);
    let has_result = record.is_some();

    if !ctx
        .store
        .update_status(identifier, IdentifierStatus::Success, has_result, !has_result)?
    {
        return Ok(Outcome::AlreadyTerminal);
    }

    if let (Some(record), Some(sink)) = (record, &ctx.sink) {
        if let Err(e) = sink.append(&record) {
            ctx.logger
                .warn(&format!("Failed to write result for {}: {:#}", identifier, e));
        }
    }

    Ok(if has_result {
        Outcome::HasResult
    } else {
        Outcome::NoResult
    })
}

async fn status_ticker(ctx: Arc<RoundContext>, stop: CancellationToken) {
    let period = ctx.config.status_interval.max(Duration::from_millis(10));
    let mut interval = tokio::time::interval(period);
    // the first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = stop.cancelled() => break,
            _ = ctx.cancel.cancelled() => break,
        }

        ctx.report_progress();

        if ctx.credentials.is_exhausted() {
            ctx.on_credential_exhausted();
            break;
        }
    }
}
