#![allow(dead_code)]

pub mod fakes;
pub mod wiremock_helpers;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use enrichq::coordinator::{Coordinator, CoordinatorConfig, ShutdownGuard};
use enrichq::credentials::{AccountFile, CredentialCache, CredentialPool, PoolConfig, Provisioner};
use enrichq::dispatch::{DispatchConfig, DispatchEngine};
use enrichq::logger::RunLogger;
use enrichq::lookup::{JsonPointerDecoder, LookupApi};
use enrichq::rate_limit::AttemptDelay;
use enrichq::result_sink::ResultSink;
use enrichq::retry::RetryConfig;
use enrichq::store::WorkQueue;

use fakes::RecordingLogger;

/// `user000@example.com`, `user001@example.com`, ...
pub fn identifiers(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("user{:03}@example.com", i)).collect()
}

/// Knobs the scenarios vary; everything else runs without delays
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub workers: usize,
    pub max_attempts: u32,
    pub min_credentials: usize,
    pub max_rounds: u32,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 3,
            min_credentials: 1,
            max_rounds: 7,
        }
    }
}

/// One temporary run directory with every file the coordinator touches
pub struct Harness {
    pub dir: TempDir,
    pub cancel: CancellationToken,
    pub logger: Arc<RecordingLogger>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            cancel: CancellationToken::new(),
            logger: Arc::new(RecordingLogger::default()),
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn database(&self) -> PathBuf {
        self.path("queue.db")
    }

    pub fn handoff(&self) -> PathBuf {
        self.path("pending.txt")
    }

    pub fn result_sink(&self) -> PathBuf {
        self.path("results.txt")
    }

    pub fn summary(&self) -> PathBuf {
        self.path("summary.json")
    }

    pub fn accounts(&self) -> PathBuf {
        self.path("accounts.txt")
    }

    pub fn credential_cache(&self) -> PathBuf {
        self.path("tokens.txt")
    }

    /// Write `count` raw accounts named `acct00`, `acct01`, ...
    pub fn write_accounts(&self, count: usize) {
        let content: String = (0..count).map(|i| format!("acct{:02}|secret{}\n", i, i)).collect();
        std::fs::write(self.accounts(), content).unwrap();
    }

    pub fn write_cache(&self, tokens: &[&str]) {
        let content: String = tokens.iter().map(|t| format!("{}\n", t)).collect();
        std::fs::write(self.credential_cache(), content).unwrap();
    }

    /// Open the on-disk queue and load `identifiers` into it
    pub fn seed(&self, identifiers: &[String]) -> Arc<WorkQueue> {
        let store = Arc::new(WorkQueue::new(self.database()));
        store.load(identifiers).unwrap();
        store
    }

    /// A second handle on the queue file, e.g. after the coordinator closed its own
    pub fn reopen(&self) -> WorkQueue {
        WorkQueue::new(self.database())
    }

    /// Pool and engine wired the way the binary wires them, minus delays
    pub fn components(
        &self,
        store: Arc<WorkQueue>,
        api: Arc<dyn LookupApi>,
        provisioner: Arc<dyn Provisioner>,
        settings: &RunSettings,
    ) -> (Arc<CredentialPool>, Arc<DispatchEngine>) {
        let logger: Arc<dyn RunLogger> = self.logger.clone();

        let pool = Arc::new(CredentialPool::new(
            api.clone(),
            provisioner,
            AccountFile::new(self.accounts()),
            Some(CredentialCache::new(self.credential_cache())),
            PoolConfig {
                wave_pause: Duration::ZERO,
                ..PoolConfig::default()
            },
            logger.clone(),
            self.cancel.clone(),
        ));

        let sink = Arc::new(ResultSink::open(&self.result_sink()).unwrap());
        let engine = Arc::new(
            DispatchEngine::new(
                store,
                api,
                Arc::new(JsonPointerDecoder::default()),
                logger,
                DispatchConfig {
                    workers: settings.workers,
                    max_attempts: settings.max_attempts,
                    attempt_delay: AttemptDelay::none(),
                    channel_capacity: 16,
                    status_interval: Duration::from_millis(50),
                },
            )
            .with_result_sink(sink),
        );

        (pool, engine)
    }

    pub fn retry_config(&self, settings: &RunSettings) -> RetryConfig {
        RetryConfig {
            max_rounds: settings.max_rounds,
            round_delay: Duration::ZERO,
            min_credentials: 1,
        }
    }

    pub fn coordinator(
        &self,
        store: Arc<WorkQueue>,
        api: Arc<dyn LookupApi>,
        provisioner: Arc<dyn Provisioner>,
        settings: RunSettings,
    ) -> Coordinator {
        let logger: Arc<dyn RunLogger> = self.logger.clone();
        let (pool, engine) = self.components(store.clone(), api, provisioner, &settings);

        let guard = Arc::new(ShutdownGuard::new(
            store.clone(),
            logger.clone(),
            self.handoff(),
            Some(self.summary()),
        ));

        Coordinator::new(
            store,
            pool,
            engine,
            logger,
            guard,
            CoordinatorConfig {
                min_credentials: settings.min_credentials,
                retry: self.retry_config(&settings),
            },
            self.cancel.clone(),
        )
    }

    pub fn summary_json(&self) -> serde_json::Value {
        serde_json::from_str(&std::fs::read_to_string(self.summary()).unwrap()).unwrap()
    }
}
