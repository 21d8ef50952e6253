//! Credential pool manager
//!
//! Keeps a run supplied with credentials the lookup API still accepts:
//! - `validate` probes candidates in parallel
//! - `acquire` drives the provisioning collaborator in waves until enough
//!   valid credentials are collected or the raw accounts run out
//! - `replenish` combines both, starting from the credentials carried over
//!   from the previous round and the on-disk cache

use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{AccountFile, Credential, CredentialCache, CredentialError, CredentialSet, Provisioner};
use crate::identifiers::RawAccount;
use crate::logger::RunLogger;
use crate::lookup::{LookupApi, ProbeOutcome};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Accounts requested per wave, as a multiple of the remaining need
    pub wave_multiplier: usize,
    pub wave_pause: Duration,
    pub probe_concurrency: usize,
    pub provision_concurrency: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            wave_multiplier: 3,
            wave_pause: Duration::from_secs(30),
            probe_concurrency: 10,
            provision_concurrency: 4,
        }
    }
}

#[derive(Default)]
struct KnownCredentials {
    /// still valid at the end of the last dispatch round
    carried: Vec<Credential>,
    /// rejected by a probe or a lookup; never probed again by this pool
    rejected: HashSet<Credential>,
}

pub struct CredentialPool {
    api: Arc<dyn LookupApi>,
    provisioner: Arc<dyn Provisioner>,
    accounts: AccountFile,
    cache: Option<CredentialCache>,
    config: PoolConfig,
    logger: Arc<dyn RunLogger>,
    cancel: CancellationToken,
    known: Mutex<KnownCredentials>,
}

impl CredentialPool {
    pub fn new(
        api: Arc<dyn LookupApi>,
        provisioner: Arc<dyn Provisioner>,
        accounts: AccountFile,
        cache: Option<CredentialCache>,
        config: PoolConfig,
        logger: Arc<dyn RunLogger>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            api,
            provisioner,
            accounts,
            cache,
            config,
            logger,
            cancel,
            known: Mutex::new(KnownCredentials::default()),
        }
    }

    fn is_rejected(&self, credential: &Credential) -> bool {
        self.known
            .lock()
            .map(|known| known.rejected.contains(credential))
            .unwrap_or(false)
    }

    fn reject(&self, credentials: impl IntoIterator<Item = Credential>) {
        if let Ok(mut known) = self.known.lock() {
            known.rejected.extend(credentials);
        }
    }

    /// Record the outcome of a dispatch round: keep the survivors for the next
    /// round and remember the rejected ones.
    pub fn absorb(&self, set: &CredentialSet) {
        let invalid = set.invalid();
        if let Ok(mut known) = self.known.lock() {
            known.carried = set.valid();
            known.rejected.extend(invalid);
        }
    }

    /// Probe every candidate in parallel and keep the ones the API accepts.
    ///
    /// A probe that errors or returns a non-auth failure is inconclusive: the
    /// candidate is dropped from this batch but not remembered as rejected.
    pub async fn validate(&self, candidates: Vec<Credential>) -> Result<Vec<Credential>, CredentialError> {
        if self.cancel.is_cancelled() {
            return Err(CredentialError::Cancelled);
        }

        let mut seen = HashSet::new();
        let unique: Vec<Credential> = candidates
            .into_iter()
            .filter(|c| !c.is_empty() && !self.is_rejected(c) && seen.insert(c.clone()))
            .collect();
        if unique.is_empty() {
            return Ok(Vec::new());
        }

        let total = unique.len();
        let probes = stream::iter(unique)
            .map(|credential| {
                let api = self.api.clone();
                async move {
                    let outcome = api.probe(&credential).await;
                    (credential, outcome)
                }
            })
            .buffer_unordered(self.config.probe_concurrency.max(1))
            .collect::<Vec<_>>();

        let results = tokio::select! {
            results = probes => results,
            _ = self.cancel.cancelled() => return Err(CredentialError::Cancelled),
        };

        let mut valid = Vec::new();
        let mut rejected = Vec::new();
        for (credential, outcome) in results {
            match outcome {
                Ok(ProbeOutcome::Valid) => valid.push(credential),
                Ok(ProbeOutcome::Invalid) => rejected.push(credential),
                Ok(ProbeOutcome::Inconclusive) => {
                    debug!("Probe inconclusive for credential {}", credential);
                }
                Err(e) => {
                    debug!("Probe failed for credential {}: {}", credential, e);
                }
            }
        }

        debug!(
            "Validated {} candidates: {} valid, {} rejected",
            total,
            valid.len(),
            rejected.len()
        );
        self.reject(rejected);
        Ok(valid)
    }

    async fn provision_wave(&self, batch: Vec<RawAccount>) -> (Vec<Credential>, usize) {
        let outcomes = stream::iter(batch)
            .map(|account| {
                let provisioner = self.provisioner.clone();
                async move {
                    let result = provisioner.provision(&account).await;
                    (account, result)
                }
            })
            .buffer_unordered(self.config.provision_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut credentials = Vec::new();
        let mut failures = 0;
        for (account, result) in outcomes {
            match result {
                Ok(credential) => {
                    if let Err(e) = self.accounts.consume(&account).await {
                        self.logger
                            .warn(&format!("Failed to remove used account {}: {}", account.identifier, e));
                    }
                    credentials.push(credential);
                }
                Err(e) => {
                    failures += 1;
                    debug!("Provisioning failed: {}", e);
                }
            }
        }
        (credentials, failures)
    }

    /// Drive the provisioning collaborator in waves until `min_count` valid
    /// credentials are collected or no raw accounts are left.
    ///
    /// Returns whatever was collected. Errors only when nothing was collected.
    pub async fn acquire(&self, min_count: usize) -> Result<Vec<Credential>, CredentialError> {
        let mut collected: Vec<Credential> = Vec::new();
        let mut seen: HashSet<Credential> = HashSet::new();
        let mut wave = 0usize;

        while collected.len() < min_count && !self.cancel.is_cancelled() {
            let need = min_count - collected.len();
            let request = need.saturating_mul(self.config.wave_multiplier.max(1));
            let batch = self.accounts.take(request).await?;
            if batch.is_empty() {
                self.logger.warn("No raw accounts left for provisioning");
                break;
            }

            wave += 1;
            self.logger.info(&format!(
                "Provisioning wave {}: {} accounts for {} needed credentials",
                wave,
                batch.len(),
                need
            ));

            let requested = batch.len();
            let (provisioned, failures) = tokio::select! {
                outcome = self.provision_wave(batch) => outcome,
                _ = self.cancel.cancelled() => break,
            };

            let valid = match self.validate(provisioned).await {
                Ok(valid) => valid,
                Err(CredentialError::Cancelled) => break,
                Err(e) => return Err(e),
            };
            let fresh: Vec<Credential> = valid.into_iter().filter(|c| seen.insert(c.clone())).collect();

            if let Some(cache) = &self.cache {
                if let Err(e) = cache.merge(&fresh) {
                    self.logger
                        .warn(&format!("Failed to update credential cache {}: {}", cache.path().display(), e));
                }
            }

            self.logger.success(&format!(
                "Wave {}: {} valid credentials from {} accounts ({} provisioning failures)",
                wave,
                fresh.len(),
                requested,
                failures
            ));
            collected.extend(fresh);

            if collected.len() >= min_count {
                break;
            }
            if self.accounts.remaining().await? == 0 {
                self.logger.warn("Raw accounts exhausted");
                break;
            }

            debug!("Pausing {:?} before next provisioning wave", self.config.wave_pause);
            tokio::select! {
                _ = tokio::time::sleep(self.config.wave_pause) => {}
                _ = self.cancel.cancelled() => break,
            }
        }

        if collected.is_empty() {
            if self.cancel.is_cancelled() {
                return Err(CredentialError::Cancelled);
            }
            return Err(CredentialError::Exhausted);
        }
        Ok(collected)
    }

    /// Assemble a credential batch of at least `min_count` if possible.
    ///
    /// Credentials carried over from the last round and the cache file are
    /// validated first; provisioning only covers the shortfall. When
    /// provisioning is exhausted but some valid credentials exist, the partial
    /// set is returned.
    pub async fn replenish(&self, min_count: usize) -> Result<Vec<Credential>, CredentialError> {
        let mut candidates = self
            .known
            .lock()
            .map(|mut known| std::mem::take(&mut known.carried))
            .unwrap_or_default();

        if let Some(cache) = &self.cache {
            match cache.load() {
                Ok(cached) => candidates.extend(cached),
                Err(e) => self
                    .logger
                    .warn(&format!("Failed to read credential cache {}: {}", cache.path().display(), e)),
            }
        }

        let mut valid = self.validate(candidates).await?;
        if valid.len() >= min_count.max(1) {
            self.logger
                .info(&format!("{} valid credentials available", valid.len()));
            return Ok(valid);
        }

        let shortfall = min_count.max(1) - valid.len();
        match self.acquire(shortfall).await {
            Ok(more) => {
                let mut seen: HashSet<Credential> = valid.iter().cloned().collect();
                valid.extend(more.into_iter().filter(|c| seen.insert(c.clone())));
            }
            Err(CredentialError::Exhausted) if !valid.is_empty() => {
                self.logger.warn(&format!(
                    "Provisioning exhausted; continuing with {} valid credentials",
                    valid.len()
                ));
            }
            Err(e) => return Err(e),
        }

        self.logger
            .info(&format!("{} valid credentials available", valid.len()));
        Ok(valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::ProvisionError;
    use crate::logger::NullLogger;
    use crate::lookup::{LookupError, LookupResponse};
    use async_trait::async_trait;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Accepts credentials whose token starts with "good"
    struct PrefixApi {
        probes: AtomicUsize,
    }

    #[async_trait]
    impl LookupApi for PrefixApi {
        async fn lookup(&self, _identifier: &str, _credential: &Credential) -> Result<LookupResponse, LookupError> {
            Ok(LookupResponse::new(200, "{}"))
        }

        async fn probe(&self, credential: &Credential) -> Result<ProbeOutcome, LookupError> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if credential.token().starts_with("good") {
                Ok(ProbeOutcome::Valid)
            } else if credential.token().starts_with("flaky") {
                Err(LookupError::Timeout)
            } else {
                Ok(ProbeOutcome::Invalid)
            }
        }
    }

    /// Provisions "good-<account>" except for accounts whose secret is "bad"
    struct SecretProvisioner;

    #[async_trait]
    impl Provisioner for SecretProvisioner {
        async fn provision(&self, account: &RawAccount) -> Result<Credential, ProvisionError> {
            if account.secret == "bad" {
                Err(ProvisionError::Rejected {
                    account: account.identifier.clone(),
                    reason: "login failed".to_string(),
                })
            } else {
                Ok(Credential::new(format!("good-{}", account.identifier)))
            }
        }
    }

    fn make_pool(tmp: &TempDir, accounts: &str, cached: &str) -> (CredentialPool, Arc<PrefixApi>) {
        let accounts_path = tmp.path().join("accounts.txt");
        let cache_path = tmp.path().join("tokens.txt");
        fs::write(&accounts_path, accounts).unwrap();
        fs::write(&cache_path, cached).unwrap();

        let api = Arc::new(PrefixApi {
            probes: AtomicUsize::new(0),
        });
        let pool = CredentialPool::new(
            api.clone(),
            Arc::new(SecretProvisioner),
            AccountFile::new(accounts_path),
            Some(CredentialCache::new(cache_path)),
            PoolConfig {
                wave_pause: Duration::from_millis(1),
                ..PoolConfig::default()
            },
            Arc::new(NullLogger),
            CancellationToken::new(),
        );
        (pool, api)
    }

    #[tokio::test]
    async fn test_validate_partitions_candidates() {
        let tmp = TempDir::new().unwrap();
        let (pool, _) = make_pool(&tmp, "", "");

        let valid = pool
            .validate(vec![
                Credential::new("good-1"),
                Credential::new("bad-1"),
                Credential::new("flaky-1"),
                Credential::new("good-1"),
            ])
            .await
            .unwrap();

        assert_eq!(valid, vec![Credential::new("good-1")]);
        assert!(pool.is_rejected(&Credential::new("bad-1")));
        assert!(!pool.is_rejected(&Credential::new("flaky-1")));
    }

    #[tokio::test]
    async fn test_rejected_credentials_are_not_probed_again() {
        let tmp = TempDir::new().unwrap();
        let (pool, api) = make_pool(&tmp, "", "");

        pool.validate(vec![Credential::new("bad-1")]).await.unwrap();
        pool.validate(vec![Credential::new("bad-1")]).await.unwrap();
        assert_eq!(api.probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_acquire_collects_and_consumes_accounts() {
        let tmp = TempDir::new().unwrap();
        let accounts: String = (0..10).map(|i| format!("a{}@mail.com|pw\n", i)).collect();
        let (pool, _) = make_pool(&tmp, &accounts, "");

        let tokens = pool.acquire(2).await.unwrap();
        // first wave asks for 2 * 3 accounts
        assert_eq!(tokens.len(), 6);

        let remaining = fs::read_to_string(tmp.path().join("accounts.txt")).unwrap();
        assert_eq!(remaining.lines().count(), 4);

        let cached = CredentialCache::new(tmp.path().join("tokens.txt")).load().unwrap();
        assert_eq!(cached.len(), 6);
    }

    #[tokio::test]
    async fn test_acquire_runs_more_waves_when_provisioning_fails() {
        let tmp = TempDir::new().unwrap();
        let accounts = "a0@mail.com|bad\na1@mail.com|bad\na2@mail.com|bad\na3@mail.com|pw\n";
        let (pool, _) = make_pool(&tmp, accounts, "");

        let tokens = pool.acquire(1).await.unwrap();
        assert_eq!(tokens, vec![Credential::new("good-a3@mail.com")]);

        // failed accounts stay in the file for a later run
        let remaining = fs::read_to_string(tmp.path().join("accounts.txt")).unwrap();
        assert_eq!(remaining.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_acquire_errors_only_when_nothing_collected() {
        let tmp = TempDir::new().unwrap();
        let (pool, _) = make_pool(&tmp, "a0@mail.com|bad\n", "");
        assert!(matches!(pool.acquire(3).await, Err(CredentialError::Exhausted)));

        let tmp = TempDir::new().unwrap();
        let (pool, _) = make_pool(&tmp, "a0@mail.com|pw\n", "");
        assert_eq!(pool.acquire(3).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_replenish_prefers_cache() {
        let tmp = TempDir::new().unwrap();
        let (pool, _) = make_pool(&tmp, "a0@mail.com|pw\n", "good-x\ngood-y\nbad-z\n");

        let tokens = pool.replenish(2).await.unwrap();
        assert_eq!(tokens.len(), 2);
        // no account was provisioned
        let remaining = fs::read_to_string(tmp.path().join("accounts.txt")).unwrap();
        assert_eq!(remaining.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_replenish_partial_set_when_exhausted() {
        let tmp = TempDir::new().unwrap();
        let (pool, _) = make_pool(&tmp, "", "good-x\n");

        let tokens = pool.replenish(5).await.unwrap();
        assert_eq!(tokens, vec![Credential::new("good-x")]);
    }

    #[tokio::test]
    async fn test_replenish_all_invalid_and_no_accounts() {
        let tmp = TempDir::new().unwrap();
        let cached = "bad-1\nbad-2\nbad-3\nbad-4\nbad-5\n";
        let (pool, _) = make_pool(&tmp, "", cached);

        assert!(matches!(pool.replenish(1).await, Err(CredentialError::Exhausted)));
    }

    #[tokio::test]
    async fn test_absorb_carries_survivors() {
        let tmp = TempDir::new().unwrap();
        let (pool, api) = make_pool(&tmp, "", "");

        let set = CredentialSet::new(vec![Credential::new("good-a"), Credential::new("good-b")]);
        set.mark_invalid(1);
        pool.absorb(&set);

        let tokens = pool.replenish(1).await.unwrap();
        assert_eq!(tokens, vec![Credential::new("good-a")]);
        assert_eq!(api.probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_validate_after_cancel() {
        let tmp = TempDir::new().unwrap();
        let (pool, _) = make_pool(&tmp, "", "");
        pool.cancel.cancel();
        assert!(matches!(
            pool.validate(vec![Credential::new("good-1")]).await,
            Err(CredentialError::Cancelled)
        ));
    }
}
