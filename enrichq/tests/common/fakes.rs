use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use enrichq::credentials::{Credential, ProvisionError, Provisioner};
use enrichq::identifiers::RawAccount;
use enrichq::logger::RunLogger;
use enrichq::lookup::{LookupApi, LookupError, LookupResponse, ProbeOutcome};

/// In-process lookup service.
///
/// Credentials are accepted when their token starts with `valid_prefix`;
/// anything else gets a 401 from both `lookup` and `probe`. Each identifier
/// can be given a script of responses: they are served in order and the
/// last one repeats. Unscripted identifiers get the fallback response.
pub struct ScriptedApi {
    valid_prefix: String,
    scripts: Mutex<HashMap<String, VecDeque<LookupResponse>>>,
    fallback: LookupResponse,
    lookups: AtomicUsize,
    probes: AtomicUsize,
    per_identifier: Mutex<HashMap<String, usize>>,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl ScriptedApi {
    pub fn new(valid_prefix: &str) -> Self {
        Self {
            valid_prefix: valid_prefix.to_string(),
            scripts: Mutex::new(HashMap::new()),
            fallback: LookupResponse::new(200, "{}"),
            lookups: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            per_identifier: Mutex::new(HashMap::new()),
            cancel_after: None,
        }
    }

    pub fn script(mut self, identifier: &str, responses: Vec<LookupResponse>) -> Self {
        self.scripts
            .get_mut()
            .unwrap()
            .insert(identifier.to_string(), responses.into());
        self
    }

    pub fn with_fallback(mut self, response: LookupResponse) -> Self {
        self.fallback = response;
        self
    }

    /// Cancel `token` as soon as the `count`-th lookup has been answered
    pub fn cancel_after(mut self, count: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((count, token));
        self
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn lookups_for(&self, identifier: &str) -> usize {
        self.per_identifier
            .lock()
            .unwrap()
            .get(identifier)
            .copied()
            .unwrap_or(0)
    }

    fn accepts(&self, credential: &Credential) -> bool {
        credential.token().starts_with(&self.valid_prefix)
    }

    fn next_response(&self, identifier: &str) -> LookupResponse {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(identifier) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap_or_else(|| self.fallback.clone()),
            None => self.fallback.clone(),
        }
    }
}

#[async_trait]
impl LookupApi for ScriptedApi {
    async fn lookup(&self, identifier: &str, credential: &Credential) -> Result<LookupResponse, LookupError> {
        if !self.accepts(credential) {
            return Ok(LookupResponse::new(401, "unauthorized"));
        }

        let response = self.next_response(identifier);
        *self
            .per_identifier
            .lock()
            .unwrap()
            .entry(identifier.to_string())
            .or_default() += 1;

        let answered = self.lookups.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((limit, token)) = &self.cancel_after {
            if answered == *limit {
                token.cancel();
            }
        }
        Ok(response)
    }

    async fn probe(&self, credential: &Credential) -> Result<ProbeOutcome, LookupError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(if self.accepts(credential) {
            ProbeOutcome::Valid
        } else {
            ProbeOutcome::Invalid
        })
    }
}

/// Turns every account into `<prefix><account identifier>` unless it is listed as rejected
pub struct PrefixProvisioner {
    prefix: String,
    rejected: HashSet<String>,
    calls: AtomicUsize,
}

impl PrefixProvisioner {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            rejected: HashSet::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn rejecting(mut self, account: &str) -> Self {
        self.rejected.insert(account.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provisioner for PrefixProvisioner {
    async fn provision(&self, account: &RawAccount) -> Result<Credential, ProvisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.rejected.contains(&account.identifier) {
            return Err(ProvisionError::Rejected {
                account: account.identifier.clone(),
                reason: "login refused".to_string(),
            });
        }
        Ok(Credential::new(format!("{}{}", self.prefix, account.identifier)))
    }
}

/// Keeps every message for later assertions
#[derive(Default)]
pub struct RecordingLogger {
    lines: Mutex<Vec<(&'static str, String)>>,
}

impl RecordingLogger {
    fn push(&self, level: &'static str, message: &str) {
        self.lines.lock().unwrap().push((level, message.to_string()));
    }

    pub fn contains(&self, level: &str, needle: &str) -> bool {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .any(|(l, m)| *l == level && m.contains(needle))
    }
}

impl RunLogger for RecordingLogger {
    fn info(&self, message: &str) {
        self.push("info", message);
    }

    fn warn(&self, message: &str) {
        self.push("warn", message);
    }

    fn error(&self, message: &str) {
        self.push("error", message);
    }

    fn success(&self, message: &str) {
        self.push("success", message);
    }

    fn progress(&self, _done: u64, _total: u64, _message: &str) {}
}
