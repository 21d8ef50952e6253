//! Credentials: bearer tokens, per-round validity tracking and the pool that
//! keeps enough of them available.

pub mod accounts;
pub mod cache;
pub mod pool;
pub mod provision;

pub use accounts::AccountFile;
pub use cache::CredentialCache;
pub use pool::{CredentialPool, PoolConfig};
pub use provision::{CommandProvisioner, DisabledProvisioner, ProvisionError, Provisioner};

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("no valid credentials and the provisioning source is exhausted")]
    Exhausted,

    #[error("credential acquisition cancelled")]
    Cancelled,

    #[error("credential file I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque bearer token
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential(String);

impl Credential {
    /// Wrap a raw token, stripping a leading `Bearer ` if present
    pub fn new(raw: impl AsRef<str>) -> Self {
        let raw = raw.as_ref().trim();
        let token = raw
            .strip_prefix("Bearer ")
            .or_else(|| raw.strip_prefix("bearer "))
            .unwrap_or(raw)
            .trim();
        Self(token.to_string())
    }

    pub fn token(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.0)
    }

    fn redacted(&self) -> String {
        let prefix: String = self.0.chars().take(6).collect();
        format!("{}...", prefix)
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Credential({})", self.redacted())
    }
}

impl std::fmt::Display for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.redacted())
    }
}

struct Validity {
    invalid: Vec<bool>,
    invalid_count: usize,
}

/// The fixed credential batch used by one dispatch round.
///
/// Workers pick credentials round-robin and mark them invalid when the API
/// rejects them. The exhausted flag is only ever set under the same lock that
/// updates the invalid map, and only when every credential in the batch is
/// invalid, so the check is race-free.
pub struct CredentialSet {
    credentials: Vec<Credential>,
    validity: Mutex<Validity>,
    exhausted: AtomicBool,
    cursor: AtomicUsize,
}

impl CredentialSet {
    pub fn new(credentials: Vec<Credential>) -> Self {
        let mut seen = HashSet::new();
        let credentials: Vec<Credential> = credentials
            .into_iter()
            .filter(|c| !c.is_empty() && seen.insert(c.clone()))
            .collect();
        let len = credentials.len();
        Self {
            credentials,
            validity: Mutex::new(Validity {
                invalid: vec![false; len],
                invalid_count: 0,
            }),
            exhausted: AtomicBool::new(len == 0),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// True once every credential in the batch has been marked invalid
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    /// Next still-valid credential in round-robin order
    pub fn next(&self) -> Option<(usize, Credential)> {
        let len = self.credentials.len();
        if len == 0 || self.is_exhausted() {
            return None;
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
        let validity = self.validity.lock().ok()?;
        (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&idx| !validity.invalid[idx])
            .map(|idx| (idx, self.credentials[idx].clone()))
    }

    /// Mark one credential invalid. Returns `true` only for the call that
    /// flipped the whole batch to exhausted.
    pub fn mark_invalid(&self, index: usize) -> bool {
        let Ok(mut validity) = self.validity.lock() else {
            return false;
        };
        if index >= validity.invalid.len() || validity.invalid[index] {
            return false;
        }
        validity.invalid[index] = true;
        validity.invalid_count += 1;
        if validity.invalid_count == validity.invalid.len() {
            return !self.exhausted.swap(true, Ordering::AcqRel);
        }
        false
    }

    pub fn valid_count(&self) -> usize {
        self.validity
            .lock()
            .map(|v| v.invalid.len() - v.invalid_count)
            .unwrap_or(0)
    }

    fn partition(&self, want_invalid: bool) -> Vec<Credential> {
        let Ok(validity) = self.validity.lock() else {
            return Vec::new();
        };
        self.credentials
            .iter()
            .zip(validity.invalid.iter())
            .filter(|(_, invalid)| **invalid == want_invalid)
            .map(|(c, _)| c.clone())
            .collect()
    }

    /// Credentials not yet rejected
    pub fn valid(&self) -> Vec<Credential> {
        self.partition(false)
    }

    /// Credentials rejected during the round
    pub fn invalid(&self) -> Vec<Credential> {
        self.partition(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn creds(n: usize) -> Vec<Credential> {
        (0..n).map(|i| Credential::new(format!("token-{}", i))).collect()
    }

    #[test]
    fn test_credential_strips_bearer_and_redacts() {
        let credential = Credential::new("Bearer abcdefghijkl");
        assert_eq!(credential.token(), "abcdefghijkl");
        assert_eq!(credential.authorization_header(), "Bearer abcdefghijkl");
        assert_eq!(format!("{}", credential), "abcdef...");
        assert!(!format!("{:?}", credential).contains("ghijkl"));
    }

    #[test]
    fn test_set_round_robin_skips_invalid() {
        let set = CredentialSet::new(creds(3));
        set.mark_invalid(1);

        let picked: Vec<usize> = (0..6).filter_map(|_| set.next()).map(|(i, _)| i).collect();
        assert!(!picked.contains(&1));
        assert!(picked.contains(&0));
        assert!(picked.contains(&2));
        assert_eq!(set.valid_count(), 2);
    }

    #[test]
    fn test_set_deduplicates() {
        let mut list = creds(2);
        list.push(Credential::new("token-0"));
        list.push(Credential::new(""));
        let set = CredentialSet::new(list);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_exhaustion_only_when_all_invalid() {
        let set = CredentialSet::new(creds(2));
        assert!(!set.mark_invalid(0));
        assert!(!set.mark_invalid(0));
        assert!(!set.is_exhausted());
        assert!(set.mark_invalid(1));
        assert!(set.is_exhausted());
        assert!(set.next().is_none());
        assert_eq!(set.invalid().len(), 2);
        assert!(set.valid().is_empty());
    }

    #[test]
    fn test_empty_set_is_exhausted() {
        let set = CredentialSet::new(Vec::new());
        assert!(set.is_exhausted());
        assert!(set.next().is_none());
    }

    #[test]
    fn test_concurrent_invalidation_flips_exactly_once() {
        let set = Arc::new(CredentialSet::new(creds(16)));
        let handles: Vec<_> = (0..16)
            .map(|i| {
                let set = set.clone();
                std::thread::spawn(move || set.mark_invalid(i))
            })
            .collect();
        let flips = handles.into_iter().map(|h| h.join().unwrap()).filter(|f| *f).count();

        assert_eq!(flips, 1);
        assert!(set.is_exhausted());
    }
}
