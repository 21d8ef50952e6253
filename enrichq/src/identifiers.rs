//! Flat-file input parsing for identifiers, cached credentials and raw accounts
//!
//! All three formats are line oriented:
//! - blank lines and lines starting with `#` are ignored
//! - identifier lists are either one address per line or CSV, in which case the
//!   identifier is the last comma-separated field
//! - credential caches hold one bearer token per line, optionally prefixed with `Bearer `
//! - raw account files hold `identifier|secret` pairs

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

static IDENTIFIER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9._%+\-]+@[a-z0-9.\-]+\.[a-z]{2,}$").expect("identifier pattern is valid")
});

/// Outcome of importing an identifier list
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportReport {
    /// Normalized, deduplicated identifiers in first-seen order
    pub identifiers: Vec<String>,
    /// Lines dropped because they did not look like an address
    pub invalid: usize,
    /// Lines dropped because the normalized identifier was already seen
    pub duplicates: usize,
}

/// Normalize an identifier to its unique-key form
pub fn normalize_identifier(raw: &str) -> String {
    raw.trim().trim_matches('"').trim().to_lowercase()
}

/// Check a normalized identifier against the address pattern
pub fn is_valid_identifier(identifier: &str) -> bool {
    !identifier.contains("..") && IDENTIFIER_PATTERN.is_match(identifier)
}

/// Parse identifiers from file content.
pub fn parse_identifiers(content: &str) -> ImportReport {
    let mut report = ImportReport::default();
    let mut seen = HashSet::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // CSV rows carry the identifier in the last column
        let field = line.rsplit(',').next().unwrap_or(line);
        let identifier = normalize_identifier(field);

        if !is_valid_identifier(&identifier) {
            report.invalid += 1;
            continue;
        }

        if seen.insert(identifier.clone()) {
            report.identifiers.push(identifier);
        } else {
            report.duplicates += 1;
        }
    }

    report
}

/// Read and parse an identifier list file
pub fn read_identifier_file(path: &Path) -> Result<ImportReport> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read identifier file: {}", path.display()))?;
    Ok(parse_identifiers(&content))
}

/// Parse bearer tokens from credential cache content, stripping any `Bearer ` prefix
pub fn parse_credential_lines(content: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            line.strip_prefix("Bearer ")
                .or_else(|| line.strip_prefix("bearer "))
                .unwrap_or(line)
                .trim()
                .to_string()
        })
        .filter(|token| !token.is_empty() && seen.insert(token.clone()))
        .collect()
}

/// A raw account line that can be exchanged for a credential
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RawAccount {
    pub identifier: String,
    pub secret: String,
}

impl std::fmt::Debug for RawAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawAccount")
            .field("identifier", &self.identifier)
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl RawAccount {
    /// Parse a single `identifier|secret` line
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let (identifier, secret) = line.split_once('|')?;
        let identifier = identifier.trim();
        let secret = secret.trim();
        if identifier.is_empty() || secret.is_empty() {
            return None;
        }
        Some(Self {
            identifier: identifier.to_string(),
            secret: secret.to_string(),
        })
    }

    /// Serialize back to the on-disk line format
    pub fn to_line(&self) -> String {
        format!("{}|{}", self.identifier, self.secret)
    }
}

/// Parse all well-formed accounts from raw account file content
pub fn parse_accounts(content: &str) -> Vec<RawAccount> {
    content.lines().filter_map(RawAccount::parse).collect()
}
