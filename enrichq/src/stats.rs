//! Run statistics and the end-of-run summary
//!
//! Statistics are always derived from the work queue on demand; nothing here
//! keeps a running total.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Snapshot of the work queue counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub total: usize,
    pub pending: usize,
    pub success: usize,
    pub failed: usize,
    pub has_result: usize,
    pub no_result: usize,
}

impl RunStats {
    /// Identifiers that are not in a terminal success state
    pub fn remaining(&self) -> usize {
        self.pending + self.failed
    }

    /// Flat name -> count view, keyed the same way as the store's status column
    pub fn as_map(&self) -> BTreeMap<&'static str, usize> {
        BTreeMap::from([
            ("total", self.total),
            ("pending", self.pending),
            ("success", self.success),
            ("failed", self.failed),
            ("has_result", self.has_result),
            ("no_result", self.no_result),
        ])
    }
}

impl std::fmt::Display for RunStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "total={} success={} (has_result={}, no_result={}) failed={} pending={}",
            self.total, self.success, self.has_result, self.no_result, self.failed, self.pending
        )
    }
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Queue drained and retry rounds finished
    Completed,
    /// No valid credentials and nothing left to provision
    CredentialsExhausted,
    /// Cancelled by signal or caller
    Cancelled,
    /// Main loop stopped because a dispatch round made no progress
    Stalled,
    /// A store failure ended the run
    Aborted,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Completed => "completed",
            Self::CredentialsExhausted => "credentials exhausted",
            Self::Cancelled => "cancelled",
            Self::Stalled => "stalled",
            Self::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

/// Summary of a whole run, exported as JSON on shutdown
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: String,
    pub completed_at: String,
    pub duration_secs: f64,
    pub outcome: Option<RunOutcome>,
    pub dispatch_rounds: usize,
    pub retry_rounds: usize,
    pub pending_exported: usize,
    pub stats: RunStats,
}

impl RunSummary {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
            completed_at: String::new(),
            duration_secs: 0.0,
            outcome: None,
            dispatch_rounds: 0,
            retry_rounds: 0,
            pending_exported: 0,
            stats: RunStats::default(),
        }
    }

    /// Stamp the end time and final counts
    pub fn finalize(&mut self, stats: RunStats, duration_secs: f64) {
        self.completed_at = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
        self.duration_secs = duration_secs;
        self.stats = stats;
    }
}

impl Default for RunSummary {
    fn default() -> Self {
        Self::new()
    }
}

/// Export a run summary to a JSON file
pub fn export_run_summary(summary: &RunSummary, output_path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(summary).context("Failed to serialize run summary")?;

    if let Some(parent) = output_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
    }

    fs::write(output_path, json)
        .with_context(|| format!("Failed to write run summary to: {}", output_path.display()))?;

    Ok(())
}
