use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

use crate::handoff::temp_path_for;
use crate::identifiers::{parse_accounts, RawAccount};

/// Raw-account file feeding the provisioning collaborator.
///
/// Accounts are removed from the file once they have been exchanged for a
/// credential. Accounts that were handed out but failed stay in the file for
/// the next run but are not handed out again by this instance.
#[derive(Debug)]
pub struct AccountFile {
    path: PathBuf,
    handed_out: Mutex<HashSet<String>>,
}

impl AccountFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            handed_out: Mutex::new(HashSet::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> io::Result<Vec<RawAccount>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(parse_accounts(&content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Hand out up to `count` accounts not handed out before
    pub async fn take(&self, count: usize) -> io::Result<Vec<RawAccount>> {
        let mut handed_out = self.handed_out.lock().await;
        let batch: Vec<RawAccount> = self
            .read_all()?
            .into_iter()
            .filter(|account| !handed_out.contains(&account.identifier))
            .take(count)
            .collect();
        for account in &batch {
            handed_out.insert(account.identifier.clone());
        }
        Ok(batch)
    }

    /// Accounts still available to [`AccountFile::take`]
    pub async fn remaining(&self) -> io::Result<usize> {
        let handed_out = self.handed_out.lock().await;
        Ok(self
            .read_all()?
            .iter()
            .filter(|account| !handed_out.contains(&account.identifier))
            .count())
    }

    /// Remove an account that was successfully exchanged
    pub async fn consume(&self, account: &RawAccount) -> io::Result<()> {
        // serialize rewrites with take()
        let _guard = self.handed_out.lock().await;

        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        let kept: Vec<&str> = content
            .lines()
            .filter(|line| {
                RawAccount::parse(line)
                    .map(|parsed| parsed.identifier != account.identifier)
                    .unwrap_or(true)
            })
            .collect();

        let temp_path = temp_path_for(&self.path);
        {
            let mut file = File::create(&temp_path)?;
            for line in kept {
                writeln!(file, "{}", line)?;
            }
            file.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;

        debug!("Consumed account {}", account.identifier);
        Ok(())
    }
}
