// result_sink.rs - Append-only result file for identifiers with usable data
//
// One pipe-delimited line per identifier: identifier|name|url|location|extra.
// Lines already present when the sink is opened are loaded into the dedup set,
// so resumed runs never append an identifier twice. Every append is flushed
// and fsynced before returning.

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::identifiers::normalize_identifier;
use crate::lookup::ProfileRecord;

struct SinkState {
    file: File,
    seen: HashSet<String>,
    appended: usize,
    /// existing file ends mid-line; terminate it before the first append
    needs_newline: bool,
}

pub struct ResultSink {
    path: PathBuf,
    state: Mutex<SinkState>,
}

impl ResultSink {
    /// Open (or create) the sink at `path`, preloading identifiers already written.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create parent directory: {}", parent.display()))?;
            }
        }

        let (seen, needs_newline) = if path.exists() {
            (Self::read_identifiers(path)?, Self::ends_mid_line(path)?)
        } else {
            (HashSet::new(), false)
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open result sink file: {}", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(SinkState {
                file,
                seen,
                appended: 0,
                needs_newline,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Returns `false` if the identifier was already written.
    pub fn append(&self, record: &ProfileRecord) -> Result<bool> {
        let key = normalize_identifier(&record.identifier);
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("result sink lock poisoned"))?;

        if state.seen.contains(&key) {
            return Ok(false);
        }

        let line = if state.needs_newline {
            format!("\n{}\n", record.to_line())
        } else {
            format!("{}\n", record.to_line())
        };
        state
            .file
            .write_all(line.as_bytes())
            .with_context(|| format!("Failed to append to {}", self.path.display()))?;
        state.file.flush()?;
        state
            .file
            .sync_data()
            .with_context(|| format!("Failed to sync {}", self.path.display()))?;

        state.needs_newline = false;
        state.seen.insert(key);
        state.appended += 1;
        Ok(true)
    }

    /// Records appended by this instance
    pub fn appended(&self) -> usize {
        self.state.lock().map(|s| s.appended).unwrap_or(0)
    }

    /// Distinct identifiers in the file, including those from earlier runs
    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.seen.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ends_mid_line(path: &Path) -> Result<bool> {
        let mut file = File::open(path)
            .with_context(|| format!("Failed to open result file: {}", path.display()))?;
        if file.metadata()?.len() == 0 {
            return Ok(false);
        }
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))?;
        file.read_exact(&mut last)?;
        Ok(last[0] != b'\n')
    }

    /// Identifier column of an existing sink file. Partial trailing lines from
    /// a crash are tolerated.
    pub fn read_identifiers(path: &Path) -> Result<HashSet<String>> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open result file: {}", path.display()))?;
        let reader = BufReader::new(file);

        let mut identifiers = HashSet::new();
        for line in reader.lines() {
            let line = match line {
                Ok(line) => line,
                Err(_) => break,
            };
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(identifier) = line.split('|').next() {
                let identifier = normalize_identifier(identifier);
                if !identifier.is_empty() {
                    identifiers.insert(identifier);
                }
            }
        }
        Ok(identifiers)
    }
}
