use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::Credential;
use crate::handoff::temp_path_for;
use crate::identifiers::parse_credential_lines;

/// Flat-file credential cache, one token per line.
///
/// Writes are unions with what is already on disk; a merge never drops a
/// token another run added.
#[derive(Debug, Clone)]
pub struct CredentialCache {
    path: PathBuf,
}

impl CredentialCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Cached credentials; a missing file is an empty cache
    pub fn load(&self) -> io::Result<Vec<Credential>> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(parse_credential_lines(&content)
                .into_iter()
                .map(Credential::new)
                .collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Union `fresh` into the cache file. Returns how many tokens were new.
    pub fn merge(&self, fresh: &[Credential]) -> io::Result<usize> {
        let mut merged = self.load()?;
        let mut seen: HashSet<Credential> = merged.iter().cloned().collect();
        let before = merged.len();
        for credential in fresh {
            if !credential.is_empty() && seen.insert(credential.clone()) {
                merged.push(credential.clone());
            }
        }
        let added = merged.len() - before;
        if added == 0 {
            return Ok(0);
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp_path = temp_path_for(&self.path);
        {
            let mut file = File::create(&temp_path)?;
            for credential in &merged {
                writeln!(file, "{}", credential.token())?;
            }
            file.sync_all()?;
        }
        fs::rename(&temp_path, &self.path)?;

        debug!("Merged {} new credentials into {}", added, self.path.display());
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_cache_is_empty() {
        let tmp = TempDir::new().unwrap();
        let cache = CredentialCache::new(tmp.path().join("tokens.txt"));
        assert!(cache.load().unwrap().is_empty());
    }

    #[test]
    fn test_merge_is_a_union() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tokens.txt");
        fs::write(&path, "Bearer aaa\n# note\nbbb\n").unwrap();
        let cache = CredentialCache::new(&path);

        let added = cache
            .merge(&[Credential::new("bbb"), Credential::new("ccc")])
            .unwrap();
        assert_eq!(added, 1);

        let tokens: Vec<String> = cache.load().unwrap().iter().map(|c| c.token().to_string()).collect();
        assert_eq!(tokens, vec!["aaa", "bbb", "ccc"]);
    }

    #[test]
    fn test_merge_nothing_new_leaves_file_alone() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tokens.txt");
        fs::write(&path, "# keep this comment\naaa\n").unwrap();
        let cache = CredentialCache::new(&path);

        assert_eq!(cache.merge(&[Credential::new("aaa")]).unwrap(), 0);
        assert!(fs::read_to_string(&path).unwrap().contains("keep this comment"));
    }

    #[test]
    fn test_merge_leaves_same_stem_sibling_alone() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tokens.txt");
        let sibling = tmp.path().join("tokens.tmp");
        fs::write(&sibling, "unrelated\n").unwrap();
        let cache = CredentialCache::new(&path);

        assert_eq!(cache.merge(&[Credential::new("aaa")]).unwrap(), 1);
        assert_eq!(fs::read_to_string(&sibling).unwrap(), "unrelated\n");
        assert!(!tmp.path().join("tokens.txt.tmp").exists());
    }
}
