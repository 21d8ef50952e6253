// handoff.rs - Pending-identifier hand-off file
//
// On every shutdown the still-pending identifiers are written to a flat file
// that the next run can import directly. The file is replaced atomically
// (write temp, fsync, rename) so an interrupt during export never leaves a
// truncated hand-off behind.

use chrono::Utc;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::identifiers::parse_identifiers;

/// Sibling temp file for an atomic rewrite of `path`: the full file name plus `.tmp`
pub(crate) fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "enrichq".into());
    name.push(".tmp");
    path.with_file_name(name)
}

/// Overwrite `path` with a header comment block followed by one identifier per line.
pub fn write_handoff(path: &Path, identifiers: &[String]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let temp_path = temp_path_for(path);
    {
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "# enrichq hand-off: identifiers still pending")?;
        writeln!(writer, "# generated: {}", Utc::now().format("%Y-%m-%d %H:%M:%S UTC"))?;
        writeln!(writer, "# count: {}", identifiers.len())?;
        for identifier in identifiers {
            writeln!(writer, "{}", identifier)?;
        }
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
    }

    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Read a hand-off file back. Header lines are comments and are skipped.
pub fn read_handoff(path: &Path) -> io::Result<Vec<String>> {
    let content = fs::read_to_string(path)?;
    Ok(parse_identifiers(&content).identifiers)
}
