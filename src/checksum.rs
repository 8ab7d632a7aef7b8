//! The `SHA256SUMS` sidecar convention.
//!
//! This is deliberately a small, single-purpose module: read/append-only
//! lookups against one well-known file, not a general checksum framework.
//! It owns no part of the upload state machine — the coordinator calls in
//! to look up an entry, and separately to append one.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

pub const SHA256SUMS_FILENAME: &str = "SHA256SUMS";

#[derive(Debug, Error)]
pub enum ChecksumError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed SHA256SUMS line {line_no}: {line}")]
    Malformed { line_no: usize, line: String },
}

/// One parsed line of a `SHA256SUMS` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumEntry {
    pub sha256_hex: String,
    pub binary_mode: bool,
    pub path: String,
}

/// Parse the full contents of a `SHA256SUMS` file.
///
/// Format: `<64 hex chars><SP><SP|SP*><path>`. The second separator is
/// `"  "` (two spaces, text mode) or `" *"` (space-star, binary mode);
/// anything else is a parse error.
pub fn parse(contents: &str) -> Result<Vec<ChecksumEntry>, ChecksumError> {
    let mut entries = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry = parse_line(line).ok_or_else(|| ChecksumError::Malformed {
            line_no: idx + 1,
            line: line.to_string(),
        })?;
        entries.push(entry);
    }
    Ok(entries)
}

fn parse_line(line: &str) -> Option<ChecksumEntry> {
    if line.len() < 66 {
        return None;
    }
    let (hex, rest) = line.split_at(64);
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    let mut chars = rest.chars();
    let sep0 = chars.next()?;
    let sep1 = chars.next()?;
    if sep0 != ' ' {
        return None;
    }
    let binary_mode = match sep1 {
        ' ' => false,
        '*' => true,
        _ => return None,
    };
    let path = chars.as_str().to_string();
    if path.is_empty() {
        return None;
    }
    Some(ChecksumEntry {
        sha256_hex: hex.to_string(),
        binary_mode,
        path,
    })
}

fn format_line(entry: &ChecksumEntry) -> String {
    let sep = if entry.binary_mode { " *" } else { "  " };
    format!("{}{}{}", entry.sha256_hex, sep, entry.path)
}

/// Look up the entry for `target_path` in the `SHA256SUMS` file found in
/// `dir`, if any. Paths are compared by absolute-path equality.
pub fn lookup(dir: &Path, target_path: &Path) -> Result<Option<ChecksumEntry>, ChecksumError> {
    let sums_path = dir.join(SHA256SUMS_FILENAME);
    if !sums_path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&sums_path).map_err(|e| ChecksumError::Io {
        path: sums_path.clone(),
        source: e,
    })?;
    let entries = parse(&contents)?;
    let target_abs = target_path
        .canonicalize()
        .unwrap_or_else(|_| target_path.to_path_buf());
    for entry in entries {
        let entry_path = Path::new(&entry.path);
        let entry_abs = entry_path
            .canonicalize()
            .unwrap_or_else(|_| entry_path.to_path_buf());
        if entry_abs == target_abs {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

/// Compute the SHA-256 digest of a file and append a binary-mode entry
/// for it to the `SHA256SUMS` file in `dir`. Returns the hex digest.
pub fn compute_and_append(dir: &Path, target_path: &Path) -> Result<String, ChecksumError> {
    let digest = compute_sha256(target_path)?;
    let path_str = target_path
        .canonicalize()
        .unwrap_or_else(|_| target_path.to_path_buf())
        .to_string_lossy()
        .to_string();
    let entry = ChecksumEntry {
        sha256_hex: digest.clone(),
        binary_mode: true,
        path: path_str,
    };

    let sums_path = dir.join(SHA256SUMS_FILENAME);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&sums_path)
        .map_err(|e| ChecksumError::Io {
            path: sums_path.clone(),
            source: e,
        })?;
    writeln!(file, "{}", format_line(&entry)).map_err(|e| ChecksumError::Io {
        path: sums_path,
        source: e,
    })?;
    Ok(digest)
}

fn compute_sha256(path: &Path) -> Result<String, ChecksumError> {
    let file = File::open(path).map_err(|e| ChecksumError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).map_err(|e| ChecksumError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Convenience used by tests/tools needing to read a `SHA256SUMS` file
/// line-by-line without loading the whole thing.
pub fn read_lines(path: &Path) -> Result<Vec<String>, ChecksumError> {
    let file = File::open(path).map_err(|e| ChecksumError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    BufReader::new(file)
        .lines()
        .map(|l| {
            l.map_err(|e| ChecksumError::Io {
                path: path.to_path_buf(),
                source: e,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn parses_text_mode_line() {
        let hex = "a".repeat(64);
        let line = format!("{hex}  path/to/file.bin");
        let entries = parse(&line).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].binary_mode);
        assert_eq!(entries[0].path, "path/to/file.bin");
    }

    #[test]
    fn parses_binary_mode_line() {
        let hex = "b".repeat(64);
        let line = format!("{hex} *path/to/file.bin");
        let entries = parse(&line).unwrap();
        assert!(entries[0].binary_mode);
    }

    #[test]
    fn rejects_bad_separator() {
        let hex = "c".repeat(64);
        let line = format!("{hex}--path");
        assert!(parse(&line).is_err());
    }

    #[test]
    fn rejects_non_hex_digest() {
        let bad = "z".repeat(64);
        let line = format!("{bad}  path");
        assert!(parse(&line).is_err());
    }

    #[test]
    fn skips_blank_lines() {
        let hex = "d".repeat(64);
        let contents = format!("\n{hex}  file.bin\n\n");
        let entries = parse(&contents).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn lookup_finds_entry_by_absolute_path() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("payload.bin");
        std::fs::write(&target, b"hello world").unwrap();

        let digest = compute_and_append(tmp.path(), &target).unwrap();
        assert_eq!(digest.len(), 64);

        let found = lookup(tmp.path(), &target).unwrap();
        assert_eq!(found.unwrap().sha256_hex, digest);
    }

    #[test]
    fn lookup_returns_none_when_file_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("nope.bin");
        assert!(lookup(tmp.path(), &target).unwrap().is_none());
    }

    #[test]
    fn compute_and_append_is_idempotent_across_calls() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("payload.bin");
        let mut f = std::fs::File::create(&target).unwrap();
        f.write_all(b"content").unwrap();

        let d1 = compute_and_append(tmp.path(), &target).unwrap();
        let d2 = compute_and_append(tmp.path(), &target).unwrap();
        assert_eq!(d1, d2);

        let lines = read_lines(&tmp.path().join(SHA256SUMS_FILENAME)).unwrap();
        assert_eq!(lines.len(), 2);
    }
}
