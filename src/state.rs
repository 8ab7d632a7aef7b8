//! Data model for in-flight and resumed multipart uploads.

use serde::{Deserialize, Serialize};

/// Bytes `[offset, offset+length)` of the local file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileRegion {
    pub offset: u64,
    pub length: u64,
}

impl FileRegion {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Optional per-algorithm checksums the store may return for a part.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartChecksums {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crc32: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crc32c: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// A single completed part, as confirmed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRecord {
    pub part_number: u32,
    pub etag: String,
    #[serde(default)]
    pub checksums: PartChecksums,
    pub size: u64,
}

/// The multipart upload's accumulated state. Mutates only by
/// append-on-success of new `PartRecord`s (see the coordinator's part
/// loop), never by removal or reordering.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UploadState {
    pub upload_id: String,
    pub parts: Vec<PartRecord>,
    pub offset: u64,
}

impl UploadState {
    pub fn new(upload_id: impl Into<String>) -> Self {
        Self {
            upload_id: upload_id.into(),
            parts: Vec::new(),
            offset: 0,
        }
    }

    /// Reconstruct from a server-side `ListParts` page, validating the
    /// contiguity and uniform-size invariants the coordinator requires.
    /// Returns the number of bytes in the non-final parts as well, so
    /// callers can detect a part-1-size mismatch without a second scan.
    pub fn from_parts(upload_id: impl Into<String>, mut parts: Vec<PartRecord>) -> Self {
        parts.sort_by_key(|p| p.part_number);
        let offset = parts.iter().map(|p| p.size).sum();
        Self {
            upload_id: upload_id.into(),
            parts,
            offset,
        }
    }

    pub fn next_part_number(&self) -> u32 {
        self.parts.len() as u32 + 1
    }

    pub fn push(&mut self, record: PartRecord) {
        debug_assert_eq!(record.part_number, self.next_part_number());
        self.offset += record.size;
        self.parts.push(record);
    }

    /// Validate part-number contiguity: `{1..N}` with no gaps.
    pub fn check_contiguous(&self) -> Result<(), String> {
        for (idx, part) in self.parts.iter().enumerate() {
            let expected = idx as u32 + 1;
            if part.part_number != expected {
                return Err(format!(
                    "parts are not contiguous (part {} is missing)",
                    expected
                ));
            }
        }
        Ok(())
    }

    /// Validate that every non-final part shares part 1's size. Returns
    /// `Err` listing the first offending part number, for a warning or a
    /// fatal error depending on caller context.
    pub fn check_uniform_size(&self) -> Result<(), String> {
        if self.parts.len() < 2 {
            return Ok(());
        }
        let unit = self.parts[0].size;
        for part in &self.parts[..self.parts.len() - 1] {
            if part.size != unit {
                return Err(format!(
                    "part {} has size {} (expected {})",
                    part.part_number, part.size, unit
                ));
            }
        }
        Ok(())
    }

    /// Any non-final part smaller than 5 MiB will make the eventual
    /// `CompleteMultipartUpload` fail server-side.
    pub fn warn_undersized_parts(&self) -> Vec<u32> {
        const MIN_PART: u64 = 5 * 1024 * 1024;
        if self.parts.len() < 2 {
            return Vec::new();
        }
        self.parts[..self.parts.len() - 1]
            .iter()
            .filter(|p| p.size < MIN_PART)
            .map(|p| p.part_number)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(n: u32, size: u64) -> PartRecord {
        PartRecord {
            part_number: n,
            etag: format!("etag-{n}"),
            checksums: PartChecksums::default(),
            size,
        }
    }

    #[test]
    fn next_part_number_starts_at_one() {
        let state = UploadState::new("upload-1");
        assert_eq!(state.next_part_number(), 1);
    }

    #[test]
    fn push_advances_offset_and_next_part_number() {
        let mut state = UploadState::new("upload-1");
        state.push(record(1, 8 * 1024 * 1024));
        assert_eq!(state.offset, 8 * 1024 * 1024);
        assert_eq!(state.next_part_number(), 2);
    }

    #[test]
    fn contiguity_detects_gap() {
        let state = UploadState::from_parts("u", vec![record(1, 10), record(3, 10)]);
        let err = state.check_contiguous().unwrap_err();
        assert!(err.contains("part 2 is missing"), "{err}");
    }

    #[test]
    fn uniform_size_ignores_final_part() {
        let state = UploadState::from_parts("u", vec![record(1, 100), record(2, 40)]);
        assert!(state.check_uniform_size().is_ok());
    }

    #[test]
    fn uniform_size_flags_mismatched_non_final_part() {
        let state = UploadState::from_parts("u", vec![record(1, 100), record(2, 50), record(3, 1)]);
        assert!(state.check_uniform_size().is_err());
    }

    #[test]
    fn warn_undersized_parts_skips_the_last_one() {
        let state = UploadState::from_parts(
            "u",
            vec![record(1, 1024), record(2, 1024), record(3, 1)],
        );
        assert_eq!(state.warn_undersized_parts(), vec![1, 2]);
    }
}
