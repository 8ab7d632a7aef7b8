//! `UploadConfig`: the immutable configuration the CLI builds
//! and hands to the coordinator. `serde`-derived with the same
//! explicit-default-function idiom the proxy's `Config`/`BackendConfig`
//! use, so it stays usable from JSON fixtures in tests even though the
//! CLI's primary construction path is flags, not a file.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("bucket must not be empty")]
    EmptyBucket,

    #[error("key must not be empty")]
    EmptyKey,

    #[error("local file does not exist or is not readable: {0}")]
    UnreadableFile(PathBuf),

    #[error("part size {0} is out of range [5 MiB, 5 GiB]")]
    PartSizeOutOfRange(u64),

    #[error("invalid S3 URI {0:?}, expected s3://<bucket>/<key>")]
    InvalidS3Uri(String),
}

pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

fn default_part_size() -> Option<u64> {
    None
}

fn default_rate() -> u64 {
    0
}

fn default_force() -> bool {
    false
}

fn default_compute_checksum() -> bool {
    false
}

fn default_metadata() -> HashMap<String, String> {
    HashMap::new()
}

fn default_dualstack() -> bool {
    false
}

fn default_path_style() -> bool {
    false
}

fn default_accelerate() -> bool {
    false
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub bucket: String,
    pub key: String,
    pub local_path: PathBuf,

    #[serde(default = "default_part_size")]
    pub part_size_override: Option<u64>,

    #[serde(default = "default_rate")]
    pub initial_rate: u64,

    #[serde(default)]
    pub schedule_path: Option<PathBuf>,

    #[serde(default = "default_force")]
    pub force: bool,

    #[serde(default = "default_compute_checksum")]
    pub compute_checksum: bool,

    #[serde(default)]
    pub content_type: Option<String>,

    #[serde(default)]
    pub storage_class: Option<String>,

    #[serde(default)]
    pub server_side_encryption: Option<String>,

    #[serde(default)]
    pub sse_kms_key_id: Option<String>,

    #[serde(default)]
    pub tags: Option<String>,

    #[serde(default = "default_metadata")]
    pub metadata: HashMap<String, String>,

    #[serde(default)]
    pub checksum_algorithm: Option<String>,

    #[serde(default)]
    pub legal_hold: Option<bool>,

    #[serde(default)]
    pub retain_until: Option<chrono::DateTime<chrono::Utc>>,

    #[serde(default)]
    pub request_payer: Option<String>,

    #[serde(default)]
    pub expected_bucket_owner: Option<String>,

    #[serde(default = "default_dualstack")]
    pub dualstack: bool,

    #[serde(default = "default_accelerate")]
    pub accelerate: bool,

    #[serde(default = "default_path_style")]
    pub path_style: bool,
}

impl UploadConfig {
    /// Parse `s3://<bucket>/<key>` into its parts.
    pub fn parse_s3_uri(uri: &str) -> Result<(String, String), ConfigError> {
        let rest = uri
            .strip_prefix("s3://")
            .ok_or_else(|| ConfigError::InvalidS3Uri(uri.to_string()))?;
        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| ConfigError::InvalidS3Uri(uri.to_string()))?;
        if bucket.is_empty() || key.is_empty() {
            return Err(ConfigError::InvalidS3Uri(uri.to_string()));
        }
        Ok((bucket.to_string(), key.to_string()))
    }

    /// Validate the basic field invariants. `part_size_override`, if
    /// present, must already be in range — defaulting/auto-selection
    /// happens later against the actual file size.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket.is_empty() {
            return Err(ConfigError::EmptyBucket);
        }
        if self.key.is_empty() {
            return Err(ConfigError::EmptyKey);
        }
        if !self.local_path.is_file() {
            return Err(ConfigError::UnreadableFile(self.local_path.clone()));
        }
        if let Some(size) = self.part_size_override {
            if !(MIN_PART_SIZE..=MAX_PART_SIZE).contains(&size) {
                return Err(ConfigError::PartSizeOutOfRange(size));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_s3_uri() {
        let (bucket, key) = UploadConfig::parse_s3_uri("s3://my-bucket/path/to/file.bin").unwrap();
        assert_eq!(bucket, "my-bucket");
        assert_eq!(key, "path/to/file.bin");
    }

    #[test]
    fn rejects_uri_missing_scheme() {
        assert!(UploadConfig::parse_s3_uri("my-bucket/key").is_err());
    }

    #[test]
    fn rejects_uri_without_key() {
        assert!(UploadConfig::parse_s3_uri("s3://my-bucket").is_err());
    }

    #[test]
    fn validate_rejects_missing_file() {
        let config = UploadConfig {
            bucket: "b".into(),
            key: "k".into(),
            local_path: PathBuf::from("/nonexistent/path/for/sure"),
            part_size_override: None,
            initial_rate: 0,
            schedule_path: None,
            force: false,
            compute_checksum: false,
            content_type: None,
            storage_class: None,
            server_side_encryption: None,
            sse_kms_key_id: None,
            tags: None,
            metadata: HashMap::new(),
            checksum_algorithm: None,
            legal_hold: None,
            retain_until: None,
            request_payer: None,
            expected_bucket_owner: None,
            dualstack: false,
            accelerate: false,
            path_style: false,
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnreadableFile(_))
        ));
    }

    #[test]
    fn validate_rejects_out_of_range_part_size() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let config = UploadConfig {
            bucket: "b".into(),
            key: "k".into(),
            local_path: tmp.path().to_path_buf(),
            part_size_override: Some(1024),
            initial_rate: 0,
            schedule_path: None,
            force: false,
            compute_checksum: false,
            content_type: None,
            storage_class: None,
            server_side_encryption: None,
            sse_kms_key_id: None,
            tags: None,
            metadata: HashMap::new(),
            checksum_algorithm: None,
            legal_hold: None,
            retain_until: None,
            request_payer: None,
            expected_bucket_owner: None,
            dualstack: false,
            accelerate: false,
            path_style: false,
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PartSizeOutOfRange(1024))
        ));
    }
}
