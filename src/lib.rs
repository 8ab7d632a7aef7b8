//! Resumable S3 multipart upload engine for slow or unreliable links.

pub mod checksum;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod input;
pub mod limiter;
pub mod s3;
pub mod schedule;
pub mod state;

pub use config::UploadConfig;
pub use error::{Severity, UploadError};
