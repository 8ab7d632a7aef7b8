//! S3 multipart interface (C5): a thin, object-safe trait over
//! the handful of operations the coordinator needs, a real
//! `aws-sdk-s3`-backed implementation, and an in-memory mock for tests.

use std::collections::HashMap;
use std::io::Read;

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;

use crate::state::{PartChecksums, PartRecord};

#[derive(Debug, Error)]
pub enum S3ClientError {
    #[error("bucket not found: {0}")]
    NoSuchBucket(String),

    #[error("object already exists: {0}")]
    AlreadyExists(String),

    #[error("no such upload: {0}")]
    NoSuchUpload(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Creation-time parameters accepted by `CreateMultipartUpload`, mirroring
/// `UploadConfig`'s pass-through attributes.
#[derive(Debug, Clone, Default)]
pub struct CreateParams {
    pub content_type: Option<String>,
    pub storage_class: Option<String>,
    pub server_side_encryption: Option<String>,
    pub sse_kms_key_id: Option<String>,
    pub tags: Option<String>,
    pub metadata: HashMap<String, String>,
    pub checksum_algorithm: Option<String>,
    pub object_lock_legal_hold: Option<bool>,
    pub object_lock_retain_until: Option<DateTime<Utc>>,
    pub request_payer: Option<String>,
    pub expected_bucket_owner: Option<String>,
}

/// One row of a `ListMultipartUploads` page.
#[derive(Debug, Clone)]
pub struct MultipartUploadSummary {
    pub key: String,
    pub upload_id: String,
    pub initiated: DateTime<Utc>,
    pub storage_class: Option<String>,
}

/// Response echoed verbatim (as JSON) to stdout on success.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CompleteResponse {
    pub location: Option<String>,
    pub bucket: String,
    pub key: String,
    pub etag: Option<String>,
    pub checksum_sha256: Option<String>,
}

/// Object-safe contract over the multipart operations the coordinator
/// needs. Shaped after the proxy's `StorageBackend`: `Send + Sync`,
/// `async_trait`, with a blanket `impl` for `Box<dyn S3MultipartClient>`.
#[async_trait]
pub trait S3MultipartClient: Send + Sync {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<bool, S3ClientError>;

    async fn get_bucket_location(&self, bucket: &str) -> Result<String, S3ClientError>;

    async fn list_multipart_uploads(
        &self,
        bucket: &str,
    ) -> Result<Vec<MultipartUploadSummary>, S3ClientError>;

    async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<PartRecord>, S3ClientError>;

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        params: &CreateParams,
    ) -> Result<String, S3ClientError>;

    /// `body` is read to completion and uploaded as part `part_number`.
    /// Takes ownership of a boxed reader since the trait must stay
    /// object-safe (no generic methods).
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Box<dyn Read + Send>,
        content_length: u64,
    ) -> Result<PartRecord, S3ClientError>;

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[PartRecord],
    ) -> Result<CompleteResponse, S3ClientError>;

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), S3ClientError>;
}

macro_rules! impl_s3_multipart_client_for_box {
    () => {
        #[async_trait]
        impl S3MultipartClient for Box<dyn S3MultipartClient> {
            async fn head_object(&self, bucket: &str, key: &str) -> Result<bool, S3ClientError> {
                (**self).head_object(bucket, key).await
            }
            async fn get_bucket_location(&self, bucket: &str) -> Result<String, S3ClientError> {
                (**self).get_bucket_location(bucket).await
            }
            async fn list_multipart_uploads(
                &self,
                bucket: &str,
            ) -> Result<Vec<MultipartUploadSummary>, S3ClientError> {
                (**self).list_multipart_uploads(bucket).await
            }
            async fn list_parts(
                &self,
                bucket: &str,
                key: &str,
                upload_id: &str,
            ) -> Result<Vec<PartRecord>, S3ClientError> {
                (**self).list_parts(bucket, key, upload_id).await
            }
            async fn create_multipart_upload(
                &self,
                bucket: &str,
                key: &str,
                params: &CreateParams,
            ) -> Result<String, S3ClientError> {
                (**self).create_multipart_upload(bucket, key, params).await
            }
            async fn upload_part(
                &self,
                bucket: &str,
                key: &str,
                upload_id: &str,
                part_number: u32,
                body: Box<dyn Read + Send>,
                content_length: u64,
            ) -> Result<PartRecord, S3ClientError> {
                (**self)
                    .upload_part(bucket, key, upload_id, part_number, body, content_length)
                    .await
            }
            async fn complete_multipart_upload(
                &self,
                bucket: &str,
                key: &str,
                upload_id: &str,
                parts: &[PartRecord],
            ) -> Result<CompleteResponse, S3ClientError> {
                (**self)
                    .complete_multipart_upload(bucket, key, upload_id, parts)
                    .await
            }
            async fn abort_multipart_upload(
                &self,
                bucket: &str,
                key: &str,
                upload_id: &str,
            ) -> Result<(), S3ClientError> {
                (**self).abort_multipart_upload(bucket, key, upload_id).await
            }
        }
    };
}

impl_s3_multipart_client_for_box!();

/// `aws-sdk-s3`-backed implementation, following the proxy's
/// `storage/s3.rs` config-loading and error-mapping conventions.
pub struct AwsS3Client {
    client: aws_sdk_s3::Client,
}

impl AwsS3Client {
    pub async fn from_env() -> Self {
        let shared_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let client = aws_sdk_s3::Client::new(&shared_config);
        Self { client }
    }

    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }
}

fn map_checksums(
    crc32: Option<String>,
    crc32c: Option<String>,
    sha1: Option<String>,
    sha256: Option<String>,
) -> PartChecksums {
    PartChecksums {
        crc32,
        crc32c,
        sha1,
        sha256,
    }
}

#[async_trait]
impl S3MultipartClient for AwsS3Client {
    #[tracing::instrument(skip(self))]
    async fn head_object(&self, bucket: &str, key: &str) -> Result<bool, S3ClientError> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(err) => {
                if let Some(service_err) = err.as_service_error() {
                    if service_err.is_not_found() {
                        return Ok(false);
                    }
                }
                Err(S3ClientError::Transport(err.to_string()))
            }
        }
    }

    #[tracing::instrument(skip(self))]
    async fn get_bucket_location(&self, bucket: &str) -> Result<String, S3ClientError> {
        let resp = self
            .client
            .get_bucket_location()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| S3ClientError::Transport(e.to_string()))?;
        Ok(resp
            .location_constraint()
            .map(|c| c.as_str().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "us-east-1".to_string()))
    }

    #[tracing::instrument(skip(self))]
    async fn list_multipart_uploads(
        &self,
        bucket: &str,
    ) -> Result<Vec<MultipartUploadSummary>, S3ClientError> {
        let mut uploads = Vec::new();
        let mut key_marker = None;
        let mut upload_id_marker = None;
        loop {
            let mut req = self.client.list_multipart_uploads().bucket(bucket);
            if let Some(km) = &key_marker {
                req = req.key_marker(km);
            }
            if let Some(um) = &upload_id_marker {
                req = req.upload_id_marker(um);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| S3ClientError::Transport(e.to_string()))?;

            for item in resp.uploads() {
                uploads.push(MultipartUploadSummary {
                    key: item.key().unwrap_or_default().to_string(),
                    upload_id: item.upload_id().unwrap_or_default().to_string(),
                    initiated: item
                        .initiated()
                        .and_then(|dt| DateTime::from_timestamp(dt.secs(), 0))
                        .unwrap_or_else(Utc::now),
                    storage_class: item.storage_class().map(|sc| sc.as_str().to_string()),
                });
            }

            if resp.is_truncated().unwrap_or(false) {
                key_marker = resp.next_key_marker().map(str::to_string);
                upload_id_marker = resp.next_upload_id_marker().map(str::to_string);
            } else {
                break;
            }
        }
        Ok(uploads)
    }

    #[tracing::instrument(skip(self))]
    async fn list_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<PartRecord>, S3ClientError> {
        let mut parts = Vec::new();
        let mut part_number_marker = None;
        loop {
            let mut req = self
                .client
                .list_parts()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id);
            if let Some(marker) = &part_number_marker {
                req = req.part_number_marker(marker);
            }
            let resp = req
                .send()
                .await
                .map_err(|e| S3ClientError::Transport(e.to_string()))?;

            for part in resp.parts() {
                parts.push(PartRecord {
                    part_number: part.part_number().unwrap_or_default() as u32,
                    etag: part.e_tag().unwrap_or_default().trim_matches('"').to_string(),
                    checksums: map_checksums(
                        part.checksum_crc32().map(str::to_string),
                        part.checksum_crc32_c().map(str::to_string),
                        part.checksum_sha1().map(str::to_string),
                        part.checksum_sha256().map(str::to_string),
                    ),
                    size: part.size().unwrap_or_default() as u64,
                });
            }

            if resp.is_truncated().unwrap_or(false) {
                part_number_marker = resp.next_part_number_marker().map(str::to_string);
            } else {
                break;
            }
        }
        Ok(parts)
    }

    #[tracing::instrument(skip(self, params))]
    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        params: &CreateParams,
    ) -> Result<String, S3ClientError> {
        let mut req = self.client.create_multipart_upload().bucket(bucket).key(key);
        if let Some(ct) = &params.content_type {
            req = req.content_type(ct);
        }
        if let Some(sc) = &params.storage_class {
            req = req.storage_class(sc.as_str().into());
        }
        if let Some(sse) = &params.server_side_encryption {
            req = req.server_side_encryption(sse.as_str().into());
        }
        if let Some(kms) = &params.sse_kms_key_id {
            req = req.ssekms_key_id(kms);
        }
        if let Some(tags) = &params.tags {
            req = req.tagging(tags);
        }
        for (k, v) in &params.metadata {
            req = req.metadata(k, v);
        }
        if let Some(payer) = &params.request_payer {
            req = req.request_payer(payer.as_str().into());
        }
        if let Some(owner) = &params.expected_bucket_owner {
            req = req.expected_bucket_owner(owner);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| S3ClientError::Transport(e.to_string()))?;
        resp.upload_id()
            .map(str::to_string)
            .ok_or_else(|| S3ClientError::Transport("CreateMultipartUpload returned no upload id".into()))
    }

    #[tracing::instrument(skip(self, body))]
    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: u32,
        mut body: Box<dyn Read + Send>,
        content_length: u64,
    ) -> Result<PartRecord, S3ClientError> {
        let mut buf = Vec::with_capacity(content_length as usize);
        body.read_to_end(&mut buf)
            .map_err(|e| S3ClientError::Transport(e.to_string()))?;

        let resp = self
            .client
            .upload_part()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number as i32)
            .body(ByteStream::from(buf))
            .send()
            .await
            .map_err(|e| S3ClientError::Transport(e.to_string()))?;

        Ok(PartRecord {
            part_number,
            etag: resp.e_tag().unwrap_or_default().trim_matches('"').to_string(),
            checksums: map_checksums(
                resp.checksum_crc32().map(str::to_string),
                resp.checksum_crc32_c().map(str::to_string),
                resp.checksum_sha1().map(str::to_string),
                resp.checksum_sha256().map(str::to_string),
            ),
            size: content_length,
        })
    }

    #[tracing::instrument(skip(self, parts))]
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[PartRecord],
    ) -> Result<CompleteResponse, S3ClientError> {
        let completed_parts: Vec<_> = parts
            .iter()
            .map(|p| {
                aws_sdk_s3::types::CompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();

        let resp = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                aws_sdk_s3::types::CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| S3ClientError::Transport(e.to_string()))?;

        Ok(CompleteResponse {
            location: resp.location().map(str::to_string),
            bucket: bucket.to_string(),
            key: key.to_string(),
            etag: resp.e_tag().map(str::to_string),
            checksum_sha256: resp.checksum_sha256().map(str::to_string),
        })
    }

    #[tracing::instrument(skip(self))]
    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), S3ClientError> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| S3ClientError::Transport(e.to_string()))?;
        Ok(())
    }
}

/// In-memory mock used by the scenario and property test suites,
/// following the proxy's `MultipartStore` style.
pub struct MockS3Client {
    inner: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    objects: std::collections::HashSet<(String, String)>,
    uploads: HashMap<String, MockUpload>,
    next_upload_id: u64,
    upload_part_hook: Option<Box<dyn Fn(u32, u32) -> Result<(), S3ClientError> + Send + Sync>>,
    upload_part_calls: HashMap<u32, u32>,
}

struct MockUpload {
    bucket: String,
    key: String,
    storage_class: Option<String>,
    initiated: DateTime<Utc>,
    parts: HashMap<u32, PartRecord>,
}

impl Default for MockS3Client {
    fn default() -> Self {
        Self::new()
    }
}

impl MockS3Client {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockState::default()),
        }
    }

    pub fn with_existing_object(self, bucket: &str, key: &str) -> Self {
        self.inner
            .lock()
            .objects
            .insert((bucket.to_string(), key.to_string()));
        self
    }

    /// Seed an in-progress upload (used by resume-scenario tests).
    pub fn seed_upload(&self, bucket: &str, key: &str, upload_id: &str, parts: Vec<PartRecord>) {
        let mut state = self.inner.lock();
        let mut part_map = HashMap::new();
        for part in parts {
            part_map.insert(part.part_number, part);
        }
        state.uploads.insert(
            upload_id.to_string(),
            MockUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                storage_class: None,
                initiated: Utc::now(),
                parts: part_map,
            },
        );
    }

    /// Install a hook invoked on every `upload_part` call before it
    /// succeeds, keyed by part number and call count for that part
    /// (1-based). Used to script transient failures in tests.
    pub fn fail_n_times(self, part_number: u32, failures: u32) -> Self {
        self.inner.lock().upload_part_hook = Some(Box::new(move |pn, call_no| {
            if pn == part_number && call_no <= failures {
                Err(S3ClientError::Transport("simulated transient failure".into()))
            } else {
                Ok(())
            }
        }));
        self
    }

    pub fn upload_part_call_count(&self, part_number: u32) -> u32 {
        *self
            .inner
            .lock()
            .upload_part_calls
            .get(&part_number)
            .unwrap_or(&0)
    }
}

#[async_trait]
impl S3MultipartClient for MockS3Client {
    async fn head_object(&self, bucket: &str, key: &str) -> Result<bool, S3ClientError> {
        Ok(self
            .inner
            .lock()
            .objects
            .contains(&(bucket.to_string(), key.to_string())))
    }

    async fn get_bucket_location(&self, _bucket: &str) -> Result<String, S3ClientError> {
        Ok("us-east-1".to_string())
    }

    async fn list_multipart_uploads(
        &self,
        bucket: &str,
    ) -> Result<Vec<MultipartUploadSummary>, S3ClientError> {
        Ok(self
            .inner
            .lock()
            .uploads
            .iter()
            .filter(|(_, u)| u.bucket == bucket)
            .map(|(id, u)| MultipartUploadSummary {
                key: u.key.clone(),
                upload_id: id.clone(),
                initiated: u.initiated,
                storage_class: u.storage_class.clone(),
            })
            .collect())
    }

    async fn list_parts(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<Vec<PartRecord>, S3ClientError> {
        let state = self.inner.lock();
        let upload = state
            .uploads
            .get(upload_id)
            .ok_or_else(|| S3ClientError::NoSuchUpload(upload_id.to_string()))?;
        let mut parts: Vec<_> = upload.parts.values().cloned().collect();
        parts.sort_by_key(|p| p.part_number);
        Ok(parts)
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        params: &CreateParams,
    ) -> Result<String, S3ClientError> {
        let mut state = self.inner.lock();
        if state.objects.contains(&(bucket.to_string(), key.to_string())) {
            return Err(S3ClientError::AlreadyExists(key.to_string()));
        }
        state.next_upload_id += 1;
        let upload_id = format!("mock-upload-{}", state.next_upload_id);
        state.uploads.insert(
            upload_id.clone(),
            MockUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                storage_class: params.storage_class.clone(),
                initiated: Utc::now(),
                parts: HashMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
        part_number: u32,
        mut body: Box<dyn Read + Send>,
        content_length: u64,
    ) -> Result<PartRecord, S3ClientError> {
        let mut buf = Vec::new();
        body.read_to_end(&mut buf)
            .map_err(|e| S3ClientError::Transport(e.to_string()))?;

        let hook_result = {
            let mut state = self.inner.lock();
            let call_no = state.upload_part_calls.entry(part_number).or_insert(0);
            *call_no += 1;
            let call_no = *call_no;
            state
                .upload_part_hook
                .as_ref()
                .map(|hook| hook(part_number, call_no))
        };
        if let Some(Err(e)) = hook_result {
            return Err(e);
        }

        let mut hasher = sha2::Sha256::new();
        use sha2::Digest;
        hasher.update(&buf);
        let digest = hex::encode(hasher.finalize());

        let mut state = self.inner.lock();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| S3ClientError::NoSuchUpload(upload_id.to_string()))?;
        let record = PartRecord {
            part_number,
            etag: format!("{:x}", md5_stub(&buf)),
            checksums: PartChecksums {
                sha256: Some(digest),
                ..Default::default()
            },
            size: content_length,
        };
        upload.parts.insert(part_number, record.clone());
        Ok(record)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        parts: &[PartRecord],
    ) -> Result<CompleteResponse, S3ClientError> {
        let mut state = self.inner.lock();
        let upload = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| S3ClientError::NoSuchUpload(upload_id.to_string()))?;
        state.objects.insert((bucket.to_string(), key.to_string()));
        let etag = parts.last().map(|p| p.etag.clone());
        Ok(CompleteResponse {
            location: Some(format!("https://{bucket}.s3.amazonaws.com/{key}")),
            bucket: upload.bucket,
            key: upload.key,
            etag,
            checksum_sha256: None,
        })
    }

    async fn abort_multipart_upload(
        &self,
        _bucket: &str,
        _key: &str,
        upload_id: &str,
    ) -> Result<(), S3ClientError> {
        self.inner.lock().uploads.remove(upload_id);
        Ok(())
    }
}

/// Cheap deterministic stand-in for an ETag in the mock — not a real
/// MD5, just stable per content so tests can assert equality.
fn md5_stub(data: &[u8]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    data.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn head_object_reflects_seeded_existence() {
        let client = MockS3Client::new().with_existing_object("bucket", "key.bin");
        assert!(client.head_object("bucket", "key.bin").await.unwrap());
        assert!(!client.head_object("bucket", "other.bin").await.unwrap());
    }

    #[tokio::test]
    async fn create_multipart_upload_rejects_existing_object() {
        let client = MockS3Client::new().with_existing_object("bucket", "key.bin");
        let err = client
            .create_multipart_upload("bucket", "key.bin", &CreateParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, S3ClientError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn upload_part_then_complete_round_trips() {
        let client = MockS3Client::new();
        let upload_id = client
            .create_multipart_upload("bucket", "key.bin", &CreateParams::default())
            .await
            .unwrap();
        let record = client
            .upload_part(
                "bucket",
                "key.bin",
                &upload_id,
                1,
                Box::new(std::io::Cursor::new(vec![0u8; 10])),
                10,
            )
            .await
            .unwrap();
        assert_eq!(record.part_number, 1);

        let resp = client
            .complete_multipart_upload("bucket", "key.bin", &upload_id, &[record])
            .await
            .unwrap();
        assert_eq!(resp.bucket, "bucket");
        assert!(client.head_object("bucket", "key.bin").await.unwrap());
    }

    #[tokio::test]
    async fn fail_n_times_retries_then_succeeds() {
        let client = MockS3Client::new().fail_n_times(1, 2);
        let upload_id = client
            .create_multipart_upload("bucket", "key.bin", &CreateParams::default())
            .await
            .unwrap();

        for _ in 0..2 {
            let err = client
                .upload_part(
                    "bucket",
                    "key.bin",
                    &upload_id,
                    1,
                    Box::new(std::io::Cursor::new(vec![0u8; 10])),
                    10,
                )
                .await
                .unwrap_err();
            assert!(matches!(err, S3ClientError::Transport(_)));
        }
        let ok = client
            .upload_part(
                "bucket",
                "key.bin",
                &upload_id,
                1,
                Box::new(std::io::Cursor::new(vec![0u8; 10])),
                10,
            )
            .await;
        assert!(ok.is_ok());
        assert_eq!(client.upload_part_call_count(1), 3);
    }
}
