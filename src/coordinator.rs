//! Upload coordinator: the top-level state machine.
//! Owns `UploadState`, drives the rate limiter, input dispatcher, and
//! schedule, and calls the S3 interface.
//!
//! Task wiring uses a single `tokio::select!` across the in-flight part
//! upload, a one-second tick, the stdin event channel, and
//! `tokio::signal::ctrl_c()`. A first SIGINT finishes the current part
//! then exits; a second aborts immediately and abandons it.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::checksum;
use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::input::Key;
use crate::limiter::RateLimitedReader;
use crate::s3::{CreateParams, S3ClientError, S3MultipartClient};
use crate::schedule::Schedule;
use crate::state::{PartRecord, UploadState};

const DEFAULT_START_PART_SIZE: u64 = 8 * 1024 * 1024;
const MAX_PARTS: u64 = 10_000;
const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;
const RETRY_BACKOFF: Duration = Duration::from_secs(10);
const FAST_PAUSE_RATE: u64 = 1_000;

/// Mutable rate/limit knobs shared between the input, schedule, and
/// coordinator tasks: a guarded mutable slot for the active limiter+rate.
#[derive(Default)]
struct ControlState {
    rate: u64,
    initial_rate: u64,
    paused_after_current_part: bool,
    fast_paused: bool,
    rate_before_fast_pause: u64,
    interrupted: bool,
    exit_pending: bool,
    sigint_count: u32,
}

/// Selects the part size the whole upload will use: start at 8 MiB,
/// double until `10000 * partSize >= fileSize`, cap at 5 GiB.
pub fn select_part_size(file_size: u64, override_size: Option<u64>) -> u64 {
    if let Some(size) = override_size {
        return size;
    }
    let mut part_size = DEFAULT_START_PART_SIZE;
    while MAX_PARTS * part_size < file_size && part_size < MAX_PART_SIZE {
        part_size *= 2;
    }
    part_size.min(MAX_PART_SIZE)
}

fn part_size_warning(part_size: u64) -> Option<String> {
    if !(MIN_PART_SIZE..=MAX_PART_SIZE).contains(&part_size) {
        Some(format!(
            "selected part size {part_size} is outside the recommended [5 MiB, 5 GiB] range"
        ))
    } else {
        None
    }
}

/// Apply a key-to-action mapping to the live `rate`, mutating
/// `control` and returning the new rate to push into the rate limiter via
/// `set_limit`, or `None` if the key didn't change the rate (e.g. `i`, `?`).
fn apply_key(control: &mut ControlState, key: &Key) -> Option<u64> {
    match key {
        Key::Char('i') | Key::Char('?') => None,
        Key::Char('u') => {
            control.rate = 0;
            Some(0)
        }
        Key::Char('r') => {
            control.rate = control.initial_rate;
            Some(control.rate)
        }
        Key::Char('p') => {
            control.paused_after_current_part = !control.paused_after_current_part;
            None
        }
        Key::Char('a') => bump(control, 1_000),
        Key::Char('s') => bump(control, 10_000),
        Key::Char('d') => bump(control, 100_000),
        Key::Char('f') => bump(control, 250_000),
        Key::Char('z') => lower(control, 1_000),
        Key::Char('x') => lower(control, 10_000),
        Key::Char('c') => lower(control, 100_000),
        Key::Char('v') => lower(control, 250_000),
        Key::Char(c) if c.is_ascii_digit() => {
            let digit = c.to_digit(10).unwrap();
            control.rate = if digit == 0 { 1_000_000 } else { digit as u64 * 100_000 };
            Some(control.rate)
        }
        Key::Char(' ') => {
            if control.exit_pending {
                control.exit_pending = false;
                None
            } else if control.fast_paused {
                control.fast_paused = false;
                control.rate = control.rate_before_fast_pause;
                Some(control.rate)
            } else {
                control.fast_paused = true;
                control.rate_before_fast_pause = control.rate;
                control.rate = FAST_PAUSE_RATE;
                Some(FAST_PAUSE_RATE)
            }
        }
        _ => None,
    }
}

fn bump(control: &mut ControlState, delta: u64) -> Option<u64> {
    control.rate += delta;
    Some(control.rate)
}

fn lower(control: &mut ControlState, delta: u64) -> Option<u64> {
    control.rate = control.rate.saturating_sub(delta).max(1_000);
    Some(control.rate)
}

/// Apply one key received while the part loop is blocked on
/// `paused_after_current_part`. Space always clears the pause and
/// resumes; any other key still runs through the normal key-to-action
/// mapping (so rate changes take effect immediately), and `p` toggling
/// the flag back off resumes too. Returns whether the pause is now over.
fn handle_pause_key(control: &mut ControlState, key: &Key) -> bool {
    if matches!(key, Key::Char(' ')) {
        control.paused_after_current_part = false;
        return true;
    }
    apply_key(control, key);
    !control.paused_after_current_part
}

/// Drives the multipart upload end to end. Returns `Ok(())` on a
/// successful `CompleteMultipartUpload`; any `Err` should be printed by
/// the caller and mapped to exit code 1.
pub async fn run<C: S3MultipartClient>(
    config: UploadConfig,
    client: Arc<C>,
    mut keys: mpsc::Receiver<Key>,
) -> Result<(), UploadError> {
    config
        .validate()
        .map_err(|e| UploadError::pre_flight(e.to_string()))?;

    let file_size = std::fs::metadata(&config.local_path)
        .map_err(UploadError::Io)?
        .len();

    let part_size = select_part_size(file_size, config.part_size_override);
    if let Some(warning) = part_size_warning(part_size) {
        tracing::warn!("{warning}");
    }

    pre_flight_integrity(&config)?;

    if !config.force {
        let exists = client
            .head_object(&config.bucket, &config.key)
            .await
            .map_err(map_transport_to_preflight)?;
        if exists {
            return Err(UploadError::pre_flight(format!(
                "object s3://{}/{} already exists",
                config.bucket, config.key
            )));
        }
    }

    let mut state = resume_or_create(&config, client.as_ref()).await?;

    let schedule = load_schedule(&config)?;

    // A schedule active at startup must take effect before the first C1
    // reader is ever constructed, not just on the next 1Hz tick.
    let starting_rate = initial_control_rate(schedule.as_ref(), config.initial_rate, Local::now());

    let control = Arc::new(RwLock::new(ControlState {
        rate: starting_rate,
        initial_rate: config.initial_rate,
        ..Default::default()
    }));

    let mut file = File::open(&config.local_path).map_err(UploadError::Io)?;

    part_loop(&config, client.as_ref(), &mut state, &mut file, file_size, part_size, &control, &mut keys, schedule.as_ref())
        .await?;

    if state.offset != file_size {
        return Err(UploadError::fatal(format!(
            "upload ended with offset {} but file size is {file_size}",
            state.offset
        )));
    }

    let response = client
        .complete_multipart_upload(&config.bucket, &config.key, &state.upload_id, &state.parts)
        .await
        .map_err(|e| {
            UploadError::fatal(format!(
                "CompleteMultipartUpload failed (upload id {} left in place for resume): {e}",
                state.upload_id
            ))
        })?;

    let json = serde_json::to_string_pretty(&SortedJson(&response))
        .unwrap_or_else(|_| "{}".to_string());
    println!("{json}");

    Ok(())
}

/// Wraps `CompleteResponse` so its JSON keys come out sorted, per
/// indented JSON with sorted object keys.
struct SortedJson<'a>(&'a crate::s3::CompleteResponse);

impl<'a> serde::Serialize for SortedJson<'a> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let value = serde_json::to_value(self.0).map_err(serde::ser::Error::custom)?;
        value.serialize(serializer)
    }
}

fn map_transport_to_preflight(err: S3ClientError) -> UploadError {
    UploadError::pre_flight(err.to_string())
}

fn pre_flight_integrity(config: &UploadConfig) -> Result<(), UploadError> {
    let dir = config
        .local_path
        .parent()
        .unwrap_or_else(|| Path::new("."));
    let existing = checksum::lookup(dir, &config.local_path)?;
    match existing {
        Some(_) => Ok(()),
        None if config.compute_checksum => {
            checksum::compute_and_append(dir, &config.local_path)?;
            Ok(())
        }
        None => {
            tracing::warn!(
                "no SHA256SUMS entry for {} and --compute-checksum not set",
                config.local_path.display()
            );
            Ok(())
        }
    }
}

async fn resume_or_create<C: S3MultipartClient>(
    config: &UploadConfig,
    client: &C,
) -> Result<UploadState, UploadError> {
    let uploads = client
        .list_multipart_uploads(&config.bucket)
        .await
        .map_err(map_transport_to_preflight)?;
    let matching: Vec<_> = uploads.into_iter().filter(|u| u.key == config.key).collect();

    if matching.len() > 1 {
        return Err(UploadError::pre_flight(format!(
            "more than one in-progress multipart upload matches key {:?}",
            config.key
        )));
    }

    if let Some(found) = matching.into_iter().next() {
        if let Some(requested) = &config.storage_class {
            if found.storage_class.as_deref() != Some(requested.as_str()) {
                return Err(UploadError::inconsistency(format!(
                    "resumed upload storage class {:?} does not match requested {:?}",
                    found.storage_class, requested
                )));
            }
        }

        let parts = client
            .list_parts(&config.bucket, &config.key, &found.upload_id)
            .await
            .map_err(map_transport_to_preflight)?;
        let state = UploadState::from_parts(found.upload_id, parts);

        state
            .check_contiguous()
            .map_err(UploadError::inconsistency)?;
        if let Err(msg) = state.check_uniform_size() {
            tracing::warn!("{msg}");
        }
        for part_number in state.warn_undersized_parts() {
            tracing::warn!("part {part_number} is smaller than 5 MiB; completion may fail server-side");
        }

        Ok(state)
    } else {
        let params = create_params(config);
        let upload_id = client
            .create_multipart_upload(&config.bucket, &config.key, &params)
            .await
            .map_err(map_transport_to_preflight)?;
        Ok(UploadState::new(upload_id))
    }
}

fn create_params(config: &UploadConfig) -> CreateParams {
    CreateParams {
        content_type: config.content_type.clone(),
        storage_class: config.storage_class.clone(),
        server_side_encryption: config.server_side_encryption.clone(),
        sse_kms_key_id: config.sse_kms_key_id.clone(),
        tags: config.tags.clone(),
        metadata: config.metadata.clone(),
        checksum_algorithm: config.checksum_algorithm.clone(),
        object_lock_legal_hold: config.legal_hold,
        object_lock_retain_until: config.retain_until,
        request_payer: config.request_payer.clone(),
        expected_bucket_owner: config.expected_bucket_owner.clone(),
    }
}

fn load_schedule(config: &UploadConfig) -> Result<Option<Schedule>, UploadError> {
    match &config.schedule_path {
        None => Ok(None),
        Some(path) => {
            let contents = std::fs::read_to_string(path).map_err(UploadError::Io)?;
            let schedule = Schedule::parse(&contents)?;
            Ok(Some(schedule))
        }
    }
}

/// The rate the very first C1 reader should be constructed with: the
/// schedule's currently-active rate if a schedule is in effect, else the
/// configured initial rate. Consulted once at startup so a schedule block
/// active at launch doesn't wait for the first 1Hz tick to apply.
fn initial_control_rate(schedule: Option<&Schedule>, initial_rate: u64, now: chrono::DateTime<Local>) -> u64 {
    schedule.map(|s| s.active_rate(now)).unwrap_or(initial_rate)
}

#[allow(clippy::too_many_arguments)]
async fn part_loop<C: S3MultipartClient>(
    config: &UploadConfig,
    client: &C,
    state: &mut UploadState,
    file: &mut File,
    file_size: u64,
    part_size: u64,
    control: &Arc<RwLock<ControlState>>,
    keys: &mut mpsc::Receiver<Key>,
    schedule: Option<&Schedule>,
) -> Result<(), UploadError> {
    while state.offset < file_size {
        loop {
            let paused = control.read().paused_after_current_part;
            if !paused {
                break;
            }
            // A SIGINT arriving while paused has nothing in flight to
            // finish, so it unblocks the pause loop immediately rather
            // than waiting for a second interrupt.
            tokio::select! {
                key = keys.recv() => {
                    match key {
                        Some(key) => {
                            let mut ctl = control.write();
                            let resumed = handle_pause_key(&mut ctl, &key);
                            drop(ctl);
                            if resumed {
                                break;
                            }
                        }
                        None => return Ok(()),
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    control.write().interrupted = true;
                    return Ok(());
                }
            }
        }

        let region_len = part_size.min(file_size - state.offset);
        let offset = state.offset;
        let part_number = state.next_part_number();

        file.seek(SeekFrom::Start(offset)).map_err(UploadError::Io)?;
        let mut region_bytes = vec![0u8; region_len as usize];
        file.read_exact(&mut region_bytes).map_err(UploadError::Io)?;

        let record = upload_part_with_retry(
            config,
            client,
            state,
            part_number,
            region_bytes,
            region_len,
            file_size,
            control,
            keys,
            schedule,
        )
        .await?;

        match record {
            Some(record) => state.push(record),
            None => return Ok(()),
        }

        if control.read().interrupted {
            return Ok(());
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn upload_part_with_retry<C: S3MultipartClient>(
    config: &UploadConfig,
    client: &C,
    state: &UploadState,
    part_number: u32,
    region_bytes: Vec<u8>,
    region_len: u64,
    file_size: u64,
    control: &Arc<RwLock<ControlState>>,
    keys: &mut mpsc::Receiver<Key>,
    schedule: Option<&Schedule>,
) -> Result<Option<PartRecord>, UploadError> {
    loop {
        let rate = control.read().rate;
        let reader = RateLimitedReader::new(std::io::Cursor::new(region_bytes.clone()), rate, false);
        reader.set_transfer_size(region_len);
        reader.set_total(state.offset, file_size);
        let rate_handle = reader.rate_handle();

        let bucket = config.bucket.clone();
        let key = config.key.clone();
        let upload_id = state.upload_id.clone();
        let upload_fut = client.upload_part(
            &bucket,
            &key,
            &upload_id,
            part_number,
            Box::new(reader),
            region_len,
        );

        let mut upload_fut = upload_fut;
        let mut ticker = tokio::time::interval(Duration::from_secs(1));

        let result = loop {
            tokio::select! {
                result = &mut upload_fut => {
                    break result;
                }
                _ = ticker.tick() => {
                    if let Some(sched) = schedule {
                        let now = Local::now();
                        let active = sched.active_rate(now);
                        let mut ctl = control.write();
                        if ctl.rate != active && !ctl.fast_paused {
                            ctl.rate = active;
                            drop(ctl);
                            rate_handle.store(active, std::sync::atomic::Ordering::Relaxed);
                            tracing::info!("schedule transition: rate now {active} B/s");
                        }
                    }
                }
                key = keys.recv() => {
                    if let Some(key) = key {
                        let mut ctl = control.write();
                        let new_rate = apply_key(&mut ctl, &key);
                        drop(ctl);
                        if let Some(new_rate) = new_rate {
                            rate_handle.store(new_rate, std::sync::atomic::Ordering::Relaxed);
                        }
                        if matches!(key, Key::Char('i')) {
                            tracing::info!("status requested");
                        }
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    let mut ctl = control.write();
                    ctl.sigint_count += 1;
                    if ctl.sigint_count >= 2 {
                        drop(ctl);
                        tracing::warn!("second interrupt received, abandoning part {part_number} immediately");
                        return Ok(None);
                    }
                    ctl.interrupted = true;
                    drop(ctl);
                    tracing::warn!("interrupt received, finishing part {part_number} then exiting");
                }
            }
        };

        match result {
            Ok(record) => return Ok(Some(record)),
            Err(err) => {
                tracing::error!("part {part_number} upload failed: {err}");
                tokio::select! {
                    _ = tokio::time::sleep(RETRY_BACKOFF) => {}
                    _ = tokio::signal::ctrl_c() => {
                        let mut ctl = control.write();
                        ctl.sigint_count += 1;
                        if ctl.sigint_count >= 2 {
                            drop(ctl);
                            tracing::warn!("second interrupt received while waiting to retry part {part_number}, aborting");
                            return Ok(None);
                        }
                        ctl.interrupted = true;
                        drop(ctl);
                        tracing::warn!("interrupt received while waiting to retry part {part_number}; will finish this part once it succeeds");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_part_size_doubles_until_under_10000_parts() {
        assert_eq!(select_part_size(1024, None), DEFAULT_START_PART_SIZE);
        let huge = 200_000_000_000u64;
        let size = select_part_size(huge, None);
        assert!(MAX_PARTS * size >= huge || size == MAX_PART_SIZE);
    }

    #[test]
    fn select_part_size_respects_override() {
        assert_eq!(select_part_size(1_000_000, Some(123)), 123);
    }

    #[test]
    fn initial_control_rate_uses_active_schedule_block_not_config_default() {
        use chrono::TimeZone;
        let schedule = Schedule::parse("default: 0\nmon 0800-0900: 100k\n").unwrap();
        let monday_0830 = Local.with_ymd_and_hms(2026, 7, 27, 8, 30, 0).single().unwrap();
        assert_eq!(initial_control_rate(Some(&schedule), 0, monday_0830), 100_000);

        let monday_0930 = Local.with_ymd_and_hms(2026, 7, 27, 9, 30, 0).single().unwrap();
        assert_eq!(initial_control_rate(Some(&schedule), 0, monday_0930), 0);
    }

    #[test]
    fn initial_control_rate_falls_back_to_configured_rate_without_schedule() {
        use chrono::TimeZone;
        let now = Local.with_ymd_and_hms(2026, 7, 27, 8, 30, 0).single().unwrap();
        assert_eq!(initial_control_rate(None, 42_000, now), 42_000);
    }

    #[test]
    fn apply_key_unlimited_zeroes_rate() {
        let mut control = ControlState {
            rate: 5000,
            ..Default::default()
        };
        let new_rate = apply_key(&mut control, &Key::Char('u'));
        assert_eq!(new_rate, Some(0));
    }

    #[test]
    fn apply_key_r_resets_to_initial_rate() {
        let mut control = ControlState {
            rate: 5000,
            initial_rate: 42_000,
            ..Default::default()
        };
        let new_rate = apply_key(&mut control, &Key::Char('r'));
        assert_eq!(new_rate, Some(42_000));
        assert_eq!(control.rate, 42_000);
    }

    #[test]
    fn apply_key_lower_floors_at_1000() {
        let mut control = ControlState {
            rate: 500,
            ..Default::default()
        };
        let new_rate = apply_key(&mut control, &Key::Char('z'));
        assert_eq!(new_rate, Some(1_000));
    }

    #[test]
    fn apply_key_digit_zero_is_one_megabyte() {
        let mut control = ControlState::default();
        let new_rate = apply_key(&mut control, &Key::Char('0'));
        assert_eq!(new_rate, Some(1_000_000));
    }

    #[test]
    fn apply_key_space_toggles_fast_pause_and_restores() {
        let mut control = ControlState {
            rate: 50_000,
            ..Default::default()
        };
        let lowered = apply_key(&mut control, &Key::Char(' '));
        assert_eq!(lowered, Some(FAST_PAUSE_RATE));
        let restored = apply_key(&mut control, &Key::Char(' '));
        assert_eq!(restored, Some(50_000));
    }

    #[test]
    fn handle_pause_key_space_clears_pause_and_resumes() {
        let mut control = ControlState {
            paused_after_current_part: true,
            ..Default::default()
        };
        assert!(handle_pause_key(&mut control, &Key::Char(' ')));
        assert!(!control.paused_after_current_part);
    }

    #[test]
    fn handle_pause_key_p_toggles_pause_off_and_resumes() {
        let mut control = ControlState {
            paused_after_current_part: true,
            ..Default::default()
        };
        assert!(handle_pause_key(&mut control, &Key::Char('p')));
        assert!(!control.paused_after_current_part);
    }

    #[test]
    fn handle_pause_key_other_key_applies_and_stays_paused() {
        let mut control = ControlState {
            paused_after_current_part: true,
            rate: 1_000,
            ..Default::default()
        };
        let resumed = handle_pause_key(&mut control, &Key::Char('a'));
        assert!(!resumed);
        assert!(control.paused_after_current_part);
        assert_eq!(control.rate, 2_000);
    }
}
