//! Rate-limited reader over a seekable byte source.
//!
//! The limiter is average-rate, not burst-bounded: each pass tracks a
//! start instant and a running byte count, and a read is allowed at most
//! `floor(rate * elapsed) - transferred` bytes before it has to sleep.

use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Abstraction over wall-clock time so tests can drive the limiter
/// without real sleeps.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, dur: Duration);
}

#[derive(Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, dur: Duration) {
        std::thread::sleep(dur);
    }
}

/// A cheap, lock-free snapshot of the limiter's current state, safe to
/// read from a different thread than the one doing the I/O.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimiterStatus {
    pub current_rate_bps: u64,
    pub bytes_this_pass: u64,
    pub progress: f64,
    pub part_remaining: Option<Duration>,
    pub total_remaining: Option<Duration>,
}

struct PassState {
    start: Instant,
    transferred: u64,
    bypassed: bool,
}

/// Wraps a `Read + Seek` source and throttles reads to a mutable
/// bytes-per-second ceiling. `rate = 0` means unlimited.
pub struct RateLimitedReader<R, T = SystemTimeSource> {
    source: R,
    time: Arc<T>,
    rate: Arc<AtomicU64>,
    bypass_first_pass: bool,
    passes_completed: AtomicU64,
    transfer_size: AtomicU64,
    prior_offset: AtomicU64,
    total_size: AtomicU64,
    ever_read: AtomicBool,
    pass: Mutex<PassState>,
}

impl<R: Read + Seek> RateLimitedReader<R, SystemTimeSource> {
    pub fn new(source: R, rate: u64, bypass_first_pass: bool) -> Self {
        Self::with_time_source(source, rate, bypass_first_pass, Arc::new(SystemTimeSource))
    }
}

impl<R: Read + Seek, T: TimeSource> RateLimitedReader<R, T> {
    pub fn with_time_source(source: R, rate: u64, bypass_first_pass: bool, time: Arc<T>) -> Self {
        let now = time.now();
        Self {
            source,
            time,
            rate: Arc::new(AtomicU64::new(rate)),
            bypass_first_pass,
            passes_completed: AtomicU64::new(0),
            transfer_size: AtomicU64::new(0),
            prior_offset: AtomicU64::new(0),
            total_size: AtomicU64::new(0),
            ever_read: AtomicBool::new(false),
            pass: Mutex::new(PassState {
                start: now,
                transferred: 0,
                bypassed: bypass_first_pass,
            }),
        }
    }

    pub fn set_transfer_size(&self, n: u64) {
        self.transfer_size.store(n, Ordering::Relaxed);
    }

    pub fn set_total(&self, offset: u64, total: u64) {
        self.prior_offset.store(offset, Ordering::Relaxed);
        self.total_size.store(total, Ordering::Relaxed);
    }

    /// Hot-swap the rate. Effective from the next read. Negative inputs
    /// aren't representable at this type (`u64`); callers clamp before
    /// calling in.
    pub fn set_limit(&self, rate: u64) {
        self.rate.store(rate, Ordering::Relaxed);
    }

    /// A cloned handle onto the live rate, so a caller that has to move
    /// the reader into a `Box<dyn Read>` (as the upload-part body) can
    /// still retarget its rate afterwards.
    pub fn rate_handle(&self) -> Arc<AtomicU64> {
        self.rate.clone()
    }

    /// Number of full passes (open-to-EOF-or-seek-to-start) completed so
    /// far. Bypass is an optimization, not a correctness property, so
    /// callers can detect a transport reading the body more than once
    /// before the throttled pass.
    pub fn passes_completed(&self) -> u64 {
        self.passes_completed.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> LimiterStatus {
        let pass = self.pass.lock();
        let elapsed = self.time.now().duration_since(pass.start);
        let current_rate_bps = if elapsed.as_secs_f64() > 0.0 {
            (pass.transferred as f64 / elapsed.as_secs_f64()) as u64
        } else {
            0
        };

        let transfer_size = self.transfer_size.load(Ordering::Relaxed);
        let progress = if transfer_size > 0 {
            (pass.transferred as f64 / transfer_size as f64).min(1.0)
        } else {
            0.0
        };

        let rate = self.rate.load(Ordering::Relaxed);
        let part_remaining = if rate > 0 && transfer_size > pass.transferred {
            Some(Duration::from_secs_f64(
                (transfer_size - pass.transferred) as f64 / rate as f64,
            ))
        } else {
            None
        };

        let total_size = self.total_size.load(Ordering::Relaxed);
        let prior_offset = self.prior_offset.load(Ordering::Relaxed);
        let done_so_far = prior_offset + pass.transferred;
        let total_remaining = if rate > 0 && total_size > done_so_far {
            Some(Duration::from_secs_f64(
                (total_size - done_so_far) as f64 / rate as f64,
            ))
        } else {
            None
        };

        LimiterStatus {
            current_rate_bps,
            bytes_this_pass: pass.transferred,
            progress,
            part_remaining,
            total_remaining,
        }
    }

    fn throttle(&self, want: usize) {
        let rate = self.rate.load(Ordering::Relaxed);
        if rate == 0 {
            return;
        }
        let mut pass = self.pass.lock();
        if pass.bypassed {
            return;
        }
        loop {
            let elapsed = self.time.now().duration_since(pass.start);
            let permitted = (rate as f64 * elapsed.as_secs_f64()).floor() as u64;
            if permitted >= pass.transferred + want as u64 {
                return;
            }
            let bytes_needed = (pass.transferred + want as u64).saturating_sub(permitted);
            let wait = Duration::from_secs_f64(bytes_needed as f64 / rate as f64).max(Duration::from_millis(1));
            drop(pass);
            self.time.sleep(wait);
            pass = self.pass.lock();
        }
    }

    fn reset_pass(&self, bypass: bool) {
        let mut pass = self.pass.lock();
        if pass.transferred > 0 {
            self.passes_completed.fetch_add(1, Ordering::Relaxed);
        }
        pass.start = self.time.now();
        pass.transferred = 0;
        pass.bypassed = bypass;
    }
}

impl<R: Read + Seek, T: TimeSource> Read for RateLimitedReader<R, T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if !self.ever_read.swap(true, Ordering::Relaxed) {
            let mut pass = self.pass.lock();
            pass.start = self.time.now();
        }
        self.throttle(buf.len());
        let n = self.source.read(buf)?;
        if n > 0 {
            let mut pass = self.pass.lock();
            pass.transferred += n as u64;
        }
        Ok(n)
    }
}

impl<R: Read + Seek, T: TimeSource> Seek for RateLimitedReader<R, T> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let result = self.source.seek(pos)?;
        let at_start = matches!(pos, SeekFrom::Start(0));
        self.reset_pass(self.bypass_first_pass && at_start);
        Ok(result)
    }
}
