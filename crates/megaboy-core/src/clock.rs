use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Wall-clock capability used by the MBC3 RTC.
///
/// The RTC advances from emulated cycles while running and from wall time
/// across battery save/load boundaries. Abstracting the wall clock lets tests
/// inject a deterministic time source.
pub trait Clock: Send {
    /// Whole seconds elapsed since the Unix epoch.
    fn unix_seconds(&self) -> u64;
}

/// Default clock backed by [`SystemTime`].
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn unix_seconds(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    seconds: AtomicU64,
}

impl ManualClock {
    pub fn new(seconds: u64) -> Self {
        Self {
            seconds: AtomicU64::new(seconds),
        }
    }

    pub fn set(&self, seconds: u64) {
        self.seconds.store(seconds, Ordering::Relaxed);
    }

    pub fn advance(&self, seconds: u64) {
        self.seconds.fetch_add(seconds, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn unix_seconds(&self) -> u64 {
        self.seconds.load(Ordering::Relaxed)
    }
}

impl Clock for std::sync::Arc<ManualClock> {
    fn unix_seconds(&self) -> u64 {
        self.as_ref().unix_seconds()
    }
}
