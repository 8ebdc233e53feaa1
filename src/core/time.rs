use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Clock abstraction to enforce deterministic time sourcing in core paths.
///
/// Monotonic instants drive interval math; wall millis stamp creation times,
/// cancellation timestamps, and rate samples.
pub trait Clock: Clone + Send + Sync + 'static {
    fn now(&self) -> Instant;
    fn wall_millis(&self) -> u64;
}

/// System-backed clock; replaceable in tests or deterministic replay.
#[derive(Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually advanced clock for tests and simulation.
#[derive(Clone)]
pub struct ManualClock {
    base: Instant,
    wall_base_millis: u64,
    offset_millis: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(wall_base_millis: u64) -> Self {
        Self {
            base: Instant::now(),
            wall_base_millis,
            offset_millis: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Move the clock forward by the given amount.
    pub fn advance(&self, delta: Duration) {
        self.offset_millis
            .fetch_add(delta.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn advance_millis(&self, millis: u64) {
        self.offset_millis.fetch_add(millis, Ordering::Relaxed);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_millis.load(Ordering::Relaxed))
    }

    fn wall_millis(&self) -> u64 {
        self.wall_base_millis + self.offset_millis.load(Ordering::Relaxed)
    }
}
