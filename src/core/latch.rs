use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Reusable counting latch.
///
/// Counts up as deliveries are scheduled and down as they complete; waiters
/// block until the count returns to zero or a deadline passes. Cloning shares
/// the underlying count.
#[derive(Clone, Default)]
pub struct CountLatch {
    inner: Arc<LatchInner>,
}

#[derive(Default)]
struct LatchInner {
    count: Mutex<u64>,
    zero: Condvar,
}

impl CountLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_up(&self) {
        *self.inner.count.lock() += 1;
    }

    pub fn count_down(&self) {
        let mut count = self.inner.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.inner.zero.notify_all();
        }
    }

    pub fn count(&self) -> u64 {
        *self.inner.count.lock()
    }

    /// Wait until the count reaches zero. Returns false on deadline expiry.
    pub fn wait_zero(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.inner.count.lock();
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if self
                .inner
                .zero
                .wait_for(&mut count, deadline - now)
                .timed_out()
                && *count > 0
            {
                return false;
            }
        }
        true
    }
}
