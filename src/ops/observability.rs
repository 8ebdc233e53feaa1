use crate::spi::message::{ConsumerId, MessageId};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Messages-per-second sampler over the interval since the previous poll.
///
/// Each sample swaps in the current ack count and timestamp, so consecutive
/// polls measure disjoint windows. Rates round up to two decimals so a
/// trickle of messages never reports as zero.
pub struct RateMeter {
    check_time_millis: AtomicU64,
    consumed_snapshot: AtomicU64,
}

impl RateMeter {
    pub fn new(now_millis: u64) -> Self {
        Self {
            check_time_millis: AtomicU64::new(now_millis),
            consumed_snapshot: AtomicU64::new(0),
        }
    }

    pub fn sample(&self, acks: u64, now_millis: u64) -> f32 {
        let previous = self.check_time_millis.swap(now_millis, Ordering::Relaxed);
        let slice = now_millis.saturating_sub(previous) as f32 / 1000.0;
        if slice == 0.0 {
            self.consumed_snapshot.swap(acks, Ordering::Relaxed);
            return 0.0;
        }
        let consumed = acks.saturating_sub(self.consumed_snapshot.swap(acks, Ordering::Relaxed));
        ((consumed as f32 / slice) * 100.0).ceil() / 100.0
    }
}

/// Point-in-time view of a consumer for the management plane.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerStats {
    pub id: ConsumerId,
    pub queue: String,
    pub acks: u64,
    pub rate: f32,
    pub created_at_millis: u64,
    pub delivering: Vec<MessageId>,
}
