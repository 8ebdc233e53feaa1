use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Outcome of granting credits to a bounded meter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditEvent {
    /// The balance was already positive, or the meter is unlimited.
    None,
    /// The balance crossed from non-positive to positive; delivery should be
    /// prompted.
    Resumed,
}

/// Byte budget advertised by the client.
///
/// Bounded mode throttles sends against a signed balance; unlimited mode
/// disables the meter. All mutations are lock-free: the dispatch hot path
/// reads the balance without taking the consumer lock. There is no
/// reservation step; packets debit their exact size after the send.
pub struct CreditMeter {
    unlimited: AtomicBool,
    balance: AtomicI64,
}

impl CreditMeter {
    pub fn bounded(initial: i64) -> Self {
        Self {
            unlimited: AtomicBool::new(false),
            balance: AtomicI64::new(initial),
        }
    }

    pub fn unlimited() -> Self {
        Self {
            unlimited: AtomicBool::new(true),
            balance: AtomicI64::new(0),
        }
    }

    /// Initial meter from a consumer creation request: `None` starts bounded
    /// at zero, `-1` disables flow control, anything else seeds the balance.
    pub fn from_initial(credits: Option<i64>) -> Self {
        match credits {
            None => Self::bounded(0),
            Some(-1) => Self::unlimited(),
            Some(initial) => Self::bounded(initial),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.unlimited.load(Ordering::Acquire)
    }

    /// True when a send may proceed. No bytes are held back; the actual
    /// packet size is debited after the send.
    pub fn try_reserve(&self) -> bool {
        self.is_unlimited() || self.balance.load(Ordering::Acquire) > 0
    }

    /// Debit a sent packet. Returns the remaining balance for bounded
    /// meters, `None` when unlimited.
    pub fn consume(&self, packet_size: u64) -> Option<i64> {
        if self.is_unlimited() {
            return None;
        }
        Some(
            self.balance
                .fetch_sub(packet_size as i64, Ordering::AcqRel)
                - packet_size as i64,
        )
    }

    /// Credit bytes granted by the client. Reports whether the balance
    /// crossed zero, which is the signal to prompt delivery.
    pub fn grant(&self, credits: u64) -> CreditEvent {
        if self.is_unlimited() {
            return CreditEvent::None;
        }
        let previous = self.balance.fetch_add(credits as i64, Ordering::AcqRel);
        if previous <= 0 && previous + credits as i64 > 0 {
            CreditEvent::Resumed
        } else {
            CreditEvent::None
        }
    }

    /// Switch to unlimited mode.
    pub fn disable(&self) {
        self.unlimited.store(true, Ordering::Release);
    }

    /// Zero the bounded balance; used to throttle slow consumers.
    pub fn reset(&self) {
        self.balance.store(0, Ordering::Release);
    }

    /// Current balance for bounded meters, `None` when unlimited.
    pub fn balance(&self) -> Option<i64> {
        if self.is_unlimited() {
            None
        } else {
            Some(self.balance.load(Ordering::Acquire))
        }
    }
}
