use std::sync::atomic::{AtomicU64, Ordering};

/// Millisecond timestamp source for telemetry.
///
/// Values are wall-clock milliseconds (they end up in the CSV export) but must
/// never run backwards, so the rolling window can evict by prefix.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Wall clock clamped to be non-decreasing
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        let wall = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let previous = self.last.fetch_max(wall, Ordering::SeqCst);
        previous.max(wall)
    }
}
