use crate::codec::Grams;
use std::collections::VecDeque;
use std::time::Duration;

/// One point of the live mass trace
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RollingReading {
    pub mass: Grams,
    pub timestamp: u64,
    pub shot_in_progress: bool,
}

pub trait ReadingSliceExt {
    fn min_max_time(&self) -> Option<(u64, u64)>;
    fn min_max_mass(&self) -> Option<(Grams, Grams)>;
}

impl ReadingSliceExt for &[RollingReading] {
    fn min_max_time(&self) -> Option<(u64, u64)> {
        self.iter().fold(None, |acc, r| match acc {
            None => Some((r.timestamp, r.timestamp)),
            Some((min, max)) => Some((min.min(r.timestamp), max.max(r.timestamp))),
        })
    }

    fn min_max_mass(&self) -> Option<(Grams, Grams)> {
        self.iter().fold(None, |acc, r| match acc {
            None => Some((r.mass, r.mass)),
            Some((min, max)) => Some((
                Grams(min.0.min(r.mass.0)),
                Grams(max.0.max(r.mass.0)),
            )),
        })
    }
}

/// Time-bounded trace of recent readings.
///
/// Readings arrive in non-decreasing timestamp order, so eviction only ever
/// pops from the front.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    data: VecDeque<RollingReading>,
    span_ms: u64,
}

impl RollingWindow {
    pub fn new(span: Duration) -> Self {
        Self {
            data: VecDeque::new(),
            span_ms: span.as_millis() as u64,
        }
    }

    pub fn push(&mut self, reading: RollingReading) {
        let cutoff = reading.timestamp.saturating_sub(self.span_ms);
        self.data.push_back(reading);
        self.evict_before(cutoff);
    }

    /// Drop readings strictly older than `cutoff`
    fn evict_before(&mut self, cutoff: u64) {
        while self.data.front().is_some_and(|r| r.timestamp < cutoff) {
            self.data.pop_front();
        }
    }

    pub fn to_vec(&self) -> Vec<RollingReading> {
        self.data.iter().copied().collect()
    }
}
