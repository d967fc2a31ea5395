//! Schedule-based frame throttle.
//!
//! Admission is decided from monotonic frame timestamps before any pixel work
//! happens. On admission the next slot is `timestamp + interval`, not
//! `now + interval`, so scheduling jitter does not accumulate.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct FrameThrottle {
    interval: Duration,
    next_admit: Option<Duration>,
}

impl FrameThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_admit: None,
        }
    }

    /// Throttle for a target frame rate. `0` disables throttling.
    pub fn from_fps(target_fps: u32) -> Self {
        Self::new(interval_for_fps(target_fps))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns true when a frame captured at `timestamp` should be processed.
    pub fn admit(&mut self, timestamp: Duration) -> bool {
        let next = *self.next_admit.get_or_insert(timestamp);
        if timestamp < next {
            return false;
        }
        self.next_admit = Some(timestamp.saturating_add(self.interval));
        true
    }

    pub fn reset(&mut self) {
        self.next_admit = None;
    }
}

/// Integer-millisecond interval, matching the 15 fps → 67 ms convention.
pub fn interval_for_fps(target_fps: u32) -> Duration {
    if target_fps == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis((1000 + target_fps as u64 / 2) / target_fps as u64)
}
