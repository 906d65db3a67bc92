//! Time sources.
//!
//! Session timers use a monotonic clock. Usage reports use "offline" time: the
//! wall clock corrected so that it never runs backwards, even if the user sets
//! the system clock back between reboots.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Source of time for an engine.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Time since an arbitrary fixed point. Never decreases.
    fn monotonic(&self) -> Duration;
    /// Seconds since the Unix epoch. May jump in either direction.
    fn wall_clock(&self) -> i64;
}

/// The host clocks.
#[derive(Debug)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic(&self) -> Duration {
        self.start.elapsed()
    }

    fn wall_clock(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    monotonic_ms: Arc<AtomicI64>,
    wall: Arc<AtomicI64>,
}

impl ManualClock {
    /// Create a clock with the given wall time and zero monotonic time.
    pub fn new(wall: i64) -> Self {
        let clock = Self::default();
        clock.wall.store(wall, Ordering::SeqCst);
        clock
    }

    /// Advance both clocks.
    pub fn advance(&self, by: Duration) {
        self.monotonic_ms
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
        self.wall.fetch_add(by.as_secs() as i64, Ordering::SeqCst);
    }

    /// Set the wall clock only, e.g. to simulate a rollback.
    pub fn set_wall_clock(&self, wall: i64) {
        self.wall.store(wall, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn monotonic(&self) -> Duration {
        Duration::from_millis(self.monotonic_ms.load(Ordering::SeqCst).max(0) as u64)
    }

    fn wall_clock(&self) -> i64 {
        self.wall.load(Ordering::SeqCst)
    }
}

/// Rollback-corrected wall time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OfflineTime {
    previous_time: i64,
    rollback_offset: i64,
}

impl OfflineTime {
    /// Serialized size: two big-endian i64 values.
    pub const ENCODED_LEN: usize = 16;

    /// Current offline time, advancing the stored state.
    pub fn now(&mut self, clock: &dyn Clock) -> i64 {
        let mut now = clock.wall_clock() + self.rollback_offset;
        if self.previous_time > now {
            warn!(
                "Wall clock rolled back by {}s, compensating",
                self.previous_time - now
            );
            self.rollback_offset += self.previous_time - now;
            now = self.previous_time;
        }
        self.previous_time = now;
        now
    }

    #[must_use]
    pub fn rollback_offset(&self) -> i64 {
        self.rollback_offset
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..8].copy_from_slice(&self.previous_time.to_be_bytes());
        out[8..].copy_from_slice(&self.rollback_offset.to_be_bytes());
        out
    }

    #[must_use]
    pub fn from_bytes(bytes: &[u8; Self::ENCODED_LEN]) -> Self {
        let mut previous = [0u8; 8];
        let mut offset = [0u8; 8];
        previous.copy_from_slice(&bytes[..8]);
        offset.copy_from_slice(&bytes[8..]);
        Self {
            previous_time: i64::from_be_bytes(previous),
            rollback_offset: i64::from_be_bytes(offset),
        }
    }
}
