//! Anti-replay nonces.

use std::time::Duration;

/// Slots in each session's nonce table.
pub const NONCE_TABLE_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum NonceState {
    #[default]
    Invalid,
    Valid,
    /// Matched during the current operation; dropped on the next flush.
    Flushed,
}

#[derive(Debug, Clone, Copy, Default)]
struct NonceSlot {
    state: NonceState,
    nonce: u32,
    age: u32,
}

/// A session's outstanding nonces.
///
/// When full, adding a nonce evicts the oldest entry.
#[derive(Debug, Clone, Default)]
pub struct NonceTable {
    slots: [NonceSlot; NONCE_TABLE_SIZE],
}

impl NonceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, nonce: u32) {
        for slot in self.slots.iter_mut().filter(|s| s.state == NonceState::Valid) {
            slot.age = slot.age.saturating_add(1);
        }

        let index = match self
            .slots
            .iter()
            .position(|s| s.state == NonceState::Invalid)
        {
            Some(index) => index,
            None => self
                .slots
                .iter()
                .enumerate()
                .max_by_key(|(_, s)| s.age)
                .map(|(i, _)| i)
                .unwrap_or(0),
        };

        self.slots[index] = NonceSlot {
            state: NonceState::Valid,
            nonce,
            age: 0,
        };
    }

    /// Check a nonce without consuming it. A matching entry is retired on the
    /// next [`flush`](Self::flush), so every key in one load may reference it.
    pub fn check(&mut self, nonce: u32) -> bool {
        for slot in self.slots.iter_mut() {
            if slot.state != NonceState::Invalid && slot.nonce == nonce {
                slot.state = NonceState::Flushed;
                return true;
            }
        }
        false
    }

    /// Whether `nonce` is outstanding in this table.
    #[must_use]
    pub fn contains(&self, nonce: u32) -> bool {
        self.slots
            .iter()
            .any(|s| s.state != NonceState::Invalid && s.nonce == nonce)
    }

    /// Retire every nonce matched since the last flush.
    pub fn flush(&mut self) {
        for slot in self.slots.iter_mut() {
            if slot.state == NonceState::Flushed {
                slot.state = NonceState::Invalid;
            }
        }
    }
}

/// Engine-wide nonce rate limiter over one-second windows.
#[derive(Debug, Clone)]
pub struct NonceLimiter {
    ceiling: u32,
    window_start: Option<Duration>,
    count: u32,
}

impl NonceLimiter {
    const WINDOW: Duration = Duration::from_secs(1);

    pub fn new(ceiling: u32) -> Self {
        Self {
            ceiling,
            window_start: None,
            count: 0,
        }
    }

    /// Record one issuance at monotonic time `now`. Returns false when the
    /// current window is already at the ceiling.
    pub fn try_acquire(&mut self, now: Duration) -> bool {
        match self.window_start {
            Some(start) if now.saturating_sub(start) < Self::WINDOW => {
                self.count += 1;
                if self.count > self.ceiling {
                    return false;
                }
            }
            _ => {
                self.window_start = Some(now);
                self.count = 1;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checked_nonce_survives_until_flush() {
        let mut table = NonceTable::new();
        table.add(42);

        assert!(table.check(42));
        assert!(table.check(42));
        table.flush();
        assert!(!table.check(42));
        assert!(!table.contains(42));
    }

    #[test]
    fn full_table_evicts_oldest() {
        let mut table = NonceTable::new();
        for nonce in 1..=NONCE_TABLE_SIZE as u32 {
            table.add(nonce);
        }
        table.add(100);

        assert!(!table.contains(1));
        assert!(table.contains(2));
        assert!(table.contains(100));
    }

    #[test]
    fn limiter_caps_each_window() {
        let mut limiter = NonceLimiter::new(20);
        let start = Duration::from_secs(10);
        let granted = (0..25)
            .filter(|i| limiter.try_acquire(start + Duration::from_millis(*i)))
            .count();
        assert_eq!(granted, 20);

        assert!(limiter.try_acquire(start + Duration::from_millis(1200)));
    }
}
