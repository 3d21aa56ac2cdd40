//! Bounded history of raw signal-strength readings.
//!
//! Signal and location callbacks arrive on unrelated schedules. Each
//! location is joined with the reading that was current just before it, so
//! the readings are kept newest first and looked up by capture time.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use cellmap_types::SignalReading;

/// Default number of readings kept.
pub const DEFAULT_HISTORY_LEN: usize = 100;

/// One recorded reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalEntry {
    /// Capture time as unix milliseconds.
    pub captured_at_ms: i64,
    /// The raw reading.
    pub reading: SignalReading,
}

/// Newest-first bounded deque of [`SignalEntry`] values.
///
/// Safe to share between the telephony callback path and the join path.
#[derive(Debug)]
pub struct SignalHistory {
    entries: Mutex<VecDeque<SignalEntry>>,
    max_len: usize,
}

impl Default for SignalHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LEN)
    }
}

impl SignalHistory {
    /// Create an empty history holding at most `max_len` readings (at least one).
    pub fn new(max_len: usize) -> Self {
        let max_len = max_len.max(1);
        Self {
            entries: Mutex::new(VecDeque::with_capacity(max_len)),
            max_len,
        }
    }

    /// Record a reading at the front, evicting the oldest beyond the bound.
    pub fn record(&self, reading: SignalReading, captured_at_ms: i64) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.push_front(SignalEntry {
            captured_at_ms,
            reading,
        });
        entries.truncate(self.max_len);
    }

    /// Freshest reading captured strictly before `target_ms`.
    ///
    /// `None` when the history is empty or every reading is newer. Lookups
    /// never remove entries.
    pub fn find_most_recent_before(&self, target_ms: i64) -> Option<SignalReading> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .iter()
            .find(|entry| entry.captured_at_ms < target_ms)
            .map(|entry| entry.reading)
    }

    /// Most recently recorded entry.
    pub fn latest(&self) -> Option<SignalEntry> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.front().copied()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Forget all readings.
    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}
