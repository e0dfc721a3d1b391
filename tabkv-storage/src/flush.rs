//! Write buffer and flush-timer state owned by one cached storage.

use tabkv_core::{StorageValue, Timestamp};

use crate::timer::TimerHandle;

/// Buffered writes in the order their keys were first buffered.
///
/// Overwriting a buffered key keeps its position.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct WriteBuffer {
    entries: Vec<(String, StorageValue)>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: StorageValue) {
        match self.entries.iter_mut().find(|(k, _)| k == key) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&StorageValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: &str) -> Option<StorageValue> {
        let index = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(index).1)
    }

    /// Put an entry back at the front unless the key was buffered again
    /// since it was taken.
    pub fn push_front_if_absent(&mut self, key: String, value: StorageValue) {
        if !self.contains(&key) {
            self.entries.insert(0, (key, value));
        }
    }

    /// Take the oldest entry.
    pub fn pop_front(&mut self) -> Option<(String, StorageValue)> {
        if self.entries.is_empty() {
            return None;
        }
        Some(self.entries.remove(0))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Flush timer state: at most one timer is armed at a time.
///
/// Each arming carries an epoch so a callback can tell whether the timer
/// that fired is still the armed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushTimer {
    #[default]
    Idle,
    Armed {
        handle: TimerHandle,
        armed_at: Timestamp,
        epoch: u64,
    },
}

impl FlushTimer {
    pub fn is_armed(&self) -> bool {
        matches!(self, Self::Armed { .. })
    }

    /// When the armed timer was scheduled.
    pub fn armed_at(&self) -> Option<Timestamp> {
        match self {
            Self::Armed { armed_at, .. } => Some(*armed_at),
            Self::Idle => None,
        }
    }

    /// Whether the armed timer is the one scheduled at `epoch`.
    pub fn is_current(&self, epoch: u64) -> bool {
        matches!(self, Self::Armed { epoch: armed, .. } if *armed == epoch)
    }

    /// Record a newly scheduled timer. Must only be called while idle.
    pub fn arm(&mut self, handle: TimerHandle, armed_at: Timestamp, epoch: u64) {
        debug_assert!(!self.is_armed(), "flush timer armed twice");
        *self = Self::Armed {
            handle,
            armed_at,
            epoch,
        };
    }

    /// Return to idle, handing back the handle if one was armed.
    pub fn disarm(&mut self) -> Option<TimerHandle> {
        match std::mem::take(self) {
            Self::Armed { handle, .. } => Some(handle),
            Self::Idle => None,
        }
    }
}
