use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// Result of offering an item to a [`PendingPool`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome<T> {
    /// Item was stored; carries the pool size and age after the insert.
    Added { size: usize, age: Duration },
    /// An item with the same key is already pending. The rejected item is
    /// handed back untouched.
    AlreadyQueued(T),
}

impl<T> AddOutcome<T> {
    pub fn is_added(&self) -> bool {
        matches!(self, AddOutcome::Added { .. })
    }
}

#[derive(Debug)]
struct PoolState<K, T> {
    items: Vec<(K, T)>,
    keys: HashSet<K>,
    first_inserted_at: Option<Instant>,
}

/// Pending items awaiting a flush, keyed and kept in insertion order.
///
/// All operations take the same lock. A `drain_all` contains exactly the
/// items whose `try_add` acquired the lock before it did.
#[derive(Debug)]
pub struct PendingPool<K, T> {
    state: Mutex<PoolState<K, T>>,
}

impl<K, T> Default for PendingPool<K, T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(PoolState {
                items: Vec::new(),
                keys: HashSet::new(),
                first_inserted_at: None,
            }),
        }
    }
}

impl<K: Eq + Hash + Clone, T> PendingPool<K, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `item` under `key` unless the key is already pending.
    pub fn try_add(&self, key: K, item: T) -> AddOutcome<T> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.keys.insert(key.clone()) {
            return AddOutcome::AlreadyQueued(item);
        }
        let now = Instant::now();
        let started = *state.first_inserted_at.get_or_insert(now);
        state.items.push((key, item));
        AddOutcome::Added {
            size: state.items.len(),
            age: now.saturating_duration_since(started),
        }
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .items
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Time since the first item of the current generation was added; zero when empty.
    pub fn age(&self) -> Duration {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .first_inserted_at
            .map_or(Duration::ZERO, |started| {
                Instant::now().saturating_duration_since(started)
            })
    }

    /// Takes every pending item in insertion order and resets the age clock.
    pub fn drain_all(&self) -> Vec<(K, T)> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.items.is_empty() {
            return Vec::new();
        }
        state.first_inserted_at = None;
        state.keys.clear();
        std::mem::take(&mut state.items)
    }
}
