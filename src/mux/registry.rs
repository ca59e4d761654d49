//! Waiter registry: stream -> cursor -> pending waiters.

use crate::types::{Cursor, CursorSet, Entry, StreamName};
use std::collections::{btree_map, BTreeMap, HashMap};
use tokio::sync::oneshot;

/// Unique identifier for a waiter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WaiterId(pub u64);

/// One parked long-poll request.
///
/// A waiter owns the sending half of its completion, so it can be completed
/// at most once.
#[derive(Debug)]
pub struct Waiter {
    id: WaiterId,
    sender: oneshot::Sender<Vec<Entry>>,
}

impl Waiter {
    pub fn new(id: WaiterId, sender: oneshot::Sender<Vec<Entry>>) -> Self {
        Self { id, sender }
    }

    pub fn id(&self) -> WaiterId {
        self.id
    }

    /// Deliver a batch. Returns false if the receiving side is gone.
    pub fn complete(self, entries: Vec<Entry>) -> bool {
        self.sender.send(entries).is_ok()
    }
}

/// What a registration changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Registration {
    /// The cursor had no waiters on this stream before.
    pub new_cursor: bool,
    /// The cursor is below every cursor previously registered on this
    /// stream, or the stream had no waiters at all. A read blocked on the
    /// old minimum would miss entries between the two.
    pub lowers_minimum: bool,
}

/// Pending waiters grouped by stream, then by cursor.
///
/// A stream key exists only while it has at least one cursor group, and a
/// cursor group only while it has at least one waiter.
#[derive(Debug, Default)]
pub struct WaiterRegistry {
    streams: HashMap<StreamName, BTreeMap<Cursor, Vec<Waiter>>>,
    waiter_count: usize,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `waiter` to the group for `(stream, cursor)`.
    pub fn register(&mut self, stream: StreamName, cursor: Cursor, waiter: Waiter) -> Registration {
        let groups = self.streams.entry(stream).or_default();
        let lowers_minimum = groups
            .first_key_value()
            .map_or(true, |(minimum, _)| cursor < *minimum);

        let new_cursor = match groups.entry(cursor) {
            btree_map::Entry::Vacant(slot) => {
                slot.insert(vec![waiter]);
                true
            }
            btree_map::Entry::Occupied(mut group) => {
                group.get_mut().push(waiter);
                false
            }
        };
        self.waiter_count += 1;

        Registration {
            new_cursor,
            lowers_minimum,
        }
    }

    /// Remove a single waiter, dropping its group and stream if they empty.
    ///
    /// Returns false if the waiter was not registered (already delivered).
    pub fn unregister_one(&mut self, stream: &StreamName, cursor: Cursor, id: WaiterId) -> bool {
        let Some(groups) = self.streams.get_mut(stream) else {
            return false;
        };
        let Some(waiters) = groups.get_mut(&cursor) else {
            return false;
        };
        let Some(position) = waiters.iter().position(|w| w.id == id) else {
            return false;
        };

        waiters.remove(position);
        self.waiter_count -= 1;
        if waiters.is_empty() {
            groups.remove(&cursor);
            if groups.is_empty() {
                self.streams.remove(stream);
            }
        }
        true
    }

    /// Detach every group on `stream` whose cursor is below `newest`.
    ///
    /// These are exactly the groups for which an entry with coarse id
    /// `newest` is deliverable. Returned in ascending cursor order.
    pub fn take_groups_below(&mut self, stream: &StreamName, newest: Cursor) -> Vec<(Cursor, Vec<Waiter>)> {
        let Some(groups) = self.streams.get_mut(stream) else {
            return Vec::new();
        };

        let kept = groups.split_off(&newest);
        let taken = std::mem::replace(groups, kept);
        if groups.is_empty() {
            self.streams.remove(stream);
        }

        self.waiter_count -= taken.values().map(Vec::len).sum::<usize>();
        taken.into_iter().collect()
    }

    /// Smallest cursor registered on `stream`.
    pub fn minimum_cursor(&self, stream: &StreamName) -> Option<Cursor> {
        self.streams
            .get(stream)
            .and_then(|groups| groups.keys().next().copied())
    }

    /// The per-stream minimum cursors, i.e. the next read request.
    pub fn snapshot_cursors(&self) -> CursorSet {
        self.streams
            .iter()
            .filter_map(|(stream, groups)| {
                groups.keys().next().map(|cursor| (stream.clone(), *cursor))
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn waiter_count(&self) -> usize {
        self.waiter_count
    }

    /// Number of distinct cursors registered on `stream`.
    pub fn cursor_count(&self, stream: &StreamName) -> usize {
        self.streams.get(stream).map_or(0, BTreeMap::len)
    }

    /// Drop every waiter; their receivers observe a closed channel.
    pub fn clear(&mut self) {
        self.streams.clear();
        self.waiter_count = 0;
    }
}
