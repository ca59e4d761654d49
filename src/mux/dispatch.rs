//! Delivering a read batch to the waiters it satisfies.

use super::registry::WaiterRegistry;
use crate::types::ReadBatch;

/// Counts from one dispatch pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Cursor groups that received a batch and were removed.
    pub groups: usize,
    /// Waiters whose batch was accepted.
    pub delivered: usize,
    /// Waiters whose receiver was already gone.
    pub abandoned: usize,
}

/// Complete every waiter that `batch` has news for.
///
/// Entries of a stream arrive in append order, so the groups with anything
/// deliverable are exactly those whose cursor is below the coarse id of the
/// newest entry. Each such group gets the suffix of entries strictly past
/// its cursor and is then forgotten: groups are one-shot, and callers
/// re-register with a newer cursor to keep waiting.
pub fn dispatch(registry: &mut WaiterRegistry, batch: ReadBatch) -> DispatchSummary {
    let mut summary = DispatchSummary::default();

    for (stream, entries) in batch {
        let Some(newest) = entries.last().map(|entry| entry.id.cursor()) else {
            continue;
        };

        for (cursor, waiters) in registry.take_groups_below(&stream, newest) {
            let start = entries.partition_point(|entry| !entry.id.is_after(cursor));
            let deliverable = &entries[start..];
            summary.groups += 1;

            for waiter in waiters {
                if waiter.complete(deliverable.to_vec()) {
                    summary.delivered += 1;
                } else {
                    summary.abandoned += 1;
                }
            }
        }
    }

    summary
}
