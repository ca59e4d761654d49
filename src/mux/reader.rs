//! The reader loop: one outstanding blocking read for all waiters.
//!
//! Registry and reader state sit together behind a single mutex, so a
//! registration and the restart decision it implies happen atomically with
//! respect to the loop capturing its next snapshot and dispatching results.

use super::dispatch::dispatch;
use super::registry::WaiterRegistry;
use crate::store::{CancelToken, LogStore, ReadOutcome};
use crate::types::CursorSet;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Pause after a failed read before reissuing.
const FAILURE_BACKOFF: Duration = Duration::from_millis(50);

/// Where the loop is in its read cycle.
#[derive(Debug, Default)]
pub(crate) enum ReaderState {
    /// No outstanding read; the registry was empty when last checked.
    #[default]
    Idle,
    /// One read in flight, blocking on `snapshot`.
    Blocked {
        snapshot: CursorSet,
        token: CancelToken,
    },
    /// The current read (if any) is stale; a fresh one must be issued once
    /// it has resolved.
    Restarting,
}

/// What a caller must do after asking for a restart.
#[derive(Debug)]
pub(crate) enum RestartAction {
    /// The loop is parked waiting for work.
    Wake,
    /// A read is in flight and must be interrupted.
    Cancel(CancelToken),
    /// A restart is already pending.
    Nothing,
}

impl ReaderState {
    /// Mark the current read stale.
    pub(crate) fn request_restart(&mut self) -> RestartAction {
        match std::mem::replace(self, ReaderState::Restarting) {
            ReaderState::Idle => RestartAction::Wake,
            ReaderState::Blocked { token, .. } => RestartAction::Cancel(token),
            ReaderState::Restarting => RestartAction::Nothing,
        }
    }

    pub(crate) fn status(&self) -> ReaderStatus {
        match self {
            ReaderState::Idle => ReaderStatus::Idle,
            ReaderState::Blocked { snapshot, .. } => ReaderStatus::Blocked(snapshot.clone()),
            ReaderState::Restarting => ReaderStatus::Restarting,
        }
    }
}

/// Observable view of the reader state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReaderStatus {
    Idle,
    /// Blocked on these per-stream cursors.
    Blocked(CursorSet),
    Restarting,
}

/// Signals sent to a parked loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopSignal {
    Wake,
    Shutdown,
}

/// Everything the critical section protects.
#[derive(Debug, Default)]
pub(crate) struct Core {
    pub(crate) registry: WaiterRegistry,
    pub(crate) state: ReaderState,
    pub(crate) shutdown: bool,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) reads_issued: AtomicU64,
    pub(crate) restarts: AtomicU64,
    pub(crate) read_failures: AtomicU64,
    pub(crate) delivered: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

/// State shared between the loop thread and every handle.
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) core: Mutex<Core>,
    pub(crate) counters: Counters,
    pub(crate) next_waiter: AtomicU64,
}

impl Shared {
    pub(crate) fn new() -> Self {
        Self {
            core: Mutex::new(Core::default()),
            counters: Counters::default(),
            next_waiter: AtomicU64::new(1),
        }
    }
}

/// Run the reader loop until shutdown.
///
/// Each turn captures the registry's minimum cursors, marks the state
/// `Blocked`, and issues one read outside the lock. When the read resolves
/// the results are dispatched, unless a restart was requested meanwhile: a
/// stale snapshot may not cover a newly registered lower cursor, so those
/// results are dropped and the next turn reads again from a fresh snapshot.
/// Failures and timeouts just lead to the next turn.
pub(crate) fn run(
    shared: Arc<Shared>,
    store: Arc<dyn LogStore>,
    signals: Receiver<LoopSignal>,
    read_timeout: Duration,
) {
    tracing::debug!(?read_timeout, "reader loop started");

    loop {
        let next = {
            let mut core = shared.core.lock();
            if core.shutdown {
                core.state = ReaderState::Idle;
                break;
            }
            if core.registry.is_empty() {
                core.state = ReaderState::Idle;
                None
            } else {
                let snapshot = core.registry.snapshot_cursors();
                let token = CancelToken::new();
                core.state = ReaderState::Blocked {
                    snapshot: snapshot.clone(),
                    token: token.clone(),
                };
                Some((snapshot, token))
            }
        };

        let Some((snapshot, token)) = next else {
            match signals.recv() {
                Ok(LoopSignal::Wake) => continue,
                Ok(LoopSignal::Shutdown) | Err(_) => break,
            }
        };

        Counters::bump(&shared.counters.reads_issued, 1);
        tracing::trace!(streams = snapshot.len(), "issuing blocking read");
        let outcome = store.blocking_read(&snapshot, read_timeout, &token);

        let mut core = shared.core.lock();
        if matches!(core.state, ReaderState::Restarting) {
            tracing::debug!("read superseded by a lower cursor; reissuing");
            continue;
        }

        match outcome {
            Ok(ReadOutcome::Entries(batch)) => {
                let summary = dispatch(&mut core.registry, batch);
                Counters::bump(&shared.counters.delivered, summary.delivered as u64);
                tracing::debug!(
                    groups = summary.groups,
                    delivered = summary.delivered,
                    abandoned = summary.abandoned,
                    remaining = core.registry.waiter_count(),
                    "dispatched read batch"
                );
            }
            Ok(ReadOutcome::TimedOut) => {
                tracing::trace!("blocking read timed out");
            }
            Ok(ReadOutcome::Interrupted) => {
                tracing::trace!("blocking read interrupted");
            }
            Err(err) => {
                Counters::bump(&shared.counters.read_failures, 1);
                tracing::warn!(error = %err, "blocking read failed; reissuing");
                drop(core);
                std::thread::sleep(FAILURE_BACKOFF);
            }
        }
    }

    let mut core = shared.core.lock();
    core.registry.clear();
    core.state = ReaderState::Idle;
    drop(core);
    tracing::debug!("reader loop stopped");
}
