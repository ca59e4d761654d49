//! Public handle to the long-poll multiplexer.

use super::reader::{self, Counters, LoopSignal, ReaderStatus, RestartAction, Shared};
use super::registry::{Waiter, WaiterId};
use crate::error::Result;
use crate::store::LogStore;
use crate::types::{Cursor, Entry, StreamName};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;

/// Default bound on a single blocking read.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for a [`Multiplexer`].
#[derive(Clone, Debug)]
pub struct MuxConfig {
    /// Upper bound on each blocking read. Only guards against a read that
    /// never returns; a timed-out read is simply reissued.
    pub read_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Counters since the multiplexer started.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MuxStats {
    /// Blocking reads issued.
    pub reads_issued: u64,
    /// In-flight reads cancelled because a lower cursor was registered.
    pub restarts: u64,
    /// Reads that failed with a store error.
    pub read_failures: u64,
    /// Waiters completed with a batch.
    pub delivered: u64,
}

/// Collapses any number of long-poll waiters onto one blocking read.
///
/// The read runs on a dedicated thread. Registering a cursor below the
/// current minimum for its stream (or on a stream nobody waits on) cancels
/// the in-flight read so the next one covers it; any other registration is
/// already covered.
pub struct Multiplexer {
    shared: Arc<Shared>,
    signals: Sender<LoopSignal>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Multiplexer {
    /// Spawn the reader loop over `store`.
    pub fn start(store: Arc<dyn LogStore>, config: MuxConfig) -> Result<Self> {
        let shared = Arc::new(Shared::new());
        let (signals, receiver) = unbounded();

        let thread = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("streampoll-reader".into())
                .spawn(move || reader::run(shared, store, receiver, config.read_timeout))?
        };

        Ok(Self {
            shared,
            signals,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Register a waiter for entries on `stream` newer than `cursor`.
    pub fn register(&self, stream: impl Into<StreamName>, cursor: Cursor) -> PendingWait {
        let stream = stream.into();
        let id = WaiterId(self.shared.next_waiter.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = oneshot::channel();

        let action = {
            let mut core = self.shared.core.lock();
            if core.shutdown {
                // Dropping the sender resolves the wait with an empty batch.
                drop(sender);
                None
            } else {
                let registration =
                    core.registry
                        .register(stream.clone(), cursor, Waiter::new(id, sender));
                registration
                    .lowers_minimum
                    .then(|| core.state.request_restart())
            }
        };

        match action {
            Some(RestartAction::Cancel(token)) => {
                Counters::bump(&self.shared.counters.restarts, 1);
                tracing::debug!(%stream, %cursor, "lower cursor registered; restarting read");
                token.cancel();
            }
            Some(RestartAction::Wake) => {
                let _ = self.signals.send(LoopSignal::Wake);
            }
            Some(RestartAction::Nothing) | None => {}
        }

        PendingWait {
            shared: Arc::clone(&self.shared),
            stream,
            cursor,
            id,
            receiver,
            finished: false,
        }
    }

    /// Wait up to `deadline` for entries on `stream` newer than `cursor`.
    ///
    /// Returns an empty batch if nothing arrived in time.
    pub async fn wait(
        &self,
        stream: impl Into<StreamName>,
        cursor: Cursor,
        deadline: Duration,
    ) -> Vec<Entry> {
        self.register(stream, cursor).recv_timeout(deadline).await
    }

    pub fn reader_status(&self) -> ReaderStatus {
        self.shared.core.lock().state.status()
    }

    pub fn waiter_count(&self) -> usize {
        self.shared.core.lock().registry.waiter_count()
    }

    pub fn stream_count(&self) -> usize {
        self.shared.core.lock().registry.stream_count()
    }

    pub fn stats(&self) -> MuxStats {
        let counters = &self.shared.counters;
        MuxStats {
            reads_issued: counters.reads_issued.load(Ordering::Relaxed),
            restarts: counters.restarts.load(Ordering::Relaxed),
            read_failures: counters.read_failures.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
        }
    }

    /// Stop the reader loop and wait for it to exit.
    ///
    /// Pending waiters resolve with an empty batch. Idempotent.
    pub fn shutdown(&self) {
        let token = {
            let mut core = self.shared.core.lock();
            core.shutdown = true;
            match core.state.request_restart() {
                RestartAction::Cancel(token) => Some(token),
                RestartAction::Wake | RestartAction::Nothing => None,
            }
        };
        if let Some(token) = token {
            token.cancel();
        }
        let _ = self.signals.send(LoopSignal::Shutdown);

        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                tracing::error!("reader loop panicked");
            }
        }
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A registered waiter, resolved by [`PendingWait::recv_timeout`].
///
/// Dropping an unresolved wait removes its registration.
pub struct PendingWait {
    shared: Arc<Shared>,
    stream: StreamName,
    cursor: Cursor,
    id: WaiterId,
    receiver: oneshot::Receiver<Vec<Entry>>,
    finished: bool,
}

impl PendingWait {
    pub fn id(&self) -> WaiterId {
        self.id
    }

    pub fn stream(&self) -> &StreamName {
        &self.stream
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Wait for delivery until `deadline` elapses.
    ///
    /// On deadline only this waiter is unregistered, never its group. If a
    /// dispatch won the race against the deadline, its batch is returned.
    pub async fn recv_timeout(mut self, deadline: Duration) -> Vec<Entry> {
        match tokio::time::timeout(deadline, &mut self.receiver).await {
            Ok(delivered) => {
                self.finished = true;
                delivered.unwrap_or_default()
            }
            Err(_) => self.expire(),
        }
    }

    /// Take the batch if it has already been delivered.
    pub fn try_recv(&mut self) -> Option<Vec<Entry>> {
        match self.receiver.try_recv() {
            Ok(entries) => {
                self.finished = true;
                Some(entries)
            }
            Err(oneshot::error::TryRecvError::Closed) => {
                self.finished = true;
                Some(Vec::new())
            }
            Err(oneshot::error::TryRecvError::Empty) => None,
        }
    }

    fn expire(&mut self) -> Vec<Entry> {
        self.finished = true;
        if self.unregister() {
            return Vec::new();
        }
        // Already detached by a dispatch, which sends while holding the lock.
        self.receiver.try_recv().unwrap_or_default()
    }

    fn unregister(&self) -> bool {
        self.shared
            .core
            .lock()
            .registry
            .unregister_one(&self.stream, self.cursor, self.id)
    }
}

impl Drop for PendingWait {
    fn drop(&mut self) {
        if !self.finished && self.unregister() {
            tracing::trace!(stream = %self.stream, cursor = %self.cursor, "abandoned wait removed");
        }
    }
}
