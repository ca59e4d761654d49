//! Cancellation handle for blocking reads.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type Interrupt = Box<dyn Fn() + Send + Sync>;

/// Cancels one blocking read.
///
/// The store installs an interrupt with [`CancelToken::on_cancel`] before it
/// parks the reader; [`CancelToken::cancel`] sets a sticky flag and fires the
/// interrupt. The interrupt is the store's out-of-band way of waking a parked
/// reader, so the code requesting cancellation never needs to know how that
/// happens.
///
/// Cancelling a token whose read has not parked yet makes that read return
/// [`ReadOutcome::Interrupted`](super::ReadOutcome::Interrupted) as soon as it
/// checks the flag. Cancelling twice, or after the read finished, does
/// nothing.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    interrupt: Mutex<Option<Interrupt>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and fire the installed interrupt, if any.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let interrupt = self.inner.interrupt.lock();
        if let Some(interrupt) = interrupt.as_ref() {
            interrupt();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Install the store-side interrupt.
    ///
    /// Runs `interrupt` right away if the token was already cancelled. Must
    /// not be called while holding a lock that `interrupt` takes.
    pub fn on_cancel<F>(&self, interrupt: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut slot = self.inner.interrupt.lock();
        if self.is_cancelled() {
            interrupt();
        }
        *slot = Some(Box::new(interrupt));
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
