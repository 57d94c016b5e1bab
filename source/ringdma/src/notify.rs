//! Readiness notifications raised by completion handling.
//!
//! Each direction has one [`Signal`]: a pending flag plus a
//! [`WaitCell`]. Raising a signal any number of times before a waiter
//! observes it is equivalent to raising it once.
use core::fmt;

use maitake_sync::WaitCell;
use portable_atomic::{AtomicBool, AtomicUsize, Ordering::*};

use crate::Direction;

/// A single-slot, coalescing notification.
pub struct Signal {
    pending: AtomicBool,
    wait: WaitCell,
}

/// The notification target for one device: a [`Signal`] per direction, and
/// a count of registered asynchronous listeners.
///
/// Some completion policies behave differently depending on whether anyone
/// is listening (see [`Notifier::has_listener`]).
pub struct Notifier {
    inbound: Signal,
    outbound: Signal,
    listeners: AtomicUsize,
}

/// A registration as an asynchronous listener. Dropping it unregisters.
#[must_use = "dropping a `Listener` unregisters it"]
pub struct Listener<'a> {
    notifier: &'a Notifier,
}

/// Returned by [`Signal::wait`] once the signal has been closed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Closed(());

// === impl Signal ===

impl Signal {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            wait: WaitCell::new(),
        }
    }

    /// Marks the signal pending and wakes the waiter, if there is one.
    pub fn raise(&self) {
        self.pending.store(true, Release);
        self.wait.wake();
    }

    /// Consumes a pending notification, returning `true` if there was one.
    pub fn take(&self) -> bool {
        self.pending.swap(false, AcqRel)
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending.load(Acquire)
    }

    /// Waits until the signal is raised, consuming the notification.
    ///
    /// Returns immediately if a notification is already pending.
    pub async fn wait(&self) -> Result<(), Closed> {
        loop {
            if self.take() {
                return Ok(());
            }

            // subscribe before re-checking the flag, so that a `raise`
            // between the check and the await isn't lost.
            let wait = self.wait.subscribe().await;
            if self.take() {
                return Ok(());
            }
            if wait.await.is_err() {
                return Err(Closed(()));
            }
        }
    }

    /// Closes the signal, waking the waiter with an error.
    pub fn close(&self) {
        self.wait.close();
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("pending", &self.is_pending())
            .finish()
    }
}

// === impl Notifier ===

impl Notifier {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inbound: Signal::new(),
            outbound: Signal::new(),
            listeners: AtomicUsize::new(0),
        }
    }

    /// Wakes whoever is waiting for `direction` to become ready.
    pub fn notify_readers(&self, direction: Direction) {
        tracing::trace!(%direction, "notify readers");
        self.signal(direction).raise();
    }

    #[must_use]
    pub fn signal(&self, direction: Direction) -> &Signal {
        match direction {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }

    /// Registers an asynchronous listener for as long as the returned guard
    /// lives.
    pub fn listen(&self) -> Listener<'_> {
        self.listeners.fetch_add(1, AcqRel);
        Listener { notifier: self }
    }

    #[must_use]
    pub fn has_listener(&self) -> bool {
        self.listeners.load(Acquire) > 0
    }

    /// Closes both signals.
    pub fn close(&self) {
        self.inbound.close();
        self.outbound.close();
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("inbound", &self.inbound)
            .field("outbound", &self.outbound)
            .field("listeners", &self.listeners.load(Acquire))
            .finish()
    }
}

// === impl Listener ===

impl Drop for Listener<'_> {
    fn drop(&mut self) {
        self.notifier.listeners.fetch_sub(1, AcqRel);
    }
}

impl fmt::Debug for Listener<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn raises_coalesce() {
        let signal = Signal::new();
        assert!(!signal.take());

        signal.raise();
        signal.raise();
        signal.raise();
        assert!(signal.take());
        assert!(!signal.take());
    }

    #[test]
    fn pending_wait_completes_immediately() {
        let signal = Signal::new();
        signal.raise();
        futures::executor::block_on(signal.wait()).unwrap();
        assert!(!signal.is_pending());
    }

    #[test]
    fn wait_is_woken_by_another_thread() {
        crate::test_util::trace_init();
        let notifier = Arc::new(Notifier::new());
        let raiser = {
            let notifier = notifier.clone();
            thread::spawn(move || {
                thread::sleep(std::time::Duration::from_millis(10));
                notifier.notify_readers(Direction::Inbound);
            })
        };

        futures::executor::block_on(notifier.signal(Direction::Inbound).wait()).unwrap();
        raiser.join().unwrap();
        assert!(!notifier.signal(Direction::Outbound).is_pending());
    }

    #[test]
    fn closed_signal_errors() {
        let signal = Signal::new();
        signal.close();
        let res = futures::executor::block_on(signal.wait());
        assert_eq!(res, Err(Closed(())));
    }

    #[test]
    fn listener_registration() {
        let notifier = Notifier::new();
        assert!(!notifier.has_listener());
        let a = notifier.listen();
        let b = notifier.listen();
        assert!(notifier.has_listener());
        drop(a);
        assert!(notifier.has_listener());
        drop(b);
        assert!(!notifier.has_listener());
    }
}
