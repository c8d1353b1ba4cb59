//! The pending-event queue
//!
//! The queue is a FIFO of strong source references, appended to by `emit`
//! from the dispatch thread, worker threads, or signal-delivery contexts, and
//! drained by the dispatcher. Every locked operation blocks all deliverable
//! signals for its duration so an asynchronous signal handler can never
//! observe (or deadlock on) a half-updated queue on the same thread.
//!
//! A source occupies the queue at most once. Non-fd sources track occupancy
//! with a flag flipped under the queue lock; fd handlers coalesce through
//! their atomic pending mask (see `emit` in the loop logic), with the flag as
//! a second guard against double occupancy.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};

use crate::source::{Kind, Source};

/// Run `f` with all signals blocked on the calling thread.
pub(crate) fn with_signals_blocked<R>(f: impl FnOnce() -> R) -> R {
    let mut prev = SigSet::empty();
    let blocked =
        pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::all()), Some(&mut prev)).is_ok();
    let ret = f();
    if blocked {
        let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&prev), None);
    }
    ret
}

pub(crate) struct EventQueue {
    items: Mutex<VecDeque<Source>>,
}

impl EventQueue {
    pub(crate) fn new() -> EventQueue {
        EventQueue {
            items: Mutex::new(VecDeque::new()),
        }
    }

    /// Append a source unless it is already queued. Returns whether the
    /// source was actually enqueued.
    pub(crate) fn push(&self, src: &Source) -> bool {
        with_signals_blocked(|| {
            let mut items = self.items.lock().unwrap();
            if src.inner.queued.swap(true, Ordering::AcqRel) {
                return false;
            }
            items.push_back(src.clone());
            true
        })
    }

    /// Pop the head of the queue, clearing its occupancy so an emit from
    /// inside the callback queues it again.
    pub(crate) fn pop(&self) -> Option<Source> {
        with_signals_blocked(|| {
            let mut items = self.items.lock().unwrap();
            let src = items.pop_front()?;
            src.inner.queued.store(false, Ordering::Release);
            Some(src)
        })
    }

    /// Remove any pending occupancy of `src`, releasing the queued reference
    /// and resetting the fd pending mask. Used by stop to cancel delivery.
    pub(crate) fn purge(&self, src: &Source) {
        with_signals_blocked(|| {
            let mut items = self.items.lock().unwrap();
            items.retain(|queued| !queued.ptr_eq(src));
            src.inner.queued.store(false, Ordering::Release);
            if let Kind::Fd(state) = &src.inner.kind {
                state.revents.store(0, Ordering::Release);
            }
        })
    }

    /// Drop every queued reference. Used by loop teardown.
    pub(crate) fn clear(&self) {
        with_signals_blocked(|| {
            let mut items = self.items.lock().unwrap();
            for src in items.drain(..) {
                src.inner.queued.store(false, Ordering::Release);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::EventQueue;
    use crate::sources::Idle;
    use crate::AsSource;

    #[test]
    fn fifo_order() {
        let queue = EventQueue::new();
        let a = Idle::new(|_| {});
        let b = Idle::new(|_| {});

        assert!(queue.push(a.as_source()));
        assert!(queue.push(b.as_source()));

        assert!(queue.pop().unwrap().ptr_eq(a.as_source()));
        assert!(queue.pop().unwrap().ptr_eq(b.as_source()));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn single_occupancy() {
        let queue = EventQueue::new();
        let idle = Idle::new(|_| {});

        assert!(queue.push(idle.as_source()));
        assert!(!queue.push(idle.as_source()));

        assert!(queue.pop().is_some());
        assert!(queue.pop().is_none());

        // Once dequeued it may be queued again.
        assert!(queue.push(idle.as_source()));
    }

    #[test]
    fn purge_cancels_delivery() {
        let queue = EventQueue::new();
        let a = Idle::new(|_| {});
        let b = Idle::new(|_| {});

        queue.push(a.as_source());
        queue.push(b.as_source());
        queue.purge(a.as_source());

        assert!(queue.pop().unwrap().ptr_eq(b.as_source()));
        assert!(queue.pop().is_none());
    }
}
