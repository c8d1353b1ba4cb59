//! The backend contract
//!
//! A backend is the readiness engine behind an event loop: it watches file
//! descriptors and signals, arms the single earliest-deadline wakeup, and
//! blocks in [`poll`](Backend::poll) until something is ready. The loop core
//! stays engine-agnostic: the same user code runs on the default engine in
//! [`crate::sys`] or on anything else implementing this trait (including a
//! shim over a foreign loop).
//!
//! Backends that need per-source bookkeeping attach it through
//! [`Source::set_backend_data`](crate::Source::set_backend_data), which is
//! reserved for them and distinct from the user payload slot.

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::loop_logic::LoopHandle;
use crate::registry::SourceId;
use crate::sources::{Handler, Signal};

/// Static capabilities of a backend
#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    /// Fd readiness is reported edge-triggered. The dispatcher re-arms every
    /// handler via [`Backend::mod_fd`] after draining it.
    pub edge_triggered: bool,

    /// The backend can unblock its own [`Backend::poll`] from another thread
    /// through [`Backend::interrupt`]. When this is false the loop creates a
    /// self-pipe and wakes the backend through an internal fd handler
    /// instead.
    pub native_interrupt: bool,
}

/// A readiness engine driving an [`EventLoop`](crate::EventLoop)
pub trait Backend: Send + Sync {
    /// The capability flags of this backend.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// A descriptor aggregating this backend's readiness, suitable for
    /// nesting the loop into a foreign event loop. `None` when the engine
    /// has no such descriptor.
    fn get_fd(&self) -> Option<RawFd> {
        None
    }

    /// Block until readiness, the armed deadline, or an interrupt.
    ///
    /// `None` blocks indefinitely. Every ready source is delivered through
    /// [`LoopHandle::emit`]; the return value is the number of events
    /// surfaced, with `Ok(0)` on timeout.
    fn poll(&self, evl: &LoopHandle<'_>, timeout: Option<Duration>) -> crate::Result<usize>;

    /// Register a started fd handler.
    fn add_fd(&self, handler: &Handler) -> crate::Result<()>;

    /// Update the registration of a started fd handler after its event mask
    /// changed. The default emulation deregisters and re-registers.
    fn mod_fd(&self, handler: &Handler) -> crate::Result<()> {
        self.del_fd(handler)?;
        self.add_fd(handler)
    }

    /// Deregister a stopped fd handler.
    fn del_fd(&self, handler: &Handler) -> crate::Result<()>;

    /// Start routing a signal to the loop.
    fn add_signal(&self, evl: &LoopHandle<'_>, signal: &Signal) -> crate::Result<()>;

    /// Stop routing a signal.
    fn del_signal(&self, evl: &LoopHandle<'_>, signal: &Signal) -> crate::Result<()>;

    /// Arm the single wakeup deadline. Re-armed by the dispatcher after
    /// every pass with the earliest pending deadline; an already-elapsed
    /// instant must still wake `poll`.
    fn set_deadline(&self, deadline: Instant) -> crate::Result<()>;

    /// Called after every dispatch pass, once the deadline has been re-armed.
    /// Backends with internal producer threads resume them here.
    fn post_dispatch(&self) {}

    /// Unblock a pending `poll` from another thread. Only used when
    /// [`Capabilities::native_interrupt`] is set.
    fn interrupt(&self) {}

    /// Make a pending `poll` return because the loop is exiting. Return
    /// false when the engine has no dedicated exit path; the loop falls back
    /// to an interrupt.
    fn exit(&self) -> bool {
        false
    }

    /// Ensure at least `n` worker threads exist (`None` means one per
    /// available CPU) and take a user reference on the pool.
    fn thread_pool_acquire(&self, n: Option<usize>) -> crate::Result<()> {
        crate::thread_pool::acquire(n)
    }

    /// Release one user reference on the pool, reaping the workers when the
    /// last user is gone.
    fn thread_pool_release(&self) {
        crate::thread_pool::release()
    }

    /// Hand a started work source to the pool. Entries are ids, not
    /// references: the worker upgrades them when it gets to the item.
    fn thread_pool_enqueue(&self, evl: SourceId, work: SourceId) {
        crate::thread_pool::enqueue(evl, work)
    }
}
