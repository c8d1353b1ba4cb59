//! The common source object model
//!
//! All sources share one header: a stable id, a kind tag, the dispatch
//! callback, the user payload, the backend-data slot, and the bookkeeping
//! links used by the loop (started slot and event-queue occupancy). The
//! per-kind data follows the tag. Typed handles in [`crate::sources`] wrap
//! the untyped [`Source`] handle.
//!
//! Reference counting is expressed through `Arc`: every protocol reference
//! (user handle, started-list entry, event-queue entry, worker upgrade) is a
//! strong clone, and the registry holds only weak entries. A source is
//! therefore finalized exactly once, when its last handle drops, and the user
//! payload is released at that point.

use std::any::Any;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::loop_logic::{EventLoop, LoopState};
use crate::registry::{self, SourceId};

pub(crate) type Callback = Box<dyn FnMut(&Source) + Send>;

pub(crate) struct SourceInner {
    pub(crate) id: SourceId,
    pub(crate) kind: Kind,
    pub(crate) cb: Mutex<Option<Callback>>,
    pub(crate) userdata: Mutex<Option<Box<dyn Any + Send>>>,
    pub(crate) backend_data: Mutex<Option<Box<dyn Any + Send>>>,
    /// Raw id of the loop this source is started on; 0 while unstarted. For
    /// fd handlers this doubles as the back pointer to the owning loop.
    pub(crate) started_in: AtomicU64,
    /// Event-queue occupancy. Only mutated under the queue lock.
    pub(crate) queued: AtomicBool,
}

pub(crate) enum Kind {
    Loop(LoopState),
    Fd(FdState),
    Timer(TimerState),
    Ticker(TimerState),
    Signal(SignalState),
    Work(WorkState),
    Idle,
}

pub(crate) struct FdState {
    pub(crate) fd: RawFd,
    pub(crate) event_mask: AtomicU32,
    pub(crate) revents: AtomicU32,
}

pub(crate) struct TimerState {
    pub(crate) duration_us: AtomicU64,
}

pub(crate) struct SignalState {
    pub(crate) signo: i32,
}

pub(crate) struct WorkState {
    pub(crate) work_fn: Mutex<Callback>,
}

impl Drop for SourceInner {
    fn drop(&mut self) {
        if let Kind::Loop(_) = self.kind {
            crate::loop_logic::teardown(self);
        }
        registry::drop_id(self.id);
        // The userdata box drops with the header, releasing the payload.
    }
}

/// The kind tag of a source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// An event loop. The loop is itself a source, so the id and reference
    /// machinery applies to it like to everything else.
    Loop,
    /// A file-descriptor readiness handler
    FdHandler,
    /// A one-shot timer
    Timer,
    /// A periodic ticker
    Ticker,
    /// A process-signal handler
    Signal,
    /// An off-thread work item
    Work,
    /// An idle callback
    Idle,
}

/// An untyped strong handle to a source
///
/// Cloning a `Source` takes a new reference and dropping one releases it;
/// when the last handle goes away the source is finalized and its user
/// payload is released. Typed handles ([`crate::sources`]) convert through
/// [`AsSource`] and `TryFrom`.
pub struct Source {
    pub(crate) inner: Arc<SourceInner>,
}

impl Clone for Source {
    fn clone(&self) -> Source {
        Source {
            inner: self.inner.clone(),
        }
    }
}

impl std::fmt::Debug for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Source")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .finish_non_exhaustive()
    }
}

impl Source {
    pub(crate) fn new_inner(kind: Kind, cb: Option<Callback>) -> Source {
        let inner = Arc::new_cyclic(|weak| SourceInner {
            id: registry::assign_id(weak.clone()),
            kind,
            cb: Mutex::new(cb),
            userdata: Mutex::new(None),
            backend_data: Mutex::new(None),
            started_in: AtomicU64::new(0),
            queued: AtomicBool::new(false),
        });
        Source { inner }
    }

    /// The stable id of this source.
    pub fn id(&self) -> SourceId {
        self.inner.id
    }

    /// The kind tag of this source.
    pub fn kind(&self) -> SourceKind {
        match self.inner.kind {
            Kind::Loop(_) => SourceKind::Loop,
            Kind::Fd(_) => SourceKind::FdHandler,
            Kind::Timer(_) => SourceKind::Timer,
            Kind::Ticker(_) => SourceKind::Ticker,
            Kind::Signal(_) => SourceKind::Signal,
            Kind::Work(_) => SourceKind::Work,
            Kind::Idle => SourceKind::Idle,
        }
    }

    /// Upgrade an id to a strong handle.
    ///
    /// Returns `None` once the source has been finalized. The upgrade is
    /// race-free: it either yields a handle that keeps the source alive or
    /// fails, never a dangling reference.
    pub fn upgrade(id: SourceId) -> Option<Source> {
        registry::try_upgrade(id).map(|inner| Source { inner })
    }

    /// Attach a user payload to this source, replacing any previous one.
    ///
    /// The payload is dropped when the source is finalized (or when it is
    /// replaced or taken), which is where release logic in a `Drop` impl
    /// runs.
    pub fn set_userdata<T: Any + Send>(&self, data: T) {
        *self.inner.userdata.lock().unwrap() = Some(Box::new(data));
    }

    /// Access the user payload, if any of type `T` is attached.
    pub fn with_userdata<T: Any + Send, R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> R {
        let mut guard = self.inner.userdata.lock().unwrap();
        f(guard.as_mut().and_then(|data| data.downcast_mut::<T>()))
    }

    /// Detach and return the user payload.
    pub fn take_userdata(&self) -> Option<Box<dyn Any + Send>> {
        self.inner.userdata.lock().unwrap().take()
    }

    /// Attach backend-private state to this source.
    ///
    /// This slot belongs to the backend implementation and is distinct from
    /// the user payload; backends must not touch [`Source::set_userdata`].
    pub fn set_backend_data<T: Any + Send>(&self, data: T) {
        *self.inner.backend_data.lock().unwrap() = Some(Box::new(data));
    }

    /// Access the backend-private state, if any of type `T` is attached.
    pub fn with_backend_data<T: Any + Send, R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> R {
        let mut guard = self.inner.backend_data.lock().unwrap();
        f(guard.as_mut().and_then(|data| data.downcast_mut::<T>()))
    }

    /// Detach and return the backend-private state.
    pub fn take_backend_data(&self) -> Option<Box<dyn Any + Send>> {
        self.inner.backend_data.lock().unwrap().take()
    }

    /// The loop this source is currently started on, if it is started and
    /// the loop is still alive.
    pub(crate) fn started_loop(&self) -> Option<EventLoop> {
        let raw = self.inner.started_in.load(Ordering::Acquire);
        let id = SourceId::from_u64(raw)?;
        EventLoop::try_from(Source::upgrade(id)?).ok()
    }

    pub(crate) fn ptr_eq(&self, other: &Source) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run the dispatch callback, if one is set.
    pub(crate) fn invoke(&self) {
        let mut guard = self.inner.cb.lock().unwrap();
        if let Some(cb) = guard.as_mut() {
            cb(self);
        }
    }

    pub(crate) fn fd_state(&self) -> Option<&FdState> {
        match &self.inner.kind {
            Kind::Fd(state) => Some(state),
            _ => None,
        }
    }
}

/// Conversion of typed source handles to the untyped [`Source`]
pub trait AsSource {
    /// Borrow the untyped handle.
    fn as_source(&self) -> &Source;
}

impl AsSource for Source {
    fn as_source(&self) -> &Source {
        self
    }
}
