//! The event loop and its dispatcher

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::unistd;

use crate::backend::Backend;
use crate::event::Event;
use crate::queue::EventQueue;
use crate::registry::{self, SourceId};
use crate::source::{AsSource, Kind, Source, SourceInner};
use crate::sources::{Handler, Signal};

struct TimerEntry {
    deadline: Instant,
    src: Source,
}

pub(crate) struct LoopState {
    pub(crate) backend: Box<dyn Backend>,
    queue: EventQueue,
    /// Sources currently started on this loop; the entries are the loop's
    /// references. Only the dispatch thread mutates the list, the lock makes
    /// that sound rather than concurrent.
    started: Mutex<Vec<Source>>,
    /// Armed timers and tickers, unordered; earliest-deadline lookups scan.
    timers: Mutex<Vec<TimerEntry>>,
    idles: Mutex<Vec<Source>>,
    do_exit: AtomicBool,
    /// Write end of the self-pipe, when the backend has no native interrupt.
    wake: Mutex<Option<CloseOnDrop>>,
    /// Successful `require_workers` calls, balanced at teardown.
    pool_refs: AtomicUsize,
}

struct CloseOnDrop(RawFd);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if let Err(err) = unistd::close(self.0) {
            log::warn!("[muxloop] failed to close pipe fd: {:?}", err);
        }
    }
}

/// A callback-based event loop
///
/// An `EventLoop` multiplexes fd readiness, timers, signals, off-thread work
/// and idle callbacks over one dispatch cycle running on the thread that
/// calls [`run`](EventLoop::run) (or [`poll`](EventLoop::poll) and
/// [`dispatch`](EventLoop::dispatch) directly). All callbacks are invoked on
/// that thread.
///
/// The loop is itself a source: it has an id, can be upgraded from that id,
/// and cloning the handle takes a reference. When the last handle drops the
/// loop tears down in order: every remaining source is stopped, the worker
/// pool is released, and pending events are discarded.
pub struct EventLoop {
    src: Source,
}

impl Clone for EventLoop {
    fn clone(&self) -> EventLoop {
        EventLoop {
            src: self.src.clone(),
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EventLoop { ... }")
    }
}

impl AsSource for EventLoop {
    fn as_source(&self) -> &Source {
        &self.src
    }
}

impl TryFrom<Source> for EventLoop {
    type Error = Source;

    fn try_from(src: Source) -> Result<EventLoop, Source> {
        if matches!(src.inner.kind, Kind::Loop(_)) {
            Ok(EventLoop { src })
        } else {
            Err(src)
        }
    }
}

impl EventLoop {
    /// Create a new event loop on the default backend.
    ///
    /// Fails if the initialization of the readiness engine failed.
    #[cfg(target_os = "linux")]
    pub fn new() -> crate::Result<EventLoop> {
        Self::with_backend(crate::sys::EpollEngine::new()?)
    }

    /// Create a new event loop on the given backend.
    pub fn with_backend<B: Backend + 'static>(backend: B) -> crate::Result<EventLoop> {
        let state = LoopState {
            backend: Box::new(backend),
            queue: EventQueue::new(),
            started: Mutex::new(Vec::new()),
            timers: Mutex::new(Vec::new()),
            idles: Mutex::new(Vec::new()),
            do_exit: AtomicBool::new(false),
            wake: Mutex::new(None),
            pool_refs: AtomicUsize::new(0),
        };
        let evl = EventLoop {
            src: Source::new_inner(Kind::Loop(state), None),
        };
        if !evl.state().backend.capabilities().native_interrupt {
            evl.init_wake_pipe()?;
        }
        Ok(evl)
    }

    // Backends without a native cross-thread interrupt get woken through a
    // self-pipe registered as an internal fd handler. The handler's payload
    // owns the read end, so finalizing it at teardown closes the pipe.
    fn init_wake_pipe(&self) -> crate::Result<()> {
        let (rfd, wfd) = unistd::pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK)?;
        let read_guard = CloseOnDrop(rfd);
        let write_guard = CloseOnDrop(wfd);

        let handler = Handler::new(rfd, |handler: &Handler| {
            let mut buf = [0u8; 32];
            loop {
                match unistd::read(handler.fd(), &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(Errno::EAGAIN) => break,
                    Err(err) => {
                        log::warn!("[muxloop] failed to drain wake pipe: {:?}", err);
                        break;
                    }
                }
            }
        });
        handler.src.set_userdata(read_guard);

        self.start(&handler)?;
        *self.state().wake.lock().unwrap() = Some(write_guard);
        Ok(())
    }

    pub(crate) fn state(&self) -> &LoopState {
        loop_state(&self.src.inner)
    }

    /// The stable id of this loop.
    pub fn id(&self) -> SourceId {
        self.src.id()
    }

    /// Borrow the backend-facing context of this loop.
    pub fn handle(&self) -> LoopHandle<'_> {
        LoopHandle {
            inner: &self.src.inner,
        }
    }

    /// Make this loop the process-wide default instance.
    ///
    /// The slot holds the loop's id, not a reference, so it never keeps a
    /// loop alive.
    pub fn set_default(&self) {
        registry::set_default(self.id());
    }

    /// The current default instance, if one was set and is still alive.
    pub fn get_default() -> Option<EventLoop> {
        let src = Source::upgrade(registry::default_id()?)?;
        EventLoop::try_from(src).ok()
    }

    /// Start a source on this loop.
    ///
    /// The loop holds a reference to the source until it is stopped, so the
    /// usual pattern is create, start, and drop the creation handle.
    ///
    /// Fails with [`AlreadyStarted`](crate::Error::AlreadyStarted) if the
    /// source is started on any loop, or with the backend's error if the
    /// registration was rejected.
    pub fn start(&self, src: &impl AsSource) -> crate::Result<()> {
        start_on(&self.src.inner, src.as_source())
    }

    /// Stop a source previously started on this loop.
    ///
    /// After this returns (on the dispatch thread), the source's callback
    /// does not run again until a further emit: pending deliveries are
    /// cancelled. Two exceptions follow from the work protocol: an
    /// in-flight work closure completes off-thread, and a done callback the
    /// worker already emitted still fires. Stopping a source that is not
    /// started is a benign no-op.
    pub fn stop(&self, src: &impl AsSource) -> crate::Result<()> {
        stop_on(&self.src.inner, src.as_source())
    }

    /// Whether the source is currently started on this loop.
    pub fn is_started(&self, src: &impl AsSource) -> bool {
        src.as_source().inner.started_in.load(Ordering::Acquire) == self.id().as_u64()
    }

    /// Mark a source as having a pending invocation.
    ///
    /// Callable from any thread and from signal-delivery contexts. `revents`
    /// is OR'd into an fd handler's pending mask and ignored for other
    /// kinds. A source already in the queue is not queued twice.
    pub fn emit(&self, src: &impl AsSource, revents: Event) {
        emit_on(self.state(), src.as_source(), revents);
    }

    /// Wait for pending events.
    ///
    /// Blocks in the backend until readiness, the earliest timer deadline,
    /// or an interrupt; `None` blocks indefinitely. Returns the number of
    /// events surfaced, with `Ok(0)` on timeout. Call
    /// [`dispatch`](EventLoop::dispatch) afterwards.
    pub fn poll(&self, timeout: Option<Duration>) -> crate::Result<usize> {
        self.state().backend.poll(&self.handle(), timeout)
    }

    /// Dispatch pending events.
    ///
    /// One pass: expired timers are drained first (tickers re-arm, timers
    /// stop), then the event queue FIFO — including sources emitted during
    /// the pass — and finally every armed idle callback. Afterwards the
    /// earliest remaining deadline is pushed to the backend.
    pub fn dispatch(&self) {
        dispatch_on(&self.src.inner);
    }

    /// Poll and dispatch until [`exit`](EventLoop::exit) is called.
    pub fn run(&self) -> crate::Result<()> {
        let state = self.state();
        state.do_exit.store(false, Ordering::Release);
        loop {
            match self.poll(None) {
                Ok(_) => {}
                // A signal interruption is an ordinary wakeup.
                Err(crate::Error::Io(ref err)) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
            self.dispatch();
            if state.do_exit.load(Ordering::Acquire) {
                return Ok(());
            }
        }
    }

    /// Instruct the loop to exit.
    ///
    /// Callable from any thread, including from inside a callback. A
    /// blocked [`poll`](EventLoop::poll) is woken up.
    pub fn exit(&self) {
        let state = self.state();
        state.do_exit.store(true, Ordering::Release);
        if !state.backend.exit() {
            self.interrupt();
        }
    }

    /// Trigger an immediate return from a blocked [`poll`](EventLoop::poll).
    pub fn interrupt(&self) {
        interrupt_on(self.state());
    }

    /// Ensure the worker pool behind this loop has at least `n` threads
    /// (`None` means one per available CPU).
    ///
    /// Must be called before the first work source is started. The loop
    /// keeps the pool alive until it is torn down.
    pub fn require_workers(&self, n: Option<usize>) -> crate::Result<()> {
        let state = self.state();
        state.backend.thread_pool_acquire(n)?;
        state.pool_refs.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// The backend's aggregation descriptor, for nesting this loop into a
    /// foreign event loop. Fails with
    /// [`Unsupported`](crate::Error::Unsupported) when the backend has none.
    pub fn get_fd(&self) -> crate::Result<RawFd> {
        self.state().backend.get_fd().ok_or(crate::Error::Unsupported)
    }
}

/// A borrowed, backend-facing view of an event loop
///
/// Backends receive this in their hooks to reach back into the core: emit
/// ready sources, start and stop internal helper sources, or wake the loop.
pub struct LoopHandle<'l> {
    pub(crate) inner: &'l SourceInner,
}

impl std::fmt::Debug for LoopHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LoopHandle { ... }")
    }
}

impl LoopHandle<'_> {
    /// The id of the loop, e.g. for later upgrade from a worker thread.
    pub fn id(&self) -> SourceId {
        self.inner.id
    }

    /// See [`EventLoop::emit`].
    pub fn emit(&self, src: &impl AsSource, revents: Event) {
        emit_on(loop_state(self.inner), src.as_source(), revents);
    }

    /// See [`EventLoop::start`].
    pub fn start(&self, src: &impl AsSource) -> crate::Result<()> {
        start_on(self.inner, src.as_source())
    }

    /// See [`EventLoop::stop`].
    pub fn stop(&self, src: &impl AsSource) -> crate::Result<()> {
        stop_on(self.inner, src.as_source())
    }

    /// See [`EventLoop::interrupt`].
    pub fn interrupt(&self) {
        interrupt_on(loop_state(self.inner));
    }
}

fn loop_state(inner: &SourceInner) -> &LoopState {
    match &inner.kind {
        Kind::Loop(state) => state,
        _ => unreachable!("loop handle must carry loop state"),
    }
}

fn interrupt_on(state: &LoopState) {
    if state.backend.capabilities().native_interrupt {
        state.backend.interrupt();
        return;
    }
    if let Some(wake) = state.wake.lock().unwrap().as_ref() {
        match unistd::write(wake.0, &[0u8]) {
            Ok(_) => {}
            // A full pipe already carries a pending wakeup.
            Err(Errno::EAGAIN) => {}
            Err(err) => log::warn!("[muxloop] failed to write wake byte: {:?}", err),
        }
    }
}

pub(crate) fn emit_on(state: &LoopState, src: &Source, revents: Event) {
    if let Some(fd_state) = src.fd_state() {
        // The atomic OR coalesces readiness between emit and dispatch: a
        // non-zero prior mask means the handler is already queued.
        let prior = fd_state.revents.fetch_or(revents.bits(), Ordering::AcqRel);
        if prior != 0 {
            return;
        }
    }
    state.queue.push(src);
}

pub(crate) fn start_on(loop_inner: &SourceInner, src: &Source) -> crate::Result<()> {
    if matches!(src.inner.kind, Kind::Loop(_)) {
        return Err(crate::Error::Unsupported);
    }

    let state = loop_state(loop_inner);
    let loop_id = loop_inner.id.as_u64();

    // Claiming the started slot also rejects a source started elsewhere.
    if src
        .inner
        .started_in
        .compare_exchange(0, loop_id, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(crate::Error::AlreadyStarted);
    }
    state.started.lock().unwrap().push(src.clone());

    let result = match &src.inner.kind {
        Kind::Fd(_) => state.backend.add_fd(&Handler { src: src.clone() }),
        Kind::Timer(timer) => {
            let duration = Duration::from_micros(timer.duration_us.load(Ordering::Acquire));
            if duration.is_zero() {
                // Fires exactly once on the next dispatch: take it out of
                // the started set again and queue the single invocation.
                stop_on(loop_inner, src)?;
                emit_on(state, src, Event::empty());
                return Ok(());
            }
            arm_timer(state, src, duration)
        }
        Kind::Ticker(ticker) => {
            let period = Duration::from_micros(ticker.duration_us.load(Ordering::Acquire));
            assert!(!period.is_zero(), "cannot start a ticker with a zero period");
            arm_timer(state, src, period)
        }
        Kind::Signal(_) => state
            .backend
            .add_signal(&LoopHandle { inner: loop_inner }, &Signal { src: src.clone() }),
        Kind::Work(_) => {
            state.backend.thread_pool_enqueue(loop_inner.id, src.id());
            Ok(())
        }
        Kind::Idle => {
            state.idles.lock().unwrap().push(src.clone());
            Ok(())
        }
        Kind::Loop(_) => unreachable!(),
    };

    if let Err(err) = result {
        // Reverse the insertion.
        state.started.lock().unwrap().retain(|s| !s.ptr_eq(src));
        src.inner.started_in.store(0, Ordering::Release);
        return Err(err);
    }
    Ok(())
}

fn arm_timer(state: &LoopState, src: &Source, duration: Duration) -> crate::Result<()> {
    let deadline = Instant::now() + duration;
    let is_earliest = {
        let mut timers = state.timers.lock().unwrap();
        let is_earliest = timers.iter().all(|entry| entry.deadline > deadline);
        timers.push(TimerEntry {
            deadline,
            src: src.clone(),
        });
        is_earliest
    };
    if is_earliest {
        if let Err(err) = state.backend.set_deadline(deadline) {
            state.timers.lock().unwrap().retain(|entry| !entry.src.ptr_eq(src));
            return Err(err);
        }
    }
    Ok(())
}

pub(crate) fn stop_on(loop_inner: &SourceInner, src: &Source) -> crate::Result<()> {
    if matches!(src.inner.kind, Kind::Loop(_)) {
        panic!("cannot stop an event loop through the source stop path");
    }

    let state = loop_state(loop_inner);
    let loop_id = loop_inner.id.as_u64();

    if src
        .inner
        .started_in
        .compare_exchange(loop_id, 0, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        // Not started on this loop: benign.
        return Ok(());
    }

    // Keep the source alive past the release of the loop's reference.
    let src = src.clone();
    state.started.lock().unwrap().retain(|s| !s.ptr_eq(&src));

    let result = match &src.inner.kind {
        Kind::Fd(_) => state.backend.del_fd(&Handler { src: src.clone() }),
        Kind::Timer(_) | Kind::Ticker(_) => {
            state.timers.lock().unwrap().retain(|entry| !entry.src.ptr_eq(&src));
            Ok(())
        }
        Kind::Signal(_) => state
            .backend
            .del_signal(&LoopHandle { inner: loop_inner }, &Signal { src: src.clone() }),
        // The worker finishes an in-flight closure on its own.
        Kind::Work(_) => Ok(()),
        Kind::Idle => {
            state.idles.lock().unwrap().retain(|s| !s.ptr_eq(&src));
            Ok(())
        }
        Kind::Loop(_) => unreachable!(),
    };

    // Cancel a pending delivery, except for a work source whose done
    // callback was already emitted by the worker: that one still fires.
    if !matches!(src.inner.kind, Kind::Work(_)) {
        state.queue.purge(&src);
    }

    result
}

pub(crate) fn dispatch_on(loop_inner: &SourceInner) {
    let state = loop_state(loop_inner);

    // Phase 1: drain expired timers, earliest deadline first. The emitted
    // sources run their callbacks in phase 2.
    let now = Instant::now();
    loop {
        let due = {
            let mut timers = state.timers.lock().unwrap();
            let idx = timers
                .iter()
                .enumerate()
                .min_by_key(|(_, entry)| entry.deadline)
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(idx, _)| idx);
            match idx {
                Some(idx) if matches!(timers[idx].src.inner.kind, Kind::Ticker(_)) => {
                    let period = match &timers[idx].src.inner.kind {
                        Kind::Ticker(ticker) => {
                            Duration::from_micros(ticker.duration_us.load(Ordering::Acquire))
                        }
                        _ => unreachable!(),
                    };
                    timers[idx].deadline += period;
                    Some((timers[idx].src.clone(), false))
                }
                Some(idx) => Some((timers.remove(idx).src, true)),
                None => None,
            }
        };
        let Some((src, one_shot)) = due else { break };
        if one_shot {
            // Disarm before emitting so the callback finds the timer
            // already stopped and the emit is not cancelled.
            let _ = stop_on(loop_inner, &src);
        }
        emit_on(state, &src, Event::empty());
    }

    // Phase 2: drain the event queue, FIFO. Sources emitted from inside a
    // callback are dispatched within the same pass.
    while let Some(src) = state.queue.pop() {
        src.invoke();
        if let Some(fd_state) = src.fd_state() {
            fd_state.revents.store(0, Ordering::Release);
            if state.backend.capabilities().edge_triggered
                && src.inner.started_in.load(Ordering::Acquire) == loop_inner.id.as_u64()
            {
                if let Err(err) = state.backend.mod_fd(&Handler { src: src.clone() }) {
                    log::warn!("[muxloop] failed to re-arm fd handler: {:?}", err);
                }
            }
        }
        // Dropping `src` releases the reference the emit took.
    }

    // Phase 3: idles stay armed across passes.
    let idles: Vec<Source> = state.idles.lock().unwrap().clone();
    for idle in &idles {
        idle.invoke();
    }

    // Hand the earliest remaining deadline to the backend and let it resume.
    let next = {
        let timers = state.timers.lock().unwrap();
        timers.iter().map(|entry| entry.deadline).min()
    };
    if let Some(deadline) = next {
        if let Err(err) = state.backend.set_deadline(deadline) {
            log::warn!("[muxloop] failed to arm backend deadline: {:?}", err);
        }
    }
    state.backend.post_dispatch();
}

// Ordered teardown, run by the finalizer of the loop source itself once the
// last handle is gone: stop whatever is still started (which finalizes most
// sources), give back the worker pool, and release the queued references.
pub(crate) fn teardown(loop_inner: &SourceInner) {
    let state = loop_state(loop_inner);

    loop {
        let src = state.started.lock().unwrap().last().cloned();
        let Some(src) = src else { break };
        let _ = stop_on(loop_inner, &src);
    }

    let pool_refs = state.pool_refs.swap(0, Ordering::AcqRel);
    for _ in 0..pool_refs {
        state.backend.thread_pool_release();
    }

    state.queue.clear();
    // The backend state and the wake-pipe write end drop with the loop; the
    // read end closed when the internal handler's payload was released
    // above.
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::EventLoop;
    use crate::sources::{Idle, Ticker, Timer};
    use crate::{Error, Event, Source};

    #[test]
    fn start_is_exclusive() {
        let evl = EventLoop::new().unwrap();
        let other = EventLoop::new().unwrap();

        let idle = Idle::new(|_| {});
        evl.start(&idle).unwrap();
        assert!(evl.is_started(&idle));
        assert!(!other.is_started(&idle));

        assert!(matches!(evl.start(&idle), Err(Error::AlreadyStarted)));
        assert!(matches!(other.start(&idle), Err(Error::AlreadyStarted)));

        evl.stop(&idle).unwrap();
        assert!(!evl.is_started(&idle));

        // A stopped source may move to another loop.
        other.start(&idle).unwrap();
        assert!(other.is_started(&idle));
    }

    #[test]
    fn stop_unstarted_is_benign() {
        let evl = EventLoop::new().unwrap();
        let idle = Idle::new(|_| {});
        evl.stop(&idle).unwrap();
        evl.stop(&idle).unwrap();
    }

    #[test]
    fn emit_coalesces_until_dispatched() {
        let evl = EventLoop::new().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let cb_hits = hits.clone();
        // A long timer is a convenient quiet source; it is never armed here.
        let timer = Timer::new(Duration::from_secs(100), move |_| {
            cb_hits.fetch_add(1, Ordering::SeqCst);
        });

        evl.emit(&timer, Event::empty());
        evl.emit(&timer, Event::empty());
        evl.dispatch();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // A fresh emit queues it again.
        evl.emit(&timer, Event::empty());
        evl.dispatch();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stop_cancels_pending_delivery() {
        let evl = EventLoop::new().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let cb_hits = hits.clone();
        let timer = Timer::new(Duration::from_secs(100), move |_| {
            cb_hits.fetch_add(1, Ordering::SeqCst);
        });

        evl.start(&timer).unwrap();
        evl.emit(&timer, Event::empty());
        evl.stop(&timer).unwrap();

        evl.dispatch();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn idles_stay_armed() {
        let evl = EventLoop::new().unwrap();

        let hits = Arc::new(AtomicUsize::new(0));
        let cb_hits = hits.clone();
        let idle = Idle::new(move |_| {
            cb_hits.fetch_add(1, Ordering::SeqCst);
        });

        evl.start(&idle).unwrap();
        evl.dispatch();
        evl.dispatch();
        evl.dispatch();
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        evl.stop(&idle).unwrap();
        evl.dispatch();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    #[should_panic]
    fn zero_period_ticker_aborts() {
        let evl = EventLoop::new().unwrap();
        let ticker = Ticker::new(Duration::ZERO, |_| {});
        let _ = evl.start(&ticker);
    }

    #[test]
    fn default_slot_holds_no_reference() {
        let evl = EventLoop::new().unwrap();
        let id = evl.id();
        evl.set_default();

        assert_eq!(EventLoop::get_default().unwrap().id(), id);

        drop(evl);
        assert!(EventLoop::get_default().is_none());
        assert!(Source::upgrade(id).is_none());
    }

    #[test]
    fn loop_is_a_source() {
        let evl = EventLoop::new().unwrap();
        let id = evl.id();

        let strong = Source::upgrade(id).expect("live loop must upgrade");
        let again = EventLoop::try_from(strong).expect("upgraded source is a loop");
        assert_eq!(again.id(), id);
    }
}
