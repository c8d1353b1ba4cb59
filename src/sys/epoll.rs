//! The epoll readiness engine
//!
//! One epoll instance multiplexes everything: fd handlers are registered
//! with their source id as the epoll token, the armed deadline is a timerfd
//! under a reserved token, and each signal source gets a signalfd wrapped in
//! an internal fd handler. The engine is level-triggered and has no native
//! interrupt, so the loop drives wakeups through its self-pipe.

use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use nix::sys::signal::{pthread_sigmask, SigSet, Signal as NixSignal, SigmaskHow};
use nix::sys::signalfd::{SfdFlags, SignalFd};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use nix::unistd;

use crate::backend::Backend;
use crate::loop_logic::LoopHandle;
use crate::registry::SourceId;
use crate::source::Source;
use crate::sources::{Handler, Signal};
use crate::{AsSource, Event};

/// The epoll token of the deadline timerfd. Source ids are assigned from 1
/// upwards, so this value never collides with one.
const DEADLINE_TOKEN: u64 = u64::MAX;

/// The epoll-based readiness engine, the default on Linux
pub struct EpollEngine {
    epoll_fd: RawFd,
    timer_fd: TimerFd,
}

fn mask_to_flags(mask: Event) -> EpollFlags {
    let mut flags = EpollFlags::empty();
    if mask.contains(Event::READ) {
        flags |= EpollFlags::EPOLLIN;
    }
    if mask.contains(Event::WRITE) {
        flags |= EpollFlags::EPOLLOUT;
    }
    if mask.contains(Event::OOB) {
        flags |= EpollFlags::EPOLLPRI;
    }
    flags
}

fn flags_to_events(flags: EpollFlags) -> Event {
    let mut events = Event::empty();
    // Hangup and error states surface as readability so the handler gets to
    // observe the EOF or the failure.
    if flags.intersects(EpollFlags::EPOLLIN | EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR) {
        events |= Event::READ;
    }
    if flags.intersects(EpollFlags::EPOLLOUT) {
        events |= Event::WRITE;
    }
    if flags.intersects(EpollFlags::EPOLLPRI) {
        events |= Event::OOB;
    }
    events
}

impl EpollEngine {
    /// Create a new engine: an epoll instance with the deadline timerfd
    /// already registered.
    pub fn new() -> crate::Result<EpollEngine> {
        let epoll_fd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?;

        let result: crate::Result<TimerFd> = (|| {
            let timer_fd = TimerFd::new(
                ClockId::CLOCK_MONOTONIC,
                TimerFlags::TFD_CLOEXEC | TimerFlags::TFD_NONBLOCK,
            )?;
            let mut event = EpollEvent::new(EpollFlags::EPOLLIN, DEADLINE_TOKEN);
            epoll_ctl(
                epoll_fd,
                EpollOp::EpollCtlAdd,
                timer_fd.as_raw_fd(),
                &mut event,
            )?;
            Ok(timer_fd)
        })();

        match result {
            Ok(timer_fd) => Ok(EpollEngine { epoll_fd, timer_fd }),
            Err(err) => {
                let _ = unistd::close(epoll_fd);
                Err(err)
            }
        }
    }
}

impl Backend for EpollEngine {
    fn get_fd(&self) -> Option<RawFd> {
        Some(self.epoll_fd)
    }

    fn poll(&self, evl: &LoopHandle<'_>, timeout: Option<Duration>) -> crate::Result<usize> {
        let timeout_ms: isize = match timeout {
            None => -1,
            Some(timeout) if timeout.is_zero() => 0,
            Some(timeout) => {
                // Round up so a sub-millisecond wait does not spin.
                let mut ms = timeout.as_millis();
                if Duration::from_millis(ms as u64) < timeout {
                    ms += 1;
                }
                ms.min(i32::MAX as u128) as isize
            }
        };

        let mut buffer = [EpollEvent::empty(); 32];
        let n_ready = epoll_wait(self.epoll_fd, &mut buffer, timeout_ms)?;

        for event in buffer.iter().take(n_ready) {
            if event.data() == DEADLINE_TOKEN {
                // Disarm the timerfd; it is non-blocking and has already
                // fired, so a failed read just means a racing disarm.
                let _ = self.timer_fd.wait();
                continue;
            }

            let Some(id) = SourceId::from_u64(event.data()) else {
                continue;
            };
            match Source::upgrade(id) {
                Some(src) => evl.emit(&src, flags_to_events(event.events())),
                None => log::warn!(
                    "[muxloop] readiness for a source that no longer exists: {:?}",
                    id
                ),
            }
        }

        Ok(n_ready)
    }

    fn add_fd(&self, handler: &Handler) -> crate::Result<()> {
        let mut event = EpollEvent::new(
            mask_to_flags(handler.event_mask()),
            handler.as_source().id().as_u64(),
        );
        epoll_ctl(self.epoll_fd, EpollOp::EpollCtlAdd, handler.fd(), &mut event)
            .map_err(Into::into)
    }

    fn mod_fd(&self, handler: &Handler) -> crate::Result<()> {
        let mut event = EpollEvent::new(
            mask_to_flags(handler.event_mask()),
            handler.as_source().id().as_u64(),
        );
        epoll_ctl(self.epoll_fd, EpollOp::EpollCtlMod, handler.fd(), &mut event)
            .map_err(Into::into)
    }

    fn del_fd(&self, handler: &Handler) -> crate::Result<()> {
        epoll_ctl(self.epoll_fd, EpollOp::EpollCtlDel, handler.fd(), None).map_err(Into::into)
    }

    fn add_signal(&self, evl: &LoopHandle<'_>, signal: &Signal) -> crate::Result<()> {
        let signo = NixSignal::try_from(signal.signo())?;
        let mut set = SigSet::empty();
        set.add(signo);

        // The signal must be blocked before the signalfd can pick it up.
        // It stays blocked for the life of the process: unblocking after a
        // del_signal would re-expose the default disposition to a signal
        // that may already be pending.
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None)?;

        let sfd = SignalFd::with_flags(&set, SfdFlags::SFD_NONBLOCK | SfdFlags::SFD_CLOEXEC)?;
        let raw = sfd.as_raw_fd();

        // The signalfd is wrapped in an internal fd handler. Its callback
        // runs on the dispatch thread and forwards the delivery to the
        // signal source by id, so a concurrently finalized source is simply
        // skipped.
        let target_id = signal.as_source().id();
        let loop_id = evl.id();
        let handler = Handler::new(raw, move |handler: &Handler| {
            handler.as_source().with_userdata(|sfd: Option<&mut SignalFd>| {
                if let Some(sfd) = sfd {
                    while let Ok(Some(_)) = sfd.read_signal() {}
                }
            });

            let Some(target) = Source::upgrade(target_id) else {
                return;
            };
            let Some(evl) = Source::upgrade(loop_id)
                .and_then(|src| crate::EventLoop::try_from(src).ok())
            else {
                return;
            };
            evl.emit(&target, Event::empty());
        });
        // The payload owns the signalfd; releasing it closes the descriptor.
        handler.src.set_userdata(sfd);

        evl.start(&handler)?;
        signal.as_source().set_backend_data(handler);
        Ok(())
    }

    fn del_signal(&self, evl: &LoopHandle<'_>, signal: &Signal) -> crate::Result<()> {
        let handler = signal
            .as_source()
            .take_backend_data()
            .and_then(|data| data.downcast::<Handler>().ok());
        if let Some(handler) = handler {
            evl.stop(&*handler)?;
        }
        Ok(())
    }

    fn set_deadline(&self, deadline: Instant) -> crate::Result<()> {
        let delay = deadline.saturating_duration_since(Instant::now());
        // A zero it_value would disarm the timerfd; an already-elapsed
        // deadline must still fire.
        let delay = delay.max(Duration::from_nanos(1));
        self.timer_fd
            .set(
                Expiration::OneShot(TimeSpec::from_duration(delay)),
                TimerSetTimeFlags::empty(),
            )
            .map_err(Into::into)
    }
}

impl Drop for EpollEngine {
    fn drop(&mut self) {
        let _ = unistd::close(self.epoll_fd);
    }
}
