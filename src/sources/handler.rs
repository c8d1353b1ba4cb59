//! File-descriptor readiness handlers

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::source::{FdState, Kind, Source};
use crate::Event;

/// An event source watching a file descriptor
///
/// The handler borrows the descriptor: the caller keeps ownership and must
/// keep it open for as long as the handler is started. A fresh handler is
/// interested in read and out-of-band events; use
/// [`set_event_mask`](Handler::set_event_mask) to change that.
pub struct Handler {
    pub(crate) src: Source,
}

impl Handler {
    /// Create a new handler for `fd`.
    ///
    /// The callback is invoked on the dispatch thread of the loop the
    /// handler is started on whenever the descriptor becomes ready;
    /// [`revents`](Handler::revents) reports the pending readiness from
    /// inside the callback.
    pub fn new<F>(fd: RawFd, mut callback: F) -> Handler
    where
        F: FnMut(&Handler) + Send + 'static,
    {
        let state = FdState {
            fd,
            event_mask: AtomicU32::new(Event::DEFAULT_MASK.bits()),
            revents: AtomicU32::new(0),
        };
        let src = Source::new_inner(
            Kind::Fd(state),
            Some(Box::new(move |src: &Source| {
                callback(&Handler { src: src.clone() })
            })),
        );
        Handler { src }
    }

    /// The watched file descriptor.
    pub fn fd(&self) -> RawFd {
        self.state().fd
    }

    /// The requested event mask.
    pub fn event_mask(&self) -> Event {
        Event::from_bits_truncate(self.state().event_mask.load(Ordering::Acquire))
    }

    /// Change the requested event mask.
    ///
    /// Takes effect immediately: if the handler is started, the backend
    /// registration is updated before this returns.
    pub fn set_event_mask(&self, mask: Event) {
        self.state().event_mask.store(mask.bits(), Ordering::Release);
        if let Some(evl) = self.src.started_loop() {
            if let Err(err) = evl.state().backend.mod_fd(self) {
                log::warn!("[muxloop] failed to update fd registration: {:?}", err);
            }
        }
    }

    /// The readiness accumulated since the last dispatch of this handler.
    pub fn revents(&self) -> Event {
        Event::from_bits_truncate(self.state().revents.load(Ordering::Acquire))
    }

    fn state(&self) -> &FdState {
        self.src.fd_state().expect("handler source must carry fd state")
    }
}

super::typed_source!(Handler, FdHandler);
