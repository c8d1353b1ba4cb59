//! Process-signal event sources

use crate::source::{Kind, SignalState, Source};

/// An event source firing when a process signal is delivered
///
/// The backend takes care of routing the signal to the loop; the callback
/// runs on the dispatch thread like every other callback, so it is not
/// restricted to async-signal-safe operations.
pub struct Signal {
    pub(crate) src: Source,
}

impl Signal {
    /// Create a new source for the signal number `signo`.
    pub fn new<F>(signo: i32, mut callback: F) -> Signal
    where
        F: FnMut(&Signal) + Send + 'static,
    {
        let src = Source::new_inner(
            Kind::Signal(SignalState { signo }),
            Some(Box::new(move |src: &Source| {
                callback(&Signal { src: src.clone() })
            })),
        );
        Signal { src }
    }

    /// The watched signal number.
    pub fn signo(&self) -> i32 {
        match &self.src.inner.kind {
            Kind::Signal(state) => state.signo,
            _ => unreachable!("signal handle must carry signal state"),
        }
    }
}

super::typed_source!(Signal, Signal);
