//! Idle callbacks

use crate::source::{Kind, Source};

/// An event source invoked at the end of every dispatch pass
///
/// Unlike timers, idles stay armed: once started, the callback runs on each
/// dispatch until the source is stopped.
pub struct Idle {
    pub(crate) src: Source,
}

impl Idle {
    /// Create a new idle source.
    pub fn new<F>(mut callback: F) -> Idle
    where
        F: FnMut(&Idle) + Send + 'static,
    {
        let src = Source::new_inner(
            Kind::Idle,
            Some(Box::new(move |src: &Source| {
                callback(&Idle { src: src.clone() })
            })),
        );
        Idle { src }
    }
}

super::typed_source!(Idle, Idle);
