//! Off-thread work items

use crate::source::{Kind, Source, WorkState};

/// An event source running a closure on the worker pool
///
/// Starting a work source enqueues it for the thread pool acquired through
/// [`EventLoop::require_workers`](crate::EventLoop::require_workers). A
/// worker runs the work closure off-thread and then emits the source back to
/// its loop, so the done callback runs on the dispatch thread; the worker
/// also stops the source, so it is no longer started by the time the done
/// callback fires.
///
/// Stopping a work source does not cancel a work closure that is already
/// executing, and its done callback may still fire afterwards.
pub struct Work {
    pub(crate) src: Source,
}

impl Work {
    /// Create a new work item from the off-thread closure and the done
    /// callback.
    pub fn new<W, D>(mut work: W, mut done: D) -> Work
    where
        W: FnMut(&Work) + Send + 'static,
        D: FnMut(&Work) + Send + 'static,
    {
        let state = WorkState {
            work_fn: std::sync::Mutex::new(Box::new(move |src: &Source| {
                work(&Work { src: src.clone() })
            })),
        };
        let src = Source::new_inner(
            Kind::Work(state),
            Some(Box::new(move |src: &Source| {
                done(&Work { src: src.clone() })
            })),
        );
        Work { src }
    }

    /// Run the work closure. Called by worker threads.
    pub(crate) fn run_work(&self) {
        let state = match &self.src.inner.kind {
            Kind::Work(state) => state,
            _ => unreachable!("work handle must carry work state"),
        };
        let mut work_fn = state.work_fn.lock().unwrap();
        (*work_fn)(&self.src);
    }
}

super::typed_source!(Work, Work);
