//! The default worker pool
//!
//! One process-global pool serves every loop that does not bring its own
//! through the backend hooks. Workers share a FIFO of (loop id, work id)
//! pairs; ids instead of references keep the pool from ever owning a source
//! or a loop — a worker upgrades the ids when it gets to the entry and simply
//! skips work whose loop or source has meanwhile gone away.
//!
//! Shutdown leaves a sentinel entry at the head of the queue: every worker
//! that wakes up sees it, leaves it in place for its siblings, and exits.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, OnceLock};
use std::thread::{self, JoinHandle};

use nix::sys::signal::{pthread_sigmask, SigSet, Signal as NixSignal, SigmaskHow};

use crate::event::Event;
use crate::loop_logic::EventLoop;
use crate::registry::SourceId;
use crate::source::Source;
use crate::sources::Work;

struct Entry {
    evl: Option<SourceId>,
    /// `None` marks the shutdown sentinel.
    work: Option<SourceId>,
}

struct PoolState {
    queue: VecDeque<Entry>,
    workers: Vec<JoinHandle<()>>,
    users: usize,
}

struct Pool {
    state: Mutex<PoolState>,
    cond: Condvar,
}

static POOL: OnceLock<Pool> = OnceLock::new();

fn pool() -> &'static Pool {
    POOL.get_or_init(|| Pool {
        state: Mutex::new(PoolState {
            queue: VecDeque::new(),
            workers: Vec::new(),
            users: 0,
        }),
        cond: Condvar::new(),
    })
}

/// Ensure at least `n` workers are running (`None`: one per available CPU)
/// and take a user reference.
pub(crate) fn acquire(n: Option<usize>) -> crate::Result<()> {
    let wanted = match n {
        Some(n) => n,
        None => thread::available_parallelism().map(usize::from).unwrap_or(1),
    };

    let pool = pool();
    let mut state = pool.state.lock().unwrap();
    // A sentinel left over from a concurrent shutdown must not kill the
    // fresh workers.
    state.queue.retain(|entry| entry.work.is_some());
    while state.workers.len() < wanted {
        let worker = thread::Builder::new()
            .name("muxloop-worker".into())
            .spawn(worker_main)?;
        state.workers.push(worker);
    }
    state.users += 1;
    Ok(())
}

/// Drop a user reference; the last one reaps the workers.
pub(crate) fn release() {
    let pool = pool();
    let mut state = pool.state.lock().unwrap();
    state.users = state.users.saturating_sub(1);
    if state.users > 0 {
        return;
    }

    // The sentinel goes behind any remaining work and stays at the head once
    // reached, so each worker drains outstanding entries and then exits.
    state.queue.push_back(Entry {
        evl: None,
        work: None,
    });
    pool.cond.notify_all();

    let workers = std::mem::take(&mut state.workers);
    drop(state);
    for worker in workers {
        // Loop teardown can run on a worker when it held the last handle;
        // that worker cannot join itself and exits via the sentinel.
        if worker.thread().id() == thread::current().id() {
            continue;
        }
        let _ = worker.join();
    }

    let mut state = pool.state.lock().unwrap();
    if state.users == 0 {
        state.queue.clear();
    }
}

/// Queue a started work source for execution.
pub(crate) fn enqueue(evl: SourceId, work: SourceId) {
    let pool = pool();
    let mut state = pool.state.lock().unwrap();
    state.queue.push_back(Entry {
        evl: Some(evl),
        work: Some(work),
    });
    pool.cond.notify_one();
}

enum Dequeued {
    Task {
        evl: Option<SourceId>,
        work: SourceId,
    },
    Shutdown,
}

fn dequeue() -> Dequeued {
    let pool = pool();
    let mut state = pool.state.lock().unwrap();
    loop {
        match state.queue.front().map(|entry| entry.work.is_none()) {
            // The sentinel is left in place for the other workers.
            Some(true) => return Dequeued::Shutdown,
            Some(false) => {
                let entry = state.queue.pop_front().unwrap();
                return Dequeued::Task {
                    evl: entry.evl,
                    work: entry.work.unwrap(),
                };
            }
            None => state = pool.cond.wait(state).unwrap(),
        }
    }
}

fn worker_main() {
    // Workers never take signal deliveries, except for terminated children.
    let mut mask = SigSet::empty();
    for signal in NixSignal::iterator() {
        if signal != NixSignal::SIGCHLD {
            mask.add(signal);
        }
    }
    let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&mask), None);

    loop {
        match dequeue() {
            Dequeued::Shutdown => break,
            Dequeued::Task { evl, work } => run_task(evl, work),
        }
    }
}

fn run_task(evl_id: Option<SourceId>, work_id: SourceId) {
    let work = match Source::upgrade(work_id).map(Work::try_from) {
        Some(Ok(work)) => work,
        // The source was released before a worker got to it.
        _ => return,
    };

    work.run_work();

    // Report completion: the done callback must run on the dispatch thread,
    // so emit the source back to its loop (if the loop is still alive), take
    // it out of the started set, and kick a potentially blocked poll.
    let evl = evl_id
        .and_then(Source::upgrade)
        .and_then(|src| EventLoop::try_from(src).ok());
    if let Some(evl) = evl {
        evl.emit(&work, Event::empty());
        let _ = evl.stop(&work);
        evl.interrupt();
    }
}
