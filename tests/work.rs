use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use muxloop::{AsSource, EventLoop, Source, SourceId, Work};

fn exit_loop(id: SourceId) {
    if let Some(src) = Source::upgrade(id) {
        if let Ok(evl) = EventLoop::try_from(src) {
            evl.exit();
        }
    }
}

#[test]
fn work_round_trip() {
    let evl = EventLoop::new().unwrap();
    evl.require_workers(Some(2)).unwrap();
    let loop_id = evl.id();

    let worker_thread = Arc::new(Mutex::new(None::<ThreadId>));
    let done_thread = Arc::new(Mutex::new(None::<ThreadId>));

    let work_tid = worker_thread.clone();
    let done_tid = done_thread.clone();
    let work = Work::new(
        move |_| {
            *work_tid.lock().unwrap() = Some(std::thread::current().id());
        },
        move |_| {
            *done_tid.lock().unwrap() = Some(std::thread::current().id());
            exit_loop(loop_id);
        },
    );
    evl.start(&work).unwrap();

    evl.run().unwrap();

    let worker = (*worker_thread.lock().unwrap()).expect("work closure ran");
    let done = (*done_thread.lock().unwrap()).expect("done callback ran");
    // The closure ran off-thread, the done callback on the dispatch thread.
    assert_eq!(done, std::thread::current().id());
    assert_ne!(worker, done);

    // The worker already took it out of the started set.
    assert!(!evl.is_started(&work));
}

#[test]
fn userdata_crosses_the_worker_boundary() {
    let evl = EventLoop::new().unwrap();
    evl.require_workers(None).unwrap();
    let loop_id = evl.id();

    let result = Arc::new(AtomicUsize::new(0));
    let cb_result = result.clone();
    let work = Work::new(
        |work| {
            // Computed off-thread, consumed by the done callback.
            work.as_source().set_userdata(21usize * 2);
        },
        move |work| {
            let value = work
                .as_source()
                .with_userdata(|value: Option<&mut usize>| *value.unwrap());
            cb_result.store(value, Ordering::SeqCst);
            exit_loop(loop_id);
        },
    );
    evl.start(&work).unwrap();

    evl.run().unwrap();
    assert_eq!(result.load(Ordering::SeqCst), 42);
}

#[test]
fn several_work_items_complete() {
    let evl = EventLoop::new().unwrap();
    evl.require_workers(Some(3)).unwrap();
    let loop_id = evl.id();

    let ran = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    let mut works = Vec::new();
    for _ in 0..4 {
        let cb_ran = ran.clone();
        let cb_done = done.clone();
        works.push(Work::new(
            move |_| {
                cb_ran.fetch_add(1, Ordering::SeqCst);
            },
            move |_| {
                if cb_done.fetch_add(1, Ordering::SeqCst) + 1 == 4 {
                    exit_loop(loop_id);
                }
            },
        ));
    }
    for work in &works {
        evl.start(work).unwrap();
    }

    evl.run().unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 4);
    assert_eq!(done.load(Ordering::SeqCst), 4);
    for work in &works {
        assert!(!evl.is_started(work));
    }
}
