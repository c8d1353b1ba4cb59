use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use muxloop::{EventLoop, Source, SourceId, Ticker, Timer};

fn exit_loop(id: SourceId) {
    if let Some(src) = Source::upgrade(id) {
        if let Ok(evl) = EventLoop::try_from(src) {
            evl.exit();
        }
    }
}

#[test]
fn ticker_fires_ten_times() {
    let evl = EventLoop::new().unwrap();
    let loop_id = evl.id();

    let count = Arc::new(AtomicUsize::new(0));
    let cb_count = count.clone();
    let ticker = Ticker::new(Duration::from_micros(1000), move |_| {
        if cb_count.fetch_add(1, Ordering::SeqCst) + 1 == 10 {
            exit_loop(loop_id);
        }
    });
    evl.start(&ticker).unwrap();

    let before = Instant::now();
    evl.run().unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 10);
    assert!(before.elapsed() >= Duration::from_micros(10_000));

    // A ticker stays armed until it is stopped.
    assert!(evl.is_started(&ticker));
    evl.stop(&ticker).unwrap();
}

#[test]
fn one_shot_timer_runs_once() {
    let evl = EventLoop::new().unwrap();
    let loop_id = evl.id();

    let count = Arc::new(AtomicUsize::new(0));
    let cb_count = count.clone();
    let timer = Timer::new(Duration::from_micros(500), move |_| {
        cb_count.fetch_add(1, Ordering::SeqCst);
        exit_loop(loop_id);
    });
    evl.start(&timer).unwrap();
    assert!(evl.is_started(&timer));

    evl.run().unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(!evl.is_started(&timer));

    // Nothing else is pending for it.
    let _ = evl.poll(Some(Duration::from_millis(5)));
    evl.dispatch();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn zero_duration_timer_fires_on_next_dispatch() {
    let evl = EventLoop::new().unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let cb_count = count.clone();
    let timer = Timer::new(Duration::ZERO, move |_| {
        cb_count.fetch_add(1, Ordering::SeqCst);
    });

    evl.start(&timer).unwrap();
    // It is already out of the started set and fires on the next pass.
    assert!(!evl.is_started(&timer));

    evl.dispatch();
    assert_eq!(count.load(Ordering::SeqCst), 1);

    evl.dispatch();
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[test]
fn timers_fire_in_deadline_order() {
    let evl = EventLoop::new().unwrap();
    let loop_id = evl.id();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut timers = Vec::new();
    for (label, ms) in [(1u32, 30u64), (2, 10), (3, 60)] {
        let cb_order = order.clone();
        timers.push(Timer::new(Duration::from_millis(ms), move |_| {
            let mut order = cb_order.lock().unwrap();
            order.push(label);
            if order.len() == 3 {
                exit_loop(loop_id);
            }
        }));
    }
    for timer in &timers {
        evl.start(timer).unwrap();
    }

    evl.run().unwrap();
    assert_eq!(*order.lock().unwrap(), vec![2, 1, 3]);
}

#[test]
fn ticker_can_stop_itself() {
    let evl = EventLoop::new().unwrap();
    let loop_id = evl.id();

    let count = Arc::new(AtomicUsize::new(0));
    let cb_count = count.clone();
    let ticker = Ticker::new(Duration::from_micros(800), move |ticker| {
        if cb_count.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
            let evl = EventLoop::try_from(Source::upgrade(loop_id).unwrap()).unwrap();
            evl.stop(ticker).unwrap();
            evl.exit();
        }
    });
    evl.start(&ticker).unwrap();

    evl.run().unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 3);
    assert!(!evl.is_started(&ticker));
}
