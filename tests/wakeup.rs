use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use muxloop::{AsSource, EventLoop, Idle, Source};

#[test]
fn interrupt_unblocks_poll() {
    let evl = EventLoop::new().unwrap();

    let remote = evl.clone();
    let waker = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        remote.interrupt();
    });

    let before = Instant::now();
    evl.poll(None).unwrap();
    assert!(before.elapsed() < Duration::from_secs(5));

    evl.dispatch();
    waker.join().unwrap();
}

#[test]
fn exit_from_another_thread_stops_run() {
    let evl = EventLoop::new().unwrap();

    let remote = evl.clone();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        remote.exit();
    });

    evl.run().unwrap();
    stopper.join().unwrap();
}

#[test]
fn upgrade_races_with_finalization() {
    // Upgrade ids from another thread after half the sources were
    // finalized; an upgrade must either fail or return a usable handle.
    let mut ids = Vec::new();
    let mut kept = Vec::new();
    for n in 0..100 {
        let idle = Idle::new(|_| {});
        ids.push(idle.as_source().id());
        // Half of them stay alive, the other half finalizes right away.
        if n % 2 == 0 {
            kept.push(idle);
        }
    }

    let hits = Arc::new(AtomicUsize::new(0));
    let cb_hits = hits.clone();
    let prober = std::thread::spawn(move || {
        for _ in 0..10 {
            for &id in &ids {
                if let Some(src) = Source::upgrade(id) {
                    // The handle must be safely usable and releasable.
                    assert!(src.id() == id);
                    cb_hits.fetch_add(1, Ordering::SeqCst);
                }
            }
        }
    });

    prober.join().unwrap();
    // Exactly the kept half stayed upgradeable.
    assert_eq!(hits.load(Ordering::SeqCst), 500);
    drop(kept);
}
