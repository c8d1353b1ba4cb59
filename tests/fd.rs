use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::fcntl::OFlag;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::{close, pipe2, read, write};

use muxloop::{Event, EventLoop, Handler};

#[test]
fn readiness_is_coalesced_until_drained() {
    let evl = EventLoop::new().unwrap();
    let (rfd, wfd) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).unwrap();

    // Two bytes before any dispatch must still be one invocation.
    write(wfd, &[1u8, 2u8]).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let cb_hits = hits.clone();
    let handler = Handler::new(rfd, move |handler| {
        assert!(handler.revents().contains(Event::READ));
        // Read a single byte, leaving the rest pending.
        let mut byte = [0u8; 1];
        read(handler.fd(), &mut byte).unwrap();
        cb_hits.fetch_add(1, Ordering::SeqCst);
    });
    evl.start(&handler).unwrap();

    evl.poll(Some(Duration::from_millis(500))).unwrap();
    evl.dispatch();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // The remaining byte is reported again on the next pass.
    evl.poll(Some(Duration::from_millis(500))).unwrap();
    evl.dispatch();
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    evl.stop(&handler).unwrap();
    close(rfd).unwrap();
    close(wfd).unwrap();
}

#[test]
fn write_interest() {
    let evl = EventLoop::new().unwrap();
    let loop_id = evl.id();
    let (rfd, wfd) = pipe2(OFlag::O_CLOEXEC | OFlag::O_NONBLOCK).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let cb_hits = hits.clone();
    let handler = Handler::new(wfd, move |handler| {
        assert!(handler.revents().contains(Event::WRITE));
        cb_hits.fetch_add(1, Ordering::SeqCst);
        if let Some(src) = muxloop::Source::upgrade(loop_id) {
            EventLoop::try_from(src).unwrap().exit();
        }
    });
    handler.set_event_mask(Event::WRITE);
    evl.start(&handler).unwrap();

    // An empty pipe is immediately writable.
    evl.run().unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    evl.stop(&handler).unwrap();
    close(rfd).unwrap();
    close(wfd).unwrap();
}

#[test]
fn event_mask_update_takes_effect_while_started() {
    let evl = EventLoop::new().unwrap();
    let (sock1, sock2) = socketpair(
        AddressFamily::Unix,
        SockType::Stream,
        None,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
    )
    .unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let cb_hits = hits.clone();
    let handler = Handler::new(sock1, move |handler| {
        assert!(handler.revents().contains(Event::WRITE));
        cb_hits.fetch_add(1, Ordering::SeqCst);
    });
    evl.start(&handler).unwrap();

    // Nothing to read yet.
    evl.poll(Some(Duration::from_millis(20))).unwrap();
    evl.dispatch();
    assert_eq!(hits.load(Ordering::SeqCst), 0);

    // Switching to write interest re-arms the backend right away.
    handler.set_event_mask(Event::WRITE);
    evl.poll(Some(Duration::from_millis(500))).unwrap();
    evl.dispatch();
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    evl.stop(&handler).unwrap();
    close(sock1).unwrap();
    close(sock2).unwrap();
}

#[test]
fn loop_exposes_backend_fd() {
    let evl = EventLoop::new().unwrap();
    assert!(evl.get_fd().unwrap() >= 0);
}
