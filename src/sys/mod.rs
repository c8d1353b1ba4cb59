//! The default readiness engines
//!
//! Concrete [`Backend`](crate::Backend) implementations shipped with the
//! crate. [`EventLoop::new`](crate::EventLoop::new) picks the engine for the
//! target platform; alternative engines plug in through
//! [`EventLoop::with_backend`](crate::EventLoop::with_backend).

#[cfg(target_os = "linux")]
mod epoll;

#[cfg(target_os = "linux")]
pub use epoll::EpollEngine;
