//! Muxloop, a callback-based event loop
//!
//! This crate provides an [`EventLoop`] multiplexing several kinds of event
//! sources — fd readiness handlers, one-shot timers, periodic tickers,
//! process signals, off-thread work items and idle callbacks — under a single
//! cooperative dispatch cycle. Each source is created with a callback closure
//! that the loop invokes on its dispatch thread whenever the source has a
//! pending event.
//!
//! The readiness engine behind a loop (the [`Backend`]) is swappable: the
//! same user code runs on the default engine from [`sys`] or on any other
//! implementation of the trait, including shims over foreign event loops.
//!
//! ## How to use it
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use muxloop::{EventLoop, Source, Ticker};
//!
//! fn main() -> muxloop::Result<()> {
//!     let event_loop = EventLoop::new()?;
//!
//!     // Sources refer back to their loop by id, never by reference.
//!     let loop_id = event_loop.id();
//!     let mut remaining = 10;
//!     let ticker = Ticker::new(Duration::from_millis(100), move |_| {
//!         remaining -= 1;
//!         println!("tick, {} to go", remaining);
//!         if remaining == 0 {
//!             if let Some(evl) = Source::upgrade(loop_id) {
//!                 muxloop::EventLoop::try_from(evl).unwrap().exit();
//!             }
//!         }
//!     });
//!
//!     event_loop.start(&ticker)?;
//!     drop(ticker); // the loop now holds the only reference
//!
//!     event_loop.run()
//! }
//! ```
//!
//! ## Object model
//!
//! Every source carries a stable 64-bit id and a reference count: handles
//! are cloneable, the loop references whatever is started on it, and a
//! source is finalized — releasing its user payload — exactly when the last
//! handle drops. [`Source::upgrade`] turns an id back into a strong handle
//! for as long as the source is alive, which is how worker threads and
//! backend internals safely refer to sources and loops across threads.

#![warn(missing_docs)]

pub use crate::backend::{Backend, Capabilities};
pub use crate::error::{Error, Result};
pub use crate::event::Event;
pub use crate::loop_logic::{EventLoop, LoopHandle};
pub use crate::registry::SourceId;
pub use crate::source::{AsSource, Source, SourceKind};
pub use crate::sources::{Handler, Idle, Signal, Ticker, Timer, Work};

mod backend;
mod error;
mod event;
mod loop_logic;
mod queue;
mod registry;
mod source;
pub mod sources;
pub mod sys;
mod thread_pool;
