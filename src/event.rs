//! Readiness events and event masks

use bitflags::bitflags;

bitflags! {
    /// A set of readiness events on an event source
    ///
    /// The same type describes both the events a handler is interested in
    /// (its event mask) and the events that were actually delivered (its
    /// pending readiness). The bit layout is stable: bit 0 is read, bit 1 is
    /// write, bit 2 is out-of-band data.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Event: u32 {
        /// The file descriptor is readable.
        const READ = 1 << 0;
        /// The file descriptor is writable.
        const WRITE = 1 << 1;
        /// Out-of-band data is available.
        const OOB = 1 << 2;
    }
}

impl Event {
    /// The event mask a freshly created fd handler starts out with.
    pub(crate) const DEFAULT_MASK: Event = Event::READ.union(Event::OOB);
}
