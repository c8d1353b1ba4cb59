//! The global source registry
//!
//! Every source is assigned a process-unique, never-reused 64-bit id at
//! construction. The registry maps ids to weak references, which makes it
//! possible for worker threads and signal-delivery paths to name a source
//! without keeping it alive: they store the id and upgrade it to a strong
//! reference at use-site, racing safely against finalization on the dispatch
//! thread.

use std::collections::HashMap;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::source::SourceInner;

/// The stable identity of a source
///
/// Ids are assigned monotonically and never reused for the life of the
/// process. The raw value 0 is reserved and never names a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(NonZeroU64);

impl SourceId {
    /// The raw 64-bit value of this id.
    pub fn as_u64(self) -> u64 {
        self.0.get()
    }

    /// Reconstruct an id from its raw value.
    ///
    /// Returns `None` for the reserved value 0.
    pub fn from_u64(raw: u64) -> Option<SourceId> {
        NonZeroU64::new(raw).map(SourceId)
    }
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

static TABLE: OnceLock<Mutex<HashMap<u64, Weak<SourceInner>>>> = OnceLock::new();

fn table() -> &'static Mutex<HashMap<u64, Weak<SourceInner>>> {
    TABLE.get_or_init(Default::default)
}

/// Pick the next id and insert the weak entry. Called from every source
/// constructor.
pub(crate) fn assign_id(entry: Weak<SourceInner>) -> SourceId {
    let raw = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let id = SourceId(NonZeroU64::new(raw).expect("source id counter overflowed"));
    table().lock().unwrap().insert(raw, entry);
    id
}

/// Remove a source's entry. Called from the source finalizer, once no strong
/// reference can exist any more, so a concurrent upgrade cannot resurrect the
/// object.
pub(crate) fn drop_id(id: SourceId) {
    table().lock().unwrap().remove(&id.as_u64());
}

pub(crate) fn try_upgrade(id: SourceId) -> Option<Arc<SourceInner>> {
    table().lock().unwrap().get(&id.as_u64()).and_then(Weak::upgrade)
}

// The default-loop slot holds an id, not a reference: setting it has no
// effect on the loop's lifetime and reading it goes through the registry.
static DEFAULT_LOOP: AtomicU64 = AtomicU64::new(0);

pub(crate) fn set_default(id: SourceId) {
    DEFAULT_LOOP.store(id.as_u64(), Ordering::Release);
}

pub(crate) fn default_id() -> Option<SourceId> {
    SourceId::from_u64(DEFAULT_LOOP.load(Ordering::Acquire))
}
