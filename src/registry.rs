//! Generational id registry
//!
//! Live in-memory objects (ops, flows, contexts) are handed out to callers
//! as opaque 64-bit ids and resolved back on completion paths. The id packs
//! a 32-bit slot index in the low half and a 32-bit generation counter in
//! the high half; a slot's generation is bumped on every reuse, so a stale
//! id held across an unregister resolves to `None` instead of aliasing a new
//! object.
//!
//! Lookups take a read lock only; registration and removal serialize on the
//! write lock.

use std::sync::Arc;
use std::sync::RwLock;

/// Opaque 64-bit id issued by an [`IdTable`]
///
/// `RawId(0)` is reserved as a null id and is never issued (generation
/// counters start at 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawId(pub u64);

impl RawId {
    /// The reserved null id
    pub const NULL: RawId = RawId(0);

    fn new(slot: u32, generation: u32) -> Self {
        RawId(((generation as u64) << 32) | slot as u64)
    }

    fn slot(self) -> usize {
        (self.0 & 0xffff_ffff) as usize
    }

    fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// True if this is the reserved null id
    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl std::fmt::Display for RawId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<Arc<T>>,
}

/// Generational arena mapping [`RawId`]s to shared objects
///
/// Objects are stored as `Arc<T>`; `lookup` clones the `Arc`, so a resolved
/// object stays alive even if it is unregistered while in use.
pub struct IdTable<T> {
    inner: RwLock<Inner<T>>,
}

struct Inner<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
}

impl<T> IdTable<T> {
    pub fn new() -> Self {
        IdTable {
            inner: RwLock::new(Inner {
                slots: Vec::new(),
                free: Vec::new(),
            }),
        }
    }

    /// Register an object and return its id
    pub fn register(&self, value: Arc<T>) -> RawId {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(slot_idx) = inner.free.pop() {
            let slot = &mut inner.slots[slot_idx as usize];
            slot.value = Some(value);
            return RawId::new(slot_idx, slot.generation);
        }
        let slot_idx = inner.slots.len() as u32;
        inner.slots.push(Slot {
            generation: 1,
            value: Some(value),
        });
        RawId::new(slot_idx, 1)
    }

    /// Resolve an id to its object
    ///
    /// Returns `None` for stale ids: slot out of bounds, generation
    /// mismatch, or a slot that has been vacated.
    pub fn lookup(&self, id: RawId) -> Option<Arc<T>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let slot = inner.slots.get(id.slot())?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.value.clone()
    }

    /// Remove an id, returning the object if it was live
    ///
    /// The slot's generation is bumped immediately so the id cannot resolve
    /// again even before the slot is reused.
    pub fn unregister(&self, id: RawId) -> Option<Arc<T>> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let slot = inner.slots.get_mut(id.slot())?;
        if slot.generation != id.generation() || slot.value.is_none() {
            return None;
        }
        let value = slot.value.take();
        slot.generation = slot.generation.wrapping_add(1).max(1);
        let slot_idx = id.slot() as u32;
        inner.free.push(slot_idx);
        value
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.slots.len() - inner.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for IdTable<T> {
    fn default() -> Self {
        Self::new()
    }
}
