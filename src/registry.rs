//! Chunked append-only registry for per-type recorders
//!
//! This is the backbone that lets unboundedly many application threads
//! publish newly created recorders while a report thread walks the whole
//! population later, without a lock anywhere on the append path.
//!
//! # Design
//!
//! Storage is a forward-linked list of fixed-size chunks (128 slots, a power
//! of two). A single atomic producer sequence assigns every append a dense
//! index; chunk id and slot offset fall out of a shift and a mask. The first
//! producer to need a not-yet-existing chunk allocates one and races a CAS on
//! the current tail's `next` pointer; losers hand their allocation back to a
//! local spare and follow the winner. A `last` reference is advanced
//! cooperatively by whichever thread notices a newer chunk, and a lagging
//! producer whose index lands below `last` walks backward over `prev`
//! pointers, bounded by the actual distance.
//!
//! ```text
//! APPLICATION THREADS                 REPORT THREAD
//!   append() -> fetch_add ----.         for_each()
//!   slot = seq & MASK          |          walk chunks from head,
//!   chunk = seq >> SHIFT       |          spin on unpublished slots,
//!   publish item (Release) ----'          visit exactly size() items
//! ```
//!
//! # Guarantees
//!
//! - `append` never blocks another producer beyond short CAS retries.
//! - `for_each` visits every item at most once, in insertion order, and
//!   never observes a half-published slot: it spin-waits (with
//!   [`crossbeam::utils::Backoff`]) on slots and chunk links that a
//!   concurrent producer has claimed but not yet published.
//! - Once appended, an item's position never changes and the item is never
//!   removed for the life of the registry.
//!
//! Appending a "null" item is unrepresentable here: the slot sentinel is a
//! private null pointer and the public API only accepts owned `Arc`s.

use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam::utils::Backoff;

/// Slots per chunk. Must be a power of two.
const CHUNK_SIZE: usize = 128;
const CHUNK_MASK: u64 = (CHUNK_SIZE - 1) as u64;
const CHUNK_SHIFT: u32 = CHUNK_SIZE.trailing_zeros();

struct Chunk<T> {
    id: u64,
    /// Toward the head. Written before the chunk is published via `next`.
    prev: AtomicPtr<Chunk<T>>,
    /// Toward the tail. Null until a successor is linked in.
    next: AtomicPtr<Chunk<T>>,
    slots: [AtomicPtr<T>; CHUNK_SIZE],
}

impl<T> Chunk<T> {
    fn new(id: u64, prev: *mut Chunk<T>) -> Box<Self> {
        Box::new(Chunk {
            id,
            prev: AtomicPtr::new(prev),
            next: AtomicPtr::new(std::ptr::null_mut()),
            slots: std::array::from_fn(|_| AtomicPtr::new(std::ptr::null_mut())),
        })
    }
}

/// Unbounded, lock-free, append-only collection with insertion-order
/// traversal.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use vaiven::registry::AppendOnlyRegistry;
///
/// let registry = AppendOnlyRegistry::new();
/// registry.append(Arc::new("first"));
/// registry.append(Arc::new("second"));
///
/// let mut seen = Vec::new();
/// registry.for_each(|item| seen.push(*item));
/// assert_eq!(seen, ["first", "second"]);
/// assert_eq!(registry.size(), 2);
/// ```
pub struct AppendOnlyRegistry<T> {
    /// Producer sequence. `size()` is its current value, which may count
    /// slots still being written.
    sequence: AtomicU64,
    first: *mut Chunk<T>,
    /// Last chunk any thread is known to have reached; a shortcut, not a
    /// source of truth.
    last: AtomicPtr<Chunk<T>>,
}

// SAFETY: all shared state is atomics; items are only handed out by shared
// reference. Requires T: Send + Sync like any shared container of T.
unsafe impl<T: Send + Sync> Send for AppendOnlyRegistry<T> {}
unsafe impl<T: Send + Sync> Sync for AppendOnlyRegistry<T> {}

impl<T> AppendOnlyRegistry<T> {
    pub fn new() -> Self {
        let first = Box::into_raw(Chunk::new(0, std::ptr::null_mut()));
        AppendOnlyRegistry {
            sequence: AtomicU64::new(0),
            first,
            last: AtomicPtr::new(first),
        }
    }

    /// Append an item and return its index.
    ///
    /// Lock-free: concurrent producers only contend on the sequence
    /// fetch-add and, rarely, on allocating the next chunk.
    pub fn append(&self, item: Arc<T>) -> u64 {
        let index = self.sequence.fetch_add(1, Ordering::Relaxed);
        let offset = (index & CHUNK_MASK) as usize;
        let chunk_id = index >> CHUNK_SHIFT;

        let mut chunk = self.last.load(Ordering::Acquire);
        // SAFETY: chunks are never freed while `&self` is alive.
        if unsafe { &*chunk }.id != chunk_id {
            chunk = self.producer_chunk_for(chunk, chunk_id);
        }
        // Release-publish so a traversing reader that sees the pointer also
        // sees the fully constructed item.
        let raw = Arc::into_raw(item).cast_mut();
        unsafe { &*chunk }.slots[offset].store(raw, Ordering::Release);
        index
    }

    /// Find (or create) the chunk holding `required_id`, starting the search
    /// at `initial`.
    fn producer_chunk_for(&self, initial: *mut Chunk<T>, required_id: u64) -> *mut Chunk<T> {
        let mut current = initial;
        // Speculative allocation, reused across CAS losses.
        let mut spare: Option<Box<Chunk<T>>> = None;
        let jump_back;
        loop {
            if current.is_null() {
                current = self.last.load(Ordering::Acquire);
            }
            // SAFETY: chunk pointers read from `last`/`next` stay valid for
            // the registry's lifetime.
            let current_ref = unsafe { &*current };
            if current_ref.id >= required_id {
                jump_back = current_ref.id - required_id;
                break;
            }
            let next_id = current_ref.id + 1;
            let next = current_ref.next.load(Ordering::Acquire);
            if !next.is_null() {
                // Someone already linked a successor: help advance `last`.
                let _ = self.last.compare_exchange(
                    current,
                    next,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
                if required_id == next_id {
                    return next;
                }
                current = std::ptr::null_mut();
                continue;
            }
            let mut fresh = spare
                .take()
                .unwrap_or_else(|| Chunk::new(next_id, current));
            fresh.id = next_id;
            fresh.prev.store(current, Ordering::Relaxed);
            let fresh_ptr = Box::into_raw(fresh);
            match current_ref.next.compare_exchange(
                std::ptr::null_mut(),
                fresh_ptr,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let _ = self.last.compare_exchange(
                        current,
                        fresh_ptr,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    );
                    if required_id == next_id {
                        return fresh_ptr;
                    }
                    current = std::ptr::null_mut();
                }
                Err(winner) => {
                    // Lost the race: reclaim the speculative chunk and follow
                    // the winner's link instead.
                    // SAFETY: the CAS failed, so `fresh_ptr` was never
                    // published and we still own it exclusively.
                    let reclaimed = unsafe { Box::from_raw(fresh_ptr) };
                    reclaimed.prev.store(std::ptr::null_mut(), Ordering::Relaxed);
                    spare = Some(reclaimed);
                    let _ = self.last.compare_exchange(
                        current,
                        winner,
                        Ordering::AcqRel,
                        Ordering::Relaxed,
                    );
                    if required_id == next_id {
                        return winner;
                    }
                    current = std::ptr::null_mut();
                }
            }
        }
        // A lagging producer lands below `last`: walk back over `prev`,
        // bounded by the actual distance rather than the list length.
        for _ in 0..jump_back {
            // SAFETY: every chunk below `last` has a linked predecessor.
            current = unsafe { &*current }.prev.load(Ordering::Relaxed);
            debug_assert!(!current.is_null());
        }
        current
    }

    /// Visit every appended item once, in insertion order.
    ///
    /// Items whose producers are mid-publish are waited for, never skipped:
    /// the traversal spin-waits on unpublished slots and on chunk links that
    /// are claimed but not yet visible. Both resolve within the time it
    /// takes the producer to finish one store.
    pub fn for_each<F: FnMut(&T)>(&self, mut visit: F) {
        let mut remaining = self.sequence.load(Ordering::Acquire);
        if remaining == 0 {
            return;
        }
        let mut chunk = self.first;
        loop {
            // SAFETY: `chunk` is the head or was Acquire-loaded from a
            // published `next` link; chunks live as long as the registry.
            let chunk_ref = unsafe { &*chunk };
            let batch = remaining.min(CHUNK_SIZE as u64) as usize;
            for slot in &chunk_ref.slots[..batch] {
                let mut item = slot.load(Ordering::Acquire);
                let backoff = Backoff::new();
                while item.is_null() {
                    backoff.snooze();
                    item = slot.load(Ordering::Acquire);
                }
                // SAFETY: non-null slots hold a pointer from `Arc::into_raw`
                // published with Release; the Arc is owned by the registry.
                visit(unsafe { &*item });
            }
            remaining -= batch as u64;
            if remaining == 0 {
                return;
            }
            let mut next = chunk_ref.next.load(Ordering::Acquire);
            let backoff = Backoff::new();
            while next.is_null() {
                backoff.snooze();
                next = chunk_ref.next.load(Ordering::Acquire);
            }
            chunk = next;
        }
    }

    /// Number of appends started so far. May include slots whose items are
    /// still being published.
    pub fn size(&self) -> u64 {
        self.sequence.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

impl<T> Default for AppendOnlyRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for AppendOnlyRegistry<T> {
    fn drop(&mut self) {
        let mut chunk = self.first;
        while !chunk.is_null() {
            // SAFETY: `&mut self` means no concurrent producers or readers;
            // every chunk was allocated with `Box::new` and linked exactly
            // once.
            let boxed = unsafe { Box::from_raw(chunk) };
            chunk = boxed.next.load(Ordering::Relaxed);
            for slot in &boxed.slots {
                let item = slot.load(Ordering::Relaxed);
                if !item.is_null() {
                    // SAFETY: published slots hold pointers obtained from
                    // `Arc::into_raw`.
                    drop(unsafe { Arc::from_raw(item.cast_const()) });
                }
            }
        }
    }
}
