//! A simple, thread-safe slab arena.
//!
//! List nodes are fixed-size and churn quickly under insert/remove workloads,
//! so the reclaimer serves them from slabs and recycles freed slots instead of
//! round-tripping through the global allocator.

use std::mem::MaybeUninit;
use std::ptr::NonNull;

use parking_lot::Mutex;

const SLAB_SIZE: usize = 128; // Number of objects per slab

/// A contiguous chunk of memory from which individual slots are served.
struct Slab<T> {
    memory: Box<[MaybeUninit<T>]>,
}

impl<T> Slab<T> {
    fn new() -> Self {
        let memory: Box<[MaybeUninit<T>]> = (0..SLAB_SIZE).map(|_| MaybeUninit::uninit()).collect();
        Slab { memory }
    }

    fn first_slot(&mut self) -> *mut T {
        self.memory.as_mut_ptr() as *mut T
    }
}

/// A thread-safe arena for objects of type `T`.
///
/// The arena never runs destructors: callers drop an object in place before
/// handing its slot back with [`SlabAllocator::free`].
pub(crate) struct SlabAllocator<T> {
    /// Every slab owned by this arena; released when the arena is dropped.
    slabs: Mutex<Vec<Slab<T>>>,
    /// Slots ready for reuse.
    free_list: Mutex<Vec<NonNull<T>>>,
}

// SAFETY: all shared state sits behind mutexes. The arena stores raw slot
// pointers but never dereferences them; the objects living in the slots are
// shared by the list under its own `Send`/`Sync` bounds.
unsafe impl<T: Send> Send for SlabAllocator<T> {}
unsafe impl<T: Send> Sync for SlabAllocator<T> {}

impl<T> SlabAllocator<T> {
    pub(crate) fn new() -> Self {
        SlabAllocator {
            slabs: Mutex::new(Vec::new()),
            free_list: Mutex::new(Vec::new()),
        }
    }

    /// Adds a slab and returns one of its slots, queueing the rest.
    fn grow(&self) -> NonNull<T> {
        let mut slab = Slab::new();
        let base = slab.first_slot();
        // Moving the boxed slice into the vector does not move its heap memory.
        self.slabs.lock().push(slab);

        let mut free_list = self.free_list.lock();
        for i in 1..SLAB_SIZE {
            // SAFETY: `i < SLAB_SIZE`, so the offset stays inside the slab.
            free_list.push(unsafe { NonNull::new_unchecked(base.add(i)) });
        }
        // SAFETY: `base` points at the first slot of a live allocation.
        unsafe { NonNull::new_unchecked(base) }
    }

    /// Hands out an uninitialised slot.
    pub(crate) fn alloc(&self) -> NonNull<T> {
        if let Some(ptr) = self.free_list.lock().pop() {
            return ptr;
        }
        self.grow()
    }

    /// Moves `value` into a fresh slot.
    pub(crate) fn insert(&self, value: T) -> NonNull<T> {
        let slot = self.alloc();
        // SAFETY: the slot is unoccupied and properly aligned for `T`.
        unsafe { slot.as_ptr().write(value) };
        slot
    }

    /// Returns a slot to the free list.
    ///
    /// # Safety
    ///
    /// The object at `ptr` must already have been dropped and no other thread
    /// may still reference it; the slot may be handed out again immediately.
    pub(crate) unsafe fn free(&self, ptr: NonNull<T>) {
        self.free_list.lock().push(ptr);
    }

    /// Number of slots currently owned by the arena.
    pub(crate) fn capacity(&self) -> usize {
        self.slabs.lock().len() * SLAB_SIZE
    }

    /// Number of slots waiting for reuse.
    pub(crate) fn available(&self) -> usize {
        self.free_list.lock().len()
    }
}

impl<T> Default for SlabAllocator<T> {
    fn default() -> Self {
        Self::new()
    }
}
