//! Node allocation and epoch-based reclamation.
//!
//! The `Reclaimer` owns the slab arena that backs every node of one list and
//! defers the destruction of retired nodes through `crossbeam-epoch`. A node
//! retired while any thread is pinned stays readable until every such thread
//! has unpinned, so lock-free traversals may keep dereferencing nodes they
//! loaded inside their guard scope.

use std::ptr::NonNull;
use std::sync::Arc;

use crossbeam_epoch::{Guard, Shared};

use crate::metrics::NODES_RETIRED_TOTAL;
use crate::node::{Node, NodeRef};
use crate::slab::SlabAllocator;

/// A slot pointer that may cross into the collector's deferred queue.
struct Slot<K, V>(NonNull<Node<K, V>>);

// SAFETY: a slot is only handed to the deferred destructor once the node is
// unreachable; the destructor may then run on any thread, which is sound as
// long as the node's contents are `Send`.
unsafe impl<K: Send, V: Send> Send for Slot<K, V> {}

pub(crate) struct Reclaimer<K, V> {
    arena: Arc<SlabAllocator<Node<K, V>>>,
}

impl<K, V> Reclaimer<K, V>
where
    K: Send + 'static,
    V: Send + 'static,
{
    pub(crate) fn new() -> Self {
        Reclaimer {
            arena: Arc::new(SlabAllocator::new()),
        }
    }

    /// Enters a critical section. Nodes retired after this point are not
    /// freed while the returned guard is alive.
    #[inline]
    pub(crate) fn scoped_guard(&self) -> Guard {
        crossbeam_epoch::pin()
    }

    /// Allocates an unpublished node.
    pub(crate) fn allocate(&self, key: K, value: Option<V>) -> NodeRef<K, V> {
        self.place(Node::new(key, value))
    }

    /// Allocates the head sentinel.
    pub(crate) fn allocate_head(&self) -> NodeRef<K, V> {
        self.place(Node::head())
    }

    fn place(&self, node: Node<K, V>) -> NodeRef<K, V> {
        let slot = self.arena.insert(node);
        NodeRef::from_shared(Shared::from(slot.as_ptr() as *const Node<K, V>))
    }

    /// Schedules `node` for destruction once no pinned thread can observe it.
    ///
    /// # Safety
    ///
    /// `node` must be unreachable from the list and the index, and must not
    /// be retired twice.
    pub(crate) unsafe fn retire(&self, node: NodeRef<K, V>, guard: &Guard) {
        let slot = Slot(NonNull::new_unchecked(node.as_raw() as *mut Node<K, V>));
        let arena = Arc::clone(&self.arena);
        guard.defer_unchecked(move || {
            let slot = slot;
            std::ptr::drop_in_place(slot.0.as_ptr());
            arena.free(slot.0);
        });
        metrics::counter!(NODES_RETIRED_TOTAL).increment(1);
    }

    /// Drops one structural reference on `node`, retiring it if that was the
    /// last one.
    ///
    /// # Safety
    ///
    /// The caller must own the reference it drops.
    pub(crate) unsafe fn release(&self, node: NodeRef<K, V>, guard: &Guard) {
        if node.deref().release() {
            self.retire(node, guard);
        }
    }
}

impl<K, V> Reclaimer<K, V> {
    /// Frees a node that was never published to other threads.
    ///
    /// # Safety
    ///
    /// No other thread may hold a reference to `node`.
    pub(crate) unsafe fn release_unpublished(&self, node: NodeRef<K, V>) {
        let ptr = node.as_raw() as *mut Node<K, V>;
        std::ptr::drop_in_place(ptr);
        self.arena.free(NonNull::new_unchecked(ptr));
    }

    /// Slots handed out and not yet returned.
    pub(crate) fn live_slots(&self) -> usize {
        self.arena.capacity() - self.arena.available()
    }
}
