//! Per-worker transaction state.
//!
//! While a transaction is active, list operations never touch shared memory
//! for writes: they record the post-commit state of every node they would
//! change in the write set, and every node whose committed state they relied
//! on in the read set. `TransactionManager::end` consumes both.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::node::NodeRef;
use crate::transaction::{TransactionStatus, TxId, Version};
use crate::ListCore;

/// Flags of the transaction currently run by one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalTransaction {
    pub id: TxId,
    pub status: TransactionStatus,
    /// No write has been buffered yet.
    pub read_only: bool,
    /// The global version observed at `begin`.
    pub read_version: Version,
    /// The version assigned at commit; zero until then.
    pub write_version: Version,
}

impl LocalTransaction {
    pub(crate) fn idle() -> Self {
        LocalTransaction {
            id: 0,
            status: TransactionStatus::Idle,
            read_only: true,
            read_version: 0,
            write_version: 0,
        }
    }

    /// True while operations should take the transactional path.
    #[inline]
    pub fn is_active(&self) -> bool {
        self.status == TransactionStatus::Active
    }
}

/// The tentative post-commit state of one node.
pub(crate) struct WriteElement<K, V> {
    pub(crate) next: Option<NodeRef<K, V>>,
    /// The value to install; `None` keeps the committed value.
    pub(crate) value: Option<V>,
    pub(crate) deleted: bool,
}

/// Nodes of one list awaiting an index update.
pub(crate) struct IndexDelta<K, V> {
    pub(crate) list: Arc<ListCore<K, V>>,
    pub(crate) nodes: Vec<NodeRef<K, V>>,
}

/// Read set, write set and pending index deltas of one transaction.
pub(crate) struct LocalStorage<K, V> {
    pub(crate) write_set: HashMap<NodeRef<K, V>, WriteElement<K, V>>,
    pub(crate) read_set: HashSet<NodeRef<K, V>>,
    pub(crate) index_add: Vec<IndexDelta<K, V>>,
    pub(crate) index_remove: Vec<IndexDelta<K, V>>,
    /// Nodes allocated by this transaction; unpublished until commit.
    pub(crate) fresh: Vec<IndexDelta<K, V>>,
    /// Every list the transaction touched, kept alive until it ends.
    lists: Vec<Arc<ListCore<K, V>>>,
}

impl<K, V> LocalStorage<K, V> {
    pub(crate) fn new() -> Self {
        LocalStorage {
            write_set: HashMap::new(),
            read_set: HashSet::new(),
            index_add: Vec::new(),
            index_remove: Vec::new(),
            fresh: Vec::new(),
            lists: Vec::new(),
        }
    }

    /// Pins `list` for the rest of the transaction, so the nodes recorded
    /// from it stay allocated until validation.
    pub(crate) fn enlist(&mut self, list: &Arc<ListCore<K, V>>) {
        if !self.lists.iter().any(|l| Arc::ptr_eq(l, list)) {
            self.lists.push(Arc::clone(list));
        }
    }

    /// Records or overwrites the pending state of `node`.
    pub(crate) fn put_into_write_set(
        &mut self,
        node: NodeRef<K, V>,
        next: Option<NodeRef<K, V>>,
        value: Option<V>,
        deleted: bool,
    ) {
        self.write_set.insert(node, WriteElement { next, value, deleted });
    }

    /// Redirects the pending `next` of `node`, keeping any buffered value.
    pub(crate) fn set_next(&mut self, node: NodeRef<K, V>, next: Option<NodeRef<K, V>>) {
        match self.write_set.entry(node) {
            Entry::Occupied(mut entry) => entry.get_mut().next = next,
            Entry::Vacant(entry) => {
                entry.insert(WriteElement {
                    next,
                    value: None,
                    deleted: false,
                });
            }
        }
    }

    #[inline]
    pub(crate) fn pending(&self, node: NodeRef<K, V>) -> Option<&WriteElement<K, V>> {
        self.write_set.get(&node)
    }

    #[inline]
    pub(crate) fn add_to_read_set(&mut self, node: NodeRef<K, V>) {
        self.read_set.insert(node);
    }

    pub(crate) fn add_to_index_add(&mut self, list: &Arc<ListCore<K, V>>, node: NodeRef<K, V>) {
        push_delta(&mut self.index_add, list, node);
    }

    pub(crate) fn add_to_index_remove(&mut self, list: &Arc<ListCore<K, V>>, node: NodeRef<K, V>) {
        push_delta(&mut self.index_remove, list, node);
    }

    pub(crate) fn add_fresh(&mut self, list: &Arc<ListCore<K, V>>, node: NodeRef<K, V>) {
        push_delta(&mut self.fresh, list, node);
    }

    pub(crate) fn clear(&mut self) {
        self.write_set.clear();
        self.read_set.clear();
        self.index_add.clear();
        self.index_remove.clear();
        self.fresh.clear();
        self.lists.clear();
    }
}

fn push_delta<K, V>(deltas: &mut Vec<IndexDelta<K, V>>, list: &Arc<ListCore<K, V>>, node: NodeRef<K, V>) {
    match deltas.iter_mut().find(|d| Arc::ptr_eq(&d.list, list)) {
        Some(delta) => delta.nodes.push(node),
        None => deltas.push(IndexDelta {
            list: Arc::clone(list),
            nodes: vec![node],
        }),
    }
}
