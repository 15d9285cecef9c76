#![doc = include_str!("../README.md")]
//! The transactional sorted map.
//!
//! `TxList` is a sorted linked list of versioned nodes with a skip-list index
//! on top. Every operation runs under a [`Handle`] and takes one of two paths:
//!
//! -   **Singleton:** with no transaction open on the handle, the operation
//!     finds its window in the list without locks, locks only the node(s) it
//!     changes, stamps them with a fresh version from the global clock and
//!     flags them `singleton`, then returns. It never fails; contention makes
//!     it start over.
//! -   **Transactional:** inside `begin()`/`commit()`, the operation reads the
//!     committed list through the handle's write set (so it sees its own
//!     writes), checks every node it observes against the snapshot version,
//!     and buffers its changes. Nothing is shared until `commit()` runs the
//!     TL2 protocol in [`transaction`].
//!
//! # Internals
//!
//! -   **Nodes:** each node packs a lock bit, a deleted flag, a singleton flag
//!     and a version into one atomic word (see `node.rs`). The `next` chain
//!     is authoritative; the index only shortens the walk to it.
//! -   **Reclamation:** nodes live in a slab arena and are retired through
//!     `crossbeam-epoch` once the list and every index level let go of them.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_epoch::{Guard, Shared};
use crossbeam_utils::Backoff;
use tracing::{debug, trace};

pub mod config;
pub mod error;
mod handle;
mod index;
mod local;
pub mod metrics;
mod node;
mod reclaim;
mod slab;
pub mod transaction;

pub use crate::config::{ListBuilder, ListConfig};
pub use crate::error::{AbortReason, TxError};
pub use crate::handle::Handle;
pub use crate::index::{IndexLevels, LevelReport};
pub use crate::local::LocalTransaction;
pub use crate::transaction::{TransactionManager, TransactionStatus, TxId, Version};

use crate::handle::Mode;
use crate::index::Index;
use crate::local::{LocalStorage, WriteElement};
use crate::metrics::{LABEL_MODE, LABEL_OPERATION_TYPE, OPERATIONS_TOTAL};
use crate::node::{Node, NodeRef};
use crate::reclaim::Reclaimer;

/// Outcome of one optimistic attempt on the singleton path.
enum Attempt<T> {
    Done(T),
    /// Something moved under the attempt; find the window again.
    Retry,
}

/// The shared state of one list. `TxList` handles and in-flight
/// transactions hold it through an `Arc`.
pub(crate) struct ListCore<K, V> {
    head: NodeRef<K, V>,
    index: Index<K, V>,
    reclaimer: Reclaimer<K, V>,
    manager: Arc<TransactionManager>,
    config: ListConfig,
}

// SAFETY: `head` points at the sentinel the list owns. Every node is shared
// only through atomics and the per-node lock bit.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for ListCore<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for ListCore<K, V> {}

impl<K, V> ListCore<K, V> {
    /// Frees a node allocated by a transaction that never committed.
    pub(crate) fn discard_unpublished(&self, node: NodeRef<K, V>) {
        // SAFETY: fresh nodes are only reachable from the local storage of
        // the transaction that allocated them.
        unsafe { self.reclaimer.release_unpublished(node) };
    }
}

impl<K, V> ListCore<K, V>
where
    K: Ord + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn new(manager: &Arc<TransactionManager>, config: ListConfig) -> Self {
        let reclaimer = Reclaimer::new();
        let head = reclaimer.allocate_head();
        let index = Index::new(head, config.max_level, config.indexed);
        ListCore {
            head,
            index,
            reclaimer,
            manager: Arc::clone(manager),
            config,
        }
    }

    /// Indexes a node that was just linked into the list.
    pub(crate) fn index_insert(&self, node: NodeRef<K, V>, guard: &Guard) {
        if let Err(e) = self.index.add(Some(node), &self.reclaimer, guard) {
            debug!(error = %e, "index insertion skipped");
        }
    }

    /// Cleans the index after `node` was unlinked from the list and drops
    /// the list's reference to it.
    pub(crate) fn finish_removal(&self, node: NodeRef<K, V>, guard: &Guard) {
        if let Err(e) = self.index.remove(Some(node), &self.reclaimer, guard) {
            debug!(error = %e, "index cleanup skipped");
        }
        // SAFETY: the node is unlinked; this is the list's own reference.
        unsafe { self.reclaimer.release(node, guard) };
    }

    /// The node after `next` if it carries exactly `key`.
    fn matching(next: Option<NodeRef<K, V>>, key: &K) -> Option<NodeRef<K, V>> {
        // SAFETY: `next` was loaded under the caller's guard.
        next.filter(|n| unsafe { n.deref() }.cmp_key(key) == CmpOrdering::Equal)
    }

    // ---------------------------------------------------------------------
    // Singleton path
    // ---------------------------------------------------------------------

    /// A live predecessor of `key` to start walking from. Locked or deleted
    /// candidates are passed over to the left.
    fn pred_singleton(&self, key: &K, guard: &Guard) -> NodeRef<K, V> {
        let mut pred = self.index.get_pred(key, &self.reclaimer, guard);
        loop {
            // SAFETY: returned by the index under `guard`.
            let p = unsafe { pred.deref() };
            match p.key() {
                Some(k) if p.word().is_locked_or_deleted() => {
                    pred = self.index.get_pred(k, &self.reclaimer, guard);
                }
                _ => return pred,
            }
        }
    }

    /// Finds `pred` and `next` such that `pred.key < key <= next.key`, with
    /// `next` read from `pred` while `pred` was unlocked, live and unchanged.
    fn find_window(&self, key: &K, guard: &Guard) -> (NodeRef<K, V>, Option<NodeRef<K, V>>) {
        let backoff = Backoff::new();
        'restart: loop {
            let mut pred = self.pred_singleton(key, guard);
            loop {
                // SAFETY: reached from a live node under `guard`.
                let p = unsafe { pred.deref() };
                let word = p.word();
                if word.is_locked_or_deleted() {
                    backoff.snooze();
                    continue 'restart;
                }
                let next = p.load_next(guard);
                if p.word() != word {
                    backoff.snooze();
                    continue 'restart;
                }
                let Some(n) = NodeRef::non_null(next) else {
                    return (pred, None);
                };
                // SAFETY: as above.
                if unsafe { n.deref() }.cmp_key(key) != CmpOrdering::Less {
                    return (pred, Some(n));
                }
                pred = n;
            }
        }
    }

    /// Applies `read` to `node` if the node stays unlocked and unchanged
    /// across the read.
    fn read_stable<T>(&self, node: NodeRef<K, V>, read: impl FnOnce(&Node<K, V>) -> T) -> Attempt<T> {
        // SAFETY: loaded under the caller's guard.
        let n = unsafe { node.deref() };
        let word = n.word();
        if word.is_locked_or_deleted() {
            return Attempt::Retry;
        }
        let value = read(n);
        if n.word() != word {
            return Attempt::Retry;
        }
        Attempt::Done(value)
    }

    fn get_singleton(&self, key: &K, guard: &Guard) -> Option<V> {
        let backoff = Backoff::new();
        loop {
            let (_, next) = self.find_window(key, guard);
            let node = Self::matching(next, key)?;
            match self.read_stable(node, |n| n.load_value(guard)) {
                Attempt::Done(value) => return value,
                Attempt::Retry => backoff.snooze(),
            }
        }
    }

    fn contains_key_singleton(&self, key: &K, guard: &Guard) -> bool {
        let backoff = Backoff::new();
        loop {
            let (_, next) = self.find_window(key, guard);
            let Some(node) = Self::matching(next, key) else {
                return false;
            };
            match self.read_stable(node, |_| true) {
                Attempt::Done(found) => return found,
                Attempt::Retry => backoff.snooze(),
            }
        }
    }

    /// Inserts `key`, or with `overwrite` replaces its value. Without
    /// `overwrite` an existing value is returned and left in place.
    fn put_singleton(&self, key: K, value: V, overwrite: bool, guard: &Guard) -> Option<V> {
        let fresh = self.reclaimer.allocate(key, Some(value));
        // SAFETY: the node stays private to this call until it is linked,
        // and a fresh node always has a key.
        let key = unsafe { fresh.deref().key_unchecked() };
        let backoff = Backoff::new();
        loop {
            let (pred, next) = self.find_window(key, guard);
            let attempt = match Self::matching(next, key) {
                Some(node) if overwrite => self.update_singleton(node, fresh, guard),
                Some(node) => {
                    let attempt = self.read_stable(node, |n| n.load_value(guard));
                    if let Attempt::Done(_) = attempt {
                        self.discard_unpublished(fresh);
                    }
                    attempt
                }
                None => self.link_singleton(pred, next, fresh, guard),
            };
            match attempt {
                Attempt::Done(previous) => return previous,
                Attempt::Retry => {
                    trace!(overwrite = overwrite, "singleton put restarted");
                    backoff.snooze();
                }
            }
        }
    }

    /// Moves the value of `fresh` into `node` and frees `fresh`.
    fn update_singleton(&self, node: NodeRef<K, V>, fresh: NodeRef<K, V>, guard: &Guard) -> Attempt<Option<V>> {
        // SAFETY: loaded under `guard`; `fresh` is private.
        let (n, f) = unsafe { (node.deref(), fresh.deref()) };
        if !n.try_lock() {
            return Attempt::Retry;
        }
        // Locked and not deleted means still linked.
        if n.is_deleted() {
            n.unlock();
            return Attempt::Retry;
        }
        let value = f.value.swap(Shared::null(), Ordering::AcqRel, guard);
        let replaced = n.value.swap(value, Ordering::AcqRel, guard);
        let version = self.manager.advance_version();
        n.set_version_and_singleton(version, true);
        n.unlock();

        // SAFETY: readers that loaded the old value are pinned.
        let previous = unsafe { replaced.as_ref() }.cloned();
        if !replaced.is_null() {
            unsafe { guard.defer_destroy(replaced) };
        }
        self.discard_unpublished(fresh);
        Attempt::Done(previous)
    }

    /// Links `fresh` between `pred` and `next`, provided they are still adjacent.
    fn link_singleton(
        &self,
        pred: NodeRef<K, V>,
        next: Option<NodeRef<K, V>>,
        fresh: NodeRef<K, V>,
        guard: &Guard,
    ) -> Attempt<Option<V>> {
        // SAFETY: `pred` was loaded under `guard`; `fresh` is private.
        let (p, f) = unsafe { (pred.deref(), fresh.deref()) };
        if !p.try_lock() {
            return Attempt::Retry;
        }
        let expected = next.map_or(Shared::null(), NodeRef::as_shared);
        if p.is_deleted() || p.load_next(guard) != expected {
            p.unlock();
            return Attempt::Retry;
        }
        f.next.store(expected, Ordering::Relaxed);
        let version = self.manager.advance_version();
        f.set_version_and_singleton_no_lock_assert(version, true);
        p.next.store(fresh.as_shared(), Ordering::Release);
        // The predecessor's successor changed, which a transaction that read
        // it must notice.
        p.set_version_and_singleton(version, true);
        p.unlock();

        self.index_insert(fresh, guard);
        Attempt::Done(None)
    }

    fn remove_singleton(&self, key: &K, guard: &Guard) -> Option<V> {
        let backoff = Backoff::new();
        loop {
            let (pred, next) = self.find_window(key, guard);
            let node = Self::matching(next, key)?;
            match self.unlink_singleton(pred, node, guard) {
                Attempt::Done(previous) => return previous,
                Attempt::Retry => {
                    trace!("singleton remove restarted");
                    backoff.snooze();
                }
            }
        }
    }

    fn unlink_singleton(&self, pred: NodeRef<K, V>, node: NodeRef<K, V>, guard: &Guard) -> Attempt<Option<V>> {
        // SAFETY: both were loaded under `guard`.
        let (p, n) = unsafe { (pred.deref(), node.deref()) };
        if !p.try_lock() {
            return Attempt::Retry;
        }
        if p.is_deleted() || p.load_next(guard) != node.as_shared() {
            p.unlock();
            return Attempt::Retry;
        }
        if !n.try_lock() {
            p.unlock();
            return Attempt::Retry;
        }
        let version = self.manager.advance_version();
        let replaced = n.value.swap(Shared::null(), Ordering::AcqRel, guard);
        p.next.store(n.load_next(guard), Ordering::Release);
        n.set_version_and_deleted_and_singleton(version, true, true);
        p.set_version_and_singleton(version, true);
        n.unlock();
        p.unlock();

        // SAFETY: readers that loaded the old value are pinned.
        let previous = unsafe { replaced.as_ref() }.cloned();
        if !replaced.is_null() {
            unsafe { guard.defer_destroy(replaced) };
        }
        self.finish_removal(node, guard);
        Attempt::Done(previous)
    }

    // ---------------------------------------------------------------------
    // Transactional path
    // ---------------------------------------------------------------------

    /// The value `node` will have once the transaction commits.
    fn get_val(storage: &LocalStorage<K, V>, node: NodeRef<K, V>, guard: &Guard) -> Option<V> {
        match storage.pending(node) {
            Some(element) if element.deleted => None,
            Some(WriteElement { value: Some(value), .. }) => Some(value.clone()),
            // SAFETY: recorded nodes are protected by the transaction's guard.
            _ => unsafe { node.deref() }.load_value(guard),
        }
    }

    /// A predecessor of `key` that is neither removed nor about to be
    /// removed by this transaction.
    fn pred_tx(
        &self,
        tx: &LocalTransaction,
        storage: &LocalStorage<K, V>,
        key: &K,
        guard: &Guard,
    ) -> Result<NodeRef<K, V>, AbortReason> {
        let mut pred = self.index.get_pred(key, &self.reclaimer, guard);
        loop {
            // SAFETY: returned by the index under `guard`.
            let p = unsafe { pred.deref() };
            self.manager.check_read(tx.read_version, p.word(), false)?;
            let removed = p.is_deleted() || storage.pending(pred).is_some_and(|e| e.deleted);
            match p.key() {
                Some(k) if removed => pred = self.index.get_pred(k, &self.reclaimer, guard),
                _ => return Ok(pred),
            }
        }
    }

    /// The successor of `node` as this transaction sees it.
    fn next_tx(
        &self,
        tx: &LocalTransaction,
        storage: &LocalStorage<K, V>,
        node: NodeRef<K, V>,
        guard: &Guard,
    ) -> Result<Option<NodeRef<K, V>>, AbortReason> {
        if let Some(element) = storage.pending(node) {
            return Ok(element.next);
        }
        // SAFETY: reached from a validated node under `guard`.
        let n = unsafe { node.deref() };
        // `next` and the word cannot be read at once, so check, read, recheck.
        if n.is_locked() {
            return Err(AbortReason::Locked);
        }
        let next = n.load_next(guard);
        self.manager.check_read(tx.read_version, n.word(), false)?;
        Ok(NodeRef::non_null(next))
    }

    /// Finds `pred` and `next` such that `pred.key < key <= next.key` in the
    /// transaction's view of the list.
    fn walk_tx(
        &self,
        tx: &LocalTransaction,
        storage: &LocalStorage<K, V>,
        key: &K,
        guard: &Guard,
    ) -> Result<(NodeRef<K, V>, Option<NodeRef<K, V>>), AbortReason> {
        let mut pred = self.pred_tx(tx, storage, key, guard)?;
        let mut next = self.next_tx(tx, storage, pred, guard)?;
        while let Some(n) = next {
            // SAFETY: as in `next_tx`.
            if unsafe { n.deref() }.cmp_key(key) != CmpOrdering::Less {
                break;
            }
            pred = n;
            next = self.next_tx(tx, storage, pred, guard)?;
        }
        Ok((pred, next))
    }

    /// Re-checks a found node after its value was read and records it.
    fn observe_tx(
        &self,
        tx: &LocalTransaction,
        storage: &mut LocalStorage<K, V>,
        node: NodeRef<K, V>,
    ) -> Result<(), AbortReason> {
        // SAFETY: as in `next_tx`.
        let word = unsafe { node.deref() }.word();
        self.manager.check_read(tx.read_version, word, false)?;
        storage.add_to_read_set(node);
        Ok(())
    }

    fn get_tx(
        self: &Arc<Self>,
        tx: &LocalTransaction,
        storage: &mut LocalStorage<K, V>,
        key: &K,
        guard: &Guard,
    ) -> Result<Option<V>, AbortReason> {
        storage.enlist(self);
        let (pred, next) = self.walk_tx(tx, storage, key, guard)?;
        storage.add_to_read_set(pred);
        let Some(node) = Self::matching(next, key) else {
            return Ok(None);
        };
        let value = Self::get_val(storage, node, guard);
        self.observe_tx(tx, storage, node)?;
        Ok(value)
    }

    fn contains_key_tx(
        self: &Arc<Self>,
        tx: &LocalTransaction,
        storage: &mut LocalStorage<K, V>,
        key: &K,
        guard: &Guard,
    ) -> Result<bool, AbortReason> {
        storage.enlist(self);
        let (pred, next) = self.walk_tx(tx, storage, key, guard)?;
        storage.add_to_read_set(pred);
        match Self::matching(next, key) {
            Some(node) => {
                self.observe_tx(tx, storage, node)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn put_tx(
        self: &Arc<Self>,
        tx: &mut LocalTransaction,
        storage: &mut LocalStorage<K, V>,
        key: K,
        value: V,
        overwrite: bool,
        guard: &Guard,
    ) -> Result<Option<V>, AbortReason> {
        tx.read_only = false;
        storage.enlist(self);
        let (pred, next) = self.walk_tx(tx, storage, &key, guard)?;
        storage.add_to_read_set(pred);

        if let Some(node) = Self::matching(next, &key) {
            let previous = Self::get_val(storage, node, guard);
            self.observe_tx(tx, storage, node)?;
            if overwrite {
                let succ = self.next_tx(tx, storage, node, guard)?;
                storage.put_into_write_set(node, succ, Some(value), false);
            }
            return Ok(previous);
        }

        let fresh = self.reclaimer.allocate(key, Some(value));
        // SAFETY: private until the transaction commits.
        unsafe { fresh.deref() }
            .next
            .store(next.map_or(Shared::null(), NodeRef::as_shared), Ordering::Relaxed);
        storage.add_fresh(self, fresh);
        storage.set_next(pred, Some(fresh));
        storage.add_to_index_add(self, fresh);
        Ok(None)
    }

    fn remove_tx(
        self: &Arc<Self>,
        tx: &mut LocalTransaction,
        storage: &mut LocalStorage<K, V>,
        key: &K,
        guard: &Guard,
    ) -> Result<Option<V>, AbortReason> {
        tx.read_only = false;
        storage.enlist(self);
        let (pred, next) = self.walk_tx(tx, storage, key, guard)?;
        storage.add_to_read_set(pred);
        let Some(node) = Self::matching(next, key) else {
            return Ok(None);
        };

        let previous = Self::get_val(storage, node, guard);
        let succ = self.next_tx(tx, storage, node, guard)?;
        storage.set_next(pred, succ);
        // The tombstone keeps its successor so concurrent walkers can step past it.
        storage.put_into_write_set(node, succ, None, true);
        storage.add_to_read_set(node);
        storage.add_to_index_remove(self, node);
        Ok(previous)
    }

    // ---------------------------------------------------------------------
    // Quiescent traversal
    // ---------------------------------------------------------------------

    fn for_each_live(&self, guard: &Guard, mut f: impl FnMut(&Node<K, V>)) {
        // SAFETY: the head lives as long as the list.
        let mut current = unsafe { self.head.deref() }.load_next(guard);
        // SAFETY: nodes loaded under `guard` stay valid for its lifetime.
        while let Some(n) = unsafe { current.as_ref() } {
            if !n.is_deleted() {
                f(n);
            }
            current = n.load_next(guard);
        }
    }
}

impl<K, V> Drop for ListCore<K, V> {
    fn drop(&mut self) {
        // SAFETY: no handle or transaction references the list any more, so
        // everything reachable from the head is exclusively ours. Removed
        // nodes were handed to the reclaimer already.
        unsafe {
            let guard = crossbeam_epoch::unprotected();
            let mut node = self.head;
            loop {
                let next = node.deref().load_next(guard);
                self.reclaimer.release_unpublished(node);
                match NodeRef::non_null(next) {
                    Some(n) => node = n,
                    None => break,
                }
            }
        }
    }
}

/// A concurrent, transactional sorted map.
///
/// Cloning a `TxList` yields another handle to the same list.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use tdsl::{TransactionManager, TxList};
///
/// let manager = Arc::new(TransactionManager::new());
/// let list: TxList<u64, &str> = TxList::new(&manager);
/// let mut handle = manager.handle();
///
/// // Outside a transaction every call commits on its own.
/// assert_eq!(list.put(&mut handle, 5, "five").unwrap(), None);
/// assert_eq!(list.get(&mut handle, &5).unwrap(), Some("five"));
///
/// // Inside one, calls are buffered until it commits. `transaction`
/// // retries the closure whenever an attempt aborts.
/// handle
///     .transaction(|h| {
///         list.remove(h, &5)?;
///         list.put(h, 7, "seven")?;
///         Ok(())
///     })
///     .unwrap();
///
/// assert_eq!(list.keys(), vec![7]);
/// ```
pub struct TxList<K, V> {
    core: Arc<ListCore<K, V>>,
}

impl<K, V> Clone for TxList<K, V> {
    fn clone(&self) -> Self {
        TxList {
            core: Arc::clone(&self.core),
        }
    }
}

impl<K, V> TxList<K, V>
where
    K: Ord + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates an empty list with the default configuration.
    pub fn new(manager: &Arc<TransactionManager>) -> Self {
        Self::with_config(manager, ListConfig::default())
    }

    /// Returns a builder for a list with custom configuration.
    pub fn builder() -> ListBuilder<K, V> {
        ListBuilder::default()
    }

    pub(crate) fn with_config(manager: &Arc<TransactionManager>, config: ListConfig) -> Self {
        TxList {
            core: Arc::new(ListCore::new(manager, config)),
        }
    }

    /// The configuration the list was built with.
    pub fn config(&self) -> ListConfig {
        self.core.config
    }

    /// The manager whose clock versions this list.
    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.core.manager
    }

    fn enter(&self, handle: &Handle<K, V>, operation: &'static str) -> Result<Mode, TxError> {
        if !Arc::ptr_eq(handle.manager(), &self.core.manager) {
            return Err(TxError::InvalidArgument(
                "handle belongs to a different transaction manager",
            ));
        }
        let mode = handle.mode()?;
        ::metrics::counter!(OPERATIONS_TOTAL, LABEL_OPERATION_TYPE => operation, LABEL_MODE => mode.as_str())
            .increment(1);
        Ok(mode)
    }

    /// Returns the value stored under `key`.
    pub fn get(&self, handle: &mut Handle<K, V>, key: &K) -> Result<Option<V>, TxError> {
        let mode = self.enter(handle, "get")?;
        let guard = &self.core.reclaimer.scoped_guard();
        match mode {
            Mode::Singleton => Ok(self.core.get_singleton(key, guard)),
            Mode::Transactional => {
                handle.with_transaction(|tx, storage| self.core.get_tx(tx, storage, key, guard))
            }
        }
    }

    /// Stores `value` under `key` and returns the value it replaced.
    pub fn put(&self, handle: &mut Handle<K, V>, key: K, value: V) -> Result<Option<V>, TxError> {
        let mode = self.enter(handle, "put")?;
        let guard = &self.core.reclaimer.scoped_guard();
        match mode {
            Mode::Singleton => Ok(self.core.put_singleton(key, value, true, guard)),
            Mode::Transactional => handle
                .with_transaction(|tx, storage| self.core.put_tx(tx, storage, key, value, true, guard)),
        }
    }

    /// Stores `value` under `key` unless the key is present, in which case
    /// the present value is returned and nothing changes.
    pub fn put_if_absent(&self, handle: &mut Handle<K, V>, key: K, value: V) -> Result<Option<V>, TxError> {
        let mode = self.enter(handle, "put_if_absent")?;
        let guard = &self.core.reclaimer.scoped_guard();
        match mode {
            Mode::Singleton => Ok(self.core.put_singleton(key, value, false, guard)),
            Mode::Transactional => handle
                .with_transaction(|tx, storage| self.core.put_tx(tx, storage, key, value, false, guard)),
        }
    }

    /// Removes `key` and returns the value it held.
    pub fn remove(&self, handle: &mut Handle<K, V>, key: &K) -> Result<Option<V>, TxError> {
        let mode = self.enter(handle, "remove")?;
        let guard = &self.core.reclaimer.scoped_guard();
        match mode {
            Mode::Singleton => Ok(self.core.remove_singleton(key, guard)),
            Mode::Transactional => {
                handle.with_transaction(|tx, storage| self.core.remove_tx(tx, storage, key, guard))
            }
        }
    }

    /// Returns `true` if `key` is present.
    pub fn contains_key(&self, handle: &mut Handle<K, V>, key: &K) -> Result<bool, TxError> {
        let mode = self.enter(handle, "contains_key")?;
        let guard = &self.core.reclaimer.scoped_guard();
        match mode {
            Mode::Singleton => Ok(self.core.contains_key_singleton(key, guard)),
            Mode::Transactional => {
                handle.with_transaction(|tx, storage| self.core.contains_key_tx(tx, storage, key, guard))
            }
        }
    }

    /// Counts the committed keys by walking the list.
    ///
    /// Exact only while no operation is in flight.
    pub fn len(&self) -> usize {
        let guard = &self.core.reclaimer.scoped_guard();
        let mut len = 0;
        self.core.for_each_live(guard, |_| len += 1);
        len
    }

    /// Returns `true` if the list holds no committed key.
    pub fn is_empty(&self) -> bool {
        let guard = &self.core.reclaimer.scoped_guard();
        // SAFETY: the head lives as long as the list.
        let mut current = unsafe { self.core.head.deref() }.load_next(guard);
        // SAFETY: nodes loaded under `guard` stay valid for its lifetime.
        while let Some(n) = unsafe { current.as_ref() } {
            if !n.is_deleted() {
                return false;
            }
            current = n.load_next(guard);
        }
        true
    }

    /// Reports the index, level by level. Empty for an index-less list.
    pub fn index_levels(&self) -> IndexLevels<K>
    where
        K: Clone,
    {
        let guard = &self.core.reclaimer.scoped_guard();
        self.core.index.levels(guard)
    }
}

impl<K, V> TxList<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// The committed keys in list order.
    ///
    /// Exact only while no operation is in flight.
    pub fn keys(&self) -> Vec<K> {
        let guard = &self.core.reclaimer.scoped_guard();
        let mut keys = Vec::new();
        self.core.for_each_live(guard, |n| {
            if let Some(key) = n.key() {
                keys.push(key.clone());
            }
        });
        keys
    }

    /// The committed entries in list order.
    ///
    /// Exact only while no operation is in flight.
    pub fn snapshot(&self) -> Vec<(K, V)> {
        let guard = &self.core.reclaimer.scoped_guard();
        let mut entries = Vec::new();
        self.core.for_each_live(guard, |n| {
            if let (Some(key), Some(value)) = (n.key(), n.load_value(guard)) {
                entries.push((key.clone(), value));
            }
        });
        entries
    }
}

impl<K, V> std::fmt::Debug for TxList<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxList")
            .field("config", &self.core.config)
            .field("live_slots", &self.core.reclaimer.live_slots())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Arc<TransactionManager>, TxList<u64, u64>, Handle<u64, u64>) {
        let manager = Arc::new(TransactionManager::new());
        let list = TxList::new(&manager);
        let handle = manager.handle();
        (manager, list, handle)
    }

    #[test]
    fn test_singleton_writes_stamp_fresh_versions() {
        let (manager, list, mut h) = setup();
        list.put(&mut h, 5, 3).unwrap();
        assert_eq!(manager.current_version(), 1);
        list.put(&mut h, 5, 4).unwrap();
        assert_eq!(manager.current_version(), 2);
        list.remove(&mut h, &5).unwrap();
        assert_eq!(manager.current_version(), 3);
        // Reads and misses leave the clock alone.
        list.get(&mut h, &5).unwrap();
        list.remove(&mut h, &5).unwrap();
        assert_eq!(manager.current_version(), 3);
    }

    #[test]
    fn test_singleton_insert_restamps_the_predecessor() {
        let (_manager, list, mut h) = setup();
        list.put(&mut h, 1, 1).unwrap();
        list.put(&mut h, 2, 2).unwrap();
        let guard = &crossbeam_epoch::pin();
        let (pred, next) = list.core.find_window(&2, guard);
        let p = unsafe { pred.deref() };
        assert_eq!(p.key(), Some(&1));
        assert!(p.is_singleton());
        assert_eq!(p.get_version(), 2);
        assert_eq!(unsafe { next.unwrap().deref() }.get_version(), 2);
    }

    #[test]
    fn test_put_if_absent_keeps_the_first_value() {
        let (_manager, list, mut h) = setup();
        assert_eq!(list.put_if_absent(&mut h, 9, 1).unwrap(), None);
        assert_eq!(list.put_if_absent(&mut h, 9, 2).unwrap(), Some(1));
        assert_eq!(list.get(&mut h, &9).unwrap(), Some(1));
        // The rejected node went straight back to the arena.
        assert_eq!(list.core.reclaimer.live_slots(), 2);
    }

    #[test]
    fn test_transactional_writes_stay_private_until_commit() {
        let (manager, list, mut writer) = setup();
        let mut reader = manager.handle();
        writer.begin().unwrap();
        list.put(&mut writer, 1, 10).unwrap();
        assert_eq!(list.get(&mut writer, &1).unwrap(), Some(10));
        assert_eq!(list.get(&mut reader, &1).unwrap(), None);
        assert!(list.is_empty());
        writer.commit().unwrap();
        assert_eq!(list.get(&mut reader, &1).unwrap(), Some(10));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_aborted_transaction_frees_its_nodes() {
        let (_manager, list, mut h) = setup();
        h.begin().unwrap();
        for k in 0..10 {
            list.put(&mut h, k, k).unwrap();
        }
        assert_eq!(list.core.reclaimer.live_slots(), 11);
        h.rollback().unwrap();
        assert_eq!(list.core.reclaimer.live_slots(), 1);
        assert!(list.is_empty());
    }

    #[test]
    fn test_remove_then_reinsert_in_one_transaction() {
        let (manager, list, mut h) = setup();
        list.put(&mut h, 3, 30).unwrap();
        // Move past the singleton write so the snapshot is unambiguous.
        manager.advance_version();
        h.begin().unwrap();
        assert_eq!(list.remove(&mut h, &3).unwrap(), Some(30));
        assert_eq!(list.get(&mut h, &3).unwrap(), None);
        assert_eq!(list.put(&mut h, 3, 31).unwrap(), None);
        assert_eq!(list.get(&mut h, &3).unwrap(), Some(31));
        h.commit().unwrap();
        assert_eq!(list.snapshot(), vec![(3, 31)]);
    }

    /// Keys of every list node that is currently locked.
    fn locked_keys(list: &TxList<u64, u64>) -> Vec<u64> {
        let guard = &crossbeam_epoch::pin();
        let mut locked = Vec::new();
        let mut cur = unsafe { list.core.head.deref() }.load_next(guard);
        while let Some(n) = unsafe { cur.as_ref() } {
            if n.is_locked() {
                locked.extend(n.key().copied());
            }
            cur = n.load_next(guard);
        }
        locked
    }

    #[test]
    fn test_commit_lock_failure_releases_every_lock() {
        let (_manager, list, mut h) = setup();
        let seeded: Vec<(u64, u64)> = (0..10).map(|k| (k, k)).collect();
        h.transaction(|h| {
            for (k, v) in &seeded {
                list.put(h, *k, *v)?;
            }
            Ok(())
        })
        .unwrap();

        h.begin().unwrap();
        for k in 0..10 {
            list.put(&mut h, k, k + 100).unwrap();
        }

        let guard = &crossbeam_epoch::pin();
        let (_, five) = list.core.find_window(&5, guard);
        let five = unsafe { five.unwrap().deref() };
        assert_eq!(five.key(), Some(&5));
        assert!(five.try_lock());

        assert!(matches!(
            h.commit(),
            Err(TxError::Abort(AbortReason::LockContention))
        ));
        assert!(!h.in_transaction());
        // Only the lock taken above survives the abort.
        assert_eq!(locked_keys(&list), vec![5]);

        five.unlock();
        assert!(locked_keys(&list).is_empty());
        assert_eq!(list.snapshot(), seeded);
    }

    #[test]
    fn test_foreign_handle_is_rejected() {
        let (_manager, list, _h) = setup();
        let other = Arc::new(TransactionManager::new());
        let mut foreign = other.handle::<u64, u64>();
        assert!(matches!(
            list.get(&mut foreign, &1),
            Err(TxError::InvalidArgument(_))
        ));
    }
}
