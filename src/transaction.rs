//! The global version clock and the optimistic commit protocol.
//!
//! This module is the heart of tdsl's concurrency control. It implements a
//! TL2-style protocol: a transaction reads optimistically against the version
//! it observed at `begin`, buffers its writes privately, and at commit locks
//! what it wrote, validates what it read, and publishes everything under a
//! single new version drawn from the global clock.
//!
//! # Core Components
//!
//! -   **`TransactionManager`**: Owns the global version clock (GVC). Every
//!     commit draws a strictly larger version from it, which gives committed
//!     transactions a total order.
//!
//! -   **`LocalTransaction`** / **`LocalStorage`**: The per-worker flags, read
//!     set and write set of the transaction in flight (see [`crate::local`]).
//!
//! -   **`end`**: The commit protocol: lock the write set, validate the read
//!     set, draw a write version, apply, unlock, then bring the index up to
//!     date. Locks are always released, whatever the outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{Guard, Owned, Shared};
use crossbeam_utils::CachePadded;
use tracing::{debug, trace};

use crate::error::{AbortReason, TxError};
use crate::handle::Handle;
use crate::local::{LocalStorage, LocalTransaction};
use crate::metrics::{ABORTS_TOTAL, LABEL_REASON, LABEL_STATUS, TRANSACTIONS_TOTAL};
use crate::node::{NodeRef, VersionWord};

/// A unique identifier for a transaction, used for tracing.
pub type TxId = u64;

/// A logical timestamp drawn from the global version clock.
pub type Version = u64;

/// The state of a worker's transaction.
///
/// `Idle → Active → Committing → {Committed, Aborted} → Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// No transaction; operations take the singleton path.
    Idle,
    /// The transaction is in progress and buffering.
    Active,
    /// `end` is running.
    Committing,
    /// The transaction committed; the handle returns to `Idle`.
    Committed,
    /// The transaction aborted. Its buffers have been discarded and the
    /// handle waits for `commit` or `rollback` to acknowledge it.
    Aborted,
}

/// Owns the global version clock shared by every list and handle.
pub struct TransactionManager {
    /// The global version clock.
    gvc: CachePadded<AtomicU64>,
    /// The next transaction ID to be allocated.
    next_txid: AtomicU64,
}

impl TransactionManager {
    /// Creates a new `TransactionManager` with the clock at zero.
    pub fn new() -> Self {
        Self {
            gvc: CachePadded::new(AtomicU64::new(0)),
            next_txid: AtomicU64::new(1),
        }
    }

    /// Reads the global version clock.
    #[inline]
    pub fn current_version(&self) -> Version {
        self.gvc.load(Ordering::SeqCst)
    }

    /// Advances the global version clock and returns the new version.
    #[inline]
    pub fn advance_version(&self) -> Version {
        self.gvc.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Creates a per-worker handle for lists with key type `K` and value type `V`.
    pub fn handle<K, V>(self: &Arc<Self>) -> Handle<K, V>
    where
        K: Ord + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        Handle::new(self)
    }

    /// Opens a transaction: snapshot the clock and reset the flags.
    pub(crate) fn begin(&self, tx: &mut LocalTransaction) {
        tx.id = self.next_txid.fetch_add(1, Ordering::Relaxed);
        tx.status = TransactionStatus::Active;
        tx.read_only = true;
        tx.read_version = self.current_version();
        tx.write_version = 0;
        trace!(tx_id = tx.id, read_version = tx.read_version, "transaction started");
    }

    /// Runs the commit protocol for the transaction in flight.
    ///
    /// 1. Lock every node of the write set, stopping at the first failure.
    /// 2. Validate every node of the read set against `read_version`.
    /// 3. Draw a write version, unless the transaction is read-only.
    /// 4. Apply the write set and stamp it with the write version.
    /// 5. Unlock whatever step 1 locked, on success and on abort alike.
    /// 6. After a successful commit, index inserted nodes and clean up
    ///    after removed ones.
    /// 7. Clear the local storage and report the outcome.
    pub(crate) fn end<K, V>(
        &self,
        tx: &mut LocalTransaction,
        storage: &mut LocalStorage<K, V>,
        guard: &Guard,
    ) -> Result<(), TxError>
    where
        K: Ord + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        if !tx.is_active() {
            return Err(TxError::NoActiveTransaction);
        }
        tx.status = TransactionStatus::Committing;

        // 1. Lock phase.
        let mut locked: Vec<NodeRef<K, V>> = Vec::with_capacity(storage.write_set.len());
        let mut outcome: Result<(), AbortReason> = Ok(());
        for node in storage.write_set.keys() {
            // SAFETY: the handle's transaction guard keeps recorded nodes alive.
            if unsafe { node.deref() }.try_lock() {
                locked.push(*node);
            } else {
                outcome = Err(AbortReason::LockContention);
                break;
            }
        }

        // 2. Validate phase.
        if outcome.is_ok() {
            outcome = self.validate(tx, storage);
        }

        // 3. Version assignment.
        if outcome.is_ok() && !tx.read_only {
            tx.write_version = self.advance_version();
        }

        // 4. Apply phase.
        if outcome.is_ok() && !tx.read_only {
            Self::apply(tx.write_version, storage, guard);
        }

        // 5. Unlock phase.
        for node in &locked {
            // SAFETY: see the lock phase.
            unsafe { node.deref() }.unlock();
        }

        match outcome {
            Ok(()) => {
                // 6. Index phase.
                if !tx.read_only {
                    for delta in &storage.index_add {
                        for node in &delta.nodes {
                            delta.list.index_insert(*node, guard);
                        }
                    }
                    for delta in &storage.index_remove {
                        for node in &delta.nodes {
                            delta.list.finish_removal(*node, guard);
                        }
                    }
                }
                debug!(
                    tx_id = tx.id,
                    read_version = tx.read_version,
                    write_version = tx.write_version,
                    writes = storage.write_set.len(),
                    "transaction committed"
                );
                metrics::counter!(TRANSACTIONS_TOTAL, LABEL_STATUS => "committed").increment(1);
                // 7. Cleanup.
                storage.clear();
                tx.status = TransactionStatus::Committed;
                Self::reset(tx);
                Ok(())
            }
            Err(reason) => {
                self.discard(tx, storage, reason);
                Self::reset(tx);
                Err(TxError::Abort(reason))
            }
        }
    }

    fn validate<K, V>(&self, tx: &LocalTransaction, storage: &LocalStorage<K, V>) -> Result<(), AbortReason> {
        for node in &storage.read_set {
            // SAFETY: the handle's transaction guard keeps recorded nodes alive.
            let word = unsafe { node.deref() }.word();
            self.check_read(tx.read_version, word, storage.write_set.contains_key(node))?;
        }
        Ok(())
    }

    /// Checks one observation of a node against the snapshot `read_version`.
    ///
    /// A lock held by this very transaction (`locked_by_us`) is not a
    /// conflict. A singleton write stamped exactly `read_version` is: it may
    /// or may not precede the snapshot, so the clock is advanced to keep the
    /// retry from meeting the same tie.
    pub(crate) fn check_read(&self, read_version: Version, word: VersionWord, locked_by_us: bool) -> Result<(), AbortReason> {
        if word.is_locked() && !locked_by_us {
            return Err(AbortReason::Locked);
        }
        if word.version() > read_version {
            return Err(AbortReason::VersionConflict);
        }
        if word.is_singleton() && word.version() == read_version {
            self.advance_version();
            return Err(AbortReason::SingletonAmbiguity);
        }
        Ok(())
    }

    fn apply<K, V>(write_version: Version, storage: &mut LocalStorage<K, V>, guard: &Guard)
    where
        K: Send + Sync + 'static,
        V: Send + Sync + 'static,
    {
        // Nodes allocated by this transaction become reachable below, so
        // they are stamped first.
        for delta in &storage.fresh {
            for node in &delta.nodes {
                // SAFETY: fresh nodes are still private to this thread.
                unsafe { node.deref() }.set_version_and_singleton_no_lock_assert(write_version, false);
            }
        }

        for (node, element) in storage.write_set.iter_mut() {
            // SAFETY: locked by this transaction in the lock phase.
            let n = unsafe { node.deref() };
            let next = element.next.map_or(Shared::null(), NodeRef::as_shared);
            n.next.store(next, Ordering::Release);
            let replaced = if element.deleted {
                n.value.swap(Shared::null(), Ordering::AcqRel, guard)
            } else if let Some(value) = element.value.take() {
                n.value.swap(Owned::new(value), Ordering::AcqRel, guard)
            } else {
                Shared::null()
            };
            if !replaced.is_null() {
                // SAFETY: the old value is unreachable now; readers that loaded
                // it are pinned.
                unsafe { guard.defer_destroy(replaced) };
            }
            n.set_version_and_deleted_and_singleton(write_version, element.deleted, false);
        }
    }

    /// Throws away everything an aborted transaction buffered.
    pub(crate) fn discard<K, V>(&self, tx: &mut LocalTransaction, storage: &mut LocalStorage<K, V>, reason: AbortReason)
    where
        K: Ord + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        for delta in &storage.fresh {
            for node in &delta.nodes {
                delta.list.discard_unpublished(*node);
            }
        }
        storage.clear();
        tx.status = TransactionStatus::Aborted;
        debug!(tx_id = tx.id, read_version = tx.read_version, %reason, "transaction aborted");
        metrics::counter!(TRANSACTIONS_TOTAL, LABEL_STATUS => "aborted").increment(1);
        metrics::counter!(ABORTS_TOTAL, LABEL_REASON => reason.as_str()).increment(1);
    }

    /// Throws away a transaction the caller gave up on. Not counted as an abort.
    pub(crate) fn rollback<K, V>(&self, tx: &mut LocalTransaction, storage: &mut LocalStorage<K, V>)
    where
        K: Ord + Send + Sync + 'static,
        V: Clone + Send + Sync + 'static,
    {
        for delta in &storage.fresh {
            for node in &delta.nodes {
                delta.list.discard_unpublished(*node);
            }
        }
        storage.clear();
        trace!(tx_id = tx.id, "transaction rolled back");
        Self::reset(tx);
    }

    fn reset(tx: &mut LocalTransaction) {
        tx.status = TransactionStatus::Idle;
        tx.read_only = true;
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("gvc", &self.current_version())
            .finish()
    }
}
