//! The per-worker context through which lists are used.
//!
//! A `Handle` carries one worker's transaction flags, read set and write set.
//! Every list operation takes the handle it runs under:
//!
//! -   With no transaction open, the operation takes the lock-free singleton
//!     path and commits immediately.
//! -   Between `begin()` and `commit()`, the operation buffers into the handle
//!     and is validated when the transaction commits.
//!
//! A handle pins an epoch guard while a transaction is open, so it is bound
//! to the thread that created it. Create one handle per worker thread.

use std::sync::Arc;

use crossbeam_epoch::Guard;

use crate::error::{AbortReason, TxError};
use crate::local::{LocalStorage, LocalTransaction};
use crate::transaction::{TransactionManager, TransactionStatus, Version};

const DEFAULT_RETRY_LIMIT: usize = 64;

/// How an operation issued through a handle is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Singleton,
    Transactional,
}

impl Mode {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Mode::Singleton => "singleton",
            Mode::Transactional => "transactional",
        }
    }
}

/// A per-worker transaction context.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use tdsl::{TransactionManager, TxList};
///
/// let manager = Arc::new(TransactionManager::new());
/// let list: TxList<u64, u64> = TxList::new(&manager);
/// let mut handle = manager.handle::<u64, u64>();
///
/// handle.begin().unwrap();
/// list.put(&mut handle, 1, 4).unwrap();
/// list.put(&mut handle, 2, 6).unwrap();
/// handle.commit().unwrap();
///
/// assert_eq!(list.get(&mut handle, &1).unwrap(), Some(4));
/// ```
pub struct Handle<K, V> {
    manager: Arc<TransactionManager>,
    tx: LocalTransaction,
    storage: LocalStorage<K, V>,
    /// Pinned from `begin` until the transaction ends.
    guard: Option<Guard>,
    /// Why the open transaction aborted, until the caller acknowledges it.
    aborted: Option<AbortReason>,
    retry_limit: usize,
}

impl<K, V> Handle<K, V>
where
    K: Ord + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a handle bound to `manager`'s version clock.
    pub fn new(manager: &Arc<TransactionManager>) -> Self {
        Handle {
            manager: Arc::clone(manager),
            tx: LocalTransaction::idle(),
            storage: LocalStorage::new(),
            guard: None,
            aborted: None,
            retry_limit: DEFAULT_RETRY_LIMIT,
        }
    }

    /// Sets how many attempts [`Handle::transaction`] makes before giving up.
    pub fn with_retry_limit(mut self, attempts: usize) -> Result<Self, TxError> {
        if attempts == 0 {
            return Err(TxError::Configuration(
                "retry limit must allow at least one attempt".to_string(),
            ));
        }
        self.retry_limit = attempts;
        Ok(self)
    }

    /// The manager whose clock this handle reads.
    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    /// The flags of the current (or last) transaction.
    pub fn local_transaction(&self) -> &LocalTransaction {
        &self.tx
    }

    /// True between a successful `begin()` and the matching `commit()`/`rollback()`.
    pub fn in_transaction(&self) -> bool {
        matches!(self.tx.status, TransactionStatus::Active | TransactionStatus::Aborted)
    }

    /// The snapshot version of the open transaction.
    pub fn read_version(&self) -> Option<Version> {
        self.tx.is_active().then_some(self.tx.read_version)
    }

    /// Opens a transaction.
    ///
    /// Returns `TransactionAlreadyActive` if one is already open, including
    /// one that aborted and has not been acknowledged yet.
    pub fn begin(&mut self) -> Result<(), TxError> {
        if self.in_transaction() {
            return Err(TxError::TransactionAlreadyActive);
        }
        self.guard = Some(crossbeam_epoch::pin());
        self.aborted = None;
        self.manager.begin(&mut self.tx);
        Ok(())
    }

    /// Ends the open transaction, committing it if validation succeeds.
    ///
    /// On `Err(TxError::Abort(_))` nothing the transaction wrote became
    /// visible and the handle is ready for the next `begin()`.
    pub fn commit(&mut self) -> Result<(), TxError> {
        match self.tx.status {
            TransactionStatus::Active => {
                let result = match &self.guard {
                    Some(guard) => self.manager.end(&mut self.tx, &mut self.storage, guard),
                    None => {
                        let guard = crossbeam_epoch::pin();
                        self.manager.end(&mut self.tx, &mut self.storage, &guard)
                    }
                };
                self.guard = None;
                result
            }
            TransactionStatus::Aborted => {
                let reason = self.aborted.take().unwrap_or(AbortReason::Invalidated);
                self.tx.status = TransactionStatus::Idle;
                self.guard = None;
                Err(TxError::Abort(reason))
            }
            _ => Err(TxError::NoActiveTransaction),
        }
    }

    /// Discards the open transaction without validating it.
    pub fn rollback(&mut self) -> Result<(), TxError> {
        match self.tx.status {
            TransactionStatus::Active => {
                self.manager.rollback(&mut self.tx, &mut self.storage);
            }
            TransactionStatus::Aborted => {
                self.aborted = None;
                self.tx.status = TransactionStatus::Idle;
            }
            _ => return Err(TxError::NoActiveTransaction),
        }
        self.guard = None;
        Ok(())
    }

    /// Runs `f` as one transaction, retrying from scratch whenever it aborts.
    ///
    /// Errors other than aborts are returned immediately, after rolling the
    /// transaction back. If every attempt aborts, the last abort is returned.
    pub fn transaction<T, F>(&mut self, mut f: F) -> Result<T, TxError>
    where
        F: FnMut(&mut Self) -> Result<T, TxError>,
    {
        let mut last = TxError::Abort(AbortReason::Invalidated);
        for _ in 0..self.retry_limit {
            self.begin()?;
            match f(self) {
                Ok(value) => match self.commit() {
                    Ok(()) => return Ok(value),
                    Err(e) if e.is_abort() => last = e,
                    Err(e) => return Err(e),
                },
                Err(e) => {
                    // Acknowledge the abort, or drop the half-done transaction.
                    let _ = self.rollback();
                    if !e.is_abort() {
                        return Err(e);
                    }
                    last = e;
                }
            }
        }
        Err(last)
    }

    /// Picks the path for the next operation.
    pub(crate) fn mode(&self) -> Result<Mode, TxError> {
        match self.tx.status {
            TransactionStatus::Active => Ok(Mode::Transactional),
            TransactionStatus::Aborted => Err(TxError::Abort(AbortReason::Invalidated)),
            _ => Ok(Mode::Singleton),
        }
    }

    /// Runs one transactional step. An abort discards the buffered state and
    /// leaves the handle in `Aborted` until the caller acknowledges it.
    pub(crate) fn with_transaction<T, F>(&mut self, f: F) -> Result<T, TxError>
    where
        F: FnOnce(&mut LocalTransaction, &mut LocalStorage<K, V>) -> Result<T, AbortReason>,
    {
        match f(&mut self.tx, &mut self.storage) {
            Ok(value) => Ok(value),
            Err(reason) => {
                self.manager.discard(&mut self.tx, &mut self.storage, reason);
                self.aborted = Some(reason);
                Err(TxError::Abort(reason))
            }
        }
    }
}

impl<K, V> Drop for Handle<K, V> {
    /// Rolls back a transaction left open when the handle goes away.
    fn drop(&mut self) {
        if self.tx.status == TransactionStatus::Active {
            for delta in &self.storage.fresh {
                for node in &delta.nodes {
                    delta.list.discard_unpublished(*node);
                }
            }
            self.storage.clear();
        }
    }
}

impl<K, V> std::fmt::Debug for Handle<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("tx", &self.tx)
            .field("reads", &self.storage.read_set.len())
            .field("writes", &self.storage.write_set.len())
            .finish()
    }
}
