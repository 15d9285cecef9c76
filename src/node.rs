//! The linked-list cell and its packed version word.
//!
//! Every `Node` carries a single `AtomicU64` that packs three flags and a
//! logical version:
//!
//! ```text
//!  63      62       61         60 ............................ 0
//! +------+--------+-----------+----------------------------------+
//! | LOCK | DELETED| SINGLETON |             VERSION              |
//! +------+--------+-----------+----------------------------------+
//! ```
//!
//! The lock bit guards every mutation of `value`, `next`, `deleted` and
//! `singleton`. Readers never take the lock: they sample the word before and
//! after reading a field and discard what they read if the word moved.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crossbeam_epoch::{Atomic, Guard, Shared};
use once_cell::sync::OnceCell;

use crate::index::IndexNode;

const LOCK_BIT: u64 = 1 << 63;
const DELETED_BIT: u64 = 1 << 62;
const SINGLETON_BIT: u64 = 1 << 61;
const VERSION_MASK: u64 = SINGLETON_BIT - 1;

/// Structural references a freshly published node starts with: one for its
/// place in the list and one for the index insertion that is still pending.
pub(crate) const INITIAL_REFS: usize = 2;

/// A decoded snapshot of a node's version word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VersionWord(u64);

impl VersionWord {
    #[inline]
    #[must_use]
    pub(crate) fn is_locked(self) -> bool {
        self.0 & LOCK_BIT != 0
    }

    #[inline]
    #[must_use]
    pub(crate) fn is_deleted(self) -> bool {
        self.0 & DELETED_BIT != 0
    }

    #[inline]
    #[must_use]
    pub(crate) fn is_singleton(self) -> bool {
        self.0 & SINGLETON_BIT != 0
    }

    #[inline]
    #[must_use]
    pub(crate) fn is_locked_or_deleted(self) -> bool {
        self.0 & (LOCK_BIT | DELETED_BIT) != 0
    }

    #[inline]
    #[must_use]
    pub(crate) fn version(self) -> u64 {
        self.0 & VERSION_MASK
    }
}

/// A versioned, lockable cell of the sorted list.
///
/// The head sentinel is the only node whose `key` is `None`; it orders before
/// every real key and is never deleted.
pub(crate) struct Node<K, V> {
    key: Option<K>,
    /// The committed value. Null once the node has been removed.
    pub(crate) value: Atomic<V>,
    pub(crate) next: Atomic<Node<K, V>>,
    word: AtomicU64,
    /// Outstanding structural references; see [`Node::release`].
    refs: AtomicUsize,
    /// The index tower, installed once by the thread that indexes this node.
    pub(crate) tower: OnceCell<Box<[IndexNode<K, V>]>>,
}

impl<K, V> Node<K, V> {
    pub(crate) fn head() -> Self {
        Node {
            key: None,
            value: Atomic::null(),
            next: Atomic::null(),
            word: AtomicU64::new(0),
            refs: AtomicUsize::new(INITIAL_REFS),
            tower: OnceCell::new(),
        }
    }

    pub(crate) fn new(key: K, value: Option<V>) -> Self {
        Node {
            key: Some(key),
            value: value.map(Atomic::new).unwrap_or_else(Atomic::null),
            next: Atomic::null(),
            word: AtomicU64::new(0),
            refs: AtomicUsize::new(INITIAL_REFS),
            tower: OnceCell::new(),
        }
    }

    #[inline]
    pub(crate) fn key(&self) -> Option<&K> {
        self.key.as_ref()
    }

    /// # Safety
    ///
    /// `self` must not be the head sentinel.
    #[inline]
    pub(crate) unsafe fn key_unchecked(&self) -> &K {
        self.key.as_ref().unwrap_unchecked()
    }

    /// Loads the version word.
    #[inline]
    pub(crate) fn word(&self) -> VersionWord {
        VersionWord(self.word.load(Ordering::Acquire))
    }

    /// Attempts to set the lock bit. Never blocks.
    pub(crate) fn try_lock(&self) -> bool {
        let current = self.word.load(Ordering::Acquire);
        if current & LOCK_BIT != 0 {
            return false;
        }
        self.word
            .compare_exchange(current, current | LOCK_BIT, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clears the lock bit.
    ///
    /// # Panics
    ///
    /// Panics if the node was not locked.
    pub(crate) fn unlock(&self) {
        let prev = self.word.fetch_and(!LOCK_BIT, Ordering::Release);
        assert!(prev & LOCK_BIT != 0, "unlock of a node that was not locked");
    }

    #[inline]
    pub(crate) fn is_locked(&self) -> bool {
        self.word().is_locked()
    }

    #[inline]
    pub(crate) fn is_deleted(&self) -> bool {
        self.word().is_deleted()
    }

    /// Rewrites the unlocked bits of the word, keeping the lock bit set.
    fn store_locked(&self, bits: u64) {
        let current = self.word.load(Ordering::Relaxed);
        assert!(current & LOCK_BIT != 0, "node must be locked before it is modified");
        self.word.store(LOCK_BIT | bits, Ordering::Release);
    }

    pub(crate) fn set_version_and_singleton(&self, version: u64, singleton: bool) {
        let current = self.word.load(Ordering::Relaxed);
        let mut bits = (current & DELETED_BIT) | (version & VERSION_MASK);
        if singleton {
            bits |= SINGLETON_BIT;
        }
        self.store_locked(bits);
    }

    pub(crate) fn set_version_and_deleted_and_singleton(
        &self,
        version: u64,
        deleted: bool,
        singleton: bool,
    ) {
        let mut bits = version & VERSION_MASK;
        if deleted {
            bits |= DELETED_BIT;
        }
        if singleton {
            bits |= SINGLETON_BIT;
        }
        self.store_locked(bits);
    }

    /// Stamps a node that no other thread can see yet. The lock bit is left
    /// as it was.
    pub(crate) fn set_version_and_singleton_no_lock_assert(&self, version: u64, singleton: bool) {
        let current = self.word.load(Ordering::Relaxed);
        let mut bits = (current & (LOCK_BIT | DELETED_BIT)) | (version & VERSION_MASK);
        if singleton {
            bits |= SINGLETON_BIT;
        }
        self.word.store(bits, Ordering::Release);
    }

    /// Clones the committed value, if any.
    pub(crate) fn load_value(&self, guard: &Guard) -> Option<V>
    where
        V: Clone,
    {
        let value = self.value.load(Ordering::Acquire, guard);
        // SAFETY: values are only destroyed through `defer_destroy` after being
        // swapped out, so a pointer loaded under `guard` stays valid.
        unsafe { value.as_ref() }.cloned()
    }

    #[inline]
    pub(crate) fn load_next<'g>(&self, guard: &'g Guard) -> Shared<'g, Node<K, V>> {
        self.next.load(Ordering::Acquire, guard)
    }

    /// Adds structural references, e.g. when an index level starts pointing
    /// at this node.
    #[inline]
    pub(crate) fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one structural reference and reports whether it was the last.
    /// The caller that observes `true` must retire the node.
    #[inline]
    #[must_use]
    pub(crate) fn release(&self) -> bool {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "structural reference count underflow");
        prev == 1
    }
}

/// Single-field accessors. The list paths read a `VersionWord` snapshot and
/// write through the compound setters instead.
#[cfg(test)]
impl<K, V> Node<K, V> {
    #[inline]
    pub(crate) fn is_singleton(&self) -> bool {
        self.word().is_singleton()
    }

    #[inline]
    pub(crate) fn get_version(&self) -> u64 {
        self.word().version()
    }

    /// True when the node was last written by a singleton operation stamped
    /// with exactly `version`.
    #[inline]
    pub(crate) fn is_same_version_and_singleton(&self, version: u64) -> bool {
        let word = self.word();
        word.is_singleton() && word.version() == version
    }

    pub(crate) fn set_deleted(&self, deleted: bool) {
        let current = self.word.load(Ordering::Relaxed);
        let bits = if deleted {
            current | DELETED_BIT
        } else {
            current & !DELETED_BIT
        };
        self.store_locked(bits & !LOCK_BIT);
    }

    pub(crate) fn set_singleton(&self, singleton: bool) {
        let current = self.word.load(Ordering::Relaxed);
        let bits = if singleton {
            current | SINGLETON_BIT
        } else {
            current & !SINGLETON_BIT
        };
        self.store_locked(bits & !LOCK_BIT);
    }

    pub(crate) fn set_version(&self, version: u64) {
        let current = self.word.load(Ordering::Relaxed);
        self.store_locked((current & (DELETED_BIT | SINGLETON_BIT)) | (version & VERSION_MASK));
    }
}

impl<K: Ord, V> Node<K, V> {
    /// Orders this node's key against `key`; the head sorts first.
    #[inline]
    pub(crate) fn cmp_key(&self, key: &K) -> CmpOrdering {
        match &self.key {
            None => CmpOrdering::Less,
            Some(k) => k.cmp(key),
        }
    }
}

impl<K, V> Drop for Node<K, V> {
    fn drop(&mut self) {
        // SAFETY: a node is dropped only once it is unreachable, so nothing
        // else can load its value.
        unsafe {
            let guard = crossbeam_epoch::unprotected();
            let value = self.value.load(Ordering::Relaxed, guard);
            if !value.is_null() {
                drop(value.into_owned());
            }
        }
    }
}

/// A copyable, identity-hashed reference to a node.
///
/// Valid only while the epoch guard that produced it is held.
pub(crate) struct NodeRef<K, V>(*const Node<K, V>);

impl<K, V> NodeRef<K, V> {
    #[inline]
    pub(crate) fn from_shared(shared: Shared<'_, Node<K, V>>) -> Self {
        NodeRef(shared.as_raw())
    }

    /// `None` for a null pointer.
    #[inline]
    pub(crate) fn non_null(shared: Shared<'_, Node<K, V>>) -> Option<Self> {
        (!shared.is_null()).then(|| NodeRef(shared.as_raw()))
    }

    #[inline]
    pub(crate) fn as_shared<'g>(self) -> Shared<'g, Node<K, V>> {
        Shared::from(self.0)
    }

    #[inline]
    pub(crate) fn as_raw(self) -> *const Node<K, V> {
        self.0
    }

    /// # Safety
    ///
    /// The node must not have been freed, which holds while a guard pinned
    /// before it was retired is still alive.
    #[inline]
    pub(crate) unsafe fn deref<'g>(self) -> &'g Node<K, V> {
        &*self.0
    }
}

impl<K, V> Clone for NodeRef<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for NodeRef<K, V> {}

impl<K, V> PartialEq for NodeRef<K, V> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}

impl<K, V> Eq for NodeRef<K, V> {}

impl<K, V> std::hash::Hash for NodeRef<K, V> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (self.0 as usize).hash(state);
    }
}

impl<K, V> std::fmt::Debug for NodeRef<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeRef({:p})", self.0)
    }
}
