//! The probabilistic skip-list index that sits on top of the sorted list.
//!
//! The index is only an accelerator: it answers "give me some live node whose
//! key is below `k`" and may lag behind the list. Every caller re-validates
//! against the authoritative `next` chain, so a stale index entry costs extra
//! traversal, never a wrong answer.
//!
//! # Layout
//!
//! ```text
//!   head(3) ----------------------------> [40] -----------------> null
//!     |                                     |
//!   head(2) -------------> [17] ----------> [40] -----------------> null
//!     |                      |              |
//!   head(1) ---> [ 5] ---> [17] ---> [23]   [40] ---> [51] -------> null
//!                  |         |         |      |         |
//!   list:  H ---> 5 -------> 17 -----> 23 --> 40 -----> 51 -------> null
//! ```
//!
//! Each list node owns a *tower*: one `IndexNode` per level it was promoted
//! to, with `down` links inside the tower. The level heads are `HeadIndex`
//! values that wrap an `IndexNode` pointing at the list's head sentinel.
//!
//! # Concurrency
//!
//! `right` pointers are read without locking. Linking and unlinking take the
//! predecessor's mutex (and, for unlink, the victim's) for the duration of the
//! pointer swap. An unlinked index node is flagged `removed`, after which it
//! can neither gain a successor nor lose one, so a traversal that is parked on
//! it can only fail its next link/unlink and restart from the top.
//!
//! Every linked level holds a structural reference on its list node. The node
//! is retired when the last of those, the list membership and the pending
//! insertion reference are all gone, so no reachable index entry ever points
//! at freed memory.

use std::cmp::Ordering as CmpOrdering;
use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::TxError;
use crate::metrics::{INDEX_LEVEL_CHANGES_TOTAL, LABEL_DIRECTION};
use crate::node::{Node, NodeRef};
use crate::reclaim::Reclaimer;

/// Levels below which the index never shrinks.
const MIN_REDUCIBLE_LEVEL: usize = 3;

/// One entry of one index level.
pub(crate) struct IndexNode<K, V> {
    right: Atomic<IndexNode<K, V>>,
    /// The entry one level below, or null on the bottom level.
    down: *const IndexNode<K, V>,
    node: *const Node<K, V>,
    lock: Mutex<()>,
    /// Set, under `lock`, once the entry has been unlinked from its level.
    removed: AtomicBool,
}

// SAFETY: the raw pointers refer to list nodes and index entries whose
// lifetime is managed by the epoch reclaimer; all mutation of shared fields
// goes through atomics or the entry's mutex.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for IndexNode<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for IndexNode<K, V> {}

impl<K, V> IndexNode<K, V> {
    fn new(node: *const Node<K, V>, down: *const IndexNode<K, V>) -> Self {
        IndexNode {
            right: Atomic::null(),
            down,
            node,
            lock: Mutex::new(()),
            removed: AtomicBool::new(false),
        }
    }

    #[inline]
    fn node(&self) -> &Node<K, V> {
        // SAFETY: an index entry is reachable only while its list node holds
        // a structural reference for it, or by a thread pinned before the
        // node was retired.
        unsafe { &*self.node }
    }

    #[inline]
    fn down(&self) -> Option<&IndexNode<K, V>> {
        // SAFETY: `down` targets a lower entry of the same tower or a lower
        // level head, both of which outlive this entry.
        unsafe { self.down.as_ref() }
    }

    #[inline]
    fn as_shared<'g>(&self) -> Shared<'g, IndexNode<K, V>> {
        Shared::from(self as *const IndexNode<K, V>)
    }
}

/// The first entry of a level.
///
/// `repr(C)` keeps `index` at offset zero so a `HeadIndex` can be addressed
/// as the `IndexNode` it wraps.
#[repr(C)]
pub(crate) struct HeadIndex<K, V> {
    index: IndexNode<K, V>,
    level: usize,
}

/// Live index entries of one level, as reported by [`Index::levels`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelReport<K> {
    /// The level number; the bottom level is 1.
    pub level: usize,
    /// Keys of entries whose list node is still live, in traversal order.
    pub keys: Vec<K>,
    /// Entries still linked although their list node has been removed.
    pub stale: usize,
}

/// A snapshot of the index structure, top level first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexLevels<K> {
    pub levels: Vec<LevelReport<K>>,
}

impl<K> IndexLevels<K> {
    /// The number of levels, zero for an index-less list.
    pub fn height(&self) -> usize {
        self.levels.len()
    }

    /// Entries across all levels that still point at removed nodes.
    pub fn stale_entries(&self) -> usize {
        self.levels.iter().map(|l| l.stale).sum()
    }

    /// Entries across all levels that point at live nodes.
    pub fn live_entries(&self) -> usize {
        self.levels.iter().map(|l| l.keys.len()).sum()
    }
}

impl<K: fmt::Debug> fmt::Display for IndexLevels<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for report in &self.levels {
            write!(f, "level {:>2}: H", report.level)?;
            for key in &report.keys {
                write!(f, " -> {:?}", key)?;
            }
            if report.stale > 0 {
                write!(f, " ({} stale)", report.stale)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// The skip-list index of one list.
pub(crate) struct Index<K, V> {
    head: CachePadded<Atomic<HeadIndex<K, V>>>,
    base: *const Node<K, V>,
    max_level: usize,
    enabled: bool,
}

// SAFETY: `base` points at the list's head sentinel, which lives as long as
// the list; everything else is atomics.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for Index<K, V> {}
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for Index<K, V> {}

impl<K, V> Index<K, V>
where
    K: Ord + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Creates an index over the list whose head sentinel is `base`.
    ///
    /// With `enabled == false` the index keeps no entries and every
    /// predecessor lookup answers with the head sentinel.
    pub(crate) fn new(base: NodeRef<K, V>, max_level: usize, enabled: bool) -> Self {
        let base = base.as_raw();
        let head = Owned::new(HeadIndex {
            index: IndexNode::new(base, ptr::null()),
            level: 1,
        });
        Index {
            head: CachePadded::new(Atomic::from(head)),
            base,
            max_level: max_level.max(1),
            enabled,
        }
    }

    #[inline]
    fn load_head<'g>(&self, guard: &'g Guard) -> &'g HeadIndex<K, V> {
        // SAFETY: the head is never null and detached heads are retired
        // through the guard.
        unsafe { self.head.load(Ordering::Acquire, guard).deref() }
    }

    /// The current number of index levels.
    #[cfg(test)]
    pub(crate) fn height(&self, guard: &Guard) -> usize {
        if !self.enabled {
            return 0;
        }
        self.load_head(guard).level
    }

    fn random_level(&self) -> usize {
        // One plus the run of set bits above the lowest bit: P(level > n) = 2^-n.
        let rnd = fastrand::u32(..);
        let level = 1 + (rnd >> 1).trailing_ones() as usize;
        level.min(self.max_level)
    }

    /// Indexes a node that has just been linked into the list.
    ///
    /// Consumes the node's pending-insertion reference.
    pub(crate) fn add(
        &self,
        node: Option<NodeRef<K, V>>,
        reclaimer: &Reclaimer<K, V>,
        guard: &Guard,
    ) -> Result<(), TxError> {
        let node = node.ok_or(TxError::InvalidArgument("null node given to Index::add"))?;
        // SAFETY: the caller still holds the pending-insertion reference.
        let n = unsafe { node.deref() };
        let key = n
            .key()
            .ok_or(TxError::InvalidArgument("head sentinel given to Index::add"))?;

        if self.enabled && !n.is_deleted() {
            self.insert_tower(node, n, key, reclaimer, guard);
        }
        // SAFETY: this drops the reference the insertion was holding.
        unsafe { reclaimer.release(node, guard) };
        Ok(())
    }

    fn insert_tower(
        &self,
        node: NodeRef<K, V>,
        n: &Node<K, V>,
        key: &K,
        reclaimer: &Reclaimer<K, V>,
        guard: &Guard,
    ) {
        let mut level = self.random_level();
        let max = self.load_head(guard).level;
        if level > max {
            level = max + 1;
        }

        let mut tower: Box<[IndexNode<K, V>]> = (0..level)
            .map(|_| IndexNode::new(node.as_raw(), ptr::null()))
            .collect();
        for i in 1..level {
            let below: *const IndexNode<K, V> = &tower[i - 1];
            tower[i].down = below;
        }
        if n.tower.set(tower).is_err() {
            return;
        }
        let Some(tower) = n.tower.get() else {
            return;
        };

        let mut insertion_level = level;
        if level > max {
            insertion_level = self.grow(n, tower, level, guard);
        }
        if insertion_level > 0 {
            self.splice(n, key, tower, insertion_level, reclaimer, guard);
        }
    }

    /// Raises the index by publishing new level heads whose first entry is
    /// this node's tower. Returns the highest level still to be spliced.
    fn grow(&self, n: &Node<K, V>, tower: &[IndexNode<K, V>], level: usize, guard: &Guard) -> usize {
        loop {
            let current = self.head.load(Ordering::Acquire, guard);
            // SAFETY: see `load_head`.
            let old_level = unsafe { current.deref() }.level;
            if level <= old_level {
                // Lost the race to add the level; splice at every level.
                return level;
            }

            // The head may have shrunk since `level` was drawn.
            let top_level = level.min(old_level + 1);
            let mut below: *const HeadIndex<K, V> = current.as_raw();
            let mut created: Vec<*mut HeadIndex<K, V>> = Vec::new();
            for j in (old_level + 1)..=top_level {
                let entry = &tower[j - 1];
                let head = Box::into_raw(Box::new(HeadIndex {
                    index: IndexNode::new(self.base, below as *const IndexNode<K, V>),
                    level: j,
                }));
                n.acquire();
                // SAFETY: the head is not yet published.
                unsafe { (*head).index.right.store(entry.as_shared(), Ordering::Relaxed) };
                created.push(head);
                below = head;
            }

            let top = Shared::from(below);
            match self
                .head
                .compare_exchange(current, top, Ordering::AcqRel, Ordering::Acquire, guard)
            {
                Ok(_) => {
                    debug!(level = top_level, "index grew");
                    metrics::counter!(INDEX_LEVEL_CHANGES_TOTAL, LABEL_DIRECTION => "grow").increment(1);
                    return old_level;
                }
                Err(_) => {
                    for head in created.into_iter().rev() {
                        // SAFETY: the heads were never published.
                        drop(unsafe { Box::from_raw(head) });
                        let last = n.release();
                        debug_assert!(!last, "pending insertion reference must still be held");
                    }
                }
            }
        }
    }

    /// Links `tower[..insertion_level]` top-down.
    fn splice(
        &self,
        n: &Node<K, V>,
        key: &K,
        tower: &[IndexNode<K, V>],
        mut insertion_level: usize,
        reclaimer: &Reclaimer<K, V>,
        guard: &Guard,
    ) {
        'restart: loop {
            let head = self.load_head(guard);
            let mut j = head.level;
            insertion_level = insertion_level.min(j);
            let mut q: &IndexNode<K, V> = &head.index;
            let mut r = q.right.load(Ordering::Acquire, guard);
            loop {
                // SAFETY: entries loaded under `guard` stay valid for its lifetime.
                if let Some(rr) = unsafe { r.as_ref() } {
                    let target = rr.node();
                    // Compare before the deletion check so no recheck is needed.
                    let before = target.cmp_key(key) == CmpOrdering::Less;
                    if target.is_deleted() {
                        if !self.unlink(q, r, reclaimer, guard) {
                            continue 'restart;
                        }
                        r = q.right.load(Ordering::Acquire, guard);
                        continue;
                    }
                    if before {
                        q = rr;
                        r = rr.right.load(Ordering::Acquire, guard);
                        continue;
                    }
                }

                if j == insertion_level {
                    let t = &tower[j - 1];
                    if !self.link(q, r, t, n, guard) {
                        continue 'restart;
                    }
                    if n.is_deleted() {
                        // The remover's cleanup unlinks what is already linked.
                        return;
                    }
                    insertion_level -= 1;
                    if insertion_level == 0 {
                        return;
                    }
                }

                j -= 1;
                match q.down() {
                    Some(d) => {
                        q = d;
                        r = d.right.load(Ordering::Acquire, guard);
                    }
                    None => return,
                }
            }
        }
    }

    /// Makes `t` the successor of `q`, provided `q` still precedes `r`.
    fn link(
        &self,
        q: &IndexNode<K, V>,
        r: Shared<'_, IndexNode<K, V>>,
        t: &IndexNode<K, V>,
        n: &Node<K, V>,
        guard: &Guard,
    ) -> bool {
        let _locked = q.lock.lock();
        let current = q.right.load(Ordering::Relaxed, guard);
        if q.removed.load(Ordering::Relaxed) || q.node().is_deleted() || current != r {
            return false;
        }
        t.right.store(r, Ordering::Relaxed);
        n.acquire();
        q.right.store(t.as_shared(), Ordering::Release);
        true
    }

    /// Removes `r` from behind `q` and drops the reference it held.
    fn unlink(
        &self,
        q: &IndexNode<K, V>,
        r: Shared<'_, IndexNode<K, V>>,
        reclaimer: &Reclaimer<K, V>,
        guard: &Guard,
    ) -> bool {
        // SAFETY: `r` was loaded under `guard`.
        let Some(rr) = (unsafe { r.as_ref() }) else {
            return false;
        };
        {
            let _left = q.lock.lock();
            let current = q.right.load(Ordering::Relaxed, guard);
            if q.removed.load(Ordering::Relaxed) || current != r {
                return false;
            }
            let _right = rr.lock.lock();
            if rr.removed.load(Ordering::Relaxed) {
                return false;
            }
            rr.removed.store(true, Ordering::Relaxed);
            q.right
                .store(rr.right.load(Ordering::Relaxed, guard), Ordering::Release);
        }
        // SAFETY: the entry was linked, so it held a reference on its node.
        unsafe { reclaimer.release(NodeRef::from_shared(Shared::from(rr.node)), guard) };
        true
    }

    /// Returns the rightmost node found in the index whose key is below
    /// `key`, unlinking entries of removed nodes on the way.
    ///
    /// With `target` set, entries with an equal key are passed over until
    /// `target`'s own entry is reached, so a re-inserted key cannot shadow
    /// the stale entries of its removed predecessor.
    fn find_predecessor(
        &self,
        key: &K,
        target: Option<*const Node<K, V>>,
        reclaimer: &Reclaimer<K, V>,
        guard: &Guard,
    ) -> NodeRef<K, V> {
        'restart: loop {
            let mut q: &IndexNode<K, V> = &self.load_head(guard).index;
            let mut r = q.right.load(Ordering::Acquire, guard);
            loop {
                // SAFETY: entries loaded under `guard` stay valid for its lifetime.
                if let Some(rr) = unsafe { r.as_ref() } {
                    let n = rr.node();
                    if n.is_deleted() {
                        if !self.unlink(q, r, reclaimer, guard) {
                            continue 'restart;
                        }
                        r = q.right.load(Ordering::Acquire, guard);
                        continue;
                    }
                    let advance = match n.cmp_key(key) {
                        CmpOrdering::Less => true,
                        CmpOrdering::Equal => target.is_some_and(|t| !ptr::eq(rr.node, t)),
                        CmpOrdering::Greater => false,
                    };
                    if advance {
                        q = rr;
                        r = rr.right.load(Ordering::Acquire, guard);
                        continue;
                    }
                }
                match q.down() {
                    Some(d) => {
                        q = d;
                        r = d.right.load(Ordering::Acquire, guard);
                    }
                    None => return NodeRef::from_shared(Shared::from(q.node)),
                }
            }
        }
    }

    /// Returns a live node whose key is below `key`, or the head sentinel.
    pub(crate) fn get_pred(&self, key: &K, reclaimer: &Reclaimer<K, V>, guard: &Guard) -> NodeRef<K, V> {
        if !self.enabled {
            return NodeRef::from_shared(Shared::from(self.base));
        }
        loop {
            let pred = self.find_predecessor(key, None, reclaimer, guard);
            // SAFETY: returned under `guard`.
            if !unsafe { pred.deref() }.is_deleted() {
                return pred;
            }
        }
    }

    /// Cleans the index after `node` was removed from the list.
    ///
    /// The node must already be flagged deleted.
    pub(crate) fn remove(
        &self,
        node: Option<NodeRef<K, V>>,
        reclaimer: &Reclaimer<K, V>,
        guard: &Guard,
    ) -> Result<(), TxError> {
        let node = node.ok_or(TxError::InvalidArgument("null node given to Index::remove"))?;
        // SAFETY: the caller holds the node's list reference.
        let n = unsafe { node.deref() };
        let key = n
            .key()
            .ok_or(TxError::InvalidArgument("head sentinel given to Index::remove"))?;
        if !self.enabled {
            return Ok(());
        }
        debug_assert!(n.is_deleted(), "index removal of a live node");

        self.find_predecessor(key, Some(node.as_raw()), reclaimer, guard);
        if self.load_head(guard).index.right.load(Ordering::Acquire, guard).is_null() {
            self.try_reduce_level(reclaimer, guard);
        }
        Ok(())
    }

    /// Drops the top level if the three highest levels look empty, backing
    /// out if the dropped level turns out to have gained an entry.
    fn try_reduce_level(&self, reclaimer: &Reclaimer<K, V>, guard: &Guard) {
        let h_shared = self.head.load(Ordering::Acquire, guard);
        // SAFETY: see `load_head`.
        let h = unsafe { h_shared.deref() };
        if h.level <= MIN_REDUCIBLE_LEVEL {
            return;
        }
        let Some(d) = h.index.down() else { return };
        let Some(e) = d.down() else { return };
        let empty = |entry: &IndexNode<K, V>| entry.right.load(Ordering::Acquire, guard).is_null();
        if !(empty(e) && empty(d) && empty(&h.index)) {
            return;
        }

        let d_shared: Shared<'_, HeadIndex<K, V>> = Shared::from(d as *const IndexNode<K, V> as *const HeadIndex<K, V>);
        if self
            .head
            .compare_exchange(h_shared, d_shared, Ordering::AcqRel, Ordering::Acquire, guard)
            .is_err()
        {
            return;
        }

        if !empty(&h.index)
            && self
                .head
                .compare_exchange(d_shared, h_shared, Ordering::AcqRel, Ordering::Acquire, guard)
                .is_ok()
        {
            debug!(level = h.level, "index level reduction backed out");
            return;
        }

        debug!(level = h.level - 1, "index shrank");
        metrics::counter!(INDEX_LEVEL_CHANGES_TOTAL, LABEL_DIRECTION => "reduce").increment(1);
        self.detach_level(h_shared, reclaimer, guard);
    }

    /// Freezes a level that is no longer reachable from the head and drops
    /// the references its entries held.
    fn detach_level(&self, h_shared: Shared<'_, HeadIndex<K, V>>, reclaimer: &Reclaimer<K, V>, guard: &Guard) {
        // SAFETY: still protected by `guard`.
        let h = unsafe { h_shared.deref() };
        let mut r = {
            let _locked = h.index.lock.lock();
            h.index.removed.store(true, Ordering::Relaxed);
            h.index.right.load(Ordering::Relaxed, guard)
        };
        // SAFETY: entries loaded under `guard` stay valid for its lifetime.
        while let Some(rr) = unsafe { r.as_ref() } {
            let next = {
                let _locked = rr.lock.lock();
                if rr.removed.swap(true, Ordering::Relaxed) {
                    break;
                }
                rr.right.load(Ordering::Relaxed, guard)
            };
            // SAFETY: the entry was linked, so it held a reference on its node.
            unsafe { reclaimer.release(NodeRef::from_shared(Shared::from(rr.node)), guard) };
            r = next;
        }
        // SAFETY: the head is unreachable; late readers are covered by the epoch.
        unsafe { guard.defer_destroy(h_shared) };
    }

    /// Walks every level and reports its entries.
    pub(crate) fn levels(&self, guard: &Guard) -> IndexLevels<K>
    where
        K: Clone,
    {
        let mut levels = Vec::new();
        if !self.enabled {
            return IndexLevels { levels };
        }
        let head = self.load_head(guard);
        let mut level = head.level;
        let mut q: Option<&IndexNode<K, V>> = Some(&head.index);
        while let Some(start) = q {
            let mut report = LevelReport {
                level,
                keys: Vec::new(),
                stale: 0,
            };
            let mut r = start.right.load(Ordering::Acquire, guard);
            // SAFETY: entries loaded under `guard` stay valid for its lifetime.
            while let Some(rr) = unsafe { r.as_ref() } {
                let n = rr.node();
                match n.key() {
                    Some(key) if !n.is_deleted() => report.keys.push(key.clone()),
                    _ => report.stale += 1,
                }
                r = rr.right.load(Ordering::Acquire, guard);
            }
            levels.push(report);
            q = start.down();
            level = level.saturating_sub(1);
        }
        IndexLevels { levels }
    }
}

impl<K, V> Drop for Index<K, V> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no thread is traversing the index; level
        // heads are chained through `down` and owned by the index. Tower
        // entries belong to their list nodes.
        unsafe {
            let guard = crossbeam_epoch::unprotected();
            let mut head = self.head.load(Ordering::Relaxed, guard).as_raw() as *mut HeadIndex<K, V>;
            while !head.is_null() {
                let down = (*head).index.down as *mut HeadIndex<K, V>;
                drop(Box::from_raw(head));
                head = down;
            }
        }
    }
}
