//! # LRU Engine
//!
//! Recency-ordered ring of reference-counted entries with bounded eviction of
//! idle ones.
//!
//! ## Design Principles
//!
//! 1. **Index-Linked Arena**: entries live in a slot vector and link to each
//!    other by `EntryId`, so link/unlink are O(1) without raw pointers.
//! 2. **Refcount + Linkage**: `acquired` counts borrowers, `linked` says
//!    whether the entry is still pooled. A detached entry may still be
//!    borrowed.
//! 3. **Free Accounting**: `free_cached_entries` always equals the number of
//!    linked entries with `acquired == 0`; eviction trusts it and aborts
//!    loudly if it is ever wrong.
//!
//! ## Structure Overview
//!
//! ```text
//! LruList<T>
//!   ├── slots: Vec<Option<Slot<T>>>
//!   │     └── Slot { entry: LruEntry { prev, next, linked, acquired }, value: T }
//!   ├── vacant: Vec<usize>            (recycled slot indices)
//!   ├── head -> most recently used
//!   └── tail -> least recently used   (eviction starts here)
//! ```

use tracing::error;

/// Stable handle to an entry in an `LruList` arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryId(usize);

impl EntryId {
    /// Returns the raw slot index.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Ring links and borrow count of one entry.
#[derive(Debug, Clone, Default)]
pub struct LruEntry {
    // Neighbour towards the head (more recent).
    prev: Option<EntryId>,
    // Neighbour towards the tail (less recent).
    next: Option<EntryId>,
    linked: bool,
    acquired: i32,
}

impl LruEntry {
    /// Number of outstanding borrowers.
    #[inline]
    pub fn acquired(&self) -> i32 {
        self.acquired
    }

    /// True while the entry is part of the ring.
    #[inline]
    pub fn is_linked(&self) -> bool {
        self.linked
    }
}

#[derive(Debug)]
struct Slot<T> {
    entry: LruEntry,
    value: T,
}

/// Outcome of dropping one reference with [`LruList::delref`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Other borrowers remain.
    Held,
    /// Last borrower gone; the entry stays pooled as an idle candidate.
    Pooled,
    /// Last borrower gone and the entry is detached: dispose it now.
    Dispose,
}

/// Recency-ordered arena of reference-counted entries.
#[derive(Debug)]
pub struct LruList<T> {
    slots: Vec<Option<Slot<T>>>,
    vacant: Vec<usize>,
    head: Option<EntryId>,
    tail: Option<EntryId>,
    free_cached_entries: usize,
}

impl<T> Default for LruList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LruList<T> {
    /// Creates an empty ring.
    pub fn new() -> Self {
        LruList {
            slots: Vec::new(),
            vacant: Vec::new(),
            head: None,
            tail: None,
            free_cached_entries: 0,
        }
    }

    /// Number of live entries, linked or not.
    pub fn len(&self) -> usize {
        self.slots.len() - self.vacant.len()
    }

    /// Returns true when the arena holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Linked entries nobody currently borrows.
    #[inline]
    pub fn free_cached_entries(&self) -> usize {
        self.free_cached_entries
    }

    fn slot(&self, id: EntryId) -> &Slot<T> {
        self.slots[id.0].as_ref().expect("lru entry exists")
    }

    fn slot_mut(&mut self, id: EntryId) -> &mut Slot<T> {
        self.slots[id.0].as_mut().expect("lru entry exists")
    }

    fn store(&mut self, entry: LruEntry, value: T) -> EntryId {
        let slot = Slot { entry, value };
        match self.vacant.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                EntryId(idx)
            }
            None => {
                self.slots.push(Some(slot));
                EntryId(self.slots.len() - 1)
            }
        }
    }

    /// Stores a value as a fresh entry: unlinked, `acquired == 0`.
    pub fn insert(&mut self, value: T) -> EntryId {
        self.store(LruEntry::default(), value)
    }

    /// Stores a value that is already borrowed and links it at the head.
    ///
    /// The entry is not counted as free.
    pub fn insert_new(&mut self, value: T) -> EntryId {
        let id = self.store(
            LruEntry {
                acquired: 1,
                ..LruEntry::default()
            },
            value,
        );
        self.link_head(id);
        id
    }

    /// Stores a borrowed value that lives outside the ring.
    pub fn insert_uncached(&mut self, value: T) -> EntryId {
        self.store(
            LruEntry {
                acquired: 1,
                ..LruEntry::default()
            },
            value,
        )
    }

    /// Removes an entry from the arena and returns its value.
    ///
    /// A linked idle entry is unlinked and uncounted first so the free
    /// accounting stays exact.
    pub fn remove(&mut self, id: EntryId) -> Option<T> {
        let (linked, acquired) = {
            let entry = &self.slots.get(id.0)?.as_ref()?.entry;
            (entry.linked, entry.acquired)
        };
        if linked {
            if acquired <= 0 {
                self.free_cached_entries -= 1;
            }
            self.unlink(id);
        }
        let slot = self.slots[id.0].take()?;
        self.vacant.push(id.0);
        Some(slot.value)
    }

    /// Returns the value of a live entry.
    pub fn get(&self, id: EntryId) -> Option<&T> {
        self.slots.get(id.0)?.as_ref().map(|slot| &slot.value)
    }

    /// Returns the value of a live entry mutably.
    pub fn get_mut(&mut self, id: EntryId) -> Option<&mut T> {
        self.slots.get_mut(id.0)?.as_mut().map(|slot| &mut slot.value)
    }

    /// Returns the ring state of a live entry.
    pub fn entry(&self, id: EntryId) -> Option<&LruEntry> {
        self.slots.get(id.0)?.as_ref().map(|slot| &slot.entry)
    }

    /// Borrow count of an entry (0 for unknown ids).
    pub fn acquired(&self, id: EntryId) -> i32 {
        self.entry(id).map(LruEntry::acquired).unwrap_or(0)
    }

    /// True while the entry is part of the ring.
    pub fn is_linked(&self, id: EntryId) -> bool {
        self.entry(id).map(LruEntry::is_linked).unwrap_or(false)
    }

    /// Splices the entry in at the head (most recent).
    ///
    /// No refcount or free-count side effect.
    pub fn link_head(&mut self, id: EntryId) {
        if self.slot(id).entry.linked {
            self.unlink(id);
        }
        let head = self.head;
        {
            let entry = &mut self.slot_mut(id).entry;
            entry.prev = None;
            entry.next = head;
            entry.linked = true;
        }
        match head {
            Some(head_id) => self.slot_mut(head_id).entry.prev = Some(id),
            None => self.tail = Some(id),
        }
        self.head = Some(id);
    }

    /// Splices the entry in at the tail (next eviction candidate).
    pub fn link_tail(&mut self, id: EntryId) {
        if self.slot(id).entry.linked {
            self.unlink(id);
        }
        let tail = self.tail;
        {
            let entry = &mut self.slot_mut(id).entry;
            entry.prev = tail;
            entry.next = None;
            entry.linked = true;
        }
        match tail {
            Some(tail_id) => self.slot_mut(tail_id).entry.next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
    }

    /// Removes the entry from the ring and marks it unlinked.
    ///
    /// Does not touch `free_cached_entries`; callers unlinking an idle entry
    /// must uncount it themselves.
    pub fn unlink(&mut self, id: EntryId) {
        let (prev, next) = {
            let entry = &self.slot(id).entry;
            if !entry.linked {
                return;
            }
            (entry.prev, entry.next)
        };

        match prev {
            Some(prev_id) => self.slot_mut(prev_id).entry.next = next,
            None => self.head = next,
        }
        match next {
            Some(next_id) => self.slot_mut(next_id).entry.prev = prev,
            None => self.tail = prev,
        }

        let entry = &mut self.slot_mut(id).entry;
        entry.prev = None;
        entry.next = None;
        entry.linked = false;
    }

    /// Marks recent use by moving a linked entry to the head.
    pub fn touch(&mut self, id: EntryId) {
        if !self.slot(id).entry.linked || self.head == Some(id) {
            return;
        }
        self.unlink(id);
        self.link_head(id);
    }

    /// Detaches the entry from the ring; it may still be borrowed.
    pub fn purge(&mut self, id: EntryId) {
        self.unlink(id);
    }

    /// Takes one more reference and marks the entry recently used.
    ///
    /// An idle entry outside the ring was never counted as free and is
    /// borrowed without touching the count.
    ///
    /// # Panics
    /// Panics if a linked idle entry finds the free count already at zero.
    pub fn addref(&mut self, id: EntryId) {
        let (acquired, linked) = {
            let entry = &self.slot(id).entry;
            (entry.acquired, entry.linked)
        };
        if acquired == 0 && linked {
            if self.free_cached_entries == 0 {
                error!(entry = id.0, "idle entry in the LRU ring is not counted as free");
                panic!("lru accounting corrupted: addref on uncounted idle entry {}", id.0);
            }
            self.free_cached_entries -= 1;
        }
        self.slot_mut(id).entry.acquired += 1;
        self.touch(id);
    }

    /// Drops one reference.
    ///
    /// # Panics
    /// Panics if the count would go negative, a double release.
    pub fn delref(&mut self, id: EntryId) -> Release {
        let entry = &mut self.slot_mut(id).entry;
        entry.acquired -= 1;
        if entry.acquired > 0 {
            return Release::Held;
        }
        if entry.acquired < 0 {
            let acquired = entry.acquired;
            error!(entry = id.0, acquired, "lru reference count went negative");
            panic!("lru delref: reference count of entry {} is {}", id.0, acquired);
        }
        if entry.linked {
            self.free_cached_entries += 1;
            Release::Pooled
        } else {
            Release::Dispose
        }
    }

    /// Evicts the least recently used idle entry if more than `target` are idle.
    ///
    /// # Panics
    /// Panics when the free count exceeds `target` but the ring holds no idle
    /// entry: the accounting is corrupted.
    pub fn evict_one(&mut self, target: usize) -> Option<(EntryId, T)> {
        if self.free_cached_entries <= target {
            return None;
        }

        let mut cursor = self.tail;
        while let Some(id) = cursor {
            let entry = &self.slot(id).entry;
            if entry.acquired <= 0 {
                self.purge(id);
                self.free_cached_entries -= 1;
                let slot = self.slots[id.0].take().expect("lru entry exists");
                self.vacant.push(id.0);
                return Some((id, slot.value));
            }
            cursor = entry.prev;
        }

        error!(
            free = self.free_cached_entries,
            target, "free entries are counted but none is in the LRU ring"
        );
        panic!(
            "lru accounting corrupted: {} free entries counted (target {}), none found",
            self.free_cached_entries, target
        );
    }

    /// Evicts idle entries down to `target`, handing each value to `dispose`.
    ///
    /// Returns the number of evicted entries.
    pub fn gc<F>(&mut self, target: usize, mut dispose: F) -> usize
    where
        F: FnMut(EntryId, T),
    {
        let mut evicted = 0;
        while let Some((id, value)) = self.evict_one(target) {
            dispose(id, value);
            evicted += 1;
        }
        evicted
    }

    /// Linked entry ids from most to least recently used.
    pub fn recency(&self) -> Vec<EntryId> {
        let mut ids = Vec::new();
        let mut cursor = self.head;
        while let Some(id) = cursor {
            ids.push(id);
            cursor = self.slot(id).entry.next;
        }
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle(list: &mut LruList<&'static str>, value: &'static str) -> EntryId {
        let id = list.insert_new(value);
        assert_eq!(list.delref(id), Release::Pooled);
        id
    }

    #[test]
    fn insert_new_links_at_head_as_borrowed() {
        let mut list = LruList::new();
        let a = list.insert_new("a");
        let b = list.insert_new("b");
        assert_eq!(list.recency(), vec![b, a]);
        assert_eq!(list.acquired(a), 1);
        assert_eq!(list.free_cached_entries(), 0);
    }

    #[test]
    fn insert_starts_unlinked_and_idle() {
        let mut list = LruList::new();
        let a = list.insert("a");
        assert!(!list.is_linked(a));
        assert_eq!(list.acquired(a), 0);
        list.link_tail(a);
        assert_eq!(list.recency(), vec![a]);
    }

    #[test]
    fn touch_moves_to_head() {
        let mut list = LruList::new();
        let a = list.insert_new("a");
        let b = list.insert_new("b");
        let c = list.insert_new("c");
        list.touch(a);
        assert_eq!(list.recency(), vec![a, c, b]);
        list.touch(a);
        assert_eq!(list.recency(), vec![a, c, b]);
    }

    #[test]
    fn link_tail_puts_entry_last() {
        let mut list = LruList::new();
        let a = list.insert_new("a");
        let b = list.insert_uncached("b");
        list.link_tail(b);
        assert_eq!(list.recency(), vec![a, b]);
        assert_eq!(list.acquired(b), 1);
    }

    #[test]
    fn addref_and_delref_track_free_entries() {
        let mut list = LruList::new();
        let a = idle(&mut list, "a");
        assert_eq!(list.free_cached_entries(), 1);

        list.addref(a);
        assert_eq!(list.free_cached_entries(), 0);
        list.addref(a);
        assert_eq!(list.acquired(a), 2);

        assert_eq!(list.delref(a), Release::Held);
        assert_eq!(list.delref(a), Release::Pooled);
        assert_eq!(list.free_cached_entries(), 1);
    }

    #[test]
    fn purged_entry_is_disposed_on_last_release() {
        let mut list = LruList::new();
        let a = list.insert_new("a");
        list.purge(a);
        assert!(!list.is_linked(a));
        assert!(list.recency().is_empty());
        assert_eq!(list.delref(a), Release::Dispose);
        assert_eq!(list.free_cached_entries(), 0);
    }

    #[test]
    fn uncached_entry_is_disposed_on_release() {
        let mut list = LruList::new();
        let a = list.insert_uncached("a");
        assert_eq!(list.delref(a), Release::Dispose);
        assert_eq!(list.remove(a), Some("a"));
        assert!(list.is_empty());
    }

    #[test]
    #[should_panic(expected = "reference count")]
    fn delref_below_zero_panics() {
        let mut list = LruList::new();
        let a = idle(&mut list, "a");
        list.delref(a);
    }

    #[test]
    fn addref_on_unlinked_idle_entry_leaves_count_alone() {
        let mut list = LruList::new();
        let a = list.insert("a");
        list.addref(a);
        assert_eq!(list.acquired(a), 1);
        assert_eq!(list.free_cached_entries(), 0);
        assert!(list.recency().is_empty());
        assert_eq!(list.delref(a), Release::Dispose);
    }

    #[test]
    #[should_panic(expected = "accounting corrupted")]
    fn addref_on_uncounted_linked_entry_panics() {
        let mut list = LruList::new();
        let a = list.insert("a");
        list.link_tail(a);
        list.addref(a);
    }

    #[test]
    #[should_panic(expected = "accounting corrupted")]
    fn gc_panics_when_counted_entry_left_the_ring() {
        let mut list = LruList::new();
        let a = idle(&mut list, "a");
        assert_eq!(list.free_cached_entries(), 1);
        list.unlink(a);
        list.gc(0, |_, _| {});
    }

    #[test]
    fn gc_evicts_least_recent_idle_entries() {
        let mut list = LruList::new();
        let a = idle(&mut list, "a");
        let busy = list.insert_new("busy");
        let b = idle(&mut list, "b");
        let c = idle(&mut list, "c");
        // Ring: c, b, busy, a
        list.touch(a);

        let mut evicted = Vec::new();
        let count = list.gc(1, |_, value| evicted.push(value));
        assert_eq!(count, 2);
        assert_eq!(evicted, vec!["b", "c"]);
        assert_eq!(list.recency(), vec![a, busy]);
        assert_eq!(list.free_cached_entries(), 1);
        assert!(list.get(b).is_none());
        assert!(list.get(c).is_none());
    }

    #[test]
    fn gc_never_touches_borrowed_entries() {
        let mut list = LruList::new();
        let a = list.insert_new("a");
        let b = list.insert_new("b");
        assert_eq!(list.gc(0, |_, _| panic!("nothing is idle")), 0);
        assert_eq!(list.recency(), vec![b, a]);
    }

    #[test]
    fn remove_uncounts_linked_idle_entry() {
        let mut list = LruList::new();
        let a = idle(&mut list, "a");
        assert_eq!(list.remove(a), Some("a"));
        assert_eq!(list.free_cached_entries(), 0);
        assert!(list.recency().is_empty());
    }

    #[test]
    fn slots_are_recycled() {
        let mut list = LruList::new();
        let a = list.insert_uncached("a");
        list.delref(a);
        list.remove(a);
        let b = list.insert_new("b");
        assert_eq!(a.index(), b.index());
        assert_eq!(list.len(), 1);
    }
}
