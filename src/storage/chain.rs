//! Sorted doubly linked version list backed by a slab.
//!
//! Nodes live in a `Vec` of slots and link to each other by index, so a
//! [`NodeHandle`] stays valid until its node is deleted. Handles carry a
//! generation; a handle to a deleted node never aliases a later insert.
//!
//! The chain is ordered by [`ChainKey::chain_ts`] descending from the scan
//! origin. Uncommitted versions report [`UNCOMMIT_TS`](crate::types::UNCOMMIT_TS)
//! and therefore sit nearest the origin; committed versions follow, most
//! recent first. Equal keys keep insertion order: a fresh insert stays in
//! front of older peers.
//!
//! The chain is not synchronized; owners guard it with their own lock.

use crate::types::Timestamp;

/// Sort key of a chain element.
pub trait ChainKey {
    /// Timestamp ordering this element; larger sorts nearer the origin.
    fn chain_ts(&self) -> Timestamp;
}

/// Stable reference to one chain node.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct NodeHandle {
    index: u32,
    generation: u32,
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
    // Toward the origin.
    prev: Option<u32>,
    // Toward the oldest end.
    next: Option<u32>,
}

/// Sorted version list with O(1) deletion by handle.
pub struct VersionChain<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl<T> Default for VersionChain<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }
}

impl<T: ChainKey> VersionChain<T> {
    /// Creates an empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live nodes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` when the chain has no nodes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Links `value` at the origin and sifts it toward the oldest end until
    /// order is restored.
    pub fn insert(&mut self, value: T) -> NodeHandle {
        let idx = self.alloc(value);
        let head = self.head;
        self.link_between(idx, None, head);
        self.sift_back(idx);
        self.handle_of(idx)
    }

    /// Links `value` at the oldest end and sifts it toward the origin.
    pub fn insert_oldest(&mut self, value: T) -> NodeHandle {
        let idx = self.alloc(value);
        let tail = self.tail;
        self.link_between(idx, tail, None);
        self.sift_front(idx);
        self.handle_of(idx)
    }

    /// Unlinks the node and returns its value; `None` for a stale handle.
    pub fn delete(&mut self, handle: NodeHandle) -> Option<T> {
        let idx = self.live_index(handle)?;
        self.unlink(idx);
        let slot = &mut self.slots[idx as usize];
        slot.generation = slot.generation.wrapping_add(1);
        let value = slot.value.take();
        self.free.push(idx);
        self.len -= 1;
        value
    }

    /// Re-sorts the node after its key changed. Returns `false` for a stale handle.
    pub fn update(&mut self, handle: NodeHandle) -> bool {
        let Some(idx) = self.live_index(handle) else {
            return false;
        };
        self.sift_back(idx);
        self.sift_front(idx);
        true
    }

    /// Returns the value behind `handle`.
    pub fn get(&self, handle: NodeHandle) -> Option<&T> {
        let idx = self.live_index(handle)?;
        self.slots[idx as usize].value.as_ref()
    }

    /// Returns the value behind `handle` mutably. Call [`Self::update`] if the
    /// key changes.
    pub fn get_mut(&mut self, handle: NodeHandle) -> Option<&mut T> {
        let idx = self.live_index(handle)?;
        self.slots[idx as usize].value.as_mut()
    }

    /// Node at the scan origin.
    pub fn origin(&self) -> Option<(NodeHandle, &T)> {
        let idx = self.head?;
        Some((self.handle_of(idx), self.value_at(idx)))
    }

    /// Node at the oldest end.
    pub fn oldest(&self) -> Option<(NodeHandle, &T)> {
        let idx = self.tail?;
        Some((self.handle_of(idx), self.value_at(idx)))
    }

    /// Visits nodes in chain order until `visit` returns `false`.
    ///
    /// `from_origin` walks newest to oldest; otherwise oldest to newest.
    pub fn scan<F>(&self, from_origin: bool, mut visit: F)
    where
        F: FnMut(NodeHandle, &T) -> bool,
    {
        let mut cursor = if from_origin { self.head } else { self.tail };
        while let Some(idx) = cursor {
            let slot = &self.slots[idx as usize];
            if !visit(self.handle_of(idx), self.value_at(idx)) {
                break;
            }
            cursor = if from_origin { slot.next } else { slot.prev };
        }
    }

    /// Iterates values from the origin.
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let idx = cursor?;
            cursor = self.slots[idx as usize].next;
            Some(self.value_at(idx))
        })
    }

    fn alloc(&mut self, value: T) -> u32 {
        self.len += 1;
        if let Some(idx) = self.free.pop() {
            let slot = &mut self.slots[idx as usize];
            slot.value = Some(value);
            slot.prev = None;
            slot.next = None;
            return idx;
        }
        let idx = u32::try_from(self.slots.len()).unwrap_or_else(|_| panic!("version chain full"));
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
            prev: None,
            next: None,
        });
        idx
    }

    fn handle_of(&self, idx: u32) -> NodeHandle {
        NodeHandle {
            index: idx,
            generation: self.slots[idx as usize].generation,
        }
    }

    fn live_index(&self, handle: NodeHandle) -> Option<u32> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation == handle.generation && slot.value.is_some() {
            Some(handle.index)
        } else {
            None
        }
    }

    fn value_at(&self, idx: u32) -> &T {
        match &self.slots[idx as usize].value {
            Some(value) => value,
            None => panic!("version chain links a vacant slot {idx}"),
        }
    }

    fn key(&self, idx: u32) -> Timestamp {
        self.value_at(idx).chain_ts()
    }

    fn unlink(&mut self, idx: u32) {
        let (prev, next) = {
            let slot = &self.slots[idx as usize];
            (slot.prev, slot.next)
        };
        match prev {
            Some(p) => self.slots[p as usize].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n as usize].prev = prev,
            None => self.tail = prev,
        }
        let slot = &mut self.slots[idx as usize];
        slot.prev = None;
        slot.next = None;
    }

    fn link_between(&mut self, idx: u32, prev: Option<u32>, next: Option<u32>) {
        {
            let slot = &mut self.slots[idx as usize];
            slot.prev = prev;
            slot.next = next;
        }
        match prev {
            Some(p) => self.slots[p as usize].next = Some(idx),
            None => self.head = Some(idx),
        }
        match next {
            Some(n) => self.slots[n as usize].prev = Some(idx),
            None => self.tail = Some(idx),
        }
    }

    fn sift_back(&mut self, idx: u32) {
        while let Some(next) = self.slots[idx as usize].next {
            if self.key(idx) >= self.key(next) {
                break;
            }
            self.unlink(idx);
            let after = self.slots[next as usize].next;
            self.link_between(idx, Some(next), after);
        }
    }

    fn sift_front(&mut self, idx: u32) {
        while let Some(prev) = self.slots[idx as usize].prev {
            if self.key(idx) <= self.key(prev) {
                break;
            }
            self.unlink(idx);
            let before = self.slots[prev as usize].prev;
            self.link_between(idx, before, Some(prev));
        }
    }
}
