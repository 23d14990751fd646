//! Free-list node pool
//!
//! Map and trie nodes live in a slab owned by the structure that uses them.
//! Freed slots are threaded onto an intrusive free list and handed back out
//! before the slab grows, so steady-state operation on a completion-callback
//! thread never reaches the general allocator.
//!
//! The pool itself is not synchronized. Whether it is thread-local or
//! guarded by a spinlock is decided by the map that embeds it.

use tracing::error;

/// Index of a live node inside a [`NodePool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
enum Slot<T> {
    Occupied(T),
    Free { next: Option<NodeId> },
}

/// Slab of `T` with a LIFO free list
#[derive(Debug)]
pub struct NodePool<T> {
    slots: Vec<Slot<T>>,
    free_head: Option<NodeId>,
    live: usize,
    recycled: u64,
}

impl<T> NodePool<T> {
    pub const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_head: None,
            live: 0,
            recycled: 0,
        }
    }

    /// Pop the head of the free list, or grow the slab when it is empty.
    ///
    /// Growth failure is the one unrecoverable condition in the engine: the
    /// process is aborted rather than continuing without the node.
    pub fn alloc(&mut self, value: T) -> NodeId {
        self.alloc_with(|_| value)
    }

    /// Like [`NodePool::alloc`], for values that need their own id
    pub fn alloc_with(&mut self, init: impl FnOnce(NodeId) -> T) -> NodeId {
        if let Some(id) = self.free_head {
            self.free_head = match self.slots[id.index()] {
                Slot::Free { next } => next,
                Slot::Occupied(_) => unreachable!("free list points at a live node"),
            };
            self.slots[id.index()] = Slot::Occupied(init(id));
            self.live += 1;
            self.recycled += 1;
            return id;
        }

        if self.slots.len() >= u32::MAX as usize || self.slots.try_reserve(1).is_err() {
            error!(
                "node pool exhausted at {} slots; cannot continue without allocation",
                self.slots.len()
            );
            std::process::abort();
        }
        let id = NodeId(self.slots.len() as u32);
        self.slots.push(Slot::Occupied(init(id)));
        self.live += 1;
        id
    }

    /// Push a node back onto the free list, returning its value.
    ///
    /// Returns `None` if `id` is already free.
    pub fn free(&mut self, id: NodeId) -> Option<T> {
        let slot = self.slots.get_mut(id.index())?;
        if matches!(slot, Slot::Free { .. }) {
            return None;
        }
        let old = std::mem::replace(slot, Slot::Free { next: self.free_head });
        self.free_head = Some(id);
        self.live -= 1;
        match old {
            Slot::Occupied(value) => Some(value),
            Slot::Free { .. } => None,
        }
    }

    pub fn get(&self, id: NodeId) -> Option<&T> {
        match self.slots.get(id.index())? {
            Slot::Occupied(value) => Some(value),
            Slot::Free { .. } => None,
        }
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut T> {
        match self.slots.get_mut(id.index())? {
            Slot::Occupied(value) => Some(value),
            Slot::Free { .. } => None,
        }
    }

    /// Number of live nodes
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Slots currently parked on the free list
    pub fn free_len(&self) -> usize {
        self.slots.len() - self.live
    }

    /// How many allocations were served from the free list
    pub fn recycled(&self) -> u64 {
        self.recycled
    }

    /// Release every node back to the free list, keeping the slab.
    pub fn clear(&mut self) {
        let mut next = None;
        for (index, slot) in self.slots.iter_mut().enumerate().rev() {
            *slot = Slot::Free { next };
            next = Some(NodeId(index as u32));
        }
        self.free_head = next;
        self.live = 0;
    }

    /// Iterate live nodes in slab order
    #[cfg(test)]
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied(value) => Some((NodeId(index as u32), value)),
                Slot::Free { .. } => None,
            })
    }
}

impl<T> std::ops::Index<NodeId> for NodePool<T> {
    type Output = T;

    /// Panics if `id` is not live; holding a freed id is a bug in the owner.
    fn index(&self, id: NodeId) -> &T {
        match &self.slots[id.index()] {
            Slot::Occupied(value) => value,
            Slot::Free { .. } => panic!("node {:?} is not live", id),
        }
    }
}

impl<T> std::ops::IndexMut<NodeId> for NodePool<T> {
    fn index_mut(&mut self, id: NodeId) -> &mut T {
        match &mut self.slots[id.index()] {
            Slot::Occupied(value) => value,
            Slot::Free { .. } => panic!("node {:?} is not live", id),
        }
    }
}

impl<T> Default for NodePool<T> {
    fn default() -> Self {
        Self::new()
    }
}
