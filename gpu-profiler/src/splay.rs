//! Self-adjusting keyed map
//!
//! Every map in the engine (context map, correlation maps, ip-norm maps, trie
//! child indexes) is an instance of [`SplayMap`]. Each access splays the
//! touched key to the root, so the handles a thread keeps hitting (the
//! current context, the launch site it just saw) stay one step away.
//!
//! Nodes come from an embedded [`NodePool`]; the map never allocates once the
//! pool has warmed up. Locking is a property of the instantiation: use
//! [`SplayMap`] directly for thread-local maps and [`SharedSplayMap`] for maps
//! shared between application threads and the completion-callback thread.

use crate::freelist::{NodeId, NodePool};
use std::cmp::Ordering;

#[derive(Debug)]
struct SplayNode<K, V> {
    key: K,
    value: V,
    left: Option<NodeId>,
    right: Option<NodeId>,
}

/// Order in which [`SplayMap::forall`] visits entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraversalOrder {
    PreOrder,
    InOrder,
    PostOrder,
}

/// Splay tree keyed by `K`
#[derive(Debug)]
pub struct SplayMap<K, V> {
    pool: NodePool<SplayNode<K, V>>,
    root: Option<NodeId>,
}

impl<K: Ord, V> SplayMap<K, V> {
    pub const fn new() -> Self {
        Self {
            pool: NodePool::new(),
            root: None,
        }
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Insert `key` unless it is already present.
    ///
    /// A duplicate key leaves the existing entry untouched and drops `value`;
    /// the return value tells the caller which case happened.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        let Some(root) = self.root else {
            self.root = Some(self.pool.alloc(SplayNode {
                key,
                value,
                left: None,
                right: None,
            }));
            return true;
        };
        let root = self.splay_from(root, &key);
        match key.cmp(&self.node(root).key) {
            Ordering::Equal => {
                self.root = Some(root);
                false
            }
            Ordering::Less => {
                let left = self.node(root).left;
                self.node_mut(root).left = None;
                self.root = Some(self.pool.alloc(SplayNode {
                    key,
                    value,
                    left,
                    right: Some(root),
                }));
                true
            }
            Ordering::Greater => {
                let right = self.node(root).right;
                self.node_mut(root).right = None;
                self.root = Some(self.pool.alloc(SplayNode {
                    key,
                    value,
                    left: Some(root),
                    right,
                }));
                true
            }
        }
    }

    pub fn lookup(&mut self, key: &K) -> Option<&V> {
        let root = self.splay(key)?;
        let node = self.node(root);
        (node.key == *key).then_some(&node.value)
    }

    pub fn lookup_mut(&mut self, key: &K) -> Option<&mut V> {
        let root = self.splay(key)?;
        if self.node(root).key != *key {
            return None;
        }
        Some(&mut self.node_mut(root).value)
    }

    pub fn contains(&mut self, key: &K) -> bool {
        self.lookup(key).is_some()
    }

    /// Insert-if-absent, then hand back the (possibly pre-existing) value.
    ///
    /// `init` runs only on a miss, and the node is linked after it returns,
    /// so nobody ever sees a half-built entry.
    pub fn get_or_insert_with(&mut self, key: K, init: impl FnOnce() -> V) -> &mut V {
        let hit = match self.splay(&key) {
            Some(root) => self.node(root).key == key,
            None => false,
        };
        if !hit {
            self.insert(key, init());
        }
        match self.root {
            Some(root) => &mut self.node_mut(root).value,
            None => unreachable!("root missing right after insert"),
        }
    }

    /// Remove `key`, returning its value. An absent key leaves the tree as is.
    pub fn delete(&mut self, key: &K) -> Option<V> {
        let root = self.splay(key)?;
        if self.node(root).key != *key {
            return None;
        }
        let (left, right) = {
            let node = self.node(root);
            (node.left, node.right)
        };
        self.root = match left {
            None => right,
            Some(left) => {
                // every key on the left is smaller, so the splay brings the
                // maximum up and leaves its right link empty
                let new_root = self.splay_from(left, key);
                self.node_mut(new_root).right = right;
                Some(new_root)
            }
        };
        self.pool.free(root).map(|node| node.value)
    }

    /// Visit every entry in the requested order.
    pub fn forall(&self, order: TraversalOrder, mut visitor: impl FnMut(&K, &V)) {
        let Some(root) = self.root else { return };
        match order {
            TraversalOrder::PreOrder => {
                let mut stack = vec![root];
                while let Some(id) = stack.pop() {
                    let node = self.node(id);
                    visitor(&node.key, &node.value);
                    stack.extend(node.right);
                    stack.extend(node.left);
                }
            }
            TraversalOrder::InOrder => {
                let mut stack = Vec::new();
                let mut cursor = Some(root);
                while cursor.is_some() || !stack.is_empty() {
                    while let Some(id) = cursor {
                        stack.push(id);
                        cursor = self.node(id).left;
                    }
                    if let Some(id) = stack.pop() {
                        let node = self.node(id);
                        visitor(&node.key, &node.value);
                        cursor = node.right;
                    }
                }
            }
            TraversalOrder::PostOrder => {
                // reverse of a (node, right, left) pre-order
                let mut stack = vec![root];
                let mut out = Vec::with_capacity(self.len());
                while let Some(id) = stack.pop() {
                    out.push(id);
                    let node = self.node(id);
                    stack.extend(node.left);
                    stack.extend(node.right);
                }
                for id in out.into_iter().rev() {
                    let node = self.node(id);
                    visitor(&node.key, &node.value);
                }
            }
        }
    }

    /// Keys in ascending order
    #[cfg(test)]
    pub fn keys(&self) -> Vec<K>
    where
        K: Clone,
    {
        let mut keys = Vec::with_capacity(self.len());
        self.forall(TraversalOrder::InOrder, |k, _| keys.push(k.clone()));
        keys
    }

    /// Drop every entry; node storage is kept for reuse.
    pub fn clear(&mut self) {
        self.pool.clear();
        self.root = None;
    }

    fn splay(&mut self, key: &K) -> Option<NodeId> {
        let root = self.root?;
        let root = self.splay_from(root, key);
        self.root = Some(root);
        Some(root)
    }

    /// Top-down splay of the subtree rooted at `t`; returns the new root.
    fn splay_from(&mut self, mut t: NodeId, key: &K) -> NodeId {
        let mut left_root: Option<NodeId> = None;
        let mut left_max: Option<NodeId> = None;
        let mut right_root: Option<NodeId> = None;
        let mut right_min: Option<NodeId> = None;

        loop {
            match key.cmp(&self.node(t).key) {
                Ordering::Less => {
                    let Some(mut child) = self.node(t).left else { break };
                    if *key < self.node(child).key {
                        // rotate right
                        self.node_mut(t).left = self.node(child).right;
                        self.node_mut(child).right = Some(t);
                        t = child;
                        match self.node(t).left {
                            Some(next) => child = next,
                            None => break,
                        }
                    }
                    // link right
                    match right_min {
                        Some(min) => self.node_mut(min).left = Some(t),
                        None => right_root = Some(t),
                    }
                    right_min = Some(t);
                    t = child;
                }
                Ordering::Greater => {
                    let Some(mut child) = self.node(t).right else { break };
                    if *key > self.node(child).key {
                        // rotate left
                        self.node_mut(t).right = self.node(child).left;
                        self.node_mut(child).left = Some(t);
                        t = child;
                        match self.node(t).right {
                            Some(next) => child = next,
                            None => break,
                        }
                    }
                    // link left
                    match left_max {
                        Some(max) => self.node_mut(max).right = Some(t),
                        None => left_root = Some(t),
                    }
                    left_max = Some(t);
                    t = child;
                }
                Ordering::Equal => break,
            }
        }

        // reassemble
        let (t_left, t_right) = {
            let node = self.node(t);
            (node.left, node.right)
        };
        match left_max {
            Some(max) => self.node_mut(max).right = t_left,
            None => left_root = t_left,
        }
        match right_min {
            Some(min) => self.node_mut(min).left = t_right,
            None => right_root = t_right,
        }
        let node = self.node_mut(t);
        node.left = left_root;
        node.right = right_root;
        t
    }

    fn node(&self, id: NodeId) -> &SplayNode<K, V> {
        match self.pool.get(id) {
            Some(node) => node,
            None => unreachable!("dangling splay link"),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut SplayNode<K, V> {
        match self.pool.get_mut(id) {
            Some(node) => node,
            None => unreachable!("dangling splay link"),
        }
    }
}

impl<K: Ord, V> Default for SplayMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// A [`SplayMap`] behind its own spinlock.
///
/// Lookups splay too, so every operation takes the lock. Entries are never
/// handed out by reference; callers work on them inside a closure.
#[derive(Debug)]
pub struct SharedSplayMap<K, V> {
    inner: spin::Mutex<SplayMap<K, V>>,
}

impl<K: Ord, V> SharedSplayMap<K, V> {
    pub const fn new() -> Self {
        Self {
            inner: spin::Mutex::new(SplayMap::new()),
        }
    }

    pub fn insert(&self, key: K, value: V) -> bool {
        self.inner.lock().insert(key, value)
    }

    /// Run `f` on the entry for `key`, if present.
    pub fn lookup_with<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        self.inner.lock().lookup_mut(key).map(f)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().contains(key)
    }

    /// Insert-if-absent, then run `f` on the entry.
    pub fn upsert_with<R>(
        &self,
        key: K,
        init: impl FnOnce() -> V,
        f: impl FnOnce(&mut V) -> R,
    ) -> R {
        let mut map = self.inner.lock();
        f(map.get_or_insert_with(key, init))
    }

    pub fn delete(&self, key: &K) -> Option<V> {
        self.inner.lock().delete(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Run `f` with the whole map locked
    pub fn with<R>(&self, f: impl FnOnce(&mut SplayMap<K, V>) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl<K: Ord, V> Default for SharedSplayMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
