//! Range trie
//!
//! Per-thread trie over the launch sites a thread has walked since it last
//! returned to the root. Appending a site that already follows the cursor
//! means the thread is replaying a path it has launched before, so the range
//! recorded on that step can be reused instead of sampled again.
//!
//! Nodes hold runs of keys: a straight-line path is stored in one node and
//! the cursor is a (node, offset) pair. Fresh appends create one-key nodes;
//! once the number of nodes between the root and the cursor passes the
//! compression threshold, every single-child chain is folded into its head.

use crate::freelist::{NodeId, NodePool};
use crate::splay::{SplayMap, TraversalOrder};
use crate::telemetry;
use stride_shared::{CctNodeId, ContextId, RangeId};
use tracing::debug;

pub const DEFAULT_COMPRESS_THRESHOLD: usize = 100_000;

#[derive(Debug)]
struct TrieNode {
    parent: Option<NodeId>,
    keys: Vec<CctNodeId>,
    /// Range each key was launched under; parallel to `keys`
    ranges: Vec<RangeId>,
    /// Keyed by the first key of each child
    children: SplayMap<CctNodeId, NodeId>,
}

impl TrieNode {
    fn new(parent: Option<NodeId>, keys: Vec<CctNodeId>, ranges: Vec<RangeId>) -> Self {
        Self {
            parent,
            keys,
            ranges,
            children: SplayMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    node: NodeId,
    offset: usize,
}

/// What the last [`RangeTrie::flush`] reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrieFlush {
    pub context: ContextId,
    pub range: RangeId,
    pub active: bool,
    pub logic: bool,
}

#[derive(Debug)]
pub struct RangeTrie {
    nodes: NodePool<TrieNode>,
    root: NodeId,
    cursor: Cursor,
    /// Keys between the root and the cursor
    depth: usize,
    /// Trie nodes between the root and the cursor
    physical_depth: usize,
    compress_threshold: usize,
    compress_at: usize,
    last_flush: Option<TrieFlush>,
    flushes: u64,
    compressions: u64,
}

impl RangeTrie {
    pub fn new(compress_threshold: usize) -> Self {
        let mut nodes = NodePool::new();
        let root = nodes.alloc(TrieNode::new(None, Vec::new(), Vec::new()));
        let compress_threshold = compress_threshold.max(1);
        Self {
            nodes,
            root,
            cursor: Cursor { node: root, offset: 0 },
            depth: 0,
            physical_depth: 0,
            compress_threshold,
            compress_at: compress_threshold,
            last_flush: None,
            flushes: 0,
            compressions: 0,
        }
    }

    fn cursor_at_end(&self) -> bool {
        self.cursor.offset + 1 >= self.nodes[self.cursor.node].keys.len()
    }

    /// Step from the cursor to `key`.
    ///
    /// Returns true if that step already existed (the path is a repeat),
    /// false if it was created here, stamped with `range`.
    pub fn append(&mut self, range: RangeId, key: CctNodeId) -> bool {
        let Cursor { node, offset } = self.cursor;
        if !self.cursor_at_end() {
            if self.nodes[node].keys[offset + 1] == key {
                self.cursor.offset += 1;
                self.depth += 1;
                return true;
            }
            self.split(node, offset + 1);
        }

        if let Some(child) = self.nodes[node].children.lookup(&key).copied() {
            self.cursor = Cursor { node: child, offset: 0 };
            self.depth += 1;
            self.physical_depth += 1;
            return true;
        }

        let child = self
            .nodes
            .alloc(TrieNode::new(Some(node), vec![key], vec![range]));
        self.nodes[node].children.insert(key, child);
        self.cursor = Cursor { node: child, offset: 0 };
        self.depth += 1;
        self.physical_depth += 1;
        if self.physical_depth > self.compress_at {
            self.compress();
        }
        false
    }

    /// Whether appending `key` would follow an existing step
    pub fn is_repeat(&mut self, key: CctNodeId) -> bool {
        let Cursor { node, offset } = self.cursor;
        if self.cursor_at_end() {
            self.nodes[node].children.contains(&key)
        } else {
            self.nodes[node].keys[offset + 1] == key
        }
    }

    /// Cut `node` before `at`; the tail keeps the original children.
    fn split(&mut self, node: NodeId, at: usize) {
        let head = &mut self.nodes[node];
        let keys = head.keys.split_off(at);
        let ranges = head.ranges.split_off(at);
        let children = std::mem::take(&mut head.children);
        let first = keys[0];

        let mut tail = TrieNode::new(Some(node), keys, ranges);
        tail.children = children;
        let tail = self.nodes.alloc(tail);
        self.reparent_children(tail);
        self.nodes[node].children.insert(first, tail);
    }

    fn child_ids(&self, node: NodeId) -> Vec<NodeId> {
        let mut ids = Vec::new();
        self.nodes[node]
            .children
            .forall(TraversalOrder::InOrder, |_, child| ids.push(*child));
        ids
    }

    fn reparent_children(&mut self, node: NodeId) {
        for child in self.child_ids(node) {
            self.nodes[child].parent = Some(node);
        }
    }

    /// Range recorded for the step under the cursor; `None` at the root.
    pub fn current_range(&self) -> Option<RangeId> {
        let node = &self.nodes[self.cursor.node];
        node.ranges.get(self.cursor.offset).copied()
    }

    /// Overwrite the range recorded for the step under the cursor.
    pub fn stamp(&mut self, range: RangeId) {
        let Cursor { node, offset } = self.cursor;
        if let Some(slot) = self.nodes[node].ranges.get_mut(offset) {
            *slot = range;
        }
    }

    /// Close the path walked so far and return the range it ended in.
    ///
    /// With `logic` the cursor stays where it is and only the report is made;
    /// otherwise the cursor returns to the root. `active` records whether PC
    /// sampling ran for the closed range.
    pub fn flush(&mut self, context: ContextId, active: bool, logic: bool) -> RangeId {
        let prior = self.current_range().unwrap_or(RangeId::DEFAULT);
        self.last_flush = Some(TrieFlush {
            context,
            range: prior,
            active,
            logic,
        });
        self.flushes += 1;
        if !logic {
            self.cursor = Cursor {
                node: self.root,
                offset: 0,
            };
            self.depth = 0;
            self.physical_depth = 0;
        }
        prior
    }

    /// Move the cursor up one key. Returns false at the root.
    pub fn unwind(&mut self) -> bool {
        let Cursor { node, offset } = self.cursor;
        if node == self.root {
            return false;
        }
        if offset > 0 {
            self.cursor.offset -= 1;
        } else {
            let parent = self.nodes[node].parent.unwrap_or(self.root);
            let parent_len = self.nodes[parent].keys.len();
            self.cursor = Cursor {
                node: parent,
                offset: parent_len.saturating_sub(1),
            };
            self.physical_depth -= 1;
        }
        self.depth -= 1;
        true
    }

    /// Fold every single-child chain below the root into its head node.
    pub fn compress(&mut self) {
        let before = self.nodes.len();
        let mut stack = self.child_ids(self.root);
        while let Some(node) = stack.pop() {
            loop {
                let children = self.child_ids(node);
                if children.len() != 1 {
                    stack.extend(children);
                    break;
                }
                let only = children[0];
                let Some(child) = self.nodes.free(only) else { break };
                let head = &mut self.nodes[node];
                let base = head.keys.len();
                head.keys.extend(child.keys);
                head.ranges.extend(child.ranges);
                head.children = child.children;
                self.reparent_children(node);
                if self.cursor.node == only {
                    self.cursor = Cursor {
                        node,
                        offset: base + self.cursor.offset,
                    };
                }
            }
        }

        self.physical_depth = self.physical_depth_of(self.cursor.node);
        self.compress_at = self.compress_threshold.max(self.physical_depth.saturating_mul(2));
        self.compressions += 1;
        telemetry::TRIE_COMPRESSIONS.inc();
        debug!(
            "range trie compressed: {} -> {} nodes, cursor depth {} ({} nodes)",
            before,
            self.nodes.len(),
            self.depth,
            self.physical_depth
        );
    }

    fn physical_depth_of(&self, mut node: NodeId) -> usize {
        let mut depth = 0;
        while let Some(parent) = self.nodes[node].parent {
            depth += 1;
            node = parent;
        }
        depth
    }

    /// Release every node; the trie is empty afterwards.
    pub fn cleanup(&mut self) {
        self.nodes.clear();
        self.root = self.nodes.alloc(TrieNode::new(None, Vec::new(), Vec::new()));
        self.cursor = Cursor {
            node: self.root,
            offset: 0,
        };
        self.depth = 0;
        self.physical_depth = 0;
        self.compress_at = self.compress_threshold;
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn physical_depth(&self) -> usize {
        self.physical_depth
    }

    pub fn at_root(&self) -> bool {
        self.cursor.node == self.root
    }

    /// Live trie nodes, the root included
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn last_flush(&self) -> Option<TrieFlush> {
        self.last_flush
    }

    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    pub fn compressions(&self) -> u64 {
        self.compressions
    }
}

impl Default for RangeTrie {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESS_THRESHOLD)
    }
}
