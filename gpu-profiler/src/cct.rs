//! Calling-context tree interface
//!
//! The engine never builds calling contexts itself; it inserts below nodes it
//! was handed through [`CallingContextTree`]. [`InMemoryCct`] is the tree the
//! CLI and tests use.

use crate::splay::SplayMap;
use serde::Serialize;
use stride_shared::{CctNodeId, ContextId, IpNormalized, RangeId};

/// What a node stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum CctAddr {
    Root,
    Context(ContextId),
    Range(RangeId),
    Ip(IpNormalized),
}

impl std::fmt::Display for CctAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CctAddr::Root => f.write_str("<root>"),
            CctAddr::Context(id) => write!(f, "{}", id),
            CctAddr::Range(id) => write!(f, "range{}", id),
            CctAddr::Ip(ip) => write!(f, "{}", ip),
        }
    }
}

/// Insertion primitives the engine needs from a calling-context tree.
///
/// Inserts are insert-if-absent: asking for an existing child returns it.
pub trait CallingContextTree: Send + Sync {
    fn root(&self) -> CctNodeId;

    fn insert_context(&self, parent: CctNodeId, context: ContextId) -> CctNodeId;

    fn insert_range(&self, parent: CctNodeId, range: RangeId) -> CctNodeId;

    /// `retain` marks the node as one that must survive pruning
    fn insert_ip_norm(&self, parent: CctNodeId, ip: IpNormalized, retain: bool) -> CctNodeId;

    fn children(&self, node: CctNodeId) -> Vec<CctNodeId>;

    fn parent(&self, node: CctNodeId) -> Option<CctNodeId>;

    fn addr(&self, node: CctNodeId) -> Option<CctAddr>;
}

#[derive(Debug)]
struct CctNode {
    parent: Option<CctNodeId>,
    addr: CctAddr,
    retained: bool,
    children: SplayMap<CctAddr, CctNodeId>,
}

/// Arena-backed calling-context tree behind one spinlock
#[derive(Debug)]
pub struct InMemoryCct {
    nodes: spin::Mutex<Vec<CctNode>>,
}

impl InMemoryCct {
    pub fn new() -> Self {
        Self {
            nodes: spin::Mutex::new(vec![CctNode {
                parent: None,
                addr: CctAddr::Root,
                retained: true,
                children: SplayMap::new(),
            }]),
        }
    }

    fn insert(&self, parent: CctNodeId, addr: CctAddr, retain: bool) -> CctNodeId {
        let mut nodes = self.nodes.lock();
        let next = CctNodeId(nodes.len() as u64);
        let Some(parent_node) = nodes.get_mut(parent.0 as usize) else {
            return parent;
        };
        let child = *parent_node.children.get_or_insert_with(addr, || next);
        if child == next {
            nodes.push(CctNode {
                parent: Some(parent),
                addr,
                retained: retain,
                children: SplayMap::new(),
            });
        } else if retain {
            nodes[child.0 as usize].retained = true;
        }
        child
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        // the root is always present
        false
    }

    pub fn is_retained(&self, node: CctNodeId) -> bool {
        self.nodes
            .lock()
            .get(node.0 as usize)
            .map(|n| n.retained)
            .unwrap_or(false)
    }

    /// Addresses from the root (exclusive) down to `node`
    pub fn path(&self, node: CctNodeId) -> Vec<CctAddr> {
        let nodes = self.nodes.lock();
        let mut path = Vec::new();
        let mut cursor = Some(node);
        while let Some(id) = cursor {
            let Some(n) = nodes.get(id.0 as usize) else { break };
            if n.addr != CctAddr::Root {
                path.push(n.addr);
            }
            cursor = n.parent;
        }
        path.reverse();
        path
    }

    /// The range this node sits under, if any
    pub fn enclosing_range(&self, node: CctNodeId) -> Option<RangeId> {
        self.path(node).into_iter().rev().find_map(|addr| match addr {
            CctAddr::Range(id) => Some(id),
            _ => None,
        })
    }
}

impl Default for InMemoryCct {
    fn default() -> Self {
        Self::new()
    }
}

impl CallingContextTree for InMemoryCct {
    fn root(&self) -> CctNodeId {
        CctNodeId(0)
    }

    fn insert_context(&self, parent: CctNodeId, context: ContextId) -> CctNodeId {
        self.insert(parent, CctAddr::Context(context), false)
    }

    fn insert_range(&self, parent: CctNodeId, range: RangeId) -> CctNodeId {
        self.insert(parent, CctAddr::Range(range), false)
    }

    fn insert_ip_norm(&self, parent: CctNodeId, ip: IpNormalized, retain: bool) -> CctNodeId {
        self.insert(parent, CctAddr::Ip(ip), retain)
    }

    fn children(&self, node: CctNodeId) -> Vec<CctNodeId> {
        let nodes = self.nodes.lock();
        let mut out = Vec::new();
        if let Some(n) = nodes.get(node.0 as usize) {
            n.children
                .forall(crate::splay::TraversalOrder::InOrder, |_, child| out.push(*child));
        }
        out
    }

    fn parent(&self, node: CctNodeId) -> Option<CctNodeId> {
        self.nodes.lock().get(node.0 as usize).and_then(|n| n.parent)
    }

    fn addr(&self, node: CctNodeId) -> Option<CctAddr> {
        self.nodes.lock().get(node.0 as usize).map(|n| n.addr)
    }
}
