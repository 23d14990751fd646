//! Threads taking part in range profiling
//!
//! A circular singly linked list over an arena, so a broadcast can start at
//! any member and walk the ring once. Each member carries one notification
//! slot; the first notification written wins until its owner consumes it.

use crate::freelist::{NodeId, NodePool};
use std::sync::Arc;
use std::thread::ThreadId;
use stride_shared::{ContextId, RangeId};
use tracing::{debug, trace};

/// "A range you took part in has closed"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeNotification {
    pub context: ContextId,
    pub range: RangeId,
    /// PC sampling ran for the closed range
    pub active: bool,
    /// Report only; the receiver keeps its trie cursor
    pub logic: bool,
}

#[derive(Debug)]
pub struct RangeThreadEntry {
    thread: ThreadId,
    notification: spin::Mutex<Option<RangeNotification>>,
}

impl RangeThreadEntry {
    fn new(thread: ThreadId) -> Self {
        Self {
            thread,
            notification: spin::Mutex::new(None),
        }
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn pending(&self) -> Option<RangeNotification> {
        *self.notification.lock()
    }
}

#[derive(Debug)]
struct ListNode {
    entry: Arc<RangeThreadEntry>,
    next: NodeId,
}

#[derive(Debug, Default)]
struct Ring {
    nodes: NodePool<ListNode>,
    head: Option<NodeId>,
}

impl Ring {
    fn find(&self, thread: ThreadId) -> Option<NodeId> {
        let head = self.head?;
        let mut cursor = head;
        loop {
            if self.nodes[cursor].entry.thread == thread {
                return Some(cursor);
            }
            cursor = self.nodes[cursor].next;
            if cursor == head {
                return None;
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct RangeThreadList {
    ring: spin::Mutex<Ring>,
}

impl RangeThreadList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `thread`; adding a member again returns its existing entry.
    pub fn add(&self, thread: ThreadId) -> Arc<RangeThreadEntry> {
        let mut ring = self.ring.lock();
        if let Some(existing) = ring.find(thread) {
            return ring.nodes[existing].entry.clone();
        }
        let entry = Arc::new(RangeThreadEntry::new(thread));
        match ring.head {
            None => {
                let id = ring.nodes.alloc_with(|id| ListNode {
                    entry: entry.clone(),
                    next: id,
                });
                ring.head = Some(id);
            }
            Some(head) => {
                let after_head = ring.nodes[head].next;
                let id = ring.nodes.alloc(ListNode {
                    entry: entry.clone(),
                    next: after_head,
                });
                ring.nodes[head].next = id;
            }
        }
        debug!("range thread {:?} registered", thread);
        entry
    }

    /// Unlink `thread`. Returns false if it was not a member.
    pub fn remove(&self, thread: ThreadId) -> bool {
        let mut ring = self.ring.lock();
        let Some(head) = ring.head else { return false };
        let mut prev = head;
        loop {
            let current = ring.nodes[prev].next;
            if ring.nodes[current].entry.thread == thread {
                if current == prev {
                    ring.head = None;
                } else {
                    ring.nodes[prev].next = ring.nodes[current].next;
                    if ring.head == Some(current) {
                        ring.head = Some(prev);
                    }
                }
                ring.nodes.free(current);
                return true;
            }
            prev = current;
            if prev == head {
                return false;
            }
        }
    }

    /// Visit every member once, starting at the head
    pub fn apply(&self, visitor: impl FnMut(&Arc<RangeThreadEntry>)) {
        let ring = self.ring.lock();
        if let Some(head) = ring.head {
            Self::walk(&ring, head, visitor);
        }
    }

    /// Visit every member once, starting at `thread` (or the head if it is
    /// not a member)
    pub fn apply_from(&self, thread: ThreadId, visitor: impl FnMut(&Arc<RangeThreadEntry>)) {
        let ring = self.ring.lock();
        if let Some(start) = ring.find(thread).or(ring.head) {
            Self::walk(&ring, start, visitor);
        }
    }

    fn walk(ring: &Ring, start: NodeId, mut visitor: impl FnMut(&Arc<RangeThreadEntry>)) {
        let mut cursor = start;
        loop {
            visitor(&ring.nodes[cursor].entry);
            cursor = ring.nodes[cursor].next;
            if cursor == start {
                break;
            }
        }
    }

    /// Post `notification` to `entry`. An unconsumed notification is kept
    /// and the new one dropped; returns whether this one was stored.
    pub fn notification_update(&self, entry: &RangeThreadEntry, notification: RangeNotification) -> bool {
        let mut slot = entry.notification.lock();
        if slot.is_some() {
            trace!(
                "range thread {:?}: notification for range {} dropped, one is pending",
                entry.thread,
                notification.range
            );
            return false;
        }
        *slot = Some(notification);
        true
    }

    /// Take the pending notification of `entry`
    pub fn notification_clear(&self, entry: &RangeThreadEntry) -> Option<RangeNotification> {
        entry.notification.lock().take()
    }

    /// Drop every member
    pub fn clear(&self) {
        let mut ring = self.ring.lock();
        ring.nodes.clear();
        ring.head = None;
    }

    pub fn len(&self) -> usize {
        self.ring.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.lock().head.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_ids(n: usize) -> Vec<ThreadId> {
        (0..n)
            .map(|_| std::thread::spawn(|| std::thread::current().id()).join().unwrap())
            .collect()
    }

    fn notice(range: u32) -> RangeNotification {
        RangeNotification {
            context: ContextId(0),
            range: RangeId(range),
            active: true,
            logic: false,
        }
    }

    #[test]
    fn test_add_is_idempotent() {
        let list = RangeThreadList::new();
        let me = std::thread::current().id();
        let a = list.add(me);
        let b = list.add(me);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_apply_visits_each_member_once() {
        let list = RangeThreadList::new();
        let ids = spawn_ids(4);
        for id in &ids {
            list.add(*id);
        }
        let mut seen = Vec::new();
        list.apply(|entry| seen.push(entry.thread()));
        assert_eq!(seen.len(), 4);
        for id in &ids {
            assert!(seen.contains(id));
        }

        let mut from = Vec::new();
        list.apply_from(ids[2], |entry| from.push(entry.thread()));
        assert_eq!(from[0], ids[2]);
        assert_eq!(from.len(), 4);
    }

    #[test]
    fn test_first_notification_wins() {
        let list = RangeThreadList::new();
        let entry = list.add(std::thread::current().id());
        assert!(list.notification_update(&entry, notice(1)));
        assert!(!list.notification_update(&entry, notice(2)));
        assert_eq!(list.notification_clear(&entry), Some(notice(1)));
        assert_eq!(list.notification_clear(&entry), None);
        assert!(list.notification_update(&entry, notice(3)));
        assert_eq!(entry.pending(), Some(notice(3)));
    }

    #[test]
    fn test_remove_and_clear() {
        let list = RangeThreadList::new();
        let ids = spawn_ids(3);
        for id in &ids {
            list.add(*id);
        }
        assert!(list.remove(ids[0]));
        assert!(!list.remove(ids[0]));
        let mut count = 0;
        list.apply(|_| count += 1);
        assert_eq!(count, 2);

        assert!(list.remove(ids[1]));
        assert!(list.remove(ids[2]));
        assert!(list.is_empty());

        list.add(ids[0]);
        list.clear();
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
    }
}
