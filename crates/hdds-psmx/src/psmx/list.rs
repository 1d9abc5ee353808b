// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Attachment list shared by instances (topics) and topics (endpoints).
//!
//! Nodes get a stable [`NodeHandle`] on insert. Removal runs the caller's
//! destructor first; a refusing destructor leaves the node attached.

use crate::error::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Stable identity of an attached node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHandle(u64);

/// Ordered list of attached nodes (insertion order).
pub struct NodeList<N: ?Sized> {
    next: AtomicU64,
    nodes: Mutex<Vec<(NodeHandle, Arc<N>)>>,
}

impl<N: ?Sized> NodeList<N> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            nodes: Mutex::new(Vec::new()),
        }
    }

    /// Attach `node` and return its handle.
    pub fn insert(&self, node: Arc<N>) -> NodeHandle {
        let handle = NodeHandle(self.next.fetch_add(1, Ordering::Relaxed));
        self.nodes.lock().push((handle, node));
        handle
    }

    #[must_use]
    pub fn handle_of(&self, node: &Arc<N>) -> Option<NodeHandle> {
        self.nodes
            .lock()
            .iter()
            .find(|(_, n)| same_node(n, node))
            .map(|(h, _)| *h)
    }

    #[must_use]
    pub fn contains(&self, node: &Arc<N>) -> bool {
        self.handle_of(node).is_some()
    }

    #[must_use]
    pub fn get(&self, handle: NodeHandle) -> Option<Arc<N>> {
        self.nodes
            .lock()
            .iter()
            .find(|(h, _)| *h == handle)
            .map(|(_, n)| Arc::clone(n))
    }

    /// First node matching `pred`.
    pub fn find(&self, mut pred: impl FnMut(&N) -> bool) -> Option<Arc<N>> {
        self.nodes
            .lock()
            .iter()
            .find(|(_, n)| pred(n))
            .map(|(_, n)| Arc::clone(n))
    }

    /// Copy of the current nodes; callbacks run on the copy, not under the lock.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<N>> {
        self.nodes.lock().iter().map(|(_, n)| Arc::clone(n)).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }

    /// Detach `node` after `destroy` agrees.
    ///
    /// Returns `false` (node still attached, or never was) when the node is
    /// unknown or the destructor fails.
    pub fn remove_with(&self, node: &Arc<N>, destroy: impl FnOnce(&Arc<N>) -> Result<()>) -> bool {
        if !self.contains(node) {
            return false;
        }
        if let Err(e) = destroy(node) {
            log::debug!("[psmx] node destructor refused removal: {}", e);
            return false;
        }
        self.nodes.lock().retain(|(_, n)| !same_node(n, node));
        true
    }
}

impl<N: ?Sized> Default for NodeList<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: ?Sized> std::fmt::Debug for NodeList<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeList").field("len", &self.len()).finish()
    }
}

fn same_node<N: ?Sized>(a: &Arc<N>, b: &Arc<N>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_insert_find_snapshot() {
        let list: NodeList<str> = NodeList::new();
        let a: Arc<str> = Arc::from("a");
        let b: Arc<str> = Arc::from("b");
        let ha = list.insert(Arc::clone(&a));
        let hb = list.insert(Arc::clone(&b));
        assert_ne!(ha, hb);
        assert_eq!(list.len(), 2);
        assert_eq!(list.handle_of(&b), Some(hb));
        assert_eq!(list.get(ha).as_deref(), Some("a"));
        assert_eq!(list.find(|n| n == "b").as_deref(), Some("b"));
        let names: Vec<String> = list.snapshot().iter().map(|n| n.to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_remove_runs_destructor_first() {
        let list: NodeList<str> = NodeList::new();
        let a: Arc<str> = Arc::from("a");
        list.insert(Arc::clone(&a));

        let refused = list.remove_with(&a, |_| Err(Error::Transport("busy".into())));
        assert!(!refused);
        assert!(list.contains(&a));

        let mut called = false;
        assert!(list.remove_with(&a, |_| {
            called = true;
            Ok(())
        }));
        assert!(called);
        assert!(list.is_empty());
    }

    #[test]
    fn test_remove_unknown_node() {
        let list: NodeList<str> = NodeList::new();
        let a: Arc<str> = Arc::from("a");
        let mut called = false;
        assert!(!list.remove_with(&a, |_| {
            called = true;
            Ok(())
        }));
        assert!(!called);
    }

    #[test]
    fn test_identity_not_equality() {
        let list: NodeList<str> = NodeList::new();
        let a1: Arc<str> = Arc::from("same");
        let a2: Arc<str> = Arc::from("same");
        list.insert(Arc::clone(&a1));
        assert!(list.contains(&a1));
        assert!(!list.contains(&a2));
    }
}
