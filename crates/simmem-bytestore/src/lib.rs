// SPDX-License-Identifier: AGPL-3.0

//! ByteStore - a branchable, copy-on-write address map
//!
//! Every store is a handle onto a node in a shared arena (the lineage). A node
//! holds only the entries written or deleted since its parent. Branching
//! appends a child node and costs O(1); existing entries are never copied.
//!
//! A node that has children is frozen: the next write through the handle that
//! still points at it first moves that handle onto a fresh child of its own.
//! Ancestor deltas therefore never change once shared, which is what makes
//! `changes_since` exact and lets siblings read shared history without copies.
//!
//! Dropping a store releases its node. Nodes nobody reads from any more are
//! reclaimed, and a released node left with a single child is folded into it,
//! so the parent chain only keeps the branch points of stores still alive.
//! Lookups walk that chain. `flatten` collapses a store into a single root
//! node when its history is no longer needed.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use simmem_exceptions::{StoreError, StoreResult};
use tracing::trace;

/// Byte address inside a store
pub type Addr = u64;

/// Handle of a node in a lineage arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug)]
struct Node<V> {
    parent: Option<NodeId>,
    depth: usize,
    /// Live nodes branched from this one
    children: Vec<NodeId>,
    /// Whether a store handle currently reads from this node
    held: bool,
    live: bool,
    /// Number of live entries visible from this node
    len: usize,
    /// `None` marks a deletion
    delta: BTreeMap<Addr, Option<V>>,
}

impl<V> Node<V> {
    fn root() -> Self {
        Self {
            parent: None,
            depth: 0,
            children: Vec::new(),
            held: true,
            live: true,
            len: 0,
            delta: BTreeMap::new(),
        }
    }
}

/// Arena of branch nodes shared by every store branched from one root
///
/// A node stays allocated while a handle reads from it or one of its
/// descendants is still alive. Released slots are reused.
#[derive(Debug)]
struct Lineage<V> {
    nodes: Vec<Node<V>>,
    free: Vec<usize>,
}

impl<V> Lineage<V> {
    fn new() -> Self {
        Self {
            nodes: vec![Node::root()],
            free: Vec::new(),
        }
    }

    fn node(&self, id: NodeId) -> StoreResult<&Node<V>> {
        self.nodes
            .get(id.0)
            .filter(|node| node.live)
            .ok_or(StoreError::UnknownNode(id.0))
    }

    fn live_count(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    fn push_child(&mut self, parent: NodeId) -> NodeId {
        let (depth, len) = {
            let p = &self.nodes[parent.0];
            (p.depth + 1, p.len)
        };

        let node = Node {
            parent: Some(parent),
            depth,
            children: Vec::new(),
            held: true,
            live: true,
            len,
            delta: BTreeMap::new(),
        };
        let id = match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = node;
                NodeId(slot)
            }
            None => {
                self.nodes.push(node);
                NodeId(self.nodes.len() - 1)
            }
        };
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Give up the handle on `id` and reclaim whatever is no longer reachable
    fn release(&mut self, id: NodeId) {
        self.nodes[id.0].held = false;
        self.reclaim(id);
    }

    fn reclaim(&mut self, mut id: NodeId) {
        loop {
            let node = &self.nodes[id.0];
            if node.held {
                return;
            }
            match node.children.len() {
                0 => {
                    let parent = node.parent;
                    self.discard(id);
                    match parent {
                        Some(p) => {
                            self.nodes[p.0].children.retain(|c| *c != id);
                            id = p;
                        }
                        None => return,
                    }
                }
                1 => {
                    self.fold_into_child(id);
                    return;
                }
                _ => return,
            }
        }
    }

    fn discard(&mut self, id: NodeId) {
        let node = &mut self.nodes[id.0];
        node.live = false;
        node.parent = None;
        node.children.clear();
        node.delta.clear();
        self.free.push(id.0);
    }

    /// Merge an unheld node into its only child and splice it out of the chain
    fn fold_into_child(&mut self, id: NodeId) {
        let child = self.nodes[id.0].children[0];
        let parent = self.nodes[id.0].parent;

        let upper = std::mem::take(&mut self.nodes[id.0].delta);
        let lower = std::mem::take(&mut self.nodes[child.0].delta);
        let merged = if upper.len() > lower.len() {
            let mut merged = upper;
            merged.extend(lower);
            merged
        } else {
            let mut merged = lower;
            for (addr, entry) in upper {
                merged.entry(addr).or_insert(entry);
            }
            merged
        };
        self.nodes[child.0].delta = merged;
        self.nodes[child.0].parent = parent;
        if let Some(p) = parent {
            for c in self.nodes[p.0].children.iter_mut() {
                if *c == id {
                    *c = child;
                }
            }
        }

        let mut pending = vec![child];
        while let Some(n) = pending.pop() {
            let node = &mut self.nodes[n.0];
            node.depth -= 1;
            pending.extend(node.children.iter().copied());
        }

        self.discard(id);
        trace!(folded = id.0, into = child.0, "folded lineage node");
    }

    /// Nearest delta entry for `addr` on the chain starting at `head`
    fn lookup(&self, head: NodeId, addr: Addr) -> Option<&Option<V>> {
        let mut cursor = Some(head);
        while let Some(id) = cursor {
            let node = &self.nodes[id.0];
            if let Some(entry) = node.delta.get(&addr) {
                return Some(entry);
            }
            cursor = node.parent;
        }
        None
    }

    /// Visit the live entries visible from `head`, nearest write first
    fn for_each_live(&self, head: NodeId, mut f: impl FnMut(Addr, &V)) {
        let mut seen = BTreeSet::new();
        let mut cursor = Some(head);
        while let Some(id) = cursor {
            let node = &self.nodes[id.0];
            for (addr, entry) in &node.delta {
                if seen.insert(*addr) {
                    if let Some(value) = entry {
                        f(*addr, value);
                    }
                }
            }
            cursor = node.parent;
        }
    }
}

/// A versioned address → value map with structural sharing between branches
pub struct ByteStore<V> {
    lineage: Rc<RefCell<Lineage<V>>>,
    head: NodeId,
}

impl<V: Clone> ByteStore<V> {
    /// Create an empty store with its own lineage
    pub fn new() -> Self {
        Self {
            lineage: Rc::new(RefCell::new(Lineage::new())),
            head: NodeId(0),
        }
    }

    /// Create a store with its own lineage, pre-populated from `entries`
    pub fn from_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (Addr, V)>,
    {
        let mut store = Self::new();
        for (addr, value) in entries {
            store.insert(addr, value);
        }
        store
    }

    /// Get the value at `addr`
    pub fn get(&self, addr: Addr) -> Option<V> {
        self.lineage
            .borrow()
            .lookup(self.head, addr)
            .and_then(|entry| entry.clone())
    }

    pub fn contains(&self, addr: Addr) -> bool {
        matches!(self.lineage.borrow().lookup(self.head, addr), Some(Some(_)))
    }

    /// Write `value` at `addr`, returning the previous value
    pub fn insert(&mut self, addr: Addr, value: V) -> Option<V> {
        let previous = self.get(addr);
        self.make_writable();

        let mut lineage = self.lineage.borrow_mut();
        let node = &mut lineage.nodes[self.head.0];
        if previous.is_none() {
            node.len += 1;
        }
        node.delta.insert(addr, Some(value));
        previous
    }

    /// Delete the entry at `addr`, returning it
    pub fn remove(&mut self, addr: Addr) -> Option<V> {
        let previous = self.get(addr)?;
        self.make_writable();

        let mut lineage = self.lineage.borrow_mut();
        let node = &mut lineage.nodes[self.head.0];
        node.len -= 1;
        node.delta.insert(addr, None);
        Some(previous)
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.lineage.borrow().nodes[self.head.0].len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create a new store sharing the current content
    ///
    /// The new store is recorded as a child of the current head, so the two can
    /// later be diffed through `common_ancestor` and `changes_since`.
    pub fn branch(&self) -> Self {
        let child = self.lineage.borrow_mut().push_child(self.head);
        Self {
            lineage: Rc::clone(&self.lineage),
            head: child,
        }
    }

    /// Nearest node shared by the histories of `self` and `other`
    ///
    /// Returns `None` when the two stores were never branched from each other.
    pub fn common_ancestor(&self, other: &Self) -> Option<NodeId> {
        if !Rc::ptr_eq(&self.lineage, &other.lineage) {
            return None;
        }

        let lineage = self.lineage.borrow();
        let depth = |id: NodeId| lineage.nodes[id.0].depth;
        let parent = |id: NodeId| lineage.nodes[id.0].parent;

        let (mut a, mut b) = (self.head, other.head);
        while depth(a) > depth(b) {
            a = parent(a)?;
        }
        while depth(b) > depth(a) {
            b = parent(b)?;
        }
        while a != b {
            a = parent(a)?;
            b = parent(b)?;
        }
        Some(a)
    }

    /// Addresses written and deleted since `ancestor`
    ///
    /// Only the nodes between the head and `ancestor` are visited. An address
    /// is reported as deleted when its most recent change was a deletion.
    pub fn changes_since(&self, ancestor: NodeId) -> StoreResult<(BTreeSet<Addr>, BTreeSet<Addr>)> {
        let lineage = self.lineage.borrow();
        lineage.node(ancestor)?;

        let mut seen = BTreeSet::new();
        let mut changed = BTreeSet::new();
        let mut deleted = BTreeSet::new();

        let mut cursor = Some(self.head);
        while let Some(id) = cursor {
            if id == ancestor {
                return Ok((changed, deleted));
            }

            let node = &lineage.nodes[id.0];
            for (addr, entry) in &node.delta {
                if seen.insert(*addr) {
                    if entry.is_some() {
                        changed.insert(*addr);
                    } else {
                        deleted.insert(*addr);
                    }
                }
            }
            cursor = node.parent;
        }

        Err(StoreError::NotAnAncestor(ancestor.0))
    }

    /// The full set of addresses currently holding a value
    pub fn keys(&self) -> BTreeSet<Addr> {
        let mut keys = BTreeSet::new();
        self.lineage
            .borrow()
            .for_each_live(self.head, |addr, _| {
                keys.insert(addr);
            });
        keys
    }

    /// All live entries, flattened out of the lineage
    pub fn snapshot(&self) -> BTreeMap<Addr, V> {
        let mut entries = BTreeMap::new();
        self.lineage
            .borrow()
            .for_each_live(self.head, |addr, value| {
                entries.insert(addr, value.clone());
            });
        entries
    }

    /// A standalone copy of the current content with no recorded history
    pub fn flatten(&self) -> Self {
        Self::from_entries(self.snapshot())
    }

    /// The node this store currently reads from
    pub fn head(&self) -> NodeId {
        self.head
    }

    /// Number of branch points between the head and the root
    pub fn depth(&self) -> usize {
        self.lineage.borrow().nodes[self.head.0].depth
    }

    /// Number of live nodes in the shared lineage
    pub fn node_count(&self) -> usize {
        self.lineage.borrow().live_count()
    }

    fn make_writable(&mut self) {
        let mut lineage = self.lineage.borrow_mut();
        if !lineage.nodes[self.head.0].children.is_empty() {
            let frozen = self.head;
            self.head = lineage.push_child(frozen);
            lineage.nodes[frozen.0].held = false;
            trace!(frozen = frozen.0, head = self.head.0, "moved store head past frozen node");
        }
    }
}

impl<V> Drop for ByteStore<V> {
    fn drop(&mut self) {
        if let Ok(mut lineage) = self.lineage.try_borrow_mut() {
            lineage.release(self.head);
        }
    }
}

impl<V: Clone> Default for ByteStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> FromIterator<(Addr, V)> for ByteStore<V> {
    fn from_iter<I: IntoIterator<Item = (Addr, V)>>(iter: I) -> Self {
        Self::from_entries(iter)
    }
}

impl<V: Clone> fmt::Debug for ByteStore<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStore")
            .field("head", &self.head.0)
            .field("depth", &self.depth())
            .field("len", &self.len())
            .finish()
    }
}
