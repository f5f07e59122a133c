//! The capability derivation forest
//!
//! One arena of capability nodes shared by all tables, plus one ordered
//! selector map per table. See the crate docs for the model.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::fmt;

use crate::{CapError, CapSel, SelRange};

/// Arena node id.
///
/// Index into the forest's node arena, offset by one so that zero can
/// serve as the null id.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
#[repr(transparent)]
pub struct NodeId(u32);

impl NodeId {
    /// Null node (no capability).
    pub const NULL: Self = Self(0);

    const fn from_index(index: usize) -> Self {
        Self(index as u32 + 1)
    }

    const fn index(self) -> usize {
        self.0 as usize - 1
    }

    /// Check if this is the null id.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Check if this is a valid (non-null) id.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "cap#null")
        } else {
            write!(f, "cap#{}", self.0)
        }
    }
}

/// Table id: one per capability table (two per VPE).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
#[repr(transparent)]
pub struct SpaceId(pub u32);

/// One capability: a selector range bound to a payload, linked into the
/// derivation forest.
pub struct CapNode<T> {
    /// The payload (the kernel's object handle).
    pub obj: T,
    /// The selector range this capability covers.
    pub sels: SelRange,
    /// The table this capability lives in.
    pub space: SpaceId,
    /// Whether this capability was obtained from another one (and thus
    /// does not own the object).
    pub derived: bool,
    parent: NodeId,
    first_child: NodeId,
    next_sibling: NodeId,
    prev_sibling: NodeId,
}

impl<T> CapNode<T> {
    /// The first selector.
    #[inline]
    #[must_use]
    pub fn sel(&self) -> CapSel {
        self.sels.start()
    }

    /// The number of selectors covered.
    #[inline]
    #[must_use]
    pub fn len(&self) -> CapSel {
        self.sels.count()
    }

    /// Whether this capability has a parent in the forest.
    #[inline]
    #[must_use]
    pub fn has_parent(&self) -> bool {
        self.parent.is_valid()
    }
}

/// A capability released by a revocation, in teardown order.
pub struct Released<T> {
    /// The payload.
    pub obj: T,
    /// The selector range the capability covered.
    pub sels: SelRange,
    /// The table it lived in.
    pub space: SpaceId,
    /// Whether the capability was obtained (no object ownership).
    pub derived: bool,
    /// Payload of the parent capability, if it still exists.
    pub parent_obj: Option<T>,
    /// Whether the revocation reached this capability from outside its
    /// own subtree (everything but the explicitly named cap itself).
    pub foreign: bool,
}

/// The derivation forest: arena plus per-table selector maps.
pub struct CapForest<T> {
    nodes: Vec<Option<CapNode<T>>>,
    free: Vec<u32>,
    tables: Vec<BTreeMap<CapSel, NodeId>>,
}

impl<T> Default for CapForest<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CapForest<T> {
    /// Create an empty forest with no tables.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            tables: Vec::new(),
        }
    }

    /// Add a capability table and return its id.
    pub fn add_space(&mut self) -> SpaceId {
        self.tables.push(BTreeMap::new());
        SpaceId(self.tables.len() as u32 - 1)
    }

    /// Check if a table holds no capabilities.
    #[must_use]
    pub fn is_empty(&self, space: SpaceId) -> bool {
        self.tables[space.0 as usize].is_empty()
    }

    fn node(&self, id: NodeId) -> &CapNode<T> {
        self.nodes[id.index()].as_ref().expect("stale cap node id")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut CapNode<T> {
        self.nodes[id.index()].as_mut().expect("stale cap node id")
    }

    /// Get a node by id, if it still exists.
    #[must_use]
    pub fn get_node(&self, id: NodeId) -> Option<&CapNode<T>> {
        if id.is_null() {
            return None;
        }
        self.nodes.get(id.index()).and_then(|n| n.as_ref())
    }

    /// Look up the capability covering `sel`.
    #[must_use]
    pub fn get_id(&self, space: SpaceId, sel: CapSel) -> Option<NodeId> {
        let (_, &id) = self.tables[space.0 as usize].range(..=sel).next_back()?;
        if self.node(id).sels.contains(sel) {
            Some(id)
        } else {
            None
        }
    }

    /// Look up the capability covering `sel` and return the node.
    #[must_use]
    pub fn get(&self, space: SpaceId, sel: CapSel) -> Option<&CapNode<T>> {
        self.get_id(space, sel).map(|id| self.node(id))
    }

    /// Check if a selector is unused.
    #[must_use]
    pub fn unused(&self, space: SpaceId, sel: CapSel) -> bool {
        self.get_id(space, sel).is_none()
    }

    /// Check if a whole selector range is unused.
    #[must_use]
    pub fn range_unused(&self, space: SpaceId, start: CapSel, count: CapSel) -> bool {
        let end = start as u64 + count as u64;
        let table = &self.tables[space.0 as usize];
        let last_below = if end > u32::MAX as u64 {
            table.iter().next_back()
        } else {
            table.range(..end as CapSel).next_back()
        };
        match last_below {
            // tables hold non-overlapping ranges, so only the nearest
            // capability below `end` can reach into [start, end)
            Some((_, &id)) => self.node(id).sels.end() <= start as u64,
            None => true,
        }
    }

    fn alloc(&mut self, node: CapNode<T>) -> NodeId {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx as usize] = Some(node);
            NodeId::from_index(idx as usize)
        } else {
            self.nodes.push(Some(node));
            NodeId::from_index(self.nodes.len() - 1)
        }
    }

    /// Insert a parentless capability owning a fresh object.
    pub fn insert(&mut self, space: SpaceId, sels: SelRange, obj: T) -> Result<NodeId, CapError> {
        self.insert_node(space, sels, obj, false, NodeId::NULL)
    }

    /// Insert a capability owning a fresh object as a child of `parent`.
    pub fn insert_child(
        &mut self,
        space: SpaceId,
        sels: SelRange,
        obj: T,
        parent: NodeId,
    ) -> Result<NodeId, CapError> {
        self.insert_node(space, sels, obj, false, parent)
    }

    fn insert_node(
        &mut self,
        space: SpaceId,
        sels: SelRange,
        obj: T,
        derived: bool,
        parent: NodeId,
    ) -> Result<NodeId, CapError> {
        if !self.range_unused(space, sels.start(), sels.count()) {
            return Err(CapError::Exists);
        }

        let id = self.alloc(CapNode {
            obj,
            sels,
            space,
            derived,
            parent: NodeId::NULL,
            first_child: NodeId::NULL,
            next_sibling: NodeId::NULL,
            prev_sibling: NodeId::NULL,
        });
        self.tables[space.0 as usize].insert(sels.start(), id);
        if parent.is_valid() {
            self.link_child(parent, id);
        }
        Ok(id)
    }

    /// Clone the capability `src` into `dst_space` at `dst_sel` and link
    /// the clone as a child of `src`.
    pub fn obtain(
        &mut self,
        dst_space: SpaceId,
        dst_sel: CapSel,
        src: NodeId,
    ) -> Result<NodeId, CapError>
    where
        T: Clone,
    {
        let obj = self.node(src).obj.clone();
        self.insert_node(dst_space, SelRange::new(dst_sel), obj, true, src)
    }

    fn link_child(&mut self, parent: NodeId, child: NodeId) {
        let old_first = self.node(parent).first_child;
        {
            let c = self.node_mut(child);
            c.parent = parent;
            c.next_sibling = old_first;
            c.prev_sibling = NodeId::NULL;
        }
        if old_first.is_valid() {
            self.node_mut(old_first).prev_sibling = child;
        }
        self.node_mut(parent).first_child = child;
    }

    fn unlink(&mut self, id: NodeId) {
        let (parent, prev, next) = {
            let n = self.node(id);
            (n.parent, n.prev_sibling, n.next_sibling)
        };

        if prev.is_valid() {
            self.node_mut(prev).next_sibling = next;
        } else if parent.is_valid() {
            self.node_mut(parent).first_child = next;
        }
        if next.is_valid() {
            self.node_mut(next).prev_sibling = prev;
        }

        let n = self.node_mut(id);
        n.parent = NodeId::NULL;
        n.prev_sibling = NodeId::NULL;
        n.next_sibling = NodeId::NULL;
    }

    /// Walk to the root of the derivation tree containing `id`.
    #[must_use]
    pub fn root_of(&self, id: NodeId) -> NodeId {
        let mut cur = id;
        loop {
            let parent = self.node(cur).parent;
            if parent.is_null() {
                return cur;
            }
            cur = parent;
        }
    }

    /// Find the first direct child of `id` matching the predicate.
    #[must_use]
    pub fn find_child<F>(&self, id: NodeId, pred: F) -> Option<NodeId>
    where
        F: Fn(&CapNode<T>) -> bool,
    {
        let mut child = self.node(id).first_child;
        while child.is_valid() {
            let n = self.node(child);
            if pred(n) {
                return Some(child);
            }
            child = n.next_sibling;
        }
        None
    }

    /// Revoke capabilities covering selectors `[start, start + count)`
    /// of `space`.
    ///
    /// With `own`, each named capability is revoked together with its
    /// subtree; otherwise only the children (and their subtrees) are,
    /// delegation-style. The `can_revoke` predicate guards only the
    /// explicitly named capabilities; if it refuses, nothing has been
    /// changed yet for the refused selector and the error is returned.
    ///
    /// Released payloads come back child-before-parent so that teardown
    /// can run after all table state is consistent again.
    pub fn revoke<F>(
        &mut self,
        space: SpaceId,
        start: CapSel,
        count: CapSel,
        own: bool,
        can_revoke: F,
    ) -> Result<Vec<Released<T>>, CapError>
    where
        T: Clone,
        F: Fn(&CapNode<T>) -> bool,
    {
        let mut out = Vec::new();
        let end = start as u64 + count as u64;
        let mut sel = start;
        while (sel as u64) < end {
            match self.get_id(space, sel) {
                Some(id) => {
                    if !can_revoke(self.node(id)) {
                        return Err(CapError::NotRevocable);
                    }
                    let len = self.node(id).len();
                    if own {
                        self.collect_subtree(id, false, &mut out);
                    } else {
                        // revoke all children, keep the cap itself
                        loop {
                            let child = self.node(id).first_child;
                            if child.is_null() {
                                break;
                            }
                            self.collect_subtree(child, true, &mut out);
                        }
                    }
                    sel = sel.saturating_add(len.max(1));
                },
                None => sel += 1,
            }
        }
        Ok(out)
    }

    /// Revoke every capability in `space`, for VPE destruction.
    ///
    /// All releases are considered foreign so that send-gate holders get
    /// notified about their invalidated endpoints in any case.
    pub fn revoke_all(&mut self, space: SpaceId) -> Vec<Released<T>>
    where
        T: Clone,
    {
        let mut out = Vec::new();
        loop {
            let id = match self.tables[space.0 as usize].values().next() {
                Some(&id) => id,
                None => break,
            };
            self.collect_subtree(id, true, &mut out);
        }
        out
    }

    /// Detach the subtree rooted at `id` and append its nodes to `out`
    /// in child-before-parent order.
    fn collect_subtree(&mut self, id: NodeId, root_foreign: bool, out: &mut Vec<Released<T>>)
    where
        T: Clone,
    {
        let root_parent_obj = {
            let parent = self.node(id).parent;
            if parent.is_valid() {
                Some(self.node(parent).obj.clone())
            } else {
                None
            }
        };

        self.unlink(id);

        // pre-order id list; reversed it yields children before parents
        let mut preorder = Vec::new();
        let mut stack = Vec::new();
        stack.push(id);
        while let Some(cur) = stack.pop() {
            preorder.push(cur);
            let mut child = self.node(cur).first_child;
            while child.is_valid() {
                stack.push(child);
                child = self.node(child).next_sibling;
            }
        }

        // make everything unreachable before any payload is handed out
        for &nid in &preorder {
            let (space, sel) = {
                let n = self.node(nid);
                (n.space, n.sel())
            };
            self.tables[space.0 as usize].remove(&sel);
        }

        for &nid in preorder.iter().rev() {
            let node = self.nodes[nid.index()].take().expect("stale cap node id");
            self.free.push(nid.index() as u32);

            let parent_obj = if nid == id {
                root_parent_obj.clone()
            } else {
                // parents are released after children, so the parent
                // node is still present in the arena here
                self.get_node(node.parent).map(|p| p.obj.clone())
            };

            out.push(Released {
                obj: node.obj,
                sels: node.sels,
                space: node.space,
                derived: node.derived,
                parent_obj,
                foreign: if nid == id { root_foreign } else { true },
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    fn forest() -> (CapForest<u32>, SpaceId, SpaceId) {
        let mut f = CapForest::new();
        let a = f.add_space();
        let b = f.add_space();
        (f, a, b)
    }

    #[test]
    fn test_range_lookup() {
        let (mut f, a, _) = forest();
        f.insert(a, SelRange::new_range(0x10, 4), 1).unwrap();
        assert!(f.get(a, 0x0F).is_none());
        assert_eq!(f.get(a, 0x10).unwrap().obj, 1);
        assert_eq!(f.get(a, 0x13).unwrap().obj, 1);
        assert!(f.get(a, 0x14).is_none());
        assert!(!f.range_unused(a, 0x12, 8));
        assert!(f.range_unused(a, 0x14, 8));
        assert!(f.insert(a, SelRange::new(0x12), 2).is_err());
    }

    #[test]
    fn test_obtain_revoke_roundtrip() {
        let (mut f, a, b) = forest();
        let src = f.insert(a, SelRange::new(5), 7).unwrap();
        f.obtain(b, 9, src).unwrap();
        assert_eq!(f.get(b, 9).unwrap().obj, 7);

        // revoking the children restores the pre-obtain state
        let released = f.revoke(a, 5, 1, false, |_| true).unwrap();
        assert_eq!(released.len(), 1);
        assert!(released[0].derived);
        assert!(released[0].foreign);
        assert_eq!(released[0].parent_obj, Some(7));
        assert!(f.get(b, 9).is_none());
        assert_eq!(f.get(a, 5).unwrap().obj, 7);
        assert!(!f.get(a, 5).unwrap().has_parent());
    }

    #[test]
    fn test_cascading_revoke_order() {
        let (mut f, a, b) = forest();
        let root = f.insert(a, SelRange::new(1), 1).unwrap();
        let mid = f.obtain(b, 1, root).unwrap();
        f.obtain(a, 2, mid).unwrap();

        let released = f.revoke(a, 1, 1, true, |_| true).unwrap();
        let objs: Vec<u32> = released.iter().map(|r| r.obj).collect();
        // grandchild first, root last
        assert_eq!(objs, vec![1, 1, 1]);
        assert!(!released[2].derived && !released[2].foreign);
        assert!(released[0].foreign && released[1].foreign);
        assert!(f.is_empty(a));
        assert!(f.is_empty(b));
    }

    #[test]
    fn test_not_revocable() {
        let (mut f, a, _) = forest();
        f.insert(a, SelRange::new(3), 42).unwrap();
        let res = f.revoke(a, 3, 1, true, |n| n.obj != 42);
        assert_eq!(res.unwrap_err(), CapError::NotRevocable);
        assert_eq!(f.get(a, 3).unwrap().obj, 42);
    }

    #[test]
    fn test_revoke_all_spans_spaces() {
        let (mut f, a, b) = forest();
        let r = f.insert(a, SelRange::new(1), 10).unwrap();
        f.obtain(b, 4, r).unwrap();
        let released = f.revoke_all(a);
        assert_eq!(released.len(), 2);
        assert!(f.is_empty(b));
        // id reuse keeps old ids stale
        assert!(f.get_node(r).is_none());
    }
}
