//! Arena-backed call tree with a cursor at the innermost open scope.
//!
//! Nodes live in a `Vec` and refer to each other by `NodeId`. Each node keeps
//! a parent link plus first-child / next-sibling links, so siblings form a
//! singly linked chain in discovery order. Nodes are never removed; the whole
//! arena goes away when the tree is dropped.
//!
//! `enter` moves the cursor down (creating the child on first sight) and
//! starts a sample; `exit` folds the elapsed cycles into the node and moves
//! the cursor back up. Direct recursion into the node under the cursor only
//! bumps `recursion_depth`: the outermost call's sample covers all levels.
//!
//! Callers must keep enter/exit strictly nested. `ScopeGuard` guarantees this;
//! calling `exit` at the root is reported as `TreeError::UnbalancedExit`.

use std::borrow::Cow;

use crate::stats::NodeStats;
use crate::tsc;

/// Identifier of the root node.
pub const ROOT_ID: &str = "Root";

/// Index of a node in its tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("exit without a matching enter: the cursor is already at the root")]
    UnbalancedExit,
}

#[derive(Debug)]
struct Node {
    id: Cow<'static, str>,
    parent: Option<NodeId>,
    first_child: Option<NodeId>,
    next_sibling: Option<NodeId>,
    stats: NodeStats,
}

impl Node {
    fn new(id: Cow<'static, str>, parent: Option<NodeId>) -> Self {
        Self {
            id,
            parent,
            first_child: None,
            next_sibling: None,
            stats: NodeStats::default(),
        }
    }
}

/// The call tree for one logical call stack.
///
/// Not synchronized: one tree per thread (see `crate::scope`) or wrap an
/// explicitly owned tree in a `RefCell` and use `scope_in`.
#[derive(Debug)]
pub struct ProfileTree {
    nodes: Vec<Node>,
    current: NodeId,
    active: bool,
}

impl Default for ProfileTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileTree {
    /// A tree holding only the root, with the cursor at the root.
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new(Cow::Borrowed(ROOT_ID), None)],
            current: NodeId::ROOT,
            active: true,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Gate every mutating operation. Accumulated statistics are kept.
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }

    /// Enter scope `id`, timestamped with the cycle counter.
    pub fn enter(&mut self, id: impl Into<Cow<'static, str>>) {
        if !self.active {
            return;
        }
        if let Some(node) = self.descend(id.into()) {
            // Read the counter after the lookup so it isn't billed to the scope.
            self.nodes[node.0].stats.start_cycles = tsc::read();
        }
    }

    /// Enter scope `id` with an explicit start timestamp.
    pub fn enter_at(&mut self, id: impl Into<Cow<'static, str>>, now: u64) {
        if !self.active {
            return;
        }
        if let Some(node) = self.descend(id.into()) {
            self.nodes[node.0].stats.start_cycles = now;
        }
    }

    /// Leave the innermost scope, timestamped with the cycle counter.
    ///
    /// An unbalanced exit is logged and ignored.
    pub fn exit(&mut self) {
        if !self.active {
            return;
        }
        self.exit_at(tsc::read());
    }

    /// Leave the innermost scope with an explicit end timestamp.
    pub fn exit_at(&mut self, now: u64) {
        if let Err(err) = self.try_exit_at(now) {
            tracing::warn!(%err, "ignoring unbalanced scope exit");
        }
    }

    /// Like `exit_at`, but reports an exit at the root instead of logging it.
    pub fn try_exit_at(&mut self, now: u64) -> Result<(), TreeError> {
        if !self.active {
            return Ok(());
        }
        let node = &mut self.nodes[self.current.0];
        if node.stats.recursion_depth > 0 {
            node.stats.recursion_depth -= 1;
            return Ok(());
        }
        let parent = node.parent.ok_or(TreeError::UnbalancedExit)?;
        let elapsed = now.saturating_sub(node.stats.start_cycles);
        node.stats.record(elapsed);
        self.current = parent;
        Ok(())
    }

    /// Reset every node's statistics, keeping the tree shape.
    ///
    /// Meant to be called at a frame boundary, with no scope open.
    pub fn new_frame(&mut self) {
        if !self.active {
            return;
        }
        if self.current != NodeId::ROOT {
            tracing::debug!(
                open_scope = %self.nodes[self.current.0].id,
                "new_frame called with scopes still open"
            );
        }
        self.reset_subtree(NodeId::ROOT);
    }

    fn reset_subtree(&mut self, start: NodeId) {
        let mut pending = vec![start];
        while let Some(id) = pending.pop() {
            let node = &mut self.nodes[id.0];
            node.stats.reset();
            if let Some(sibling) = node.next_sibling {
                if id != start {
                    pending.push(sibling);
                }
            }
            if let Some(child) = node.first_child {
                pending.push(child);
            }
        }
    }

    /// Move the cursor to child `id` of the current node, creating it if
    /// needed, and count the call. Returns `None` for a recursive re-entry.
    fn descend(&mut self, id: Cow<'static, str>) -> Option<NodeId> {
        let current = self.current;
        if self.nodes[current.0].id == id {
            self.nodes[current.0].stats.recursion_depth += 1;
            return None;
        }

        let child = match self.find_child(current, &id) {
            Ok(found) => found,
            Err(last) => self.push_child(current, last, id),
        };

        self.current = child;
        self.nodes[child.0].stats.call_count += 1;
        Some(child)
    }

    /// Linear search of `parent`'s children. On a miss, returns the last
    /// child so the caller can append without walking the chain again.
    fn find_child(&self, parent: NodeId, id: &str) -> Result<NodeId, Option<NodeId>> {
        let mut last = None;
        let mut cursor = self.nodes[parent.0].first_child;
        while let Some(child) = cursor {
            if self.nodes[child.0].id == id {
                return Ok(child);
            }
            last = Some(child);
            cursor = self.nodes[child.0].next_sibling;
        }
        Err(last)
    }

    fn push_child(
        &mut self,
        parent: NodeId,
        last: Option<NodeId>,
        id: Cow<'static, str>,
    ) -> NodeId {
        let child = NodeId(self.nodes.len());
        self.nodes.push(Node::new(id, Some(parent)));
        match last {
            Some(prev) => self.nodes[prev.0].next_sibling = Some(child),
            None => self.nodes[parent.0].first_child = Some(child),
        }
        child
    }

    pub fn root(&self) -> NodeRef<'_> {
        NodeRef {
            tree: self,
            id: NodeId::ROOT,
        }
    }

    /// The node of the innermost open scope (the root when none is open).
    pub fn current(&self) -> NodeRef<'_> {
        NodeRef {
            tree: self,
            id: self.current,
        }
    }

    pub fn node(&self, id: NodeId) -> Option<NodeRef<'_>> {
        (id.0 < self.nodes.len()).then_some(NodeRef { tree: self, id })
    }

    /// Number of nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Number of open scopes between the root and the cursor.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut cursor = self.nodes[self.current.0].parent;
        while let Some(parent) = cursor {
            depth += 1;
            cursor = self.nodes[parent.0].parent;
        }
        depth
    }

    /// Follow identifiers from the root, e.g. `find_path(&["update", "physics"])`.
    pub fn find_path(&self, path: &[&str]) -> Option<NodeRef<'_>> {
        let mut node = NodeId::ROOT;
        for id in path {
            node = self.find_child(node, id).ok()?;
        }
        Some(NodeRef {
            tree: self,
            id: node,
        })
    }
}

/// Read-only view of one node. Reporters traverse the tree through this.
#[derive(Clone, Copy)]
pub struct NodeRef<'t> {
    tree: &'t ProfileTree,
    id: NodeId,
}

impl std::fmt::Debug for NodeRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRef")
            .field("id", &self.id())
            .field("stats", &self.stats())
            .finish()
    }
}

impl<'t> NodeRef<'t> {
    fn raw(&self) -> &'t Node {
        &self.tree.nodes[self.id.0]
    }

    fn at(&self, id: Option<NodeId>) -> Option<NodeRef<'t>> {
        id.map(|id| NodeRef {
            tree: self.tree,
            id,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.id
    }

    /// The scope identifier.
    pub fn id(&self) -> &'t str {
        &self.raw().id
    }

    pub fn stats(&self) -> NodeStats {
        self.raw().stats
    }

    pub fn is_root(&self) -> bool {
        self.id == NodeId::ROOT
    }

    pub fn parent(&self) -> Option<NodeRef<'t>> {
        self.at(self.raw().parent)
    }

    pub fn first_child(&self) -> Option<NodeRef<'t>> {
        self.at(self.raw().first_child)
    }

    pub fn next_sibling(&self) -> Option<NodeRef<'t>> {
        self.at(self.raw().next_sibling)
    }

    /// Children in discovery order.
    pub fn children(&self) -> Children<'t> {
        Children {
            next: self.first_child(),
        }
    }

    /// `100 * total / parent.total`, or 100 when the parent total is zero.
    pub fn percent_of_parent(&self) -> f64 {
        let parent_total = self.parent().map_or(0, |p| p.stats().total_cycles);
        percent_of(self.stats().total_cycles, parent_total)
    }
}

/// Share of `total` in `parent_total`, defined as 100% for an empty parent.
pub fn percent_of(total: u64, parent_total: u64) -> f64 {
    if parent_total == 0 {
        100.0
    } else {
        100.0 * total as f64 / parent_total as f64
    }
}

/// Iterator over a node's children.
pub struct Children<'t> {
    next: Option<NodeRef<'t>>,
}

impl<'t> Iterator for Children<'t> {
    type Item = NodeRef<'t>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;
        self.next = node.next_sibling();
        Some(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids<'t>(node: NodeRef<'t>) -> Vec<&'t str> {
        node.children().map(|c| c.id()).collect()
    }

    #[test]
    fn new_tree_has_root_cursor() {
        let tree = ProfileTree::new();
        assert_eq!(tree.len(), 1);
        assert!(tree.is_empty());
        assert_eq!(tree.root().id(), ROOT_ID);
        assert!(tree.current().is_root());
        assert!(tree.root().parent().is_none());
        assert_eq!(tree.depth(), 0);
    }

    #[test]
    fn nested_enter_exit_builds_chain() {
        let mut tree = ProfileTree::new();
        tree.enter_at("A", 0);
        tree.enter_at("B", 10);
        assert_eq!(tree.depth(), 2);
        tree.exit_at(30);
        tree.exit_at(100);

        assert!(tree.current().is_root());
        let a = tree.find_path(&["A"]).unwrap();
        let b = tree.find_path(&["A", "B"]).unwrap();
        assert_eq!(ids(tree.root()), ["A"]);
        assert_eq!(ids(a), ["B"]);
        assert_eq!(a.stats().call_count, 1);
        assert_eq!(b.stats().call_count, 1);
        assert_eq!(a.stats().total_cycles, 100);
        assert_eq!(b.stats().total_cycles, 20);
        assert_eq!(b.parent().unwrap().node_id(), a.node_id());
    }

    #[test]
    fn direct_recursion_folds_into_one_sample() {
        let mut tree = ProfileTree::new();
        tree.enter_at("A", 0);
        tree.enter_at("A", 5);
        assert_eq!(tree.current().stats().recursion_depth, 1);
        tree.exit_at(7);
        assert_eq!(tree.current().id(), "A");
        assert_eq!(tree.current().stats().recursion_depth, 0);
        assert_eq!(tree.current().stats().total_cycles, 0);
        tree.exit_at(50);

        let a = tree.find_path(&["A"]).unwrap().stats();
        assert_eq!(tree.len(), 2);
        assert_eq!(a.call_count, 1);
        assert_eq!(a.total_cycles, 50);
        assert_eq!(a.min_cycles, 50);
        assert_eq!(a.max_cycles, 50);
        assert!(tree.current().is_root());
    }

    #[test]
    fn deep_recursion_leaves_stats_unaffected() {
        let mut tree = ProfileTree::new();
        tree.enter_at("fib", 0);
        for _ in 0..8 {
            tree.enter_at("fib", 1);
        }
        for _ in 0..8 {
            tree.exit_at(2);
        }
        tree.exit_at(40);
        let fib = tree.find_path(&["fib"]).unwrap().stats();
        assert_eq!(fib.call_count, 1);
        assert_eq!(fib.total_cycles, 40);
        assert_eq!(fib.recursion_depth, 0);
    }

    #[test]
    fn indirect_recursion_creates_nested_node() {
        let mut tree = ProfileTree::new();
        tree.enter_at("A", 0);
        tree.enter_at("B", 0);
        tree.enter_at("A", 0);
        tree.exit_at(1);
        tree.exit_at(2);
        tree.exit_at(3);
        assert!(tree.find_path(&["A", "B", "A"]).is_some());
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn siblings_are_reused_and_kept_in_discovery_order() {
        let mut tree = ProfileTree::new();
        for id in ["draw", "update", "draw", "input"] {
            tree.enter_at(id, 0);
            tree.exit_at(10);
        }
        assert_eq!(ids(tree.root()), ["draw", "update", "input"]);
        assert_eq!(tree.find_path(&["draw"]).unwrap().stats().call_count, 2);
        assert_eq!(tree.find_path(&["draw"]).unwrap().stats().total_cycles, 20);
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn owned_and_borrowed_identifiers_match() {
        let mut tree = ProfileTree::new();
        tree.enter_at("render", 0);
        tree.exit_at(1);
        tree.enter_at(String::from("render"), 2);
        tree.exit_at(3);
        assert_eq!(tree.len(), 2);
        assert_eq!(tree.find_path(&["render"]).unwrap().stats().call_count, 2);
    }

    #[test]
    fn min_max_over_several_calls() {
        let mut tree = ProfileTree::new();
        for (start, end) in [(0, 30), (100, 110), (200, 250)] {
            tree.enter_at("work", start);
            tree.exit_at(end);
        }
        let s = tree.find_path(&["work"]).unwrap().stats();
        assert_eq!(s.min_cycles, 10);
        assert_eq!(s.max_cycles, 50);
        assert_eq!(s.total_cycles, 90);
        assert_eq!(s.average_cycles(), 30);
        assert!(s.min_cycles <= s.max_cycles);
    }

    #[test]
    fn new_frame_resets_stats_but_keeps_shape() {
        let mut tree = ProfileTree::new();
        tree.enter_at("A", 0);
        tree.enter_at("B", 1);
        tree.exit_at(2);
        tree.enter_at("C", 3);
        tree.exit_at(5);
        tree.exit_at(9);
        tree.enter_at("D", 10);
        tree.exit_at(20);

        tree.new_frame();

        assert_eq!(tree.len(), 5);
        assert_eq!(ids(tree.root()), ["A", "D"]);
        assert_eq!(ids(tree.find_path(&["A"]).unwrap()), ["B", "C"]);
        let paths: [&[&str]; 4] = [&["A"], &["A", "B"], &["A", "C"], &["D"]];
        for path in paths {
            let s = tree.find_path(path).unwrap().stats();
            assert_eq!(s, NodeStats::default(), "{path:?} not reset");
        }
    }

    #[test]
    fn inactive_tree_ignores_everything() {
        let mut tree = ProfileTree::new();
        tree.enter_at("A", 0);
        tree.exit_at(10);
        tree.enter_at("A", 20);

        tree.set_active(false);
        tree.enter_at("B", 21);
        tree.exit_at(22);
        tree.exit_at(23);
        tree.new_frame();
        assert_eq!(tree.current().id(), "A");
        assert_eq!(tree.len(), 2);
        let a = tree.find_path(&["A"]).unwrap().stats();
        assert_eq!(a.call_count, 2);
        assert_eq!(a.total_cycles, 10);

        tree.set_active(true);
        tree.exit_at(30);
        assert!(tree.current().is_root());
        assert_eq!(tree.find_path(&["A"]).unwrap().stats().total_cycles, 20);
    }

    #[test]
    fn exit_at_root_is_reported() {
        let mut tree = ProfileTree::new();
        assert_eq!(tree.try_exit_at(5), Err(TreeError::UnbalancedExit));
        tree.exit_at(5);
        assert!(tree.current().is_root());
        assert_eq!(tree.root().stats(), NodeStats::default());
    }

    #[test]
    fn percent_of_parent_handles_empty_parent() {
        let mut tree = ProfileTree::new();
        tree.enter_at("A", 0);
        tree.enter_at("B", 0);
        tree.exit_at(25);
        tree.enter_at("C", 25);
        tree.exit_at(100);
        tree.exit_at(100);

        // Root never closes a sample, so its children report 100%.
        assert_eq!(tree.find_path(&["A"]).unwrap().percent_of_parent(), 100.0);
        assert_eq!(tree.find_path(&["A", "B"]).unwrap().percent_of_parent(), 25.0);
        assert_eq!(tree.find_path(&["A", "C"]).unwrap().percent_of_parent(), 75.0);
        assert_eq!(tree.root().percent_of_parent(), 100.0);
    }

    #[test]
    fn real_clock_enter_exit_balances() {
        let mut tree = ProfileTree::new();
        tree.enter("outer");
        tree.enter("inner");
        std::hint::black_box((0..10_000u64).sum::<u64>());
        tree.exit();
        tree.exit();
        assert!(tree.current().is_root());
        let outer = tree.find_path(&["outer"]).unwrap().stats();
        let inner = tree.find_path(&["outer", "inner"]).unwrap().stats();
        assert!(outer.has_sample() && inner.has_sample());
        assert!(outer.total_cycles >= inner.total_cycles);
    }

    #[test]
    fn node_lookup_by_id() {
        let mut tree = ProfileTree::new();
        tree.enter_at("A", 0);
        let a = tree.current().node_id();
        tree.exit_at(1);
        assert_eq!(tree.node(a).unwrap().id(), "A");
        assert_eq!(a.index(), 1);
        assert!(tree.node(NodeId(99)).is_none());
    }
}
