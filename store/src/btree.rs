//! Top-down B-tree over the record layer.
//!
//! A tree of order 2T+1: non-root nodes hold between T and 2T entries, the
//! root between 0 and 2T. An insert that pushes a node past 2T entries
//! splits it around its middle entry; a removal that drops a non-root node
//! below T entries borrows from a sibling or merges with one. All leaves sit
//! at the same depth.
//!
//! Unique trees refuse duplicate keys; non-unique trees route duplicates
//! into the left subtree of an equal entry, and the range scans use biased
//! binary searches to land on the first or last of an equal run.

use bstore_api::codec::Codec;
use bstore_api::controller::Device;
use bstore_api::types::{Geometry, NodeHandle};
use bstore_api::util::{self, Bias};
use std::cmp::Ordering;
use std::path::Path;

use super::error_store::TreeError;
use super::node_manager::{NodeManager, DEFAULT_MIN_ENTRIES};

/// Configuration of a tree index.
#[derive(Debug, Clone, Copy)]
pub struct TreeOptions {
    /// Whether duplicate keys are refused
    pub unique: bool,
    /// Minimum number of entries per non-root node (T)
    pub min_entries: usize,
}

impl Default for TreeOptions {
    fn default() -> TreeOptions {
        TreeOptions {
            unique: true,
            min_entries: DEFAULT_MIN_ENTRIES,
        }
    }
}

/// Outcome of one descent step.
enum Step {
    Done(Result<usize, usize>),
    Descend(u32),
}

/// Scan direction of a [`TreeScan`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Ascending,
    Descending,
}

/// A B-tree index backed by one store file.
#[derive(Debug)]
pub struct BTree<K, V, KC, VC> {
    nodes: NodeManager<K, V, KC, VC>,
    unique: bool,
}

impl<K, V, KC, VC> BTree<K, V, KC, VC>
where
    K: Ord + Clone,
    V: Clone,
    KC: Codec<K>,
    VC: Codec<V>,
{
    /// Create a fresh index file at `path`.
    pub fn mkstore<P: AsRef<Path>>(
        path: P,
        geometry: Geometry,
        options: TreeOptions,
    ) -> Result<Self, TreeError> {
        Ok(BTree {
            nodes: NodeManager::mkstore(path, geometry, options.min_entries)?,
            unique: options.unique,
        })
    }

    /// Mount an existing index file.
    pub fn mountstore(
        dev: Device,
        geometry: Geometry,
        options: TreeOptions,
    ) -> Result<Self, TreeError> {
        Ok(BTree {
            nodes: NodeManager::mountstore(dev, geometry, options.min_entries)?,
            unique: options.unique,
        })
    }

    /// Unmount the tree, returning the device of the backing file.
    /// Call [`BTree::save_changes`] first to persist outstanding mutations.
    pub fn unmountstore(self) -> Device {
        self.nodes.unmountstore()
    }

    /// Persist every node mutated since the last call.
    pub fn save_changes(&mut self) -> Result<(), TreeError> {
        self.nodes.save_changes()
    }

    fn max_entries(&self) -> usize {
        2 * self.nodes.min_entries()
    }

    /// Look up `key`, returning the first matching entry.
    pub fn get(&mut self, key: &K) -> Result<Option<(K, V)>, TreeError> {
        let mut current = self.nodes.root_node()?;
        loop {
            let step = {
                let node = current.borrow();
                match node.entries.binary_search_by(|(k, _)| k.cmp(key)) {
                    Ok(i) => return Ok(Some(node.entries[i].clone())),
                    Err(i) => {
                        if node.is_leaf() {
                            return Ok(None);
                        }
                        node.children[i]
                    }
                }
            };
            current = self
                .nodes
                .find(step)?
                .ok_or(TreeError::Format("missing child node"))?;
        }
    }

    /// Descend to the node an insert of `key` must land in.
    ///
    /// Returns the node together with `Ok(match_index)` on an exact hit or
    /// `Err(insertion_index)` otherwise. In a unique tree an internal hit is
    /// returned as-is so the insert can refuse it; in a non-unique tree the
    /// descent continues into the child at the matched index, so duplicates
    /// accumulate to the left of the existing entry.
    fn find_node_for_insertion(
        &mut self,
        key: &K,
    ) -> Result<(NodeHandle<K, V>, Result<usize, usize>), TreeError> {
        let mut current = self.nodes.root_node()?;
        loop {
            let step = {
                let node = current.borrow();
                match node.entries.binary_search_by(|(k, _)| k.cmp(key)) {
                    Ok(i) => {
                        if node.is_leaf() || self.unique {
                            Step::Done(Ok(i))
                        } else {
                            Step::Descend(node.children[i])
                        }
                    }
                    Err(i) => {
                        if node.is_leaf() {
                            Step::Done(Err(i))
                        } else {
                            Step::Descend(node.children[i])
                        }
                    }
                }
            };
            match step {
                Step::Done(position) => return Ok((current, position)),
                Step::Descend(child) => {
                    current = self
                        .nodes
                        .find(child)?
                        .ok_or(TreeError::Format("missing child node"))?;
                }
            }
        }
    }

    /// Insert an entry.
    /// In a unique tree, inserting an existing key fails with
    /// [`TreeError::KeyExists`] before anything is mutated.
    pub fn insert(&mut self, key: K, value: V) -> Result<(), TreeError> {
        let (node, position) = self.find_node_for_insertion(&key)?;
        let index = match position {
            Ok(i) => {
                if self.unique {
                    return Err(TreeError::KeyExists);
                }
                i
            }
            Err(i) => i,
        };
        node.borrow_mut().entries.insert(index, (key, value));
        self.nodes.mark_as_changed(&node);
        let overflow = node.borrow().entries.len() > self.max_entries();
        if overflow {
            self.split(node)?;
        }
        Ok(())
    }

    /// Split an overflowing node around its middle entry, recursing upward
    /// while the parent overflows in turn.
    fn split(&mut self, node: NodeHandle<K, V>) -> Result<(), TreeError> {
        let h = self.nodes.min_entries();
        let (separator, right_entries, right_children, node_id, parent_id) = {
            let mut n = node.borrow_mut();
            let right_entries = n.entries.split_off(h + 1);
            let separator = n
                .entries
                .pop()
                .ok_or(TreeError::Format("split of an underfull node"))?;
            let right_children = if n.children.is_empty() {
                Vec::new()
            } else {
                n.children.split_off(h + 1)
            };
            (separator, right_entries, right_children, n.id, n.parent_id)
        };
        let right = self.nodes.create(right_entries, right_children.clone())?;
        let right_id = right.borrow().id;
        for child_id in &right_children {
            let child = self
                .nodes
                .find(*child_id)?
                .ok_or(TreeError::Format("missing child node"))?;
            child.borrow_mut().parent_id = right_id;
            self.nodes.mark_as_changed(&child);
        }
        self.nodes.mark_as_changed(&node);

        if parent_id == 0 {
            let root = self
                .nodes
                .create_new_root(separator.0, separator.1, node_id, right_id)?;
            let root_id = root.borrow().id;
            node.borrow_mut().parent_id = root_id;
            right.borrow_mut().parent_id = root_id;
            self.nodes.mark_as_changed(&node);
            self.nodes.mark_as_changed(&right);
        } else {
            right.borrow_mut().parent_id = parent_id;
            self.nodes.mark_as_changed(&right);
            let parent = self
                .nodes
                .find(parent_id)?
                .ok_or(TreeError::Format("missing parent node"))?;
            {
                let mut p = parent.borrow_mut();
                let at = p
                    .child_position(node_id)
                    .ok_or(TreeError::Format("child not registered in its parent"))?;
                p.entries.insert(at, separator);
                p.children.insert(at + 1, right_id);
            }
            self.nodes.mark_as_changed(&parent);
            let overflow = parent.borrow().entries.len() > self.max_entries();
            if overflow {
                self.split(parent)?;
            }
        }
        Ok(())
    }

    /// Remove `key` from a unique tree.
    /// Returns whether the key was present.
    pub fn delete(&mut self, key: &K) -> Result<bool, TreeError> {
        if !self.unique {
            return Err(TreeError::Unsupported(
                "delete by key requires a unique tree",
            ));
        }
        let mut current = self.nodes.root_node()?;
        let (node, index) = loop {
            let step = {
                let n = current.borrow();
                match n.entries.binary_search_by(|(k, _)| k.cmp(key)) {
                    Ok(i) => Step::Done(Ok(i)),
                    Err(i) => {
                        if n.is_leaf() {
                            return Ok(false);
                        }
                        Step::Descend(n.children[i])
                    }
                }
            };
            match step {
                Step::Done(Ok(i)) => break (current, i),
                Step::Done(Err(_)) => return Ok(false),
                Step::Descend(child) => {
                    current = self
                        .nodes
                        .find(child)?
                        .ok_or(TreeError::Format("missing child node"))?;
                }
            }
        };
        self.remove_entry_at(node, index)?;
        Ok(true)
    }

    /// Remove every entry of a non-unique tree whose key equals `key` and
    /// whose value compares equal to `value` under `value_cmp`.
    /// Returns whether anything was removed. Changes are saved at the end.
    pub fn delete_by_value<F>(&mut self, key: &K, value: &V, value_cmp: F) -> Result<bool, TreeError>
    where
        F: Fn(&V, &V) -> Ordering,
    {
        if self.unique {
            return Err(TreeError::Unsupported(
                "delete by value requires a non-unique tree",
            ));
        }
        let mut removed = false;
        loop {
            let hit = {
                let mut scan = self.larger_than_or_eq(key)?;
                let mut found = None;
                while let Some(item) = scan.next() {
                    let (k, v) = item?;
                    if k.cmp(key) == Ordering::Greater {
                        break;
                    }
                    if value_cmp(&v, value) == Ordering::Equal {
                        found = scan.position();
                        break;
                    }
                }
                found
            };
            match hit {
                Some((node, index)) => {
                    self.remove_entry_at(node, index)?;
                    removed = true;
                }
                None => break,
            }
        }
        self.save_changes()?;
        Ok(removed)
    }

    /// Remove the entry at `index` of `node`.
    ///
    /// An internal entry is first swapped with its in-order predecessor, so
    /// the removal itself always happens in a leaf; an underfull non-root
    /// leaf is rebalanced afterwards.
    fn remove_entry_at(&mut self, node: NodeHandle<K, V>, index: usize) -> Result<(), TreeError> {
        let is_leaf = node.borrow().is_leaf();
        let target = if is_leaf {
            {
                let mut n = node.borrow_mut();
                n.remove_entry(index)
                    .ok_or(TreeError::Format("entry index out of bounds"))?;
            }
            self.nodes.mark_as_changed(&node);
            node
        } else {
            let start = node
                .borrow()
                .children
                .get(index)
                .copied()
                .ok_or(TreeError::Format("entry index out of bounds"))?;
            let mut leaf = self
                .nodes
                .find(start)?
                .ok_or(TreeError::Format("missing child node"))?;
            loop {
                let next = { leaf.borrow().children.last().copied() };
                match next {
                    Some(child) => {
                        leaf = self
                            .nodes
                            .find(child)?
                            .ok_or(TreeError::Format("missing child node"))?;
                    }
                    None => break,
                }
            }
            let predecessor = leaf
                .borrow_mut()
                .entries
                .pop()
                .ok_or(TreeError::Format("empty leaf during a predecessor swap"))?;
            {
                let mut n = node.borrow_mut();
                if index >= n.entries.len() {
                    return Err(TreeError::Format("entry index out of bounds"));
                }
                n.entries[index] = predecessor;
            }
            self.nodes.mark_as_changed(&node);
            self.nodes.mark_as_changed(&leaf);
            leaf
        };
        let (len, parent_id) = {
            let t = target.borrow();
            (t.entries.len(), t.parent_id)
        };
        if len < self.nodes.min_entries() && parent_id != 0 {
            self.rebalance(target)?;
        }
        Ok(())
    }

    /// Refill an underfull non-root node: borrow from the right sibling,
    /// else from the left one, else merge with a sibling. A merge may leave
    /// the parent underfull (recurse) or empty at the root (collapse one
    /// level).
    fn rebalance(&mut self, node: NodeHandle<K, V>) -> Result<(), TreeError> {
        let (node_id, parent_id) = {
            let n = node.borrow();
            (n.id, n.parent_id)
        };
        let parent = self
            .nodes
            .find(parent_id)?
            .ok_or(TreeError::Format("missing parent node"))?;
        let position = parent
            .borrow()
            .child_position(node_id)
            .ok_or(TreeError::Format("child not registered in its parent"))?;
        let child_count = parent.borrow().children.len();
        let t = self.nodes.min_entries();

        if position + 1 < child_count {
            let right_id = parent.borrow().children[position + 1];
            let right = self
                .nodes
                .find(right_id)?
                .ok_or(TreeError::Format("missing sibling node"))?;
            if right.borrow().entries.len() > t {
                let moved_child = {
                    let mut p = parent.borrow_mut();
                    let mut n = node.borrow_mut();
                    let mut r = right.borrow_mut();
                    let separator = std::mem::replace(&mut p.entries[position], r.entries.remove(0));
                    n.entries.push(separator);
                    if r.children.is_empty() {
                        None
                    } else {
                        Some(r.children.remove(0))
                    }
                };
                if let Some(child_id) = moved_child {
                    node.borrow_mut().children.push(child_id);
                    let child = self
                        .nodes
                        .find(child_id)?
                        .ok_or(TreeError::Format("missing child node"))?;
                    child.borrow_mut().parent_id = node_id;
                    self.nodes.mark_as_changed(&child);
                }
                self.nodes.mark_as_changed(&node);
                self.nodes.mark_as_changed(&parent);
                self.nodes.mark_as_changed(&right);
                return Ok(());
            }
        }

        if position > 0 {
            let left_id = parent.borrow().children[position - 1];
            let left = self
                .nodes
                .find(left_id)?
                .ok_or(TreeError::Format("missing sibling node"))?;
            if left.borrow().entries.len() > t {
                let moved_child = {
                    let mut p = parent.borrow_mut();
                    let mut n = node.borrow_mut();
                    let mut l = left.borrow_mut();
                    let last = l
                        .entries
                        .pop()
                        .ok_or(TreeError::Format("empty sibling during a rebalance"))?;
                    let separator = std::mem::replace(&mut p.entries[position - 1], last);
                    n.entries.insert(0, separator);
                    l.children.pop()
                };
                if let Some(child_id) = moved_child {
                    node.borrow_mut().children.insert(0, child_id);
                    let child = self
                        .nodes
                        .find(child_id)?
                        .ok_or(TreeError::Format("missing child node"))?;
                    child.borrow_mut().parent_id = node_id;
                    self.nodes.mark_as_changed(&child);
                }
                self.nodes.mark_as_changed(&node);
                self.nodes.mark_as_changed(&parent);
                self.nodes.mark_as_changed(&left);
                return Ok(());
            }
        }

        // Merge: the left node absorbs the separator and the right node.
        let (left_node, right_node, separator_index) = if position + 1 < child_count {
            let right_id = parent.borrow().children[position + 1];
            let right = self
                .nodes
                .find(right_id)?
                .ok_or(TreeError::Format("missing sibling node"))?;
            (node.clone(), right, position)
        } else if position > 0 {
            let left_id = parent.borrow().children[position - 1];
            let left = self
                .nodes
                .find(left_id)?
                .ok_or(TreeError::Format("missing sibling node"))?;
            (left, node.clone(), position - 1)
        } else {
            return Err(TreeError::Format("node has no sibling to merge with"));
        };
        let moved_children = {
            let mut p = parent.borrow_mut();
            let mut l = left_node.borrow_mut();
            let mut r = right_node.borrow_mut();
            let separator = p.entries.remove(separator_index);
            p.children.remove(separator_index + 1);
            l.entries.push(separator);
            l.entries.append(&mut r.entries);
            let moved: Vec<u32> = r.children.drain(..).collect();
            l.children.extend(moved.iter().copied());
            moved
        };
        let left_id = left_node.borrow().id;
        for child_id in moved_children {
            let child = self
                .nodes
                .find(child_id)?
                .ok_or(TreeError::Format("missing child node"))?;
            child.borrow_mut().parent_id = left_id;
            self.nodes.mark_as_changed(&child);
        }
        self.nodes.mark_as_changed(&left_node);
        self.nodes.mark_as_changed(&parent);
        self.nodes.delete(&right_node)?;

        let (parent_len, grandparent) = {
            let p = parent.borrow();
            (p.entries.len(), p.parent_id)
        };
        if grandparent == 0 {
            if parent_len == 0 {
                // The root ran out of entries: its last child takes over.
                self.nodes.make_root(&left_node)?;
                self.nodes.mark_as_changed(&left_node);
                self.nodes.delete(&parent)?;
            }
        } else if parent_len < t {
            self.rebalance(parent)?;
        }
        Ok(())
    }

    /// Descend to the leaf where an iteration bounded by `key` starts.
    /// At every equal hit, picks the first or last occurrence depending on
    /// `move_left` and keeps descending, so the boundary is exact even when
    /// duplicates span nodes.
    fn find_node_for_iteration(
        &mut self,
        key: &K,
        move_left: bool,
    ) -> Result<(NodeHandle<K, V>, Result<usize, usize>), TreeError> {
        let bias = if move_left { Bias::First } else { Bias::Last };
        let mut current = self.nodes.root_node()?;
        loop {
            let step = {
                let node = current.borrow();
                match util::binary_search_bias(&node.entries, |(k, _)| k.cmp(key), bias) {
                    Ok(i) => {
                        if node.is_leaf() {
                            Step::Done(Ok(i))
                        } else if move_left {
                            Step::Descend(node.children[i])
                        } else {
                            Step::Descend(node.children[i + 1])
                        }
                    }
                    Err(i) => {
                        if node.is_leaf() {
                            Step::Done(Err(i))
                        } else {
                            Step::Descend(node.children[i])
                        }
                    }
                }
            };
            match step {
                Step::Done(position) => return Ok((current, position)),
                Step::Descend(child) => {
                    current = self
                        .nodes
                        .find(child)?
                        .ok_or(TreeError::Format("missing child node"))?;
                }
            }
        }
    }

    /// All entries with a key `>= key`, in ascending key order.
    pub fn larger_than_or_eq(&mut self, key: &K) -> Result<TreeScan<'_, K, V, KC, VC>, TreeError> {
        let (node, position) = self.find_node_for_iteration(key, true)?;
        let start = match position {
            Ok(i) => i as i64,
            Err(i) => i as i64,
        };
        Ok(TreeScan::new(self, node, start, Direction::Ascending))
    }

    /// All entries with a key `> key`, in ascending key order.
    pub fn larger_than(&mut self, key: &K) -> Result<TreeScan<'_, K, V, KC, VC>, TreeError> {
        let (node, position) = self.find_node_for_iteration(key, false)?;
        let start = match position {
            Ok(i) => i as i64 + 1,
            Err(i) => i as i64,
        };
        Ok(TreeScan::new(self, node, start, Direction::Ascending))
    }

    /// All entries with a key `<= key`, in descending key order.
    pub fn less_than_or_eq(&mut self, key: &K) -> Result<TreeScan<'_, K, V, KC, VC>, TreeError> {
        let (node, position) = self.find_node_for_iteration(key, false)?;
        let start = match position {
            Ok(i) => i as i64,
            Err(i) => i as i64 - 1,
        };
        Ok(TreeScan::new(self, node, start, Direction::Descending))
    }

    /// All entries with a key `< key`, in descending key order.
    pub fn less_than(&mut self, key: &K) -> Result<TreeScan<'_, K, V, KC, VC>, TreeError> {
        let (node, position) = self.find_node_for_iteration(key, true)?;
        let start = match position {
            Ok(i) => i as i64 - 1,
            Err(i) => i as i64 - 1,
        };
        Ok(TreeScan::new(self, node, start, Direction::Descending))
    }
}

/// Lazy, single-pass cursor over the entries of a [`BTree`].
///
/// Yields entries in key order, ascending or descending, moving between
/// nodes through child and parent links. The scan borrows the tree mutably
/// for its whole lifetime; mutating the tree while scanning is therefore
/// ruled out by the borrow checker.
pub struct TreeScan<'a, K, V, KC, VC> {
    tree: &'a mut BTree<K, V, KC, VC>,
    node: NodeHandle<K, V>,
    index: i64,
    direction: Direction,
    started: bool,
    done: bool,
    last: Option<(NodeHandle<K, V>, usize)>,
}

impl<'a, K, V, KC, VC> TreeScan<'a, K, V, KC, VC>
where
    K: Ord + Clone,
    V: Clone,
    KC: Codec<K>,
    VC: Codec<V>,
{
    fn new(
        tree: &'a mut BTree<K, V, KC, VC>,
        node: NodeHandle<K, V>,
        index: i64,
        direction: Direction,
    ) -> TreeScan<'a, K, V, KC, VC> {
        TreeScan {
            tree,
            node,
            index,
            direction,
            started: false,
            done: false,
            last: None,
        }
    }

    /// The node and entry index of the most recently yielded entry.
    fn position(&self) -> Option<(NodeHandle<K, V>, usize)> {
        self.last.clone()
    }

    fn leftmost_leaf(&mut self, start: u32) -> Result<NodeHandle<K, V>, TreeError> {
        let mut current = self
            .tree
            .nodes
            .find(start)?
            .ok_or(TreeError::Format("missing child node"))?;
        loop {
            let next = { current.borrow().children.first().copied() };
            match next {
                Some(child) => {
                    current = self
                        .tree
                        .nodes
                        .find(child)?
                        .ok_or(TreeError::Format("missing child node"))?;
                }
                None => return Ok(current),
            }
        }
    }

    fn rightmost_leaf(&mut self, start: u32) -> Result<NodeHandle<K, V>, TreeError> {
        let mut current = self
            .tree
            .nodes
            .find(start)?
            .ok_or(TreeError::Format("missing child node"))?;
        loop {
            let next = { current.borrow().children.last().copied() };
            match next {
                Some(child) => {
                    current = self
                        .tree
                        .nodes
                        .find(child)?
                        .ok_or(TreeError::Format("missing child node"))?;
                }
                None => return Ok(current),
            }
        }
    }

    fn step(&mut self) -> Result<Option<(K, V)>, TreeError> {
        if self.done {
            return Ok(None);
        }
        if !self.started {
            self.started = true;
        } else {
            let is_leaf = self.node.borrow().is_leaf();
            match self.direction {
                Direction::Ascending => {
                    if is_leaf {
                        self.index += 1;
                    } else {
                        let child = { self.node.borrow().children[(self.index + 1) as usize] };
                        self.node = self.leftmost_leaf(child)?;
                        self.index = 0;
                    }
                }
                Direction::Descending => {
                    if is_leaf {
                        self.index -= 1;
                    } else {
                        let child = { self.node.borrow().children[self.index as usize] };
                        let leaf = self.rightmost_leaf(child)?;
                        self.index = leaf.borrow().entries.len() as i64 - 1;
                        self.node = leaf;
                    }
                }
            }
        }
        // Climb while the current node is exhausted in the scan direction.
        loop {
            let len = self.node.borrow().entries.len() as i64;
            let exhausted = match self.direction {
                Direction::Ascending => self.index >= len,
                Direction::Descending => self.index < 0,
            };
            if !exhausted {
                break;
            }
            let (id, parent_id) = {
                let n = self.node.borrow();
                (n.id, n.parent_id)
            };
            if parent_id == 0 {
                self.done = true;
                return Ok(None);
            }
            let parent = self
                .tree
                .nodes
                .find(parent_id)?
                .ok_or(TreeError::Format("missing parent node"))?;
            let position = parent
                .borrow()
                .child_position(id)
                .ok_or(TreeError::Format("child not registered in its parent"))?
                as i64;
            self.index = match self.direction {
                Direction::Ascending => position,
                Direction::Descending => position - 1,
            };
            self.node = parent;
        }
        let entry = { self.node.borrow().entries[self.index as usize].clone() };
        self.last = Some((self.node.clone(), self.index as usize));
        Ok(Some(entry))
    }
}

impl<'a, K, V, KC, VC> Iterator for TreeScan<'a, K, V, KC, VC>
where
    K: Ord + Clone,
    V: Clone,
    KC: Codec<K>,
    VC: Codec<V>,
{
    type Item = Result<(K, V), TreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

// The scenario tests for this layer are shared through the api crate.
#[cfg(all(test, any(feature = "tree", feature = "all")))]
#[path = "../../api/store-tests/tree_test.rs"]
mod tests;
