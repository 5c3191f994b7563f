use std::sync::Mutex;

use tracing::trace;

use crate::error::{BTreeError, BTreeResult};
use crate::store::{ObjectStore, KEY_NULL};

/// Default rate `N` (spec §3/§6): non-root nodes hold between `N` and
/// `2N+2` keys.
pub const DEFAULT_RATE: u16 = 15;
const NODE_HEADER_SIZE: u16 = 12;

/// Builder for [`BTree`], mirroring the object store's `*Options` shape.
#[derive(Clone, Copy)]
pub struct BTreeOptions {
    rate: u16,
}

impl Default for BTreeOptions {
    fn default() -> Self {
        Self { rate: DEFAULT_RATE }
    }
}

impl BTreeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rate(mut self, rate: u16) -> Self {
        assert!(rate >= 1);
        self.rate = rate;
        self
    }

    fn capacity(&self) -> usize {
        2 * self.rate as usize + 2
    }

    fn node_size(&self) -> u16 {
        NODE_HEADER_SIZE + self.capacity() as u16 * 16
    }
}

#[derive(Clone)]
struct Node {
    leaf: bool,
    key_count: u16,
    slots: Vec<(u64, u64)>,
}

impl Node {
    fn empty_leaf(capacity: usize) -> Self {
        let mut slots = vec![(0u64, 0u64); capacity];
        slots[0] = (0, KEY_NULL);
        Self {
            leaf: true,
            key_count: 0,
            slots,
        }
    }

    fn fallback(&self) -> u64 {
        self.slots[self.key_count as usize].1
    }

    fn set_fallback(&mut self, value: u64) {
        self.slots[self.key_count as usize].1 = value;
    }

    /// First slot index with `slots[i].0 > key`, or `key_count` (fallback)
    /// if every key present is `<= key`.
    fn find_child_slot(&self, key: u64) -> usize {
        for i in 0..self.key_count as usize {
            if self.slots[i].0 > key {
                return i;
            }
        }
        self.key_count as usize
    }

    fn find_leaf_slot(&self, key: u64) -> Option<usize> {
        (0..self.key_count as usize).find(|&i| self.slots[i].0 == key)
    }

    fn child_at(&self, idx: usize) -> u64 {
        self.slots[idx].1
    }

    /// Insert a new key-entry in a leaf's sorted slot array at `idx`,
    /// preserving the right-neighbour pointer in the fallback slot.
    fn leaf_insert_at(&mut self, idx: usize, key: u64, value: u64) {
        let kc = self.key_count as usize;
        for j in (idx..=kc).rev() {
            self.slots[j + 1] = self.slots[j];
        }
        self.slots[idx] = (key, value);
        self.key_count += 1;
    }

    fn leaf_remove_at(&mut self, idx: usize) {
        let kc = self.key_count as usize;
        for j in idx..kc {
            self.slots[j] = self.slots[j + 1];
        }
        self.key_count -= 1;
    }

    /// Insert a new separator `(new_key, left)` at `idx`, repointing the
    /// slot that used to reference `left` (now shifted to `idx+1`) at
    /// `right` instead. Handles both the "ordinary slot" and "fallback"
    /// insertion positions identically.
    fn insert_separator(&mut self, idx: usize, new_key: u64, left: u64, right: u64) {
        let kc = self.key_count as usize;
        for j in (idx..=kc).rev() {
            self.slots[j + 1] = self.slots[j];
        }
        self.slots[idx] = (new_key, left);
        self.slots[idx + 1].1 = right;
        self.key_count += 1;
    }

    /// Remove the separator at position `i`, repointing what used to be at
    /// `i+1` (now absorbed into `i`) to `merged_into`.
    fn remove_separator(&mut self, i: usize, merged_into: u64) {
        let kc = self.key_count as usize;
        self.slots[i + 1].1 = merged_into;
        for j in i..kc {
            self.slots[j] = self.slots[j + 1];
        }
        self.key_count -= 1;
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Category {
    Low,
    Eq,
    EqPlus1,
    High,
}

fn category(count: u16, rate: u16) -> Category {
    if count < rate {
        Category::Low
    } else if count == rate {
        Category::Eq
    } else if count == rate + 1 {
        Category::EqPlus1
    } else {
        Category::High
    }
}

enum Action {
    Merge,
    TransferToLeft,
    TransferToRight,
}

fn decide(left_count: u16, right_count: u16, rate: u16, leaf: bool) -> Action {
    use Category::*;
    match (category(left_count, rate), category(right_count, rate)) {
        (Low, Low) | (Low, Eq) | (Eq, Low) | (Eq, Eq) => Action::Merge,
        (Low, EqPlus1) | (Low, High) | (Eq, High) => Action::TransferToLeft,
        (EqPlus1, Low) | (High, Low) | (High, Eq) => Action::TransferToRight,
        // Combinations the source table leaves unspecified (both sides
        // already at or above the minimum): merge if the result still
        // fits one node, otherwise shift one entry toward whichever side
        // is smaller. An internal merge also pulls the parent's separator
        // down into the combined node (`merge_children`), so it needs one
        // more free slot than a leaf merge.
        _ => {
            let merge_capacity = 2 * rate as u32 + 1 - if leaf { 0 } else { 1 };
            if left_count as u32 + right_count as u32 <= merge_capacity {
                Action::Merge
            } else if left_count <= right_count {
                Action::TransferToLeft
            } else {
                Action::TransferToRight
            }
        }
    }
}

/// A persistent `u64 -> u64` map built on an [`ObjectStore`], using
/// top-down preparatory split/merge so no ancestor is ever revisited once
/// the algorithm descends past it (spec §4.6).
pub struct BTree {
    store: ObjectStore,
    rate: u16,
    capacity: usize,
    node_size: u16,
    root: Mutex<u64>,
    write_lock: Mutex<()>,
}

impl BTree {
    /// Allocate a fresh, empty tree (a single empty leaf as its root).
    pub fn create(store: ObjectStore, options: BTreeOptions) -> BTreeResult<Self> {
        let capacity = options.capacity();
        let node_size = options.node_size();
        let root_handle = store.allocate(node_size)?;
        let tree = Self {
            store,
            rate: options.rate,
            capacity,
            node_size,
            root: Mutex::new(root_handle),
            write_lock: Mutex::new(()),
        };
        tree.write_node(root_handle, &Node::empty_leaf(capacity))?;
        Ok(tree)
    }

    /// Attach to a tree whose root already lives at `root_handle`.
    pub fn open(store: ObjectStore, options: BTreeOptions, root_handle: u64) -> Self {
        Self {
            store,
            rate: options.rate,
            capacity: options.capacity(),
            node_size: options.node_size(),
            root: Mutex::new(root_handle),
            write_lock: Mutex::new(()),
        }
    }

    /// Create a tree and register its root under `name` in the backing
    /// store's named-root table, so a later process can find it again.
    pub fn create_named(store: ObjectStore, options: BTreeOptions, name: &str) -> BTreeResult<Self> {
        let tree = Self::create(store, options)?;
        tree.store.register(name, *tree.root.lock().unwrap())?;
        Ok(tree)
    }

    /// Open a tree whose root handle was previously registered under `name`.
    pub fn open_named(store: ObjectStore, options: BTreeOptions, name: &str) -> BTreeResult<Self> {
        let handle = store.get_object(name)?;
        if handle == KEY_NULL {
            return Err(BTreeError::RootNotFound { name: name.to_string() });
        }
        Ok(Self::open(store, options, handle))
    }

    pub fn root_handle(&self) -> u64 {
        *self.root.lock().unwrap()
    }

    fn read_node(&self, handle: u64) -> BTreeResult<Node> {
        let mut access = self.store.access(handle, false)?;
        let _parent = access.read_long()?;
        let leaf = access.read_char()? == 1;
        let key_count = access.read_char()?;
        let mut slots = Vec::with_capacity(self.capacity);
        for _ in 0..self.capacity {
            let key = access.read_long()? as u64;
            let value = access.read_long()? as u64;
            slots.push((key, value));
        }
        Ok(Node { leaf, key_count, slots })
    }

    fn write_node(&self, handle: u64, node: &Node) -> BTreeResult<()> {
        let mut access = self.store.access(handle, true)?;
        access.write_long(0)?;
        access.write_char(if node.leaf { 1 } else { 0 })?;
        access.write_char(node.key_count)?;
        for &(key, value) in &node.slots {
            access.write_long(key as i64)?;
            access.write_long(value as i64)?;
        }
        Ok(())
    }

    fn alloc_node(&self, node: &Node) -> BTreeResult<u64> {
        let handle = self.store.allocate(self.node_size)?;
        self.write_node(handle, node)?;
        Ok(handle)
    }

    /// `get(key)` (spec §4.6): descend from the root, returning the stored
    /// value or [`KEY_NULL`] if absent.
    pub fn get(&self, key: u64) -> BTreeResult<u64> {
        let mut handle = self.root_handle();
        loop {
            let node = self.read_node(handle)?;
            if node.leaf {
                return Ok(match node.find_leaf_slot(key) {
                    Some(i) => node.slots[i].1,
                    None => KEY_NULL,
                });
            }
            let idx = node.find_child_slot(key);
            handle = node.child_at(idx);
        }
    }

    fn maybe_split_root(&self) -> BTreeResult<()> {
        let root_handle = self.root_handle();
        let root = self.read_node(root_handle)?;
        if (root.key_count as u64) < 2 * self.rate as u64 {
            return Ok(());
        }
        let n = self.rate;
        if root.leaf {
            let count_right = root.key_count - n;
            let mut left = Node::empty_leaf(self.capacity);
            left.key_count = n;
            left.slots[..n as usize].copy_from_slice(&root.slots[..n as usize]);
            let mut right = Node::empty_leaf(self.capacity);
            right.key_count = count_right;
            right.slots[..count_right as usize].copy_from_slice(&root.slots[n as usize..root.key_count as usize]);
            right.set_fallback(root.fallback());

            let right_handle = self.alloc_node(&right)?;
            left.set_fallback(right_handle);
            let left_handle = self.alloc_node(&left)?;

            let first_key_of_right = right.slots[0].0;
            let mut new_root = Node {
                leaf: false,
                key_count: 0,
                slots: vec![(0u64, 0u64); self.capacity],
            };
            new_root.slots[0] = (first_key_of_right, left_handle);
            new_root.slots[1].1 = right_handle;
            new_root.key_count = 1;
            self.write_node(root_handle, &new_root)?;
        } else {
            let count_right = root.key_count - n - 1;
            let separator = root.slots[n as usize].0;
            let mut left = Node {
                leaf: false,
                key_count: n,
                slots: vec![(0u64, 0u64); self.capacity],
            };
            left.slots[..n as usize].copy_from_slice(&root.slots[..n as usize]);
            left.set_fallback(root.slots[n as usize].1);

            let mut right = Node {
                leaf: false,
                key_count: count_right,
                slots: vec![(0u64, 0u64); self.capacity],
            };
            right.slots[..count_right as usize]
                .copy_from_slice(&root.slots[n as usize + 1..root.key_count as usize]);
            right.set_fallback(root.fallback());

            let left_handle = self.alloc_node(&left)?;
            let right_handle = self.alloc_node(&right)?;

            let mut new_root = Node {
                leaf: false,
                key_count: 1,
                slots: vec![(0u64, 0u64); self.capacity],
            };
            new_root.slots[0] = (separator, left_handle);
            new_root.slots[1].1 = right_handle;
            self.write_node(root_handle, &new_root)?;
        }
        trace!(node_key_count = self.capacity, "btree: split root");
        Ok(())
    }

    /// Split `child` (which has reached `2N` or more keys), returning
    /// `(promoted_key, right_handle)`. Updates `parent` in place (caller
    /// writes it back) to insert the new separator at `child_idx`.
    fn split_child(&self, parent: &mut Node, child_idx: usize, child_handle: u64, child: &Node) -> BTreeResult<(u64, u64)> {
        let n = self.rate;
        let (promoted_key, right_handle) = if child.leaf {
            let count_right = child.key_count - n;
            let mut left = child.clone();
            let mut right = Node::empty_leaf(self.capacity);
            right.key_count = count_right;
            right.slots[..count_right as usize].copy_from_slice(&child.slots[n as usize..child.key_count as usize]);
            right.set_fallback(child.fallback());

            let right_handle = self.alloc_node(&right)?;
            left.key_count = n;
            left.set_fallback(right_handle);
            self.write_node(child_handle, &left)?;
            (right.slots[0].0, right_handle)
        } else {
            let count_right = child.key_count - n - 1;
            let separator = child.slots[n as usize].0;
            let mut left = child.clone();
            left.key_count = n;
            left.set_fallback(child.slots[n as usize].1);

            let mut right = Node {
                leaf: false,
                key_count: count_right,
                slots: vec![(0u64, 0u64); self.capacity],
            };
            right.slots[..count_right as usize]
                .copy_from_slice(&child.slots[n as usize + 1..child.key_count as usize]);
            right.set_fallback(child.fallback());

            let right_handle = self.alloc_node(&right)?;
            self.write_node(child_handle, &left)?;
            (separator, right_handle)
        };
        parent.insert_separator(child_idx, promoted_key, child_handle, right_handle);
        Ok((promoted_key, right_handle))
    }

    /// `put(key, value)` (spec §4.6): unconditional upsert.
    pub fn put(&self, key: u64, value: u64) -> BTreeResult<()> {
        self.insert(key, value)?;
        Ok(())
    }

    /// `tryPut`: succeeds only if `key` is currently absent.
    pub fn try_put(&self, key: u64, value: u64) -> BTreeResult<bool> {
        self.compare_and_set(key, KEY_NULL, value)
    }

    /// `tryRemove`: succeeds only if `key` currently maps to `expected`.
    pub fn try_remove(&self, key: u64, expected: u64) -> BTreeResult<bool> {
        self.compare_and_set(key, expected, KEY_NULL)
    }

    /// `compareAndSet(key, expected, new)` (spec §4.6): if `new == KEY_NULL`
    /// this is a removal; if `expected == KEY_NULL` this is a fresh insert;
    /// otherwise a replace. Returns whether the prior value matched
    /// `expected`.
    pub fn compare_and_set(&self, key: u64, expected: u64, new: u64) -> BTreeResult<bool> {
        if key == KEY_NULL {
            return Err(BTreeError::ReservedKey);
        }
        let _guard = self.write_lock.lock().unwrap();
        let current = self.get_locked(key)?;
        if current != expected {
            return Ok(false);
        }
        if new == KEY_NULL {
            self.remove_locked(key)?;
        } else {
            self.insert_locked(key, new)?;
        }
        Ok(true)
    }

    fn insert(&self, key: u64, value: u64) -> BTreeResult<()> {
        if key == KEY_NULL || value == KEY_NULL {
            return Err(BTreeError::ReservedKey);
        }
        let _guard = self.write_lock.lock().unwrap();
        self.insert_locked(key, value)
    }

    fn insert_locked(&self, key: u64, value: u64) -> BTreeResult<()> {
        self.maybe_split_root()?;
        let mut handle = self.root_handle();
        loop {
            let mut node = self.read_node(handle)?;
            if node.leaf {
                match node.find_leaf_slot(key) {
                    Some(i) => node.slots[i].1 = value,
                    None => {
                        let idx = node.find_child_slot(key);
                        node.leaf_insert_at(idx, key, value);
                    }
                }
                self.write_node(handle, &node)?;
                return Ok(());
            }
            let idx = node.find_child_slot(key);
            let child_handle = node.child_at(idx);
            let child = self.read_node(child_handle)?;
            if (child.key_count as u64) >= 2 * self.rate as u64 {
                let (promoted, right_handle) = self.split_child(&mut node, idx, child_handle, &child)?;
                self.write_node(handle, &node)?;
                handle = if key < promoted { child_handle } else { right_handle };
            } else {
                handle = child_handle;
            }
        }
    }

    fn get_locked(&self, key: u64) -> BTreeResult<u64> {
        self.get(key)
    }

    /// `remove(key)`: unconditional removal. Returns the prior value, or
    /// [`KEY_NULL`] if the key was absent.
    pub fn remove(&self, key: u64) -> BTreeResult<u64> {
        if key == KEY_NULL {
            return Err(BTreeError::ReservedKey);
        }
        let _guard = self.write_lock.lock().unwrap();
        let prior = self.get_locked(key)?;
        if prior != KEY_NULL {
            self.remove_locked(key)?;
        }
        Ok(prior)
    }

    fn maybe_shrink_root(&self) -> BTreeResult<()> {
        loop {
            let root_handle = self.root_handle();
            let root = self.read_node(root_handle)?;
            if root.leaf || root.key_count > 0 {
                return Ok(());
            }
            let only_child = root.fallback();
            let child = self.read_node(only_child)?;
            self.write_node(root_handle, &child)?;
            self.store.free(only_child)?;
        }
    }

    fn remove_locked(&self, key: u64) -> BTreeResult<()> {
        self.maybe_shrink_root()?;
        let mut handle = self.root_handle();
        loop {
            let mut node = self.read_node(handle)?;
            if node.leaf {
                if let Some(i) = node.find_leaf_slot(key) {
                    node.leaf_remove_at(i);
                    self.write_node(handle, &node)?;
                }
                return Ok(());
            }
            let idx = node.find_child_slot(key);
            let child_handle = node.child_at(idx);
            let child = self.read_node(child_handle)?;
            if child.key_count > self.rate {
                handle = child_handle;
                continue;
            }
            // Pick an adjacent sibling to merge or redistribute with.
            let (left_idx, right_idx) = if idx == 0 { (idx, idx + 1) } else { (idx - 1, idx) };
            let left_handle = node.child_at(left_idx);
            let right_handle = node.child_at(right_idx);
            let left = self.read_node(left_handle)?;
            let right = self.read_node(right_handle)?;

            match decide(left.key_count, right.key_count, self.rate, left.leaf) {
                Action::Merge => {
                    self.merge_children(&mut node, left_idx, left_handle, left, right_handle, right)?;
                }
                Action::TransferToLeft => {
                    self.transfer_to_left(&mut node, left_idx, left_handle, left, right_handle, right)?;
                }
                Action::TransferToRight => {
                    self.transfer_to_right(&mut node, left_idx, left_handle, left, right_handle, right)?;
                }
            }
            self.write_node(handle, &node)?;
            // Re-derive which side now holds the key after restructuring.
            let idx = node.find_child_slot(key);
            handle = node.child_at(idx);
        }
    }

    fn merge_children(
        &self,
        parent: &mut Node,
        left_idx: usize,
        left_handle: u64,
        mut left: Node,
        right_handle: u64,
        right: Node,
    ) -> BTreeResult<()> {
        let lc = left.key_count as usize;
        let rc = right.key_count as usize;
        if left.leaf {
            left.slots[lc..lc + rc].copy_from_slice(&right.slots[..rc]);
            left.key_count += right.key_count;
            left.set_fallback(right.fallback());
        } else {
            let sep = parent.slots[left_idx].0;
            left.slots[lc] = (sep, left.fallback());
            left.slots[lc + 1..lc + 1 + rc].copy_from_slice(&right.slots[..rc]);
            left.key_count += right.key_count + 1;
            left.set_fallback(right.fallback());
        }
        self.write_node(left_handle, &left)?;
        self.store.free(right_handle)?;
        parent.remove_separator(left_idx, left_handle);
        trace!(left_handle, right_handle, "btree: merged siblings");
        Ok(())
    }

    fn transfer_to_left(
        &self,
        parent: &mut Node,
        left_idx: usize,
        left_handle: u64,
        mut left: Node,
        right_handle: u64,
        mut right: Node,
    ) -> BTreeResult<()> {
        if left.leaf {
            let moved = right.slots[0];
            right.leaf_remove_at(0);
            let lc = left.key_count as usize;
            left.slots[lc] = moved;
            left.key_count += 1;
            parent.slots[left_idx].0 = right.slots[0].0;
        } else {
            let old_sep = parent.slots[left_idx].0;
            let lc = left.key_count as usize;
            left.slots[lc] = (old_sep, left.fallback());
            left.set_fallback(right.slots[0].1);
            let new_sep = right.slots[0].0;
            right.leaf_remove_at(0);
            left.key_count += 1;
            parent.slots[left_idx].0 = new_sep;
        }
        self.write_node(left_handle, &left)?;
        self.write_node(right_handle, &right)?;
        trace!(left_handle, right_handle, "btree: transferred entry to left sibling");
        Ok(())
    }

    fn transfer_to_right(
        &self,
        parent: &mut Node,
        left_idx: usize,
        left_handle: u64,
        mut left: Node,
        right_handle: u64,
        mut right: Node,
    ) -> BTreeResult<()> {
        if left.leaf {
            let lc = left.key_count as usize - 1;
            let moved = left.slots[lc];
            left.key_count -= 1;
            right.leaf_insert_at(0, moved.0, moved.1);
            parent.slots[left_idx].0 = right.slots[0].0;
        } else {
            let old_sep = parent.slots[left_idx].0;
            let lc = left.key_count as usize - 1;
            let moved_sep = left.slots[lc].0;
            let moved_child = left.fallback();
            left.set_fallback(left.slots[lc].1);
            left.key_count -= 1;
            right.insert_separator(0, old_sep, moved_child, right.slots[0].1);
            // `insert_separator` wrote `right.slots[1].1 = right.slots[0].1`'s
            // old value; the true first child is `moved_child`, already set.
            parent.slots[left_idx].0 = moved_sep;
        }
        self.write_node(left_handle, &left)?;
        self.write_node(right_handle, &right)?;
        trace!(left_handle, right_handle, "btree: transferred entry to right sibling");
        Ok(())
    }

    /// Free every node but the root, then rewrite the root as an empty leaf.
    pub fn clear(&self) -> BTreeResult<()> {
        let _guard = self.write_lock.lock().unwrap();
        let root_handle = self.root_handle();
        let root = self.read_node(root_handle)?;
        self.clear_subtree(&root)?;
        self.write_node(root_handle, &Node::empty_leaf(self.capacity))?;
        Ok(())
    }

    fn clear_subtree(&self, node: &Node) -> BTreeResult<()> {
        if node.leaf {
            return Ok(());
        }
        for i in 0..=node.key_count as usize {
            let child_handle = node.slots[i].1;
            let child = self.read_node(child_handle)?;
            self.clear_subtree(&child)?;
            self.store.free(child_handle)?;
        }
        Ok(())
    }

    fn leftmost_leaf_handle(&self) -> BTreeResult<u64> {
        let mut handle = self.root_handle();
        loop {
            let node = self.read_node(handle)?;
            if node.leaf {
                return Ok(handle);
            }
            handle = node.slots[0].1;
        }
    }

    /// In-order iteration over every `(key, value)` entry, following the
    /// leaf chain. Undefined under concurrent structural modification.
    pub fn iter(&self) -> BTreeResult<BTreeIter<'_>> {
        let handle = self.leftmost_leaf_handle()?;
        Ok(BTreeIter {
            tree: self,
            node: Some(self.read_node(handle)?),
            index: 0,
            upper_bound: None,
        })
    }

    /// Iterate entries with `key < upper_bound`, starting from the leftmost
    /// leaf (the same leaf-chain walk `iter` uses).
    pub fn range(&self, upper_bound: u64) -> BTreeResult<BTreeIter<'_>> {
        let handle = self.leftmost_leaf_handle()?;
        Ok(BTreeIter {
            tree: self,
            node: Some(self.read_node(handle)?),
            index: 0,
            upper_bound: Some(upper_bound),
        })
    }
}

/// Leaf-chain iterator over a [`BTree`]'s entries.
pub struct BTreeIter<'a> {
    tree: &'a BTree,
    node: Option<Node>,
    index: usize,
    upper_bound: Option<u64>,
}

impl Iterator for BTreeIter<'_> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = self.node.as_ref()?;
            if self.index >= node.key_count as usize {
                let next_handle = node.fallback();
                if next_handle == KEY_NULL {
                    self.node = None;
                    return None;
                }
                self.node = self.tree.read_node(next_handle).ok();
                self.index = 0;
                continue;
            }
            let (key, value) = node.slots[self.index];
            self.index += 1;
            if let Some(bound) = self.upper_bound {
                if key >= bound {
                    self.node = None;
                    return None;
                }
            }
            return Some((key, value));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use warren_coordinator::Coordinator;
    use warren_storage::backend::InMemoryStorage;
    use warren_storage::Storage;

    fn tree_with_rate(rate: u16) -> BTree {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let coordinator = Arc::new(Coordinator::new(storage, 64, 16));
        let store = ObjectStore::create(coordinator, crate::store::StoreOptions::new()).unwrap();
        BTree::create(store, BTreeOptions::new().rate(rate)).unwrap()
    }

    fn tree() -> BTree {
        tree_with_rate(DEFAULT_RATE)
    }

    #[test]
    fn get_put_remove_laws() {
        let tree = tree();
        assert_eq!(tree.get(1).unwrap(), KEY_NULL);
        tree.put(1, 100).unwrap();
        assert_eq!(tree.get(1).unwrap(), 100);
        tree.put(1, 200).unwrap();
        assert_eq!(tree.get(1).unwrap(), 200);
        assert_eq!(tree.remove(1).unwrap(), 200);
        assert_eq!(tree.get(1).unwrap(), KEY_NULL);
    }

    /// S5: compare-and-set semantics.
    #[test]
    fn compare_and_set_scenario() {
        let tree = tree();
        assert!(tree.try_put(42, 100).unwrap());
        assert!(!tree.try_put(42, 200).unwrap());
        assert!(tree.compare_and_set(42, 100, 200).unwrap());
        assert_eq!(tree.get(42).unwrap(), 200);
        assert!(!tree.try_remove(42, 100).unwrap());
        assert!(tree.try_remove(42, 200).unwrap());
        assert_eq!(tree.get(42).unwrap(), KEY_NULL);
    }

    #[test]
    fn null_key_and_value_are_rejected() {
        let tree = tree();
        assert!(matches!(tree.put(KEY_NULL, 1), Err(BTreeError::ReservedKey)));
        assert!(matches!(tree.put(1, KEY_NULL), Err(BTreeError::ReservedKey)));
        assert!(matches!(tree.remove(KEY_NULL), Err(BTreeError::ReservedKey)));
    }

    /// S4: round-trip under splits, with a low rate so 1000 keys force many
    /// levels of splitting.
    #[test]
    fn round_trip_under_splits_and_partial_removal() {
        let tree = tree_with_rate(4);
        for k in 0..1000u64 {
            tree.put(k, k).unwrap();
        }
        assert_eq!(tree.get(500).unwrap(), 500);

        let collected: Vec<u64> = tree.iter().unwrap().map(|(k, _)| k).collect();
        assert_eq!(collected.len(), 1000);
        assert!(collected.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(collected[0], 0);
        assert_eq!(*collected.last().unwrap(), 999);

        for k in 0..500u64 {
            assert_eq!(tree.remove(k).unwrap(), k);
        }
        let remaining: Vec<u64> = tree.iter().unwrap().map(|(k, _)| k).collect();
        assert_eq!(remaining.len(), 500);
        assert!(remaining.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(remaining[0], 500);
        assert_eq!(*remaining.last().unwrap(), 999);
    }

    #[test]
    fn node_occupancy_stays_within_rate_bounds_after_mixed_ops() {
        let rate = 4u16;
        let tree = tree_with_rate(rate);
        for k in 0..300u64 {
            tree.put(k * 3 % 300, k).unwrap();
        }
        for k in 0..150u64 {
            tree.remove(k * 5 % 300).unwrap();
        }

        fn check(tree: &BTree, handle: u64, is_root: bool, rate: u16) {
            let node = tree.read_node(handle).unwrap();
            if !is_root {
                assert!(
                    node.key_count >= rate && node.key_count <= 2 * rate + 2,
                    "key_count {} out of [{}, {}]",
                    node.key_count,
                    rate,
                    2 * rate + 2
                );
            }
            if !node.leaf {
                for i in 0..=node.key_count as usize {
                    check(tree, node.slots[i].1, false, rate);
                }
            }
        }
        check(&tree, tree.root_handle(), true, rate);

        let leftmost = tree.leftmost_leaf_handle().unwrap();
        let mut handle = leftmost;
        let mut prev_key: Option<u64> = None;
        loop {
            let node = tree.read_node(handle).unwrap();
            for i in 0..node.key_count as usize {
                let key = node.slots[i].0;
                if let Some(p) = prev_key {
                    assert!(p < key);
                }
                prev_key = Some(key);
            }
            let next = node.fallback();
            if next == KEY_NULL {
                break;
            }
            handle = next;
        }
    }

    #[test]
    fn range_iterator_respects_upper_bound() {
        let tree = tree_with_rate(4);
        for k in 0..100u64 {
            tree.put(k, k * 10).unwrap();
        }
        let collected: Vec<(u64, u64)> = tree.range(50).unwrap().collect();
        assert_eq!(collected.len(), 50);
        assert_eq!(collected.last().unwrap().0, 49);
    }

    #[test]
    fn clear_frees_all_nodes_but_root() {
        let tree = tree_with_rate(4);
        for k in 0..200u64 {
            tree.put(k, k).unwrap();
        }
        tree.clear().unwrap();
        assert_eq!(tree.iter().unwrap().count(), 0);
        tree.put(7, 7).unwrap();
        assert_eq!(tree.get(7).unwrap(), 7);
    }

    #[test]
    fn named_root_round_trip() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let coordinator = Arc::new(Coordinator::new(storage, 64, 16));
        let store = ObjectStore::create(coordinator, crate::store::StoreOptions::new()).unwrap();
        let tree = BTree::create_named(store, BTreeOptions::new(), "main").unwrap();
        tree.put(1, 1).unwrap();

        // A second handle onto the same backing store, opened by name.
        let coordinator2 = tree.store.coordinator();
        let store2 = ObjectStore::open(coordinator2, crate::store::StoreOptions::new()).unwrap();
        let reopened = BTree::open_named(store2, BTreeOptions::new(), "main").unwrap();
        assert_eq!(reopened.get(1).unwrap(), 1);
    }
}
