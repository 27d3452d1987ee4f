//! Copy-on-write B+tree over a [BlobStore].
//!
//! [BPlusTree] is a sorted index of key blobs to value blobs with
//! fixed branching factor `ORDER`. Readers walk whatever snapshot the
//! head blob publishes, without locks beyond the per-blob read locks;
//! writers build a private version through a [Transaction] and publish
//! it with one compare-and-swap on the head. Concurrent writers race
//! at that swap, the loser retries.
//!
//! Duplicate keys are permitted: equal keys route into the right
//! subtree on descent, so repeated inserts of one key accumulate
//! entries and iterate in insertion order.

use bytemuck::Pod;
use log::debug;

use std::{marker, mem, sync::Arc};

use crate::{
    btree::{
        iter::Iter,
        node::{load_key, search_key, BaseNode, HeadNode, InternalNode, LeafNode},
        txn::Transaction,
    },
    chunk::INVALID_INDEX,
    err_at,
    store::{BlobMut, BlobRef, BlobStore},
    Error, Result,
};

/// Blob index of the distinguished head record.
pub const HEAD_INDEX: usize = 1;

/// Copy-on-write, multi-version B+tree index.
pub struct BPlusTree<K, V, const ORDER: usize> {
    store: Arc<BlobStore>,
    _marker: marker::PhantomData<(K, V)>,
}

// Result of one level of recursive insertion: the node that now covers
// the insertion point, and, when that node split, the separator key
// blob and the new right sibling.
struct SplitBundle {
    left_index: usize,
    split: Option<(u64, u64)>,
}

impl<K, V, const ORDER: usize> BPlusTree<K, V, ORDER>
where
    K: Pod + Ord,
    V: Pod,
{
    /// Open the tree over `store`, bootstrapping an empty tree (head
    /// record plus empty root leaf) when the store is fresh.
    pub fn create(store: Arc<BlobStore>) -> Result<BPlusTree<K, V, ORDER>> {
        // merging two minimal siblings plus their separator must fit
        // in one node, which holds for even branching factors only.
        assert!(ORDER >= 4 && ORDER % 2 == 0, "unsupported branching factor");

        let tree = BPlusTree { store, _marker: marker::PhantomData };
        if tree.store.is_empty() {
            let mut head: BlobMut<HeadNode> = tree.store.insert(HeadNode::new(0))?;
            if head.index() != HEAD_INDEX {
                return err_at!(
                    InvalidFile,
                    msg: "head record landed at {}, store not fresh", head.index()
                );
            }
            let root: BlobMut<LeafNode<ORDER>> = tree.store.insert(LeafNode::new(0))?;
            head.root_index = root.index() as u64;
            debug!(
                target: "btree",
                "{:?}, bootstrapped root at {}", tree.store.to_name(), root.index()
            );
        } else {
            match tree.store.get::<HeadNode>(HEAD_INDEX) {
                Some(head) if head.is_head() => (),
                _ => return err_at!(InvalidFile, msg: "blob 1 is not a tree head"),
            }
        }
        Ok(tree)
    }

    pub(crate) fn store(&self) -> &BlobStore {
        &self.store
    }

    /// Begin a transaction against the current head.
    pub fn transaction(&self) -> Result<Transaction<K, V, ORDER>> {
        Transaction::begin(self)
    }

    /// Insert `key`, `value`, retrying the transaction until its
    /// commit wins.
    pub fn set(&self, key: K, value: V) -> Result<()> {
        loop {
            let mut txn = self.transaction()?;
            txn.insert(key, value)?;
            if txn.commit()? {
                return Ok(());
            }
        }
    }

    /// Remove `key`, retrying the transaction until its commit wins.
    /// Returns a handle on the removed value, `None` if the key was
    /// not present.
    pub fn remove(&self, key: &K) -> Result<Option<BlobRef<V>>> {
        loop {
            let mut txn = self.transaction()?;
            let deleted = txn.remove(key)?;
            if txn.commit()? {
                return Ok(deleted);
            }
        }
    }

    /// Look up `key` in the current head's snapshot.
    pub fn get(&self, key: &K) -> Result<Option<BlobRef<V>>> {
        let iter = self.search(key)?;
        match iter.key() {
            Some(found) if *found == *key => Ok(iter.value()),
            _ => Ok(None),
        }
    }

    /// Iterate the current head's snapshot from the first key at or
    /// above `key`. This is an implicit read transaction: the returned
    /// iterator keeps reading that snapshot even if later commits move
    /// the head.
    pub fn search(&self, key: &K) -> Result<Iter<K, V, ORDER>> {
        let root_index = self.current_root()?;
        self.search_from(root_index, key)
    }

    /// Iterate the whole of the current head's snapshot.
    pub fn iter(&self) -> Result<Iter<K, V, ORDER>> {
        let root_index = self.current_root()?;
        self.iter_from(root_index)
    }

    fn current_root(&self) -> Result<usize> {
        match self.store.get::<HeadNode>(HEAD_INDEX) {
            Some(head) => Ok(head.root_index as usize),
            None => err_at!(Fatal, msg: "tree head missing"),
        }
    }

    pub(crate) fn search_from(&self, root_index: usize, key: &K) -> Result<Iter<K, V, ORDER>> {
        let store = self.store();
        let mut path = vec![];
        let mut node: BlobRef<BaseNode<ORDER>> = match store.get(root_index) {
            Some(node) => node,
            None => return err_at!(Fatal, msg: "missing root {}", root_index),
        };
        loop {
            path.push(node.index() as u64);
            let (pos, eq) = search_key(store, &*node, key)?;
            if node.is_leaf() {
                return Ok(Iter::new(store, path, pos));
            }
            let child_pos = if eq { pos + 1 } else { pos };
            let child_index = node.view::<InternalNode<ORDER>>().children[child_pos] as usize;
            node = match store.get(child_index) {
                Some(child) => child,
                None => return err_at!(Fatal, msg: "missing child {}", child_index),
            };
        }
    }

    pub(crate) fn iter_from(&self, root_index: usize) -> Result<Iter<K, V, ORDER>> {
        let store = self.store();
        let mut path = vec![];
        let mut node: BlobRef<BaseNode<ORDER>> = match store.get(root_index) {
            Some(node) => node,
            None => return err_at!(Fatal, msg: "missing root {}", root_index),
        };
        loop {
            path.push(node.index() as u64);
            if node.is_leaf() {
                return Ok(Iter::new(store, path, 0));
            }
            let child_index = node.view::<InternalNode<ORDER>>().children[0] as usize;
            node = match store.get(child_index) {
                Some(child) => child,
                None => return err_at!(Fatal, msg: "missing child {}", child_index),
            };
        }
    }

    /// Walk the current snapshot checking the tree invariants: sorted
    /// keys, separator keys equal to the leftmost key of their right
    /// subtree, leaf occupancy bounds, uniform leaf depth.
    pub fn validate(&self) -> Result<TreeStats> {
        let root_index = self.current_root()?;
        let summary = self.validate_node(root_index, true)?;
        Ok(TreeStats { n_entries: summary.n_entries, height: summary.height })
    }

    fn validate_node(&self, index: usize, is_root: bool) -> Result<NodeSummary<K>> {
        let store = self.store();
        let node: BlobRef<BaseNode<ORDER>> = match store.get(index) {
            Some(node) => node,
            None => return err_at!(Fatal, msg: "missing node {}", index),
        };
        let n = node.num_keys();
        if n >= ORDER {
            return err_at!(Fatal, msg: "node {} overflow, n={}", index, n);
        }

        let mut keys = Vec::with_capacity(n);
        for i in 0..n {
            keys.push(load_key::<K>(store, node.keys[i])?);
        }
        if keys.windows(2).any(|w| w[0] > w[1]) {
            return err_at!(Fatal, msg: "node {} keys out of order", index);
        }

        if node.is_leaf() {
            if !is_root && n < (ORDER - 1) / 2 {
                return err_at!(Fatal, msg: "leaf {} underflow, n={}", index, n);
            }
            return Ok(NodeSummary { height: 1, n_entries: n, min_key: keys.first().copied() });
        }

        if !is_root && n < (ORDER - 1) / 2 {
            return err_at!(Fatal, msg: "internal {} underflow, n={}", index, n);
        }
        if is_root && n == 0 {
            return err_at!(Fatal, msg: "empty internal root {}", index);
        }

        let children: Vec<usize> = {
            let view = node.view::<InternalNode<ORDER>>();
            (0..=n).map(|i| view.children[i] as usize).collect()
        };
        let mut n_entries = 0;
        let mut height = 0;
        let mut min_key = None;
        for (i, child) in children.into_iter().enumerate() {
            let summary = self.validate_node(child, false)?;
            if i == 0 {
                height = summary.height;
                min_key = summary.min_key;
            } else {
                if summary.height != height {
                    return err_at!(Fatal, msg: "unbalanced child {} of {}", child, index);
                }
                // separator equals the leftmost key of its right subtree.
                match summary.min_key {
                    Some(child_min) if child_min == keys[i - 1] => (),
                    _ => return err_at!(Fatal, msg: "bad separator {} of {}", i - 1, index),
                }
            }
            n_entries += summary.n_entries;
        }
        Ok(NodeSummary { height: height + 1, n_entries, min_key })
    }
}

struct NodeSummary<K> {
    height: usize,
    n_entries: usize,
    min_key: Option<K>,
}

/// Shape statistics, returned by [BPlusTree::validate].
#[derive(Clone, Copy, Debug)]
pub struct TreeStats {
    /// Number of key/value entries in the snapshot.
    pub n_entries: usize,
    /// Number of levels, leaves included.
    pub height: usize,
}

impl<'a, K, V, const ORDER: usize> Transaction<'a, K, V, ORDER>
where
    K: Pod + Ord,
    V: Pod,
{
    /// Insert `key`, `value` into the transaction's private version.
    pub fn insert(&mut self, key: K, value: V) -> Result<()> {
        let key_ref = self.insert_blob(key)?.downgrade();
        let value_ref = self.insert_blob(value)?.downgrade();
        self.insert_refs(key_ref, value_ref)
    }

    /// Search the transaction's version for `key`. For a transaction
    /// that has not mutated anything yet this reads the begin-time
    /// snapshot.
    pub fn search(&self, key: &K) -> Result<Iter<'a, K, V, ORDER>> {
        self.tree.search_from(self.root_index(), key)
    }

    /// Iterate the whole of the transaction's version.
    pub fn iter(&self) -> Result<Iter<'a, K, V, ORDER>> {
        self.tree.iter_from(self.root_index())
    }

    /// Look up `key` in the transaction's version.
    pub fn get(&self, key: &K) -> Result<Option<BlobRef<'a, V>>> {
        let iter = self.search(key)?;
        match iter.key() {
            Some(found) if *found == *key => Ok(iter.value()),
            _ => Ok(None),
        }
    }

    /// Remove `key` from the transaction's private version, returning
    /// a handle on the removed value.
    pub fn remove(&mut self, key: &K) -> Result<Option<BlobRef<'a, V>>> {
        let root_ref = self.root_ref()?;
        let mut root = self.mutable_base(root_ref)?;
        let deleted = if root.is_leaf() {
            self.delete_from_leaf(&mut root, key)?
        } else {
            self.delete_from_internal(&mut root, key)?
        };
        let root_index = root.index();
        mem::drop(root);
        self.set_root(root_index);
        Ok(deleted)
    }

    fn root_ref(&self) -> Result<BlobRef<'a, BaseNode<ORDER>>> {
        match self.store().get(self.root_index()) {
            Some(root) => Ok(root),
            None => err_at!(Fatal, msg: "missing root {}", self.root_index()),
        }
    }

    // clone-or-upgrade per the CoW rule, stamping the node with the
    // transaction's version.
    fn mutable_base(
        &mut self,
        node: BlobRef<'a, BaseNode<ORDER>>,
    ) -> Result<BlobMut<'a, BaseNode<ORDER>>> {
        let version = self.version();
        let mut node = self.mutable(node)?;
        node.version = version;
        Ok(node)
    }

    fn child_ref(
        &self,
        node: &BlobMut<'a, BaseNode<ORDER>>,
        child_pos: usize,
    ) -> Result<BlobRef<'a, BaseNode<ORDER>>> {
        let child_index = node.view::<InternalNode<ORDER>>().children[child_pos] as usize;
        match self.store().get(child_index) {
            Some(child) => Ok(child),
            None => err_at!(Fatal, msg: "missing child {}", child_index),
        }
    }

    // ---- insertion ----

    fn insert_refs(&mut self, key: BlobRef<'a, K>, value: BlobRef<'a, V>) -> Result<()> {
        let root = self.root_ref()?;
        let bundle = self.insert_rec(root, key, value)?;
        match bundle.split {
            Some((mid_key, right_index)) => {
                // the root split; grow a new root with one separator.
                let mut new_root: BlobMut<InternalNode<ORDER>> =
                    self.insert_blob(InternalNode::new(self.version()))?;
                new_root.base.n = 1;
                new_root.base.keys[0] = mid_key;
                new_root.children[0] = bundle.left_index as u64;
                new_root.children[1] = right_index;
                let root_index = new_root.index();
                mem::drop(new_root);
                debug!(target: "btree", "root split, new root {}", root_index);
                self.set_root(root_index);
            }
            None => self.set_root(bundle.left_index),
        }
        Ok(())
    }

    fn insert_rec(
        &mut self,
        node: BlobRef<'a, BaseNode<ORDER>>,
        key: BlobRef<'a, K>,
        value: BlobRef<'a, V>,
    ) -> Result<SplitBundle> {
        if node.is_leaf() {
            return self.insert_into_leaf(node.to::<LeafNode<ORDER>>(), key, value);
        }

        let (pos, eq) = search_key(self.store(), &*node, &*key)?;
        let child_pos = if eq { pos + 1 } else { pos };
        let child_index = node.view::<InternalNode<ORDER>>().children[child_pos] as usize;
        let child: BlobRef<BaseNode<ORDER>> = match self.store().get(child_index) {
            Some(child) => child,
            None => return err_at!(Fatal, msg: "missing child {}", child_index),
        };
        let bundle = self.insert_rec(child, key, value)?;

        let version = self.version();
        let mut new_node: BlobMut<InternalNode<ORDER>> =
            self.mutable(node.to::<InternalNode<ORDER>>())?;
        new_node.base.version = version;
        new_node.children[child_pos] = bundle.left_index as u64;

        let (mid_key, right_index) = match bundle.split {
            Some(split) => split,
            None => return Ok(SplitBundle { left_index: new_node.index(), split: None }),
        };

        if !new_node.base.is_full() {
            self.insert_key_child(&mut new_node, mid_key, right_index)?;
            return Ok(SplitBundle { left_index: new_node.index(), split: None });
        }

        // this node is full too: split it and route the pending
        // separator into the half that owns its key range. Equal keys
        // go right, matching descent.
        let node_bundle = self.split_internal(&mut new_node)?;
        let (node_mid, node_right) = match node_bundle.split {
            Some(split) => split,
            None => unreachable!(),
        };
        let go_left = {
            let pending = load_key::<K>(self.store(), mid_key)?;
            let split_key = load_key::<K>(self.store(), node_mid)?;
            pending < split_key
        };
        if go_left {
            self.insert_key_child(&mut new_node, mid_key, right_index)?;
        } else {
            let mut right_half: BlobMut<InternalNode<ORDER>> =
                match self.store().get_mut(node_right as usize) {
                    Some(right_half) => right_half,
                    None => return err_at!(Fatal, msg: "missing split node {}", node_right),
                };
            self.insert_key_child(&mut right_half, mid_key, right_index)?;
        }
        Ok(node_bundle)
    }

    fn insert_into_leaf(
        &mut self,
        node: BlobRef<'a, LeafNode<ORDER>>,
        key: BlobRef<'a, K>,
        value: BlobRef<'a, V>,
    ) -> Result<SplitBundle> {
        let version = self.version();
        let mut leaf: BlobMut<LeafNode<ORDER>> = self.mutable(node)?;
        leaf.base.version = version;

        if !leaf.base.is_full() {
            self.insert_into_leaf_sorted(&mut leaf, &key, &value)?;
            return Ok(SplitBundle { left_index: leaf.index(), split: None });
        }

        let bundle = self.split_leaf(&mut leaf)?;
        let (mid_key, right_index) = match bundle.split {
            Some(split) => split,
            None => unreachable!(),
        };
        let go_right = {
            let mid = load_key::<K>(self.store(), mid_key)?;
            *key >= mid
        };
        if go_right {
            let mut right: BlobMut<LeafNode<ORDER>> =
                match self.store().get_mut(right_index as usize) {
                    Some(right) => right,
                    None => return err_at!(Fatal, msg: "missing split leaf {}", right_index),
                };
            self.insert_into_leaf_sorted(&mut right, &key, &value)?;
        } else {
            self.insert_into_leaf_sorted(&mut leaf, &key, &value)?;
        }
        Ok(bundle)
    }

    // plain sorted insertion into a non-full leaf.
    fn insert_into_leaf_sorted(
        &self,
        leaf: &mut BlobMut<'a, LeafNode<ORDER>>,
        key: &BlobRef<'a, K>,
        value: &BlobRef<'a, V>,
    ) -> Result<()> {
        let n = leaf.base.num_keys();
        assert!(n < ORDER - 1, "insert into full leaf");

        let mut i = n;
        while i > 0 {
            let existing = load_key::<K>(self.store(), leaf.base.keys[i - 1])?;
            if **key >= existing {
                break;
            }
            leaf.base.keys[i] = leaf.base.keys[i - 1];
            leaf.values[i] = leaf.values[i - 1];
            i -= 1;
        }
        leaf.base.keys[i] = key.index() as u64;
        leaf.values[i] = value.index() as u64;
        leaf.base.n += 1;
        Ok(())
    }

    fn insert_key_child(
        &self,
        node: &mut BlobMut<'a, InternalNode<ORDER>>,
        key_index: u64,
        child_index: u64,
    ) -> Result<()> {
        let n = node.base.num_keys();
        assert!(n < ORDER - 1, "insert into full internal node");

        let new_key = load_key::<K>(self.store(), key_index)?;
        let mut i = n;
        while i > 0 {
            let existing = load_key::<K>(self.store(), node.base.keys[i - 1])?;
            if new_key >= existing {
                break;
            }
            node.base.keys[i] = node.base.keys[i - 1];
            node.children[i + 1] = node.children[i];
            i -= 1;
        }
        node.base.keys[i] = key_index;
        node.children[i + 1] = child_index;
        node.base.n += 1;
        Ok(())
    }

    // split a full leaf at the middle key; the right half keeps the
    // middle key ("copy up").
    fn split_leaf(&mut self, left: &mut BlobMut<'a, LeafNode<ORDER>>) -> Result<SplitBundle> {
        let mut right: BlobMut<LeafNode<ORDER>> =
            self.insert_blob(LeafNode::new(self.version()))?;

        let n = left.base.num_keys();
        let mid = (n - 1) / 2;
        let mid_key = left.base.keys[mid];

        right.base.n = (n - mid) as u64;
        for i in 0..(n - mid) {
            right.base.keys[i] = left.base.keys[mid + i];
            right.values[i] = left.values[mid + i];
            left.base.keys[mid + i] = INVALID_INDEX;
            left.values[mid + i] = INVALID_INDEX;
        }
        left.base.n = mid as u64;

        Ok(SplitBundle {
            left_index: left.index(),
            split: Some((mid_key, right.index() as u64)),
        })
    }

    // split a full internal node at the middle key; the middle key
    // leaves this level entirely ("push up").
    fn split_internal(
        &mut self,
        left: &mut BlobMut<'a, InternalNode<ORDER>>,
    ) -> Result<SplitBundle> {
        let mut right: BlobMut<InternalNode<ORDER>> =
            self.insert_blob(InternalNode::new(self.version()))?;

        let n = left.base.num_keys();
        let mid = (n - 1) / 2;
        let mid_key = left.base.keys[mid];
        let rn = n - mid - 1;

        right.base.n = rn as u64;
        for i in 0..rn {
            right.base.keys[i] = left.base.keys[mid + 1 + i];
            right.children[i] = left.children[mid + 1 + i];
            left.base.keys[mid + 1 + i] = INVALID_INDEX;
            left.children[mid + 1 + i] = INVALID_INDEX;
        }
        right.children[rn] = left.children[mid + 1 + rn];
        left.children[mid + 1 + rn] = INVALID_INDEX;
        left.base.keys[mid] = INVALID_INDEX;
        left.base.n = mid as u64;

        Ok(SplitBundle {
            left_index: left.index(),
            split: Some((mid_key, right.index() as u64)),
        })
    }

    // ---- deletion ----

    fn delete_from_internal(
        &mut self,
        node: &mut BlobMut<'a, BaseNode<ORDER>>,
        key: &K,
    ) -> Result<Option<BlobRef<'a, V>>> {
        let (pos, eq) = search_key(self.store(), &**node, key)?;
        if !eq {
            return self.delete_descend(node, pos, key);
        }

        // the key doubles as a separator here; the entry itself lives
        // in the right subtree.
        let deleted = self.delete_descend(node, pos + 1, key)?;

        // deleting the entry invalidated the separator; replace it
        // with the new smallest key of the right subtree.
        if node.is_internal() {
            let (pos2, eq2) = search_key(self.store(), &**node, key)?;
            if eq2 {
                let successor = {
                    let view = node.view::<InternalNode<ORDER>>();
                    let mut successor = None;
                    for child_pos in 0..=view.base.num_keys() {
                        let child_index = view.children[child_pos] as usize;
                        successor = self.successor_key(child_index, key)?;
                        if successor.is_some() {
                            break;
                        }
                    }
                    successor
                };
                match successor {
                    Some(succ) => node.keys[pos2] = succ,
                    None => return err_at!(Fatal, msg: "separator without successor"),
                }
            }
        }
        Ok(deleted)
    }

    fn delete_descend(
        &mut self,
        parent: &mut BlobMut<'a, BaseNode<ORDER>>,
        child_pos: usize,
        key: &K,
    ) -> Result<Option<BlobRef<'a, V>>> {
        let child_ref = self.child_ref(parent, child_pos)?;

        let mut collapsed = false;
        let mut child_slot: Option<BlobMut<BaseNode<ORDER>>> = None;
        if child_ref.will_underflow() {
            // rebalance before descending, so the recursive delete
            // cannot underflow the child.
            let child = self.rebalance_child(parent, child_pos, child_ref)?;
            if parent.num_keys() == 0 {
                // the (cloned) root lost its last separator; the
                // merged child becomes the root.
                self.discard(parent.index());
                let old_root = mem::replace(parent, child);
                debug!(target: "btree", "root collapse, dropping {}", old_root.index());
                mem::drop(old_root);
                collapsed = true;
            } else {
                child_slot = Some(child);
            }
        } else {
            let child = self.mutable_base(child_ref)?;
            parent.view_mut::<InternalNode<ORDER>>().children[child_pos] = child.index() as u64;
            child_slot = Some(child);
        }

        let target: &mut BlobMut<BaseNode<ORDER>> = if collapsed {
            parent
        } else {
            match child_slot.as_mut() {
                Some(child) => child,
                None => unreachable!(),
            }
        };
        if target.is_leaf() {
            self.delete_from_leaf(target, key)
        } else {
            self.delete_from_internal(target, key)
        }
    }

    fn delete_from_leaf(
        &mut self,
        node: &mut BlobMut<'a, BaseNode<ORDER>>,
        key: &K,
    ) -> Result<Option<BlobRef<'a, V>>> {
        let (pos, eq) = search_key(self.store(), &**node, key)?;
        if !eq {
            return Ok(None);
        }
        let value_index = node.view::<LeafNode<ORDER>>().values[pos] as usize;
        let deleted: BlobRef<V> = match self.store().get(value_index) {
            Some(deleted) => deleted,
            None => return err_at!(Fatal, msg: "missing value blob {}", value_index),
        };

        let leaf = node.view_mut::<LeafNode<ORDER>>();
        let n = leaf.base.num_keys();
        for i in pos + 1..n {
            leaf.base.keys[i - 1] = leaf.base.keys[i];
            leaf.values[i - 1] = leaf.values[i];
        }
        leaf.base.keys[n - 1] = INVALID_INDEX;
        leaf.values[n - 1] = INVALID_INDEX;
        leaf.base.n -= 1;

        Ok(Some(deleted))
    }

    // smallest key at or above `key` within the subtree at `index`.
    fn successor_key(&self, index: usize, key: &K) -> Result<Option<u64>> {
        let node: BlobRef<BaseNode<ORDER>> = match self.store().get(index) {
            Some(node) => node,
            None => return err_at!(Fatal, msg: "missing node {}", index),
        };
        let (pos, _) = search_key(self.store(), &*node, key)?;
        if node.is_leaf() {
            if pos < node.num_keys() {
                return Ok(Some(node.keys[pos]));
            }
            return Ok(None);
        }
        let view = node.view::<InternalNode<ORDER>>();
        for child_pos in 0..=view.base.num_keys() {
            let child_index = view.children[child_pos] as usize;
            if let Some(successor) = self.successor_key(child_index, key)? {
                return Ok(Some(successor));
            }
        }
        Ok(None)
    }

    // make sure the child at `child_pos` can lose a key: borrow from a
    // sibling with spare keys, or merge with one. Returns the
    // (transaction-local) node now covering the child's key range.
    fn rebalance_child(
        &mut self,
        parent: &mut BlobMut<'a, BaseNode<ORDER>>,
        child_pos: usize,
        child: BlobRef<'a, BaseNode<ORDER>>,
    ) -> Result<BlobMut<'a, BaseNode<ORDER>>> {
        if child_pos > 0 {
            let left_ref = self.child_ref(parent, child_pos - 1)?;
            if !left_ref.will_underflow() {
                return self.borrow_from_left(parent, child_pos, left_ref, child);
            }
        }
        if child_pos < parent.num_keys() {
            let right_ref = self.child_ref(parent, child_pos + 1)?;
            if !right_ref.will_underflow() {
                return self.borrow_from_right(parent, child_pos, child, right_ref);
            }
        }
        self.merge_child(parent, child_pos, child)
    }

    // rotate the last key of the left sibling through the parent into
    // the child. Returns the child.
    fn borrow_from_left(
        &mut self,
        parent: &mut BlobMut<'a, BaseNode<ORDER>>,
        child_pos: usize,
        left_ref: BlobRef<'a, BaseNode<ORDER>>,
        right_ref: BlobRef<'a, BaseNode<ORDER>>,
    ) -> Result<BlobMut<'a, BaseNode<ORDER>>> {
        let mut left = self.mutable_base(left_ref)?;
        let mut right = self.mutable_base(right_ref)?;
        {
            let p = parent.view_mut::<InternalNode<ORDER>>();
            p.children[child_pos - 1] = left.index() as u64;
            p.children[child_pos] = right.index() as u64;
        }
        let ln = left.num_keys();
        let rn = right.num_keys();

        // make room at the front of the child.
        for i in (1..=rn).rev() {
            right.keys[i] = right.keys[i - 1];
        }
        if right.is_internal() {
            {
                let rv = right.view_mut::<InternalNode<ORDER>>();
                for i in (0..=rn).rev() {
                    rv.children[i + 1] = rv.children[i];
                }
            }
            let moved_child = left.view::<InternalNode<ORDER>>().children[ln];
            right.view_mut::<InternalNode<ORDER>>().children[0] = moved_child;
            left.view_mut::<InternalNode<ORDER>>().children[ln] = INVALID_INDEX;
            // the parent separator rotates down into the child.
            right.keys[0] = parent.keys[child_pos - 1];
        } else {
            {
                let rv = right.view_mut::<LeafNode<ORDER>>();
                for i in (1..=rn).rev() {
                    rv.values[i] = rv.values[i - 1];
                }
            }
            let moved_value = left.view::<LeafNode<ORDER>>().values[ln - 1];
            right.view_mut::<LeafNode<ORDER>>().values[0] = moved_value;
            left.view_mut::<LeafNode<ORDER>>().values[ln - 1] = INVALID_INDEX;
            // leaves keep all keys, so the borrowed key moves whole.
            right.keys[0] = left.keys[ln - 1];
        }

        parent.keys[child_pos - 1] = left.keys[ln - 1];
        left.keys[ln - 1] = INVALID_INDEX;
        right.n += 1;
        left.n -= 1;

        Ok(right)
    }

    // rotate the first key of the right sibling through the parent
    // into the child. Returns the child.
    fn borrow_from_right(
        &mut self,
        parent: &mut BlobMut<'a, BaseNode<ORDER>>,
        child_pos: usize,
        left_ref: BlobRef<'a, BaseNode<ORDER>>,
        right_ref: BlobRef<'a, BaseNode<ORDER>>,
    ) -> Result<BlobMut<'a, BaseNode<ORDER>>> {
        let mut left = self.mutable_base(left_ref)?;
        let mut right = self.mutable_base(right_ref)?;
        {
            let p = parent.view_mut::<InternalNode<ORDER>>();
            p.children[child_pos] = left.index() as u64;
            p.children[child_pos + 1] = right.index() as u64;
        }
        let ln = left.num_keys();
        let rn = right.num_keys();

        let new_parent_key;
        if left.is_internal() {
            // the parent separator rotates down into the child.
            left.keys[ln] = parent.keys[child_pos];
            let moved_child = right.view::<InternalNode<ORDER>>().children[0];
            left.view_mut::<InternalNode<ORDER>>().children[ln + 1] = moved_child;
            {
                let rv = right.view_mut::<InternalNode<ORDER>>();
                for i in 1..=rn {
                    rv.children[i - 1] = rv.children[i];
                }
                rv.children[rn] = INVALID_INDEX;
            }
            new_parent_key = right.keys[0];
        } else {
            left.keys[ln] = right.keys[0];
            let moved_value = right.view::<LeafNode<ORDER>>().values[0];
            left.view_mut::<LeafNode<ORDER>>().values[ln] = moved_value;
            {
                let rv = right.view_mut::<LeafNode<ORDER>>();
                for i in 1..rn {
                    rv.values[i - 1] = rv.values[i];
                }
                rv.values[rn - 1] = INVALID_INDEX;
            }
            new_parent_key = right.keys[1];
        }

        for i in 1..rn {
            right.keys[i - 1] = right.keys[i];
        }
        right.keys[rn - 1] = INVALID_INDEX;
        left.n += 1;
        right.n -= 1;
        parent.keys[child_pos] = new_parent_key;

        Ok(left)
    }

    // merge the child with a sibling; the right node of the merged
    // pair is discarded and the parent loses the separator. Returns
    // the merged (left) node.
    fn merge_child(
        &mut self,
        parent: &mut BlobMut<'a, BaseNode<ORDER>>,
        child_pos: usize,
        child: BlobRef<'a, BaseNode<ORDER>>,
    ) -> Result<BlobMut<'a, BaseNode<ORDER>>> {
        let (key_pos, mut left, right_ref) = if child_pos < parent.num_keys() {
            let left = self.mutable_base(child)?;
            parent.view_mut::<InternalNode<ORDER>>().children[child_pos] = left.index() as u64;
            let right_ref = self.child_ref(parent, child_pos + 1)?;
            (child_pos, left, right_ref)
        } else {
            // rightmost child: merge into the left sibling instead.
            let left_ref = self.child_ref(parent, child_pos - 1)?;
            let left = self.mutable_base(left_ref)?;
            parent.view_mut::<InternalNode<ORDER>>().children[child_pos - 1] =
                left.index() as u64;
            (child_pos - 1, left, child)
        };

        let parent_key = parent.keys[key_pos];
        if left.is_leaf() {
            // leaves hold every key, the separator is omitted.
            let rv = right_ref.view::<LeafNode<ORDER>>();
            let rn = rv.base.num_keys();
            let lv = left.view_mut::<LeafNode<ORDER>>();
            let mut ln = lv.base.num_keys();
            for i in 0..rn {
                lv.base.keys[ln] = rv.base.keys[i];
                lv.values[ln] = rv.values[i];
                ln += 1;
            }
            lv.base.n = ln as u64;
        } else {
            // the separator is pulled down between the two halves.
            let rv = right_ref.view::<InternalNode<ORDER>>();
            let rn = rv.base.num_keys();
            let lv = left.view_mut::<InternalNode<ORDER>>();
            let mut ln = lv.base.num_keys();
            lv.base.keys[ln] = parent_key;
            lv.children[ln + 1] = rv.children[0];
            ln += 1;
            for i in 0..rn {
                lv.base.keys[ln] = rv.base.keys[i];
                lv.children[ln + 1] = rv.children[i + 1];
                ln += 1;
            }
            lv.base.n = ln as u64;
        }
        self.discard(right_ref.index());
        mem::drop(right_ref);

        // the parent loses the separator and the right child pointer.
        let pn = parent.num_keys();
        {
            let p = parent.view_mut::<InternalNode<ORDER>>();
            for i in key_pos..pn - 1 {
                p.base.keys[i] = p.base.keys[i + 1];
                p.children[i + 1] = p.children[i + 2];
            }
            p.base.keys[pn - 1] = INVALID_INDEX;
            p.children[pn] = INVALID_INDEX;
            p.base.n -= 1;
        }

        Ok(left)
    }
}

#[cfg(test)]
#[path = "tree_test.rs"]
mod tree_test;
