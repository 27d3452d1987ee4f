//! Ordered iteration over a tree snapshot's leaves.

use bytemuck::Pod;

use std::marker;

use crate::{
    btree::node::{BaseNode, InternalNode, LeafNode},
    store::{BlobRef, BlobStore},
};

/// Iterator over `(key, value)` handles, ascending by key, starting
/// from the position a search landed on.
///
/// The iterator carries the root-to-leaf path of blob indexes so that
/// stepping past a leaf can climb to the first ancestor of which the
/// current leaf is not the rightmost descendant, and then descend
/// leftmost into the next leaf.
pub struct Iter<'s, K, V, const ORDER: usize> {
    store: &'s BlobStore,
    path: Vec<u64>,
    leaf: Option<BlobRef<'s, LeafNode<ORDER>>>,
    pos: usize,
    _marker: marker::PhantomData<(K, V)>,
}

impl<'s, K, V, const ORDER: usize> Iter<'s, K, V, ORDER>
where
    K: Pod,
    V: Pod,
{
    // `path` is the root-to-leaf walk, leaf included; `pos` the key
    // position within the leaf the search landed on.
    pub(crate) fn new(store: &'s BlobStore, mut path: Vec<u64>, pos: usize) -> Iter<'s, K, V, ORDER> {
        let leaf = match path.pop() {
            Some(leaf_index) => store.get::<LeafNode<ORDER>>(leaf_index as usize),
            None => None,
        };
        let mut iter = Iter { store, path, leaf, pos, _marker: marker::PhantomData };
        let past_end = match &iter.leaf {
            Some(leaf) => iter.pos >= leaf.base.num_keys(),
            None => false,
        };
        if past_end {
            iter.advance_leaf();
        }
        iter
    }

    /// Handle on the key at the current position.
    pub fn key(&self) -> Option<BlobRef<'s, K>> {
        let leaf = self.leaf.as_ref()?;
        self.store.get(leaf.base.keys[self.pos] as usize)
    }

    /// Handle on the value at the current position.
    pub fn value(&self) -> Option<BlobRef<'s, V>> {
        let leaf = self.leaf.as_ref()?;
        self.store.get(leaf.values[self.pos] as usize)
    }

    // move to the first key of the next leaf, or exhaust.
    fn advance_leaf(&mut self) {
        let leaf = match self.leaf.take() {
            Some(leaf) => leaf,
            None => return,
        };
        let mut current = leaf.index() as u64;
        // climb until `current` is not the rightmost child.
        let parent = loop {
            let parent_index = match self.path.last() {
                Some(parent_index) => *parent_index,
                None => return,
            };
            let parent = match self.store.get::<InternalNode<ORDER>>(parent_index as usize) {
                Some(parent) => parent,
                None => panic!("iterator lost node {}, call the programmer", parent_index),
            };
            if parent.children[parent.base.num_keys()] != current {
                break parent;
            }
            current = parent_index;
            self.path.pop();
        };

        // step to the sibling right of `current` and descend leftmost.
        let mut child_pos = 0;
        while child_pos < parent.base.num_keys() && parent.children[child_pos] != current {
            child_pos += 1;
        }
        let mut next = parent.children[child_pos + 1];
        drop(parent);
        loop {
            let node = match self.store.get::<BaseNode<ORDER>>(next as usize) {
                Some(node) => node,
                None => panic!("iterator lost node {}, call the programmer", next),
            };
            if node.is_leaf() {
                self.leaf = Some(node.to::<LeafNode<ORDER>>());
                self.pos = 0;
                return;
            }
            self.path.push(next);
            next = node.view::<InternalNode<ORDER>>().children[0];
        }
    }
}

impl<'s, K, V, const ORDER: usize> Iterator for Iter<'s, K, V, ORDER>
where
    K: Pod,
    V: Pod,
{
    type Item = (BlobRef<'s, K>, BlobRef<'s, V>);

    fn next(&mut self) -> Option<Self::Item> {
        let item = match (self.key(), self.value()) {
            (Some(key), Some(value)) => (key, value),
            _ => return None,
        };
        self.pos += 1;
        let exhausted = match &self.leaf {
            Some(leaf) => self.pos >= leaf.base.num_keys(),
            None => false,
        };
        if exhausted {
            self.advance_leaf();
        }
        Some(item)
    }
}
