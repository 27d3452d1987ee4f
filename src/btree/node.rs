//! On-disk records making up the tree: head, internal and leaf nodes.

use bytemuck::{Pod, Zeroable};

use std::mem;

use crate::{
    chunk::INVALID_INDEX,
    err_at,
    store::BlobStore,
    Error, Result,
};

pub const TAG_HEAD: u64 = 0;
pub const TAG_INTERNAL: u64 = 1;
pub const TAG_LEAF: u64 = 2;

/// Common prefix of every tree node. `keys` stores blob indexes of the
/// stored keys; at most `ORDER - 1` slots are used, the spare trailing
/// slot always holds [INVALID_INDEX].
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct BaseNode<const ORDER: usize> {
    /// Node kind, one of the TAG_* values.
    pub tag: u64,
    /// Version of the transaction that created this node.
    pub version: u64,
    /// Number of keys in the node.
    pub n: u64,
    /// Blob indexes of the keys, ascending.
    pub keys: [u64; ORDER],
}

unsafe impl<const ORDER: usize> Zeroable for BaseNode<ORDER> {}
unsafe impl<const ORDER: usize> Pod for BaseNode<ORDER> {}

impl<const ORDER: usize> BaseNode<ORDER> {
    pub fn new(tag: u64, version: u64) -> BaseNode<ORDER> {
        BaseNode { tag, version, n: 0, keys: [INVALID_INDEX; ORDER] }
    }

    #[inline]
    pub fn is_head(&self) -> bool {
        self.tag == TAG_HEAD
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.tag == TAG_LEAF
    }

    #[inline]
    pub fn is_internal(&self) -> bool {
        self.tag == TAG_INTERNAL
    }

    /// Whether the node holds the maximum number of keys.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.n as usize == ORDER - 1
    }

    /// Whether the node holds the minimum number of keys, so that
    /// removing one would underflow it.
    #[inline]
    pub fn will_underflow(&self) -> bool {
        self.n as usize == (ORDER - 1) / 2
    }

    #[inline]
    pub fn num_keys(&self) -> usize {
        self.n as usize
    }
}

/// Internal node: `n` keys and `n + 1` children, children being blob
/// indexes of [BaseNode]-prefixed nodes.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct InternalNode<const ORDER: usize> {
    pub base: BaseNode<ORDER>,
    pub children: [u64; ORDER],
}

unsafe impl<const ORDER: usize> Zeroable for InternalNode<ORDER> {}
unsafe impl<const ORDER: usize> Pod for InternalNode<ORDER> {}

impl<const ORDER: usize> InternalNode<ORDER> {
    pub fn new(version: u64) -> InternalNode<ORDER> {
        InternalNode {
            base: BaseNode::new(TAG_INTERNAL, version),
            children: [INVALID_INDEX; ORDER],
        }
    }
}

/// Leaf node: `n` keys and `n` values. Like `keys`, the `values` array
/// keeps a spare trailing slot.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct LeafNode<const ORDER: usize> {
    pub base: BaseNode<ORDER>,
    pub values: [u64; ORDER],
}

unsafe impl<const ORDER: usize> Zeroable for LeafNode<ORDER> {}
unsafe impl<const ORDER: usize> Pod for LeafNode<ORDER> {}

impl<const ORDER: usize> LeafNode<ORDER> {
    pub fn new(version: u64) -> LeafNode<ORDER> {
        LeafNode {
            base: BaseNode::new(TAG_LEAF, version),
            values: [INVALID_INDEX; ORDER],
        }
    }
}

/// Head record. Blob index 1 is the distinguished head of the store;
/// its `previous` chain enumerates earlier snapshots.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct HeadNode {
    pub tag: u64,
    /// Version of the snapshot this head publishes.
    pub version: u64,
    /// Blob index of the snapshot's root node.
    pub root_index: u64,
    /// Blob index of the previous head record.
    pub previous: u64,
}

unsafe impl Zeroable for HeadNode {}
unsafe impl Pod for HeadNode {}

impl HeadNode {
    pub fn new(version: u64) -> HeadNode {
        HeadNode {
            tag: TAG_HEAD,
            version,
            root_index: INVALID_INDEX,
            previous: INVALID_INDEX,
        }
    }

    #[inline]
    pub fn is_head(&self) -> bool {
        self.tag == TAG_HEAD
    }
}

/// Lower-bound search of `key` among a node's keys. Every comparison
/// loads the key blob through `store`. Returns the position of the
/// first key at or above `key`, and whether it is an exact match.
pub(crate) fn search_key<K, const ORDER: usize>(
    store: &BlobStore,
    node: &BaseNode<ORDER>,
    key: &K,
) -> Result<(usize, bool)>
where
    K: Pod + Ord,
{
    let n = node.num_keys();
    debug_assert!(n < ORDER);

    let (mut lo, mut hi) = (0, n);
    while lo < hi {
        let mid = (lo + hi) / 2;
        let mid_key = load_key::<K>(store, node.keys[mid])?;
        if mid_key < *key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    let eq = lo < n && load_key::<K>(store, node.keys[lo])? == *key;
    Ok((lo, eq))
}

pub(crate) fn load_key<K: Pod>(store: &BlobStore, index: u64) -> Result<K> {
    match store.get::<K>(index as usize) {
        Some(guard) => Ok(*guard),
        None => err_at!(Fatal, msg: "missing key blob {}", index),
    }
}

// Compile-time layout expectations for the persisted records.
const _: () = {
    assert!(mem::size_of::<HeadNode>() == 32);
    assert!(mem::size_of::<BaseNode<4>>() == 24 + 4 * 8);
    assert!(mem::size_of::<InternalNode<4>>() == mem::size_of::<LeafNode<4>>());
};

#[cfg(test)]
#[path = "node_test.rs"]
mod node_test;
