//! Module `btree` implement a copy-on-write, multi-version B+tree
//! over the blob store.
//!
//! Nodes, keys and values are all blobs; a node refers to its keys,
//! values and children by blob index. Every mutation clones the path
//! from root to leaf into a new version and commits by swapping the
//! payload of the head blob, so readers always observe an atomic
//! snapshot and historical snapshots stay reachable through the head's
//! `previous` chain.

mod iter;
mod node;
mod tree;
mod txn;

pub use iter::Iter;
pub use node::{BaseNode, HeadNode, InternalNode, LeafNode};
pub use tree::{BPlusTree, TreeStats, HEAD_INDEX};
pub use txn::{Transaction, TxnStats};
