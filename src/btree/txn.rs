//! Optimistic transactions over the tree.

use bytemuck::Pod;

use std::collections::HashSet;

use crate::{
    btree::{node::HeadNode, BPlusTree, HEAD_INDEX},
    err_at,
    store::{BlobMut, BlobRef, BlobStore},
    Error, Result,
};

/// A transaction captures the head at begin time, builds a private
/// copy-on-write version of the tree, and publishes it with a single
/// compare-and-swap on the head blob's payload offset.
///
/// Holding `old_head` pins the begin-time snapshot: its payload is
/// never mutated in place, so reads through the transaction stay
/// consistent no matter what commits concurrently.
///
/// A transaction that is dropped without [commit][Transaction::commit]
/// aborts, freeing every blob it created.
pub struct Transaction<'a, K: Pod + Ord, V: Pod, const ORDER: usize> {
    pub(crate) tree: &'a BPlusTree<K, V, ORDER>,
    pub(crate) old_head: BlobRef<'a, HeadNode>,
    pub(crate) new_head: BlobMut<'a, HeadNode>,
    // blob indexes created by this transaction; freed unless we commit.
    pub(crate) new_objects: HashSet<u64>,
    // blob indexes whose clone superseded them within this transaction.
    pub(crate) discarded: HashSet<u64>,
    done: bool,
}

impl<'a, K, V, const ORDER: usize> Transaction<'a, K, V, ORDER>
where
    K: Pod + Ord,
    V: Pod,
{
    pub(crate) fn begin(tree: &'a BPlusTree<K, V, ORDER>) -> Result<Transaction<'a, K, V, ORDER>> {
        let store = tree.store();
        let old_head: BlobRef<HeadNode> = match store.get(HEAD_INDEX) {
            Some(head) => head,
            None => return err_at!(Fatal, msg: "tree head missing"),
        };
        let mut new_head = old_head.clone_new()?;
        new_head.version = old_head.version + 1;
        // after a successful commit the clone's slot carries the old
        // head payload, which is exactly what `previous` must name.
        new_head.previous = new_head.index() as u64;

        let mut new_objects = HashSet::new();
        new_objects.insert(new_head.index() as u64);

        Ok(Transaction {
            tree,
            old_head,
            new_head,
            new_objects,
            discarded: HashSet::new(),
            done: false,
        })
    }

    /// Version this transaction will publish.
    #[inline]
    pub fn version(&self) -> u64 {
        self.new_head.version
    }

    /// Try to publish this transaction's version. Returns false when
    /// another transaction committed first; in that case every blob
    /// this transaction created has been freed and the store is as it
    /// was before [begin][BPlusTree::transaction].
    pub fn commit(mut self) -> Result<bool> {
        self.done = true;
        if self.old_head.compare_and_swap(&self.new_head) {
            Ok(true)
        } else {
            self.rollback();
            Ok(false)
        }
    }

    /// Abandon the transaction, freeing every blob it created.
    pub fn abort(mut self) {
        self.done = true;
        self.rollback();
    }

    /// Counters over the transaction's object tracking.
    pub fn to_stats(&self) -> TxnStats {
        TxnStats {
            n_new: self.new_objects.len(),
            n_discarded: self.discarded.len(),
        }
    }

    pub(crate) fn store(&self) -> &'a BlobStore {
        self.tree.store()
    }

    pub(crate) fn set_root(&mut self, index: usize) {
        self.new_head.root_index = index as u64;
    }

    pub(crate) fn root_index(&self) -> usize {
        self.new_head.root_index as usize
    }

    pub(crate) fn is_new(&self, index: usize) -> bool {
        self.new_objects.contains(&(index as u64))
    }

    /// Store `value` as a new blob tracked by this transaction.
    pub(crate) fn insert_blob<T: Pod>(&mut self, value: T) -> Result<BlobMut<'a, T>> {
        let guard = self.store().insert(value)?;
        self.new_objects.insert(guard.index() as u64);
        Ok(guard)
    }

    /// The copy-on-write rule. A node created by this transaction is
    /// upgraded and mutated in place; any other node is cloned, the
    /// original recorded as discarded, and the clone adopted.
    pub(crate) fn mutable<T: Pod>(&mut self, node: BlobRef<'a, T>) -> Result<BlobMut<'a, T>> {
        if self.is_new(node.index()) {
            Ok(node.upgrade())
        } else {
            let clone = node.clone_new()?;
            self.discarded.insert(node.index() as u64);
            self.new_objects.insert(clone.index() as u64);
            Ok(clone)
        }
    }

    /// Record that a transaction-visible node is no longer part of the
    /// version being built.
    pub(crate) fn discard(&mut self, index: usize) {
        self.discarded.insert(index as u64);
    }

    fn rollback(&mut self) {
        let store = self.tree.store();
        for index in self.new_objects.drain() {
            store.remove(index as usize);
        }
    }
}

impl<'a, K, V, const ORDER: usize> Drop for Transaction<'a, K, V, ORDER>
where
    K: Pod + Ord,
    V: Pod,
{
    fn drop(&mut self) {
        if !self.done {
            self.rollback();
        }
    }
}

/// Object-tracking counters for a [Transaction].
#[derive(Clone, Copy, Debug)]
pub struct TxnStats {
    /// Number of blobs created by the transaction, the head clone
    /// included.
    pub n_new: usize,
    /// Number of blobs superseded or dropped while building the new
    /// version.
    pub n_discarded: usize,
}
