/*
 * Created on Sat Feb 10 2024
 *
 * This file is a part of the bdtree project
 * The bdtree project (herein referred to as "bdtree") is a free and
 * open-source implementation of a latch-free concurrent B-tree on top of
 * a shared versioned key/value store, written by Sayan Nandan ("the
 * Author") with the vision to provide scalable ordered indexing without
 * compromising on correctness under contention.
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

use {
    super::{range_covers, LogicalPtr, PhysicalPtr, SearchBound},
    crate::{
        sync::atm::{Shared, ORD_ACQ, ORD_ACR},
        tree::meta::{MapKey, MapValue},
    },
    core::sync::atomic::AtomicU64,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
/// The tag byte leading every serialised blob
pub enum NodeTag {
    Inner = 1,
    Leaf = 2,
    InsertDelta = 3,
    DeleteDelta = 4,
    SplitDelta = 5,
    RemoveDelta = 6,
    MergeDelta = 7,
}

#[derive(Debug, Clone)]
/// A materialised leaf. `base` and `deltas` are client-side bookkeeping
/// (the physical pointer of the delta-free image and the chain layered on
/// it, newest first); they are not part of the wire image.
pub struct LeafNode<K, V> {
    pub base: PhysicalPtr,
    pub deltas: Vec<PhysicalPtr>,
    pub entries: Vec<(K, V)>,
    pub low_key: K,
    pub high_key: Option<K>,
    pub right_link: LogicalPtr,
}

impl<K: MapKey, V> LeafNode<K, V> {
    pub fn empty(base: PhysicalPtr) -> Self {
        Self {
            base,
            deltas: Vec::new(),
            entries: Vec::new(),
            low_key: K::null(),
            high_key: None,
            right_link: LogicalPtr::NIL,
        }
    }
    pub fn covers(&self, key: &K, bound: SearchBound) -> bool {
        range_covers(&self.low_key, self.high_key.as_ref(), key, bound)
    }
    /// Index of the first entry with key `>= key`
    pub fn lower_bound(&self, key: &K) -> usize {
        self.entries.partition_point(|e| e.0 < *key)
    }
    pub fn contains(&self, key: &K) -> bool {
        self.entries.binary_search_by(|e| e.0.cmp(key)).is_ok()
    }
}

#[derive(Debug, Clone)]
/// A materialised inner node: sorted separators naming child identities.
/// The first separator always equals `low_key`.
pub struct InnerNode<K> {
    pub entries: Vec<(K, LogicalPtr)>,
    pub low_key: K,
    pub high_key: Option<K>,
    pub right_link: LogicalPtr,
    pub level: i8,
}

impl<K: MapKey> InnerNode<K> {
    pub fn covers(&self, key: &K, bound: SearchBound) -> bool {
        range_covers(&self.low_key, self.high_key.as_ref(), key, bound)
    }
}

#[derive(Debug, Clone)]
pub struct InsertDelta<K, V> {
    pub key: K,
    pub value: V,
    pub next: PhysicalPtr,
}

#[derive(Debug, Clone)]
pub struct DeleteDelta<K> {
    pub key: K,
    pub next: PhysicalPtr,
}

#[derive(Debug, Clone)]
/// Announces that keys `>= right_key` now live in the sibling `new_right`
pub struct SplitDelta<K> {
    pub next: PhysicalPtr,
    pub new_right: LogicalPtr,
    pub right_key: K,
    pub level: i8,
}

#[derive(Debug, Clone)]
/// Announces that this node is to be merged into its left sibling
pub struct RemoveDelta<K> {
    pub low_key: K,
    pub next: PhysicalPtr,
    pub level: i8,
}

#[derive(Debug, Clone)]
/// Placed on the left sibling: the right sibling's content (reachable via
/// `rm_next`) is logically appended to this node
pub struct MergeDelta<K> {
    pub next: PhysicalPtr,
    pub rmdelta: LogicalPtr,
    pub rmdelta_pptr: PhysicalPtr,
    pub rm_next: PhysicalPtr,
    pub right_low_key: K,
    pub level: i8,
}

#[derive(Debug, Clone)]
/// A decoded blob. Resolve is a single match over this
pub enum Block<K, V> {
    Leaf(LeafNode<K, V>),
    Inner(InnerNode<K>),
    Insert(InsertDelta<K, V>),
    Delete(DeleteDelta<K>),
    Split(SplitDelta<K>),
    Remove(RemoveDelta<K>),
    Merge(MergeDelta<K>),
}

#[derive(Debug, Clone)]
/// A fully resolved node: what a delta chain collapses into
pub enum BaseNode<K, V> {
    Leaf(LeafNode<K, V>),
    Inner(InnerNode<K>),
}

impl<K: MapKey, V> BaseNode<K, V> {
    pub fn is_leaf(&self) -> bool {
        matches!(self, Self::Leaf(_))
    }
    pub fn as_leaf(&self) -> &LeafNode<K, V> {
        extract!(self, Self::Leaf(l) => l)
    }
    pub fn as_inner(&self) -> &InnerNode<K> {
        extract!(self, Self::Inner(i) => i)
    }
    pub fn level(&self) -> i8 {
        match self {
            Self::Leaf(_) => 0,
            Self::Inner(i) => i.level,
        }
    }
    pub fn right_link(&self) -> LogicalPtr {
        match self {
            Self::Leaf(l) => l.right_link,
            Self::Inner(i) => i.right_link,
        }
    }
    pub fn covers(&self, key: &K, bound: SearchBound) -> bool {
        match self {
            Self::Leaf(l) => l.covers(key, bound),
            Self::Inner(i) => i.covers(key, bound),
        }
    }
}

/// A resolved node image bound to the pointer-table state it was read at.
/// These are the units the per-client cache stores and the guard-protected
/// references all tree operations work on.
pub struct NodePointer<K, V> {
    pub lptr: LogicalPtr,
    pub ptr: PhysicalPtr,
    pub rc_version: u64,
    last_tx: AtomicU64,
    pub node: BaseNode<K, V>,
}

impl<K: MapKey, V> NodePointer<K, V> {
    pub fn new(
        lptr: LogicalPtr,
        ptr: PhysicalPtr,
        rc_version: u64,
        node: BaseNode<K, V>,
        tx_id: u64,
    ) -> Self {
        Self {
            lptr,
            ptr,
            rc_version,
            last_tx: AtomicU64::new(tx_id),
            node,
        }
    }
    pub fn last_tx_id(&self) -> u64 {
        self.last_tx.load(ORD_ACQ)
    }
    /// Raise the freshness floor of this image
    pub fn observe_tx(&self, tx_id: u64) {
        self.last_tx.fetch_max(tx_id, ORD_ACR);
    }
    pub fn is_root(&self) -> bool {
        self.lptr.is_root()
    }
    pub fn as_leaf(&self) -> &LeafNode<K, V> {
        self.node.as_leaf()
    }
    pub fn as_inner(&self) -> &InnerNode<K> {
        self.node.as_inner()
    }
}

#[inline(always)]
pub(crate) fn np_ref<'g, K, V>(sh: Shared<'g, NodePointer<K, V>>) -> &'g NodePointer<K, V> {
    unsafe {
        // UNSAFE(@ohsayan): node images are only ever shared through cache
        // slots and every retired slot goes through defer_destroy, so the
        // pointee outlives the pinned guard
        sh.deref()
    }
}

/// The node-kind-generic surface the SMOs work against. Leaves and inner
/// nodes differ only in entry type and in the bookkeeping that needs to be
/// reset when a fresh image is materialised.
pub(crate) trait TreeNode<K: MapKey, V>: Clone {
    fn node_len(&self) -> usize;
    fn node_level(&self) -> i8;
    fn node_low_key(&self) -> &K;
    fn node_high_key(&self) -> Option<&K>;
    fn node_right_link(&self) -> LogicalPtr;
    fn set_high_key(&mut self, high: Option<K>);
    fn set_right_link(&mut self, link: LogicalPtr);
    fn set_base(&mut self, pptr: PhysicalPtr);
    fn clear_deltas(&mut self);
    /// Keep only the lower half `entries[..at]`
    fn truncate_upper(&mut self, at: usize);
    /// A fresh right sibling holding `entries[at..]`, inheriting this
    /// node's high key, right link and level
    fn carve_upper(&self, at: usize) -> Self;
    /// Append the entries of a right sibling (merge consolidation)
    fn absorb(&mut self, right: &Self);
    fn wire_size(&self) -> usize;
    fn wire_enc(&self) -> Vec<u8>;
    fn into_base(self) -> BaseNode<K, V>;
    /// The physical blobs this image is made of; `top` is the pointer the
    /// image was reached through (inner nodes are always a single blob)
    fn gc_blobs(&self, top: PhysicalPtr) -> Vec<PhysicalPtr>;
}

impl<K: MapKey, V: MapValue> TreeNode<K, V> for LeafNode<K, V> {
    fn node_len(&self) -> usize {
        self.entries.len()
    }
    fn node_level(&self) -> i8 {
        0
    }
    fn node_low_key(&self) -> &K {
        &self.low_key
    }
    fn node_high_key(&self) -> Option<&K> {
        self.high_key.as_ref()
    }
    fn node_right_link(&self) -> LogicalPtr {
        self.right_link
    }
    fn set_high_key(&mut self, high: Option<K>) {
        self.high_key = high;
    }
    fn set_right_link(&mut self, link: LogicalPtr) {
        self.right_link = link;
    }
    fn set_base(&mut self, pptr: PhysicalPtr) {
        self.base = pptr;
    }
    fn clear_deltas(&mut self) {
        self.deltas.clear();
    }
    fn truncate_upper(&mut self, at: usize) {
        self.entries.truncate(at);
    }
    fn carve_upper(&self, at: usize) -> Self {
        let entries: Vec<_> = self.entries[at..].to_vec();
        Self {
            base: PhysicalPtr::NIL,
            deltas: Vec::new(),
            low_key: entries[0].0.clone(),
            high_key: self.high_key.clone(),
            right_link: self.right_link,
            entries,
        }
    }
    fn absorb(&mut self, right: &Self) {
        self.entries.extend_from_slice(&right.entries);
    }
    fn wire_size(&self) -> usize {
        self.enc_size()
    }
    fn wire_enc(&self) -> Vec<u8> {
        self.enc()
    }
    fn into_base(self) -> BaseNode<K, V> {
        BaseNode::Leaf(self)
    }
    fn gc_blobs(&self, _top: PhysicalPtr) -> Vec<PhysicalPtr> {
        let mut v = Vec::with_capacity(self.deltas.len() + 1);
        v.push(self.base);
        v.extend_from_slice(&self.deltas);
        v
    }
}

impl<K: MapKey, V: MapValue> TreeNode<K, V> for InnerNode<K> {
    fn node_len(&self) -> usize {
        self.entries.len()
    }
    fn node_level(&self) -> i8 {
        self.level
    }
    fn node_low_key(&self) -> &K {
        &self.low_key
    }
    fn node_high_key(&self) -> Option<&K> {
        self.high_key.as_ref()
    }
    fn node_right_link(&self) -> LogicalPtr {
        self.right_link
    }
    fn set_high_key(&mut self, high: Option<K>) {
        self.high_key = high;
    }
    fn set_right_link(&mut self, link: LogicalPtr) {
        self.right_link = link;
    }
    fn set_base(&mut self, _pptr: PhysicalPtr) {}
    fn clear_deltas(&mut self) {}
    fn truncate_upper(&mut self, at: usize) {
        self.entries.truncate(at);
    }
    fn carve_upper(&self, at: usize) -> Self {
        let entries: Vec<_> = self.entries[at..].to_vec();
        Self {
            low_key: entries[0].0.clone(),
            high_key: self.high_key.clone(),
            right_link: self.right_link,
            level: self.level,
            entries,
        }
    }
    fn absorb(&mut self, right: &Self) {
        self.entries.extend_from_slice(&right.entries);
    }
    fn wire_size(&self) -> usize {
        self.enc_size()
    }
    fn wire_enc(&self) -> Vec<u8> {
        self.enc()
    }
    fn into_base(self) -> BaseNode<K, V> {
        BaseNode::Inner(self)
    }
    fn gc_blobs(&self, top: PhysicalPtr) -> Vec<PhysicalPtr> {
        vec![top]
    }
}
