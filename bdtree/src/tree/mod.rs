/*
 * Created on Mon Feb 19 2024
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

pub mod codec;
pub mod imp;
pub mod iter;
pub mod meta;
pub mod node;
pub(crate) mod merge;
pub(crate) mod patch;
pub(crate) mod resolve;
pub(crate) mod search;
pub(crate) mod split;
#[cfg(test)]
mod tests;

use {
    self::{
        meta::{MapKey, MapValue, TreeConfig},
        node::{np_ref, NodePointer},
    },
    crate::{
        cache::LogicalCache,
        error::StoreResult,
        store::Backend,
        sync::atm::{Guard, Shared},
    },
    core::fmt,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
/// The stable identity of a tree node, valid across physical rewrites.
/// Allocated monotonically by the pointer table and never reused.
pub struct LogicalPtr(pub u64);

impl LogicalPtr {
    /// The root of the tree. Reserved: the pointer table never allocates it
    pub const ROOT: Self = Self(1);
    /// The "no sibling" sentinel used by `right_link`
    pub const NIL: Self = Self(0);
    pub const fn is_root(self) -> bool {
        self.0 == Self::ROOT.0
    }
    pub const fn is_nil(self) -> bool {
        self.0 == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
/// The identity of an immutable blob in the node table. Allocated
/// monotonically, never rewritten, only inserted and removed.
pub struct PhysicalPtr(pub u64);

impl PhysicalPtr {
    /// Placeholder for "not yet materialised"
    pub const NIL: Self = Self(0);
}

impl fmt::Display for LogicalPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

impl fmt::Display for PhysicalPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How a descent chooses its target node relative to the search key
pub enum SearchBound {
    /// the node/entry with the largest key `<=` the search key (lookups)
    LastSmallerEqual,
    /// the node/entry with the largest key `<` the search key (used to
    /// locate left siblings during merges)
    LastSmaller,
}

/// Index of the last entry with key `<= key`, if any
pub(crate) fn last_smaller_equal<K: Ord, T>(arr: &[(K, T)], key: &K) -> Option<usize> {
    arr.partition_point(|e| e.0 <= *key).checked_sub(1)
}

/// Index of the last entry with key `< key`, if any
pub(crate) fn last_smaller<K: Ord, T>(arr: &[(K, T)], key: &K) -> Option<usize> {
    arr.partition_point(|e| e.0 < *key).checked_sub(1)
}

/// Does a node with bounds `[low, high)` serve `key` under the given bound?
pub(crate) fn range_covers<K: MapKey>(
    low: &K,
    high: Option<&K>,
    key: &K,
    bound: SearchBound,
) -> bool {
    match bound {
        SearchBound::LastSmaller => {
            let high_ok = high.map_or(true, |h| key <= h);
            (*low == K::null() || low < key) && high_ok
        }
        SearchBound::LastSmallerEqual => key >= low && high.map_or(true, |h| key < h),
    }
}

/// Everything one tree operation carries around: the two tables, the
/// client cache, the visibility floor and the descent stack used for
/// stack repair.
pub struct OpContext<'a, K, V, B: Backend, C> {
    pub backend: &'a B,
    pub cache: &'a LogicalCache<K, V, C>,
    pub tx_id: u64,
    pub stack: Vec<LogicalPtr>,
}

impl<'a, K: MapKey, V: MapValue, B: Backend, C: TreeConfig> OpContext<'a, K, V, B, C> {
    pub fn new(backend: &'a B, cache: &'a LogicalCache<K, V, C>, tx_id: u64) -> Self {
        Self {
            backend,
            cache,
            tx_id,
            stack: Vec::new(),
        }
    }
    #[inline(always)]
    pub fn ptrs(&self) -> &'a B::Ptrs {
        self.backend.ptr_table()
    }
    #[inline(always)]
    pub fn nodes(&self) -> &'a B::Nodes {
        self.backend.node_table()
    }
    /// Cached view with no visibility floor (any resolved image will do)
    pub fn get_from_cache<'g>(
        &mut self,
        lptr: LogicalPtr,
        g: &'g Guard,
    ) -> StoreResult<Option<Shared<'g, NodePointer<K, V>>>> {
        let cache = self.cache;
        cache.get_from_cache(lptr, self, g)
    }
    /// Cached view no older than this context's tx id
    pub fn get_current_from_cache<'g>(
        &mut self,
        lptr: LogicalPtr,
        g: &'g Guard,
    ) -> StoreResult<Option<Shared<'g, NodePointer<K, V>>>> {
        let cache = self.cache;
        cache.get_current_from_cache(lptr, self, g)
    }
    /// Re-read the pointer table and re-resolve, then write the result back
    pub fn get_without_cache<'g>(
        &mut self,
        lptr: LogicalPtr,
        g: &'g Guard,
    ) -> StoreResult<Option<Shared<'g, NodePointer<K, V>>>> {
        let cache = self.cache;
        cache.get_without_cache(lptr, self, g)
    }
}

/// Convenience: the resolved leaf behind a shared node image
#[inline(always)]
pub(crate) fn leaf_of<'g, K: MapKey, V>(
    sh: Shared<'g, NodePointer<K, V>>,
) -> &'g node::LeafNode<K, V> {
    np_ref(sh).as_leaf()
}
