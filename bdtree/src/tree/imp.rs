/*
 * Created on Tue Apr 09 2024
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
    super::{
        iter::BdIter,
        meta::{DefConfig, MapKey, MapValue, TreeConfig},
        node::LeafNode,
        patch::{exec_leaf_patch, ErasePatch, InsertPatch},
        search::{self, CacheUse},
        LogicalPtr, OpContext, SearchBound,
    },
    crate::{
        cache::LogicalCache,
        error::{StoreError, StoreResult},
        store::{Backend, NodeTable, PointerTable},
        sync::atm::Guard,
    },
    log::debug,
    std::sync::Arc,
};

/// A client handle on the shared tree: one backend, one client cache, one
/// transaction id as the visibility floor. Handles are cheap; mint one per
/// logical operation batch with a fresh id from
/// [`crate::sync::next_tx_id`]. All methods pin their work with a caller
/// supplied [`Guard`] (see [`crate::sync::atm::cpin`]); entries yielded by
/// iterators borrow from that guard's scope.
pub struct BdMap<K, V, B: Backend, C: TreeConfig = DefConfig> {
    backend: Arc<B>,
    cache: Arc<LogicalCache<K, V, C>>,
    tx_id: u64,
}

impl<K: MapKey, V: MapValue, B: Backend, C: TreeConfig> BdMap<K, V, B, C> {
    /// Create the empty tree: a root leaf covering the whole key space.
    /// Idempotent; safe to race from many clients
    pub fn initialize(backend: &B) -> StoreResult<()> {
        let ptrs = backend.ptr_table();
        let nodes = backend.node_table();
        if ptrs.pt_read(LogicalPtr::ROOT).is_ok() {
            return Ok(());
        }
        let pptr = nodes.nt_alloc()?;
        let root: LeafNode<K, V> = LeafNode::empty(pptr);
        nodes.nt_insert(pptr, root.enc())?;
        match ptrs.pt_insert(LogicalPtr::ROOT, pptr) {
            Ok(_) => {
                debug!("tree initialised, root at {pptr}");
                Ok(())
            }
            Err(StoreError::Exists) => {
                // lost the init race; drop the speculative root image
                nodes.nt_remove(pptr)?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
    pub fn new(backend: Arc<B>, cache: Arc<LogicalCache<K, V, C>>, tx_id: u64) -> Self {
        Self {
            backend,
            cache,
            tx_id,
        }
    }
    pub fn tx_id(&self) -> u64 {
        self.tx_id
    }
    pub fn cache(&self) -> &LogicalCache<K, V, C> {
        &self.cache
    }
    fn context(&self) -> OpContext<'_, K, V, B, C> {
        OpContext::new(self.backend.as_ref(), self.cache.as_ref(), self.tx_id)
    }
    /// Insert `key -> value`. `Ok(false)` if the key is already present
    pub fn insert(&self, key: &K, value: &V, g: &Guard) -> StoreResult<bool> {
        let mut cx = self.context();
        exec_leaf_patch(&InsertPatch { key, value }, &mut cx, g)
    }
    /// Erase `key`. `Ok(false)` if the key is absent
    pub fn erase(&self, key: &K, g: &Guard) -> StoreResult<bool> {
        let mut cx = self.context();
        exec_leaf_patch::<K, V, B, C, _>(&ErasePatch { key }, &mut cx, g)
    }
    /// An iterator positioned at the first entry with key `>= key`
    /// (lower-bound semantics), or the end sentinel if there is none
    pub fn find<'t, 'g>(
        &'t self,
        key: &K,
        g: &'g Guard,
    ) -> StoreResult<BdIter<'t, 'g, K, V, B, C>> {
        let mut cx = self.context();
        cx.stack.push(LogicalPtr::ROOT);
        let np = search::lower_bound_node(
            key,
            &mut cx,
            SearchBound::LastSmallerEqual,
            CacheUse::Current,
            g,
        )?;
        BdIter::new(cx, np, key, g)
    }
    /// An iterator over the whole tree, from the least key
    pub fn begin<'t, 'g>(&'t self, g: &'g Guard) -> StoreResult<BdIter<'t, 'g, K, V, B, C>> {
        self.find(&K::null(), g)
    }
    /// The end sentinel
    pub fn end<'t, 'g>(&'t self, g: &'g Guard) -> BdIter<'t, 'g, K, V, B, C> {
        BdIter::end(self.context(), g)
    }
}
