/*
 * Created on Mon Mar 18 2024
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

//! Leaf writes. A write is: descend, check the precondition, write either
//! a delta or a consolidated leaf as a fresh blob, then CAS the leaf's
//! pointer-table entry. Size triggers (split above `MAX_NODE_SIZE`, merge
//! below `MIN_NODE_SIZE`) fire before the CAS loop and restart the whole
//! descent once the SMO is done.

use {
    super::{
        merge,
        meta::{MapKey, MapValue, TreeConfig},
        node::{np_ref, BaseNode, DeleteDelta, InsertDelta, LeafNode, NodePointer},
        search::{self, CacheUse},
        split, LogicalPtr, OpContext, PhysicalPtr, SearchBound,
    },
    crate::{
        error::{StoreError, StoreResult},
        store::{Backend, NodeTable, PointerTable},
        sync::atm::Guard,
    },
    log::trace,
};

/// A single-key leaf mutation: precondition + blob construction
pub(crate) trait LeafPatch<K: MapKey, V: MapValue> {
    fn key(&self) -> &K;
    /// `true` if the operation cannot apply (insert: key present;
    /// erase: key absent)
    fn conflicts(&self, leaf: &LeafNode<K, V>) -> bool;
    /// Mutate the working image `ln` and produce the blob to write at
    /// `pptr`: the consolidated leaf itself, or a delta chained onto the
    /// current image at `cur_top`
    fn build(
        &self,
        ln: &mut LeafNode<K, V>,
        pptr: PhysicalPtr,
        cur_top: PhysicalPtr,
        consolidate: bool,
    ) -> Vec<u8>;
}

pub(crate) struct InsertPatch<'a, K, V> {
    pub key: &'a K,
    pub value: &'a V,
}

impl<'a, K: MapKey, V: MapValue> LeafPatch<K, V> for InsertPatch<'a, K, V> {
    fn key(&self) -> &K {
        self.key
    }
    fn conflicts(&self, leaf: &LeafNode<K, V>) -> bool {
        leaf.contains(self.key)
    }
    fn build(
        &self,
        ln: &mut LeafNode<K, V>,
        pptr: PhysicalPtr,
        cur_top: PhysicalPtr,
        consolidate: bool,
    ) -> Vec<u8> {
        let at = ln.lower_bound(self.key);
        ln.entries.insert(at, (self.key.clone(), self.value.clone()));
        if consolidate {
            ln.deltas.clear();
            ln.base = pptr;
            ln.enc()
        } else {
            ln.deltas.insert(0, pptr);
            InsertDelta {
                key: self.key.clone(),
                value: self.value.clone(),
                next: cur_top,
            }
            .enc()
        }
    }
}

pub(crate) struct ErasePatch<'a, K> {
    pub key: &'a K,
}

impl<'a, K: MapKey, V: MapValue> LeafPatch<K, V> for ErasePatch<'a, K> {
    fn key(&self) -> &K {
        self.key
    }
    fn conflicts(&self, leaf: &LeafNode<K, V>) -> bool {
        !leaf.contains(self.key)
    }
    fn build(
        &self,
        ln: &mut LeafNode<K, V>,
        pptr: PhysicalPtr,
        cur_top: PhysicalPtr,
        consolidate: bool,
    ) -> Vec<u8> {
        let at = ln.lower_bound(self.key);
        debug_assert!(ln.entries[at].0 == *self.key);
        ln.entries.remove(at);
        if consolidate {
            ln.deltas.clear();
            ln.base = pptr;
            ln.enc()
        } else {
            ln.deltas.insert(0, pptr);
            DeleteDelta {
                key: self.key.clone(),
                next: cur_top,
            }
            .enc()
        }
    }
}

/// Run one insert/erase to completion. `Ok(false)` is a precondition
/// conflict; version conflicts are retried after stack repair.
pub(crate) fn exec_leaf_patch<K, V, B, C, P>(
    patch: &P,
    cx: &mut OpContext<'_, K, V, B, C>,
    g: &Guard,
) -> StoreResult<bool>
where
    K: MapKey,
    V: MapValue,
    B: Backend,
    C: TreeConfig,
    P: LeafPatch<K, V>,
{
    let key = patch.key();
    'descend: loop {
        cx.stack.clear();
        cx.stack.push(LogicalPtr::ROOT);
        let mut leaf = search::lower_bound_node(
            key,
            cx,
            SearchBound::LastSmallerEqual,
            CacheUse::Current,
            g,
        )?;
        {
            let lf = np_ref(leaf).as_leaf();
            let size = lf.enc_size();
            if size >= C::MAX_NODE_SIZE {
                split::split(leaf, cx, g)?;
                continue 'descend;
            }
            let root_leaf = lf.low_key == K::null() && lf.high_key.is_none();
            if size < C::MIN_NODE_SIZE && !root_leaf {
                merge::merge(leaf, cx, g)?;
                continue 'descend;
            }
        }
        loop {
            let np = np_ref(leaf);
            let lf = np.as_leaf();
            if patch.conflicts(lf) {
                return Ok(false);
            }
            let consolidate = lf.deltas.len() + 1 >= C::CONSOLIDATE_AT;
            let pptr = cx.nodes().nt_alloc()?;
            let mut ln = lf.clone();
            let data = patch.build(&mut ln, pptr, np.ptr, consolidate);
            cx.nodes().nt_insert(pptr, data)?;
            match cx.ptrs().pt_update(np.lptr, pptr, np.rc_version) {
                Ok(version) => {
                    let fresh =
                        NodePointer::new(np.lptr, pptr, version, BaseNode::Leaf(ln), cx.tx_id);
                    let _ = cx.cache.add_entry(fresh, g);
                    if consolidate {
                        trace!("leaf {}: consolidated chain of {}", np.lptr, lf.deltas.len());
                        for p in &lf.deltas {
                            cx.nodes().nt_remove(*p)?;
                        }
                        cx.nodes().nt_remove(lf.base)?;
                    }
                    return Ok(true);
                }
                Err(StoreError::WrongVersion(_)) => {
                    cx.nodes().nt_remove(pptr)?;
                }
                Err(StoreError::NotFound) => {
                    cx.cache.invalidate(np.lptr, g);
                    cx.nodes().nt_remove(pptr)?;
                }
                Err(e) => {
                    let _ = cx.nodes().nt_remove(pptr);
                    return Err(e);
                }
            }
            leaf = search::lower_bound_node(
                key,
                cx,
                SearchBound::LastSmallerEqual,
                CacheUse::None,
                g,
            )?;
        }
    }
}
