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

//! Bidirectional iteration. An iterator pins a leaf image and an index
//! into it; crossing a node boundary follows the right link (forward) or
//! re-descends below the remembered low key (backward), tolerating nodes
//! whose bounds moved under concurrent splits and merges by scanning for
//! the remembered boundary key.

use {
    super::{
        leaf_of, merge,
        meta::{MapKey, MapValue, TreeConfig},
        node::{np_ref, BaseNode, NodePointer},
        search, OpContext,
    },
    crate::{
        error::{StoreError, StoreResult},
        store::{Backend, NodeTable, PointerTable},
        sync::{atm::Guard, atm::Shared, last_tx_id},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Outcome of [`BdIter::erase_if_unmodified`]
pub enum EraseResult {
    /// the element was removed and the iterator advanced past it
    Success,
    /// the leaf changed underneath the iterator (or carries a delta
    /// chain); nothing was written
    Failed,
    /// removing the element would underflow the leaf; a merge was started
    /// instead and nothing was removed
    Merged,
}

pub struct BdIter<'t, 'g, K, V, B: Backend, C> {
    cx: OpContext<'t, K, V, B, C>,
    g: &'g Guard,
    cur: Option<Shared<'g, NodePointer<K, V>>>,
    idx: usize,
}

impl<'t, 'g, K: MapKey, V: MapValue, B: Backend, C: TreeConfig> BdIter<'t, 'g, K, V, B, C> {
    /// Position at the first entry with key `>= key`, walking right as far
    /// as needed
    pub(crate) fn new(
        cx: OpContext<'t, K, V, B, C>,
        start: Shared<'g, NodePointer<K, V>>,
        key: &K,
        g: &'g Guard,
    ) -> StoreResult<Self> {
        let mut it = Self {
            cx,
            g,
            cur: Some(start),
            idx: 0,
        };
        loop {
            let cur = it.cur.unwrap();
            let lf = leaf_of(cur);
            let at = lf.lower_bound(key);
            if at < lf.entries.len() {
                it.idx = at;
                return Ok(it);
            }
            if lf.high_key.is_none() {
                it.cur = None;
                return Ok(it);
            }
            it.cur = Some(search::get_next(&mut it.cx, cur, g)?);
        }
    }
    /// The end sentinel
    pub(crate) fn end(cx: OpContext<'t, K, V, B, C>, g: &'g Guard) -> Self {
        Self {
            cx,
            g,
            cur: None,
            idx: 0,
        }
    }
    pub fn is_end(&self) -> bool {
        self.cur.is_none()
    }
    /// The entry under the iterator, unless this is the end sentinel
    pub fn entry(&self) -> Option<(&'g K, &'g V)> {
        let lf = leaf_of(self.cur?);
        let (k, v) = &lf.entries[self.idx];
        Some((k, v))
    }
    pub fn key(&self) -> Option<&'g K> {
        self.entry().map(|(k, _)| k)
    }
    fn set_end(&mut self) {
        self.cur = None;
    }
    /// Advance to the next entry in key order
    pub fn step(&mut self) -> StoreResult<()> {
        let Some(cur) = self.cur else { return Ok(()) };
        let lf = leaf_of(cur);
        self.idx += 1;
        if self.idx < lf.entries.len() {
            return Ok(());
        }
        let Some(hkey) = lf.high_key.clone() else {
            self.set_end();
            return Ok(());
        };
        let mut cur = search::get_next(&mut self.cx, cur, self.g)?;
        if leaf_of(cur).low_key == hkey {
            self.cur = Some(cur);
            self.idx = 0;
            return Ok(());
        }
        // the sibling chain shifted: scan ahead for the boundary
        loop {
            let lf = leaf_of(cur);
            let at = lf.lower_bound(&hkey);
            if at < lf.entries.len() {
                self.cur = Some(cur);
                self.idx = at;
                return Ok(());
            }
            if lf.high_key.is_none() {
                self.set_end();
                return Ok(());
            }
            cur = search::get_next(&mut self.cx, cur, self.g)?;
        }
    }
    /// Step to the previous entry. Returns `false` (and becomes the end
    /// sentinel) when stepping before the first entry of the tree
    pub fn step_back(&mut self) -> StoreResult<bool> {
        let Some(cur) = self.cur else { return Ok(false) };
        if self.idx > 0 {
            self.idx -= 1;
            return Ok(true);
        }
        let mut target = leaf_of(cur).low_key.clone();
        loop {
            if target == K::null() {
                self.set_end();
                return Ok(false);
            }
            let prev = search::get_previous(&mut self.cx, &target, self.g)?;
            self.cur = Some(prev);
            let lf = leaf_of(prev);
            if lf.entries.is_empty() {
                target = lf.low_key.clone();
                continue;
            }
            if lf.high_key.as_ref() == Some(&target) {
                self.idx = lf.entries.len() - 1;
                return Ok(true);
            }
            // bounds shifted: last entry strictly below the boundary
            let at = lf.entries.partition_point(|e| e.0 < target);
            if at > 0 {
                self.idx = at - 1;
                return Ok(true);
            }
            target = lf.low_key.clone();
        }
    }
    /// Remove the current entry iff the underlying leaf has not been
    /// rewritten since it was read, by swinging the leaf to an image with
    /// the entry removed on the observed version.
    ///
    /// Only fully consolidated leaves are supported: a leaf carrying a
    /// live delta chain yields `Failed` without writing anything (run with
    /// `CONSOLIDATE_AT = 0` if you rely on this operation).
    pub fn erase_if_unmodified(&mut self) -> StoreResult<EraseResult> {
        let Some(cur) = self.cur else {
            return Ok(EraseResult::Failed);
        };
        let np = np_ref(cur);
        let leaf = np.as_leaf();
        if !leaf.deltas.is_empty() {
            return Ok(EraseResult::Failed);
        }
        let root_leaf = leaf.low_key == K::null() && leaf.high_key.is_none();
        let at = self.idx;
        let mut nl = leaf.clone();
        nl.entries.remove(at);
        if nl.enc_size() < C::MIN_NODE_SIZE && !root_leaf {
            merge::merge(cur, &mut self.cx, self.g)?;
            return Ok(EraseResult::Merged);
        }
        let pptr = self.cx.nodes().nt_alloc()?;
        nl.base = pptr;
        self.cx.nodes().nt_insert(pptr, nl.enc())?;
        let tx = last_tx_id();
        match self.cx.ptrs().pt_update(np.lptr, pptr, np.rc_version) {
            Ok(version) => {
                self.cx.nodes().nt_remove(np.ptr)?;
                let fresh = NodePointer::new(np.lptr, pptr, version, BaseNode::Leaf(nl), tx);
                match self.cx.cache.add_entry(fresh, self.g) {
                    Some(sh) => {
                        let len = leaf_of(sh).entries.len();
                        self.cur = Some(sh);
                        if len == 0 {
                            self.set_end();
                        } else if at < len {
                            self.idx = at;
                        } else {
                            self.idx = len - 1;
                            self.step()?;
                        }
                    }
                    None => {
                        // a newer image beat the write-back; skip over the
                        // erased entry on the stale one
                        self.step()?;
                    }
                }
                Ok(EraseResult::Success)
            }
            Err(StoreError::WrongVersion(_) | StoreError::NotFound) => {
                self.cx.nodes().nt_remove(pptr)?;
                Ok(EraseResult::Failed)
            }
            Err(e) => {
                let _ = self.cx.nodes().nt_remove(pptr);
                Err(e)
            }
        }
    }
}

impl<'t, 'g, K: MapKey, V: MapValue, B: Backend, C: TreeConfig> Iterator
    for BdIter<'t, 'g, K, V, B, C>
{
    type Item = StoreResult<(&'g K, &'g V)>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.entry()?;
        match self.step() {
            Ok(()) => Some(Ok(entry)),
            Err(e) => {
                self.set_end();
                Some(Err(e))
            }
        }
    }
}

impl<'t, 'g, K: MapKey, V: MapValue, B: Backend, C: TreeConfig> PartialEq
    for BdIter<'t, 'g, K, V, B, C>
{
    fn eq(&self, other: &Self) -> bool {
        match (self.key(), other.key()) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}
