/*
 * Created on Thu Mar 07 2024
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

//! The resolve engine: collapse a delta chain into a materialised node.
//!
//! Walking starts at the physical pointer the pointer table names and
//! follows `next` links. Data deltas are collected on the way down and
//! replayed (oldest first) once the materialised image at the end of the
//! chain is reached; the walked pointers are preserved (newest first) so a
//! later reader can recognise the chain suffix it already has. Meeting a
//! structural delta means an SMO is half done: the resolver helps it to
//! completion and reports "no image" so the caller re-reads the entry.

use {
    super::{
        merge, split,
        meta::{MapKey, MapValue, TreeConfig},
        node::{BaseNode, Block, LeafNode, NodePointer},
        LogicalPtr, OpContext, PhysicalPtr,
    },
    crate::{
        error::{StoreError, StoreResult},
        store::{Backend, NodeTable},
        sync::atm::Guard,
    },
    log::trace,
};

enum DataDelta<K, V> {
    Ins(K, V),
    Del(K),
}

/// Resolve the image of `lptr` whose chain starts at `start` and whose
/// pointer-table version was observed as `rc_version`. `prev` is the
/// client's previous image of the same logical pointer, used to
/// short-circuit re-walking a chain suffix. `Ok(None)` means the entry
/// moved under us (chain collected, or an SMO was helped): re-read.
pub(crate) fn resolve_node<K: MapKey, V: MapValue, B: Backend, C: TreeConfig>(
    lptr: LogicalPtr,
    start: PhysicalPtr,
    rc_version: u64,
    prev: Option<&NodePointer<K, V>>,
    cx: &mut OpContext<'_, K, V, B, C>,
    g: &Guard,
) -> StoreResult<Option<BaseNode<K, V>>> {
    let mut collected: Vec<(PhysicalPtr, DataDelta<K, V>)> = Vec::new();
    let mut pptr = start;
    let leaf = loop {
        // reuse the previous image if the rest of the chain is exactly it
        if let Some(p) = prev {
            if p.ptr == pptr {
                if let BaseNode::Leaf(l) = &p.node {
                    break l.clone();
                }
                if collected.is_empty() {
                    if let BaseNode::Inner(i) = &p.node {
                        return Ok(Some(BaseNode::Inner(i.clone())));
                    }
                }
            }
        }
        let buf = match cx.nodes().nt_read(pptr) {
            Ok(b) => b,
            // the chain was consolidated and collected under us
            Err(StoreError::NotFound) => return Ok(None),
            Err(e) => return Err(e),
        };
        match Block::dec(&buf, pptr) {
            Block::Leaf(l) => break l,
            Block::Inner(i) => {
                // chains never mix data deltas with inner nodes
                debug_assert!(collected.is_empty());
                return Ok(Some(BaseNode::Inner(i)));
            }
            Block::Insert(d) => {
                collected.push((pptr, DataDelta::Ins(d.key, d.value)));
                pptr = d.next;
            }
            Block::Delete(d) => {
                collected.push((pptr, DataDelta::Del(d.key)));
                pptr = d.next;
            }
            Block::Split(d) => {
                debug_assert!(collected.is_empty());
                trace!("resolve: helping split of {lptr}");
                let saved = cx.stack.clone();
                split::continue_split(lptr, pptr, rc_version, &d, cx, g)?;
                cx.stack = saved;
                return Ok(None);
            }
            Block::Remove(d) => {
                debug_assert!(collected.is_empty());
                trace!("resolve: helping merge (remove delta) of {lptr}");
                let saved = cx.stack.clone();
                merge::continue_merge_rm(lptr, pptr, rc_version, &d, cx, g)?;
                cx.stack = saved;
                return Ok(None);
            }
            Block::Merge(d) => {
                debug_assert!(collected.is_empty());
                trace!("resolve: helping merge (merge delta) of {lptr}");
                let saved = cx.stack.clone();
                merge::continue_merge_md(lptr, pptr, rc_version, &d, cx, g)?;
                cx.stack = saved;
                return Ok(None);
            }
        }
    };
    Ok(Some(BaseNode::Leaf(replay(leaf, collected))))
}

/// Replay collected deltas (oldest first) onto the materialised image and
/// prepend the walked pointers to the image's chain bookkeeping
fn replay<K: MapKey, V: MapValue>(
    mut leaf: LeafNode<K, V>,
    collected: Vec<(PhysicalPtr, DataDelta<K, V>)>,
) -> LeafNode<K, V> {
    let old_deltas = core::mem::take(&mut leaf.deltas);
    leaf.deltas = collected.iter().map(|(p, _)| *p).collect();
    leaf.deltas.extend_from_slice(&old_deltas);
    for (_, delta) in collected.into_iter().rev() {
        match delta {
            DataDelta::Ins(k, v) => {
                let at = leaf.lower_bound(&k);
                debug_assert!(
                    at == leaf.entries.len() || leaf.entries[at].0 != k,
                    "insert delta for a present key"
                );
                leaf.entries.insert(at, (k, v));
            }
            DataDelta::Del(k) => {
                let at = leaf.lower_bound(&k);
                debug_assert!(
                    at < leaf.entries.len() && leaf.entries[at].0 == k,
                    "delete delta for a missing key"
                );
                leaf.entries.remove(at);
            }
        }
    }
    leaf
}
