/*
 * Created on Sun Mar 24 2024
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

//! The split SMO. A non-root split happens in three published steps, each
//! an optimistic CAS that any client can pick up where a previous one
//! stopped: (1) the upper half is materialised as a fresh sibling bound to
//! a fresh logical pointer, and a split delta announcing it is swung over
//! the splitting node; (2) `continue_split` installs the new separator in
//! the parent; (3) the split delta is consolidated away into a trimmed
//! image of the left half. A root split instead builds both halves plus a
//! new root image and swings the root pointer wholesale.

use {
    super::{
        last_smaller_equal,
        meta::{MapKey, MapValue, TreeConfig},
        node::{np_ref, BaseNode, InnerNode, NodePointer, SplitDelta, TreeNode},
        resolve::resolve_node,
        search::fix_stack,
        LogicalPtr, OpContext, PhysicalPtr, SearchBound,
    },
    crate::{
        error::{StoreError, StoreResult},
        store::{Backend, NodeTable, PointerTable},
        sync::atm::{Guard, Shared},
    },
    log::{debug, trace},
};

/// Split the node behind `nodep` (leaf or inner)
pub(crate) fn split<K: MapKey, V: MapValue, B: Backend, C: TreeConfig>(
    nodep: Shared<'_, NodePointer<K, V>>,
    cx: &mut OpContext<'_, K, V, B, C>,
    g: &Guard,
) -> StoreResult<()> {
    let np = np_ref(nodep);
    match &np.node {
        BaseNode::Leaf(l) => execute_split(np, l, cx, g),
        BaseNode::Inner(i) => execute_split(np, i, cx, g),
    }
}

fn execute_split<K, V, B, C, N>(
    nodep: &NodePointer<K, V>,
    to_split: &N,
    cx: &mut OpContext<'_, K, V, B, C>,
    g: &Guard,
) -> StoreResult<()>
where
    K: MapKey,
    V: MapValue,
    B: Backend,
    C: TreeConfig,
    N: TreeNode<K, V>,
{
    let nodes = cx.nodes();
    let ptrs = cx.ptrs();
    let at = to_split.node_len() / 2;
    debug_assert!(at >= 1);

    // materialise the right sibling and bind it to a fresh identity
    let mut right = to_split.carve_upper(at);
    let right_pptr = nodes.nt_alloc()?;
    right.set_base(right_pptr);
    nodes.nt_insert(right_pptr, right.wire_enc())?;
    let right_lptr = ptrs.pt_alloc()?;
    let right_version = ptrs.pt_insert(right_lptr, right_pptr)?;
    let right_low = right.node_low_key().clone();

    if nodep.is_root() {
        debug_assert!(
            *to_split.node_low_key() == K::null(),
            "root must cover the key space"
        );
        // lower half under a fresh identity
        let mut left = to_split.clone();
        left.truncate_upper(at);
        left.set_high_key(Some(right_low.clone()));
        left.set_right_link(right_lptr);
        left.clear_deltas();
        let left_pptr = nodes.nt_alloc()?;
        left.set_base(left_pptr);
        nodes.nt_insert(left_pptr, left.wire_enc())?;
        // new root referencing both halves
        let left_lptr = ptrs.pt_alloc()?;
        let new_root = InnerNode {
            entries: vec![(K::null(), left_lptr), (right_low, right_lptr)],
            low_key: K::null(),
            high_key: None,
            right_link: LogicalPtr::NIL,
            level: to_split.node_level() + 1,
        };
        let root_pptr = nodes.nt_alloc()?;
        nodes.nt_insert(root_pptr, new_root.enc())?;
        let left_version = ptrs.pt_insert(left_lptr, left_pptr)?;
        match ptrs.pt_update(LogicalPtr::ROOT, root_pptr, nodep.rc_version) {
            Ok(version) => {
                debug!(
                    "root split: level {} -> {}, right={right_lptr}",
                    to_split.node_level(),
                    new_root.level
                );
                let _ = cx.cache.add_entry(
                    NodePointer::new(
                        LogicalPtr::ROOT,
                        root_pptr,
                        version,
                        BaseNode::Inner(new_root),
                        cx.tx_id,
                    ),
                    g,
                );
                let _ = cx.cache.add_entry(
                    NodePointer::new(
                        right_lptr,
                        right_pptr,
                        right_version,
                        right.into_base(),
                        cx.tx_id,
                    ),
                    g,
                );
                let _ = cx.cache.add_entry(
                    NodePointer::new(
                        left_lptr,
                        left_pptr,
                        left_version,
                        left.into_base(),
                        cx.tx_id,
                    ),
                    g,
                );
                // the old root image is fully superseded
                for p in to_split.gc_blobs(nodep.ptr) {
                    nodes.nt_remove(p)?;
                }
                Ok(())
            }
            Err(StoreError::WrongVersion(current)) => {
                // a competing root split won: unwind everything speculative
                cx.cache.invalidate_if_older(LogicalPtr::ROOT, current, g);
                ptrs.pt_remove(right_lptr, right_version)?;
                nodes.nt_remove(right_pptr)?;
                ptrs.pt_remove(left_lptr, left_version)?;
                nodes.nt_remove(root_pptr)?;
                nodes.nt_remove(left_pptr)?;
                Ok(())
            }
            Err(StoreError::NotFound) => impossible!("root pointer missing"),
            Err(e) => Err(e),
        }
    } else {
        let delta = SplitDelta {
            next: nodep.ptr,
            new_right: right_lptr,
            right_key: right_low,
            level: right.node_level(),
        };
        let split_pptr = nodes.nt_alloc()?;
        nodes.nt_insert(split_pptr, delta.enc())?;
        match ptrs.pt_update(nodep.lptr, split_pptr, nodep.rc_version) {
            Ok(version) => {
                trace!("split: posted delta on {} -> {right_lptr}", nodep.lptr);
                continue_split(nodep.lptr, split_pptr, version, &delta, cx, g)
            }
            Err(e @ (StoreError::WrongVersion(_) | StoreError::NotFound)) => {
                match e {
                    StoreError::WrongVersion(current) => {
                        cx.cache.invalidate_if_older(nodep.lptr, current, g)
                    }
                    _ => cx.cache.invalidate(nodep.lptr, g),
                }
                ptrs.pt_remove(right_lptr, right_version)?;
                nodes.nt_remove(right_pptr)?;
                nodes.nt_remove(split_pptr)?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Install the separator announced by a split delta in the parent, then
/// consolidate the delta away. Safe to run any number of times by any
/// client: every step re-verifies against the pointer table.
pub(crate) fn continue_split<K, V, B, C>(
    split_lptr: LogicalPtr,
    split_pptr: PhysicalPtr,
    split_version: u64,
    delta: &SplitDelta<K>,
    cx: &mut OpContext<'_, K, V, B, C>,
    g: &Guard,
) -> StoreResult<()>
where
    K: MapKey,
    V: MapValue,
    B: Backend,
    C: TreeConfig,
{
    if cx.stack.len() > 1 {
        cx.stack.pop();
    }
    loop {
        let parent = fix_stack(&delta.right_key, cx, SearchBound::LastSmallerEqual, g)?;
        let pnp = np_ref(parent);
        let inner = match &pnp.node {
            BaseNode::Leaf(_) => {
                // the tree shrank past the old parent level; nothing to
                // install, just retire the delta
                return consolidate_split(split_lptr, split_pptr, split_version, delta, cx, g);
            }
            BaseNode::Inner(i) => i,
        };
        let Some(at) = last_smaller_equal(&inner.entries, &delta.right_key) else {
            // the covering range moved under a pending separator removal
            return Ok(());
        };
        if inner.entries[at].0 == delta.right_key {
            // separator already present (another helper got here first)
            return consolidate_split(split_lptr, split_pptr, split_version, delta, cx, g);
        }
        if inner.entries[at].1 != split_lptr {
            // not yet at the direct parent
            cx.stack.push(inner.entries[at].1);
            continue;
        }
        // re-verify that the split is still pending
        match cx.ptrs().pt_read(split_lptr) {
            Err(StoreError::NotFound) => return Ok(()),
            Ok((p, _)) if p != split_pptr => return Ok(()),
            Ok(_) => (),
            Err(e) => return Err(e),
        }
        if inner.enc_size() >= C::MAX_NODE_SIZE {
            // make room first
            split(parent, cx, g)?;
            continue;
        }
        let mut new_inner = inner.clone();
        new_inner
            .entries
            .insert(at + 1, (delta.right_key.clone(), delta.new_right));
        let pptr = cx.nodes().nt_alloc()?;
        cx.nodes().nt_insert(pptr, new_inner.enc())?;
        match cx.ptrs().pt_update(pnp.lptr, pptr, pnp.rc_version) {
            Ok(version) => {
                trace!("split: separator for {split_lptr} installed in {}", pnp.lptr);
                consolidate_split(split_lptr, split_pptr, split_version, delta, cx, g)?;
                cx.nodes().nt_remove(pnp.ptr)?;
                let _ = cx.cache.add_entry(
                    NodePointer::new(pnp.lptr, pptr, version, BaseNode::Inner(new_inner), cx.tx_id),
                    g,
                );
                return Ok(());
            }
            Err(StoreError::WrongVersion(_)) => {
                cx.nodes().nt_remove(pptr)?;
            }
            Err(StoreError::NotFound) => {
                cx.cache.invalidate(pnp.lptr, g);
                cx.nodes().nt_remove(pptr)?;
            }
            Err(e) => {
                let _ = cx.nodes().nt_remove(pptr);
                return Err(e);
            }
        }
    }
}

/// Replace `split_lptr`'s delta-topped image with a materialised lower
/// half, then collect the blobs the consolidated image supersedes
fn consolidate_split<K, V, B, C>(
    split_lptr: LogicalPtr,
    split_pptr: PhysicalPtr,
    split_version: u64,
    delta: &SplitDelta<K>,
    cx: &mut OpContext<'_, K, V, B, C>,
    g: &Guard,
) -> StoreResult<()>
where
    K: MapKey,
    V: MapValue,
    B: Backend,
    C: TreeConfig,
{
    // resolve the pre-split image below the delta
    let Some(base) = resolve_node(split_lptr, delta.next, split_version, None, cx, g)? else {
        return Ok(());
    };
    match base {
        BaseNode::Leaf(l) => consolidate_half(&l, split_lptr, split_pptr, split_version, delta, cx, g),
        BaseNode::Inner(i) => {
            consolidate_half(&i, split_lptr, split_pptr, split_version, delta, cx, g)
        }
    }
}

fn consolidate_half<K, V, B, C, N>(
    pre: &N,
    split_lptr: LogicalPtr,
    split_pptr: PhysicalPtr,
    split_version: u64,
    delta: &SplitDelta<K>,
    cx: &mut OpContext<'_, K, V, B, C>,
    g: &Guard,
) -> StoreResult<()>
where
    K: MapKey,
    V: MapValue,
    B: Backend,
    C: TreeConfig,
    N: TreeNode<K, V>,
{
    let mut trimmed = pre.clone();
    trimmed.truncate_upper(pre.node_len() / 2);
    trimmed.set_right_link(delta.new_right);
    trimmed.set_high_key(Some(delta.right_key.clone()));
    trimmed.clear_deltas();
    let pptr = cx.nodes().nt_alloc()?;
    trimmed.set_base(pptr);
    cx.nodes().nt_insert(pptr, trimmed.wire_enc())?;
    match cx.ptrs().pt_update(split_lptr, pptr, split_version) {
        Ok(version) => {
            let _ = cx.cache.add_entry(
                NodePointer::new(split_lptr, pptr, version, trimmed.into_base(), cx.tx_id),
                g,
            );
            cx.nodes().nt_remove(split_pptr)?;
            // the pre-split image (and, for leaves, its whole chain) is now
            // unreachable
            for p in pre.gc_blobs(delta.next) {
                cx.nodes().nt_remove(p)?;
            }
            Ok(())
        }
        Err(StoreError::WrongVersion(_) | StoreError::NotFound) => {
            cx.nodes().nt_remove(pptr)?;
            Ok(())
        }
        Err(e) => {
            let _ = cx.nodes().nt_remove(pptr);
            Err(e)
        }
    }
}
