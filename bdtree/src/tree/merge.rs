/*
 * Created on Tue Apr 02 2024
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

//! The merge SMO, in four published steps any client can continue: (1) a
//! remove delta over the shrinking node announces its retirement; (2) the
//! left sibling (found by a last-smaller descent on the announced low key)
//! gets a merge delta logically appending the right node's content;
//! (3) the separator naming the right node is removed from the parent —
//! recursing upward when the parent itself shrinks below the minimum, or
//! collapsing the tree when the parent is a two-child root; (4) both
//! halves are consolidated into one materialised node and every blob and
//! identity of the right half is retired. The leftmost node of a level
//! never merges leftward; it pulls its right sibling in instead.

use {
    super::{
        last_smaller_equal,
        meta::{MapKey, MapValue, TreeConfig},
        node::{np_ref, BaseNode, MergeDelta, NodePointer, RemoveDelta, TreeNode},
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

/// Merge the node behind `nodep` into a sibling
pub(crate) fn merge<K: MapKey, V: MapValue, B: Backend, C: TreeConfig>(
    nodep: Shared<'_, NodePointer<K, V>>,
    cx: &mut OpContext<'_, K, V, B, C>,
    g: &Guard,
) -> StoreResult<()> {
    let np = np_ref(nodep);
    let (low_is_null, right_link, low_key, level) = {
        let n = &np.node;
        match n {
            BaseNode::Leaf(l) => (
                l.low_key == K::null(),
                l.right_link,
                l.low_key.clone(),
                0i8,
            ),
            BaseNode::Inner(i) => (
                i.low_key == K::null(),
                i.right_link,
                i.low_key.clone(),
                i.level,
            ),
        }
    };
    if low_is_null {
        // leftmost at its level: merge the right sibling into us instead
        debug_assert!(!right_link.is_nil(), "root leaf cannot merge");
        let right = cx.get_without_cache(right_link, g)?;
        return match right {
            None => {
                // sibling already absorbed elsewhere; never serve this
                // image again
                cx.cache.invalidate_if_older(np.lptr, np.rc_version + 1, g);
                Ok(())
            }
            Some(r) => merge(r, cx, g),
        };
    }
    let rmdelta = RemoveDelta {
        low_key,
        next: np.ptr,
        level,
    };
    let rm_pptr = cx.nodes().nt_alloc()?;
    cx.nodes().nt_insert(rm_pptr, rmdelta.enc())?;
    match cx.ptrs().pt_update(np.lptr, rm_pptr, np.rc_version) {
        Ok(version) => {
            trace!("merge: posted remove delta on {}", np.lptr);
            continue_merge_rm(np.lptr, rm_pptr, version, &rmdelta, cx, g)
        }
        Err(StoreError::WrongVersion(current)) => {
            cx.cache.invalidate_if_older(np.lptr, current, g);
            cx.nodes().nt_remove(rm_pptr)?;
            Ok(())
        }
        Err(StoreError::NotFound) => {
            cx.cache.invalidate(np.lptr, g);
            cx.nodes().nt_remove(rm_pptr)?;
            Ok(())
        }
        Err(e) => {
            let _ = cx.nodes().nt_remove(rm_pptr);
            Err(e)
        }
    }
}

/// Walk left of `low_key` down to the node whose right link names `lptr`.
/// `None` means the sibling relation raced away at this level.
fn get_left_sibling<'g, K, V, B, C>(
    lptr: LogicalPtr,
    low_key: &K,
    level: i8,
    cx: &mut OpContext<'_, K, V, B, C>,
    g: &'g Guard,
) -> StoreResult<Option<Shared<'g, NodePointer<K, V>>>>
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
        let nodep = fix_stack(low_key, cx, SearchBound::LastSmaller, g)?;
        match &np_ref(nodep).node {
            BaseNode::Inner(inner) => {
                if inner.right_link == lptr {
                    return Ok(Some(nodep));
                }
                if inner.level == level {
                    return Ok(None);
                }
                let Some(at) = super::last_smaller(&inner.entries, low_key) else {
                    return Ok(None);
                };
                cx.stack.push(inner.entries[at].1);
            }
            BaseNode::Leaf(leaf) => {
                return Ok((leaf.right_link == lptr).then_some(nodep));
            }
        }
    }
}

/// Continue a merge from its remove delta: install the merge delta on the
/// left sibling
pub(crate) fn continue_merge_rm<K, V, B, C>(
    rm_lptr: LogicalPtr,
    rm_pptr: PhysicalPtr,
    _rm_version: u64,
    rmdelta: &RemoveDelta<K>,
    cx: &mut OpContext<'_, K, V, B, C>,
    g: &Guard,
) -> StoreResult<()>
where
    K: MapKey,
    V: MapValue,
    B: Backend,
    C: TreeConfig,
{
    let Some(mut left) = get_left_sibling(rm_lptr, &rmdelta.low_key, rmdelta.level, cx, g)?
    else {
        return Ok(());
    };
    let mut md = MergeDelta {
        next: PhysicalPtr::NIL,
        rmdelta: rm_lptr,
        rmdelta_pptr: rm_pptr,
        rm_next: rmdelta.next,
        right_low_key: rmdelta.low_key.clone(),
        level: rmdelta.level,
    };
    loop {
        let lnp = np_ref(left);
        md.next = lnp.ptr;
        let merge_pptr = cx.nodes().nt_alloc()?;
        cx.nodes().nt_insert(merge_pptr, md.enc())?;
        match cx.ptrs().pt_update(lnp.lptr, merge_pptr, lnp.rc_version) {
            Ok(version) => {
                trace!("merge: delta for {rm_lptr} installed on {}", lnp.lptr);
                return continue_merge_md(lnp.lptr, merge_pptr, version, &md, cx, g);
            }
            Err(e @ (StoreError::WrongVersion(_) | StoreError::NotFound)) => {
                cx.nodes().nt_remove(merge_pptr)?;
                if e == StoreError::NotFound {
                    cx.cache.invalidate(lnp.lptr, g);
                }
                left = fix_stack(&rmdelta.low_key, cx, SearchBound::LastSmaller, g)?;
                if np_ref(left).node.right_link() != rm_lptr {
                    // the sibling relation changed; leave the remove delta
                    // for whoever sees it next
                    return Ok(());
                }
            }
            Err(e) => {
                let _ = cx.nodes().nt_remove(merge_pptr);
                return Err(e);
            }
        }
    }
}

/// Continue a merge from its merge delta: remove the right node's
/// separator from the parent, then consolidate
pub(crate) fn continue_merge_md<K, V, B, C>(
    merge_lptr: LogicalPtr,
    merge_pptr: PhysicalPtr,
    merge_version: u64,
    md: &MergeDelta<K>,
    cx: &mut OpContext<'_, K, V, B, C>,
    g: &Guard,
) -> StoreResult<()>
where
    K: MapKey,
    V: MapValue,
    B: Backend,
    C: TreeConfig,
{
    if merge_lptr.is_root() {
        // already collapsed onto the root: only consolidation is left
        return consolidate_merge(merge_lptr, merge_pptr, merge_version, md, cx, g);
    }
    if cx.stack.len() > 1 {
        cx.stack.pop();
    }
    loop {
        let parent = fix_stack(&md.right_low_key, cx, SearchBound::LastSmallerEqual, g)?;
        let pnp = np_ref(parent);
        let inner = match &pnp.node {
            BaseNode::Leaf(_) => {
                return consolidate_merge(merge_lptr, merge_pptr, merge_version, md, cx, g);
            }
            BaseNode::Inner(i) => i,
        };
        let Some(at) = last_smaller_equal(&inner.entries, &md.right_low_key) else {
            debug_assert!(pnp.is_root());
            return Ok(());
        };
        if inner.entries[at].0 == md.right_low_key && inner.entries[at].1 == md.rmdelta {
            if inner.enc_size() < C::MIN_NODE_SIZE && !pnp.is_root() {
                // removing the separator would underflow the parent: merge
                // it first
                merge(parent, cx, g)?;
                continue;
            }
            if pnp.is_root() && inner.entries.len() == 2 {
                // two-child root losing one child: collapse the tree onto
                // the surviving (left) node
                match cx.ptrs().pt_update(LogicalPtr::ROOT, merge_pptr, pnp.rc_version) {
                    Ok(version) => {
                        debug!("merge: root collapse, level {} gone", inner.level);
                        cx.nodes().nt_remove(pnp.ptr)?;
                        // the left node's identity folds into the root
                        cx.cache.invalidate(merge_lptr, g);
                        match cx.ptrs().pt_remove(merge_lptr, merge_version) {
                            Ok(()) | Err(StoreError::WrongVersion(_) | StoreError::NotFound) => {}
                            Err(e) => return Err(e),
                        }
                        consolidate_merge(LogicalPtr::ROOT, merge_pptr, version, md, cx, g)?;
                        return Ok(());
                    }
                    Err(StoreError::WrongVersion(current)) => {
                        cx.cache.invalidate_if_older(LogicalPtr::ROOT, current, g);
                        continue;
                    }
                    Err(StoreError::NotFound) => impossible!("root pointer missing"),
                    Err(e) => return Err(e),
                }
            }
            let mut new_inner = inner.clone();
            new_inner.entries.remove(at);
            let pptr = cx.nodes().nt_alloc()?;
            cx.nodes().nt_insert(pptr, new_inner.enc())?;
            let res = if at != 0 {
                cx.ptrs().pt_update(pnp.lptr, pptr, pnp.rc_version)
            } else {
                // the parent's low separator went away: announce its own
                // retirement so the merge propagates one level up
                let prm = RemoveDelta {
                    low_key: new_inner.low_key.clone(),
                    next: pptr,
                    level: new_inner.level,
                };
                let prm_pptr = cx.nodes().nt_alloc()?;
                cx.nodes().nt_insert(prm_pptr, prm.enc())?;
                let r = cx.ptrs().pt_update(pnp.lptr, prm_pptr, pnp.rc_version);
                if r.is_err() {
                    cx.nodes().nt_remove(prm_pptr)?;
                }
                r
            };
            match res {
                Ok(_) => {
                    cx.nodes().nt_remove(pnp.ptr)?;
                    consolidate_merge(merge_lptr, merge_pptr, merge_version, md, cx, g)?;
                    return Ok(());
                }
                Err(StoreError::WrongVersion(current)) => {
                    cx.cache.invalidate_if_older(pnp.lptr, current, g);
                    cx.nodes().nt_remove(pptr)?;
                    continue;
                }
                Err(StoreError::NotFound) => {
                    cx.cache.invalidate(pnp.lptr, g);
                    cx.nodes().nt_remove(pptr)?;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        if inner.entries[at].1 == merge_lptr {
            // the separator is already gone (another helper won)
            return Ok(());
        }
        cx.stack.push(inner.entries[at].1);
    }
}

/// Step 4: materialise left ++ right, retire the right half entirely
fn consolidate_merge<K, V, B, C>(
    merge_lptr: LogicalPtr,
    merge_pptr: PhysicalPtr,
    merge_version: u64,
    md: &MergeDelta<K>,
    cx: &mut OpContext<'_, K, V, B, C>,
    g: &Guard,
) -> StoreResult<()>
where
    K: MapKey,
    V: MapValue,
    B: Backend,
    C: TreeConfig,
{
    let Some(left) = resolve_node(merge_lptr, md.next, merge_version, None, cx, g)? else {
        return Ok(());
    };
    let Some(right) = resolve_node(md.rmdelta, md.rm_next, merge_version, None, cx, g)? else {
        return Ok(());
    };
    match (left, right) {
        (BaseNode::Leaf(l), BaseNode::Leaf(r)) => {
            consolidate_halves(&l, &r, merge_lptr, merge_pptr, merge_version, md, cx, g)
        }
        (BaseNode::Inner(l), BaseNode::Inner(r)) => {
            consolidate_halves(&l, &r, merge_lptr, merge_pptr, merge_version, md, cx, g)
        }
        _ => impossible!("merging nodes of different kinds"),
    }
}

fn consolidate_halves<K, V, B, C, N>(
    left: &N,
    right: &N,
    merge_lptr: LogicalPtr,
    merge_pptr: PhysicalPtr,
    merge_version: u64,
    md: &MergeDelta<K>,
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
    let mut joined = left.clone();
    joined.absorb(right);
    joined.set_right_link(right.node_right_link());
    joined.set_high_key(right.node_high_key().cloned());
    joined.clear_deltas();
    let pptr = cx.nodes().nt_alloc()?;
    joined.set_base(pptr);
    cx.nodes().nt_insert(pptr, joined.wire_enc())?;
    match cx.ptrs().pt_update(merge_lptr, pptr, merge_version) {
        Ok(version) => {
            debug!("merge: consolidated {} <- {}", merge_lptr, md.rmdelta);
            let _ = cx.cache.add_entry(
                NodePointer::new(merge_lptr, pptr, version, joined.into_base(), cx.tx_id),
                g,
            );
            cx.cache.invalidate(md.rmdelta, g);
            // retire the right node's identity with its observed version
            match cx.ptrs().pt_read(md.rmdelta) {
                Ok((p, ver)) if p == md.rmdelta_pptr => {
                    match cx.ptrs().pt_remove(md.rmdelta, ver) {
                        Ok(()) | Err(StoreError::WrongVersion(_) | StoreError::NotFound) => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(_) | Err(StoreError::NotFound) => {}
                Err(e) => return Err(e),
            }
            cx.nodes().nt_remove(merge_pptr)?;
            cx.nodes().nt_remove(md.rmdelta_pptr)?;
            for p in left.gc_blobs(md.next) {
                cx.nodes().nt_remove(p)?;
            }
            for p in right.gc_blobs(md.rm_next) {
                cx.nodes().nt_remove(p)?;
            }
            Ok(())
        }
        Err(StoreError::WrongVersion(_)) => {
            cx.nodes().nt_remove(pptr)?;
            Ok(())
        }
        Err(StoreError::NotFound) => {
            cx.cache.invalidate(merge_lptr, g);
            cx.nodes().nt_remove(pptr)?;
            Ok(())
        }
        Err(e) => {
            let _ = cx.nodes().nt_remove(pptr);
            Err(e)
        }
    }
}
