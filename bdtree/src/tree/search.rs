/*
 * Created on Mon Mar 11 2024
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

//! Root-to-leaf descent with stack repair. The descent stack records the
//! logical pointers of the path taken; whenever a cached node turns out
//! not to cover the search key anymore (a concurrent split or merge moved
//! the boundaries), the stack is popped and re-read uncached until the top
//! covers the key again. The root covers every key, so repair always
//! terminates with a non-empty stack.

use {
    super::{
        last_smaller, last_smaller_equal, leaf_of,
        meta::{MapKey, MapValue, TreeConfig},
        node::{np_ref, BaseNode, NodePointer},
        OpContext, SearchBound,
    },
    crate::{
        error::StoreResult,
        store::Backend,
        sync::atm::{Guard, Shared},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Whether a leaf may be served from the client's current cached view or
/// must be re-read from the tables
pub(crate) enum CacheUse {
    None,
    Current,
}

/// Pop and re-read (uncached) until the top of the stack covers `key`
pub(crate) fn fix_stack<'g, K: MapKey, V: MapValue, B: Backend, C: TreeConfig>(
    key: &K,
    cx: &mut OpContext<'_, K, V, B, C>,
    bound: SearchBound,
    g: &'g Guard,
) -> StoreResult<Shared<'g, NodePointer<K, V>>> {
    loop {
        let lptr = *cx.stack.last().expect("descent stack drained");
        match cx.get_without_cache(lptr, g)? {
            None => {
                cx.stack.pop();
                debug_assert!(!cx.stack.is_empty());
            }
            Some(np) => {
                if np_ref(np).node.covers(key, bound) {
                    return Ok(np);
                }
                cx.stack.pop();
                debug_assert!(!cx.stack.is_empty());
            }
        }
    }
}

/// Fetch the node on top of the stack: inner nodes may come from any
/// cached image, leaves honour the requested cache policy
fn read_top<'g, K: MapKey, V: MapValue, B: Backend, C: TreeConfig>(
    cx: &mut OpContext<'_, K, V, B, C>,
    use_cache: CacheUse,
    g: &'g Guard,
) -> StoreResult<Option<Shared<'g, NodePointer<K, V>>>> {
    let lptr = *cx.stack.last().expect("descent stack drained");
    let Some(np) = cx.get_from_cache(lptr, g)? else {
        return Ok(None);
    };
    if np_ref(np).node.is_leaf() {
        return match use_cache {
            CacheUse::Current => cx.get_current_from_cache(lptr, g),
            CacheUse::None => cx.get_without_cache(lptr, g),
        };
    }
    Ok(Some(np))
}

/// Descend from the top of the stack to the leaf covering `key`
pub(crate) fn lower_bound_node<'g, K: MapKey, V: MapValue, B: Backend, C: TreeConfig>(
    key: &K,
    cx: &mut OpContext<'_, K, V, B, C>,
    bound: SearchBound,
    use_cache: CacheUse,
    g: &'g Guard,
) -> StoreResult<Shared<'g, NodePointer<K, V>>> {
    debug_assert!(!cx.stack.is_empty());
    let mut np = match read_top(cx, use_cache, g)? {
        Some(np) => np,
        None => fix_stack(key, cx, bound, g)?,
    };
    loop {
        match &np_ref(np).node {
            BaseNode::Inner(inner) => {
                if !inner.covers(key, bound) {
                    np = fix_stack(key, cx, bound, g)?;
                    continue;
                }
                let at = match bound {
                    SearchBound::LastSmallerEqual => last_smaller_equal(&inner.entries, key),
                    SearchBound::LastSmaller => last_smaller(&inner.entries, key),
                };
                let Some(at) = at else {
                    // a pending low-separator removal moved the range; repair
                    np = fix_stack(key, cx, bound, g)?;
                    continue;
                };
                cx.stack.push(inner.entries[at].1);
                np = match read_top(cx, use_cache, g)? {
                    Some(np) => np,
                    None => {
                        cx.stack.pop();
                        fix_stack(key, cx, bound, g)?
                    }
                };
            }
            BaseNode::Leaf(leaf) => {
                if leaf.covers(key, bound) {
                    return Ok(np);
                }
                np = fix_stack(key, cx, bound, g)?;
            }
        }
    }
}

/// The next leaf in key order after `current`. The caller must have seen a
/// `high_key` on `current`. Intermediate nodes whose bounds have shifted
/// under concurrent SMOs are tolerated: worst case we re-descend to the
/// remembered boundary.
pub(crate) fn get_next<'g, K: MapKey, V: MapValue, B: Backend, C: TreeConfig>(
    cx: &mut OpContext<'_, K, V, B, C>,
    mut current: Shared<'g, NodePointer<K, V>>,
    g: &'g Guard,
) -> StoreResult<Shared<'g, NodePointer<K, V>>> {
    debug_assert!(leaf_of(current).high_key.is_some());
    loop {
        // 1. try the right link
        let right = leaf_of(current).right_link;
        if let Some(np) = cx.get_current_from_cache(right, g)? {
            debug_assert_eq!(np_ref(np).lptr, right);
            return Ok(np);
        }
        // 2. the right sibling is gone: re-read the current node, its
        // bounds may have absorbed the sibling
        let lptr = np_ref(current).lptr;
        match cx.get_without_cache(lptr, g)? {
            None => break,
            Some(np) => {
                let lnode = leaf_of(np);
                if lnode.high_key.is_none() {
                    return Ok(np);
                }
                let target = leaf_of(current).high_key.clone().unwrap();
                if lnode.covers(&target, SearchBound::LastSmallerEqual) {
                    return Ok(np);
                }
                current = np;
            }
        }
    }
    // 3. the current node itself is gone: descend to the boundary
    let target = leaf_of(current).high_key.clone().unwrap();
    if cx.stack.len() > 1 {
        cx.stack.pop();
    }
    lower_bound_node(&target, cx, SearchBound::LastSmallerEqual, CacheUse::Current, g)
}

/// The leaf serving keys just below `target` (backward iteration)
pub(crate) fn get_previous<'g, K: MapKey, V: MapValue, B: Backend, C: TreeConfig>(
    cx: &mut OpContext<'_, K, V, B, C>,
    target: &K,
    g: &'g Guard,
) -> StoreResult<Shared<'g, NodePointer<K, V>>> {
    debug_assert!(*target != K::null());
    if cx.stack.len() > 1 {
        cx.stack.pop();
    }
    lower_bound_node(target, cx, SearchBound::LastSmaller, CacheUse::Current, g)
}
