/*
 * Created on Tue Apr 16 2024
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
        imp::BdMap,
        iter::EraseResult,
        last_smaller, last_smaller_equal,
        meta::TreeConfig,
        node::{np_ref, BaseNode, Block, NodePointer, SplitDelta, TreeNode},
        range_covers,
        search::{self, CacheUse},
        LogicalPtr, OpContext, PhysicalPtr, SearchBound,
    },
    crate::{
        cache::LogicalCache,
        store::{mem::MemBackend, Backend, NodeTable, PointerTable},
        sync::{atm::cpin, got_tx_id, last_tx_id, next_tx_id},
        tree::node::LeafNode,
    },
    std::{
        collections::BTreeSet,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
        thread,
    },
};

/// Forces frequent splits/merges and delta chains at test scale
struct SmallCfg;
impl TreeConfig for SmallCfg {
    const MAX_NODE_SIZE: usize = 256;
    const MIN_NODE_SIZE: usize = 64;
    const CONSOLIDATE_AT: usize = 4;
    const CACHE_BUCKETS: usize = 64;
    const CACHE_WAYS: usize = 3;
}

/// Root-leaf splits at 4 keys; no delta chains (every write consolidates)
struct TinyCfg;
impl TreeConfig for TinyCfg {
    const MAX_NODE_SIZE: usize = 80;
    const MIN_NODE_SIZE: usize = 50;
    const CONSOLIDATE_AT: usize = 0;
    const CACHE_BUCKETS: usize = 16;
    const CACHE_WAYS: usize = 3;
}

type Map<C> = BdMap<u64, u64, MemBackend, C>;
type Cache<C> = LogicalCache<u64, u64, C>;

fn harness<C: TreeConfig>() -> (Arc<MemBackend>, Arc<Cache<C>>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let be = Arc::new(MemBackend::new());
    Map::<C>::initialize(&be).unwrap();
    (be, Arc::new(LogicalCache::new()))
}

fn client<C: TreeConfig>(be: &Arc<MemBackend>, cache: &Arc<Cache<C>>) -> Map<C> {
    BdMap::new(be.clone(), cache.clone(), next_tx_id())
}

fn collect_keys<C: TreeConfig>(map: &Map<C>) -> Vec<u64> {
    let g = cpin();
    map.begin(&g)
        .unwrap()
        .map(|r| *r.unwrap().0)
        .collect()
}

/// (low, high, entry count, lptr) for every leaf, leftmost first
fn leaf_chain<C: TreeConfig>(
    be: &Arc<MemBackend>,
    cache: &Arc<Cache<C>>,
) -> Vec<(u64, Option<u64>, usize, LogicalPtr)> {
    let g = cpin();
    let mut cx: OpContext<'_, u64, u64, MemBackend, C> =
        OpContext::new(be.as_ref(), cache.as_ref(), next_tx_id());
    cx.stack.push(LogicalPtr::ROOT);
    let mut np = search::lower_bound_node(
        &0,
        &mut cx,
        SearchBound::LastSmallerEqual,
        CacheUse::None,
        &g,
    )
    .unwrap();
    let mut out = Vec::new();
    loop {
        let n = np_ref(np);
        let lf = n.as_leaf();
        out.push((lf.low_key, lf.high_key, lf.entries.len(), n.lptr));
        if lf.right_link.is_nil() {
            return out;
        }
        np = cx.get_without_cache(lf.right_link, &g).unwrap().unwrap();
    }
}

/// Uniform height + correct level arithmetic on every descent path
fn check_levels<C: TreeConfig>(
    cx: &mut OpContext<'_, u64, u64, MemBackend, C>,
    lptr: LogicalPtr,
) -> i8 {
    let g = cpin();
    let np = cx.get_without_cache(lptr, &g).unwrap().unwrap();
    match &np_ref(np).node {
        BaseNode::Leaf(_) => 0,
        BaseNode::Inner(inner) => {
            let level = inner.level;
            let children: Vec<_> = inner.entries.iter().map(|e| e.1).collect();
            for child in children {
                assert_eq!(check_levels(cx, child), level - 1);
            }
            level
        }
    }
}

/// Every blob reachable from the pointer table plus delta links
fn reachable_blobs(be: &MemBackend) -> BTreeSet<u64> {
    let mut seen = BTreeSet::new();
    let mut work: Vec<PhysicalPtr> = be.ptr_entries().iter().map(|e| e.1).collect();
    while let Some(p) = work.pop() {
        if !seen.insert(p.0) {
            continue;
        }
        let Ok(buf) = be.node_table().nt_read(p) else {
            continue;
        };
        match Block::<u64, u64>::dec(&buf, p) {
            Block::Leaf(_) | Block::Inner(_) => {}
            Block::Insert(d) => work.push(d.next),
            Block::Delete(d) => work.push(d.next),
            Block::Split(d) => work.push(d.next),
            Block::Remove(d) => work.push(d.next),
            Block::Merge(d) => {
                work.push(d.next);
                work.push(d.rm_next);
                work.push(d.rmdelta_pptr);
            }
        }
    }
    seen
}

/// The full §8 battery for a quiescent tree
fn check_invariants<C: TreeConfig>(be: &Arc<MemBackend>, cache: &Arc<Cache<C>>) {
    // ordering across all leaves, no duplicates
    let map = client(be, cache);
    let keys = collect_keys(&map);
    assert!(keys.windows(2).all(|w| w[0] < w[1]), "keys out of order");
    // coverage + sibling consistency
    let chain = leaf_chain(be, cache);
    assert_eq!(chain[0].0, 0, "leftmost leaf must carry the null low key");
    assert!(chain.last().unwrap().1.is_none(), "rightmost leaf is capped");
    for w in chain.windows(2) {
        assert_eq!(w[0].1, Some(w[1].0), "high/low mismatch between siblings");
    }
    // height uniformity
    let mut cx: OpContext<'_, u64, u64, MemBackend, C> =
        OpContext::new(be.as_ref(), cache.as_ref(), next_tx_id());
    cx.stack.push(LogicalPtr::ROOT);
    check_levels(&mut cx, LogicalPtr::ROOT);
    // no orphan blobs, nothing dangling
    let reachable = reachable_blobs(be);
    let present: BTreeSet<u64> = be.blob_ptrs().iter().map(|p| p.0).collect();
    assert_eq!(reachable, present, "blob leak or dangling pointer");
}

#[test]
fn bound_helpers() {
    let arr: Vec<(u64, u64)> = vec![(10, 0), (20, 0), (30, 0)];
    multi_assert_eq!(
        last_smaller_equal(&arr, &10),
        last_smaller_equal(&arr, &15),
        last_smaller(&arr, &20) => Some(0)
    );
    assert_eq!(last_smaller_equal(&arr, &5), None);
    assert_eq!(last_smaller(&arr, &10), None);
    assert_eq!(last_smaller_equal(&arr, &99), Some(2));
    // [10, 30) serves 10..=29 for lookups
    assert!(range_covers(&10u64, Some(&30), &10, SearchBound::LastSmallerEqual));
    assert!(!range_covers(&10u64, Some(&30), &30, SearchBound::LastSmallerEqual));
    // left-sibling searches must admit the boundary itself
    assert!(range_covers(&0u64, Some(&30), &30, SearchBound::LastSmaller));
    assert!(!range_covers(&10u64, Some(&30), &10, SearchBound::LastSmaller));
}

#[test]
fn txid_monotonic() {
    let a = next_tx_id();
    let b = next_tx_id();
    assert!(b > a);
    got_tx_id(b + 100);
    assert!(last_tx_id() >= b + 100);
    // learning an old id never regresses the counter
    got_tx_id(a);
    assert!(last_tx_id() >= b + 100);
}

#[test]
fn cache_version_discipline() {
    let cache: Cache<SmallCfg> = LogicalCache::new();
    let g = cpin();
    let l = LogicalPtr(7);
    let np = |ver: u64| {
        NodePointer::<u64, u64>::new(
            l,
            PhysicalPtr(ver),
            ver,
            BaseNode::Leaf(LeafNode::empty(PhysicalPtr(ver))),
            1,
        )
    };
    assert!(cache.add_entry(np(1), &g).is_some());
    // newer image replaces
    let sh = cache.add_entry(np(3), &g).unwrap();
    assert_eq!(np_ref(sh).rc_version, 3);
    // stale write-back is discarded
    assert!(cache.add_entry(np(2), &g).is_none());
    // invalidate_if_older respects the floor
    cache.invalidate_if_older(l, 3, &g);
    assert!(cache.add_entry(np(2), &g).is_none());
    cache.invalidate_if_older(l, 4, &g);
    assert!(cache.add_entry(np(2), &g).is_some());
    cache.invalidate(l, &g);
    let (_, occupied) = cache.occupancy();
    assert_eq!(occupied, 0);
}

#[test]
fn single_leaf_ops() {
    let (be, cache) = harness::<SmallCfg>();
    let map = client(&be, &cache);
    let g = cpin();
    assert!(map.insert(&10, &100, &g).unwrap());
    assert!(map.insert(&20, &200, &g).unwrap());
    assert!(!map.insert(&10, &999, &g).unwrap(), "duplicate insert");
    assert!(map.erase(&10, &g).unwrap());
    assert!(!map.erase(&10, &g).unwrap(), "double erase");
    assert!(!map.erase(&99, &g).unwrap(), "erase of absent key");
    // lower-bound semantics of find
    assert_eq!(map.find(&15, &g).unwrap().key(), Some(&20));
    assert_eq!(map.find(&20, &g).unwrap().key(), Some(&20));
    assert!(map.find(&21, &g).unwrap().is_end());
    assert_eq!(collect_keys(&map), vec![20]);
}

#[test]
fn iterator_bidirectional() {
    let (be, cache) = harness::<SmallCfg>();
    let map = client(&be, &cache);
    let g = cpin();
    for k in 1..=100u64 {
        assert!(map.insert(&k, &(k * 2), &g).unwrap());
    }
    // forward across many leaves
    let got: Vec<(u64, u64)> = map
        .begin(&g)
        .unwrap()
        .map(|r| {
            let (k, v) = r.unwrap();
            (*k, *v)
        })
        .collect();
    assert_eq!(got, (1..=100).map(|k| (k, k * 2)).collect::<Vec<_>>());
    // backward from the middle
    let mut it = map.find(&50, &g).unwrap();
    for expect in (1..=50u64).rev() {
        assert_eq!(it.key(), Some(&expect));
        let moved = it.step_back().unwrap();
        assert_eq!(moved, expect != 1);
    }
    assert!(it.is_end());
    // iterator equality is by pointed-at key
    let a = map.find(&30, &g).unwrap();
    let b = map.find(&30, &g).unwrap();
    assert!(a == b);
    assert!(map.find(&1000, &g).unwrap() == map.end(&g));
}

#[test]
fn iterator_erase_if_unmodified() {
    let (be, cache) = harness::<TinyCfg>();
    let map = client(&be, &cache);
    let g = cpin();
    for k in 1..=3u64 {
        assert!(map.insert(&k, &k, &g).unwrap());
    }
    // success on a quiescent, consolidated root leaf
    let mut it = map.find(&2, &g).unwrap();
    assert_eq!(it.erase_if_unmodified().unwrap(), EraseResult::Success);
    assert_eq!(it.key(), Some(&3));
    assert_eq!(collect_keys(&map), vec![1, 3]);
    // failure when the leaf was rewritten after the iterator read it
    let mut it = map.find(&1, &g).unwrap();
    assert!(map.insert(&2, &2, &g).unwrap());
    assert_eq!(it.erase_if_unmodified().unwrap(), EraseResult::Failed);
    assert_eq!(collect_keys(&map), vec![1, 2, 3]);
    check_invariants(&be, &cache);
}

#[test]
fn iterator_erase_triggers_merge() {
    let (be, cache) = harness::<TinyCfg>();
    let map = client(&be, &cache);
    let g = cpin();
    for k in 1..=5u64 {
        assert!(map.insert(&k, &k, &g).unwrap());
    }
    // 5 keys split the root: leaves [1,2] and [3,4,5]
    for k in [5u64, 4] {
        assert!(map.erase(&k, &g).unwrap());
    }
    // the right leaf is down to [3]; erasing via the iterator would
    // underflow it, so a merge is started instead of a removal
    let mut it = map.find(&3, &g).unwrap();
    assert_eq!(it.erase_if_unmodified().unwrap(), EraseResult::Merged);
    assert_eq!(collect_keys(&map), vec![1, 2, 3]);
    check_invariants(&be, &cache);
}

/// E1: single-threaded insert / iterate / erase cycle
#[test]
fn scenario_insert_lookup_erase_cycle() {
    const N: u64 = 3000;
    let (be, cache) = harness::<SmallCfg>();
    let map = client(&be, &cache);
    let v0 = be.ptr_entries().iter().find(|e| e.0.is_root()).unwrap().2;
    for k in 1..=N {
        let g = cpin();
        assert!(map.insert(&k, &k, &g).unwrap());
    }
    assert_eq!(collect_keys(&map), (1..=N).collect::<Vec<_>>());
    check_invariants(&be, &cache);
    for k in (1..=N).filter(|k| k % 3 == 0) {
        let g = cpin();
        assert!(map.erase(&k, &g).unwrap());
    }
    assert_eq!(
        collect_keys(&map),
        (1..=N).filter(|k| k % 3 != 0).collect::<Vec<_>>()
    );
    check_invariants(&be, &cache);
    // root version only ever moved forward
    let v1 = be.ptr_entries().iter().find(|e| e.0.is_root()).unwrap().2;
    assert!(v1 > v0);
}

/// E2: many clients inserting the same key range; every key is won
/// exactly once
#[test]
fn scenario_concurrent_insert() {
    const N: u64 = 5000;
    const THREADS: usize = 8;
    let (be, cache) = harness::<SmallCfg>();
    let wins = AtomicU64::new(0);
    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| {
                let map = client(&be, &cache);
                for k in 1..=N {
                    let g = cpin();
                    if map.insert(&k, &k, &g).unwrap() {
                        wins.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });
    assert_eq!(wins.load(Ordering::Relaxed), N);
    let map = client(&be, &cache);
    assert_eq!(collect_keys(&map), (1..=N).collect::<Vec<_>>());
    check_invariants(&be, &cache);
}

/// E3: two clients cooperating through a shared counter erase every
/// third key exactly once
#[test]
fn scenario_concurrent_erase() {
    const N: u64 = 5000;
    let (be, cache) = harness::<SmallCfg>();
    {
        let map = client(&be, &cache);
        for k in 1..=N {
            let g = cpin();
            assert!(map.insert(&k, &k, &g).unwrap());
        }
    }
    let next = AtomicU64::new(3);
    let erased = AtomicU64::new(0);
    thread::scope(|s| {
        for _ in 0..2 {
            s.spawn(|| {
                let map = client(&be, &cache);
                loop {
                    let k = next.fetch_add(3, Ordering::AcqRel);
                    if k > N {
                        return;
                    }
                    let g = cpin();
                    assert!(map.erase(&k, &g).unwrap(), "key {k} claimed once");
                    erased.fetch_add(1, Ordering::Relaxed);
                }
            });
        }
    });
    assert_eq!(erased.load(Ordering::Relaxed), N / 3);
    let map = client(&be, &cache);
    assert_eq!(
        collect_keys(&map),
        (1..=N).filter(|k| k % 3 != 0).collect::<Vec<_>>()
    );
    check_invariants(&be, &cache);
}

/// E4: split churn, then enough contiguous erasing to force mass merges,
/// then refill
#[test]
fn scenario_split_merge_churn() {
    const N: u64 = 4000;
    let (be, cache) = harness::<SmallCfg>();
    let map = client(&be, &cache);
    for k in 1..=N {
        let g = cpin();
        assert!(map.insert(&k, &k, &g).unwrap());
    }
    check_invariants(&be, &cache);
    let leaves_full = leaf_chain(&be, &cache).len();
    for k in 500..3500u64 {
        let g = cpin();
        assert!(map.erase(&k, &g).unwrap());
    }
    check_invariants(&be, &cache);
    let leaves_thin = leaf_chain(&be, &cache).len();
    assert!(
        leaves_full >= leaves_thin + 100,
        "expected at least 100 merges ({leaves_full} -> {leaves_thin})"
    );
    for k in 500..3500u64 {
        let g = cpin();
        assert!(map.insert(&k, &k, &g).unwrap());
    }
    assert_eq!(collect_keys(&map), (1..=N).collect::<Vec<_>>());
    check_invariants(&be, &cache);
}

/// E5: a client posts a split delta and dies; the next traversal must
/// finish the split
#[test]
fn scenario_help_completion() {
    const N: u64 = 200;
    let (be, cache) = harness::<SmallCfg>();
    {
        let map = client(&be, &cache);
        for k in 1..=N {
            let g = cpin();
            assert!(map.insert(&k, &k, &g).unwrap());
        }
    }
    // phase 1 of a split by hand: materialise the right sibling and swing
    // the split delta, then abandon the operation
    let g = cpin();
    let mut cx: OpContext<'_, u64, u64, MemBackend, SmallCfg> =
        OpContext::new(be.as_ref(), cache.as_ref(), next_tx_id());
    cx.stack.push(LogicalPtr::ROOT);
    let leaf = search::lower_bound_node(
        &(N / 2),
        &mut cx,
        SearchBound::LastSmallerEqual,
        CacheUse::None,
        &g,
    )
    .unwrap();
    let np = np_ref(leaf);
    assert!(!np.lptr.is_root());
    let lf = np.as_leaf().clone();
    assert!(lf.entries.len() >= 2);
    let ptrs = be.ptr_table();
    let nodes = be.node_table();
    let mut right = lf.carve_upper(lf.entries.len() / 2);
    let right_pptr = nodes.nt_alloc().unwrap();
    right.set_base(right_pptr);
    nodes.nt_insert(right_pptr, right.enc()).unwrap();
    let right_lptr = ptrs.pt_alloc().unwrap();
    ptrs.pt_insert(right_lptr, right_pptr).unwrap();
    let delta = SplitDelta {
        next: np.ptr,
        new_right: right_lptr,
        right_key: right.low_key,
        level: 0,
    };
    let split_pptr = nodes.nt_alloc().unwrap();
    nodes.nt_insert(split_pptr, delta.enc()).unwrap();
    ptrs.pt_update(np.lptr, split_pptr, np.rc_version).unwrap();
    let orphan_lptr = np.lptr;
    drop(g);
    // a different client now traverses: it must install the separator,
    // consolidate the delta and expose both halves
    let map = client(&be, &cache);
    assert_eq!(collect_keys(&map), (1..=N).collect::<Vec<_>>());
    let (cur, _) = be.ptr_table().pt_read(orphan_lptr).unwrap();
    assert_ne!(cur, split_pptr, "split delta must be consolidated away");
    assert!(
        be.node_table().nt_read(split_pptr).is_err(),
        "split delta blob must be collected"
    );
    check_invariants(&be, &cache);
}

/// E6: root-leaf split raises the tree, merges collapse it back
#[test]
fn scenario_root_split_and_collapse() {
    let (be, cache) = harness::<TinyCfg>();
    let map = client(&be, &cache);
    let root_kind = |cx: &mut OpContext<'_, u64, u64, MemBackend, TinyCfg>| {
        let g = cpin();
        let np = cx.get_without_cache(LogicalPtr::ROOT, &g).unwrap().unwrap();
        match &np_ref(np).node {
            BaseNode::Leaf(_) => 0i8,
            BaseNode::Inner(i) => i.level,
        }
    };
    let mut cx: OpContext<'_, u64, u64, MemBackend, TinyCfg> =
        OpContext::new(be.as_ref(), cache.as_ref(), next_tx_id());
    for k in 1..=4u64 {
        let g = cpin();
        assert!(map.insert(&k, &k, &g).unwrap());
    }
    assert_eq!(root_kind(&mut cx), 0, "4 keys still fit the root leaf");
    {
        let g = cpin();
        assert!(map.insert(&5, &5, &g).unwrap());
    }
    assert_eq!(root_kind(&mut cx), 1, "the 5th key splits the root");
    check_invariants(&be, &cache);
    for k in [5u64, 4, 3] {
        let g = cpin();
        assert!(map.erase(&k, &g).unwrap());
    }
    assert_eq!(root_kind(&mut cx), 0, "merges collapse the root");
    assert_eq!(collect_keys(&map), vec![1, 2]);
    let chain = leaf_chain(&be, &cache);
    assert_eq!(chain.len(), 1);
    assert_eq!(chain[0].0, 0);
    assert!(chain[0].1.is_none());
    check_invariants(&be, &cache);
}
