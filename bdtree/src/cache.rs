/*
 * Created on Sat Mar 02 2024
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

//! The client-scoped cache of resolved node images, keyed by logical
//! pointer: a fixed array of small set-associative buckets with a packed
//! LRU order word per bucket. Slots are epoch-pinned atomics; a displaced
//! image is reclaimed once every pinned guard has moved past it, so a
//! reader holding a guard can keep using an image that was concurrently
//! replaced. The LRU word is maintained with single best-effort CAS
//! attempts: losing one only costs replacement accuracy, never safety.

use {
    crate::{
        error::StoreResult,
        store::{Backend, PointerTable},
        sync::{
            atm::{upin, Atomic, Guard, Owned, Shared},
            last_tx_id,
        },
        tree::{
            meta::{MapKey, MapValue, TreeConfig},
            node::{np_ref, NodePointer},
            resolve::resolve_node,
            LogicalPtr, OpContext,
        },
    },
    core::{marker::PhantomData, sync::atomic::AtomicU32},
    log::trace,
};

const ORDER_WAYS_MAX: usize = 4;

struct Bucket<K, V> {
    ways: Vec<Atomic<NodePointer<K, V>>>,
    order: AtomicU32,
}

impl<K, V> Bucket<K, V> {
    fn new(ways: usize) -> Self {
        Self {
            ways: (0..ways).map(|_| Atomic::null()).collect(),
            order: AtomicU32::new(u32::from_le_bytes([0, 1, 2, 3])),
        }
    }
    /// Single-attempt move-to-front of `way` in the packed order word
    fn touch(&self, way: usize, ways: usize) {
        let o = self.order.load(crate::sync::atm::ORD_ACQ);
        let mut b = o.to_le_bytes();
        if let Some(pos) = b[..ways].iter().position(|&w| w as usize == way) {
            if pos == 0 {
                return;
            }
            b.copy_within(0..pos, 1);
            b[0] = way as u8;
            let _ = self.order.compare_exchange(
                o,
                u32::from_le_bytes(b),
                crate::sync::atm::ORD_ACR,
                crate::sync::atm::ORD_RLX,
            );
        }
    }
    /// Single-attempt move-to-back (slot was emptied)
    fn untouch(&self, way: usize, ways: usize) {
        let o = self.order.load(crate::sync::atm::ORD_ACQ);
        let mut b = o.to_le_bytes();
        if let Some(pos) = b[..ways].iter().position(|&w| w as usize == way) {
            if pos + 1 == ways {
                return;
            }
            b.copy_within(pos + 1..ways, pos);
            b[ways - 1] = way as u8;
            let _ = self.order.compare_exchange(
                o,
                u32::from_le_bytes(b),
                crate::sync::atm::ORD_ACR,
                crate::sync::atm::ORD_RLX,
            );
        }
    }
    fn victim(&self, ways: usize) -> usize {
        self.order.load(crate::sync::atm::ORD_ACQ).to_le_bytes()[ways - 1] as usize
    }
}

pub struct LogicalCache<K, V, C> {
    buckets: Vec<Bucket<K, V>>,
    _c: PhantomData<C>,
}

impl<K: MapKey, V: MapValue, C: TreeConfig> Default for LogicalCache<K, V, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: MapKey, V: MapValue, C: TreeConfig> LogicalCache<K, V, C> {
    const _CONFIG_OK: () = assert!(
        C::CACHE_WAYS >= 1 && C::CACHE_WAYS <= ORDER_WAYS_MAX && C::CACHE_BUCKETS >= 1
    );
    pub fn new() -> Self {
        let _ = Self::_CONFIG_OK;
        Self {
            buckets: (0..C::CACHE_BUCKETS)
                .map(|_| Bucket::new(C::CACHE_WAYS))
                .collect(),
            _c: PhantomData,
        }
    }
    #[inline(always)]
    fn bucket_of(&self, lptr: LogicalPtr) -> &Bucket<K, V> {
        &self.buckets[(lptr.0 ^ (lptr.0 >> 32)) as usize % C::CACHE_BUCKETS]
    }
    /// Find the slot holding `lptr`, bumping its recency on a hit
    fn probe<'g>(
        &self,
        lptr: LogicalPtr,
        g: &'g Guard,
    ) -> Option<(usize, Shared<'g, NodePointer<K, V>>)> {
        let bucket = self.bucket_of(lptr);
        for (way, slot) in bucket.ways.iter().enumerate() {
            let sh = slot.ld_acq(g);
            if !sh.is_null() && np_ref(sh).lptr == lptr {
                bucket.touch(way, C::CACHE_WAYS);
                return Some((way, sh));
            }
        }
        None
    }
}

impl<K: MapKey, V: MapValue, C: TreeConfig> LogicalCache<K, V, C> {
    /// Any resolved image of `lptr`, regardless of age
    pub(crate) fn get_from_cache<'g, B: Backend>(
        &self,
        lptr: LogicalPtr,
        cx: &mut OpContext<'_, K, V, B, C>,
        g: &'g Guard,
    ) -> StoreResult<Option<Shared<'g, NodePointer<K, V>>>> {
        self.get_visible(lptr, 0, cx, g)
    }
    /// An image no older than the context's transaction id
    pub(crate) fn get_current_from_cache<'g, B: Backend>(
        &self,
        lptr: LogicalPtr,
        cx: &mut OpContext<'_, K, V, B, C>,
        g: &'g Guard,
    ) -> StoreResult<Option<Shared<'g, NodePointer<K, V>>>> {
        self.get_visible(lptr, cx.tx_id, cx, g)
    }
    fn get_visible<'g, B: Backend>(
        &self,
        lptr: LogicalPtr,
        floor: u64,
        cx: &mut OpContext<'_, K, V, B, C>,
        g: &'g Guard,
    ) -> StoreResult<Option<Shared<'g, NodePointer<K, V>>>> {
        debug_assert!(!lptr.is_nil());
        if let Some((_, sh)) = self.probe(lptr, g) {
            if np_ref(sh).last_tx_id() >= floor {
                return Ok(Some(sh));
            }
        }
        self.get_without_cache(lptr, cx, g)
    }
    /// Re-read the pointer table, resolve the chain (helping any pending
    /// SMO on the way) and write the fresh image back
    pub(crate) fn get_without_cache<'g, B: Backend>(
        &self,
        lptr: LogicalPtr,
        cx: &mut OpContext<'_, K, V, B, C>,
        g: &'g Guard,
    ) -> StoreResult<Option<Shared<'g, NodePointer<K, V>>>> {
        loop {
            let txid = last_tx_id();
            let (pptr, version) = match cx.ptrs().pt_read(lptr) {
                Ok(t) => t,
                Err(crate::error::StoreError::NotFound) => return Ok(None),
                Err(e) => return Err(e),
            };
            let prev = self.probe(lptr, g).map(|(_, sh)| np_ref(sh));
            let Some(base) = resolve_node(lptr, pptr, version, prev, cx, g)? else {
                // a structural delta was helped to completion (or the chain
                // was collected under us): the entry has moved on
                continue;
            };
            let np = NodePointer::new(lptr, pptr, version, base, txid);
            return Ok(Some(self.publish_read(np, txid, g)));
        }
    }
    /// Install a freshly read image, or adopt a newer one that beat us
    fn publish_read<'g>(
        &self,
        np: NodePointer<K, V>,
        txid: u64,
        g: &'g Guard,
    ) -> Shared<'g, NodePointer<K, V>> {
        let lptr = np.lptr;
        let bucket = self.bucket_of(lptr);
        let mut own = Owned::new(np);
        loop {
            if let Some((way, cur)) = self.probe(lptr, g) {
                let e = np_ref(cur);
                if e.rc_version >= own.rc_version {
                    // the cached image is at least as fresh as what we read
                    // after observing txid, so it satisfies that floor too
                    e.observe_tx(txid);
                    return cur;
                }
                match bucket.ways[way].cx_rel(cur, own, g) {
                    Ok(sh) => {
                        unsafe {
                            // UNSAFE(@ohsayan): slot ownership transferred by
                            // the CAS; in-flight readers are guard-protected
                            g.defer_destroy(cur)
                        }
                        bucket.touch(way, C::CACHE_WAYS);
                        return sh;
                    }
                    Err(e) => {
                        own = e.new;
                        continue;
                    }
                }
            }
            let way = bucket.victim(C::CACHE_WAYS);
            let cur = bucket.ways[way].ld_acq(g);
            match bucket.ways[way].cx_rel(cur, own, g) {
                Ok(sh) => {
                    if !cur.is_null() {
                        unsafe {
                            // UNSAFE(@ohsayan): same as above
                            g.defer_destroy(cur)
                        }
                    }
                    bucket.touch(way, C::CACHE_WAYS);
                    return sh;
                }
                Err(e) => {
                    own = e.new;
                    continue;
                }
            }
        }
    }
    /// Write-back after a successful structure modification. Returns the
    /// published image, or `None` (discarding the candidate) if the slot
    /// already holds something at least as new
    pub(crate) fn add_entry<'g>(
        &self,
        np: NodePointer<K, V>,
        g: &'g Guard,
    ) -> Option<Shared<'g, NodePointer<K, V>>> {
        let lptr = np.lptr;
        let bucket = self.bucket_of(lptr);
        let mut own = Owned::new(np);
        loop {
            if let Some((way, cur)) = self.probe(lptr, g) {
                let e = np_ref(cur);
                if e.rc_version >= own.rc_version {
                    return None;
                }
                match bucket.ways[way].cx_rel(cur, own, g) {
                    Ok(sh) => {
                        unsafe {
                            // UNSAFE(@ohsayan): slot ownership transferred by
                            // the CAS; in-flight readers are guard-protected
                            g.defer_destroy(cur)
                        }
                        bucket.touch(way, C::CACHE_WAYS);
                        return Some(sh);
                    }
                    Err(e) => {
                        own = e.new;
                        continue;
                    }
                }
            }
            let way = bucket.victim(C::CACHE_WAYS);
            let cur = bucket.ways[way].ld_acq(g);
            match bucket.ways[way].cx_rel(cur, own, g) {
                Ok(sh) => {
                    if !cur.is_null() {
                        unsafe {
                            // UNSAFE(@ohsayan): same as above
                            g.defer_destroy(cur)
                        }
                    }
                    bucket.touch(way, C::CACHE_WAYS);
                    return Some(sh);
                }
                Err(e) => {
                    own = e.new;
                    continue;
                }
            }
        }
    }
    /// Drop the slot for `lptr`, if any
    pub(crate) fn invalidate(&self, lptr: LogicalPtr, g: &Guard) {
        trace!("cache: invalidate {lptr}");
        let bucket = self.bucket_of(lptr);
        loop {
            let Some((way, cur)) = self.probe(lptr, g) else { return };
            match bucket.ways[way].cx_rel(cur, Shared::null(), g) {
                Ok(_) => {
                    unsafe {
                        // UNSAFE(@ohsayan): slot emptied by the CAS
                        g.defer_destroy(cur)
                    }
                    bucket.untouch(way, C::CACHE_WAYS);
                    return;
                }
                Err(_) => continue,
            }
        }
    }
    /// Drop the slot iff its cached version is strictly older than
    /// `rc_version` (used after a CAS told us the current version)
    pub(crate) fn invalidate_if_older(&self, lptr: LogicalPtr, rc_version: u64, g: &Guard) {
        let bucket = self.bucket_of(lptr);
        loop {
            let Some((way, cur)) = self.probe(lptr, g) else { return };
            if np_ref(cur).rc_version >= rc_version {
                return;
            }
            match bucket.ways[way].cx_rel(cur, Shared::null(), g) {
                Ok(_) => {
                    unsafe {
                        // UNSAFE(@ohsayan): slot emptied by the CAS
                        g.defer_destroy(cur)
                    }
                    bucket.untouch(way, C::CACHE_WAYS);
                    return;
                }
                Err(_) => continue,
            }
        }
    }
    /// (total slots, occupied slots) — debugging aid
    pub fn occupancy(&self) -> (usize, usize) {
        let g = unsafe {
            // UNSAFE(@ohsayan): read-only snapshot; slot contents are not
            // dereferenced
            upin()
        };
        let mut occupied = 0;
        for bucket in &self.buckets {
            occupied += bucket.ways.iter().filter(|w| !w.ld_rlx(g).is_null()).count();
        }
        (C::CACHE_BUCKETS * C::CACHE_WAYS, occupied)
    }
}

impl<K, V, C> Drop for LogicalCache<K, V, C> {
    fn drop(&mut self) {
        for bucket in &self.buckets {
            for way in &bucket.ways {
                unsafe {
                    // UNSAFE(@ohsayan): sole live owner at drop time
                    let sh = way.ld_rlx(upin());
                    if !sh.is_null() {
                        drop(sh.into_owned());
                    }
                }
            }
        }
    }
}
