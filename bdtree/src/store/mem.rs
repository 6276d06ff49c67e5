/*
 * Created on Sat Feb 03 2024
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

//! An ephemeral in-process backend. This is the reference implementation
//! of the two table contracts: every test in the crate runs against it and
//! hosts can use it as a scaffold while wiring up a real store. It is
//! deliberately boring: two maps behind rwlocks and two monotonic counters.

use {
    super::{Backend, NodeTable, PointerTable},
    crate::{
        error::{StoreError, StoreResult},
        sync::atm::ORD_ACR,
        tree::{LogicalPtr, PhysicalPtr},
    },
    bytes::Bytes,
    core::sync::atomic::AtomicU64,
    parking_lot::RwLock,
    std::collections::HashMap,
};

pub struct MemPtrTable {
    map: RwLock<HashMap<u64, (u64, u64)>>,
    next: AtomicU64,
}

impl MemPtrTable {
    fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            // id 1 is the root and is never allocated
            next: AtomicU64::new(1),
        }
    }
}

impl PointerTable for MemPtrTable {
    fn pt_alloc(&self) -> StoreResult<LogicalPtr> {
        Ok(LogicalPtr(self.next.fetch_add(1, ORD_ACR) + 1))
    }
    fn pt_read(&self, lptr: LogicalPtr) -> StoreResult<(PhysicalPtr, u64)> {
        self.map
            .read()
            .get(&lptr.0)
            .map(|&(p, v)| (PhysicalPtr(p), v))
            .ok_or(StoreError::NotFound)
    }
    fn pt_insert(&self, lptr: LogicalPtr, pptr: PhysicalPtr) -> StoreResult<u64> {
        let mut map = self.map.write();
        if map.contains_key(&lptr.0) {
            return Err(StoreError::Exists);
        }
        map.insert(lptr.0, (pptr.0, 1));
        Ok(1)
    }
    fn pt_update(&self, lptr: LogicalPtr, pptr: PhysicalPtr, expected: u64) -> StoreResult<u64> {
        let mut map = self.map.write();
        match map.get_mut(&lptr.0) {
            None => Err(StoreError::NotFound),
            Some((_, v)) if *v != expected => Err(StoreError::WrongVersion(*v)),
            Some(slot) => {
                *slot = (pptr.0, expected + 1);
                Ok(expected + 1)
            }
        }
    }
    fn pt_remove(&self, lptr: LogicalPtr, expected: u64) -> StoreResult<()> {
        let mut map = self.map.write();
        match map.get(&lptr.0) {
            None => Err(StoreError::NotFound),
            Some(&(_, v)) if v != expected => Err(StoreError::WrongVersion(v)),
            Some(_) => {
                map.remove(&lptr.0);
                Ok(())
            }
        }
    }
}

pub struct MemNodeTable {
    map: RwLock<HashMap<u64, Bytes>>,
    next: AtomicU64,
}

impl MemNodeTable {
    fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            next: AtomicU64::new(0),
        }
    }
}

impl NodeTable for MemNodeTable {
    fn nt_alloc(&self) -> StoreResult<PhysicalPtr> {
        Ok(PhysicalPtr(self.next.fetch_add(1, ORD_ACR) + 1))
    }
    fn nt_read(&self, pptr: PhysicalPtr) -> StoreResult<Bytes> {
        self.map
            .read()
            .get(&pptr.0)
            .cloned()
            .ok_or(StoreError::NotFound)
    }
    fn nt_insert(&self, pptr: PhysicalPtr, data: Vec<u8>) -> StoreResult<()> {
        let mut map = self.map.write();
        if map.contains_key(&pptr.0) {
            return Err(StoreError::Exists);
        }
        map.insert(pptr.0, Bytes::from(data));
        Ok(())
    }
    fn nt_remove(&self, pptr: PhysicalPtr) -> StoreResult<()> {
        self.map
            .write()
            .remove(&pptr.0)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }
}

pub struct MemBackend {
    ptrs: MemPtrTable,
    nodes: MemNodeTable,
}

impl MemBackend {
    pub fn new() -> Self {
        Self {
            ptrs: MemPtrTable::new(),
            nodes: MemNodeTable::new(),
        }
    }
}

impl Default for MemBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemBackend {
    type Ptrs = MemPtrTable;
    type Nodes = MemNodeTable;
    fn ptr_table(&self) -> &Self::Ptrs {
        &self.ptrs
    }
    fn node_table(&self) -> &Self::Nodes {
        &self.nodes
    }
}

impl MemBackend {
    /// Number of blobs currently stored (leak checks)
    pub fn blob_count(&self) -> usize {
        self.nodes.map.read().len()
    }
    /// Snapshot of all stored physical pointers (leak checks)
    pub fn blob_ptrs(&self) -> Vec<PhysicalPtr> {
        self.nodes.map.read().keys().map(|&p| PhysicalPtr(p)).collect()
    }
    /// Snapshot of all live pointer-table bindings
    pub fn ptr_entries(&self) -> Vec<(LogicalPtr, PhysicalPtr, u64)> {
        self.ptrs
            .map
            .read()
            .iter()
            .map(|(&l, &(p, v))| (LogicalPtr(l), PhysicalPtr(p), v))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ptr_cas_semantics() {
        let be = MemBackend::new();
        let pt = be.ptr_table();
        let l = pt.pt_alloc().unwrap();
        assert!(l.0 > 1);
        assert_eq!(pt.pt_insert(l, PhysicalPtr(10)).unwrap(), 1);
        assert_eq!(pt.pt_insert(l, PhysicalPtr(11)), Err(StoreError::Exists));
        assert_eq!(pt.pt_update(l, PhysicalPtr(11), 1).unwrap(), 2);
        assert_eq!(
            pt.pt_update(l, PhysicalPtr(12), 1),
            Err(StoreError::WrongVersion(2))
        );
        assert_eq!(pt.pt_remove(l, 1), Err(StoreError::WrongVersion(2)));
        pt.pt_remove(l, 2).unwrap();
        assert_eq!(pt.pt_read(l), Err(StoreError::NotFound));
    }

    #[test]
    fn node_blob_semantics() {
        let be = MemBackend::new();
        let nt = be.node_table();
        let p = nt.nt_alloc().unwrap();
        nt.nt_insert(p, vec![1, 2, 3]).unwrap();
        assert_eq!(nt.nt_insert(p, vec![4]), Err(StoreError::Exists));
        assert_eq!(&nt.nt_read(p).unwrap()[..], &[1, 2, 3]);
        nt.nt_remove(p).unwrap();
        assert_eq!(nt.nt_remove(p), Err(StoreError::NotFound));
    }
}
