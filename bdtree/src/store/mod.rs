/*
 * Created on Sun Jan 21 2024
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

//! The two host-supplied tables the tree is built on. Both tables are
//! shared between all clients and must be safe for concurrent access; the
//! tree layers no lock on top of them, only optimistic version CASes.

pub mod mem;

use {
    crate::{
        error::StoreResult,
        tree::{LogicalPtr, PhysicalPtr},
    },
    bytes::Bytes,
};

/// The logical pointer table: `LogicalPtr -> (PhysicalPtr, version)`.
///
/// Versions start at 1 on insert and increase by one on every update; the
/// version is the single linearisation currency of the tree. Allocation is
/// monotonic and ids are never reused. Id 1 is reserved for the tree root
/// and must never be handed out by [`PointerTable::pt_alloc`].
pub trait PointerTable {
    /// Mint a fresh logical pointer (monotonic, `> 1`)
    fn pt_alloc(&self) -> StoreResult<LogicalPtr>;
    /// Read the current binding. Fails with `NotFound`
    fn pt_read(&self, lptr: LogicalPtr) -> StoreResult<(PhysicalPtr, u64)>;
    /// Create a binding with initial version 1. Fails with `Exists`
    fn pt_insert(&self, lptr: LogicalPtr, pptr: PhysicalPtr) -> StoreResult<u64>;
    /// CAS the binding: succeeds iff the stored version equals `expected`,
    /// returning the new version. Fails with `WrongVersion` (carrying the
    /// current version) or `NotFound`
    fn pt_update(&self, lptr: LogicalPtr, pptr: PhysicalPtr, expected: u64) -> StoreResult<u64>;
    /// Versioned removal with the same CAS semantics as `pt_update`
    fn pt_remove(&self, lptr: LogicalPtr, expected: u64) -> StoreResult<()>;
}

/// The node table: `PhysicalPtr -> immutable blob`. Blobs are only ever
/// inserted and removed, never rewritten.
pub trait NodeTable {
    /// Mint a fresh physical pointer (monotonic, never reused)
    fn nt_alloc(&self) -> StoreResult<PhysicalPtr>;
    /// Read a blob. Fails with `NotFound`
    fn nt_read(&self, pptr: PhysicalPtr) -> StoreResult<Bytes>;
    /// Store a blob. `Exists` here means a monotonic pointer was reused,
    /// which is an implementation bug, not a recoverable condition
    fn nt_insert(&self, pptr: PhysicalPtr, data: Vec<u8>) -> StoreResult<()>;
    /// Drop a blob. Fails with `NotFound`
    fn nt_remove(&self, pptr: PhysicalPtr) -> StoreResult<()>;
}

/// A host backend: one pointer table and one node table
pub trait Backend: Send + Sync + 'static {
    type Ptrs: PointerTable;
    type Nodes: NodeTable;
    fn ptr_table(&self) -> &Self::Ptrs;
    fn node_table(&self) -> &Self::Nodes;
}
