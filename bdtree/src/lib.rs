/*
 * Created on Mon Jan 08 2024
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

//! # bdtree
//!
//! A concurrent, latch-free ordered map built on top of two host-supplied
//! tables: a *pointer table* mapping stable logical pointers to versioned
//! physical pointers, and a *node table* holding immutable byte blobs.
//! Every mutation writes a fresh immutable blob and then swings a logical
//! pointer with an optimistic version CAS; structure modifications (split
//! and merge) are published as deltas that any client can help complete.
//!
//! The entry point is [`tree::imp::BdMap`]. All operations are scoped by a
//! [`sync::atm::Guard`] obtained from [`sync::atm::cpin`].

#![deny(unreachable_patterns)]

#[macro_use]
mod macros;

pub mod cache;
pub mod error;
pub mod mem;
pub mod store;
pub mod sync;
pub mod tree;

pub use {
    error::{StoreError, StoreResult},
    store::{Backend, NodeTable, PointerTable},
    tree::{
        imp::BdMap,
        meta::{DefConfig, MapKey, MapValue, TreeConfig},
        LogicalPtr, PhysicalPtr,
    },
};
