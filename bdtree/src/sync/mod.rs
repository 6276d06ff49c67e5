/*
 * Created on Mon Jan 15 2024
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

pub mod atm;

use self::atm::{ORD_ACQ, ORD_ACR};
use core::sync::atomic::AtomicU64;

/// The process-wide transaction id counter. This is the only global
/// mutable state in the crate: it provides every client a fresh-view lower
/// bound on cache entries (a client that has observed tx id `T` never
/// regresses to a snapshot older than the state that produced `T`).
static TX_ID: AtomicU64 = AtomicU64::new(0);

/// Mint a fresh transaction id
pub fn next_tx_id() -> u64 {
    TX_ID.fetch_add(1, ORD_ACR) + 1
}

/// Raise the counter to at least `tx_id` (used when an id is learned from
/// a remote peer)
pub fn got_tx_id(tx_id: u64) {
    TX_ID.fetch_max(tx_id, ORD_ACR);
}

/// The highest transaction id observed so far
pub fn last_tx_id() -> u64 {
    TX_ID.load(ORD_ACQ)
}
