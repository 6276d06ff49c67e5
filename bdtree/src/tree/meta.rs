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

use super::codec::Wire;

/// Any type usable as a tree key: totally ordered, byte-serialisable and
/// admitting a distinguished `null` sentinel that is the least value of the
/// type. The leftmost node at every level carries `null` as its low key.
///
/// Note that for the integer impls `null` is the numeric minimum, which is
/// a representable key; treat it as reserved if you rely on the sentinel.
pub trait MapKey: Wire + Ord + Clone + Send + Sync + 'static {
    fn null() -> Self;
}

/// Any type usable as a tree value: opaque bytes on the wire
pub trait MapValue: Wire + Clone + Send + Sync + 'static {}

impl<T: Wire + Clone + Send + Sync + 'static> MapValue for T {}

macro_rules! impl_int_key {
    ($($ty:ty),*) => {
        $(impl MapKey for $ty { fn null() -> Self { <$ty>::MIN } })*
    }
}

impl_int_key!(u32, u64, i32, i64);

impl MapKey for String {
    fn null() -> Self {
        String::new()
    }
}

impl MapKey for Vec<u8> {
    fn null() -> Self {
        Vec::new()
    }
}

/// Tuning knobs, resolved at monomorphisation time. The defaults suit
/// medium-sized keys; tests instantiate their own configs to force
/// splits/merges at tiny node sizes.
pub trait TreeConfig: Send + Sync + 'static {
    /// serialised size (bytes) at which a node is split
    const MAX_NODE_SIZE: usize = 1024;
    /// serialised size (bytes) below which a non-root node is merged
    const MIN_NODE_SIZE: usize = 128;
    /// delta-chain length at which the next writer materialises the leaf
    /// instead of appending another delta. 0 disables delta chains
    const CONSOLIDATE_AT: usize = 6;
    /// bucket count of the per-client cache
    const CACHE_BUCKETS: usize = 1024;
    /// associativity of each cache bucket (1..=4)
    const CACHE_WAYS: usize = 3;
}

pub struct DefConfig;
impl TreeConfig for DefConfig {}

assertions!(
    DefConfig::MIN_NODE_SIZE < DefConfig::MAX_NODE_SIZE / 2,
    DefConfig::CACHE_WAYS >= 1,
    DefConfig::CACHE_WAYS <= 4,
);
