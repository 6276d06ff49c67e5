/*
 * Created on Tue Jan 09 2024
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

use core::fmt;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
/// Errors raised by the two backend tables.
///
/// The first three tags are the currency of optimistic concurrency control
/// and are handled by explicit retry loops inside the tree; only `Backend`
/// (an opaque host-side fault) ever surfaces through the public API.
pub enum StoreError {
    /// the object (logical or physical pointer) is not bound
    NotFound,
    /// the object is already bound
    Exists,
    /// the expected version did not match; carries the current version so
    /// that callers can freshen their caches
    WrongVersion(u64),
    /// an opaque host-side fault. the tree applies no retry policy to these
    Backend(&'static str),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "object does not exist"),
            Self::Exists => write!(f, "object exists"),
            Self::WrongVersion(v) => write!(f, "wrong version (current {v})"),
            Self::Backend(e) => write!(f, "backend fault: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}
