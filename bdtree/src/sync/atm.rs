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

use core::{fmt, ops::Deref, sync::atomic::Ordering};
use crossbeam_epoch::{Atomic as CBAtomic, CompareExchangeError, Pointable, Pointer};
pub use crossbeam_epoch::{pin as cpin, unprotected as upin, Guard, Owned, Shared};

pub const ORD_RLX: Ordering = Ordering::Relaxed;
pub const ORD_ACQ: Ordering = Ordering::Acquire;
pub const ORD_REL: Ordering = Ordering::Release;
pub const ORD_ACR: Ordering = Ordering::AcqRel;

type CxResult<'g, T, P> = Result<Shared<'g, T>, CompareExchangeError<'g, T, P>>;

/// A thin veneer over the epoch-pinned atomic pointer. Cache slots are the
/// only users; all loads and CASes go through the named helpers so that the
/// ordering contract stays in one place.
pub struct Atomic<T> {
    a: CBAtomic<T>,
}

// the derive is stupid, it will enforce a debug constraint on T
impl<T> fmt::Debug for Atomic<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.a)
    }
}

impl<T: Pointable> Atomic<T> {
    #[inline(always)]
    pub const fn null() -> Self {
        Self {
            a: CBAtomic::null(),
        }
    }
    #[inline(always)]
    pub fn cx<'g, P>(
        &self,
        o: Shared<'g, T>,
        n: P,
        s: Ordering,
        f: Ordering,
        g: &'g Guard,
    ) -> CxResult<'g, T, P>
    where
        P: Pointer<T>,
    {
        self.a.compare_exchange(o, n, s, f, g)
    }
    #[inline(always)]
    pub fn cx_rel<'g, P>(&self, o: Shared<'g, T>, n: P, g: &'g Guard) -> CxResult<'g, T, P>
    where
        P: Pointer<T>,
    {
        self.cx(o, n, ORD_REL, ORD_RLX, g)
    }
    #[inline(always)]
    pub fn ld<'g>(&self, o: Ordering, g: &'g Guard) -> Shared<'g, T> {
        self.a.load(o, g)
    }
    #[inline(always)]
    pub fn ld_acq<'g>(&self, g: &'g Guard) -> Shared<'g, T> {
        self.ld(ORD_ACQ, g)
    }
    #[inline(always)]
    pub fn ld_rlx<'g>(&self, g: &'g Guard) -> Shared<'g, T> {
        self.ld(ORD_RLX, g)
    }
}

impl<T, A> From<A> for Atomic<T>
where
    A: Into<CBAtomic<T>>,
{
    fn from(t: A) -> Self {
        Self { a: Into::into(t) }
    }
}

impl<T> Deref for Atomic<T> {
    type Target = CBAtomic<T>;
    fn deref(&self) -> &Self::Target {
        &self.a
    }
}
