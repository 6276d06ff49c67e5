/*
 * Created on Wed Feb 14 2024
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

//! The wire codec. Every blob is a 1-byte tag followed by its payload;
//! primitives are little-endian fixed width, `Option` is a presence byte
//! followed by the value, sequences are a `u64` length followed by the
//! elements, pairs concatenate their components. The byte layout is
//! normative: blobs written by one client are read by every other.

use {
    super::{
        meta::{MapKey, MapValue},
        node::{
            Block, DeleteDelta, InnerNode, InsertDelta, LeafNode, MergeDelta, NodeTag,
            RemoveDelta, SplitDelta,
        },
        LogicalPtr, PhysicalPtr,
    },
    crate::mem::Scanner,
};

/// Byte serialisation of keys and values
pub trait Wire: Sized {
    fn wire_size(&self) -> usize;
    fn wire_enc(&self, buf: &mut Vec<u8>);
    fn wire_dec(sc: &mut Scanner) -> Option<Self>;
}

macro_rules! impl_int_wire {
    ($($ty:ty => $dec:ident),*) => {
        $(impl Wire for $ty {
            fn wire_size(&self) -> usize { core::mem::size_of::<$ty>() }
            fn wire_enc(&self, buf: &mut Vec<u8>) { buf.extend_from_slice(&self.to_le_bytes()) }
            fn wire_dec(sc: &mut Scanner) -> Option<Self> { sc.$dec() }
        })*
    }
}

impl_int_wire!(u32 => next_u32_le, u64 => next_u64_le, i32 => next_i32_le, i64 => next_i64_le);

impl Wire for String {
    fn wire_size(&self) -> usize {
        8 + self.len()
    }
    fn wire_enc(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.len() as u64).to_le_bytes());
        buf.extend_from_slice(self.as_bytes());
    }
    fn wire_dec(sc: &mut Scanner) -> Option<Self> {
        let len = sc.next_u64_le()? as usize;
        String::from_utf8(sc.next_bytes(len)?.to_vec()).ok()
    }
}

impl Wire for Vec<u8> {
    fn wire_size(&self) -> usize {
        8 + self.len()
    }
    fn wire_enc(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&(self.len() as u64).to_le_bytes());
        buf.extend_from_slice(self);
    }
    fn wire_dec(sc: &mut Scanner) -> Option<Self> {
        let len = sc.next_u64_le()? as usize;
        Some(sc.next_bytes(len)?.to_vec())
    }
}

fn enc_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn enc_opt<K: Wire>(buf: &mut Vec<u8>, v: Option<&K>) {
    match v {
        Some(k) => {
            buf.push(1);
            k.wire_enc(buf);
        }
        None => buf.push(0),
    }
}

fn dec_opt<K: Wire>(sc: &mut Scanner) -> Option<Option<K>> {
    match sc.next_byte()? {
        0 => Some(None),
        1 => Some(Some(K::wire_dec(sc)?)),
        _ => None,
    }
}

fn opt_size<K: Wire>(v: Option<&K>) -> usize {
    1 + v.map_or(0, Wire::wire_size)
}

impl<K: MapKey, V: MapValue> LeafNode<K, V> {
    pub fn enc_size(&self) -> usize {
        1 + 8
            + self
                .entries
                .iter()
                .map(|(k, v)| k.wire_size() + v.wire_size())
                .sum::<usize>()
            + self.low_key.wire_size()
            + opt_size(self.high_key.as_ref())
            + 8
    }
    pub fn enc(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.enc_size());
        buf.push(NodeTag::Leaf as u8);
        enc_u64(&mut buf, self.entries.len() as u64);
        for (k, v) in &self.entries {
            k.wire_enc(&mut buf);
            v.wire_enc(&mut buf);
        }
        self.low_key.wire_enc(&mut buf);
        enc_opt(&mut buf, self.high_key.as_ref());
        enc_u64(&mut buf, self.right_link.0);
        debug_assert_eq!(buf.len(), self.enc_size());
        buf
    }
    fn dec(sc: &mut Scanner, pptr: PhysicalPtr) -> Option<Self> {
        let len = sc.next_u64_le()? as usize;
        let mut entries = Vec::with_capacity(len.min(sc.remaining()));
        for _ in 0..len {
            let k = K::wire_dec(sc)?;
            let v = V::wire_dec(sc)?;
            entries.push((k, v));
        }
        let leaf = Self {
            base: pptr,
            deltas: Vec::new(),
            entries,
            low_key: K::wire_dec(sc)?,
            high_key: dec_opt(sc)?,
            right_link: LogicalPtr(sc.next_u64_le()?),
        };
        leaf.ck_invariants();
        Some(leaf)
    }
    pub(super) fn ck_invariants(&self) {
        debug_assert_eq!(self.high_key.is_some(), !self.right_link.is_nil());
        debug_assert!(self
            .high_key
            .as_ref()
            .map_or(true, |h| self.low_key < *h));
        #[cfg(debug_assertions)]
        for (i, (k, _)) in self.entries.iter().enumerate() {
            debug_assert!(i == 0 || self.entries[i - 1].0 < *k);
            debug_assert!(*k >= self.low_key);
            debug_assert!(self.high_key.as_ref().map_or(true, |h| k < h));
        }
    }
}

impl<K: MapKey> InnerNode<K> {
    pub fn enc_size(&self) -> usize {
        1 + 8
            + self
                .entries
                .iter()
                .map(|(k, _)| k.wire_size() + 8)
                .sum::<usize>()
            + self.low_key.wire_size()
            + opt_size(self.high_key.as_ref())
            + 8
            + 1
    }
    pub fn enc(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.enc_size());
        buf.push(NodeTag::Inner as u8);
        enc_u64(&mut buf, self.entries.len() as u64);
        for (k, l) in &self.entries {
            k.wire_enc(&mut buf);
            enc_u64(&mut buf, l.0);
        }
        self.low_key.wire_enc(&mut buf);
        enc_opt(&mut buf, self.high_key.as_ref());
        enc_u64(&mut buf, self.right_link.0);
        buf.push(self.level as u8);
        debug_assert_eq!(buf.len(), self.enc_size());
        buf
    }
    fn dec(sc: &mut Scanner) -> Option<Self> {
        let len = sc.next_u64_le()? as usize;
        let mut entries = Vec::with_capacity(len.min(sc.remaining()));
        for _ in 0..len {
            let k = K::wire_dec(sc)?;
            entries.push((k, LogicalPtr(sc.next_u64_le()?)));
        }
        let inner = Self {
            entries,
            low_key: K::wire_dec(sc)?,
            high_key: dec_opt(sc)?,
            right_link: LogicalPtr(sc.next_u64_le()?),
            level: sc.next_i8()?,
        };
        inner.ck_invariants();
        Some(inner)
    }
    pub(super) fn ck_invariants(&self) {
        debug_assert!(self.level >= 1);
        debug_assert_eq!(self.high_key.is_some(), !self.right_link.is_nil());
        debug_assert!(self
            .high_key
            .as_ref()
            .map_or(true, |h| self.low_key < *h));
        #[cfg(debug_assertions)]
        for (i, (k, _)) in self.entries.iter().enumerate() {
            debug_assert!(i == 0 || self.entries[i - 1].0 < *k);
            debug_assert!(*k >= self.low_key);
            debug_assert!(self.high_key.as_ref().map_or(true, |h| k < h));
        }
    }
}

impl<K: MapKey, V: MapValue> InsertDelta<K, V> {
    pub fn enc(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(1 + self.key.wire_size() + self.value.wire_size() + 8);
        buf.push(NodeTag::InsertDelta as u8);
        self.key.wire_enc(&mut buf);
        self.value.wire_enc(&mut buf);
        enc_u64(&mut buf, self.next.0);
        buf
    }
    fn dec(sc: &mut Scanner) -> Option<Self> {
        Some(Self {
            key: K::wire_dec(sc)?,
            value: V::wire_dec(sc)?,
            next: PhysicalPtr(sc.next_u64_le()?),
        })
    }
}

impl<K: MapKey> DeleteDelta<K> {
    pub fn enc(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.key.wire_size() + 8);
        buf.push(NodeTag::DeleteDelta as u8);
        self.key.wire_enc(&mut buf);
        enc_u64(&mut buf, self.next.0);
        buf
    }
    fn dec(sc: &mut Scanner) -> Option<Self> {
        Some(Self {
            key: K::wire_dec(sc)?,
            next: PhysicalPtr(sc.next_u64_le()?),
        })
    }
}

impl<K: MapKey> SplitDelta<K> {
    pub fn enc(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 8 + 8 + self.right_key.wire_size() + 1);
        buf.push(NodeTag::SplitDelta as u8);
        enc_u64(&mut buf, self.next.0);
        enc_u64(&mut buf, self.new_right.0);
        self.right_key.wire_enc(&mut buf);
        buf.push(self.level as u8);
        buf
    }
    fn dec(sc: &mut Scanner) -> Option<Self> {
        Some(Self {
            next: PhysicalPtr(sc.next_u64_le()?),
            new_right: LogicalPtr(sc.next_u64_le()?),
            right_key: K::wire_dec(sc)?,
            level: sc.next_i8()?,
        })
    }
}

impl<K: MapKey> RemoveDelta<K> {
    pub fn enc(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + self.low_key.wire_size() + 8 + 1);
        buf.push(NodeTag::RemoveDelta as u8);
        self.low_key.wire_enc(&mut buf);
        enc_u64(&mut buf, self.next.0);
        buf.push(self.level as u8);
        buf
    }
    fn dec(sc: &mut Scanner) -> Option<Self> {
        Some(Self {
            low_key: K::wire_dec(sc)?,
            next: PhysicalPtr(sc.next_u64_le()?),
            level: sc.next_i8()?,
        })
    }
}

impl<K: MapKey> MergeDelta<K> {
    pub fn enc(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(1 + self.right_low_key.wire_size() + 8 * 4 + 1);
        buf.push(NodeTag::MergeDelta as u8);
        self.right_low_key.wire_enc(&mut buf);
        enc_u64(&mut buf, self.rmdelta.0);
        enc_u64(&mut buf, self.rmdelta_pptr.0);
        enc_u64(&mut buf, self.next.0);
        enc_u64(&mut buf, self.rm_next.0);
        buf.push(self.level as u8);
        buf
    }
    fn dec(sc: &mut Scanner) -> Option<Self> {
        Some(Self {
            right_low_key: K::wire_dec(sc)?,
            rmdelta: LogicalPtr(sc.next_u64_le()?),
            rmdelta_pptr: PhysicalPtr(sc.next_u64_le()?),
            next: PhysicalPtr(sc.next_u64_le()?),
            rm_next: PhysicalPtr(sc.next_u64_le()?),
            level: sc.next_i8()?,
        })
    }
}

impl<K: MapKey, V: MapValue> Block<K, V> {
    /// Decode a blob read back from the node table. A malformed blob means
    /// the store was corrupted or a foreign writer broke the layout; there
    /// is no way to continue from that
    pub fn dec(buf: &[u8], pptr: PhysicalPtr) -> Self {
        Self::try_dec(buf, pptr)
            .unwrap_or_else(|| panic!("corrupted node blob at {pptr}"))
    }
    fn try_dec(buf: &[u8], pptr: PhysicalPtr) -> Option<Self> {
        let mut sc = Scanner::new(buf);
        let block = match sc.next_byte()? {
            t if t == NodeTag::Inner as u8 => Self::Inner(InnerNode::dec(&mut sc)?),
            t if t == NodeTag::Leaf as u8 => Self::Leaf(LeafNode::dec(&mut sc, pptr)?),
            t if t == NodeTag::InsertDelta as u8 => Self::Insert(InsertDelta::dec(&mut sc)?),
            t if t == NodeTag::DeleteDelta as u8 => Self::Delete(DeleteDelta::dec(&mut sc)?),
            t if t == NodeTag::SplitDelta as u8 => Self::Split(SplitDelta::dec(&mut sc)?),
            t if t == NodeTag::RemoveDelta as u8 => Self::Remove(RemoveDelta::dec(&mut sc)?),
            t if t == NodeTag::MergeDelta as u8 => Self::Merge(MergeDelta::dec(&mut sc)?),
            _ => return None,
        };
        debug_assert!(sc.eof());
        Some(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_layout_is_normative() {
        let leaf: LeafNode<u64, u64> = LeafNode {
            base: PhysicalPtr(9),
            deltas: vec![PhysicalPtr(3)],
            entries: vec![(10, 100), (20, 200)],
            low_key: 10,
            high_key: Some(30),
            right_link: LogicalPtr(7),
        };
        let buf = leaf.enc();
        let mut expect = vec![2u8];
        expect.extend_from_slice(&2u64.to_le_bytes());
        for (k, v) in [(10u64, 100u64), (20, 200)] {
            expect.extend_from_slice(&k.to_le_bytes());
            expect.extend_from_slice(&v.to_le_bytes());
        }
        expect.extend_from_slice(&10u64.to_le_bytes());
        expect.push(1);
        expect.extend_from_slice(&30u64.to_le_bytes());
        expect.extend_from_slice(&7u64.to_le_bytes());
        assert_eq!(buf, expect);
        // client-side bookkeeping must not hit the wire
        let back = extract!(Block::<u64, u64>::dec(&buf, PhysicalPtr(42)), Block::Leaf(l) => l);
        assert_eq!(back.base, PhysicalPtr(42));
        assert!(back.deltas.is_empty());
        assert_eq!(back.entries, leaf.entries);
    }

    #[test]
    fn merge_delta_field_order() {
        let md: MergeDelta<u64> = MergeDelta {
            next: PhysicalPtr(1),
            rmdelta: LogicalPtr(2),
            rmdelta_pptr: PhysicalPtr(3),
            rm_next: PhysicalPtr(4),
            right_low_key: 5,
            level: 1,
        };
        let buf = md.enc();
        // tag, right_low_key, rmdelta, rmdeltapptr, next, rm_next, level
        assert_eq!(buf[0], 7);
        assert_eq!(&buf[1..9], &5u64.to_le_bytes());
        assert_eq!(&buf[9..17], &2u64.to_le_bytes());
        assert_eq!(&buf[17..25], &3u64.to_le_bytes());
        assert_eq!(&buf[25..33], &1u64.to_le_bytes());
        assert_eq!(&buf[33..41], &4u64.to_le_bytes());
        assert_eq!(buf[41], 1);
        let back = extract!(Block::<u64, u64>::dec(&buf, PhysicalPtr(0)), Block::Merge(m) => m);
        assert_eq!(back.rm_next, PhysicalPtr(4));
        assert_eq!(back.right_low_key, 5);
    }

    #[test]
    fn string_keys_use_u64_lengths() {
        let d: DeleteDelta<String> = DeleteDelta {
            key: "abc".into(),
            next: PhysicalPtr(11),
        };
        let buf = d.enc();
        assert_eq!(buf[0], 4);
        assert_eq!(&buf[1..9], &3u64.to_le_bytes());
        assert_eq!(&buf[9..12], b"abc");
        let back = extract!(Block::<String, Vec<u8>>::dec(&buf, PhysicalPtr(0)), Block::Delete(d) => d);
        assert_eq!(back.key, "abc");
        assert_eq!(back.next, PhysicalPtr(11));
    }
}
