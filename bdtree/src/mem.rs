/*
 * Created on Fri Jan 12 2024
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

#[derive(Debug, PartialEq)]
/// A bounds-checked cursor over a byte buffer, used by the wire decoder
pub struct Scanner<'a> {
    d: &'a [u8],
    __cursor: usize,
}

impl<'a> Scanner<'a> {
    /// Create a new scanner, starting at position 0
    pub const fn new(d: &'a [u8]) -> Self {
        Self { d, __cursor: 0 }
    }
    pub const fn buffer_len(&self) -> usize {
        self.d.len()
    }
    /// Returns the remaining number of bytes
    pub const fn remaining(&self) -> usize {
        self.buffer_len() - self.__cursor
    }
    pub const fn cursor(&self) -> usize {
        self.__cursor
    }
    /// Returns true if the scanner has reached eof
    pub const fn eof(&self) -> bool {
        self.remaining() == 0
    }
    /// Returns true if the scanner has atleast `sizeof` bytes remaining
    pub const fn has_left(&self, sizeof: usize) -> bool {
        self.remaining() >= sizeof
    }
}

impl<'a> Scanner<'a> {
    pub fn next_byte(&mut self) -> Option<u8> {
        if self.eof() {
            return None;
        }
        let b = self.d[self.__cursor];
        self.__cursor += 1;
        Some(b)
    }
    pub fn next_u64_le(&mut self) -> Option<u64> {
        self.next_chunk().map(u64::from_le_bytes)
    }
    pub fn next_i64_le(&mut self) -> Option<i64> {
        self.next_chunk().map(i64::from_le_bytes)
    }
    pub fn next_u32_le(&mut self) -> Option<u32> {
        self.next_chunk().map(u32::from_le_bytes)
    }
    pub fn next_i32_le(&mut self) -> Option<i32> {
        self.next_chunk().map(i32::from_le_bytes)
    }
    pub fn next_i8(&mut self) -> Option<i8> {
        self.next_byte().map(|b| b as i8)
    }
    /// Read the next `n` bytes as a subslice, advancing the cursor
    pub fn next_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if !self.has_left(n) {
            return None;
        }
        let r = &self.d[self.__cursor..self.__cursor + n];
        self.__cursor += n;
        Some(r)
    }
    fn next_chunk<const N: usize>(&mut self) -> Option<[u8; N]> {
        let mut chunk = [0u8; N];
        chunk.copy_from_slice(self.next_bytes(N)?);
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::Scanner;

    #[test]
    fn scan_mixed() {
        let mut buf = vec![7u8];
        buf.extend_from_slice(&0xDEAD_BEEFu64.to_le_bytes());
        buf.extend_from_slice(b"tail");
        let mut sc = Scanner::new(&buf);
        assert_eq!(sc.next_byte(), Some(7));
        assert_eq!(sc.next_u64_le(), Some(0xDEAD_BEEF));
        assert_eq!(sc.next_bytes(4), Some(&b"tail"[..]));
        assert!(sc.eof());
        assert_eq!(sc.next_byte(), None);
    }

    #[test]
    fn scan_short_read() {
        let buf = [1u8, 2, 3];
        let mut sc = Scanner::new(&buf);
        assert_eq!(sc.next_u64_le(), None);
        // a failed read must not move the cursor
        assert_eq!(sc.cursor(), 0);
        assert_eq!(sc.next_bytes(3), Some(&[1u8, 2, 3][..]));
    }
}
