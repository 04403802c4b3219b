// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A sparse, address-ordered `(address -> byte)` map. Backed by a flat
//! `Vec<(u64, u8)>` kept in ascending order rather than a tree: block scans
//! (the operation the BSL client leans on hardest, once per write/read/CRC
//! pass) are a linear walk over that vector, and binary search gives the
//! point lookups their `O(log n)`.

use crate::error::{BslError, Result};

/// Entries are never allowed past this many, regardless of how the backing
/// buffer grows; keeps a malformed import from exhausting memory.
const HARD_CAP: usize = 50 * 1024 * 1024;

/// Buffer growth factor applied when `add` needs more capacity.
const GROWTH_FACTOR: f64 = 1.5;

/// Shrink the backing buffer when occupancy drops below `capacity / SHRINK_MARGIN`.
const SHRINK_MARGIN: usize = 4;

#[derive(Debug, Clone, Default)]
pub struct MemoryImage {
    entries: Vec<(u64, u8)>,
}

impl MemoryImage {
    pub fn new() -> Self {
        MemoryImage { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    /// Position of `addr`, or the position of its least upper bound
    /// (insertion point) if absent.
    pub fn find_index(&self, addr: u64) -> (bool, usize) {
        match self.entries.binary_search_by_key(&addr, |(a, _)| *a) {
            Ok(idx) => (true, idx),
            Err(idx) => (false, idx),
        }
    }

    pub fn get(&self, addr: u64) -> Option<u8> {
        let (found, idx) = self.find_index(addr);
        if found {
            Some(self.entries[idx].1)
        } else {
            None
        }
    }

    /// Inserts or overwrites a single byte. Fails only when the image is
    /// already at `HARD_CAP` entries and `addr` is not already present.
    pub fn add(&mut self, addr: u64, val: u8) -> Result<()> {
        let (found, idx) = self.find_index(addr);
        if found {
            self.entries[idx].1 = val;
            return Ok(());
        }
        if self.entries.len() >= HARD_CAP {
            return Err(BslError::ImageCapacityExceeded);
        }
        self.grow_if_needed();
        self.entries.insert(idx, (addr, val));
        Ok(())
    }

    fn grow_if_needed(&mut self) {
        if self.entries.len() == self.entries.capacity() {
            let new_cap = ((self.entries.capacity() as f64 * GROWTH_FACTOR) as usize)
                .max(self.entries.capacity() + 1);
            self.entries.reserve(new_cap - self.entries.capacity());
        }
    }

    fn shrink_if_sparse(&mut self) {
        if self.entries.capacity() > 0
            && self.entries.len() < self.entries.capacity() / SHRINK_MARGIN
        {
            self.entries.shrink_to_fit();
        }
    }

    pub fn delete(&mut self, addr: u64) -> bool {
        let (found, idx) = self.find_index(addr);
        if found {
            self.entries.remove(idx);
            self.shrink_if_sparse();
        }
        found
    }

    /// Adds/overwrites every address in the closed range `[a0, a1]` with `val`.
    pub fn fill(&mut self, a0: u64, a1: u64, val: u8) -> Result<()> {
        check_range(a0, a1)?;
        for addr in a0..=a1 {
            self.add(addr, val)?;
        }
        Ok(())
    }

    /// Adds/overwrites `[a0, a1]` with bytes drawn from a caller-supplied
    /// source, so test code (and callers without an RNG dependency) can
    /// plug in whatever source of randomness it likes.
    pub fn fill_with(&mut self, a0: u64, a1: u64, mut source: impl FnMut() -> u8) -> Result<()> {
        check_range(a0, a1)?;
        for addr in a0..=a1 {
            self.add(addr, source())?;
        }
        Ok(())
    }

    /// Deletes every entry outside `[a0, a1]`.
    pub fn clip(&mut self, a0: u64, a1: u64) -> Result<()> {
        check_range(a0, a1)?;
        self.entries.retain(|(addr, _)| *addr >= a0 && *addr <= a1);
        self.shrink_if_sparse();
        Ok(())
    }

    /// Deletes every entry inside `[a0, a1]`.
    pub fn cut(&mut self, a0: u64, a1: u64) -> Result<()> {
        check_range(a0, a1)?;
        self.entries.retain(|(addr, _)| *addr < a0 || *addr > a1);
        self.shrink_if_sparse();
        Ok(())
    }

    /// Copies entries in `[src0, src1]` to `dst0 + (addr - src0)`, leaving
    /// the source range intact. Defined, as the source range may overlap
    /// the destination, as "snapshot the source, then write" rather than
    /// an in-place shift.
    pub fn copy(&mut self, src0: u64, src1: u64, dst0: u64) -> Result<()> {
        check_range(src0, src1)?;
        let snapshot: Vec<(u64, u8)> = self
            .entries
            .iter()
            .filter(|(a, _)| *a >= src0 && *a <= src1)
            .copied()
            .collect();
        for (addr, val) in snapshot {
            self.add(dst0 + (addr - src0), val)?;
        }
        Ok(())
    }

    /// Moves entries in `[src0, src1]`: copies them to `dst0`, then deletes
    /// the source range. Matches `copy`'s "snapshot, then delete, then
    /// insert" semantics for overlapping source/destination.
    pub fn move_range(&mut self, src0: u64, src1: u64, dst0: u64) -> Result<()> {
        check_range(src0, src1)?;
        let snapshot: Vec<(u64, u8)> = self
            .entries
            .iter()
            .filter(|(a, _)| *a >= src0 && *a <= src1)
            .copied()
            .collect();
        self.cut(src0, src1)?;
        for (addr, val) in snapshot {
            self.add(dst0 + (addr - src0), val)?;
        }
        Ok(())
    }

    /// Merges `other` into `self`. Source wins: for addresses present in
    /// both, `other`'s value overwrites `self`'s; addresses absent from
    /// `other` are left untouched.
    pub fn merge(&mut self, other: &MemoryImage) -> Result<()> {
        for &(addr, val) in &other.entries {
            self.add(addr, val)?;
        }
        Ok(())
    }

    /// Scans forward from `from_addr` (inclusive) to the next maximal run
    /// of consecutive addresses, returning the inclusive `[i_start, i_end]`
    /// index range into the entry list.
    pub fn next_block(&self, from_addr: u64) -> Option<(usize, usize)> {
        let (found, idx) = self.find_index(from_addr);
        let start = if found { idx } else { idx };
        if start >= self.entries.len() {
            return None;
        }
        let mut end = start;
        while end + 1 < self.entries.len()
            && self.entries[end + 1].0 == self.entries[end].0 + 1
        {
            end += 1;
        }
        Some((start, end))
    }

    /// Iterates every maximal block as `(start_addr, end_addr_inclusive)`.
    pub fn blocks(&self) -> BlockIter<'_> {
        BlockIter {
            image: self,
            next_from: Some(0),
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (u64, u8)> + '_ {
        self.entries.iter().copied()
    }

    pub fn entry_slice(&self, i_start: usize, i_end: usize) -> &[(u64, u8)] {
        &self.entries[i_start..=i_end]
    }

    /// IEEE 802.3 CRC-32: polynomial `0xEDB88320` (reversed), initial
    /// `0xFFFF_FFFF`, final XOR `0xFFFF_FFFF`, byte-at-a-time. Address
    /// bytes are not part of the digest, only data — matching the target's
    /// on-chip CRC routine, which sees only the flash contents.
    pub fn crc32(&self, i_start: usize, i_end: usize) -> u32 {
        let table = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
        let mut digest = table.digest();
        for &(_, val) in &self.entries[i_start..=i_end] {
            digest.update(&[val]);
        }
        digest.finalize()
    }
}

pub struct BlockIter<'a> {
    image: &'a MemoryImage,
    next_from: Option<u64>,
}

impl<'a> Iterator for BlockIter<'a> {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        let from = self.next_from?;
        let (i_start, i_end) = self.image.next_block(from)?;
        let start_addr = self.image.entries[i_start].0;
        let end_addr = self.image.entries[i_end].0;
        self.next_from = end_addr.checked_add(1);
        Some((start_addr, end_addr))
    }
}

fn check_range(a0: u64, a1: u64) -> Result<()> {
    if a0 > a1 {
        return Err(BslError::RangeInverted { start: a0, stop: a1 });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_invariant_holds_after_adds() {
        let mut img = MemoryImage::new();
        for addr in [0x9000u64, 0x8000, 0x8500, 0x8001] {
            img.add(addr, 0).unwrap();
        }
        let addrs: Vec<u64> = img.entries().map(|(a, _)| a).collect();
        let mut sorted = addrs.clone();
        sorted.sort();
        assert_eq!(addrs, sorted);
    }

    #[test]
    fn e1_next_block_scenario() {
        let mut img = MemoryImage::new();
        img.add(0x8000, 0xAA).unwrap();
        img.add(0x8001, 0xBB).unwrap();
        img.add(0x9000, 0xCC).unwrap();

        let (s, e) = img.next_block(0).unwrap();
        assert_eq!((img.entries[s].0, img.entries[e].0), (0x8000, 0x8001));

        let (s, e) = img.next_block(0x8002).unwrap();
        assert_eq!((img.entries[s].0, img.entries[e].0), (0x9000, 0x9000));
    }

    #[test]
    fn blocks_iterator_covers_and_partitions_image() {
        let mut img = MemoryImage::new();
        for a in 0x10u64..0x15 {
            img.add(a, 1).unwrap();
        }
        for a in 0x20u64..0x22 {
            img.add(a, 2).unwrap();
        }
        let collected: Vec<(u64, u64)> = img.blocks().collect();
        assert_eq!(collected, vec![(0x10, 0x14), (0x20, 0x21)]);
    }

    #[test]
    fn fill_is_idempotent() {
        let mut a = MemoryImage::new();
        a.fill(0x100, 0x110, 0x5A).unwrap();
        let mut b = a.clone();
        b.fill(0x100, 0x110, 0x5A).unwrap();
        let av: Vec<_> = a.entries().collect();
        let bv: Vec<_> = b.entries().collect();
        assert_eq!(av, bv);
    }

    #[test]
    fn clip_keeps_only_inside_range() {
        let mut img = MemoryImage::new();
        img.fill(0, 10, 1).unwrap();
        img.clip(3, 6).unwrap();
        let addrs: Vec<u64> = img.entries().map(|(a, _)| a).collect();
        assert_eq!(addrs, vec![3, 4, 5, 6]);
    }

    #[test]
    fn cut_removes_only_inside_range() {
        let mut img = MemoryImage::new();
        img.fill(0, 10, 1).unwrap();
        img.cut(3, 6).unwrap();
        let addrs: Vec<u64> = img.entries().map(|(a, _)| a).collect();
        assert_eq!(addrs, vec![0, 1, 2, 7, 8, 9, 10]);
    }

    #[test]
    fn copy_leaves_source_intact() {
        let mut img = MemoryImage::new();
        img.fill(0x10, 0x12, 0x42).unwrap();
        img.copy(0x10, 0x12, 0x100).unwrap();
        assert_eq!(img.get(0x10), Some(0x42));
        assert_eq!(img.get(0x100), Some(0x42));
        assert_eq!(img.get(0x102), Some(0x42));
    }

    #[test]
    fn move_range_deletes_source() {
        let mut img = MemoryImage::new();
        img.fill(0x10, 0x12, 0x42).unwrap();
        img.move_range(0x10, 0x12, 0x100).unwrap();
        assert_eq!(img.get(0x10), None);
        assert_eq!(img.get(0x100), Some(0x42));
    }

    #[test]
    fn merge_source_wins() {
        let mut a = MemoryImage::new();
        a.add(0x10, 1).unwrap();
        let mut b = MemoryImage::new();
        b.add(0x10, 2).unwrap();
        b.add(0x11, 3).unwrap();
        a.merge(&b).unwrap();
        assert_eq!(a.get(0x10), Some(2));
        assert_eq!(a.get(0x11), Some(3));
    }

    #[test]
    fn inverted_range_is_an_error() {
        let mut img = MemoryImage::new();
        assert!(matches!(
            img.fill(10, 5, 0),
            Err(BslError::RangeInverted { start: 10, stop: 5 })
        ));
    }

    #[test]
    fn e4_crc32_of_ascii_digits() {
        let mut img = MemoryImage::new();
        for (i, b) in b"123456789".iter().enumerate() {
            img.add(i as u64, *b).unwrap();
        }
        assert_eq!(img.crc32(0, img.len() - 1), 0xCBF43926);
    }
}
