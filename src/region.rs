//! Carving raw memory into fixed-stride chunks.
//!
//! A region holds `count` slots of `HEADER_SIZE + class.payload()` bytes each, laid end to end:
//!
//! ```text
//! | header 0 | payload 0 ........ | header 1 | payload 1 ........ | ... | (unused tail) |
//! ```
//!
//! Node indices `0..count` name chunks; `count` and `count + 1` name the two sentinels, which
//! live in the region struct rather than in carved memory, because a sentinel has no payload.

use std::ops::Range;
use std::ptr::NonNull;

use crate::list::{ChunkList, LinkStore, Links};
use crate::{HEADER_SIZE, SizeClass};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Free = 0,
    Allocated = 1,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ChunkHeader {
    pub links: Links,
    /// Bumped on every release, so handles to earlier lives of this chunk go stale.
    pub generation: u32,
    pub class: SizeClass,
    pub state: ChunkState,
    _pad: [u8; 2],
}

const _: () = assert!(size_of::<ChunkHeader>() == HEADER_SIZE);
const _: () = assert!(SizeClass::Small.stride() % 16 == 0 && SizeClass::Large.stride() % 16 == 0);

/// Sentinel slots, relative to `count`.
pub const FREE_SENTINEL: u32 = 0;
pub const ALLOCATED_SENTINEL: u32 = 1;

/// The most chunks one region may hold: two node indices are kept back for the sentinels.
pub const MAX_CHUNKS: usize = (u32::MAX - 2) as usize;

/// How many chunks of `class` fit into `bytes`. Leftover bytes are padding.
pub const fn chunks_in(class: SizeClass, bytes: usize) -> usize {
    bytes / class.stride()
}

#[derive(Debug)]
pub struct Region {
    class: SizeClass,
    base: NonNull<u8>,
    count: u32,
    sentinels: [Links; 2],
}

// A region is only ever reached through the arena that owns it, and the allocator decides which
// thread may touch which arena.
unsafe impl Send for Region {}

impl Region {
    /// Describe `bytes` bytes at `raw` as a region of `class` chunks. Nothing is written until
    /// `carve`.
    ///
    /// # Safety
    ///
    /// `raw` must be 16-byte aligned and valid for reads and writes of `bytes` bytes for as long
    /// as the region is used.
    pub unsafe fn new(class: SizeClass, raw: NonNull<u8>, bytes: usize) -> Self {
        debug_assert!(raw.as_ptr().addr() % 16 == 0, "raw: {raw:?}");
        let count = chunks_in(class, bytes);
        assert!(count <= MAX_CHUNKS, "{count} chunks of {class} do not fit in one region");

        Self { class, base: raw, count: count as u32, sentinels: [Links::default(); 2] }
    }

    /// A region with no chunks at all, for arenas that own no memory.
    pub fn unbacked(class: SizeClass) -> Self {
        Self { class, base: NonNull::dangling(), count: 0, sentinels: [Links::default(); 2] }
    }

    /// Write a header in front of every slot and append each chunk to `list`.
    pub fn carve(&mut self, list: ChunkList) {
        for i in 0..self.count {
            unsafe {
                self.header(i).write(ChunkHeader {
                    links: Links { prev: i, next: i },
                    generation: 0,
                    class: self.class,
                    state: ChunkState::Free,
                    _pad: [0; 2],
                });
            }
            list.push_back(self, i);
        }
    }

    pub fn class(&self) -> SizeClass {
        self.class
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn sentinel(&self, which: u32) -> u32 {
        self.count + which
    }

    /// Address range covered by the carved slots (headers included, padding excluded).
    pub fn bounds(&self) -> Range<usize> {
        let start = self.base.as_ptr().addr();
        start..start + self.count as usize * self.class.stride()
    }

    #[inline(always)]
    fn header(&self, index: u32) -> *mut ChunkHeader {
        debug_assert!(index < self.count);
        unsafe { self.base.as_ptr().add(index as usize * self.class.stride()).cast::<ChunkHeader>() }
    }

    #[inline(always)]
    pub fn payload(&self, index: u32) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked(self.header(index).cast::<u8>().add(HEADER_SIZE)) }
    }

    /// Map a payload address back to its chunk index. `None` unless `addr` is exactly the first
    /// payload byte of one of our chunks.
    pub fn index_of_payload(&self, addr: usize) -> Option<u32> {
        let bounds = self.bounds();
        if !bounds.contains(&addr) {
            return None;
        }
        let offset = addr - bounds.start;
        let stride = self.class.stride();
        if offset % stride != HEADER_SIZE {
            return None;
        }
        Some((offset / stride) as u32)
    }

    #[inline(always)]
    pub fn read(&self, index: u32) -> ChunkHeader {
        unsafe { self.header(index).read() }
    }

    #[inline(always)]
    pub fn set_state(&mut self, index: u32, state: ChunkState) {
        unsafe { (*self.header(index)).state = state };
    }

    /// Wraps to zero after 2^32 releases of one chunk, so a handle that old matches again.
    #[inline(always)]
    pub fn bump_generation(&mut self, index: u32) {
        unsafe {
            let h = self.header(index);
            (*h).generation = (*h).generation.wrapping_add(1);
        }
    }

    #[cfg(test)]
    pub fn set_generation(&mut self, index: u32, generation: u32) {
        unsafe { (*self.header(index)).generation = generation };
    }
}

impl LinkStore for Region {
    #[inline(always)]
    fn links(&self, node: u32) -> Links {
        if node < self.count {
            unsafe { (*self.header(node)).links }
        } else {
            self.sentinels[(node - self.count) as usize]
        }
    }

    #[inline(always)]
    fn set_links(&mut self, node: u32, links: Links) {
        if node < self.count {
            unsafe { (*self.header(node)).links = links };
        } else {
            self.sentinels[(node - self.count) as usize] = links;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::tests::assert_well_formed;
    use crate::platformalloc::Reservation;

    #[test]
    fn chunk_counts_truncate() {
        assert_eq!(chunks_in(SizeClass::Small, 0), 0);
        assert_eq!(chunks_in(SizeClass::Small, 79), 0);
        assert_eq!(chunks_in(SizeClass::Small, 80), 1);
        assert_eq!(chunks_in(SizeClass::Small, 12_000), 150);
        assert_eq!(chunks_in(SizeClass::Large, 12_000), 11);
        assert_eq!(chunks_in(SizeClass::Small, 138_336), 1729);
        assert_eq!(chunks_in(SizeClass::Large, 138_336), 133);
    }

    #[test]
    fn carve_appends_every_slot_in_address_order() {
        let r = Reservation::new(12_000).unwrap();
        let mut region = unsafe { Region::new(SizeClass::Small, r.base(), 12_000) };
        let sentinel = region.sentinel(FREE_SENTINEL);
        let free = ChunkList::create_empty(&mut region, sentinel);
        region.carve(free);

        assert_eq!(region.count(), 150);
        assert_eq!(free.len(&region), 150);
        assert_eq!(free.iter(&region).collect::<Vec<_>>(), (0..150).collect::<Vec<_>>());
        assert_well_formed(free, &region);

        for i in [0, 1, 75, 149] {
            let h = region.read(i);
            assert_eq!(h.class, SizeClass::Small);
            assert_eq!(h.state, ChunkState::Free);
            assert_eq!(h.generation, 0);
        }
    }

    #[test]
    fn payloads_follow_their_headers_and_map_back() {
        let r = Reservation::new(12_000).unwrap();
        let mut region = unsafe { Region::new(SizeClass::Large, r.base(), 12_000) };
        let sentinel = region.sentinel(FREE_SENTINEL);
        let free = ChunkList::create_empty(&mut region, sentinel);
        region.carve(free);

        let base = r.base().as_ptr().addr();
        for i in 0..region.count() {
            let p = region.payload(i).as_ptr().addr();
            assert_eq!(p, base + i as usize * SizeClass::Large.stride() + HEADER_SIZE);
            assert_eq!(p % 16, 0);
            assert_eq!(region.index_of_payload(p), Some(i));
            // Anything but the first payload byte is not a chunk.
            assert_eq!(region.index_of_payload(p + 1), None);
            assert_eq!(region.index_of_payload(p - HEADER_SIZE), None);
        }
        assert_eq!(region.index_of_payload(region.bounds().end + HEADER_SIZE), None);
        assert_eq!(region.index_of_payload(base.wrapping_sub(64)), None);
    }

    #[test]
    fn unbacked_region_is_empty() {
        let mut region = Region::unbacked(SizeClass::Large);
        let sentinel = region.sentinel(FREE_SENTINEL);
        let free = ChunkList::create_empty(&mut region, sentinel);
        region.carve(free);
        assert!(free.is_empty(&region));
        assert!(region.bounds().is_empty());
        assert_eq!(region.index_of_payload(region.bounds().start + HEADER_SIZE), None);
    }

    #[test]
    fn generation_wraps_to_zero() {
        let r = Reservation::new(12_000).unwrap();
        let mut region = unsafe { Region::new(SizeClass::Small, r.base(), 12_000) };
        let sentinel = region.sentinel(FREE_SENTINEL);
        let free = ChunkList::create_empty(&mut region, sentinel);
        region.carve(free);

        region.set_generation(7, u32::MAX - 1);
        region.bump_generation(7);
        assert_eq!(region.read(7).generation, u32::MAX);
        region.bump_generation(7);
        assert_eq!(region.read(7).generation, 0);
        // Neighbours are untouched.
        assert_eq!(region.read(6).generation, 0);
        assert_eq!(region.read(8).generation, 0);
    }
}
