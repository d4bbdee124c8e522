//! Arenas: one reservation split between a small pool and a large pool, each with a free list and
//! an allocated list.

use std::ops::Range;
use std::ptr::NonNull;

use crate::error::{InitError, ReleaseError};
use crate::list::{ChunkList, unlink};
use crate::platformalloc::Reservation;
use crate::region::{ALLOCATED_SENTINEL, ChunkState, FREE_SENTINEL, Region};
use crate::{ArenaId, SizeClass};

/// One size class worth of chunks. Every carved chunk is on exactly one of the two lists.
#[derive(Debug)]
pub struct Pool {
    region: Region,
    free: ChunkList,
    allocated: ChunkList,
}

/// A chunk just moved to the allocated list.
#[derive(Debug, Clone, Copy)]
pub struct Taken {
    pub index: u32,
    pub generation: u32,
    pub payload: NonNull<u8>,
}

impl Pool {
    /// # Safety
    ///
    /// Same contract as `Region::new`.
    unsafe fn carve(class: SizeClass, raw: NonNull<u8>, bytes: usize) -> Self {
        Self::from_region(unsafe { Region::new(class, raw, bytes) })
    }

    fn unbacked(class: SizeClass) -> Self {
        Self::from_region(Region::unbacked(class))
    }

    fn from_region(mut region: Region) -> Self {
        let free_sentinel = region.sentinel(FREE_SENTINEL);
        let allocated_sentinel = region.sentinel(ALLOCATED_SENTINEL);
        let free = ChunkList::create_empty(&mut region, free_sentinel);
        let allocated = ChunkList::create_empty(&mut region, allocated_sentinel);
        region.carve(free);

        Self { region, free, allocated }
    }

    pub fn class(&self) -> SizeClass {
        self.region.class()
    }

    pub fn capacity(&self) -> u32 {
        self.region.count()
    }

    /// Move the front free chunk to the front of the allocated list.
    #[inline(always)]
    pub fn take(&mut self) -> Option<Taken> {
        if self.free.is_empty(&self.region) {
            return None;
        }
        let index = self.free.pop_front(&mut self.region)?;
        self.allocated.push_front(&mut self.region, index);
        self.region.set_state(index, ChunkState::Allocated);

        Some(Taken { index, generation: self.region.read(index).generation, payload: self.region.payload(index) })
    }

    /// Return chunk `index` to the front of the free list. `generation` must be the one handed
    /// out by the `take` that allocated it.
    #[inline(always)]
    pub fn give_back(&mut self, arena: ArenaId, index: u32, generation: u32) -> Result<(), ReleaseError> {
        let class = self.class();
        if index >= self.region.count() {
            return Err(ReleaseError::OutOfRange { arena, class, index });
        }
        let header = self.region.read(index);
        if header.generation != generation {
            return Err(ReleaseError::Stale { arena, class, index, held: generation, current: header.generation });
        }
        if header.state != ChunkState::Allocated {
            return Err(ReleaseError::NotAllocated { arena, class, index });
        }
        debug_assert_eq!(header.class, class);

        unlink(&mut self.region, index);
        self.region.set_state(index, ChunkState::Free);
        self.region.bump_generation(index);
        self.free.push_front(&mut self.region, index);
        Ok(())
    }

    pub fn payload_of(&self, index: u32) -> Option<NonNull<u8>> {
        (index < self.region.count()).then(|| self.region.payload(index))
    }

    /// Address range of the carved slots. Fixed for the life of the pool.
    pub fn bounds(&self) -> Range<usize> {
        self.region.bounds()
    }

    /// The index and current generation of the chunk whose payload starts at `addr`.
    pub fn locate(&self, addr: usize) -> Option<(u32, u32)> {
        let index = self.region.index_of_payload(addr)?;
        Some((index, self.region.read(index).generation))
    }

    /// Whether `addr` falls anywhere inside this pool's carved slots.
    #[cfg(test)]
    pub fn owns(&self, addr: usize) -> bool {
        self.bounds().contains(&addr)
    }

    /// Walks both lists. O(capacity).
    pub fn census(&self) -> ClassCensus {
        ClassCensus {
            carved: self.region.count() as usize,
            free: self.free.len(&self.region),
            allocated: self.allocated.len(&self.region),
        }
    }

    #[cfg(test)]
    pub(crate) fn lists(&self) -> (ChunkList, ChunkList, &Region) {
        (self.free, self.allocated, &self.region)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClassCensus {
    pub carved: usize,
    pub free: usize,
    pub allocated: usize,
}

impl ClassCensus {
    /// Every carved chunk is on exactly one list.
    pub fn is_conserved(&self) -> bool {
        self.free + self.allocated == self.carved
    }
}

/// Point-in-time chunk counts for one arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaCensus {
    pub arena: ArenaId,
    pub small: ClassCensus,
    pub large: ClassCensus,
}

impl ArenaCensus {
    pub fn class(&self, class: SizeClass) -> ClassCensus {
        match class {
            SizeClass::Small => self.small,
            SizeClass::Large => self.large,
        }
    }
}

#[derive(Debug)]
pub struct Arena {
    id: ArenaId,
    small: Pool,
    large: Pool,
    // Declared last: the pools point into it.
    _reservation: Option<Reservation>,
}

/// Bytes given to each class when an arena of `bytes` bytes is split in half. Rounded down so the
/// large half starts 16-byte aligned.
pub const fn half_of(bytes: usize) -> usize {
    bytes / 2 / 16 * 16
}

impl Arena {
    /// Reserve `bytes` bytes and carve them half and half into a small and a large pool.
    pub fn reserve(id: ArenaId, bytes: usize, role: &'static str) -> Result<Self, InitError> {
        if bytes == 0 {
            return Ok(Self::unbacked(id));
        }
        let reservation = Reservation::new(bytes).map_err(|source| InitError::Reserve { role, bytes, source })?;
        let half = half_of(bytes);
        let base = reservation.base();

        // The reservation is at least `bytes` long and page aligned, and `half` is a multiple of 16.
        let small = unsafe { Pool::carve(SizeClass::Small, base, half) };
        let large = unsafe { Pool::carve(SizeClass::Large, base.add(half), half) };
        log::trace!(
            "{id}: carved {} small and {} large chunks from {} reserved bytes",
            small.capacity(),
            large.capacity(),
            reservation.len()
        );

        Ok(Self { id, small, large, _reservation: Some(reservation) })
    }

    /// An arena with no chunks; every request against it misses.
    pub fn unbacked(id: ArenaId) -> Self {
        Self {
            id,
            small: Pool::unbacked(SizeClass::Small),
            large: Pool::unbacked(SizeClass::Large),
            _reservation: None,
        }
    }

    pub fn pool(&self, class: SizeClass) -> &Pool {
        match class {
            SizeClass::Small => &self.small,
            SizeClass::Large => &self.large,
        }
    }

    #[cfg(test)]
    pub fn pool_mut(&mut self, class: SizeClass) -> &mut Pool {
        match class {
            SizeClass::Small => &mut self.small,
            SizeClass::Large => &mut self.large,
        }
    }

    /// Project to one pool without forming a reference to the whole arena, so the two pools can
    /// be handed to different lock holders.
    ///
    /// # Safety
    ///
    /// `arena` must point to a live `Arena`.
    #[inline(always)]
    pub unsafe fn pool_ptr(arena: *mut Arena, class: SizeClass) -> *mut Pool {
        match class {
            SizeClass::Small => unsafe { &raw mut (*arena).small },
            SizeClass::Large => unsafe { &raw mut (*arena).large },
        }
    }

    /// Which pool, chunk and generation the payload at `addr` belongs to.
    #[cfg(test)]
    pub fn locate(&self, addr: usize) -> Option<(SizeClass, u32, u32)> {
        SizeClass::ALL.into_iter().find_map(|class| {
            let (index, generation) = self.pool(class).locate(addr)?;
            Some((class, index, generation))
        })
    }

    pub fn census(&self) -> ArenaCensus {
        ArenaCensus { arena: self.id, small: self.small.census(), large: self.large.census() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::tests::assert_well_formed;

    fn assert_lists_well_formed(pool: &Pool) {
        let (free, allocated, region) = pool.lists();
        assert_well_formed(free, region);
        assert_well_formed(allocated, region);
    }

    #[test]
    fn split_in_half() {
        let a = Arena::reserve(ArenaId::Thread(0), 24_000, "test").unwrap();
        let c = a.census();
        assert_eq!(c.small, ClassCensus { carved: 150, free: 150, allocated: 0 });
        assert_eq!(c.large, ClassCensus { carved: 11, free: 11, allocated: 0 });

        assert_eq!(half_of(276_672), 138_336);
        assert_eq!(half_of(33), 16);
        assert_eq!(half_of(31), 0);
    }

    #[test]
    fn pools_do_not_overlap() {
        let a = Arena::reserve(ArenaId::Thread(0), 24_000, "test").unwrap();
        let small = a.pool(SizeClass::Small).region.bounds();
        let large = a.pool(SizeClass::Large).region.bounds();
        assert!(small.end <= large.start);
        assert_eq!(large.start % 16, 0);
    }

    #[test]
    fn take_and_give_back_move_between_lists() {
        let mut a = Arena::reserve(ArenaId::Thread(3), 24_000, "test").unwrap();
        let pool = a.pool_mut(SizeClass::Small);

        let t = pool.take().unwrap();
        assert_eq!(t.index, 0);
        assert_eq!(t.generation, 0);
        assert_eq!(pool.census(), ClassCensus { carved: 150, free: 149, allocated: 1 });
        assert_lists_well_formed(pool);

        pool.give_back(ArenaId::Thread(3), t.index, t.generation).unwrap();
        assert_eq!(pool.census(), ClassCensus { carved: 150, free: 150, allocated: 0 });
        assert_lists_well_formed(pool);

        // Released chunks go to the front, so the same chunk comes straight back, one generation on.
        let again = pool.take().unwrap();
        assert_eq!(again.index, t.index);
        assert_eq!(again.payload, t.payload);
        assert_eq!(again.generation, 1);
    }

    #[test]
    fn exhaust_then_miss() {
        let mut a = Arena::reserve(ArenaId::Thread(0), 24_000, "test").unwrap();
        let pool = a.pool_mut(SizeClass::Large);
        let taken: Vec<_> = (0..11).map(|_| pool.take().unwrap()).collect();
        assert!(pool.take().is_none());
        assert_eq!(pool.census(), ClassCensus { carved: 11, free: 0, allocated: 11 });

        let mut payloads: Vec<_> = taken.iter().map(|t| t.payload.as_ptr().addr()).collect();
        payloads.sort_unstable();
        payloads.dedup();
        assert_eq!(payloads.len(), 11);
    }

    #[test]
    fn bad_give_backs_are_rejected_without_damage() {
        let id = ArenaId::Thread(1);
        let mut a = Arena::reserve(id, 24_000, "test").unwrap();
        let pool = a.pool_mut(SizeClass::Small);
        let t = pool.take().unwrap();

        assert_eq!(
            pool.give_back(id, 150, 0),
            Err(ReleaseError::OutOfRange { arena: id, class: SizeClass::Small, index: 150 })
        );
        assert_eq!(
            pool.give_back(id, 5, 0),
            Err(ReleaseError::NotAllocated { arena: id, class: SizeClass::Small, index: 5 })
        );

        pool.give_back(id, t.index, t.generation).unwrap();
        assert_eq!(
            pool.give_back(id, t.index, t.generation),
            Err(ReleaseError::Stale { arena: id, class: SizeClass::Small, index: t.index, held: 0, current: 1 })
        );
        assert_eq!(pool.census(), ClassCensus { carved: 150, free: 150, allocated: 0 });
        assert_lists_well_formed(pool);
    }

    #[test]
    fn locate_finds_payloads_only() {
        let mut a = Arena::reserve(ArenaId::Overflow, 24_000, "test").unwrap();
        let s = a.pool_mut(SizeClass::Small).take().unwrap();
        let l = a.pool_mut(SizeClass::Large).take().unwrap();

        assert_eq!(a.locate(s.payload.as_ptr().addr()), Some((SizeClass::Small, s.index, 0)));
        assert_eq!(a.locate(l.payload.as_ptr().addr()), Some((SizeClass::Large, l.index, 0)));
        assert_eq!(a.locate(s.payload.as_ptr().addr() + 8), None);
        assert!(a.pool(SizeClass::Small).owns(s.payload.as_ptr().addr() + 8));
    }

    #[test]
    fn unbacked_arena_always_misses() {
        let mut a = Arena::unbacked(ArenaId::Thread(0));
        assert!(a.pool_mut(SizeClass::Small).take().is_none());
        assert!(a.pool_mut(SizeClass::Large).take().is_none());
        assert_eq!(a.census().small, ClassCensus::default());
        assert!(a.census().large.is_conserved());
    }

    #[test]
    fn zero_bytes_reserves_nothing() {
        let a = Arena::reserve(ArenaId::Overflow, 0, "overflow").unwrap();
        assert_eq!(a.census().small.carved, 0);
        assert_eq!(a.census().large.carved, 0);
    }
}
