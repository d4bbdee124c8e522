//! A fixed-capacity, size-classed allocator.
//!
//! All memory is reserved up front in `Allocator::init` and never grows. Requests are served
//! from two size classes:
//!
//! ```text
//! class:   payload:   stride (header + payload):
//! Small         64        80
//! Large       1024      1040
//! ```
//!
//! Each arena's region is split in half, one half per class, and carved into chunks that sit on
//! intrusive free/allocated lists. Each thread binds its own arena the first time it allocates;
//! when that arena's free list for a class runs dry, the request falls back to a single shared
//! overflow arena. Anything larger than the Large payload is refused.

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Range;
use std::ptr::NonNull;

use parking_lot::{Mutex, MutexGuard};

mod arena;
mod binding;
mod config;
mod error;
mod list;
mod platformalloc;
mod region;
mod stats;


use arena::{Arena, Pool, Taken};
use binding::BindingTable;

pub use arena::{ArenaCensus, ClassCensus};
pub use config::{Config, DEFAULT_ARENA_BYTES, DEFAULT_MAX_THREADS, MAX_SUPPORTED_THREADS, Mode};
pub use error::{BindError, ConfigError, InitError, ReleaseError, ReserveFailed};
pub use platformalloc::page_size;
pub use stats::StatsSnapshot;

pub const SMALL_PAYLOAD: usize = 64;
pub const LARGE_PAYLOAD: usize = 1024;
/// Bytes of bookkeeping in front of every payload.
pub const HEADER_SIZE: usize = 16;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SizeClass {
    Small = 0,
    Large = 1,
}

impl SizeClass {
    pub const ALL: [SizeClass; 2] = [SizeClass::Small, SizeClass::Large];

    /// The smallest class that holds `size` bytes, or `None` if nothing does. Zero is Small.
    #[inline(always)]
    pub const fn of(size: usize) -> Option<Self> {
        if size <= SMALL_PAYLOAD {
            Some(Self::Small)
        } else if size <= LARGE_PAYLOAD {
            Some(Self::Large)
        } else {
            None
        }
    }

    pub const fn payload(self) -> usize {
        match self {
            Self::Small => SMALL_PAYLOAD,
            Self::Large => LARGE_PAYLOAD,
        }
    }

    pub const fn stride(self) -> usize {
        HEADER_SIZE + self.payload()
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Small => "small",
            Self::Large => "large",
        })
    }
}

/// Which arena a block came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArenaId {
    /// The private arena with this binding index.
    Thread(u16),
    /// The arena shared by every thread.
    Overflow,
}

impl fmt::Display for ArenaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread(i) => write!(f, "arena {i}"),
            Self::Overflow => f.write_str("overflow arena"),
        }
    }
}

/// An allocated chunk. Give it back with `Allocator::release`; dropping it leaks the chunk.
///
/// Staleness is tracked with a per-chunk `u32` generation that wraps. A handle kept across
/// exactly 2^32 releases of its chunk is taken for a live one.
#[must_use]
#[derive(Debug)]
pub struct Block<'a> {
    ptr: NonNull<u8>,
    arena: ArenaId,
    class: SizeClass,
    index: u32,
    generation: u32,
    _allocator: PhantomData<&'a Allocator>,
}

// Overflow blocks may be released from any thread; private ones are checked on release.
unsafe impl Send for Block<'_> {}

impl Block<'_> {
    fn new(taken: Taken, arena: ArenaId, class: SizeClass) -> Self {
        Self {
            ptr: taken.payload,
            arena,
            class,
            index: taken.index,
            generation: taken.generation,
            _allocator: PhantomData,
        }
    }

    /// First byte of the payload. 16-byte aligned, valid for `capacity()` bytes until released.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn capacity(&self) -> usize {
        self.class.payload()
    }

    pub fn class(&self) -> SizeClass {
        self.class
    }

    pub fn arena(&self) -> ArenaId {
        self.arena
    }
}

/// A block `try_release` would not take, handed back with the reason so it can still be
/// released by its owning thread.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct Refused<'a> {
    pub block: Block<'a>,
    pub error: ReleaseError,
}

pub struct Allocator {
    config: Config,
    arenas: Box<[UnsafeCell<Arena>]>,
    overflow: UnsafeCell<Arena>,
    // Address ranges of each arena's Small and Large slots, copied out at init so that pointer
    // lookups never read a pool another thread may be mutating.
    arena_bounds: Box<[[Range<usize>; 2]]>,
    overflow_bounds: [Range<usize>; 2],
    class_locks: [Mutex<()>; 2],
    global_lock: Mutex<()>,
    bindings: BindingTable,
    stats: stats::Stats,
}

// Private arenas are only reached by the one thread bound to them (or with `&mut self`); the
// overflow arena only under the lock its mode requires. In `Mode::None` the binding table admits
// exactly one thread, so nothing is ever shared.
unsafe impl Sync for Allocator {}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Allocator")
            .field("config", &self.config)
            .field("bound_threads", &self.bindings.bound())
            .field("binding_limit", &self.bindings.limit())
            .field("stats", &self.stats.snapshot())
            .finish_non_exhaustive()
    }
}

fn bounds_of(arena: &Arena) -> [Range<usize>; 2] {
    SizeClass::ALL.map(|class| arena.pool(class).bounds())
}

fn class_within(bounds: &[Range<usize>; 2], addr: usize) -> Option<SizeClass> {
    SizeClass::ALL.into_iter().find(|&class| bounds[class as usize].contains(&addr))
}

impl Allocator {
    /// Reserve and carve every region for `max_threads` threads with default region sizes.
    pub fn init(max_threads: usize, mode: Mode) -> Result<Self, InitError> {
        Self::with_config(Config::new(max_threads, mode))
    }

    pub fn with_config(config: Config) -> Result<Self, InitError> {
        config.validate()?;

        let overflow = Arena::reserve(ArenaId::Overflow, config.overflow_bytes, "overflow")?;

        let num_arenas = config.mode.binding_limit(config.max_threads);
        let arenas = (0..num_arenas)
            .map(|i| {
                let id = ArenaId::Thread(i as u16);
                if i < config.backed_arenas() {
                    Arena::reserve(id, config.arena_bytes, "arena")
                } else {
                    Ok(Arena::unbacked(id))
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        log::info!(
            "fixmalloc: {} mode, {} arenas ({} backed, {} bytes each), overflow {} bytes",
            config.mode,
            num_arenas,
            config.backed_arenas(),
            config.arena_bytes,
            config.overflow_bytes
        );

        Ok(Self {
            config,
            arena_bounds: arenas.iter().map(bounds_of).collect(),
            overflow_bounds: bounds_of(&overflow),
            arenas: arenas.into_iter().map(UnsafeCell::new).collect(),
            overflow: UnsafeCell::new(overflow),
            class_locks: [Mutex::new(()), Mutex::new(())],
            global_lock: Mutex::new(()),
            bindings: BindingTable::new(num_arenas),
            stats: stats::Stats::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The calling thread's arena, binding one if it has none yet.
    pub fn try_current_arena(&self) -> Result<ArenaId, BindError> {
        self.bind().map(|i| ArenaId::Thread(i as u16))
    }

    /// Like `try_current_arena`, but running out of arenas is fatal.
    pub fn current_arena(&self) -> ArenaId {
        ArenaId::Thread(self.bind_or_die() as u16)
    }

    /// Chunk counts for one arena, or `None` if there is no such arena.
    pub fn census(&mut self, arena: ArenaId) -> Option<ArenaCensus> {
        let cell = match arena {
            ArenaId::Thread(i) => self.arenas.get_mut(i as usize)?,
            ArenaId::Overflow => &mut self.overflow,
        };
        Some(cell.get_mut().census())
    }

    /// Hand out a chunk big enough for `size` bytes: from the calling thread's arena if it has
    /// one free, else from the overflow arena. `None` if `size` is over `LARGE_PAYLOAD` or both
    /// are exhausted.
    pub fn allocate(&self, size: usize) -> Option<Block<'_>> {
        let Some(class) = SizeClass::of(size) else {
            self.stats.failed();
            log::trace!("allocate({size}): larger than any class");
            return None;
        };

        let _global = self.coarse_guard();
        let caller = self.bind_or_die();

        if let Some(taken) = unsafe { self.private_pool(caller, class) }.take() {
            self.stats.private_hit();
            log::trace!("allocate({size}): {class} chunk {} from arena {caller}", taken.index);
            return Some(Block::new(taken, ArenaId::Thread(caller as u16), class));
        }

        match self.with_overflow(class, Pool::take) {
            Some(taken) => {
                if self.stats.overflow_hit() {
                    log::info!("overflow arena used for the first time (thread arena {caller} out of {class} chunks)");
                }
                log::trace!("allocate({size}): {class} chunk {} from overflow", taken.index);
                Some(Block::new(taken, ArenaId::Overflow, class))
            }
            None => {
                self.stats.failed();
                log::debug!("allocate({size}): arena {caller} and overflow are out of {class} chunks");
                None
            }
        }
    }

    /// Return a block to the free list it came from. `None` is a no-op.
    ///
    /// # Panics
    ///
    /// If the block was already released, or is a private block of another thread's arena.
    pub fn release<'a>(&'a self, block: impl Into<Option<Block<'a>>>) {
        if let Err(Refused { error, .. }) = self.try_release(block) {
            log::warn!("invalid release: {error}");
            panic!("invalid release: {error}");
        }
    }

    /// `release`, reporting a bad block instead of panicking. On `Err` nothing changes and the
    /// block comes back inside the `Refused`.
    pub fn try_release<'a>(&'a self, block: impl Into<Option<Block<'a>>>) -> Result<(), Refused<'a>> {
        let Some(block) = block.into() else {
            return Ok(());
        };

        let _global = self.coarse_guard();
        let caller = self.bind_or_die();

        let result = match block.arena {
            ArenaId::Overflow => self.with_overflow(block.class, |pool| Self::give_back(pool, &block)),
            ArenaId::Thread(i) if i as usize == caller => {
                Self::give_back(unsafe { self.private_pool(caller, block.class) }, &block)
            }
            owner => Err(ReleaseError::ForeignArena { owner, caller: ArenaId::Thread(caller as u16) }),
        };
        self.finish_release(result).map_err(|error| Refused { block, error })
    }

    /// Release by payload pointer alone. Null is a no-op.
    ///
    /// # Panics
    ///
    /// If `ptr` is not the payload of a chunk this thread currently holds.
    pub fn release_ptr(&self, ptr: *mut u8) {
        if let Err(e) = self.try_release_ptr(ptr) {
            log::warn!("invalid release: {e}");
            panic!("invalid release: {e}");
        }
    }

    /// `release_ptr`, reporting a bad pointer instead of panicking.
    pub fn try_release_ptr(&self, ptr: *mut u8) -> Result<(), ReleaseError> {
        if ptr.is_null() {
            return Ok(());
        }

        let _global = self.coarse_guard();
        let caller = self.bind_or_die();
        let addr = ptr.addr();

        let result = if let Some(class) = class_within(&self.overflow_bounds, addr) {
            self.with_overflow(class, |pool| Self::give_back_addr(pool, ArenaId::Overflow, addr))
        } else if let Some(class) = class_within(&self.arena_bounds[caller], addr) {
            let pool = unsafe { self.private_pool(caller, class) };
            Self::give_back_addr(pool, ArenaId::Thread(caller as u16), addr)
        } else if let Some(owner) = self.arena_bounds.iter().position(|b| class_within(b, addr).is_some()) {
            Err(ReleaseError::ForeignArena {
                owner: ArenaId::Thread(owner as u16),
                caller: ArenaId::Thread(caller as u16),
            })
        } else {
            Err(ReleaseError::ForeignPointer { addr })
        };
        self.finish_release(result)
    }

    fn give_back(pool: &mut Pool, block: &Block<'_>) -> Result<(), ReleaseError> {
        // Catches handles issued by a different allocator.
        match pool.payload_of(block.index) {
            Some(payload) if payload != block.ptr => {
                return Err(ReleaseError::ForeignPointer { addr: block.ptr.as_ptr().addr() });
            }
            _ => {}
        }
        pool.give_back(block.arena, block.index, block.generation)
    }

    fn give_back_addr(pool: &mut Pool, arena: ArenaId, addr: usize) -> Result<(), ReleaseError> {
        let (index, generation) = pool.locate(addr).ok_or(ReleaseError::ForeignPointer { addr })?;
        pool.give_back(arena, index, generation)
    }

    fn finish_release(&self, result: Result<(), ReleaseError>) -> Result<(), ReleaseError> {
        if result.is_ok() {
            self.stats.released();
        }
        result
    }

    fn bind(&self) -> Result<usize, BindError> {
        let binding = self.bindings.bind_current()?;
        if binding.fresh {
            self.stats.bound();
            log::debug!("{:?} bound to arena {}", std::thread::current().id(), binding.index);
        }
        Ok(binding.index as usize)
    }

    #[inline]
    fn bind_or_die(&self) -> usize {
        match self.bind() {
            Ok(index) => index,
            Err(e) => {
                log::warn!("{e}");
                panic!("{e}");
            }
        }
    }

    fn coarse_guard(&self) -> Option<MutexGuard<'_, ()>> {
        (self.config.mode == Mode::Coarse).then(|| self.global_lock.lock())
    }

    /// The calling thread's own pool of `class`.
    ///
    /// # Safety
    ///
    /// `caller` must be the binding index of the calling thread, and the returned reference must
    /// not outlive the current call.
    #[inline(always)]
    #[allow(clippy::mut_from_ref)]
    unsafe fn private_pool(&self, caller: usize, class: SizeClass) -> &mut Pool {
        unsafe { &mut *Arena::pool_ptr(self.arenas[caller].get(), class) }
    }

    /// Run `f` on the overflow pool of `class` under the lock the mode requires. In `Coarse` mode
    /// the caller already holds the global lock; in `None` mode there is only one thread.
    #[inline]
    fn with_overflow<R>(&self, class: SizeClass, f: impl FnOnce(&mut Pool) -> R) -> R {
        let _class = (self.config.mode == Mode::Fine).then(|| self.class_locks[class as usize].lock());
        f(unsafe { &mut *Arena::pool_ptr(self.overflow.get(), class) })
    }
}
