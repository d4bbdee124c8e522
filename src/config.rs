//! Allocator configuration.
//!
//! Everything has a default; `Config::from_env` lets the environment override it:
//! - `FIXMALLOC_MODE`: `none`, `coarse` or `fine` (also `0`, `1`, `2`).
//! - `FIXMALLOC_MAX_THREADS`: how many threads may bind an arena.
//! - `FIXMALLOC_ARENA_BYTES`: bytes reserved per private arena.
//! - `FIXMALLOC_OVERFLOW_BYTES`: bytes reserved for the shared overflow arena.
//!
//! Unparseable values fall back to the default rather than failing.

use crate::SizeClass;
use crate::arena::half_of;
use crate::error::ConfigError;
use crate::region::{MAX_CHUNKS, chunks_in};

/// Bytes per arena: half carves into 1729 small chunks, half into 133 large ones.
pub const DEFAULT_ARENA_BYTES: usize = 276_672;
pub const DEFAULT_MAX_THREADS: usize = 8;
/// Arena ids are `u16`, but nobody needs more than this.
pub const MAX_SUPPORTED_THREADS: usize = 64;

/// How concurrent callers are kept apart.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// One thread only. No locks at all; a second thread is refused an arena.
    None,
    /// Every call runs under one global lock, against the overflow arena alone.
    Coarse,
    /// A private lock-free arena per thread, plus a shared overflow arena locked per class.
    #[default]
    Fine,
}

impl Mode {
    /// Parse from string (case-insensitive). Unknown strings give the default.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "single" | "unlocked" | "0" => Self::None,
            "coarse" | "global" | "1" => Self::Coarse,
            "fine" | "arena" | "2" => Self::Fine,
            _ => Self::default(),
        }
    }

    /// How many threads may bind an arena in this mode, given the configured maximum.
    #[must_use]
    pub const fn binding_limit(self, max_threads: usize) -> usize {
        match self {
            Self::None => 1,
            Self::Coarse | Self::Fine => max_threads,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Coarse => "coarse",
            Self::Fine => "fine",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub max_threads: usize,
    pub mode: Mode,
    pub arena_bytes: usize,
    pub overflow_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_THREADS, Mode::default())
    }
}

impl Config {
    /// Default region sizes; the overflow arena is as big as one private arena.
    #[must_use]
    pub const fn new(max_threads: usize, mode: Mode) -> Self {
        Self { max_threads, mode, arena_bytes: DEFAULT_ARENA_BYTES, overflow_bytes: DEFAULT_ARENA_BYTES }
    }

    #[must_use]
    pub const fn with_arena_bytes(mut self, bytes: usize) -> Self {
        self.arena_bytes = bytes;
        self
    }

    #[must_use]
    pub const fn with_overflow_bytes(mut self, bytes: usize) -> Self {
        self.overflow_bytes = bytes;
        self
    }

    /// Defaults, overridden by whichever `FIXMALLOC_*` variables are set.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str, default: usize| {
            lookup(key).and_then(|v| v.trim().replace('_', "").parse().ok()).unwrap_or(default)
        };
        let mode = lookup("FIXMALLOC_MODE").map(|v| Mode::from_str_loose(&v)).unwrap_or_default();

        Self {
            max_threads: number("FIXMALLOC_MAX_THREADS", DEFAULT_MAX_THREADS),
            mode,
            arena_bytes: number("FIXMALLOC_ARENA_BYTES", DEFAULT_ARENA_BYTES),
            overflow_bytes: number("FIXMALLOC_OVERFLOW_BYTES", DEFAULT_ARENA_BYTES),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_SUPPORTED_THREADS).contains(&self.max_threads) {
            return Err(ConfigError::ThreadCount { got: self.max_threads, max: MAX_SUPPORTED_THREADS });
        }
        for (role, bytes) in [("arena", self.arena_bytes), ("overflow", self.overflow_bytes)] {
            // Small chunks are the more numerous.
            if chunks_in(SizeClass::Small, half_of(bytes)) > MAX_CHUNKS {
                return Err(ConfigError::RegionTooLarge { role, bytes, max: MAX_CHUNKS });
            }
        }
        Ok(())
    }

    /// How many private arenas get a region of their own.
    #[must_use]
    pub const fn backed_arenas(&self) -> usize {
        match self.mode {
            Mode::None => 1,
            Mode::Coarse => 0,
            Mode::Fine => self.max_threads,
        }
    }

    /// Chunks per class in one private arena and in the overflow arena.
    #[must_use]
    pub const fn slots(&self, class: SizeClass) -> (usize, usize) {
        (chunks_in(class, half_of(self.arena_bytes)), chunks_in(class, half_of(self.overflow_bytes)))
    }
}
