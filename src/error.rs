//! Error types.
//!
//! Allocation failure is not an error type: `allocate` returns `None`. Everything here is either
//! fatal to construction (`InitError`) or a broken caller contract (`BindError`, `ReleaseError`).

use thiserror::Error;

use crate::{ArenaId, SizeClass};

/// The operating system refused to hand us a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("failed to reserve {bytes} bytes from the operating system")]
pub struct ReserveFailed {
    pub bytes: usize,
}

/// A `Config` that cannot be served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("max_threads must be between 1 and {max}, got {got}")]
    ThreadCount { got: usize, max: usize },

    #[error("{role} region of {bytes} bytes holds more than {max} chunks of one class")]
    RegionTooLarge { role: &'static str, bytes: usize, max: usize },
}

#[derive(Debug, Error)]
pub enum InitError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("could not reserve the {role} region ({bytes} bytes)")]
    Reserve {
        role: &'static str,
        bytes: usize,
        #[source]
        source: ReserveFailed,
    },
}

/// More distinct threads asked for an arena than the allocator has arenas for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BindError {
    #[error("thread exhaustion: all {limit} arenas are already bound to other threads")]
    ThreadExhaustion { limit: usize },
}

/// A release that does not match an outstanding allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReleaseError {
    #[error("block from {owner} released by the thread bound to {caller}")]
    ForeignArena { owner: ArenaId, caller: ArenaId },

    #[error("chunk {index} of the {class} pool in {arena} is out of range")]
    OutOfRange { arena: ArenaId, class: SizeClass, index: u32 },

    #[error("chunk {index} of the {class} pool in {arena} is not allocated")]
    NotAllocated { arena: ArenaId, class: SizeClass, index: u32 },

    #[error("stale handle for chunk {index} of the {class} pool in {arena} (generation {held}, current {current})")]
    Stale { arena: ArenaId, class: SizeClass, index: u32, held: u32, current: u32 },

    #[error("pointer {addr:#x} is not the payload of any chunk this thread may release")]
    ForeignPointer { addr: usize },
}
