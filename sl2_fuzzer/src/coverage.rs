//! The per-run coverage arena and the basic-block instrumentation feeding it.
//!
//! Offsets are taken relative to the owning module's base, so arenas recorded under different
//! load addresses stay comparable when the coordinator merges them.

use core::{
    fmt::{self, Display},
    sync::atomic::{AtomicU8, Ordering},
};

use serde::{Deserialize, Serialize};
use sl2_bolts::{Error, HASH_LEN};

use crate::modules::ModuleRegistry;

/// Size of the arena map. Must stay a power of two.
pub const ARENA_SIZE: usize = 1 << 16;

/// Longest accepted arena id
pub const ARENA_ID_LEN: usize = HASH_LEN;

/// The opaque token naming an arena at the coordinator
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArenaId(String);

impl ArenaId {
    /// Validate a user supplied id
    pub fn new<S>(id: S) -> Result<Self, Error>
    where
        S: Into<String>,
    {
        let id = id.into();
        if id.len() != ARENA_ID_LEN {
            return Err(Error::illegal_argument(format!(
                "arena id must be {ARENA_ID_LEN} characters, got {}",
                id.len()
            )));
        }
        Ok(Self(id))
    }

    /// The id as sent over the wire
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ArenaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Arena offset of a block starting at `block_start` inside a module loaded at `module_base`.
#[inline]
#[must_use]
pub fn arena_offset(block_start: usize, module_base: usize) -> usize {
    block_start.wrapping_sub(module_base) & (ARENA_SIZE - 1)
}

/// The coverage signature of one run.
///
/// Bytes are bumped from arbitrary target threads without synchronization: a load followed by
/// a store, so concurrent hits on the same byte may lose updates. The arena is a statistical
/// signal, not an exact count. Bytes wrap around on overflow.
#[derive(Debug)]
pub struct CoverageArena {
    id: ArenaId,
    map: Box<[AtomicU8]>,
}

impl CoverageArena {
    /// A zeroed arena
    #[must_use]
    pub fn new(id: ArenaId) -> Self {
        Self {
            id,
            map: (0..ARENA_SIZE).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    /// This arena's id
    #[must_use]
    pub fn id(&self) -> &ArenaId {
        &self.id
    }

    /// Replace the map contents, e.g. with an arena handed out by the coordinator.
    pub fn load(&self, bytes: &[u8]) -> Result<(), Error> {
        if bytes.len() != ARENA_SIZE {
            return Err(Error::illegal_argument(format!(
                "arena map has {} bytes, expected {ARENA_SIZE}",
                bytes.len()
            )));
        }
        for (slot, byte) in self.map.iter().zip(bytes) {
            slot.store(*byte, Ordering::Relaxed);
        }
        Ok(())
    }

    /// The counter behind `offset` (taken modulo [`ARENA_SIZE`])
    #[inline]
    #[must_use]
    pub fn counter(&self, offset: usize) -> ArenaCounter<'_> {
        ArenaCounter(&self.map[offset & (ARENA_SIZE - 1)])
    }

    /// Current value at `offset`
    #[must_use]
    pub fn get(&self, offset: usize) -> u8 {
        self.map[offset & (ARENA_SIZE - 1)].load(Ordering::Relaxed)
    }

    /// A snapshot of the whole map
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.map.iter().map(|b| b.load(Ordering::Relaxed)).collect()
    }
}

/// One arena byte, as referenced by instrumented code.
#[derive(Clone, Copy, Debug)]
pub struct ArenaCounter<'a>(&'a AtomicU8);

impl ArenaCounter<'_> {
    /// Count one execution. Deliberately not a read-modify-write.
    #[inline]
    pub fn hit(&self) {
        let value = self.0.load(Ordering::Relaxed);
        self.0.store(value.wrapping_add(1), Ordering::Relaxed);
    }

    /// Address of the byte, for backends that emit an inline increment
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.0.as_ptr()
    }
}

/// Maps freshly compiled basic blocks to arena counters.
///
/// The backend calls [`BasicBlockInstrumentor::instrument`] once per block, for its first
/// instruction only, and inserts an increment of the returned counter in front of it. The
/// inserted code must preserve the flags and registers the block sees.
#[derive(Debug, Clone, Copy)]
pub struct BasicBlockInstrumentor<'a> {
    modules: &'a ModuleRegistry,
    arena: &'a CoverageArena,
}

impl<'a> BasicBlockInstrumentor<'a> {
    /// Instrument into `arena`, attributing blocks through `modules`
    #[must_use]
    pub fn new(modules: &'a ModuleRegistry, arena: &'a CoverageArena) -> Self {
        Self { modules, arena }
    }

    /// The counter for the block starting at `block_start`, or `None` if the block belongs to
    /// no tracked module and should stay uninstrumented.
    #[must_use]
    pub fn instrument(&self, block_start: usize) -> Option<ArenaCounter<'a>> {
        let base = self.modules.owning_module_base(block_start)?;
        Some(self.arena.counter(arena_offset(block_start, base)))
    }
}
