//! The arena memory manager.
//!
//! A single fixed GPU-addressable arena is split into a linear region
//! growing up from the start and a tile region growing down from the end.
//! Linear allocations are reclaimed through a fence-gated deferred-free
//! queue and defragmented by a compaction sweep; tiled allocations are
//! bound to hardware tile-table slots and reclaimed synchronously.

mod allocator;
mod block;
mod linear;
mod pending;
mod pool;
mod sweep;
mod tile;

use thiserror::Error;

use self::pool::Key;

pub use self::{
    allocator::{Allocator, ArenaLayout, MemoryStats},
    pool::PoolError,
};

/// Linear allocations are carved at this granularity, in bytes.
pub const BLOCK_ALIGNMENT: u32 = 128;

/// Tiled allocations, and the boundary between the linear and tile
/// regions, move at this granularity.
pub const TILE_ALIGNMENT: u32 = 0x10000;

#[derive(Debug, Error)]
pub enum GmmError {
    #[error("arena exhausted: unable to place {requested} bytes")]
    OutOfMemory { requested: u32 },

    #[error("zero-sized allocations are not representable")]
    ZeroSize,

    #[error("the block id is stale: its descriptor was already recycled")]
    StaleId,

    #[error("the block was already freed")]
    AlreadyFreed,

    #[error("the operation applies to the other kind of block")]
    WrongKind,

    #[error("the hardware rejected the tile-region resize")]
    TileResizeFailed,

    #[error("timed out waiting for compaction copies to retire")]
    SweepLockTimeout,

    #[error("arena layout is invalid: {0}")]
    InvalidLayout(&'static str),

    #[error(transparent)]
    DescriptorPool(#[from] PoolError),
}

/// Opaque handle to one allocation, linear or tiled.
///
/// Ids stay valid until the allocation is freed; presenting an id whose
/// descriptor has since been recycled is detected and reported as
/// [`GmmError::StaleId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    kind: BlockKind,
    key: Key,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum BlockKind {
    Linear,
    Tiled,
}

impl BlockId {
    pub(crate) fn linear(key: Key) -> Self {
        Self { kind: BlockKind::Linear, key }
    }

    pub(crate) fn tiled(key: Key) -> Self {
        Self { kind: BlockKind::Tiled, key }
    }

    pub(crate) fn kind(&self) -> BlockKind {
        self.kind
    }

    pub(crate) fn key(&self) -> Key {
        self.key
    }

    /// True when this id refers to a tiled allocation.
    pub fn is_tiled(&self) -> bool {
        self.kind == BlockKind::Tiled
    }
}

/// Round `size` up to a multiple of `alignment`.
///
/// None if the padded size does not fit in the address space.
pub(crate) fn pad(size: u32, alignment: u32) -> Option<u32> {
    size.checked_add(alignment - 1)
        .map(|padded| padded / alignment * alignment)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{cell::RefCell, rc::Rc};

    use crate::{
        gpu::{EmulatedGpu, GpuLink},
        timing::WaitPolicy,
    };

    use super::{Allocator, ArenaLayout};

    /// A wait policy that retires emulated-GPU work instead of sleeping,
    /// so waits resolve deterministically in tests.
    pub(crate) struct PumpWait {
        pub gpu: Rc<RefCell<EmulatedGpu>>,
    }

    impl WaitPolicy for PumpWait {
        fn wait_until(
            &mut self,
            ready: &mut dyn FnMut() -> bool,
        ) -> bool {
            for _ in 0..1_000 {
                if ready() {
                    return true;
                }
                self.gpu.borrow_mut().retire();
            }
            ready()
        }
    }

    /// An allocator over a zero-based arena backed by an emulated GPU.
    pub(crate) fn arena(
        size: u32,
    ) -> (Rc<RefCell<EmulatedGpu>>, Allocator) {
        let gpu =
            Rc::new(RefCell::new(EmulatedGpu::new(size as usize)));
        let mut allocator = Allocator::new(
            ArenaLayout { memory_base: 0, start_address: 0, size },
            GpuLink::shared(gpu.clone()),
        )
        .expect("arena layout must be valid");
        allocator
            .set_wait_policy(Box::new(PumpWait { gpu: gpu.clone() }));
        (gpu, allocator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_rounds_up_to_the_alignment() {
        assert_eq!(pad(1, 128), Some(128));
        assert_eq!(pad(128, 128), Some(128));
        assert_eq!(pad(129, 128), Some(256));
        assert_eq!(pad(40000, 0x10000), Some(0x10000));
        assert_eq!(pad(0x10001, 0x10000), Some(0x20000));
    }

    #[test]
    fn pad_detects_address_space_overflow() {
        assert_eq!(pad(u32::MAX, 128), None);
        assert_eq!(pad(u32::MAX - 126, 128), None);
    }
}
