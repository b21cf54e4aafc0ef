use crate::{
    gpu::{label, CommandSink, GpuLink, Labels, TileRegionRef, TileTable},
    timing::{SpinWait, WaitPolicy},
};

use super::{
    block::{Block, BlockState, TileBlock},
    linear::{Bin, NUM_FREE_BINS},
    pad,
    pool::{Key, Pool},
    BlockId, BlockKind, GmmError, BLOCK_ALIGNMENT, TILE_ALIGNMENT,
};

/// Descriptors are pooled in slabs of this many entries.
const BLOCK_SLAB_CAPACITY: u16 = 512;
const TILE_SLAB_CAPACITY: u16 = 16;

/// Where the managed arena sits in the GPU address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaLayout {
    /// CPU-visible base of the mapped region; offsets handed to the
    /// command stream are relative to this.
    pub memory_base: u32,

    /// First managed address. Must be aligned to [`BLOCK_ALIGNMENT`].
    pub start_address: u32,

    /// Managed bytes. The end of the arena is rounded down to
    /// [`TILE_ALIGNMENT`] so tile blocks land on hardware boundaries.
    pub size: u32,
}

/// The arena memory manager. One instance owns one arena; everything is
/// driven from a single CPU thread.
pub struct Allocator {
    memory_base: u32,
    start_address: u32,
    /// Bytes in the linear region. Shrinks as the tile region grows.
    pub(crate) size: u32,
    /// The bump pointer: lowest never-allocated linear address.
    pub(crate) free_address: u32,
    pub(crate) total_size: u32,

    /// Address-ordered linear block list.
    pub(crate) head: Option<Key>,
    pub(crate) tail: Option<Key>,

    /// Earliest block whose predecessor gap opened since the last sweep.
    pub(crate) sweep_head: Option<Key>,
    pub(crate) freed_since_sweep: u32,

    pub(crate) tile_start_address: u32,
    pub(crate) tile_size: u32,
    /// Address-ordered tile block list.
    pub(crate) tile_head: Option<Key>,
    pub(crate) tile_tail: Option<Key>,

    /// Deferred-free queue, FIFO by free order.
    pub(crate) pending_head: Option<Key>,
    pub(crate) pending_tail: Option<Key>,

    pub(crate) free_bins: [Bin; NUM_FREE_BINS],

    pub(crate) blocks: Pool<Block>,
    pub(crate) tile_blocks: Pool<TileBlock>,

    pub(crate) fence_counter: u32,
    /// True between raising the sweep lock and observing the GPU clear it.
    sweep_lock_armed: bool,
    auto_pin: bool,

    pub(crate) sink: Box<dyn CommandSink>,
    labels: Box<dyn Labels>,
    pub(crate) tiles: Box<dyn TileTable>,
    waiter: Box<dyn WaitPolicy>,
}

impl Allocator {
    /// Take ownership of an arena.
    ///
    /// The tile region starts empty; the whole (alignment-trimmed) arena
    /// is available to linear allocation until tiles carve it down.
    pub fn new(
        layout: ArenaLayout,
        link: GpuLink,
    ) -> Result<Self, GmmError> {
        if layout.start_address % BLOCK_ALIGNMENT != 0 {
            return Err(GmmError::InvalidLayout(
                "start address is not block-aligned",
            ));
        }
        let end = layout
            .start_address
            .checked_add(layout.size)
            .ok_or(GmmError::InvalidLayout(
                "arena wraps the address space",
            ))?
            / TILE_ALIGNMENT
            * TILE_ALIGNMENT;
        if end <= layout.start_address {
            return Err(GmmError::InvalidLayout(
                "arena smaller than one tile boundary",
            ));
        }
        let aligned_size = end - layout.start_address;

        let GpuLink { sink, mut labels, tiles } = link;
        labels.write(label::SWEEP, 0);

        log::info!(
            "arena managed: {} bytes at {:#x} (base {:#x})",
            aligned_size,
            layout.start_address,
            layout.memory_base,
        );

        Ok(Self {
            memory_base: layout.memory_base,
            start_address: layout.start_address,
            size: aligned_size,
            free_address: layout.start_address,
            total_size: aligned_size,
            head: None,
            tail: None,
            sweep_head: None,
            freed_since_sweep: 0,
            tile_start_address: layout.start_address + aligned_size,
            tile_size: 0,
            tile_head: None,
            tile_tail: None,
            pending_head: None,
            pending_tail: None,
            free_bins: [Bin::default(); NUM_FREE_BINS],
            blocks: Pool::new(BLOCK_SLAB_CAPACITY),
            tile_blocks: Pool::new(TILE_SLAB_CAPACITY),
            fence_counter: 0,
            sweep_lock_armed: false,
            auto_pin: false,
            sink,
            labels,
            tiles,
            waiter: Box::new(SpinWait::default()),
        })
    }

    /// Tear the allocator down. Outstanding ids become invalid; the
    /// hardware tile slots are left for the surrounding driver to
    /// release.
    pub fn destroy(self) {
        log::info!("arena released: {:?}", self.stats());
    }

    /// Allocate a linear range. The size is rounded up to
    /// [`BLOCK_ALIGNMENT`].
    pub fn allocate(&mut self, size: u32) -> Result<BlockId, GmmError> {
        self.alloc_inner(false, size)
    }

    /// Allocate a tiled range. The size is rounded up to
    /// [`TILE_ALIGNMENT`].
    pub fn allocate_tiled(
        &mut self,
        size: u32,
    ) -> Result<BlockId, GmmError> {
        self.alloc_inner(true, size)
    }

    fn alloc_inner(
        &mut self,
        tiled: bool,
        size: u32,
    ) -> Result<BlockId, GmmError> {
        if size == 0 {
            return Err(GmmError::ZeroSize);
        }

        if tiled {
            let rounded = pad(size, TILE_ALIGNMENT)
                .ok_or(GmmError::OutOfMemory { requested: size })?;
            if let Some(key) = self.alloc_tile_block(rounded)? {
                return Ok(BlockId::tiled(key));
            }
            self.compact();
            if let Some(key) = self.alloc_tile_block(rounded)? {
                return Ok(BlockId::tiled(key));
            }
            log::debug!("tile allocation of {} bytes failed", rounded);
            Err(GmmError::OutOfMemory { requested: rounded })
        } else {
            let rounded = pad(size, BLOCK_ALIGNMENT)
                .ok_or(GmmError::OutOfMemory { requested: size })?;
            if let Some(key) = self.find_free_block(rounded)? {
                return Ok(BlockId::linear(key));
            }
            if let Some(key) = self.bump_alloc(rounded)? {
                return Ok(BlockId::linear(key));
            }
            self.compact();
            if let Some(key) = self.bump_alloc(rounded)? {
                return Ok(BlockId::linear(key));
            }
            if let Some(key) = self.find_free_block(rounded)? {
                return Ok(BlockId::linear(key));
            }
            log::debug!("linear allocation of {} bytes failed", rounded);
            Err(GmmError::OutOfMemory { requested: rounded })
        }
    }

    /// Release an allocation.
    ///
    /// A tiled block is reclaimed immediately: tile rebinding goes
    /// through a synchronous hardware path that already waits for idle.
    /// A linear block enters the deferred-free queue and becomes
    /// reusable only once its fence passes.
    pub fn free(&mut self, id: BlockId) -> Result<(), GmmError> {
        match id.kind() {
            BlockKind::Tiled => {
                self.tile_blocks
                    .get(id.key())
                    .ok_or(GmmError::StaleId)?;
                self.free_tile(id.key());
                Ok(())
            }
            BlockKind::Linear => {
                let block = self
                    .blocks
                    .get(id.key())
                    .ok_or(GmmError::StaleId)?;
                if block.state != BlockState::Live {
                    return Err(GmmError::AlreadyFreed);
                }
                self.enqueue_free(id.key());
                Ok(())
            }
        }
    }

    /// The allocation's size after alignment rounding.
    pub fn block_size(&self, id: BlockId) -> Result<u32, GmmError> {
        match id.kind() {
            BlockKind::Linear => Ok(self
                .blocks
                .get(id.key())
                .ok_or(GmmError::StaleId)?
                .size),
            BlockKind::Tiled => Ok(self
                .tile_blocks
                .get(id.key())
                .ok_or(GmmError::StaleId)?
                .size),
        }
    }

    /// The allocation's offset from the arena base, as used in GPU
    /// commands.
    ///
    /// While auto-pin is enabled (see [`Allocator::set_auto_pin`]) the
    /// resolved block is pinned as a side effect, so the offset stays
    /// valid across sweeps.
    pub fn offset_of(&mut self, id: BlockId) -> Result<u32, GmmError> {
        let address = match id.kind() {
            BlockKind::Linear => {
                let auto_pin = self.auto_pin;
                let block = self
                    .blocks
                    .get_mut(id.key())
                    .ok_or(GmmError::StaleId)?;
                if auto_pin && block.state == BlockState::Live {
                    block.pinned = true;
                }
                block.address
            }
            BlockKind::Tiled => {
                self.tile_blocks
                    .get(id.key())
                    .ok_or(GmmError::StaleId)?
                    .address
            }
        };
        Ok(address - self.memory_base)
    }

    /// The allocation's CPU-visible address.
    ///
    /// Blocks while compaction copies are in flight: reading or writing
    /// the memory before they retire would race the GPU's blitter.
    pub fn address_of(&mut self, id: BlockId) -> Result<u32, GmmError> {
        // Validate the id before committing to a wait.
        match id.kind() {
            BlockKind::Linear => {
                self.blocks.get(id.key()).ok_or(GmmError::StaleId)?;
            }
            BlockKind::Tiled => {
                self.tile_blocks.get(id.key()).ok_or(GmmError::StaleId)?;
            }
        }
        self.wait_for_sweep()?;
        match id.kind() {
            BlockKind::Linear => Ok(self.blocks[id.key()].address),
            BlockKind::Tiled => Ok(self.tile_blocks[id.key()].address),
        }
    }

    /// Forbid compaction from moving this block.
    ///
    /// Tiled blocks never move; pinning one is accepted and ignored.
    pub fn pin(&mut self, id: BlockId) -> Result<(), GmmError> {
        self.set_pinned(id, true)
    }

    /// Allow compaction to move this block again.
    pub fn unpin(&mut self, id: BlockId) -> Result<(), GmmError> {
        self.set_pinned(id, false)
    }

    fn set_pinned(
        &mut self,
        id: BlockId,
        pinned: bool,
    ) -> Result<(), GmmError> {
        match id.kind() {
            BlockKind::Tiled => {
                self.tile_blocks
                    .get(id.key())
                    .ok_or(GmmError::StaleId)?;
                Ok(())
            }
            BlockKind::Linear => {
                let block = self
                    .blocks
                    .get_mut(id.key())
                    .ok_or(GmmError::StaleId)?;
                if block.state != BlockState::Live {
                    return Err(GmmError::AlreadyFreed);
                }
                block.pinned = pinned;
                Ok(())
            }
        }
    }

    /// While enabled, every linear block resolved through
    /// [`Allocator::offset_of`] is pinned. The surrounding driver turns
    /// this on while it records a command list so the referenced offsets
    /// cannot be invalidated by a sweep, and off once the list is
    /// submitted.
    pub fn set_auto_pin(&mut self, enabled: bool) {
        self.auto_pin = enabled;
    }

    /// Replace the policy used to wait out the sweep lock.
    pub fn set_wait_policy(&mut self, waiter: Box<dyn WaitPolicy>) {
        self.waiter = waiter;
    }

    /// Attach region attributes to a tiled block: the tag identifying the
    /// surface it belongs to and the shared hardware-region record.
    pub fn set_tile_attrib(
        &mut self,
        id: BlockId,
        tag: u32,
        region: TileRegionRef,
    ) -> Result<(), GmmError> {
        if !id.is_tiled() {
            return Err(GmmError::WrongKind);
        }
        let block = self
            .tile_blocks
            .get_mut(id.key())
            .ok_or(GmmError::StaleId)?;
        block.tag = tag;
        block.region = Some(region);
        Ok(())
    }

    /// The hardware-region record attached to a tiled block, if any.
    pub fn tile_region(
        &self,
        id: BlockId,
    ) -> Result<Option<TileRegionRef>, GmmError> {
        if !id.is_tiled() {
            return Err(GmmError::WrongKind);
        }
        Ok(self
            .tile_blocks
            .get(id.key())
            .ok_or(GmmError::StaleId)?
            .region
            .clone())
    }

    /// A point-in-time tally of the arena.
    pub fn stats(&self) -> MemoryStats {
        let mut stats = MemoryStats {
            bump_address: self.free_address,
            linear_size: self.size,
            tile_size: self.tile_size,
            ..MemoryStats::default()
        };
        let mut cursor = self.head;
        while let Some(key) = cursor {
            let block = &self.blocks[key];
            match block.state {
                BlockState::Live => {
                    stats.live_blocks += 1;
                    stats.live_bytes += block.size;
                }
                BlockState::Binned => {
                    stats.binned_blocks += 1;
                    stats.binned_bytes += block.size;
                }
                BlockState::Pending => {
                    stats.pending_blocks += 1;
                    stats.pending_bytes += block.size;
                }
            }
            cursor = block.next;
        }
        let mut cursor = self.tile_head;
        while let Some(key) = cursor {
            let block = &self.tile_blocks[key];
            stats.tile_blocks += 1;
            stats.tile_bytes += block.size;
            cursor = block.next;
        }
        stats
    }

    pub(crate) fn address_to_offset(&self, address: u32) -> u32 {
        address - self.memory_base
    }

    pub(crate) fn linear_end(&self) -> u32 {
        self.start_address + self.size
    }

    pub(crate) fn region_start(&self) -> u32 {
        self.start_address
    }

    /// Arm the gate that [`Allocator::address_of`] waits on.
    pub(crate) fn raise_sweep_lock(&mut self) {
        self.labels.write(label::SWEEP, 1);
        self.sweep_lock_armed = true;
        self.sink.write_fence(label::SWEEP, 0);
        self.sink.flush();
    }

    fn wait_for_sweep(&mut self) -> Result<(), GmmError> {
        if !self.sweep_lock_armed {
            return Ok(());
        }
        let Self { waiter, labels, .. } = self;
        let cleared =
            waiter.wait_until(&mut || labels.read(label::SWEEP) == 0);
        if !cleared {
            return Err(GmmError::SweepLockTimeout);
        }
        self.sweep_lock_armed = false;
        Ok(())
    }
}

/// Counters reported by [`Allocator::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStats {
    pub live_blocks: usize,
    pub live_bytes: u32,
    pub binned_blocks: usize,
    pub binned_bytes: u32,
    pub pending_blocks: usize,
    pub pending_bytes: u32,
    pub tile_blocks: usize,
    pub tile_bytes: u32,
    pub bump_address: u32,
    pub linear_size: u32,
    pub tile_size: u32,
}


#[cfg(test)]
impl Allocator {
    /// Walk every list and assert the structural invariants. Test-only:
    /// corruption here is a bug in the list code, never a runtime state.
    pub(crate) fn check_invariants(&self) {
        assert_eq!(self.size + self.tile_size, self.total_size);
        assert_eq!(
            self.tile_start_address,
            self.start_address + self.size
        );

        // The linear list tiles [start, bump) with no gaps or overlaps.
        let mut expected = self.start_address;
        let mut prev: Option<Key> = None;
        let mut cursor = self.head;
        while let Some(key) = cursor {
            let block = &self.blocks[key];
            assert_eq!(block.prev, prev);
            assert_eq!(
                block.address, expected,
                "linear list must tile the allocated extent"
            );
            assert!(block.size > 0);
            expected = block.end();
            prev = Some(key);
            cursor = block.next;
        }
        assert_eq!(self.tail, prev);
        assert_eq!(
            expected, self.free_address,
            "bump pointer must sit at the end of the last block"
        );
        assert!(self.free_address <= self.linear_end());

        // Tile list: ascending, non-overlapping, inside the tile region.
        let mut prev_end = self.tile_start_address;
        let mut prev: Option<Key> = None;
        let mut cursor = self.tile_head;
        while let Some(key) = cursor {
            let block = &self.tile_blocks[key];
            assert_eq!(block.prev, prev);
            assert!(block.address >= prev_end);
            assert!(block.address % TILE_ALIGNMENT == 0);
            prev_end = block.end();
            prev = Some(key);
            cursor = block.next;
        }
        assert_eq!(self.tile_tail, prev);
        assert!(prev_end <= self.start_address + self.total_size);

        // Bin chains hold Binned blocks of ascending size, each in the
        // right bin; the pending chain holds Pending blocks only.
        for (index, bin) in self.free_bins.iter().enumerate() {
            let mut last_size = 0;
            let mut prev_free: Option<Key> = None;
            let mut cursor = bin.head;
            while let Some(key) = cursor {
                let block = &self.blocks[key];
                assert_eq!(block.state, BlockState::Binned);
                assert_eq!(super::linear::bin_index(block.size), index);
                assert!(block.size >= last_size);
                assert_eq!(block.prev_free, prev_free);
                last_size = block.size;
                prev_free = Some(key);
                cursor = block.next_free;
            }
            assert_eq!(bin.tail, prev_free);
        }
        let mut prev_free: Option<Key> = None;
        let mut cursor = self.pending_head;
        while let Some(key) = cursor {
            let block = &self.blocks[key];
            assert_eq!(block.state, BlockState::Pending);
            assert!(!block.pinned);
            assert_eq!(block.prev_free, prev_free);
            prev_free = Some(key);
            cursor = block.next_free;
        }
        assert_eq!(self.pending_tail, prev_free);
    }
}
