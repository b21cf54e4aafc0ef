use std::rc::Rc;

use crate::gpu::TileRegionRef;

use super::pool::Key;

/// Which reclamation stage a linear block is in.
///
/// Blocks in every state stay threaded on the address-ordered primary
/// list -- that is how the sweep sees gaps and how bin splits find their
/// neighbors. The secondary link pair is used by the free bins in
/// `Binned` and by the deferred-free queue in `Pending`, never both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockState {
    /// Handed out to a caller.
    Live,
    /// Reusable, parked in a free bin.
    Binned,
    /// Freed by the CPU but possibly still referenced by in-flight GPU
    /// work; waiting for its fence to pass.
    Pending,
}

/// Descriptor for one linear allocation.
pub(crate) struct Block {
    pub address: u32,
    pub size: u32,
    pub pinned: bool,
    /// Fence value stamped at free time. Meaningful only in `Pending`.
    pub fence: u32,
    pub state: BlockState,

    /// Address-ordered primary list.
    pub prev: Option<Key>,
    pub next: Option<Key>,

    /// Free-bin or pending-queue chain, depending on `state`.
    pub prev_free: Option<Key>,
    pub next_free: Option<Key>,
}

impl Block {
    pub fn new(address: u32, size: u32) -> Self {
        Self {
            address,
            size,
            pinned: false,
            fence: 0,
            state: BlockState::Live,
            prev: None,
            next: None,
            prev_free: None,
            next_free: None,
        }
    }

    /// One past the last address covered by this block.
    pub fn end(&self) -> u32 {
        self.address + self.size
    }
}

/// Descriptor for one tiled allocation.
///
/// Tile blocks live on their own address-ordered list in the tile region.
/// Several adjacent blocks can share one hardware region; they then carry
/// clones of the same region handle and an identical tag.
pub(crate) struct TileBlock {
    pub address: u32,
    pub size: u32,
    /// Hash of the surface attributes this block was created for.
    pub tag: u32,
    pub region: Option<TileRegionRef>,

    pub prev: Option<Key>,
    pub next: Option<Key>,
}

impl TileBlock {
    pub fn new(address: u32, size: u32) -> Self {
        Self { address, size, tag: 0, region: None, prev: None, next: None }
    }

    pub fn end(&self) -> u32 {
        self.address + self.size
    }
}

/// Whether two optional region handles point at the same record.
///
/// Blocks that never had attributes attached share a region with nothing,
/// including each other.
pub(crate) fn same_region(
    a: &Option<TileRegionRef>,
    b: &Option<TileRegionRef>,
) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Rc::ptr_eq(a, b),
        _ => false,
    }
}
