use std::{cell::RefCell, rc::Rc};

use anyhow::Result;

use gmm::{
    gpu::{label, EmulatedGpu, GpuLink},
    memory::{Allocator, ArenaLayout},
};

/// Drive the memory manager against the emulated GPU: a quick smoke
/// pass over allocation, deferred frees, and compaction.
fn main() -> Result<()> {
    let _logger = gmm::logging::setup()?;

    const ARENA_SIZE: u32 = 4 * 1024 * 1024;

    let gpu = Rc::new(RefCell::new(EmulatedGpu::new(ARENA_SIZE as usize)));
    let mut allocator = Allocator::new(
        ArenaLayout { memory_base: 0, start_address: 0, size: ARENA_SIZE },
        GpuLink::shared(gpu.clone()),
    )?;

    // A spread of linear allocations, then free every other one.
    let blocks: Vec<_> = (0u32..16)
        .map(|n| allocator.allocate(4096 + n * 512))
        .collect::<Result<_, _>>()?;
    log::info!("allocated {} linear blocks: {:?}", blocks.len(), {
        let stats = allocator.stats();
        (stats.live_blocks, stats.live_bytes)
    });

    for id in blocks.iter().step_by(2) {
        allocator.free(*id)?;
    }

    // The command emitter's job: let the GPU retire, then report the
    // fence it reached.
    gpu.borrow_mut().retire_all();
    let observed = gpu.borrow().label(label::FENCE);
    allocator.reap_pending(observed);
    log::info!("after reap at fence {}: {:?}", observed, allocator.stats());

    // Force the fragmentation out.
    let progress = allocator.compact();
    gpu.borrow_mut().retire_all();
    log::info!(
        "compaction progress={} pending_commands={} stats={:?}",
        progress,
        gpu.borrow().pending_commands(),
        allocator.stats()
    );

    // One tiled surface next to the linear traffic.
    let tile = allocator.allocate_tiled(300 * 1024)?;
    log::info!(
        "tile block at offset {:#x}, {} bytes",
        allocator.offset_of(tile)?,
        allocator.block_size(tile)?
    );

    allocator.destroy();
    Ok(())
}
