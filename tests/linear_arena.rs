use std::{cell::RefCell, rc::Rc};

use gmm::{
    gpu::{label, EmulatedGpu, GpuLink},
    memory::{Allocator, ArenaLayout, BlockId},
    timing::WaitPolicy,
};

const ARENA_BASE: u32 = 0x0030_0000;
const ARENA_SIZE: u32 = 1024 * 1024;

/// Retires emulated-GPU work instead of sleeping, so waits resolve
/// deterministically.
struct PumpWait {
    gpu: Rc<RefCell<EmulatedGpu>>,
}

impl WaitPolicy for PumpWait {
    fn wait_until(&mut self, ready: &mut dyn FnMut() -> bool) -> bool {
        for _ in 0..10_000 {
            if ready() {
                return true;
            }
            self.gpu.borrow_mut().retire();
        }
        ready()
    }
}

fn arena() -> (Rc<RefCell<EmulatedGpu>>, Allocator) {
    let gpu =
        Rc::new(RefCell::new(EmulatedGpu::new(ARENA_SIZE as usize)));
    let mut allocator = Allocator::new(
        ArenaLayout {
            memory_base: ARENA_BASE,
            start_address: ARENA_BASE,
            size: ARENA_SIZE,
        },
        GpuLink::shared(gpu.clone()),
    )
    .expect("arena layout must be valid");
    allocator.set_wait_policy(Box::new(PumpWait { gpu: gpu.clone() }));
    (gpu, allocator)
}

#[test]
fn allocate_free_reap_reuse_round_trip() {
    let (gpu, mut allocator) = arena();

    let first = allocator.allocate(100).unwrap();
    let second = allocator.allocate(100).unwrap();
    assert_eq!(allocator.offset_of(first).unwrap(), 0);
    assert_eq!(allocator.offset_of(second).unwrap(), 128);
    assert_eq!(allocator.stats().bump_address, ARENA_BASE + 256);

    allocator.free(first).unwrap();
    gpu.borrow_mut().retire_all();
    allocator.reap_pending(gpu.borrow().label(label::FENCE));

    let reused = allocator.allocate(100).unwrap();
    assert_eq!(allocator.offset_of(reused).unwrap(), 0);
    assert_eq!(allocator.stats().bump_address, ARENA_BASE + 256);
}

#[test]
fn partial_fence_progress_reaps_only_what_retired() {
    let (gpu, mut allocator) = arena();

    let a = allocator.allocate(256).unwrap();
    let b = allocator.allocate(256).unwrap();
    let _c = allocator.allocate(256).unwrap();

    allocator.free(a).unwrap(); // fence 1
    allocator.free(b).unwrap(); // fence 2

    // The GPU has only retired the first fence write.
    gpu.borrow_mut().retire();
    let observed = gpu.borrow().label(label::FENCE);
    assert_eq!(observed, 1);
    allocator.reap_pending(observed);

    let stats = allocator.stats();
    assert_eq!(stats.binned_blocks, 1);
    assert_eq!(stats.pending_blocks, 1);

    // Now the second one lands too.
    gpu.borrow_mut().retire_all();
    allocator.reap_pending(gpu.borrow().label(label::FENCE));
    let stats = allocator.stats();
    assert_eq!(stats.binned_blocks, 2);
    assert_eq!(stats.pending_blocks, 0);
}

#[test]
fn compaction_preserves_every_live_payload() {
    let (gpu, mut allocator) = arena();

    // Alternating live and doomed blocks with distinct payloads.
    let mut live: Vec<(BlockId, Vec<u8>)> = Vec::new();
    let mut doomed = Vec::new();
    for n in 0u32..12 {
        let size = 128 * (1 + n % 4);
        let id = allocator.allocate(size).unwrap();
        if n % 2 == 0 {
            doomed.push(id);
        } else {
            let payload: Vec<u8> =
                (0..size).map(|i| (i * 7 + n) as u8).collect();
            gpu.borrow_mut()
                .write_bytes(allocator.offset_of(id).unwrap(), &payload);
            live.push((id, payload));
        }
    }

    for id in doomed {
        allocator.free(id).unwrap();
    }
    assert!(allocator.compact());
    gpu.borrow_mut().retire_all();

    for (id, payload) in &live {
        let offset = allocator.offset_of(*id).unwrap();
        assert_eq!(
            gpu.borrow().read_bytes(offset, payload.len()),
            &payload[..],
            "payload must survive relocation"
        );
    }

    // Everything slid into one contiguous prefix.
    let total: u32 =
        live.iter().map(|(id, _)| allocator.block_size(*id).unwrap()).sum();
    assert_eq!(allocator.stats().bump_address, ARENA_BASE + total);
}

#[test]
fn mixed_traffic_conserves_every_byte_and_never_overlaps() {
    let (gpu, mut allocator) = arena();

    // Deterministic xorshift so failures reproduce.
    let mut state = 0x2545_F491u32;
    let mut rand = move || {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        state
    };

    let mut live: Vec<BlockId> = Vec::new();
    for round in 0..400 {
        match rand() % 10 {
            0..=5 => {
                let size = 1 + rand() % 8192;
                match allocator.allocate(size) {
                    Ok(id) => live.push(id),
                    Err(_) => {
                        // Arena pressure: release half of what we hold.
                        for id in live.drain(..live.len() / 2) {
                            allocator.free(id).unwrap();
                        }
                    }
                }
            }
            6..=7 => {
                if !live.is_empty() {
                    let index = (rand() % live.len() as u32) as usize;
                    let id = live.swap_remove(index);
                    allocator.free(id).unwrap();
                }
            }
            8 => {
                gpu.borrow_mut().retire_all();
                allocator.reap_pending(gpu.borrow().label(label::FENCE));
            }
            _ => {
                allocator.compact();
                gpu.borrow_mut().retire_all();
            }
        }

        // Conservation: every byte below the bump pointer belongs to
        // exactly one block, live or reclaimable.
        let stats = allocator.stats();
        assert_eq!(
            stats.live_bytes + stats.binned_bytes + stats.pending_bytes,
            stats.bump_address - ARENA_BASE,
            "conservation failed in round {}",
            round
        );

        if round % 50 == 0 {
            let mut extents: Vec<(u32, u32)> = live
                .iter()
                .map(|id| {
                    (
                        allocator.offset_of(*id).unwrap(),
                        allocator.block_size(*id).unwrap(),
                    )
                })
                .collect();
            extents.sort_unstable();
            for pair in extents.windows(2) {
                assert!(
                    pair[0].0 + pair[0].1 <= pair[1].0,
                    "live blocks overlap in round {}",
                    round
                );
            }
        }
    }
}

#[test]
fn sweep_lock_blocks_address_resolution_until_copies_retire() {
    let (gpu, mut allocator) = arena();

    let a = allocator.allocate(4096).unwrap();
    let b = allocator.allocate(4096).unwrap();
    allocator.free(a).unwrap();
    assert!(allocator.compact());

    // The copies are queued, not executed.
    assert!(gpu.borrow().pending_commands() > 0);

    // address_of pumps the emulated GPU through the backlog.
    assert_eq!(allocator.address_of(b).unwrap(), ARENA_BASE);
    assert_eq!(gpu.borrow().pending_commands(), 0);
}
