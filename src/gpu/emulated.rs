use std::collections::VecDeque;

use super::{CommandSink, Labels, TileTable};

/// One queued entry in the emulated FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Copy { dst: u32, src: u32, size: u32 },
    WriteLabel { slot: u8, value: u32 },
}

/// A software tile-table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileBinding {
    pub offset: u32,
    pub size: u32,
    pub pitch: u32,
}

const TILE_SLOT_COUNT: usize = 15;

/// A software model of the GPU as the memory manager sees it: a byte
/// arena, a FIFO of emitted commands, 256 labels, and a tile table.
///
/// Emitted commands sit in the queue until the test (or bring-up harness)
/// retires them, at which point copies land in the arena bytes and fence
/// writes land in the label memory. This makes GPU progress fully
/// deterministic: nothing happens until `retire` is called.
///
/// Tile binds and unbinds are applied synchronously, mirroring hardware
/// where reprogramming a tile slot waits for idle.
pub struct EmulatedGpu {
    memory: Vec<u8>,
    queue: VecDeque<Command>,
    labels: [u32; 256],
    tile_slots: [Option<TileBinding>; TILE_SLOT_COUNT],
    reject_binds: u32,
    flush_count: u32,
}

impl EmulatedGpu {
    /// Hardware tile slots available, matching the real tile table.
    pub const TILE_SLOT_COUNT: usize = TILE_SLOT_COUNT;

    /// Create an emulated GPU backed by `arena_size` zeroed bytes.
    pub fn new(arena_size: usize) -> Self {
        Self {
            memory: vec![0; arena_size],
            queue: VecDeque::new(),
            labels: [0; 256],
            tile_slots: [None; Self::TILE_SLOT_COUNT],
            reject_binds: 0,
            flush_count: 0,
        }
    }

    /// Retire the oldest queued command, applying its effects.
    /// Returns false when the queue is empty.
    pub fn retire(&mut self) -> bool {
        let command = match self.queue.pop_front() {
            Some(command) => command,
            None => return false,
        };
        match command {
            Command::Copy { dst, src, size } => {
                let (dst, src, size) =
                    (dst as usize, src as usize, size as usize);
                assert!(
                    dst + size <= src || src + size <= dst,
                    "overlapping copy: hardware blits read and write \
                     concurrently"
                );
                assert!(dst + size <= self.memory.len());
                assert!(src + size <= self.memory.len());
                self.memory.copy_within(src..src + size, dst);
            }
            Command::WriteLabel { slot, value } => {
                self.labels[slot as usize] = value;
            }
        }
        true
    }

    /// Retire everything in the queue.
    pub fn retire_all(&mut self) {
        while self.retire() {}
    }

    /// Number of commands still queued.
    pub fn pending_commands(&self) -> usize {
        self.queue.len()
    }

    /// Current value of a label, same view as [`Labels::read`].
    pub fn label(&self, slot: u8) -> u32 {
        self.labels[slot as usize]
    }

    /// How the given tile slot is currently programmed.
    pub fn tile_binding(&self, slot: u8) -> Option<TileBinding> {
        self.tile_slots.get(slot as usize).copied().flatten()
    }

    /// Make the next `count` bind calls fail, to exercise rollback paths.
    pub fn reject_next_binds(&mut self, count: u32) {
        self.reject_binds = count;
    }

    /// How many times the command stream was kicked.
    pub fn flush_count(&self) -> u32 {
        self.flush_count
    }

    /// Read bytes straight out of the arena.
    pub fn read_bytes(&self, offset: u32, len: usize) -> &[u8] {
        &self.memory[offset as usize..offset as usize + len]
    }

    /// Write bytes straight into the arena, as a CPU mapping would.
    pub fn write_bytes(&mut self, offset: u32, bytes: &[u8]) {
        let offset = offset as usize;
        self.memory[offset..offset + bytes.len()].copy_from_slice(bytes);
    }
}

impl CommandSink for EmulatedGpu {
    fn copy(&mut self, dst_offset: u32, src_offset: u32, size: u32) {
        self.queue.push_back(Command::Copy {
            dst: dst_offset,
            src: src_offset,
            size,
        });
    }

    fn write_fence(&mut self, slot: u8, value: u32) {
        self.queue.push_back(Command::WriteLabel { slot, value });
    }

    fn flush(&mut self) {
        self.flush_count += 1;
    }
}

impl Labels for EmulatedGpu {
    fn read(&self, slot: u8) -> u32 {
        self.labels[slot as usize]
    }

    fn write(&mut self, slot: u8, value: u32) {
        self.labels[slot as usize] = value;
    }
}

impl TileTable for EmulatedGpu {
    fn bind(&mut self, slot: u8, offset: u32, size: u32, pitch: u32)
        -> bool {
        if self.reject_binds > 0 {
            self.reject_binds -= 1;
            return false;
        }
        if slot as usize >= TILE_SLOT_COUNT || size == 0 || pitch == 0 {
            return false;
        }
        self.tile_slots[slot as usize] =
            Some(TileBinding { offset, size, pitch });
        true
    }

    fn unbind(&mut self, slot: u8) {
        if let Some(binding) =
            self.tile_slots.get_mut(slot as usize)
        {
            *binding = None;
        }
    }
}
