use crate::gpu::label;

use super::{
    allocator::Allocator,
    block::BlockState,
    linear::NUM_FREE_BINS,
    pool::Key,
};

/// Whether an observed fence value has caught up to a stamped one.
///
/// The fence is a free-running 32-bit counter, so ordering is circular:
/// `stamped` counts as reached when it lies within the half of the
/// counter space at or behind `observed`. Equivalently, the wrapping
/// difference has its top bit clear. This holds across the wrap from
/// 0xFFFFFFFF to 0, and inverts -- correctly -- once values drift more
/// than 2^31 apart.
pub(crate) fn fence_reached(observed: u32, stamped: u32) -> bool {
    observed.wrapping_sub(stamped) & 0x8000_0000 == 0
}

impl Allocator {
    /// Retire a freed block into the deferred-free queue.
    ///
    /// The block is stamped with a fresh fence value and a command is
    /// emitted that writes that value back to the fence label when the
    /// GPU passes this point; until then the memory must not be reused.
    pub(crate) fn enqueue_free(&mut self, key: Key) {
        match self.pending_tail {
            Some(tail) => {
                self.blocks[key].next_free = None;
                self.blocks[key].prev_free = Some(tail);
                self.blocks[tail].next_free = Some(key);
                self.pending_tail = Some(key);
            }
            None => {
                self.blocks[key].next_free = None;
                self.blocks[key].prev_free = None;
                self.pending_head = Some(key);
                self.pending_tail = Some(key);
            }
        }

        self.fence_counter = self.fence_counter.wrapping_add(1);
        let fence = self.fence_counter;
        self.sink.write_fence(label::FENCE, fence);

        let block = &mut self.blocks[key];
        block.pinned = false;
        block.state = BlockState::Pending;
        block.fence = fence;
    }

    /// Move every pending block whose fence the GPU has passed into the
    /// free bins.
    ///
    /// Called by the command emitter whenever it polls the completed
    /// fence label; the allocator itself never polls.
    pub fn reap_pending(&mut self, observed_fence: u32) {
        let mut reaped = 0usize;
        let mut cursor = self.pending_head;
        while let Some(key) = cursor {
            cursor = self.blocks[key].next_free;
            if fence_reached(observed_fence, self.blocks[key].fence) {
                self.remove_pending(key);
                self.add_free(key);
                reaped += 1;
            }
        }
        if reaped > 0 {
            log::trace!(
                "reaped {} deferred frees at fence {:#x}",
                reaped,
                observed_fence
            );
        }
    }

    pub(crate) fn remove_pending(&mut self, key: Key) {
        let (prev, next) = {
            let block = &self.blocks[key];
            (block.prev_free, block.next_free)
        };
        if self.pending_head == Some(key) {
            self.pending_head = next;
        }
        if self.pending_tail == Some(key) {
            self.pending_tail = prev;
        }
        if let Some(next) = next {
            self.blocks[next].prev_free = prev;
        }
        if let Some(prev) = prev {
            self.blocks[prev].next_free = next;
        }
        let block = &mut self.blocks[key];
        block.prev_free = None;
        block.next_free = None;
    }

    /// Destroy every pending and binned block, leaving their ranges as
    /// gaps for the sweep that always follows.
    ///
    /// Pending fences are deliberately not consulted: the sweep's copies
    /// are emitted into the same FIFO stream, behind every command that
    /// could still reference these ranges.
    pub(crate) fn drain_free_lists(&mut self) {
        let mut cursor = self.pending_head;
        while let Some(key) = cursor {
            cursor = self.blocks[key].next_free;
            self.destroy_block(key);
        }
        self.pending_head = None;
        self.pending_tail = None;

        for bin in 0..NUM_FREE_BINS {
            let mut cursor = self.free_bins[bin].head;
            while let Some(key) = cursor {
                cursor = self.blocks[key].next_free;
                self.destroy_block(key);
            }
            self.free_bins[bin].head = None;
            self.free_bins[bin].tail = None;
        }
    }

    /// Unlink a block from the address-ordered list and retire its
    /// descriptor. The vacated range becomes a gap; the sweep cursor is
    /// pulled back so the next sweep starts no later than the gap.
    pub(crate) fn destroy_block(&mut self, key: Key) {
        let (prev, next, size) = {
            let block = &self.blocks[key];
            (block.prev, block.next, block.size)
        };

        if let Some(prev) = prev {
            self.blocks[prev].next = next;
        }
        if let Some(next) = next {
            self.blocks[next].prev = prev;
        }
        if self.head == Some(key) {
            self.head = next;
        }
        if self.tail == Some(key) {
            self.tail = prev;
        }

        match prev {
            None => self.sweep_head = self.head,
            Some(prev) => {
                let pull_back = match self.sweep_head {
                    None => true,
                    Some(sweep) => {
                        self.blocks[sweep].address
                            > self.blocks[prev].address
                    }
                };
                if pull_back {
                    self.sweep_head = Some(prev);
                }
            }
        }

        self.freed_since_sweep += size;
        self.blocks.release(key);
    }
}
