use super::{
    allocator::Allocator,
    block::Block,
    pool::Key,
    BLOCK_ALIGNMENT,
};

impl Allocator {
    /// Defragment the linear region.
    ///
    /// Every reusable range (free bins and the deferred-free queue) is
    /// surrendered first, turning scattered free blocks into gaps; a
    /// single forward pass then squeezes the gaps out. If anything
    /// changed, the sweep lock is raised: the emitted copies are still in
    /// flight, and [`Allocator::address_of`] holds callers back until the
    /// GPU confirms they retired.
    ///
    /// Returns true when the pass changed the arena.
    #[cfg_attr(doc, aquamarine::aquamarine)]
    /// ```mermaid
    /// graph TD
    ///     A[block at cursor] -->|unpinned| B[extend the current run]
    ///     B -->|boundary: pinned, gap, or end| C[slide run down, rewrite addresses]
    ///     A -->|pinned| D[pack unpinned successors into the hole before it]
    ///     D --> E[leftover hole becomes a free block]
    ///     C --> F[recompute bump from the tail]
    ///     E --> F
    /// ```
    pub fn compact(&mut self) -> bool {
        self.drain_free_lists();
        log::debug!(
            "compacting {} reclaimable bytes",
            self.freed_since_sweep
        );
        let progress = self.sweep_pass();
        if progress {
            log::debug!("compaction emitted work; sweep lock raised");
            self.raise_sweep_lock();
        }
        progress
    }

    /// One forward pass over the block list, starting at the sweep
    /// cursor.
    ///
    /// Unpinned stretches accumulate into runs that slide down by the
    /// size of the gap behind them, one copy per run. Pinned blocks never
    /// move; instead the hole in front of one is packed with whichever
    /// unpinned successors fit, and whatever is left of the hole becomes
    /// a reusable free block.
    pub(crate) fn sweep_pass(&mut self) -> bool {
        let mut progress = false;

        let mut src_address = 0u32;
        let mut dst_address = 0u32;
        let mut run_start = self.sweep_head;
        let mut cursor = self.sweep_head;

        while let Some(key) = cursor {
            let (address, size, pinned, prev, next) = {
                let block = &self.blocks[key];
                (
                    block.address,
                    block.size,
                    block.pinned,
                    block.prev,
                    block.next,
                )
            };

            if !pinned {
                let prev_end = match prev {
                    Some(prev) => self.blocks[prev].end(),
                    None => self.region_start(),
                };
                if address > prev_end {
                    dst_address = prev_end;
                    src_address = address;
                    run_start = Some(key);
                }

                let move_size = address + size - src_address;
                let at_boundary = match next {
                    None => true,
                    Some(next) => {
                        let next = &self.blocks[next];
                        next.address > address + size || next.pinned
                    }
                };

                if src_address > dst_address && at_boundary {
                    let dst_offset = self.address_to_offset(dst_address);
                    let src_offset = self.address_to_offset(src_address);
                    self.emit_move(dst_offset, src_offset, move_size);
                    progress = true;

                    let distance = src_address - dst_address;
                    let mut moved = run_start;
                    while moved != next {
                        match moved {
                            Some(moved_key) => {
                                self.blocks[moved_key].address -=
                                    distance;
                                moved = self.blocks[moved_key].next;
                            }
                            None => break,
                        }
                    }
                }
            } else {
                // A pinned block interrupts any run in progress.
                src_address = 0;
                dst_address = 0;

                let mut available = address
                    - match prev {
                        Some(prev) => self.blocks[prev].end(),
                        None => self.region_start(),
                    };

                let mut candidate = next;
                while let Some(candidate_key) = candidate {
                    if available < BLOCK_ALIGNMENT {
                        break;
                    }
                    let candidate_next = self.blocks[candidate_key].next;

                    let fits = {
                        let block = &self.blocks[candidate_key];
                        !block.pinned && block.size <= available
                    };
                    if fits {
                        self.relocate_before_pinned(candidate_key, key);
                        progress = true;
                    }

                    if let Some(prev) = self.blocks[key].prev {
                        available = self.blocks[key].address
                            - self.blocks[prev].end();
                    }
                    candidate = candidate_next;
                }

                if available > 0 {
                    progress |= self.carve_hole_block(key, available);
                }
            }

            cursor = self.blocks[key].next;
        }

        let new_free_address = match self.tail {
            Some(tail) => self.blocks[tail].end(),
            None => self.region_start(),
        };
        if self.free_address != new_free_address {
            self.free_address = new_free_address;
            progress = true;
        }

        self.freed_since_sweep = 0;
        self.sweep_head = None;

        progress
    }

    /// Move `key` into the hole directly before the pinned block
    /// `pinned_key`, relinking it so the list stays address-ordered.
    fn relocate_before_pinned(&mut self, key: Key, pinned_key: Key) {
        let source_address = self.blocks[key].address;
        let size = self.blocks[key].size;
        let destination = match self.blocks[pinned_key].prev {
            Some(prev) => self.blocks[prev].end(),
            None => self.region_start(),
        };

        let dst_offset = self.address_to_offset(destination);
        let src_offset = self.address_to_offset(source_address);
        self.emit_move(dst_offset, src_offset, size);

        self.blocks[key].address = destination;

        if self.tail == Some(key) {
            self.tail = self.blocks[key].prev;
        }
        let (prev, next) = {
            let block = &self.blocks[key];
            (block.prev, block.next)
        };
        if let Some(next) = next {
            self.blocks[next].prev = prev;
        }
        if let Some(prev) = prev {
            self.blocks[prev].next = next;
        }

        let pinned_prev = self.blocks[pinned_key].prev;
        match pinned_prev {
            Some(prev) => self.blocks[prev].next = Some(key),
            None => self.head = Some(key),
        }
        self.blocks[key].prev = pinned_prev;
        self.blocks[key].next = Some(pinned_key);
        self.blocks[pinned_key].prev = Some(key);
    }

    /// Turn the remaining hole before a pinned block into a binned free
    /// block so the space stays allocatable. Skipped quietly if no
    /// descriptor can be had; the range is then simply lost until the
    /// next sweep.
    fn carve_hole_block(&mut self, pinned_key: Key, size: u32) -> bool {
        let address = self.blocks[pinned_key].address - size;
        let hole = match self.blocks.acquire(Block::new(address, size)) {
            Ok(hole) => hole,
            Err(_) => return false,
        };

        let pinned_prev = self.blocks[pinned_key].prev;
        self.blocks[hole].next = Some(pinned_key);
        self.blocks[hole].prev = pinned_prev;
        if let Some(prev) = pinned_prev {
            self.blocks[prev].next = Some(hole);
        }
        self.blocks[pinned_key].prev = Some(hole);
        if self.head == Some(pinned_key) {
            self.head = Some(hole);
        }

        self.add_free(hole);
        true
    }

    /// Emit the GPU copy (or copies) that realize one downward slide.
    ///
    /// The hardware blitter reads and writes concurrently, so a single
    /// copy must not overlap its source. When the move distance is
    /// smaller than the run, the move is emitted as consecutive chunks
    /// no larger than the distance; each chunk's destination ends where
    /// its source begins.
    pub(crate) fn emit_move(
        &mut self,
        dst_offset: u32,
        src_offset: u32,
        size: u32,
    ) {
        debug_assert!(dst_offset < src_offset);
        let distance = src_offset - dst_offset;
        if size <= distance {
            self.sink.copy(dst_offset, src_offset, size);
            return;
        }
        let mut moved = 0;
        while moved < size {
            let chunk = distance.min(size - moved);
            self.sink.copy(
                dst_offset + moved,
                src_offset + moved,
                chunk,
            );
            moved += chunk;
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::gpu::label;

    use super::super::testing::arena;

    const MIB: u32 = 1024 * 1024;

    #[test]
    fn a_contiguous_run_slides_down_in_one_copy() {
        let (gpu, mut allocator) = arena(MIB);

        let a = allocator.allocate(512).unwrap();
        let b = allocator.allocate(128).unwrap();
        let c = allocator.allocate(128).unwrap();
        let d = allocator.allocate(128).unwrap();
        allocator.free(a).unwrap();
        gpu.borrow_mut().retire_all();

        let before = gpu.borrow().pending_commands();
        assert_eq!(before, 0);
        assert!(allocator.compact());

        // one blit for the whole b..d run, one fence behind it
        assert_eq!(gpu.borrow().pending_commands(), 2);
        gpu.borrow_mut().retire_all();

        assert_eq!(allocator.address_of(b).unwrap(), 0);
        assert_eq!(allocator.address_of(c).unwrap(), 128);
        assert_eq!(allocator.address_of(d).unwrap(), 256);
        assert_eq!(allocator.stats().bump_address, 384);
        allocator.check_invariants();
    }

    #[test]
    fn compaction_moves_the_bytes_with_the_blocks() {
        let (gpu, mut allocator) = arena(MIB);

        let a = allocator.allocate(512).unwrap();
        let b = allocator.allocate(256).unwrap();
        let c = allocator.allocate(128).unwrap();

        let b_payload = [0xB7u8; 256];
        let c_payload = [0x5Cu8; 128];
        gpu.borrow_mut()
            .write_bytes(allocator.offset_of(b).unwrap(), &b_payload);
        gpu.borrow_mut()
            .write_bytes(allocator.offset_of(c).unwrap(), &c_payload);

        allocator.free(a).unwrap();
        allocator.compact();
        gpu.borrow_mut().retire_all();

        let b_offset = allocator.offset_of(b).unwrap();
        let c_offset = allocator.offset_of(c).unwrap();
        assert_eq!(b_offset, 0);
        assert_eq!(c_offset, 256);
        assert_eq!(gpu.borrow().read_bytes(b_offset, 256), &b_payload[..]);
        assert_eq!(gpu.borrow().read_bytes(c_offset, 128), &c_payload[..]);
    }

    #[test]
    fn an_overlapping_slide_is_emitted_in_gap_sized_chunks() {
        let (gpu, mut allocator) = arena(MIB);

        // 128-byte gap in front of a 512-byte block: the slide distance
        // is smaller than the run, so one blit would overlap itself.
        let a = allocator.allocate(128).unwrap();
        let b = allocator.allocate(512).unwrap();

        let payload: Vec<u8> =
            (0..512u32).map(|n| (n % 251) as u8).collect();
        gpu.borrow_mut()
            .write_bytes(allocator.offset_of(b).unwrap(), &payload);

        allocator.free(a).unwrap();
        allocator.compact();

        // four 128-byte chunks, then the sweep fence
        assert_eq!(gpu.borrow().pending_commands(), 5);
        gpu.borrow_mut().retire_all();

        assert_eq!(allocator.address_of(b).unwrap(), 0);
        assert_eq!(gpu.borrow().read_bytes(0, 512), &payload[..]);
        allocator.check_invariants();
    }

    #[test]
    fn compaction_is_idempotent() {
        let (gpu, mut allocator) = arena(MIB);

        let a = allocator.allocate(128).unwrap();
        let _b = allocator.allocate(128).unwrap();
        let _c = allocator.allocate(256).unwrap();
        allocator.free(a).unwrap();

        assert!(allocator.compact());
        gpu.borrow_mut().retire_all();
        let addresses_after_first = allocator.stats();

        // No frees in between: the second pass must change nothing and
        // emit nothing.
        assert!(!allocator.compact());
        assert_eq!(gpu.borrow().pending_commands(), 0);
        assert_eq!(allocator.stats(), addresses_after_first);
        allocator.check_invariants();
    }

    #[test]
    fn movable_blocks_are_packed_into_the_hole_before_a_pinned_block() {
        let (gpu, mut allocator) = arena(MIB);

        let a = allocator.allocate(128).unwrap();
        let pinned = allocator.allocate(256).unwrap();
        let c = allocator.allocate(128).unwrap();
        allocator.pin(pinned).unwrap();

        allocator.free(a).unwrap();
        allocator.compact();
        gpu.borrow_mut().retire_all();

        // c fits exactly in the hole a left behind; pinned stays put.
        assert_eq!(allocator.address_of(c).unwrap(), 0);
        assert_eq!(allocator.address_of(pinned).unwrap(), 128);
        assert_eq!(allocator.stats().bump_address, 384);
        allocator.check_invariants();
    }

    #[test]
    fn a_leftover_hole_before_a_pinned_block_is_rebinned() {
        let (gpu, mut allocator) = arena(MIB);

        let a = allocator.allocate(512).unwrap();
        let pinned = allocator.allocate(128).unwrap();
        let c = allocator.allocate(128).unwrap();
        allocator.pin(pinned).unwrap();

        allocator.free(a).unwrap();
        allocator.compact();
        gpu.borrow_mut().retire_all();

        // c takes the front of the hole; the 384 bytes left over become
        // a free block instead of dead space.
        assert_eq!(allocator.address_of(c).unwrap(), 0);
        assert_eq!(allocator.address_of(pinned).unwrap(), 512);
        let stats = allocator.stats();
        assert_eq!(stats.binned_blocks, 1);
        assert_eq!(stats.binned_bytes, 384);
        assert_eq!(stats.bump_address, 640);
        allocator.check_invariants();

        let d = allocator.allocate(384).unwrap();
        assert_eq!(allocator.offset_of(d).unwrap(), 128);
        allocator.check_invariants();
    }

    #[test]
    fn the_sweep_fence_clears_only_after_the_copies() {
        let (gpu, mut allocator) = arena(MIB);

        let a = allocator.allocate(128).unwrap();
        let _b = allocator.allocate(128).unwrap();
        allocator.free(a).unwrap();
        allocator.compact();

        assert_eq!(gpu.borrow().label(label::SWEEP), 1);
        // fence from the free, one copy, then the sweep-clear write
        gpu.borrow_mut().retire();
        gpu.borrow_mut().retire();
        assert_eq!(gpu.borrow().label(label::SWEEP), 1);
        gpu.borrow_mut().retire();
        assert_eq!(gpu.borrow().label(label::SWEEP), 0);
    }
}
