use crate::gpu::{TileRegionRef, TileTable};

use super::{
    allocator::Allocator,
    block::{same_region, TileBlock},
    pad,
    pool::Key,
    BlockId, GmmError, TILE_ALIGNMENT,
};

/// Reprogram a hardware tile region to cover `[offset, offset + size)`,
/// keeping the region record in step with the hardware. A zero size
/// releases the slot.
fn try_resize_region(
    tiles: &mut dyn TileTable,
    region: &TileRegionRef,
    offset: u32,
    size: u32,
) -> bool {
    let mut record = region.borrow_mut();
    if size == 0 {
        tiles.unbind(record.slot);
        record.size = 0;
        true
    } else if tiles.bind(record.slot, offset, size, record.pitch) {
        record.offset = offset;
        record.size = size;
        true
    } else {
        false
    }
}

impl Allocator {
    /// Place a tile block, preferring gaps between existing blocks over
    /// growing the tile region.
    pub(crate) fn alloc_tile_block(
        &mut self,
        size: u32,
    ) -> Result<Option<Key>, GmmError> {
        if let Some(key) = self.find_free_tile_gap(size)? {
            return Ok(Some(key));
        }
        self.create_tile_block(size)
    }

    /// Best-fit search over the gaps between adjacent tile blocks.
    ///
    /// The smallest sufficient gap wins; among equal gaps, the first
    /// found scanning up the address-ordered list. Gaps interior to a
    /// single hardware region are never split.
    fn find_free_tile_gap(
        &mut self,
        size: u32,
    ) -> Result<Option<Key>, GmmError> {
        let mut best: Option<(Key, u32)> = None;

        let mut cursor = self.tile_head;
        while let Some(key) = cursor {
            let next = self.tile_blocks[key].next;
            if let Some(next_key) = next {
                let gap = self.tile_blocks[next_key].address
                    - self.tile_blocks[key].end();
                let shares_region = same_region(
                    &self.tile_blocks[key].region,
                    &self.tile_blocks[next_key].region,
                );
                let better = match best {
                    Some((_, best_gap)) => gap < best_gap,
                    None => true,
                };
                if gap >= size && better && !shares_region {
                    best = Some((key, gap));
                }
            }
            cursor = next;
        }

        let after = match best {
            Some((after, _)) => after,
            None => return Ok(None),
        };

        let address = self.tile_blocks[after].end();
        let key = self
            .tile_blocks
            .acquire(TileBlock::new(address, size))?;

        let next = self.tile_blocks[after].next;
        self.tile_blocks[key].next = next;
        self.tile_blocks[key].prev = Some(after);
        self.tile_blocks[after].next = Some(key);
        if let Some(next) = next {
            self.tile_blocks[next].prev = Some(key);
        }
        Ok(Some(key))
    }

    /// Grow the tile region downward by `size` and place a block at the
    /// new boundary. Fails when the boundary would collide with the
    /// linear region's live tail (or run off the start of the arena).
    fn create_tile_block(
        &mut self,
        size: u32,
    ) -> Result<Option<Key>, GmmError> {
        let address = match self.tile_start_address.checked_sub(size) {
            Some(address) if address >= self.region_start() => address,
            _ => return Ok(None),
        };
        if let Some(tail) = self.tail {
            if self.blocks[tail].end() > address {
                return Ok(None);
            }
        }

        self.size = address - self.region_start();
        self.tile_size =
            self.tile_start_address + self.tile_size - address;
        self.tile_start_address = address;

        log::debug!(
            "tile boundary moved down to {:#x} ({} tile bytes)",
            address,
            self.tile_size
        );

        let key = self
            .tile_blocks
            .acquire(TileBlock::new(address, size))?;
        match self.tile_head {
            Some(head) => {
                self.tile_blocks[key].next = Some(head);
                self.tile_blocks[head].prev = Some(key);
                self.tile_head = Some(key);
            }
            None => {
                self.tile_head = Some(key);
                self.tile_tail = Some(key);
            }
        }
        Ok(Some(key))
    }

    /// Grow a tagged tile region by `size` rounded up to the tile
    /// granularity.
    ///
    /// Scans from the high-address end for a block carrying `tag`. If a
    /// large-enough gap adjoins it, a new block is placed there and the
    /// hardware region resized to span both; when the match is the
    /// outermost block and no gap exists, the tile region itself grows.
    /// A hardware refusal rolls the reservation back and fails the call.
    pub fn extend_tagged_tile(
        &mut self,
        size: u32,
        tag: u32,
    ) -> Result<BlockId, GmmError> {
        let rounded = pad(size, TILE_ALIGNMENT)
            .ok_or(GmmError::OutOfMemory { requested: size })?;

        let mut cursor = self.tile_tail;
        while let Some(key) = cursor {
            cursor = self.tile_blocks[key].prev;

            if self.tile_blocks[key].tag != tag {
                continue;
            }
            let region = match self.tile_blocks[key].region.clone() {
                Some(region) => region,
                None => continue,
            };
            let (region_offset, region_size) = {
                let record = region.borrow();
                (record.offset, record.size)
            };

            let (address, end, prev, next) = {
                let block = &self.tile_blocks[key];
                (block.address, block.end(), block.prev, block.next)
            };
            let gap_after = next.map(|next| {
                self.tile_blocks[next].address - end
            });
            let gap_before = prev.map(|prev| {
                address - self.tile_blocks[prev].end()
            });

            if gap_after.unwrap_or(0) >= rounded {
                let next = match next {
                    Some(next) => next,
                    None => continue,
                };
                let new = self
                    .tile_blocks
                    .acquire(TileBlock::new(end, rounded))?;
                self.tile_blocks[new].next = Some(next);
                self.tile_blocks[new].prev = Some(key);
                self.tile_blocks[key].next = Some(new);
                self.tile_blocks[next].prev = Some(new);

                let bridges = !same_region(
                    &self.tile_blocks[key].region,
                    &self.tile_blocks[next].region,
                );
                let resized = !bridges
                    || try_resize_region(
                        self.tiles.as_mut(),
                        &region,
                        region_offset,
                        region_size + rounded,
                    );
                return self.finish_extension(new, tag, region, resized);
            }

            if gap_before.unwrap_or(0) >= rounded {
                let prev = match prev {
                    Some(prev) => prev,
                    None => continue,
                };
                let new = self.tile_blocks.acquire(TileBlock::new(
                    address - rounded,
                    rounded,
                ))?;
                self.tile_blocks[new].next = Some(key);
                self.tile_blocks[new].prev = Some(prev);
                self.tile_blocks[prev].next = Some(new);
                self.tile_blocks[key].prev = Some(new);

                let new_offset =
                    self.address_to_offset(address - rounded);
                let bridges = !same_region(
                    &self.tile_blocks[prev].region,
                    &self.tile_blocks[key].region,
                );
                let resized = !bridges
                    || try_resize_region(
                        self.tiles.as_mut(),
                        &region,
                        new_offset,
                        region_size + rounded,
                    );
                return self.finish_extension(new, tag, region, resized);
            }

            if Some(key) == self.tile_head {
                let new = match self.create_tile_block(rounded)? {
                    Some(new) => new,
                    None => break,
                };
                let new_offset = self
                    .address_to_offset(self.tile_blocks[new].address);
                let resized = try_resize_region(
                    self.tiles.as_mut(),
                    &region,
                    new_offset,
                    region_size + rounded,
                );
                return self.finish_extension(new, tag, region, resized);
            }
        }

        Err(GmmError::OutOfMemory { requested: rounded })
    }

    /// Stamp attributes on a freshly placed extension block, or roll it
    /// back if the hardware refused the resize.
    fn finish_extension(
        &mut self,
        key: Key,
        tag: u32,
        region: TileRegionRef,
        resized: bool,
    ) -> Result<BlockId, GmmError> {
        if !resized {
            self.unlink_tile_block(key);
            log::debug!("tile extension rolled back: resize refused");
            return Err(GmmError::TileResizeFailed);
        }
        let block = &mut self.tile_blocks[key];
        block.tag = tag;
        block.region = Some(region);
        Ok(BlockId::tiled(key))
    }

    /// Release a tile block, narrowing or unbinding its hardware region
    /// as appropriate. Tiled memory is reclaimed immediately: the resize
    /// path is synchronous and waits for the GPU on its own.
    pub(crate) fn free_tile(&mut self, key: Key) {
        let (address, size, prev, next, region) = {
            let block = &self.tile_blocks[key];
            (
                block.address,
                block.size,
                block.prev,
                block.next,
                block.region.clone(),
            )
        };
        let prev_region = prev
            .map(|prev| self.tile_blocks[prev].region.clone())
            .unwrap_or(None);
        let next_region = next
            .map(|next| self.tile_blocks[next].region.clone())
            .unwrap_or(None);

        if prev.is_some()
            && next.is_some()
            && same_region(&prev_region, &next_region)
        {
            // Interior block of a spanning region: the neighbors keep the
            // hardware mapping alive.
        } else if same_region(&prev_region, &region) {
            // The region keeps its low end; narrow away this block's tail.
            if let Some(region) = &region {
                let (offset, total) = {
                    let record = region.borrow();
                    (record.offset, record.size)
                };
                let narrowed = total - size;
                if !try_resize_region(
                    self.tiles.as_mut(),
                    region,
                    offset,
                    narrowed,
                ) {
                    // One retry from scratch: release the slot, rebind.
                    try_resize_region(
                        self.tiles.as_mut(),
                        region,
                        offset,
                        0,
                    );
                    try_resize_region(
                        self.tiles.as_mut(),
                        region,
                        offset,
                        narrowed,
                    );
                }
            }
        } else if same_region(&next_region, &region) {
            // The region keeps its high end; slide its start up.
            if let Some(region) = &region {
                let (offset, total) = {
                    let record = region.borrow();
                    (record.offset, record.size)
                };
                let narrowed = total - size;
                if !try_resize_region(
                    self.tiles.as_mut(),
                    region,
                    offset + size,
                    narrowed,
                ) {
                    try_resize_region(
                        self.tiles.as_mut(),
                        region,
                        offset,
                        0,
                    );
                    try_resize_region(
                        self.tiles.as_mut(),
                        region,
                        offset + size,
                        narrowed,
                    );
                }
            }
        } else if let Some(region) = &region {
            // Last block of its region: release the hardware slot.
            let offset = self.address_to_offset(address);
            try_resize_region(self.tiles.as_mut(), region, offset, 0);
        }

        self.unlink_tile_block(key);
    }

    /// Unlink a tile block and retire its descriptor, restoring the
    /// linear/tile boundary when the outermost block goes away.
    pub(crate) fn unlink_tile_block(&mut self, key: Key) {
        let (prev, next) = {
            let block = &self.tile_blocks[key];
            (block.prev, block.next)
        };

        if let Some(prev) = prev {
            self.tile_blocks[prev].next = next;
        }
        if let Some(next) = next {
            self.tile_blocks[next].prev = prev;
        }

        if self.tile_head == Some(key) {
            self.tile_head = next;
            self.size = match next {
                Some(next) => {
                    self.tile_blocks[next].address - self.region_start()
                }
                None => self.total_size,
            };
            self.tile_size = self.total_size - self.size;
            self.tile_start_address = match next {
                Some(next) => self.tile_blocks[next].address,
                None => self.region_start() + self.size,
            };
            log::debug!(
                "tile boundary restored to {:#x}",
                self.tile_start_address
            );
        }
        if self.tile_tail == Some(key) {
            self.tile_tail = prev;
        }

        self.tile_blocks.release(key);
    }
}
