//! Logical-to-physical block translation over an inode's address array.
//!
//! Three tiers: logical blocks 0..7 resolve through the direct slots, the
//! next 512 through one indirect block, and the remaining 512 * 512 through
//! a two-level tree. In create mode every missing link on the path is
//! allocated on the way down; a failed allocation leaves the path as-is and
//! resolves to 0, the same answer as a hole in lookup mode.
//!
//! Translation holds the slot's latch for its whole duration so the address
//! array and the indirect blocks cannot change underfoot, including across
//! the blocking buffer fetches.
//!
//! The allocator hands out raw blocks: a reallocated block still carries
//! whatever its previous life wrote into it. Any fresh block that will be
//! read as an indirect block is therefore cleared before its first use, so
//! every entry starts out as a hole.

use crate::backing::{BlockAllocator, BufferCache, DeviceSizes, SuperblockRegistry};
use crate::cache::{InodeCache, InodeSlot};
use crate::disk::{
    DeviceId, PhysBlock, ADDRS_PER_BLOCK, BLOCK_SIZE, DOUBLE_INDIRECT, MAX_FILE_BLOCKS, NR_DIRECT,
    SINGLE_INDIRECT,
};

impl<B, A, S, D> InodeCache<B, A, S, D>
where
    B: BufferCache,
    A: BlockAllocator,
    S: SuperblockRegistry,
    D: DeviceSizes,
{
    /// Physical block backing logical `block` of the inode in `slot`, or 0
    /// if that part of the file is a hole.
    pub fn lookup_block(&self, slot: &InodeSlot, block: u32) -> PhysBlock {
        self.resolve_block(slot, block, false)
    }

    /// Like [`lookup_block`](Self::lookup_block), but allocates the data
    /// block and any missing indirect blocks on the path. Returns 0 only if
    /// the device ran out of free blocks.
    pub fn create_block(&self, slot: &InodeSlot, block: u32) -> PhysBlock {
        self.resolve_block(slot, block, true)
    }

    fn resolve_block(&self, slot: &InodeSlot, block: u32, create: bool) -> PhysBlock {
        assert!(
            (block as usize) < MAX_FILE_BLOCKS,
            "resolve_block: logical block {block} beyond addressable range"
        );
        slot.latch().acquire();
        let phys = self.map_block(slot, block as usize, create);
        slot.latch().release();
        phys
    }

    /// Walk the address tiers. Latch must be held by the caller.
    fn map_block(&self, slot: &InodeSlot, mut block: usize, create: bool) -> PhysBlock {
        let (dev, _) = slot.ident();

        if block < NR_DIRECT {
            if create && slot.with(|inode| inode.zones()[block]) == 0 {
                if let Some(fresh) = self.alloc.allocate(dev) {
                    slot.with_mut(|inode| {
                        inode.zones_mut()[block] = fresh;
                        inode.touch_ctime();
                        inode.dirty = true;
                    });
                }
            }
            return slot.with(|inode| inode.zones()[block]);
        }

        block -= NR_DIRECT;
        if block < ADDRS_PER_BLOCK {
            let indirect = self.ensure_zone(slot, dev, SINGLE_INDIRECT, create);
            if indirect == 0 {
                return 0;
            }
            return self.walk_entry(dev, indirect, block, create, false);
        }

        block -= ADDRS_PER_BLOCK;
        let top = self.ensure_zone(slot, dev, DOUBLE_INDIRECT, create);
        if top == 0 {
            return 0;
        }
        let mid = self.walk_entry(dev, top, block / ADDRS_PER_BLOCK, create, true);
        if mid == 0 {
            return 0;
        }
        self.walk_entry(dev, mid, block % ADDRS_PER_BLOCK, create, false)
    }

    /// Resolve one entry of the indirect block `indirect`, allocating into
    /// it when asked. `fresh_is_indirect` marks entries that will themselves
    /// be read as indirect blocks and must start out as all holes.
    fn walk_entry(
        &self,
        dev: DeviceId,
        indirect: PhysBlock,
        index: usize,
        create: bool,
        fresh_is_indirect: bool,
    ) -> PhysBlock {
        let Some(buf) = self.buffers.fetch(dev, indirect) else {
            return 0;
        };
        let mut phys = buf.entry(index);
        if create && phys == 0 {
            if let Some(fresh) = self.alloc.allocate(dev) {
                if fresh_is_indirect {
                    self.clear_block(dev, fresh);
                }
                buf.set_entry(index, fresh);
                self.buffers.mark_dirty(&buf);
                phys = fresh;
            }
        }
        self.buffers.release(buf);
        phys
    }

    /// Read one of the two indirect pointers in the address array,
    /// allocating the indirect block when asked.
    fn ensure_zone(&self, slot: &InodeSlot, dev: DeviceId, index: usize, create: bool) -> PhysBlock {
        let existing = slot.with(|inode| inode.zones()[index]);
        if existing != 0 || !create {
            return existing;
        }
        match self.alloc.allocate(dev) {
            Some(fresh) => {
                self.clear_block(dev, fresh);
                slot.with_mut(|inode| {
                    inode.zones_mut()[index] = fresh;
                    inode.touch_ctime();
                    inode.dirty = true;
                });
                fresh
            }
            None => 0,
        }
    }

    /// Zero a freshly allocated block before it is read as an indirect
    /// block.
    fn clear_block(&self, dev: DeviceId, block: PhysBlock) {
        if let Some(buf) = self.buffers.fetch(dev, block) {
            buf.write_at(0, &[0u8; BLOCK_SIZE]);
            self.buffers.mark_dirty(&buf);
            self.buffers.release(buf);
        }
    }
}
