//! Contracts of the layers this cache sits on: the block-device buffer
//! cache, the bitmap allocator, the superblock registry, and the device
//! size table.
//!
//! The inode layer treats every call through these traits as blocking and
//! possibly suspending; implementations provide their own internal
//! synchronization.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::disk::{DeviceId, InodeNum, PhysBlock, BLOCK_SIZE};
use crate::inode::Inode;

/// Major half of a packed device number.
pub fn major(devno: u16) -> u8 {
    (devno >> 8) as u8
}

/// Minor half of a packed device number.
pub fn minor(devno: u16) -> u8 {
    (devno & 0xff) as u8
}

/// A checked-out block buffer.
///
/// The handle shares the block's data cell with the buffer cache that issued
/// it. Returning it is done by value through [`BufferCache::release`], so a
/// handle cannot be released twice; dropping one without releasing it leaks
/// the checkout, which implementations may detect.
pub struct BufferHandle {
    dev: DeviceId,
    block: PhysBlock,
    data: Arc<Mutex<[u8; BLOCK_SIZE]>>,
}

impl BufferHandle {
    pub fn new(dev: DeviceId, block: PhysBlock, data: Arc<Mutex<[u8; BLOCK_SIZE]>>) -> Self {
        Self { dev, block, data }
    }

    pub fn dev(&self) -> DeviceId {
        self.dev
    }

    pub fn block(&self) -> PhysBlock {
        self.block
    }

    /// Read the `index`-th 2-byte block-number entry of an indirect block.
    pub fn entry(&self, index: usize) -> PhysBlock {
        let data = self.data.lock();
        u16::from_le_bytes([data[2 * index], data[2 * index + 1]])
    }

    /// Overwrite the `index`-th 2-byte block-number entry.
    ///
    /// The caller still has to mark the buffer dirty; writing the cell alone
    /// does not schedule it for writeback.
    pub fn set_entry(&self, index: usize, value: PhysBlock) {
        let mut data = self.data.lock();
        data[2 * index..2 * index + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// Copy `dst.len()` bytes out of the buffer starting at `offset`.
    pub fn read_at(&self, offset: usize, dst: &mut [u8]) {
        let data = self.data.lock();
        dst.copy_from_slice(&data[offset..offset + dst.len()]);
    }

    /// Copy `src` into the buffer starting at `offset`.
    pub fn write_at(&self, offset: usize, src: &[u8]) {
        let mut data = self.data.lock();
        data[offset..offset + src.len()].copy_from_slice(src);
    }
}

/// The block-device buffer cache.
pub trait BufferCache {
    /// Check out the named block, blocking until it is resident.
    ///
    /// `None` means the device could not produce the block (I/O failure).
    fn fetch(&self, dev: DeviceId, block: PhysBlock) -> Option<BufferHandle>;

    /// Schedule the buffer's current contents for writeback.
    fn mark_dirty(&self, buf: &BufferHandle);

    /// Return a checked-out buffer. Exactly once per fetch.
    fn release(&self, buf: BufferHandle);

    /// Flush every dirty buffer belonging to `dev`. May block.
    fn sync_device(&self, dev: DeviceId);
}

/// The free-block and free-inode bitmap allocator.
pub trait BlockAllocator {
    /// Claim a free data block on `dev`. `None` means the device is full.
    fn allocate(&self, dev: DeviceId) -> Option<PhysBlock>;

    /// Return `ino`'s on-disk record to the free-inode bitmap.
    fn free_inode_record(&self, dev: DeviceId, ino: InodeNum);

    /// Release every data block reachable from the inode's address array,
    /// indirect structures included, and zero the array.
    fn truncate(&self, inode: &mut Inode);
}

/// Per-device layout constants read from a mounted superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperblockInfo {
    /// Blocks consumed by the inode bitmap.
    pub imap_blocks: u16,
    /// Blocks consumed by the zone bitmap.
    pub zmap_blocks: u16,
}

/// Registry of mounted filesystems.
pub trait SuperblockRegistry {
    /// Layout constants for `dev`, if that device is mounted.
    fn lookup(&self, dev: DeviceId) -> Option<SuperblockInfo>;

    /// The device whose filesystem is mounted at `(dev, ino)`, if any.
    fn mounted_at(&self, dev: DeviceId, ino: InodeNum) -> Option<DeviceId>;
}

/// Registered sizes of block devices, keyed by (major, minor).
pub trait DeviceSizes {
    /// Device capacity in 1 KiB blocks; `None` if the device never
    /// registered a size (treated as unbounded).
    fn block_count(&self, major: u8, minor: u8) -> Option<u32>;
}
