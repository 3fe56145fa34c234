//! In-memory inode layer for a Minix-style filesystem.
//!
//! The crate centers on [`InodeCache`], a fixed-capacity table of inode
//! slots that guarantees at most one in-memory copy per on-disk inode,
//! loads and writes back 32-byte packed records, follows mount points, and
//! translates logical file blocks to physical device blocks through the
//! 7 + 512 + 512 * 512 direct/indirect addressing scheme.
//!
//! It sits on four pluggable collaborators defined in [`backing`]: a block
//! buffer cache, a bitmap allocator, a superblock registry, and a device
//! size table. The cache treats calls into them as blocking; its own
//! synchronization (per-slot latches plus short body locks) is built to
//! survive real preemption.

pub mod backing;
mod blockmap;
pub mod cache;
pub mod disk;
pub mod inode;
pub mod latch;

pub use backing::{
    BlockAllocator, BufferCache, BufferHandle, DeviceSizes, SuperblockInfo, SuperblockRegistry,
};
pub use cache::{IcacheError, InodeCache, InodeSlot};
pub use disk::{DeviceId, DiskInode, InodeNum, PhysBlock, BLOCK_SIZE, MAX_FILE_BLOCKS, ROOT_INO};
pub use inode::{Inode, InodeContent, InodeKind, Mode, PipeBuffer, PIPE_BUF_SIZE};
pub use latch::Latch;
