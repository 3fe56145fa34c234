//! On-disk layout: geometry constants, the packed inode record, and the
//! arithmetic locating a record on its device.
//!
//! Everything in this module is a binary contract. The record codec and the
//! block-position formulas must stay bit-for-bit compatible with the on-disk
//! format; nothing here may depend on in-memory state.

/// Each filesystem device is identified by a 16-bit device number.
///
/// Device 0 is reserved: an in-memory inode with `dev == 0` is not backed by
/// any filesystem (a free slot, or an anonymous object such as a pipe).
pub type DeviceId = u16;

/// Inode numbers are 16-bit and start at 1; 0 means "no inode".
pub type InodeNum = u16;

/// A physical block number on a device. 0 means "no block allocated".
pub type PhysBlock = u16;

/// Size of one device block in bytes.
pub const BLOCK_SIZE: usize = 1024;

/// Number of direct zone slots in an inode's address array.
pub const NR_DIRECT: usize = 7;

/// Index of the single-indirect pointer in the address array.
pub const SINGLE_INDIRECT: usize = 7;

/// Index of the double-indirect pointer in the address array.
pub const DOUBLE_INDIRECT: usize = 8;

/// Total slots in the address array: 7 direct + 1 single + 1 double indirect.
pub const NR_ZONES: usize = 9;

/// Block-number entries held by one indirect block (2-byte entries).
pub const ADDRS_PER_BLOCK: usize = BLOCK_SIZE / 2;

/// Largest addressable logical block index, exclusive.
pub const MAX_FILE_BLOCKS: usize = NR_DIRECT + ADDRS_PER_BLOCK + ADDRS_PER_BLOCK * ADDRS_PER_BLOCK;

/// Size of one packed inode record on disk.
pub const INODE_RECORD_SIZE: usize = 32;

/// Packed inode records per device block.
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_RECORD_SIZE;

/// Inode number of a filesystem's root directory.
pub const ROOT_INO: InodeNum = 1;

/// The persisted subset of an inode, exactly as it sits on disk.
///
/// 32 bytes, little-endian, in field order. The in-memory inode carries more
/// state (reference count, dirty flag, access/change times); none of that is
/// persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskInode {
    pub mode: u16,
    pub uid: u16,
    pub size: u32,
    pub mtime: u32,
    pub gid: u8,
    pub nlinks: u8,
    /// For block/char specials, `zones[0]` holds the device number instead
    /// of a block pointer.
    pub zones: [PhysBlock; NR_ZONES],
}

impl DiskInode {
    /// Pack into the on-disk byte layout.
    pub fn encode(&self) -> [u8; INODE_RECORD_SIZE] {
        let mut raw = [0u8; INODE_RECORD_SIZE];
        raw[0..2].copy_from_slice(&self.mode.to_le_bytes());
        raw[2..4].copy_from_slice(&self.uid.to_le_bytes());
        raw[4..8].copy_from_slice(&self.size.to_le_bytes());
        raw[8..12].copy_from_slice(&self.mtime.to_le_bytes());
        raw[12] = self.gid;
        raw[13] = self.nlinks;
        for (i, zone) in self.zones.iter().enumerate() {
            raw[14 + 2 * i..16 + 2 * i].copy_from_slice(&zone.to_le_bytes());
        }
        raw
    }

    /// Unpack from the on-disk byte layout.
    pub fn decode(raw: &[u8; INODE_RECORD_SIZE]) -> Self {
        let mut zones = [0u16; NR_ZONES];
        for (i, zone) in zones.iter_mut().enumerate() {
            *zone = u16::from_le_bytes([raw[14 + 2 * i], raw[15 + 2 * i]]);
        }
        Self {
            mode: u16::from_le_bytes([raw[0], raw[1]]),
            uid: u16::from_le_bytes([raw[2], raw[3]]),
            size: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            mtime: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            gid: raw[12],
            nlinks: raw[13],
            zones,
        }
    }
}

/// Device block holding the record for `ino`.
///
/// Block 0 is the boot block and block 1 the superblock; the inode and zone
/// bitmaps follow, and the inode area starts right after them.
pub fn inode_block(imap_blocks: u16, zmap_blocks: u16, ino: InodeNum) -> PhysBlock {
    assert!(ino >= 1, "inode numbers start at 1");
    2 + imap_blocks + zmap_blocks + (ino - 1) / INODES_PER_BLOCK as u16
}

/// Byte offset of `ino`'s record inside its block.
pub fn inode_offset(ino: InodeNum) -> usize {
    assert!(ino >= 1, "inode numbers start at 1");
    (ino as usize - 1) % INODES_PER_BLOCK * INODE_RECORD_SIZE
}
