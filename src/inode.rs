//! The in-memory inode: identity, mode bits, counters, and per-kind payload.
//!
//! The original on-disk format reuses the zone array for three unrelated
//! things: block pointers for regular files, the device number (in slot 0)
//! for specials, and a pair of pipe cursors. In memory that reinterpretation
//! is made explicit by [`InodeContent`], a tagged variant selected by the
//! inode's type; only the record codec ever sees the overlaid form.

use bitflags::bitflags;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::disk::{DeviceId, DiskInode, InodeNum, PhysBlock, NR_ZONES};

bitflags! {
    /// File mode word, matching the on-disk encoding: type tag in the top
    /// octal digits, set-id/sticky bits and rwx permissions below.
    pub struct Mode: u16 {
        const TYPE_MASK    = 0o170000;
        const REGULAR      = 0o100000;
        const BLOCK_DEVICE = 0o060000;
        const DIRECTORY    = 0o040000;
        const CHAR_DEVICE  = 0o020000;
        const FIFO         = 0o010000;
        const SET_UID      = 0o004000;
        const SET_GID      = 0o002000;
        const STICKY       = 0o001000;
        const PERM_MASK    = 0o000777;
    }
}

impl Mode {
    /// The file type encoded in the mode word.
    pub fn kind(self) -> InodeKind {
        match self.bits() & Mode::TYPE_MASK.bits() {
            0o100000 => InodeKind::Regular,
            0o060000 => InodeKind::BlockDevice,
            0o040000 => InodeKind::Directory,
            0o020000 => InodeKind::CharDevice,
            0o010000 => InodeKind::Fifo,
            _ => InodeKind::Other,
        }
    }
}

/// File type tag derived from the mode word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    Regular,
    Directory,
    CharDevice,
    BlockDevice,
    Fifo,
    Other,
}

/// Size of the memory page backing an in-flight pipe.
pub const PIPE_BUF_SIZE: usize = 4096;

/// One page of pipe data plus the read/write cursors into it.
#[derive(Debug)]
pub struct PipeBuffer {
    page: Box<[u8; PIPE_BUF_SIZE]>,
    pub read: usize,
    pub write: usize,
}

impl PipeBuffer {
    pub fn new() -> Self {
        Self {
            page: Box::new([0; PIPE_BUF_SIZE]),
            read: 0,
            write: 0,
        }
    }

    pub fn page(&self) -> &[u8; PIPE_BUF_SIZE] {
        &self.page
    }

    pub fn page_mut(&mut self) -> &mut [u8; PIPE_BUF_SIZE] {
        &mut self.page
    }
}

impl Default for PipeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-kind payload of an inode.
#[derive(Debug)]
pub enum InodeContent {
    /// Block address array: 7 direct pointers, then the single- and
    /// double-indirect pointers. 0 marks an unallocated slot.
    Zones([PhysBlock; NR_ZONES]),
    /// Device number of a block or character special file.
    Device(u16),
    /// Backing page of an anonymous pipe. Pipes are never persisted.
    Pipe(PipeBuffer),
}

/// An inode as held in the cache.
///
/// Identity is the `(dev, ino)` pair; `dev == 0` marks a slot that is not
/// bound to any filesystem. Header fields may be read by any task looking
/// for a match, but mutation belongs to whoever holds the slot's latch (or,
/// for single-field updates, the slot's body lock).
#[derive(Debug)]
pub struct Inode {
    pub dev: DeviceId,
    pub ino: InodeNum,
    pub mode: Mode,
    pub uid: u16,
    pub gid: u8,
    pub size: u32,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
    /// Directory entries naming this inode on disk.
    pub nlinks: u8,
    /// Live handles to this slot; 0 means the slot may be reused.
    pub count: usize,
    /// Set on any mutation of persisted fields, cleared by writeback.
    pub dirty: bool,
    /// Another filesystem is mounted at this inode.
    pub mounted: bool,
    pub content: InodeContent,
}

impl Inode {
    /// A fully zeroed, unbound inode, as a freshly claimed slot starts out.
    pub fn vacant() -> Self {
        Self {
            dev: 0,
            ino: 0,
            mode: Mode::empty(),
            uid: 0,
            gid: 0,
            size: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            nlinks: 0,
            count: 0,
            dirty: false,
            mounted: false,
            content: InodeContent::Zones([0; NR_ZONES]),
        }
    }

    /// Return the slot to the vacant state, dropping any pipe page.
    pub fn reset(&mut self) {
        *self = Inode::vacant();
    }

    pub fn kind(&self) -> InodeKind {
        self.mode.kind()
    }

    pub fn is_pipe(&self) -> bool {
        matches!(self.content, InodeContent::Pipe(_))
    }

    /// The block address array.
    ///
    /// # Panics
    ///
    /// Panics if this inode's content is not a zone array (special files and
    /// pipes have none); calling block translation on such an inode is a
    /// caller bug.
    pub fn zones(&self) -> &[PhysBlock; NR_ZONES] {
        match &self.content {
            InodeContent::Zones(zones) => zones,
            other => panic!("zone array access on {} inode", content_name(other)),
        }
    }

    /// Mutable view of the block address array; same contract as [`zones`].
    ///
    /// [`zones`]: Inode::zones
    pub fn zones_mut(&mut self) -> &mut [PhysBlock; NR_ZONES] {
        match &mut self.content {
            InodeContent::Zones(zones) => zones,
            other => panic!("zone array access on {} inode", content_name(other)),
        }
    }

    /// Device number of a block/char special file.
    ///
    /// # Panics
    ///
    /// Panics if this inode is not a special file.
    pub fn device_number(&self) -> u16 {
        match &self.content {
            InodeContent::Device(devno) => *devno,
            other => panic!("device number requested from {} inode", content_name(other)),
        }
    }

    pub fn pipe(&self) -> Option<&PipeBuffer> {
        match &self.content {
            InodeContent::Pipe(buf) => Some(buf),
            _ => None,
        }
    }

    pub fn pipe_mut(&mut self) -> Option<&mut PipeBuffer> {
        match &mut self.content {
            InodeContent::Pipe(buf) => Some(buf),
            _ => None,
        }
    }

    /// Stamp the change time with the current wall clock.
    pub fn touch_ctime(&mut self) {
        self.ctime = unix_now();
    }

    /// The persisted subset of this inode, in on-disk form.
    ///
    /// Special files store their device number in zone slot 0; pipes are
    /// never written and encode as an empty zone array.
    pub fn to_record(&self) -> DiskInode {
        let zones = match &self.content {
            InodeContent::Zones(zones) => *zones,
            InodeContent::Device(devno) => {
                let mut zones = [0; NR_ZONES];
                zones[0] = *devno;
                zones
            }
            InodeContent::Pipe(_) => [0; NR_ZONES],
        };
        DiskInode {
            mode: self.mode.bits(),
            uid: self.uid,
            size: self.size,
            mtime: self.mtime,
            gid: self.gid,
            nlinks: self.nlinks,
            zones,
        }
    }

    /// Install a loaded record, leaving the in-memory-only fields alone.
    pub fn install_record(&mut self, record: &DiskInode) {
        self.mode = Mode::from_bits_truncate(record.mode);
        self.uid = record.uid;
        self.size = record.size;
        self.mtime = record.mtime;
        self.gid = record.gid;
        self.nlinks = record.nlinks;
        self.content = match self.kind() {
            InodeKind::BlockDevice | InodeKind::CharDevice => {
                InodeContent::Device(record.zones[0])
            }
            _ => InodeContent::Zones(record.zones),
        };
    }
}

impl Default for Inode {
    fn default() -> Self {
        Self::vacant()
    }
}

fn content_name(content: &InodeContent) -> &'static str {
    match content {
        InodeContent::Zones(_) => "regular",
        InodeContent::Device(_) => "special-file",
        InodeContent::Pipe(_) => "pipe",
    }
}

/// Seconds since the Unix epoch, saturating at zero for pre-epoch clocks.
pub(crate) fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
