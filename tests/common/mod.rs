#![allow(dead_code, missing_docs, clippy::unwrap_used)]

//! Shared test rig: an [`InodeCache`] wired to memory-backed doubles of the
//! block layer, plus helpers for seeding and inspecting on-device records.

use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use icache::backing::{
    BlockAllocator, BufferCache, BufferHandle, DeviceSizes, SuperblockInfo, SuperblockRegistry,
};
use icache::disk::{inode_block, inode_offset, DeviceId, DiskInode, InodeNum, PhysBlock};
use icache::inode::{Inode, InodeContent};
use icache::{InodeCache, BLOCK_SIZE};

/// The device every test mounts by default.
pub const DEV: DeviceId = 0x0301;

pub type TestCache = InodeCache<MemBuffers, MemAllocator, FixedSupers, DeviceTable>;

pub struct Rig {
    pub cache: TestCache,
    pub buffers: MemBuffers,
    pub alloc: MemAllocator,
    pub supers: FixedSupers,
    pub devices: DeviceTable,
}

/// A rig with `capacity` slots and `DEV` registered with one inode-map and
/// one zone-map block.
pub fn rig(capacity: usize) -> Rig {
    let buffers = MemBuffers::default();
    let alloc = MemAllocator::default();
    let supers = FixedSupers::default();
    let devices = DeviceTable::default();
    supers.add_device(
        DEV,
        SuperblockInfo {
            imap_blocks: 1,
            zmap_blocks: 1,
        },
    );
    let cache = InodeCache::new(
        capacity,
        buffers.clone(),
        alloc.clone(),
        supers.clone(),
        devices.clone(),
    );
    Rig {
        cache,
        buffers,
        alloc,
        supers,
        devices,
    }
}

/// Write `record` where the cache will look for inode `ino` on `dev`.
pub fn seed_inode(rig: &Rig, dev: DeviceId, ino: InodeNum, record: &DiskInode) {
    let sb = rig.supers.lookup(dev).expect("device not registered");
    let block = inode_block(sb.imap_blocks, sb.zmap_blocks, ino);
    let cell = rig.buffers.block(dev, block);
    let mut data = cell.lock();
    data[inode_offset(ino)..inode_offset(ino) + 32].copy_from_slice(&record.encode());
}

/// Read back the on-device record of inode `ino` on `dev`.
pub fn read_record(rig: &Rig, dev: DeviceId, ino: InodeNum) -> DiskInode {
    let sb = rig.supers.lookup(dev).expect("device not registered");
    let block = inode_block(sb.imap_blocks, sb.zmap_blocks, ino);
    let cell = rig.buffers.block(dev, block);
    let data = cell.lock();
    let mut raw = [0u8; 32];
    raw.copy_from_slice(&data[inode_offset(ino)..inode_offset(ino) + 32]);
    DiskInode::decode(&raw)
}

/// An ordinary regular-file record.
pub fn regular_record() -> DiskInode {
    DiskInode {
        mode: 0o100644,
        uid: 1000,
        size: 0,
        mtime: 1_700_000_000,
        gid: 10,
        nlinks: 1,
        zones: [0; 9],
    }
}

#[derive(Default)]
struct BuffersInner {
    blocks: Mutex<FxHashMap<(DeviceId, PhysBlock), Arc<Mutex<[u8; BLOCK_SIZE]>>>>,
    fetched: AtomicUsize,
    released: AtomicUsize,
    dirty_marks: Mutex<Vec<(DeviceId, PhysBlock)>>,
    synced: Mutex<Vec<DeviceId>>,
}

/// In-memory buffer cache. Blocks spring into existence zero-filled on
/// first touch, and every checkout is counted so tests can assert that
/// fetches and releases balance.
#[derive(Clone, Default)]
pub struct MemBuffers {
    inner: Arc<BuffersInner>,
}

impl MemBuffers {
    /// Direct handle on a block's data cell, creating it if needed.
    pub fn block(&self, dev: DeviceId, block: PhysBlock) -> Arc<Mutex<[u8; BLOCK_SIZE]>> {
        Arc::clone(
            self.inner
                .blocks
                .lock()
                .entry((dev, block))
                .or_insert_with(|| Arc::new(Mutex::new([0; BLOCK_SIZE]))),
        )
    }

    /// Checkouts minus returns; 0 when every fetched buffer came back.
    pub fn outstanding(&self) -> usize {
        self.inner.fetched.load(Ordering::SeqCst) - self.inner.released.load(Ordering::SeqCst)
    }

    pub fn fetched(&self) -> usize {
        self.inner.fetched.load(Ordering::SeqCst)
    }

    pub fn dirty_marks(&self) -> Vec<(DeviceId, PhysBlock)> {
        self.inner.dirty_marks.lock().clone()
    }

    pub fn synced_devices(&self) -> Vec<DeviceId> {
        self.inner.synced.lock().clone()
    }
}

impl BufferCache for MemBuffers {
    fn fetch(&self, dev: DeviceId, block: PhysBlock) -> Option<BufferHandle> {
        self.inner.fetched.fetch_add(1, Ordering::SeqCst);
        Some(BufferHandle::new(dev, block, self.block(dev, block)))
    }

    fn mark_dirty(&self, buf: &BufferHandle) {
        self.inner.dirty_marks.lock().push((buf.dev(), buf.block()));
    }

    fn release(&self, _buf: BufferHandle) {
        self.inner.released.fetch_add(1, Ordering::SeqCst);
    }

    fn sync_device(&self, dev: DeviceId) {
        self.inner.synced.lock().push(dev);
    }
}

struct AllocInner {
    next: AtomicU16,
    budget: Mutex<Option<usize>>,
    allocated: AtomicUsize,
    freed_records: Mutex<Vec<(DeviceId, InodeNum)>>,
    truncated: Mutex<Vec<(DeviceId, InodeNum)>>,
}

/// Bitmap-allocator double handing out sequential block numbers from 100.
#[derive(Clone)]
pub struct MemAllocator {
    inner: Arc<AllocInner>,
}

impl Default for MemAllocator {
    fn default() -> Self {
        Self {
            inner: Arc::new(AllocInner {
                next: AtomicU16::new(100),
                budget: Mutex::new(None),
                allocated: AtomicUsize::new(0),
                freed_records: Mutex::new(Vec::new()),
                truncated: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl MemAllocator {
    /// Cap how many more blocks `allocate` will hand out.
    pub fn set_budget(&self, blocks: usize) {
        *self.inner.budget.lock() = Some(blocks);
    }

    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::SeqCst)
    }

    pub fn freed_records(&self) -> Vec<(DeviceId, InodeNum)> {
        self.inner.freed_records.lock().clone()
    }

    pub fn truncated(&self) -> Vec<(DeviceId, InodeNum)> {
        self.inner.truncated.lock().clone()
    }
}

impl BlockAllocator for MemAllocator {
    fn allocate(&self, _dev: DeviceId) -> Option<PhysBlock> {
        let mut budget = self.inner.budget.lock();
        if let Some(left) = budget.as_mut() {
            if *left == 0 {
                return None;
            }
            *left -= 1;
        }
        self.inner.allocated.fetch_add(1, Ordering::SeqCst);
        Some(self.inner.next.fetch_add(1, Ordering::SeqCst))
    }

    fn free_inode_record(&self, dev: DeviceId, ino: InodeNum) {
        self.inner.freed_records.lock().push((dev, ino));
    }

    fn truncate(&self, inode: &mut Inode) {
        self.inner.truncated.lock().push((inode.dev, inode.ino));
        if let InodeContent::Zones(zones) = &mut inode.content {
            *zones = [0; 9];
        }
        inode.size = 0;
        inode.dirty = true;
    }
}

#[derive(Default)]
struct SupersInner {
    devices: FxHashMap<DeviceId, SuperblockInfo>,
    mounts: FxHashMap<(DeviceId, InodeNum), DeviceId>,
}

/// Superblock registry backed by two maps.
#[derive(Clone, Default)]
pub struct FixedSupers {
    inner: Arc<Mutex<SupersInner>>,
}

impl FixedSupers {
    pub fn add_device(&self, dev: DeviceId, info: SuperblockInfo) {
        self.inner.lock().devices.insert(dev, info);
    }

    pub fn add_mount(&self, dev: DeviceId, ino: InodeNum, child: DeviceId) {
        self.inner.lock().mounts.insert((dev, ino), child);
    }
}

impl SuperblockRegistry for FixedSupers {
    fn lookup(&self, dev: DeviceId) -> Option<SuperblockInfo> {
        self.inner.lock().devices.get(&dev).copied()
    }

    fn mounted_at(&self, dev: DeviceId, ino: InodeNum) -> Option<DeviceId> {
        self.inner.lock().mounts.get(&(dev, ino)).copied()
    }
}

/// Device size table keyed by (major, minor), in 1 KiB blocks.
#[derive(Clone, Default)]
pub struct DeviceTable {
    inner: Arc<Mutex<FxHashMap<(u8, u8), u32>>>,
}

impl DeviceTable {
    pub fn set(&self, major: u8, minor: u8, blocks: u32) {
        self.inner.lock().insert((major, minor), blocks);
    }
}

impl DeviceSizes for DeviceTable {
    fn block_count(&self, major: u8, minor: u8) -> Option<u32> {
        self.inner.lock().get(&(major, minor)).copied()
    }
}
