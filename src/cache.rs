//! Fixed-capacity inode cache and lifecycle management.
//!
//! [`InodeCache`] owns a bounded pool of inode slots and is the sole
//! arbiter of the "one in-memory copy per on-disk inode" invariant. It
//! hands out reference-counted slot handles via [`get`](InodeCache::get)
//! and [`make_pipe`](InodeCache::make_pipe); every handle must eventually
//! come back through [`put`](InodeCache::put), which decides between plain
//! release, deferred writeback, and destruction of unlinked files.
//!
//! Two exclusion mechanisms coexist, deliberately distinct: slot
//! *reservation* (claiming an unreferenced slot, serialized by each slot's
//! body lock plus the scan gate) keeps reuse from racing lookup, while each
//! slot's *latch* keeps read-modify-write sequences that span blocking
//! block-layer calls atomic with respect to other tasks.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::backing::{BlockAllocator, BufferCache, DeviceSizes, SuperblockRegistry};
use crate::disk::{
    inode_block, inode_offset, DeviceId, DiskInode, InodeNum, INODE_RECORD_SIZE, ROOT_INO,
};
use crate::inode::{Inode, InodeContent, InodeKind, Mode, PipeBuffer};
use crate::latch::Latch;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IcacheError {
    /// Every slot in the table carries a live reference. The table size is
    /// a build-time constant, so this usually means a caller leaks handles;
    /// the slot dump logged alongside names the suspects.
    #[error("inode table exhausted: every slot is referenced")]
    TableExhausted,

    /// Device 0 names no filesystem; there is nothing to consult.
    #[error("cannot acquire an inode on the null device")]
    NullDevice,
}

/// One slot of the inode table.
///
/// The body lock guards field access and is only ever held for short,
/// non-blocking critical sections. The latch marks a slot whose backing
/// state is mid-flight (load, store, zone-array surgery) and may be held
/// across suspensions.
#[derive(Debug)]
pub struct InodeSlot {
    index: usize,
    latch: Latch,
    body: Mutex<Inode>,
}

impl InodeSlot {
    fn new(index: usize) -> Self {
        Self {
            index,
            latch: Latch::new(),
            body: Mutex::new(Inode::vacant()),
        }
    }

    /// Position of this slot in its table, for diagnostics.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn latch(&self) -> &Latch {
        &self.latch
    }

    /// Read fields under the body lock.
    pub fn with<R>(&self, f: impl FnOnce(&Inode) -> R) -> R {
        f(&self.body.lock())
    }

    /// Mutate fields under the body lock. The closure must not block.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut Inode) -> R) -> R {
        f(&mut self.body.lock())
    }

    /// The slot's current `(dev, ino)` identity.
    pub fn ident(&self) -> (DeviceId, InodeNum) {
        self.with(|inode| (inode.dev, inode.ino))
    }

    /// Block until no task holds the latch.
    pub fn wait_unlocked(&self) {
        self.latch.wait_clear();
    }

    /// Wake tasks parked on this slot without touching the latch.
    pub fn wake_waiters(&self) {
        self.latch.notify();
    }
}

/// The inode cache service.
///
/// Generic over its four collaborators so tests can stand in memory-backed
/// doubles for the real block layer.
pub struct InodeCache<B, A, S, D> {
    slots: Box<[Arc<InodeSlot>]>,
    /// Last slot returned by the reservation scan; the next scan starts
    /// just after it.
    clock: Mutex<usize>,
    /// Serializes the lookup/publish step of `get` so two concurrent
    /// misses cannot both install the same identity.
    scan_gate: Mutex<()>,
    pub(crate) buffers: B,
    pub(crate) alloc: A,
    supers: S,
    device_sizes: D,
}

enum Scan {
    /// Identity matched and the reference count was taken.
    Hit(Arc<InodeSlot>),
    /// Identity matched but the slot is latched; settle and rescan.
    Busy(Arc<InodeSlot>),
    Miss,
}

impl<B, A, S, D> InodeCache<B, A, S, D>
where
    B: BufferCache,
    A: BlockAllocator,
    S: SuperblockRegistry,
    D: DeviceSizes,
{
    /// Build a cache with `capacity` slots over the given collaborators.
    pub fn new(capacity: usize, buffers: B, alloc: A, supers: S, device_sizes: D) -> Self {
        assert!(capacity > 0, "inode table needs at least one slot");
        let slots = (0..capacity).map(|i| Arc::new(InodeSlot::new(i))).collect();
        Self {
            slots,
            clock: Mutex::new(capacity - 1),
            scan_gate: Mutex::new(()),
            buffers,
            alloc,
            supers,
            device_sizes,
        }
    }

    /// Number of slots in the table.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Iterate the table. Slot contents are a snapshot at best; take the
    /// body lock per slot to read consistently.
    pub fn slots(&self) -> impl Iterator<Item = &Arc<InodeSlot>> {
        self.slots.iter()
    }

    /// Whether any live handle on `dev` exists, e.g. for unmount busy checks.
    pub fn device_in_use(&self, dev: DeviceId) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.with(|inode| inode.dev == dev && inode.count > 0))
    }

    /// Acquire the inode `(dev, ino)`, loading it from disk on a miss.
    ///
    /// If the matched inode is a mount point, the acquire is redirected to
    /// the root of the filesystem mounted there. The returned handle's
    /// reference must be returned with [`put`](Self::put).
    pub fn get(&self, dev: DeviceId, ino: InodeNum) -> Result<Arc<InodeSlot>, IcacheError> {
        if dev == 0 {
            return Err(IcacheError::NullDevice);
        }

        // Reserve before searching: if the search misses, a loadable slot
        // is already in hand and cannot be snatched by another task.
        let spare = self.reserve()?;

        let (mut dev, mut ino) = (dev, ino);
        loop {
            let gate = self.scan_gate.lock();
            match self.scan_table(dev, ino) {
                Scan::Busy(slot) => {
                    drop(gate);
                    // Whoever latched it may be rewriting the identity;
                    // wait it out and look again from the start.
                    slot.wait_unlocked();
                }
                Scan::Hit(slot) => {
                    drop(gate);
                    if slot.with(|inode| inode.mounted) {
                        match self.supers.mounted_at(dev, ino) {
                            Some(child) => {
                                debug!(dev, ino, child, "crossing mount point");
                                self.put(&slot);
                                dev = child;
                                ino = ROOT_INO;
                            }
                            None => {
                                warn!(dev, ino, "mount flag set but no filesystem mounted here");
                                self.put(&spare);
                                return Ok(slot);
                            }
                        }
                    } else {
                        debug!(dev, ino, slot = slot.index(), "icache hit");
                        self.put(&spare);
                        return Ok(slot);
                    }
                }
                Scan::Miss => {
                    // Latch before publishing the identity so no other task
                    // can hand the slot out while the load is in flight.
                    spare.latch().acquire();
                    spare.with_mut(|inode| {
                        inode.dev = dev;
                        inode.ino = ino;
                    });
                    drop(gate);
                    debug!(dev, ino, slot = spare.index(), "icache miss, loading");
                    self.load_locked(&spare);
                    spare.latch().release();
                    return Ok(spare);
                }
            }
        }
    }

    /// Release one reference to `slot`.
    ///
    /// The last reference to an unlinked inode truncates its data and frees
    /// its on-disk record; the last reference to a dirty inode writes it
    /// back first. Releasing a slot nobody holds is a caller bug and
    /// panics.
    pub fn put(&self, slot: &InodeSlot) {
        slot.wait_unlocked();
        slot.with(|inode| {
            assert!(
                inode.count > 0,
                "put: releasing an inode nobody holds (dev {}, ino {})",
                inode.dev,
                inode.ino
            );
        });

        if slot.with(|inode| inode.is_pipe()) {
            // A peer may be parked mid-read or mid-write on this pipe;
            // wake both sides before the count moves.
            slot.wake_waiters();
            slot.with_mut(|inode| {
                inode.count -= 1;
                if inode.count == 0 {
                    // Dropping the content releases the backing page.
                    inode.content = InodeContent::Zones([0; crate::disk::NR_ZONES]);
                    inode.dirty = false;
                }
            });
            return;
        }

        if slot.with(|inode| inode.dev == 0) {
            slot.with_mut(|inode| inode.count -= 1);
            return;
        }

        if slot.with(|inode| inode.kind() == InodeKind::BlockDevice) {
            let devno = slot.with(|inode| inode.device_number());
            self.buffers.sync_device(devno);
            // The flush may have slept; the slot can be latched again.
            slot.wait_unlocked();
        }

        enum Next {
            Done,
            Destroy,
            WriteBack,
        }

        loop {
            let next = slot.with_mut(|inode| {
                if inode.count > 1 {
                    inode.count -= 1;
                    Next::Done
                } else if inode.nlinks == 0 {
                    Next::Destroy
                } else if inode.dirty {
                    Next::WriteBack
                } else {
                    inode.count -= 1;
                    Next::Done
                }
            });

            match next {
                Next::Done => return,
                Next::Destroy => {
                    slot.latch().acquire();
                    // The latch wait may have let another task take a
                    // reference or relink; re-confirm before destroying.
                    if !slot.with(|inode| inode.count == 1 && inode.nlinks == 0) {
                        slot.latch().release();
                        continue;
                    }
                    let (dev, ino) = slot.ident();
                    debug!(dev, ino, "last name and last handle gone, destroying");
                    slot.with_mut(|inode| self.alloc.truncate(inode));
                    self.alloc.free_inode_record(dev, ino);
                    slot.with_mut(|inode| inode.reset());
                    slot.latch().release();
                    return;
                }
                Next::WriteBack => {
                    self.write_inode(slot);
                    // Writeback slept; the whole decision is stale.
                    slot.wait_unlocked();
                }
            }
        }
    }

    /// Build an anonymous pipe inode: one backing page, zeroed cursors, and
    /// a reference count of 2 (one reader, one writer).
    pub fn make_pipe(&self) -> Result<Arc<InodeSlot>, IcacheError> {
        let slot = self.reserve()?;
        slot.with_mut(|inode| {
            inode.count = 2; // reader + writer
            inode.mode = Mode::FIFO;
            inode.content = InodeContent::Pipe(PipeBuffer::new());
        });
        debug!(slot = slot.index(), "built pipe inode");
        Ok(slot)
    }

    /// Detach every slot belonging to `dev`, e.g. on unmount or media
    /// removal.
    ///
    /// Slots are detached regardless of reference count; a live handle to a
    /// disappearing filesystem is not fixable here, only reportable.
    pub fn invalidate_device(&self, dev: DeviceId) {
        for slot in self.slots.iter() {
            slot.wait_unlocked();
            slot.with_mut(|inode| {
                if inode.dev != dev {
                    return;
                }
                if inode.count > 0 {
                    warn!(
                        dev,
                        ino = inode.ino,
                        count = inode.count,
                        "inode still referenced on invalidated device"
                    );
                }
                inode.dev = 0;
                inode.dirty = false;
            });
        }
    }

    /// Write back every dirty, non-pipe inode in the table.
    pub fn sync_all(&self) {
        for slot in self.slots.iter() {
            slot.wait_unlocked();
            if slot.with(|inode| inode.dirty && !inode.is_pipe()) {
                self.write_inode(slot);
            }
        }
    }

    /// Write `slot` back to its device if dirty. No-op on clean or unbound
    /// slots, so it is cheap to call speculatively.
    pub(crate) fn write_inode(&self, slot: &InodeSlot) {
        slot.latch().acquire();
        self.store_locked(slot);
        slot.latch().release();
    }

    /// Claim an unreferenced slot, zero it, and pin it with count 1.
    ///
    /// Clock scan: start after the previously reserved slot, prefer a free
    /// slot that is neither latched nor dirty, settle for a dirty one and
    /// flush it. Flushing sleeps, so the claim re-checks the count and the
    /// scan restarts if the slot was taken meanwhile.
    fn reserve(&self) -> Result<Arc<InodeSlot>, IcacheError> {
        loop {
            let mut candidate: Option<usize> = None;
            {
                let mut clock = self.clock.lock();
                for _ in 0..self.slots.len() {
                    *clock = (*clock + 1) % self.slots.len();
                    let slot = &self.slots[*clock];
                    let (count, dirty) = slot.with(|inode| (inode.count, inode.dirty));
                    if count != 0 {
                        continue;
                    }
                    candidate = Some(*clock);
                    if !dirty && !slot.latch().is_held() {
                        break;
                    }
                }
            }

            let Some(index) = candidate else {
                for slot in self.slots.iter() {
                    let (dev, ino, count) = slot.with(|i| (i.dev, i.ino, i.count));
                    warn!(slot = slot.index(), dev, ino, count, "inode slot pinned");
                }
                return Err(IcacheError::TableExhausted);
            };

            let slot = &self.slots[index];
            slot.wait_unlocked();
            while slot.with(|inode| inode.dirty) {
                debug!(slot = index, "flushing dirty slot before reuse");
                self.write_inode(slot);
                slot.wait_unlocked();
            }

            let claimed = slot.with_mut(|inode| {
                if inode.count != 0 {
                    return false;
                }
                inode.reset();
                inode.count = 1;
                true
            });
            if claimed {
                return Ok(Arc::clone(slot));
            }
            // Lost the slot while sleeping on the flush; take another pass.
        }
    }

    /// Non-blocking table scan under the scan gate.
    fn scan_table(&self, dev: DeviceId, ino: InodeNum) -> Scan {
        enum Verdict {
            Pass,
            Busy,
            Hit,
        }

        for slot in self.slots.iter() {
            let verdict = slot.with_mut(|inode| {
                if inode.dev != dev || inode.ino != ino {
                    return Verdict::Pass;
                }
                if slot.latch().is_held() {
                    return Verdict::Busy;
                }
                inode.count += 1;
                Verdict::Hit
            });
            match verdict {
                Verdict::Pass => {}
                Verdict::Busy => return Scan::Busy(Arc::clone(slot)),
                Verdict::Hit => return Scan::Hit(Arc::clone(slot)),
            }
        }
        Scan::Miss
    }

    /// Load the slot's on-disk record. Latch must be held by the caller.
    fn load_locked(&self, slot: &InodeSlot) {
        let (dev, ino) = slot.ident();
        let sb = self
            .supers
            .lookup(dev)
            .unwrap_or_else(|| panic!("read_inode: no superblock for device {dev}"));
        let block = inode_block(sb.imap_blocks, sb.zmap_blocks, ino);
        let buf = self.buffers.fetch(dev, block).unwrap_or_else(|| {
            panic!("read_inode: cannot read inode block {block} on device {dev}")
        });
        let mut raw = [0u8; INODE_RECORD_SIZE];
        buf.read_at(inode_offset(ino), &mut raw);
        self.buffers.release(buf);

        let record = DiskInode::decode(&raw);
        slot.with_mut(|inode| {
            inode.install_record(&record);
            if inode.kind() == InodeKind::BlockDevice {
                // The device's registered capacity bounds reads on the
                // special file; unregistered devices read as unbounded.
                let devno = inode.device_number();
                inode.size = match self
                    .device_sizes
                    .block_count(crate::backing::major(devno), crate::backing::minor(devno))
                {
                    Some(blocks) => blocks.saturating_mul(crate::disk::BLOCK_SIZE as u32),
                    None => 0x7fff_ffff,
                };
            }
        });
    }

    /// Store the slot's record if dirty. Latch must be held by the caller.
    fn store_locked(&self, slot: &InodeSlot) {
        let (dev, ino, dirty) = slot.with(|inode| (inode.dev, inode.ino, inode.dirty));
        if !dirty {
            return;
        }
        if dev == 0 {
            // A device-less slot has no record to write. The flag must be
            // dropped, not skipped: the reservation scan flushes a dirty
            // free slot until it comes up clean, and a sticky flag would
            // never let that loop finish.
            slot.with_mut(|inode| inode.dirty = false);
            return;
        }
        let sb = self
            .supers
            .lookup(dev)
            .unwrap_or_else(|| panic!("write_inode: no superblock for device {dev}"));
        let block = inode_block(sb.imap_blocks, sb.zmap_blocks, ino);
        let buf = self.buffers.fetch(dev, block).unwrap_or_else(|| {
            panic!("write_inode: cannot read inode block {block} on device {dev}")
        });
        let record = slot.with(|inode| inode.to_record());
        buf.write_at(inode_offset(ino), &record.encode());
        self.buffers.mark_dirty(&buf);
        slot.with_mut(|inode| inode.dirty = false);
        self.buffers.release(buf);
        debug!(dev, ino, "inode written back");
    }
}
