// Buffer cache.
//
// Holds cached copies of disk sectors in a fixed array of slots so that
// repeated accesses to hot sectors avoid the device. Writes are buffered
// and written back when the slot is evicted or the cache is flushed.
//
// Interface:
// * read/write move bytes at any offset within one sector.
// * flush_all writes every dirty slot back to the device.
// * stats/reset expose and clear the performance counters.
//
// Locking is split in two. The cache lock (the mutex around the clock
// hand) covers the lookup scan, hand advancement, and any change to a
// slot's sector binding. Each slot's data lock covers the device I/O and
// the payload copy. The binding of a slot only changes while both are
// held, so a scan that matches a slot under the cache lock may block on
// the slot lock and still find the same sector there.

use crate::dev::BlockDevice;
use crate::param::{NBUF, SECTOR_SIZE};
use core::cmp;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

// One cached sector. `sector` and `valid` are read by the lookup scan
// under the cache lock alone, while rebinding holds both locks; `used`
// and `dirty` belong to whoever holds the data lock (plus the cache lock
// for the clock's `used` sweep). Atomics, ordered by the two mutexes, so
// Relaxed is enough everywhere.
struct Slot {
    sector: AtomicU32,
    valid: AtomicBool,
    used: AtomicBool,
    dirty: AtomicBool,
    data: Mutex<[u8; SECTOR_SIZE]>,
}

impl Slot {
    fn new() -> Slot {
        Slot {
            sector: AtomicU32::new(0),
            valid: AtomicBool::new(false),
            used: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            data: Mutex::new([0; SECTOR_SIZE]),
        }
    }
}

/// Counter snapshot from [`Cache::stats`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CacheStats {
    pub tries: u64,
    pub hits: u64,
    pub disk_reads: u64,
    pub disk_writes: u64,
}

/// Write-back sector cache with clock (second-chance) replacement.
pub struct Cache {
    dev: Arc<dyn BlockDevice>,
    slots: Box<[Slot]>,
    hand: Mutex<usize>,
    tries: AtomicU64,
    hits: AtomicU64,
    disk_reads: AtomicU64,
    disk_writes: AtomicU64,
}

impl Cache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Cache {
        Cache {
            dev,
            slots: (0..NBUF).map(|_| Slot::new()).collect(),
            hand: Mutex::new(0),
            tries: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            disk_reads: AtomicU64::new(0),
            disk_writes: AtomicU64::new(0),
        }
    }

    /// Copy bytes out of `sector` starting at byte `offs` into `buf`.
    /// Returns how many were copied: `min(buf.len(), 512 - offs)`, or 0
    /// when `offs` is past the end of the sector.
    pub fn read(&self, sector: u32, buf: &mut [u8], offs: usize) -> usize {
        if offs > SECTOR_SIZE {
            return 0;
        }
        let (slot, guard) = self.slot_for(sector);
        let n = cmp::min(buf.len(), SECTOR_SIZE - offs);
        buf[..n].copy_from_slice(&guard[offs..offs + n]);
        slot.used.store(true, Ordering::Relaxed);
        n
    }

    /// Copy `buf` into `sector` starting at byte `offs` and mark the slot
    /// dirty. Returns how many bytes were copied, as for [`Cache::read`].
    pub fn write(&self, sector: u32, buf: &[u8], offs: usize) -> usize {
        if offs > SECTOR_SIZE {
            return 0;
        }
        let (slot, mut guard) = self.slot_for(sector);
        let n = cmp::min(buf.len(), SECTOR_SIZE - offs);
        guard[offs..offs + n].copy_from_slice(&buf[..n]);
        slot.used.store(true, Ordering::Relaxed);
        slot.dirty.store(true, Ordering::Relaxed);
        n
    }

    // Find the slot caching `sector`, filling one from the device if it is
    // not resident. Returns the slot with its data lock held.
    fn slot_for(&self, sector: u32) -> (&Slot, MutexGuard<'_, [u8; SECTOR_SIZE]>) {
        let mut hand = self.hand.lock();
        self.tries.fetch_add(1, Ordering::Relaxed);

        // Already cached? The binding cannot move while `hand` is held,
        // so blocking on the slot's data lock after the match is safe.
        for slot in self.slots.iter() {
            if slot.valid.load(Ordering::Relaxed) && slot.sector.load(Ordering::Relaxed) == sector {
                let guard = slot.data.lock();
                self.hits.fetch_add(1, Ordering::Relaxed);
                drop(hand);
                return (slot, guard);
            }
        }

        // Not resident. Claim a displaced slot, rebind it while the cache
        // lock pins the binding, then fill from the device with only the
        // slot lock held.
        let (slot, mut guard) = self.evict(&mut hand);
        slot.sector.store(sector, Ordering::Relaxed);
        slot.valid.store(true, Ordering::Relaxed);
        slot.dirty.store(false, Ordering::Relaxed);
        drop(hand);
        self.dev.read_sector(sector, &mut guard);
        self.disk_reads.fetch_add(1, Ordering::Relaxed);
        (slot, guard)
    }

    // Clock sweep, caller holds the cache lock. Returns a free or evicted
    // slot with its data lock held; a dirty victim is written back first.
    //
    // Slots whose data lock is held are skipped rather than waited on: the
    // holder may itself be queued behind the cache lock we hold, and a
    // held slot is in active use anyway. The sweep clears `used` as it
    // passes, so once no slot is held a victim falls out within two laps.
    fn evict(&self, hand: &mut usize) -> (&Slot, MutexGuard<'_, [u8; SECTOR_SIZE]>) {
        loop {
            let slot = &self.slots[*hand];
            if let Some(guard) = slot.data.try_lock() {
                if !slot.valid.load(Ordering::Relaxed) {
                    return (slot, guard);
                }
                if slot.used.load(Ordering::Relaxed) {
                    slot.used.store(false, Ordering::Relaxed);
                } else {
                    if slot.dirty.load(Ordering::Relaxed) {
                        self.writeback(slot, &guard);
                    }
                    return (slot, guard);
                }
            }
            *hand = (*hand + 1) % NBUF;
        }
    }

    // Push one slot's bytes to the device and mark it clean. Caller holds
    // the slot's data lock.
    fn writeback(&self, slot: &Slot, data: &[u8; SECTOR_SIZE]) {
        let sector = slot.sector.load(Ordering::Relaxed);
        log::trace!("bio: write back sector {sector}");
        self.dev.write_sector(sector, data);
        self.disk_writes.fetch_add(1, Ordering::Relaxed);
        slot.dirty.store(false, Ordering::Relaxed);
    }

    /// Write every dirty slot back to the device.
    pub fn flush_all(&self) {
        let _hand = self.hand.lock();
        for slot in self.slots.iter() {
            // Blocking acquire here: a holder may still be copying bytes
            // in, and those bytes must land on the device too.
            let guard = slot.data.lock();
            if slot.dirty.load(Ordering::Relaxed) {
                self.writeback(slot, &guard);
            }
        }
    }

    /// Flush everything out. The slots themselves are reclaimed when the
    /// cache is dropped.
    pub fn close(&self) {
        self.flush_all();
    }

    /// Flush, then forget every binding and zero the counters, leaving the
    /// cache as if freshly created.
    pub fn reset(&self) {
        let mut hand = self.hand.lock();
        for slot in self.slots.iter() {
            let mut guard = slot.data.lock();
            if slot.dirty.load(Ordering::Relaxed) {
                self.writeback(slot, &guard);
            }
            slot.valid.store(false, Ordering::Relaxed);
            slot.used.store(false, Ordering::Relaxed);
            slot.sector.store(0, Ordering::Relaxed);
            guard.fill(0);
        }
        *hand = 0;
        self.tries.store(0, Ordering::Relaxed);
        self.hits.store(0, Ordering::Relaxed);
        self.disk_reads.store(0, Ordering::Relaxed);
        self.disk_writes.store(0, Ordering::Relaxed);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            tries: self.tries.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            disk_reads: self.disk_reads.load(Ordering::Relaxed),
            disk_writes: self.disk_writes.load(Ordering::Relaxed),
        }
    }
}
