use crate::bio::Cache;
use crate::dev::BlockDevice;
use crate::freemap::FreeMap;
use crate::param::{INODE_MAGIC, MAXFILE, MAXSECTORS, NDIRECT, NINDIRECT, SECTOR_SIZE};
use crate::Result;
use core::cmp;
use core::mem;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use parking_lot::{Mutex, MutexGuard};
use static_assertions::const_assert_eq;
use std::collections::HashMap;
use std::sync::Arc;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

// Inodes.
//
// An inode describes a single unnamed file. The on-disk record occupies
// exactly one sector and holds the file's length, a directory flag, and
// the pointers to its content: 123 direct sectors, one indirect block of
// 128 pointers, and one doubly-indirect block of 128 pointers to further
// indirect blocks. A zero pointer means "unallocated"; sector 0 never
// holds data, so reads that reach one stop there.
//
// The inode's sector number doubles as its identity. Open inodes share
// one in-memory record, found through a registry keyed by that sector;
// the record carries what is not stored on disk: the open count, the
// deferred-removal flag, the deny-write count, and the inode lock. The
// record lives from first open to last close. A removed inode keeps its
// sectors until the last close, at which point every sector it reaches,
// and the inode sector itself, goes back to the free map.
//
// The on-disk record is not mirrored in memory: every translation reads
// it through the buffer cache, and growth is a read-modify-write of the
// cached sector under the inode lock.

// On-disk inode. Must be exactly one sector.
#[repr(C)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone)]
struct DiskInode {
    length: u32,
    magic: u32,
    direct: [u32; NDIRECT],
    indirect: u32,
    doubly_indirect: u32,
    is_dir: u8,
    unused: [u8; 3],
}
const_assert_eq!(mem::size_of::<DiskInode>(), SECTOR_SIZE);

// A block of sector pointers: the indirect table, the doubly-indirect
// root, or one of its level-1 blocks.
#[repr(transparent)]
#[derive(AsBytes, FromBytes, FromZeroes, Clone)]
struct IndirectBlock {
    ptrs: [u32; NINDIRECT],
}
const_assert_eq!(mem::size_of::<IndirectBlock>(), SECTOR_SIZE);

impl IndirectBlock {
    fn load(cache: &Cache, sector: u32) -> IndirectBlock {
        let mut ind = IndirectBlock::new_zeroed();
        cache.read(sector, ind.as_bytes_mut(), 0);
        ind
    }

    fn store(&self, cache: &Cache, sector: u32) {
        cache.write(sector, self.as_bytes(), 0);
    }
}

// First data-block index served by the doubly-indirect tree.
const DOUBLY_BASE: usize = NDIRECT + NINDIRECT;

fn sectors_for(len: u32) -> usize {
    (len as usize).div_ceil(SECTOR_SIZE)
}

// Metadata sectors (indirect table, doubly-indirect root, level-1 blocks)
// a file of `n` data sectors needs.
fn meta_for(n: usize) -> usize {
    let mut meta = 0;
    if n > NDIRECT {
        meta += 1;
    }
    if n > DOUBLY_BASE {
        meta += 1 + (n - DOUBLY_BASE).div_ceil(NINDIRECT);
    }
    meta
}

impl DiskInode {
    fn load(cache: &Cache, sector: u32) -> DiskInode {
        let mut di = DiskInode::new_zeroed();
        cache.read(sector, di.as_bytes_mut(), 0);
        di
    }

    fn store(&self, cache: &Cache, sector: u32) {
        cache.write(sector, self.as_bytes(), 0);
    }

    // Sector holding data block `bn`, or 0 for a hole or an index past the
    // largest representable file.
    fn sector_of(&self, cache: &Cache, bn: usize) -> u32 {
        if bn < NDIRECT {
            return self.direct[bn];
        }
        if bn < DOUBLY_BASE {
            if self.indirect == 0 {
                return 0;
            }
            let ind = IndirectBlock::load(cache, self.indirect);
            return ind.ptrs[bn - NDIRECT];
        }
        if bn < MAXSECTORS {
            if self.doubly_indirect == 0 {
                return 0;
            }
            let l1 = IndirectBlock::load(cache, self.doubly_indirect);
            let slot = l1.ptrs[(bn - DOUBLY_BASE) / NINDIRECT];
            if slot == 0 {
                return 0;
            }
            let l2 = IndirectBlock::load(cache, slot);
            return l2.ptrs[(bn - DOUBLY_BASE) % NINDIRECT];
        }
        0
    }

    // Grow to `new_len` bytes, zero-filling every new data sector through
    // the cache. All the sectors the growth needs are claimed from the
    // free map up front; if the map runs dry mid-claim, the claimed
    // sectors go back and `self` is left untouched.
    fn extend(&mut self, cache: &Cache, freemap: &FreeMap, new_len: u32) -> Result<()> {
        if new_len <= self.length {
            return Ok(());
        }
        let cur = sectors_for(self.length);
        let target = sectors_for(new_len);
        if target > MAXSECTORS {
            return Err("inode: file too large");
        }
        if target <= cur {
            // The growth fits inside the last allocated sector.
            self.length = new_len;
            return Ok(());
        }

        let ndata = target - cur;
        let nmeta = meta_for(target) - meta_for(cur);
        let mut claimed = Vec::with_capacity(ndata + nmeta);
        for _ in 0..ndata + nmeta {
            match freemap.allocate_one() {
                Some(s) => claimed.push(s),
                None => {
                    log::debug!(
                        "inode: growth to {new_len} bytes needs {} sectors, free map dry after {}",
                        ndata + nmeta,
                        claimed.len()
                    );
                    for s in claimed {
                        freemap.release(s);
                    }
                    return Err("inode: out of sectors");
                }
            }
        }

        // Hand the claimed sectors out in region order: direct pointers,
        // then the indirect table, then the doubly-indirect tree. Indexing
        // `claimed` out of bounds would mean the sizing above and this
        // walk disagree, and the panic is wanted.
        let zeros = [0u8; SECTOR_SIZE];
        let mut left = ndata;
        let mut j = 0;

        let mut i = 0;
        while i < NDIRECT && left > 0 {
            if self.direct[i] == 0 {
                self.direct[i] = claimed[j];
                j += 1;
                cache.write(self.direct[i], &zeros, 0);
                left -= 1;
            }
            i += 1;
        }

        if left > 0 {
            let mut ind = if self.indirect == 0 {
                self.indirect = claimed[j];
                j += 1;
                IndirectBlock::new_zeroed()
            } else {
                IndirectBlock::load(cache, self.indirect)
            };
            let mut i = 0;
            while i < NINDIRECT && left > 0 {
                if ind.ptrs[i] == 0 {
                    ind.ptrs[i] = claimed[j];
                    j += 1;
                    cache.write(ind.ptrs[i], &zeros, 0);
                    left -= 1;
                }
                i += 1;
            }
            ind.store(cache, self.indirect);
        }

        if left > 0 {
            let mut l1 = if self.doubly_indirect == 0 {
                self.doubly_indirect = claimed[j];
                j += 1;
                IndirectBlock::new_zeroed()
            } else {
                IndirectBlock::load(cache, self.doubly_indirect)
            };
            // Start at the level-1 block holding the current tail; the
            // ones before it are full.
            let mut k = if cur > DOUBLY_BASE {
                (cur - 1 - DOUBLY_BASE) / NINDIRECT
            } else {
                0
            };
            while k < NINDIRECT && left > 0 {
                let mut l2 = if l1.ptrs[k] == 0 {
                    l1.ptrs[k] = claimed[j];
                    j += 1;
                    IndirectBlock::new_zeroed()
                } else {
                    IndirectBlock::load(cache, l1.ptrs[k])
                };
                let mut i = 0;
                while i < NINDIRECT && left > 0 {
                    if l2.ptrs[i] == 0 {
                        l2.ptrs[i] = claimed[j];
                        j += 1;
                        cache.write(l2.ptrs[i], &zeros, 0);
                        left -= 1;
                    }
                    i += 1;
                }
                l2.store(cache, l1.ptrs[k]);
                k += 1;
            }
            l1.store(cache, self.doubly_indirect);
        }

        assert_eq!(j, claimed.len(), "inode: growth sizing mismatch");
        self.length = new_len;
        Ok(())
    }
}

// In-memory bookkeeping shared by every handle open on one inode.
struct InodeInner {
    sector: u32,
    is_dir: bool,
    open_cnt: AtomicU32,
    removed: AtomicBool,
    deny_write_cnt: AtomicU32,
    // Serializes translation and growth. The record it guards lives in
    // the cache, so the mutex wraps no data.
    lock: Mutex<()>,
}

struct FsInner {
    cache: Cache,
    freemap: FreeMap,
    inodes: Mutex<HashMap<u32, Arc<InodeInner>>>,
}

/// The file-system core: a device-backed sector cache, the free-sector
/// map, and the registry of open inodes.
pub struct Filesys {
    inner: Arc<FsInner>,
}

impl Filesys {
    /// Bring the core up over `dev`, with `nsectors` sectors under the
    /// free map's control.
    pub fn new(dev: Arc<dyn BlockDevice>, nsectors: u32) -> Filesys {
        Filesys {
            inner: Arc::new(FsInner {
                cache: Cache::new(dev),
                freemap: FreeMap::new(nsectors),
                inodes: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn cache(&self) -> &Cache {
        &self.inner.cache
    }

    pub fn freemap(&self) -> &FreeMap {
        &self.inner.freemap
    }

    /// Write a fresh inode of `length` bytes at `sector` (the caller's
    /// sector, typically just drawn from the free map), zero-filled.
    /// Fails, allocating nothing, if the free map cannot cover `length`
    /// or `length` exceeds the largest representable file.
    pub fn create(&self, sector: u32, length: u32, is_dir: bool) -> Result<()> {
        let mut di = DiskInode::new_zeroed();
        di.magic = INODE_MAGIC;
        di.is_dir = is_dir as u8;
        di.extend(&self.inner.cache, &self.inner.freemap, length)?;
        di.store(&self.inner.cache, sector);
        Ok(())
    }

    /// Open the inode stored at `sector`, joining the existing in-memory
    /// record if any other caller still has it open.
    pub fn open(&self, sector: u32) -> Inode {
        let mut inodes = self.inner.inodes.lock();
        let inner = match inodes.get(&sector) {
            Some(inner) => {
                inner.open_cnt.fetch_add(1, Ordering::Relaxed);
                Arc::clone(inner)
            }
            None => {
                let di = DiskInode::load(&self.inner.cache, sector);
                if di.magic != INODE_MAGIC {
                    log::warn!("inode {sector}: bad magic {:#010x}", di.magic);
                }
                let inner = Arc::new(InodeInner {
                    sector,
                    is_dir: di.is_dir != 0,
                    open_cnt: AtomicU32::new(1),
                    removed: AtomicBool::new(false),
                    deny_write_cnt: AtomicU32::new(0),
                    lock: Mutex::new(()),
                });
                inodes.insert(sector, Arc::clone(&inner));
                inner
            }
        };
        Inode {
            inner,
            fs: Arc::clone(&self.inner),
        }
    }

    /// Push everything unwritten to the device. Call at shutdown.
    pub fn close(&self) {
        self.inner.cache.close();
    }
}

/// A handle on an open inode. Handles on the same inode sector share one
/// in-memory record; dropping the last one (or [`Inode::close`]) retires
/// the record, and releases the inode's sectors if it was removed.
pub struct Inode {
    inner: Arc<InodeInner>,
    fs: Arc<FsInner>,
}

impl Inode {
    /// The inode's sector number, doubling as its identity.
    pub fn inumber(&self) -> u32 {
        self.inner.sector
    }

    pub fn is_dir(&self) -> bool {
        self.inner.is_dir
    }

    pub fn is_removed(&self) -> bool {
        self.inner.removed.load(Ordering::Relaxed)
    }

    pub fn open_count(&self) -> u32 {
        self.inner.open_cnt.load(Ordering::Relaxed)
    }

    pub fn length(&self) -> u32 {
        DiskInode::load(&self.fs.cache, self.inner.sector).length
    }

    /// Another handle on the same inode.
    pub fn reopen(&self) -> Inode {
        self.inner.open_cnt.fetch_add(1, Ordering::Relaxed);
        Inode {
            inner: Arc::clone(&self.inner),
            fs: Arc::clone(&self.fs),
        }
    }

    /// Drop this handle.
    pub fn close(self) {}

    /// Mark the inode for deletion; its sectors are released when the
    /// last open handle goes away.
    pub fn remove(&self) {
        self.inner.removed.store(true, Ordering::Relaxed);
    }

    /// Refuse writes through any handle until a matching
    /// [`Inode::allow_write`]. At most one call per open handle.
    pub fn deny_write(&self) {
        let n = self.inner.deny_write_cnt.fetch_add(1, Ordering::Relaxed) + 1;
        assert!(n <= self.open_count(), "deny_write past open count");
    }

    pub fn allow_write(&self) {
        let n = self.inner.deny_write_cnt.fetch_sub(1, Ordering::Relaxed);
        assert!(n > 0, "allow_write without deny_write");
    }

    // The on-disk record, via the cache. The guard is proof the inode
    // lock is held; translation and growth must not interleave.
    fn disk_inode(&self, _proof: &MutexGuard<'_, ()>) -> DiskInode {
        DiskInode::load(&self.fs.cache, self.inner.sector)
    }

    /// Read into `buf` from byte `offset`. Returns the bytes read: 0 when
    /// the request reaches past end of file, a short count when the walk
    /// hits a hole.
    pub fn read_at(&self, buf: &mut [u8], offset: u32) -> usize {
        let cache = &self.fs.cache;

        {
            let guard = self.inner.lock.lock();
            let di = self.disk_inode(&guard);
            if offset as usize + buf.len() > di.length as usize {
                return 0;
            }
        }

        let mut offset = offset as usize;
        let mut read = 0;
        while read < buf.len() {
            let (sector, length) = {
                let guard = self.inner.lock.lock();
                let di = self.disk_inode(&guard);
                (di.sector_of(cache, offset / SECTOR_SIZE), di.length as usize)
            };
            if sector == 0 {
                break;
            }
            let sector_offs = offset % SECTOR_SIZE;
            let n = cmp::min(
                buf.len() - read,
                cmp::min(SECTOR_SIZE - sector_offs, length - offset),
            );
            if n == 0 {
                break;
            }
            cache.read(sector, &mut buf[read..read + n], sector_offs);
            offset += n;
            read += n;
        }
        read
    }

    /// Write `buf` at byte `offset`, growing the file (zero-filling any
    /// gap) when the write lands past the current end. Returns the bytes
    /// written: 0 when writes are denied or growth fails.
    pub fn write_at(&self, buf: &[u8], offset: u32) -> usize {
        let cache = &self.fs.cache;

        if self.inner.deny_write_cnt.load(Ordering::Relaxed) > 0 {
            return 0;
        }
        let end = offset as usize + buf.len();
        if end > MAXFILE {
            return 0;
        }

        {
            let guard = self.inner.lock.lock();
            let mut di = self.disk_inode(&guard);
            if end > di.length as usize {
                if di.extend(cache, &self.fs.freemap, end as u32).is_err() {
                    return 0;
                }
                di.store(cache, self.inner.sector);
            }
        }

        let mut offset = offset as usize;
        let mut written = 0;
        while written < buf.len() {
            let (sector, length) = {
                let guard = self.inner.lock.lock();
                let di = self.disk_inode(&guard);
                (di.sector_of(cache, offset / SECTOR_SIZE), di.length as usize)
            };
            // The growth above covered every sector this loop touches.
            assert!(sector != 0, "write into unallocated sector");
            let sector_offs = offset % SECTOR_SIZE;
            let n = cmp::min(
                buf.len() - written,
                cmp::min(SECTOR_SIZE - sector_offs, length - offset),
            );
            if n == 0 {
                break;
            }
            cache.write(sector, &buf[written..written + n], sector_offs);
            offset += n;
            written += n;
        }
        written
    }

    // Return every sector the inode reaches to the free map, then the
    // inode sector itself. Runs on the last close of a removed inode.
    fn release_sectors(&self) {
        let cache = &self.fs.cache;
        let freemap = &self.fs.freemap;
        let _guard = self.inner.lock.lock();

        let di = DiskInode::load(cache, self.inner.sector);
        log::trace!(
            "inode {}: last close, releasing {} bytes",
            self.inner.sector,
            di.length
        );
        for &s in di.direct.iter().filter(|s| **s != 0) {
            freemap.release(s);
        }
        if di.indirect != 0 {
            let ind = IndirectBlock::load(cache, di.indirect);
            for &s in ind.ptrs.iter().filter(|s| **s != 0) {
                freemap.release(s);
            }
            freemap.release(di.indirect);
        }
        if di.doubly_indirect != 0 {
            let l1 = IndirectBlock::load(cache, di.doubly_indirect);
            for &b in l1.ptrs.iter().filter(|b| **b != 0) {
                let l2 = IndirectBlock::load(cache, b);
                for &s in l2.ptrs.iter().filter(|s| **s != 0) {
                    freemap.release(s);
                }
                freemap.release(b);
            }
            freemap.release(di.doubly_indirect);
        }
        freemap.release(self.inner.sector);
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        // The decrement happens under the registry lock so a racing open
        // either joins this record before it goes, or misses it entirely.
        let mut inodes = self.fs.inodes.lock();
        if self.inner.open_cnt.fetch_sub(1, Ordering::Relaxed) != 1 {
            return;
        }
        inodes.remove(&self.inner.sector);
        drop(inodes);
        if self.inner.removed.load(Ordering::Relaxed) {
            self.release_sectors();
        }
    }
}


#[cfg(test)]
mod inode_tests {
    use super::*;
    use crate::dev::MemDisk;
    use std::thread;

    fn fresh_fs(nsectors: u32) -> Filesys {
        let disk = Arc::new(MemDisk::new(nsectors));
        Filesys::new(disk, nsectors)
    }

    fn make_inode(fs: &Filesys, length: u32) -> Inode {
        let sector = fs.freemap().allocate_one().unwrap();
        fs.create(sector, length, false).unwrap();
        fs.open(sector)
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    #[test]
    fn write_then_read_small() {
        let fs = fresh_fs(64);
        let ino = make_inode(&fs, 0);

        assert_eq!(ino.write_at(&[0xDE, 0xAD], 0), 2);
        let mut buf = [0; 2];
        assert_eq!(ino.read_at(&mut buf, 0), 2);
        assert_eq!(buf, [0xDE, 0xAD]);
        assert_eq!(ino.length(), 2);
    }

    #[test]
    fn create_with_length_zero_fills() {
        let fs = fresh_fs(64);
        let ino = make_inode(&fs, 3 * SECTOR_SIZE as u32);

        assert_eq!(ino.length(), 3 * SECTOR_SIZE as u32);
        let mut buf = vec![0xFF; 3 * SECTOR_SIZE];
        assert_eq!(ino.read_at(&mut buf, 0), 3 * SECTOR_SIZE);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn hundred_kib_roundtrip_through_indirect() {
        let fs = fresh_fs(1024);
        let ino = make_inode(&fs, 0);

        let payload = pattern(100 * 1024, 7);
        assert_eq!(ino.write_at(&payload, 0), payload.len());
        assert_eq!(ino.length(), 100 * 1024);

        let di = DiskInode::load(fs.cache(), ino.inumber());
        assert!(di.direct.iter().all(|&s| s != 0));
        assert_ne!(di.indirect, 0);
        assert_eq!(di.doubly_indirect, 0);

        let mut buf = vec![0; payload.len()];
        assert_eq!(ino.read_at(&mut buf, 0), payload.len());
        assert_eq!(buf, payload);
    }

    #[test]
    fn sparse_write_lands_in_doubly_region() {
        let fs = fresh_fs(12_000);
        let ino = make_inode(&fs, 0);

        assert_eq!(ino.write_at(&[0x42], 5_000_000), 1);
        assert_eq!(ino.length(), 5_000_001);

        let mut buf = [0xFF; 1];
        assert_eq!(ino.read_at(&mut buf, 5_000_000), 1);
        assert_eq!(buf, [0x42]);

        // Everything before the written byte reads as zero.
        let mut gap = [0xFF; 4096];
        assert_eq!(ino.read_at(&mut gap, 0), 4096);
        assert!(gap.iter().all(|&b| b == 0));
        let mut tail = vec![0xFF; 3905];
        assert_eq!(ino.read_at(&mut tail, 4_996_096), 3905);
        assert!(tail[..3904].iter().all(|&b| b == 0));
        assert_eq!(tail[3904], 0x42);
    }

    #[test]
    fn boundary_write_allocates_indirect_table() {
        let fs = fresh_fs(512);
        let ino = make_inode(&fs, (NDIRECT * SECTOR_SIZE) as u32);

        let di = DiskInode::load(fs.cache(), ino.inumber());
        assert_eq!(di.indirect, 0);

        assert_eq!(ino.write_at(&[1], (NDIRECT * SECTOR_SIZE) as u32), 1);
        let di = DiskInode::load(fs.cache(), ino.inumber());
        assert_ne!(di.indirect, 0);
    }

    #[test]
    fn boundary_write_allocates_doubly_tree() {
        let fs = fresh_fs(512);
        let ino = make_inode(&fs, (DOUBLY_BASE * SECTOR_SIZE) as u32);

        let di = DiskInode::load(fs.cache(), ino.inumber());
        assert_ne!(di.indirect, 0);
        assert_eq!(di.doubly_indirect, 0);

        assert_eq!(ino.write_at(&[1], (DOUBLY_BASE * SECTOR_SIZE) as u32), 1);
        let di = DiskInode::load(fs.cache(), ino.inumber());
        assert_ne!(di.doubly_indirect, 0);
        let l1 = IndirectBlock::load(fs.cache(), di.doubly_indirect);
        assert_ne!(l1.ptrs[0], 0);
        assert!(l1.ptrs[1..].iter().all(|&s| s == 0));
    }

    #[test]
    fn failed_growth_rolls_back() {
        let fs = fresh_fs(40);
        let ino = make_inode(&fs, 0);
        assert_eq!(ino.write_at(&[7; 100], 0), 100);

        // Drain the map down to two sectors, then ask for ten.
        while fs.freemap().free_count() > 2 {
            fs.freemap().allocate_one().unwrap();
        }
        assert_eq!(ino.write_at(&[7; 10 * SECTOR_SIZE], 100), 0);
        assert_eq!(fs.freemap().free_count(), 2);
        assert_eq!(ino.length(), 100);

        // What was there is still readable.
        let mut buf = [0; 100];
        assert_eq!(ino.read_at(&mut buf, 0), 100);
        assert_eq!(buf, [7; 100]);
    }

    #[test]
    fn too_large_fails_atomically() {
        let fs = fresh_fs(64);
        let ino = make_inode(&fs, 0);
        let free = fs.freemap().free_count();
        assert_eq!(ino.write_at(&[1], MAXFILE as u32), 0);
        assert_eq!(ino.length(), 0);
        assert_eq!(fs.freemap().free_count(), free);
    }

    #[test]
    fn read_past_eof_reads_nothing() {
        let fs = fresh_fs(64);
        let ino = make_inode(&fs, 0);
        assert_eq!(ino.write_at(&[1, 2, 3, 4], 0), 4);

        let mut buf = [0xFF; 8];
        assert_eq!(ino.read_at(&mut buf, 0), 0);
        assert_eq!(buf, [0xFF; 8]);
        assert_eq!(ino.read_at(&mut buf, 4), 0);
        let mut buf = [0; 4];
        assert_eq!(ino.read_at(&mut buf, 0), 4);
    }

    #[test]
    fn growth_zero_fills_the_gap() {
        let fs = fresh_fs(64);
        let ino = make_inode(&fs, 0);
        assert_eq!(ino.write_at(&[0xAA, 0xBB], 0), 2);
        assert_eq!(ino.write_at(&[0xCC], 1000), 1);
        assert_eq!(ino.length(), 1001);

        let mut buf = vec![0xFF; 1001];
        assert_eq!(ino.read_at(&mut buf, 0), 1001);
        assert_eq!(&buf[..2], &[0xAA, 0xBB]);
        assert!(buf[2..1000].iter().all(|&b| b == 0));
        assert_eq!(buf[1000], 0xCC);
    }

    #[test]
    fn open_joins_and_reopen_counts() {
        let fs = fresh_fs(64);
        let ino = make_inode(&fs, 0);
        assert_eq!(ino.open_count(), 1);

        let again = fs.open(ino.inumber());
        assert_eq!(ino.open_count(), 2);
        let third = again.reopen();
        assert_eq!(ino.open_count(), 3);
        assert_eq!(third.inumber(), ino.inumber());

        third.close();
        again.close();
        assert_eq!(ino.open_count(), 1);
    }

    #[test]
    fn removal_defers_until_last_close() {
        let fs = fresh_fs(256);
        let baseline = fs.freemap().free_count();

        let h1 = make_inode(&fs, 0);
        assert_eq!(h1.write_at(&pattern(3000, 3), 0), 3000);
        assert!(fs.freemap().free_count() < baseline);

        let h2 = h1.reopen();
        h1.remove();
        assert!(h2.is_removed());

        h1.close();
        // Still open through h2: nothing released, contents intact.
        assert!(fs.freemap().free_count() < baseline);
        let mut buf = vec![0; 3000];
        assert_eq!(h2.read_at(&mut buf, 0), 3000);
        assert_eq!(buf, pattern(3000, 3));
        assert_eq!(h2.open_count(), 1);

        h2.close();
        // Data sectors and the inode sector itself are all back.
        assert_eq!(fs.freemap().free_count(), baseline);
    }

    #[test]
    fn removal_releases_a_doubly_indirect_file() {
        let fs = fresh_fs(12_000);
        let baseline = fs.freemap().free_count();

        let ino = make_inode(&fs, 0);
        assert_eq!(ino.write_at(&[1], 5_000_000), 1);
        ino.remove();
        ino.close();

        assert_eq!(fs.freemap().free_count(), baseline);
    }

    #[test]
    fn deny_write_blocks_until_allowed() {
        let fs = fresh_fs(64);
        let ino = make_inode(&fs, 0);
        assert_eq!(ino.write_at(&[1], 0), 1);

        ino.deny_write();
        assert_eq!(ino.write_at(&[2], 0), 0);
        let mut buf = [0];
        assert_eq!(ino.read_at(&mut buf, 0), 1);
        assert_eq!(buf, [1]);

        ino.allow_write();
        assert_eq!(ino.write_at(&[2], 0), 1);
    }

    #[test]
    fn directory_flag_survives_reopen() {
        let fs = fresh_fs(64);
        let sector = fs.freemap().allocate_one().unwrap();
        fs.create(sector, 0, true).unwrap();
        let ino = fs.open(sector);
        assert!(ino.is_dir());
        assert!(ino.reopen().is_dir());
    }

    #[test]
    fn write_of_presized_file_reads_nothing_new() {
        let fs = fresh_fs(128);
        // 40 sectors: comfortably inside the cache, so the zero-fill from
        // create keeps every data sector resident.
        let len = 40 * SECTOR_SIZE;
        let ino = make_inode(&fs, len as u32);

        let before = fs.cache().stats().disk_reads;
        assert_eq!(ino.write_at(&pattern(len, 9), 0), len);
        assert_eq!(fs.cache().stats().disk_reads, before);
    }

    #[test]
    fn concurrent_disjoint_writers_roundtrip() {
        const WRITES: usize = 1000;
        const CHUNK: usize = 8;

        let fs = fresh_fs(256);
        let ino = make_inode(&fs, 0);

        let mut handles = Vec::new();
        for t in 0u8..2 {
            let ino = ino.reopen();
            handles.push(thread::spawn(move || {
                for i in 0..WRITES {
                    let offset = ((i * 2 + t as usize) * CHUNK) as u32;
                    let payload = [(i as u8) ^ (t * 0x80); CHUNK];
                    assert_eq!(ino.write_at(&payload, offset), CHUNK);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(ino.length() as usize, 2 * WRITES * CHUNK);
        let mut buf = [0; CHUNK];
        for t in 0u8..2 {
            for i in 0..WRITES {
                let offset = ((i * 2 + t as usize) * CHUNK) as u32;
                assert_eq!(ino.read_at(&mut buf, offset), CHUNK);
                assert_eq!(buf, [(i as u8) ^ (t * 0x80); CHUNK], "offset {offset}");
            }
        }

        let stats = fs.cache().stats();
        assert!(stats.hits <= stats.tries);
        assert!(stats.disk_reads <= stats.tries - stats.hits);

        // After a flush the cache is clean: flushing again writes nothing.
        fs.cache().flush_all();
        let flushed = fs.cache().stats().disk_writes;
        fs.cache().flush_all();
        assert_eq!(fs.cache().stats().disk_writes, flushed);
    }

    // A second pass over the same file hits strictly more than the first.
    #[test]
    fn warm_rereads_hit_more() {
        let fs = fresh_fs(64);
        let sector = fs.freemap().allocate_one().unwrap();
        fs.create(sector, 0, false).unwrap();
        let payload = pattern(1024, 5);
        {
            let ino = fs.open(sector);
            assert_eq!(ino.write_at(&payload, 0), 1024);
        }
        fs.cache().reset();

        let mut buf = vec![0; 1024];
        let ino = fs.open(sector);
        assert_eq!(ino.read_at(&mut buf, 0), 1024);
        let cold = fs.cache().stats().hits;
        ino.close();

        let ino = fs.open(sector);
        assert_eq!(ino.read_at(&mut buf, 0), 1024);
        let warm = fs.cache().stats().hits;
        assert!(warm - cold > cold, "cold {cold} warm {warm}");
        assert_eq!(buf, payload);
    }

    #[test]
    fn create_larger_than_max_fails() {
        let fs = fresh_fs(64);
        let sector = fs.freemap().allocate_one().unwrap();
        let free = fs.freemap().free_count();
        assert!(fs.create(sector, MAXFILE as u32 + 1, false).is_err());
        assert_eq!(fs.freemap().free_count(), free);
    }

    #[test]
    fn shutdown_flush_reaches_device() {
        let disk = Arc::new(MemDisk::new(64));
        let fs = Filesys::new(Arc::clone(&disk) as Arc<dyn BlockDevice>, 64);
        let ino = make_inode(&fs, 0);
        assert_eq!(ino.write_at(&[0x5A; 16], 0), 16);
        let data_sector = DiskInode::load(fs.cache(), ino.inumber()).direct[0];

        fs.close();
        let mut raw = [0; SECTOR_SIZE];
        disk.read_sector(data_sector, &mut raw);
        assert_eq!(&raw[..16], &[0x5A; 16]);
    }
}
