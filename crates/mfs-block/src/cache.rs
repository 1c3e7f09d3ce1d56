//! The block cache: read-through, dirty grouping, grouped writeback.
//!
//! Cached blocks are indexed by block number in an RCU table so lookups
//! never take a lock; block lifetimes follow the pinned references handed
//! out by the table. Callers dirty blocks in dependent groups, tracked as
//! dirty sets that merge when one operation touches blocks from several
//! sets. Writeback works in units of whole sets, in the order the sets
//! were first dirtied, driven either by accumulation past a threshold or
//! by an explicit sync.
//!
//! Two dedicated worker threads run per cache: the submit worker keeps the
//! transport's queue depth full, and the writeback worker selects dirty
//! sets and feeds their blocks to the submit worker.

use crate::page::PageBuf;
use crate::sync::{WaitQueue, WorkSignal};
use crate::transport::{BlockTransport, SubmitOp};
use arc_swap::ArcSwapOption;
use crossbeam_queue::SegQueue;
use mfs_error::{MfsError, Result};
use mfs_rcu::RcuTable;
use mfs_types::BlockNumber;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

/// Tasks stop dirtying additional blocks once this many blocks are dirty.
pub const DIRTY_LIMIT: usize = 1024;

/// Writeback starts once this many dirty blocks have accumulated.
pub const WRITEBACK_THRESH: usize = 256;

/// Maximum number of blocks in one dirty set, which is also the largest
/// batch one transaction can modify. Merges that would exceed this write
/// out the larger set first.
pub const SET_LIMIT: usize = 64;

/// Cache thresholds; the defaults are the production values.
#[derive(Debug, Clone, Copy)]
pub struct CacheTunables {
    pub dirty_limit: usize,
    pub writeback_thresh: usize,
    pub set_limit: usize,
}

impl Default for CacheTunables {
    fn default() -> Self {
        Self {
            dirty_limit: DIRTY_LIMIT,
            writeback_thresh: WRITEBACK_THRESH,
            set_limit: SET_LIMIT,
        }
    }
}

/// Access flags for [`BlockCache::acquire`].
///
/// `READ` and `WRITE` are mutually exclusive; `NEW` may accompany either
/// and initializes the block to zero without reading it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access(u8);

impl Access {
    /// Return a zeroed up-to-date block without reading the store.
    pub const NEW: Self = Self(1);
    /// Shared read intent.
    pub const READ: Self = Self(2);
    /// Intent to modify within a `dirty_begin`/`dirty_end` bracket.
    pub const WRITE: Self = Self(4);

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    fn conflicting(self) -> bool {
        self.contains(Self::READ) && self.contains(Self::WRITE)
    }
}

impl std::ops::BitOr for Access {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

// Block state bits.
const BL_READING: u32 = 1 << 0;
const BL_UPTODATE: u32 = 1 << 1;
const BL_ERROR: u32 = 1 << 2;
const BL_DIRTY: u32 = 1 << 3;

// Dirty set state bits.
const SET_DIRTYING: u32 = 1 << 0;
const SET_DIRTY: u32 = 1 << 1;
const SET_WRITEBACK: u32 = 1 << 2;

#[inline]
fn test_bit(bits: &AtomicU32, flag: u32) -> bool {
    bits.load(Ordering::SeqCst) & flag != 0
}

#[inline]
fn set_bit(bits: &AtomicU32, flag: u32) {
    bits.fetch_or(flag, Ordering::SeqCst);
}

/// Returns true when the bit was already set.
#[inline]
fn test_and_set_bit(bits: &AtomicU32, flag: u32) -> bool {
    bits.fetch_or(flag, Ordering::SeqCst) & flag != 0
}

#[inline]
fn clear_bit_and_wake(bits: &AtomicU32, flag: u32, waitq: &WaitQueue) {
    if bits.fetch_and(!flag, Ordering::SeqCst) & flag != 0 {
        waitq.wake_all();
    }
}

struct Block {
    bnr: BlockNumber,
    bits: AtomicU32,
    error: AtomicI32,
    page: RwLock<PageBuf>,
    set: ArcSwapOption<DirtySet>,
    waitq: WaitQueue,
}

impl Block {
    fn new(bnr: BlockNumber) -> Self {
        Self {
            bnr,
            bits: AtomicU32::new(0),
            error: AtomicI32::new(0),
            page: RwLock::new(PageBuf::zeroed()),
            set: ArcSwapOption::from(None),
            waitq: WaitQueue::new(),
        }
    }
}

/// A group of blocks whose modifications depend on each other and must
/// reach the store atomically.
struct DirtySet {
    bits: AtomicU32,
    dirty_seq: AtomicU64,
    submitted_blocks: AtomicU32,
    size: AtomicUsize,
    /// Entry-ordered membership. Mutation requires holding `SET_DIRTYING`
    /// (dirtiers) or being the write-completion detach path, which the
    /// `SET_WRITEBACK` bit excludes from dirtiers.
    blocks: Mutex<VecDeque<Arc<Block>>>,
    /// Latched when any block of the current writeback round failed.
    wb_failed: AtomicBool,
    waitq: WaitQueue,
}

impl DirtySet {
    fn new() -> Self {
        Self {
            bits: AtomicU32::new(0),
            dirty_seq: AtomicU64::new(0),
            submitted_blocks: AtomicU32::new(0),
            size: AtomicUsize::new(0),
            blocks: Mutex::new(VecDeque::new()),
            wb_failed: AtomicBool::new(false),
            waitq: WaitQueue::new(),
        }
    }
}

/// What the dirtying walk learned about one block's set membership.
enum OtherSet {
    /// The block already belongs to the caller's merged set.
    InLarge,
    /// The block belongs to (or just founded) a different set.
    Other(Arc<DirtySet>),
    /// Linking the block would grow the merged set past the limit.
    Overflow,
}

// Sync waiters share one latched error word: the low bit records that an
// I/O error happened while any waiter was present, the rest counts the
// waiters. The latch clears when the last waiter leaves.
const SYNC_WAITERS_ERR: i64 = 1;
const SYNC_WAITERS_INC: i64 = 2;

struct CacheShared {
    tunables: CacheTunables,
    table: RcuTable<BlockNumber, Block>,

    transport: OnceLock<Box<dyn BlockTransport>>,
    queue_depth: AtomicUsize,

    nr_dirty: AtomicI64,
    nr_writeback: AtomicI64,
    nr_submitted: AtomicI64,
    sync_waiters: AtomicI64,

    dirty_seq: AtomicU64,
    writeback_seq: AtomicU64,
    sync_seq: AtomicU64,

    submissions: AtomicU64,
    wb_errors: AtomicU64,

    submit_pending: SegQueue<Arc<Block>>,
    writeback_pending: SegQueue<Arc<DirtySet>>,

    waitq: WaitQueue,
    submit_signal: WorkSignal,
    writeback_signal: WorkSignal,
    stop: AtomicBool,
}

/// Snapshot of cache counters, taken without stopping anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheMetrics {
    pub nr_dirty: i64,
    pub nr_writeback: i64,
    pub nr_submitted: i64,
    pub dirty_seq: u64,
    pub writeback_seq: u64,
    pub sync_seq: u64,
    /// Total submissions handed to the transport.
    pub submissions: u64,
    /// Writeback rounds that ended with at least one failed block.
    pub wb_errors: u64,
    /// Blocks currently resident in the index.
    pub resident: usize,
}

/// Completion path handed to transports at setup.
///
/// Calls arriving after the owning cache is gone are dropped; a
/// completion for a block the cache does not know is a fatal logic error.
#[derive(Clone)]
pub struct EndIoHandle {
    shared: Weak<CacheShared>,
}

impl EndIoHandle {
    /// Deliver an I/O completion for `bnr`.
    ///
    /// `err` is zero for success or a negative errno. For read
    /// completions the transport may deliver the freshly-read buffer in
    /// `data` and it is installed under the block.
    pub fn end_io(&self, bnr: BlockNumber, data: Option<PageBuf>, err: i32) {
        if let Some(shared) = self.shared.upgrade() {
            shared.end_io(bnr, data, err);
        }
    }
}

/// A pinned reference to a cached block.
///
/// The buffer view stays valid for the life of the reference. Dropping
/// the reference releases the pin; an error-marked block leaves the index
/// with its last pin so a later acquire can retry the read.
pub struct BlockRef {
    shared: Arc<CacheShared>,
    block: Arc<Block>,
}

impl BlockRef {
    #[must_use]
    pub fn bnr(&self) -> BlockNumber {
        self.block.bnr
    }

    /// Read view of the block contents.
    #[must_use]
    pub fn buf(&self) -> RwLockReadGuard<'_, PageBuf> {
        self.block.page.read()
    }

    /// Mutable view of the block contents.
    ///
    /// Only valid between `dirty_begin` and `dirty_end` on a
    /// write-acquired block, or on a `NEW` block not yet shared.
    pub fn buf_mut(&self) -> RwLockWriteGuard<'_, PageBuf> {
        self.block.page.write()
    }

    /// Copy of the current block contents.
    #[must_use]
    pub fn snapshot(&self) -> PageBuf {
        self.block.page.read().clone()
    }
}

impl Clone for BlockRef {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            block: Arc::clone(&self.block),
        }
    }
}

impl std::fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRef")
            .field("bnr", &self.block.bnr)
            .field("bits", &self.block.bits.load(Ordering::Relaxed))
            .finish()
    }
}

impl Drop for BlockRef {
    fn drop(&mut self) {
        if !test_bit(&self.block.bits, BL_ERROR) {
            return;
        }
        // Last outside pin of an error block unlinks it so the next
        // acquire re-reads. Two counts remain: ours and the index's.
        if Arc::strong_count(&self.block) <= 2 {
            let removed = self
                .shared
                .table
                .remove_if(&self.block.bnr, |entry| Arc::ptr_eq(entry, &self.block));
            if removed.is_some() {
                debug!(
                    target: "mfs::block",
                    event = "error_block_reclaimed",
                    block = self.block.bnr.0
                );
            }
        }
    }
}

/// The cache handle. Dropping it shuts the transport and workers down.
pub struct BlockCache {
    shared: Arc<CacheShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("metrics", &self.metrics())
            .finish_non_exhaustive()
    }
}

impl BlockCache {
    /// Build a cache over a transport.
    ///
    /// `build` receives the completion handle the transport must use for
    /// `end_io` delivery and returns the transport; the cache then reads
    /// its queue depth and starts the worker threads.
    pub fn setup<F>(tunables: CacheTunables, build: F) -> Result<Self>
    where
        F: FnOnce(EndIoHandle) -> Result<Box<dyn BlockTransport>>,
    {
        let shared = Arc::new(CacheShared {
            tunables,
            table: RcuTable::new(),
            transport: OnceLock::new(),
            queue_depth: AtomicUsize::new(0),
            nr_dirty: AtomicI64::new(0),
            nr_writeback: AtomicI64::new(0),
            nr_submitted: AtomicI64::new(0),
            sync_waiters: AtomicI64::new(0),
            dirty_seq: AtomicU64::new(0),
            writeback_seq: AtomicU64::new(0),
            sync_seq: AtomicU64::new(0),
            submissions: AtomicU64::new(0),
            wb_errors: AtomicU64::new(0),
            submit_pending: SegQueue::new(),
            writeback_pending: SegQueue::new(),
            waitq: WaitQueue::new(),
            submit_signal: WorkSignal::new(),
            writeback_signal: WorkSignal::new(),
            stop: AtomicBool::new(false),
        });

        let handle = EndIoHandle {
            shared: Arc::downgrade(&shared),
        };
        let transport = build(handle)?;
        let depth = transport.queue_depth();
        if depth == 0 {
            return Err(MfsError::Invalid("transport advertised zero queue depth"));
        }
        shared.queue_depth.store(depth, Ordering::SeqCst);
        if shared.transport.set(transport).is_err() {
            return Err(MfsError::Invalid("transport already bound"));
        }

        let submit = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("mfs-submit".to_owned())
                .spawn(move || submit_worker(&shared))?
        };
        let writeback = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("mfs-writeback".to_owned())
                .spawn(move || writeback_worker(&shared))?
        };

        debug!(target: "mfs::block", event = "cache_setup", queue_depth = depth);
        Ok(Self {
            shared,
            workers: Mutex::new(vec![submit, writeback]),
        })
    }

    /// Acquire a reference to a block whose buffer is ready to read.
    ///
    /// Misses trigger a read through the transport; all concurrent
    /// acquirers of the same missing block share one submission and wake
    /// together. A stored I/O error is returned until the error block is
    /// reclaimed.
    pub fn acquire(&self, bnr: BlockNumber, access: Access) -> Result<BlockRef> {
        let shared = &self.shared;
        if access.conflicting() {
            return Err(MfsError::Invalid("READ and WRITE access are exclusive"));
        }

        let block = shared.lookup_or_insert(bnr);
        let blref = BlockRef {
            shared: Arc::clone(shared),
            block,
        };

        // A stored I/O error is sticky for this residency; callers keep
        // seeing it until the error block is reclaimed.
        if test_bit(&blref.block.bits, BL_ERROR) {
            let errno = blref.block.error.load(Ordering::SeqCst);
            return Err(MfsError::from_errno(errno));
        }

        if access.contains(Access::NEW) {
            blref.block.page.write().zero();
            set_bit(&blref.block.bits, BL_UPTODATE);
            trace!(target: "mfs::block", event = "acquire_new", block = bnr.0);
        }

        if !test_bit(&blref.block.bits, BL_UPTODATE) {
            if !test_and_set_bit(&blref.block.bits, BL_READING) {
                trace!(target: "mfs::block", event = "read_submit", block = bnr.0);
                shared.submit_pending.push(Arc::clone(&blref.block));
                shared.kick_submit();
            }
            let bits = &blref.block.bits;
            blref.block.waitq.wait_until(|| !test_bit(bits, BL_READING));
        }

        if test_bit(&blref.block.bits, BL_ERROR) {
            let errno = blref.block.error.load(Ordering::SeqCst);
            return Err(MfsError::from_errno(errno));
        }

        Ok(blref)
    }

    /// Merge the caller's write-acquired blocks into one dirty set and
    /// take the set's dirtying lease. Must be paired with
    /// [`BlockCache::dirty_end`] on the same blocks.
    pub fn dirty_begin(&self, blocks: &[BlockRef]) -> Result<()> {
        self.shared.dirty_begin(blocks)
    }

    /// End the modification bracket opened by [`BlockCache::dirty_begin`].
    pub fn dirty_end(&self, blocks: &[BlockRef]) {
        self.shared.dirty_end(blocks);
    }

    /// Write out every block that was dirty at the time of the call.
    ///
    /// Returns an error if any of those writes failed; the error is
    /// shared by all concurrent sync callers.
    pub fn sync(&self) -> Result<()> {
        let seq = self.shared.dirty_seq.load(Ordering::SeqCst);
        self.shared.sync_up_to(seq)
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        let s = &self.shared;
        CacheMetrics {
            nr_dirty: s.nr_dirty.load(Ordering::SeqCst),
            nr_writeback: s.nr_writeback.load(Ordering::SeqCst),
            nr_submitted: s.nr_submitted.load(Ordering::SeqCst),
            dirty_seq: s.dirty_seq.load(Ordering::SeqCst),
            writeback_seq: s.writeback_seq.load(Ordering::SeqCst),
            sync_seq: s.sync_seq.load(Ordering::SeqCst),
            submissions: s.submissions.load(Ordering::SeqCst),
            wb_errors: s.wb_errors.load(Ordering::SeqCst),
            resident: s.table.len(),
        }
    }

    /// Stop the transport, then the workers. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(transport) = self.shared.transport.get() {
            transport.shutdown();
        }
        self.shared.submit_signal.kick();
        self.shared.writeback_signal.kick();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
        debug!(target: "mfs::block", event = "cache_shutdown");
    }
}

impl Drop for BlockCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl CacheShared {
    fn lookup_or_insert(self: &Arc<Self>, bnr: BlockNumber) -> Arc<Block> {
        if let Some(block) = self.table.lookup(&bnr) {
            return block;
        }
        let fresh = Arc::new(Block::new(bnr));
        self.table.insert_or_get(bnr, fresh).entry
    }

    fn queue_depth(&self) -> i64 {
        self.queue_depth.load(Ordering::SeqCst) as i64
    }

    fn kick_submit(&self) {
        if self.nr_submitted.load(Ordering::SeqCst) < self.queue_depth() {
            self.submit_signal.kick();
        }
    }

    /// Writeback runs when a sync is ahead of writeback or enough dirty
    /// blocks have piled up, and there is room in the queue depth.
    fn should_writeback(&self) -> bool {
        let dirty = self.nr_dirty.load(Ordering::SeqCst);
        let writeback = self.nr_writeback.load(Ordering::SeqCst);

        (self.sync_seq.load(Ordering::SeqCst) > self.writeback_seq.load(Ordering::SeqCst)
            || dirty - writeback >= self.tunables.writeback_thresh as i64)
            && writeback < self.queue_depth()
    }

    fn kick_writeback(&self) {
        if self.should_writeback() {
            self.writeback_signal.kick();
        }
    }

    // ── completion ─────────────────────────────────────────────────────

    fn end_io(&self, bnr: BlockNumber, data: Option<PageBuf>, err: i32) {
        let block = self
            .table
            .lookup(&bnr)
            .unwrap_or_else(|| panic!("I/O completion for unknown block {bnr}"));

        if test_bit(&block.bits, BL_READING) {
            self.end_read_io(&block, data, err);
        } else {
            self.end_write_io(&block, err);
        }

        self.nr_submitted.fetch_sub(1, Ordering::SeqCst);
        self.kick_submit();
    }

    fn end_read_io(&self, block: &Arc<Block>, data: Option<PageBuf>, err: i32) {
        if err < 0 {
            set_bit(&block.bits, BL_ERROR);
            block.error.store(err, Ordering::SeqCst);
            self.sync_waiters_set_error();
            self.waitq.wake_all();
            warn!(
                target: "mfs::block",
                event = "read_error",
                block = block.bnr.0,
                errno = err
            );
        } else if let Some(fresh) = data {
            // The transport read into a fresh page; swap it in under the
            // block. READING excludes readers until we clear it.
            *block.page.write() = fresh;
        }

        if !test_bit(&block.bits, BL_ERROR) {
            set_bit(&block.bits, BL_UPTODATE);
        }
        trace!(target: "mfs::block", event = "read_done", block = block.bnr.0, errno = err);
        clear_bit_and_wake(&block.bits, BL_READING, &block.waitq);
    }

    fn end_write_io(&self, block: &Arc<Block>, err: i32) {
        let set = block
            .set
            .load_full()
            .unwrap_or_else(|| panic!("write completion for block {} without a set", block.bnr));

        if err < 0 {
            // Write failures keep the blocks dirty; the set is retried on
            // a later writeback pass and sync waiters see the error now.
            set.wb_failed.store(true, Ordering::SeqCst);
            self.sync_waiters_set_error();
            self.waitq.wake_all();
            warn!(
                target: "mfs::block::wb",
                event = "write_error",
                block = block.bnr.0,
                errno = err
            );
        }

        // Each finished block frees room in the queue depth.
        self.nr_writeback.fetch_sub(1, Ordering::SeqCst);
        self.kick_writeback();

        if set.submitted_blocks.fetch_sub(1, Ordering::SeqCst) > 1 {
            return;
        }

        if set.wb_failed.load(Ordering::SeqCst) {
            self.retain_failed_set(&set);
            return;
        }

        // Whole set written: detach every block, drop the dirty
        // accounting, and let the next dirtier start a fresh set. Each
        // decrement pairs with an observed dirty bit so the counter
        // cannot drift against the marks.
        let size = set.size.swap(0, Ordering::SeqCst);
        {
            let mut blocks = set.blocks.lock();
            for bl in blocks.drain(..) {
                if bl.bits.fetch_and(!BL_DIRTY, Ordering::SeqCst) & BL_DIRTY != 0 {
                    self.nr_dirty.fetch_sub(1, Ordering::SeqCst);
                }
                bl.set.store(None);
            }
        }
        trace!(
            target: "mfs::block::wb",
            event = "set_complete",
            dirty_seq = set.dirty_seq.load(Ordering::SeqCst),
            size
        );
        clear_bit_and_wake(&set.bits, SET_WRITEBACK, &set.waitq);

        // Finishing the whole set can wake sync or dirty-limit waiters.
        self.waitq.wake_all();
    }

    /// A writeback round of this set failed. Keep the blocks dirty and
    /// requeue the set behind every currently-dirty set so syncs that
    /// follow the failure wait for the rewrite.
    fn retain_failed_set(&self, set: &Arc<DirtySet>) {
        self.wb_errors.fetch_add(1, Ordering::SeqCst);
        set.wb_failed.store(false, Ordering::SeqCst);
        let seq = self.dirty_seq.fetch_add(1, Ordering::SeqCst) + 1;
        set.dirty_seq.store(seq, Ordering::SeqCst);
        warn!(
            target: "mfs::block::wb",
            event = "set_retained_dirty",
            dirty_seq = seq,
            size = set.size.load(Ordering::SeqCst)
        );
        clear_bit_and_wake(&set.bits, SET_WRITEBACK, &set.waitq);
        self.writeback_pending.push(Arc::clone(set));
        self.waitq.wake_all();
        self.kick_writeback();
    }

    // ── sync ───────────────────────────────────────────────────────────

    fn sync_waiters_set_error(&self) {
        let mut old = self.sync_waiters.load(Ordering::SeqCst);
        while old >= SYNC_WAITERS_INC {
            match self.sync_waiters.compare_exchange(
                old,
                old | SYNC_WAITERS_ERR,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(cur) => old = cur,
            }
        }
    }

    fn sync_waiters_has_error(&self) -> bool {
        self.sync_waiters.load(Ordering::SeqCst) & SYNC_WAITERS_ERR != 0
    }

    /// Drop the caller's waiter count, reporting an error latched while it
    /// waited and clearing the latch with the last waiter.
    fn sync_waiters_dec_error(&self) -> Result<()> {
        let mut old = self.sync_waiters.load(Ordering::SeqCst);
        loop {
            let latched = old & SYNC_WAITERS_ERR != 0;
            let mut new = old - SYNC_WAITERS_INC;
            if new == SYNC_WAITERS_ERR {
                new = 0;
            }
            match self
                .sync_waiters
                .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    if latched {
                        return Err(MfsError::Io(std::io::Error::from_raw_os_error(libc::EIO)));
                    }
                    return Ok(());
                }
                Err(cur) => old = cur,
            }
        }
    }

    /// Wait until every set dirtied up to `seq` has started writeback and
    /// no blocks remain in flight, or an error is latched for us.
    fn sync_up_to(&self, seq: u64) -> Result<()> {
        self.sync_waiters.fetch_add(SYNC_WAITERS_INC, Ordering::SeqCst);

        let mut cur = self.sync_seq.load(Ordering::SeqCst);
        while seq > cur {
            match self
                .sync_seq
                .compare_exchange(cur, seq, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => break,
                Err(now) => cur = now,
            }
        }
        self.kick_writeback();

        trace!(target: "mfs::block", event = "sync_begin", seq);
        self.waitq.wait_until(|| {
            self.sync_waiters_has_error()
                || (self.writeback_seq.load(Ordering::SeqCst) >= seq
                    && self.nr_writeback.load(Ordering::SeqCst) == 0)
        });

        self.sync_waiters_dec_error()
    }

    // ── dirtying ───────────────────────────────────────────────────────

    /// Get a reference to a block's set if it differs from `existing`.
    ///
    /// A set-less block is either linked into `existing` (when the set
    /// has room) or published as a fresh single-block set.
    fn other_set(&self, block: &Arc<Block>, existing: Option<&Arc<DirtySet>>) -> OtherSet {
        loop {
            if let Some(cur) = block.set.load_full() {
                if let Some(ex) = existing {
                    if Arc::ptr_eq(&cur, ex) {
                        return OtherSet::InLarge;
                    }
                }
                return OtherSet::Other(cur);
            }

            if let Some(ex) = existing {
                // Linking one more block into a full set writes the set
                // out first.
                if ex.size.load(Ordering::SeqCst) >= self.tunables.set_limit {
                    return OtherSet::Overflow;
                }
                let prev = block
                    .set
                    .compare_and_swap(std::ptr::null::<DirtySet>(), Some(Arc::clone(ex)));
                if prev.is_none() {
                    ex.blocks.lock().push_back(Arc::clone(block));
                    ex.size.fetch_add(1, Ordering::SeqCst);
                    return OtherSet::InLarge;
                }
                std::hint::spin_loop();
                continue;
            }

            let fresh = Arc::new(DirtySet::new());
            fresh.blocks.lock().push_back(Arc::clone(block));
            fresh.size.store(1, Ordering::SeqCst);
            let prev = block
                .set
                .compare_and_swap(std::ptr::null::<DirtySet>(), Some(Arc::clone(&fresh)));
            if prev.is_none() {
                return OtherSet::Other(fresh);
            }
            std::hint::spin_loop();
        }
    }

    /// Mark the not-yet-dirty blocks of `set` and, on its first
    /// dirtying, stamp its writeback position and queue it.
    ///
    /// Merges can leave unmarked blocks anywhere in the list, so the
    /// walk covers every entry. Caller holds `SET_DIRTYING`.
    fn mark_and_stamp(self: &Arc<Self>, set: &Arc<DirtySet>) {
        {
            let blocks = set.blocks.lock();
            for bl in blocks.iter() {
                if !test_bit(&bl.bits, BL_DIRTY) {
                    set_bit(&bl.bits, BL_DIRTY);
                    self.nr_dirty.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        if !test_and_set_bit(&set.bits, SET_DIRTY) {
            let seq = self.dirty_seq.fetch_add(1, Ordering::SeqCst) + 1;
            set.dirty_seq.store(seq, Ordering::SeqCst);
            debug!(
                target: "mfs::block",
                event = "set_dirtied",
                dirty_seq = seq,
                size = set.size.load(Ordering::SeqCst)
            );
            self.writeback_pending.push(Arc::clone(set));
            self.kick_writeback();
        }
    }

    /// Back out of dirtying `set`: unlink the blocks added in this pass
    /// that never became dirty, wherever the walk left them, then
    /// release the dirtying lease.
    fn clear_set_dirtying(&self, set: &Arc<DirtySet>) {
        {
            let mut blocks = set.blocks.lock();
            blocks.retain(|bl| {
                if test_bit(&bl.bits, BL_DIRTY) {
                    return true;
                }
                bl.set.store(None);
                set.size.fetch_sub(1, Ordering::SeqCst);
                false
            });
        }
        clear_bit_and_wake(&set.bits, SET_DIRTYING, &set.waitq);
        self.kick_writeback();
    }

    fn dirty_begin(self: &Arc<Self>, refs: &[BlockRef]) -> Result<()> {
        // An empty write list is a harmless no-op.
        if refs.is_empty() {
            return Ok(());
        }
        // A single set bounds how many blocks one operation can modify.
        if refs.len() > self.tunables.set_limit {
            return Err(MfsError::Invalid("write batch exceeds the dirty set limit"));
        }

        let limit = self.tunables.dirty_limit as i64;
        self.waitq
            .wait_until(|| self.nr_dirty.load(Ordering::SeqCst) < limit);

        let large = 'restart: loop {
            let mut large: Option<Arc<DirtySet>> = None;

            for blref in refs {
                let block = &blref.block;

                let small = match self.other_set(block, large.as_ref()) {
                    // Already in (or just linked into) our merged set.
                    OtherSet::InLarge => continue,
                    OtherSet::Other(set) => set,
                    OtherSet::Overflow => {
                        // The merged set is full; write it out and retry
                        // the whole walk against fresh sets.
                        let lg = large.take().expect("overflow without a merged set");
                        self.mark_and_stamp(&lg);
                        let seq = lg.dirty_seq.load(Ordering::SeqCst);
                        self.clear_set_dirtying(&lg);
                        self.sync_up_to(seq)?;
                        continue 'restart;
                    }
                };

                // Wait until nobody else is dirtying this set.
                if test_and_set_bit(&small.bits, SET_DIRTYING) {
                    if let Some(lg) = large.take() {
                        self.clear_set_dirtying(&lg);
                    }
                    let bits = &small.bits;
                    small.waitq.wait_until(|| !test_bit(bits, SET_DIRTYING));
                    continue 'restart;
                }

                // Wait until the set is not being written.
                if test_bit(&small.bits, SET_WRITEBACK) {
                    self.clear_set_dirtying(&small);
                    if let Some(lg) = large.take() {
                        self.clear_set_dirtying(&lg);
                    }
                    let bits = &small.bits;
                    small.waitq.wait_until(|| !test_bit(bits, SET_WRITEBACK));
                    continue 'restart;
                }

                let Some(lg) = large.take() else {
                    large = Some(small);
                    continue;
                };

                // With both sets held we order them so the smaller merges
                // into the larger.
                let (small, lg) = if small.size.load(Ordering::SeqCst) > lg.size.load(Ordering::SeqCst)
                {
                    (lg, small)
                } else {
                    (small, lg)
                };

                // Merging past the set limit writes out the larger set
                // first and retries the whole walk.
                if lg.size.load(Ordering::SeqCst) + small.size.load(Ordering::SeqCst)
                    > self.tunables.set_limit
                {
                    if lg.dirty_seq.load(Ordering::SeqCst) == 0 {
                        self.mark_and_stamp(&lg);
                    }
                    let seq = lg.dirty_seq.load(Ordering::SeqCst);
                    self.clear_set_dirtying(&small);
                    self.clear_set_dirtying(&lg);
                    self.sync_up_to(seq)?;
                    continue 'restart;
                }

                // Merge the smaller set into the larger, keeping the
                // smaller set's entry order ahead of the larger's.
                {
                    let mut sblocks = small.blocks.lock();
                    let mut lblocks = lg.blocks.lock();
                    for bl in sblocks.iter() {
                        bl.set.store(Some(Arc::clone(&lg)));
                    }
                    while let Some(bl) = sblocks.pop_back() {
                        lblocks.push_front(bl);
                    }
                }
                let moved = small.size.swap(0, Ordering::SeqCst);
                lg.size.fetch_add(moved, Ordering::SeqCst);
                clear_bit_and_wake(&small.bits, SET_DIRTY, &small.waitq);
                clear_bit_and_wake(&small.bits, SET_DIRTYING, &small.waitq);
                trace!(target: "mfs::block", event = "set_merge", moved);
                // The emptied set is freed once its last pin drops.

                // Settle the merged set right away: a part-fresh
                // accumulator spliced into a bigger dirty set leaves its
                // unmarked blocks in the middle of the list, and a later
                // merge may demote this set to the small role, so every
                // block must be dirty and counted before the walk moves
                // on.
                self.mark_and_stamp(&lg);

                large = Some(lg);
            }

            break large.expect("dirty_begin walk of a non-empty list produced no set");
        };

        // Dirtying and modifying will succeed from this point.
        self.mark_and_stamp(&large);

        // SET_DIRTYING stays held; the matching dirty_end releases it.
        Ok(())
    }

    fn dirty_end(&self, refs: &[BlockRef]) {
        if let Some(first) = refs.first() {
            let set = first
                .block
                .set
                .load_full()
                .expect("dirty_end on a block outside any set");
            clear_bit_and_wake(&set.bits, SET_DIRTYING, &set.waitq);
        }
        self.kick_writeback();
    }
}

// ── workers ────────────────────────────────────────────────────────────

/// Keeps the transport's queue depth full. Pending blocks arrive on the
/// lockless list and drain into a private FIFO that preserves dirtying
/// order across runs.
fn submit_worker(shared: &Arc<CacheShared>) {
    let mut fifo: VecDeque<Arc<Block>> = VecDeque::new();

    loop {
        shared.submit_signal.wait();
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        while let Some(block) = shared.submit_pending.pop() {
            fifo.push_back(block);
        }

        while shared.nr_submitted.load(Ordering::SeqCst) < shared.queue_depth() {
            let Some(block) = fifo.pop_front() else {
                break;
            };

            let op = if test_bit(&block.bits, BL_READING) {
                SubmitOp::GetRead
            } else {
                SubmitOp::Write
            };
            let data = match op {
                SubmitOp::Write => Some(block.page.read().clone()),
                SubmitOp::GetRead | SubmitOp::GetWrite => None,
            };

            shared.nr_submitted.fetch_add(1, Ordering::SeqCst);
            shared.submissions.fetch_add(1, Ordering::SeqCst);
            trace!(
                target: "mfs::block",
                event = "submit",
                block = block.bnr.0,
                op = ?op
            );

            let transport = shared.transport.get().expect("transport bound at setup");
            if let Err(err) = transport.submit_block(op, block.bnr, data) {
                // Nothing was queued; complete the block with the error so
                // its waiters observe the failure.
                let errno = err.to_errno();
                warn!(
                    target: "mfs::block",
                    event = "submit_failed",
                    block = block.bnr.0,
                    errno
                );
                shared.end_io(block.bnr, None, errno);
            }
        }
    }
}

/// Selects dirty sets for writeback in dirty_seq order and hands their
/// blocks to the submit worker, paced by the queue depth.
fn writeback_worker(shared: &Arc<CacheShared>) {
    let mut fifo: VecDeque<Arc<DirtySet>> = VecDeque::new();

    loop {
        shared.writeback_signal.wait();
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }

        while let Some(set) = shared.writeback_pending.pop() {
            fifo.push_back(set);
        }

        while let Some(front) = fifo.front() {
            if !shared.should_writeback() {
                break;
            }
            let set = Arc::clone(front);

            set_bit(&set.bits, SET_WRITEBACK);
            // Back off while the set is being dirtied; it stays at the
            // head of the FIFO and is re-examined afterwards.
            if test_bit(&set.bits, SET_DIRTYING) {
                clear_bit_and_wake(&set.bits, SET_WRITEBACK, &set.waitq);
                let bits = &set.bits;
                set.waitq.wait_until(|| !test_bit(bits, SET_DIRTYING));
                continue;
            }

            let _ = fifo.pop_front();
            let size = set.size.load(Ordering::SeqCst);
            if size > 0 {
                shared.nr_writeback.fetch_add(size as i64, Ordering::SeqCst);
                set.submitted_blocks.store(size as u32, Ordering::SeqCst);
                set.wb_failed.store(false, Ordering::SeqCst);

                let blocks: Vec<Arc<Block>> = set.blocks.lock().iter().cloned().collect();
                debug!(
                    target: "mfs::block::wb",
                    event = "set_writeback",
                    dirty_seq = set.dirty_seq.load(Ordering::SeqCst),
                    size
                );
                for bl in blocks {
                    shared.submit_pending.push(bl);
                }
                shared.kick_submit();
            } else {
                // A set emptied by a merge still occupies a FIFO slot;
                // retire it without I/O.
                clear_bit_and_wake(&set.bits, SET_WRITEBACK, &set.waitq);
            }

            shared.writeback_seq.fetch_add(1, Ordering::SeqCst);
            shared.waitq.wake_all();
        }
    }
}
