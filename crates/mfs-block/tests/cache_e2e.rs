#![forbid(unsafe_code)]

use mfs_block::{
    Access, BlockCache, BlockRef, BlockTransport, CacheTunables, EndIoHandle, PageBuf, SubmitOp,
};
use mfs_error::{MfsError, Result};
use mfs_types::{BlockNumber, BLOCK_SIZE};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

/// In-memory transport that completes submissions from worker threads,
/// recording every read and write it sees.
struct MemTransport {
    end_io: EndIoHandle,
    store: Arc<Mutex<HashMap<u64, Vec<u8>>>>,
    fail_reads: Arc<Mutex<HashSet<u64>>>,
    write_log: Arc<Mutex<Vec<(u64, Vec<u8>)>>>,
    reads: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
    delay: Duration,
}

#[derive(Clone, Default)]
struct MemHandles {
    store: Arc<Mutex<HashMap<u64, Vec<u8>>>>,
    fail_reads: Arc<Mutex<HashSet<u64>>>,
    write_log: Arc<Mutex<Vec<(u64, Vec<u8>)>>>,
    reads: Arc<AtomicUsize>,
    writes: Arc<AtomicUsize>,
}

impl MemHandles {
    fn writes_for(&self, bnr: u64) -> Vec<Vec<u8>> {
        self.write_log
            .lock()
            .iter()
            .filter(|(b, _)| *b == bnr)
            .map(|(_, data)| data.clone())
            .collect()
    }

    fn write_order(&self) -> Vec<u64> {
        self.write_log.lock().iter().map(|(b, _)| *b).collect()
    }
}

impl MemTransport {
    fn build(handles: &MemHandles, delay: Duration) -> impl FnOnce(EndIoHandle) -> Result<Box<dyn BlockTransport>> + '_ {
        move |end_io| {
            Ok(Box::new(MemTransport {
                end_io,
                store: Arc::clone(&handles.store),
                fail_reads: Arc::clone(&handles.fail_reads),
                write_log: Arc::clone(&handles.write_log),
                reads: Arc::clone(&handles.reads),
                writes: Arc::clone(&handles.writes),
                delay,
            }))
        }
    }
}

impl BlockTransport for MemTransport {
    fn queue_depth(&self) -> usize {
        16
    }

    fn submit_block(&self, op: SubmitOp, bnr: BlockNumber, data: Option<PageBuf>) -> Result<()> {
        let end_io = self.end_io.clone();
        let store = Arc::clone(&self.store);
        let fail_reads = Arc::clone(&self.fail_reads);
        let write_log = Arc::clone(&self.write_log);
        let reads = Arc::clone(&self.reads);
        let writes = Arc::clone(&self.writes);
        let delay = self.delay;

        thread::spawn(move || {
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            match op {
                SubmitOp::GetRead | SubmitOp::GetWrite => {
                    reads.fetch_add(1, Ordering::SeqCst);
                    if fail_reads.lock().contains(&bnr.0) {
                        end_io.end_io(bnr, None, -libc::EIO);
                        return;
                    }
                    let page = match store.lock().get(&bnr.0) {
                        Some(bytes) => PageBuf::from_slice(bytes),
                        None => PageBuf::zeroed(),
                    };
                    end_io.end_io(bnr, Some(page), 0);
                }
                SubmitOp::Write => {
                    writes.fetch_add(1, Ordering::SeqCst);
                    let page = data.expect("write submitted without payload");
                    store.lock().insert(bnr.0, page.as_slice().to_vec());
                    write_log.lock().push((bnr.0, page.as_slice().to_vec()));
                    end_io.end_io(bnr, None, 0);
                }
            }
        });
        Ok(())
    }
}

fn mem_cache(tunables: CacheTunables, handles: &MemHandles, delay: Duration) -> BlockCache {
    BlockCache::setup(tunables, MemTransport::build(handles, delay)).expect("cache setup")
}

fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(2));
    }
    panic!("timed out waiting for {what}");
}

fn pattern(salt: u8) -> Vec<u8> {
    (0..BLOCK_SIZE).map(|i| salt.wrapping_add(i as u8)).collect()
}

fn write_blocks(cache: &BlockCache, bnrs: &[u64], salt: u8) {
    let refs: Vec<BlockRef> = bnrs
        .iter()
        .map(|b| cache.acquire(BlockNumber(*b), Access::WRITE).expect("write acquire"))
        .collect();
    cache.dirty_begin(&refs).expect("dirty_begin");
    for r in &refs {
        r.buf_mut().as_mut_slice().copy_from_slice(&pattern(salt));
    }
    cache.dirty_end(&refs);
}

#[test]
fn s1_read_through_returns_zeros() {
    let handles = MemHandles::default();
    let cache = mem_cache(CacheTunables::default(), &handles, Duration::from_millis(5));

    let blref = cache
        .acquire(BlockNumber(7), Access::READ)
        .expect("read acquire");
    assert!(blref.buf().as_slice().iter().all(|b| *b == 0));
    drop(blref);

    assert_eq!(handles.reads.load(Ordering::SeqCst), 1);
    wait_for("submissions to drain", || cache.metrics().nr_submitted == 0);
    assert_eq!(cache.metrics().nr_dirty, 0);
    assert_eq!(cache.metrics().submissions, 1);
}

#[test]
fn new_block_is_zeroed_without_a_read() {
    let handles = MemHandles::default();
    let cache = mem_cache(CacheTunables::default(), &handles, Duration::ZERO);

    let blref = cache
        .acquire(BlockNumber(3), Access::NEW | Access::WRITE)
        .expect("new acquire");
    assert!(blref.buf().as_slice().iter().all(|b| *b == 0));
    drop(blref);

    // Repeated acquire sees the same zeroed, up-to-date block.
    let again = cache
        .acquire(BlockNumber(3), Access::READ)
        .expect("re-acquire");
    assert!(again.buf().as_slice().iter().all(|b| *b == 0));

    assert_eq!(handles.reads.load(Ordering::SeqCst), 0);
    assert_eq!(cache.metrics().submissions, 0);
}

#[test]
fn read_write_access_is_exclusive() {
    let handles = MemHandles::default();
    let cache = mem_cache(CacheTunables::default(), &handles, Duration::ZERO);

    let err = cache
        .acquire(BlockNumber(1), Access::READ | Access::WRITE)
        .expect_err("conflicting access must fail");
    assert!(matches!(err, MfsError::Invalid(_)));
}

#[test]
fn concurrent_acquires_share_one_submission() {
    let handles = MemHandles::default();
    let cache = Arc::new(mem_cache(
        CacheTunables::default(),
        &handles,
        Duration::from_millis(30),
    ));
    let barrier = Arc::new(Barrier::new(8));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let blref = cache
                    .acquire(BlockNumber(11), Access::READ)
                    .expect("racing acquire");
                assert!(blref.buf().as_slice().iter().all(|b| *b == 0));
            })
        })
        .collect();

    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(handles.reads.load(Ordering::SeqCst), 1);
}

#[test]
fn s2_overlapping_dirtiers_merge_into_one_set() {
    let handles = MemHandles::default();
    let cache = mem_cache(CacheTunables::default(), &handles, Duration::ZERO);

    write_blocks(&cache, &[1, 2], 0xA0);
    write_blocks(&cache, &[2, 3], 0xB0);

    // The second dirtying found block 2 already in a set, so the walk
    // merged everything into that set and no second sequence was stamped.
    assert_eq!(cache.metrics().dirty_seq, 1);

    cache.sync().expect("sync");

    assert_eq!(cache.metrics().nr_dirty, 0);
    assert_eq!(handles.writes.load(Ordering::SeqCst), 3);
    assert_eq!(handles.writes_for(1), vec![pattern(0xA0)]);
    assert_eq!(handles.writes_for(3), vec![pattern(0xB0)]);
    // Block 2 was rewritten by the second dirtier.
    assert_eq!(handles.writes_for(2), vec![pattern(0xB0)]);
}

#[test]
fn disjoint_dirtiers_do_not_merge() {
    let handles = MemHandles::default();
    let cache = mem_cache(CacheTunables::default(), &handles, Duration::ZERO);

    write_blocks(&cache, &[1, 2], 0x11);
    write_blocks(&cache, &[10, 11], 0x22);

    assert_eq!(cache.metrics().dirty_seq, 2);
    cache.sync().expect("sync");
    assert_eq!(cache.metrics().nr_dirty, 0);
    assert_eq!(handles.writes.load(Ordering::SeqCst), 4);
}

#[test]
fn concurrent_disjoint_dirtiers_both_succeed() {
    let handles = MemHandles::default();
    let cache = Arc::new(mem_cache(CacheTunables::default(), &handles, Duration::ZERO));
    let barrier = Arc::new(Barrier::new(2));

    let workers: Vec<_> = [(1_u64, 0x31_u8), (100, 0x32)]
        .into_iter()
        .map(|(base, salt)| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                write_blocks(&cache, &[base, base + 1, base + 2], salt);
            })
        })
        .collect();

    for w in workers {
        w.join().unwrap();
    }

    assert_eq!(cache.metrics().dirty_seq, 2);
    cache.sync().expect("sync");
    assert_eq!(cache.metrics().nr_dirty, 0);
    assert_eq!(handles.writes.load(Ordering::SeqCst), 6);
}

#[test]
fn s3_merge_overflow_forces_sync_of_older_set() {
    let handles = MemHandles::default();
    let tunables = CacheTunables {
        set_limit: 4,
        ..CacheTunables::default()
    };
    let cache = mem_cache(tunables, &handles, Duration::ZERO);

    write_blocks(&cache, &[1, 2, 3, 4], 0x41);
    // Touches a block of the full set; dirtying must write the old set
    // out before a fresh set can hold the batch.
    write_blocks(&cache, &[4, 5, 6], 0x42);

    assert_eq!(cache.metrics().dirty_seq, 2);

    // The first set's writeback completed before the second batch was
    // dirtied at all.
    let order = handles.write_order();
    assert_eq!(order.len(), 4, "only the first set is written so far: {order:?}");
    let first_four: HashSet<u64> = order.iter().copied().collect();
    assert_eq!(first_four, HashSet::from([1, 2, 3, 4]));

    cache.sync().expect("sync");
    let order = handles.write_order();
    assert_eq!(order.len(), 7);
    let second: HashSet<u64> = order[4..].iter().copied().collect();
    assert_eq!(second, HashSet::from([4, 5, 6]));
    assert_eq!(cache.metrics().nr_dirty, 0);

    // Block 4 carries the first pattern then the second.
    assert_eq!(
        handles.writes_for(4),
        vec![pattern(0x41), pattern(0x42)]
    );
}

#[test]
fn oversized_write_batch_is_rejected() {
    let handles = MemHandles::default();
    let tunables = CacheTunables {
        set_limit: 4,
        ..CacheTunables::default()
    };
    let cache = mem_cache(tunables, &handles, Duration::ZERO);

    let refs: Vec<BlockRef> = (0..5)
        .map(|b| cache.acquire(BlockNumber(b), Access::WRITE).expect("acquire"))
        .collect();
    let err = cache.dirty_begin(&refs).expect_err("batch above set limit");
    assert!(matches!(err, MfsError::Invalid(_)));
}

#[test]
fn dirty_limit_blocks_admission_until_writeback() {
    let handles = MemHandles::default();
    let tunables = CacheTunables {
        dirty_limit: 4,
        writeback_thresh: 100,
        set_limit: 64,
    };
    let cache = Arc::new(mem_cache(tunables, &handles, Duration::ZERO));

    // Saturate the dirty limit; the threshold is out of reach so nothing
    // drains on its own.
    write_blocks(&cache, &[1, 2, 3, 4], 0x55);
    assert_eq!(cache.metrics().nr_dirty, 4);

    let dirtier = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || {
            write_blocks(&cache, &[9], 0x66);
        })
    };

    // The extra dirtier must be held at the admission gate.
    thread::sleep(Duration::from_millis(50));
    assert!(!dirtier.is_finished(), "dirtier admitted past the limit");

    cache.sync().expect("sync");
    dirtier.join().unwrap();

    cache.sync().expect("final sync");
    assert_eq!(cache.metrics().nr_dirty, 0);
    assert_eq!(handles.writes_for(9), vec![pattern(0x66)]);
}

#[test]
fn empty_dirty_begin_is_a_noop() {
    let handles = MemHandles::default();
    let cache = mem_cache(CacheTunables::default(), &handles, Duration::ZERO);

    cache.dirty_begin(&[]).expect("empty begin");
    cache.dirty_end(&[]);
    cache.sync().expect("sync of nothing");
    assert_eq!(cache.metrics().dirty_seq, 0);
}

#[test]
fn s4_read_errors_propagate_and_reclaim() {
    let handles = MemHandles::default();
    let cache = Arc::new(mem_cache(
        CacheTunables::default(),
        &handles,
        Duration::from_millis(20),
    ));
    handles.fail_reads.lock().insert(9);

    // Concurrent acquirers share one failing submission and all observe
    // the stored error.
    let barrier = Arc::new(Barrier::new(4));
    let workers: Vec<_> = (0..4)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache.acquire(BlockNumber(9), Access::READ).err()
            })
        })
        .collect();
    for w in workers {
        let err = w.join().unwrap().expect("acquire must fail");
        assert!(matches!(err, MfsError::Io(_)), "unexpected error {err:?}");
    }
    assert_eq!(handles.reads.load(Ordering::SeqCst), 1);

    // All references are gone, so the error block was reclaimed and a
    // fresh acquire issues a new submission.
    handles.fail_reads.lock().clear();
    wait_for("error block reclaim", || cache.metrics().resident == 0);
    let blref = cache
        .acquire(BlockNumber(9), Access::READ)
        .expect("fresh acquire after reclaim");
    assert!(blref.buf().as_slice().iter().all(|b| *b == 0));
    assert_eq!(handles.reads.load(Ordering::SeqCst), 2);
}

#[test]
fn sync_latches_write_errors_for_waiters() {
    struct FailingWrites {
        end_io: EndIoHandle,
        attempts: Arc<AtomicUsize>,
    }

    impl BlockTransport for FailingWrites {
        fn queue_depth(&self) -> usize {
            8
        }

        fn submit_block(
            &self,
            op: SubmitOp,
            bnr: BlockNumber,
            _data: Option<PageBuf>,
        ) -> Result<()> {
            let end_io = self.end_io.clone();
            let attempts = Arc::clone(&self.attempts);
            thread::spawn(move || match op {
                SubmitOp::GetRead | SubmitOp::GetWrite => {
                    end_io.end_io(bnr, Some(PageBuf::zeroed()), 0);
                }
                SubmitOp::Write => {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    end_io.end_io(bnr, None, -libc::EIO);
                }
            });
            Ok(())
        }
    }

    let attempts = Arc::new(AtomicUsize::new(0));
    let cache = {
        let attempts = Arc::clone(&attempts);
        BlockCache::setup(CacheTunables::default(), move |end_io| {
            Ok(Box::new(FailingWrites { end_io, attempts }))
        })
        .expect("cache setup")
    };

    write_blocks(&cache, &[1, 2], 0x77);
    let err = cache.sync().expect_err("sync must observe the write failure");
    assert!(matches!(err, MfsError::Io(_)));

    // The failed set keeps its blocks dirty rather than dropping them.
    assert_eq!(cache.metrics().nr_dirty, 2);
    wait_for("retained set accounting", || cache.metrics().wb_errors >= 1);
    wait_for("both write attempts", || attempts.load(Ordering::SeqCst) >= 2);
    assert_eq!(cache.metrics().nr_dirty, 2);
}

#[test]
fn repeated_new_acquires_are_idempotent() {
    let handles = MemHandles::default();
    let cache = mem_cache(CacheTunables::default(), &handles, Duration::ZERO);

    for _ in 0..3 {
        let blref = cache
            .acquire(BlockNumber(42), Access::NEW)
            .expect("new acquire");
        assert!(blref.buf().as_slice().iter().all(|b| *b == 0));
    }
    assert_eq!(cache.metrics().submissions, 0);
    assert_eq!(cache.metrics().resident, 1);
}

#[test]
fn sync_returns_once_writeback_catches_up() {
    let handles = MemHandles::default();
    let cache = mem_cache(CacheTunables::default(), &handles, Duration::from_millis(5));

    for round in 0_u64..3 {
        write_blocks(&cache, &[round * 10, round * 10 + 1], round as u8);
        cache.sync().expect("round sync");
        assert_eq!(cache.metrics().nr_dirty, 0);
        assert_eq!(cache.metrics().nr_writeback, 0);
    }
    assert_eq!(handles.writes.load(Ordering::SeqCst), 6);

    let m = cache.metrics();
    assert!(m.writeback_seq >= m.sync_seq || m.sync_seq == m.dirty_seq);
}
