//! Local block transport over a block device or image file.
//!
//! A fixed pool of in-flight descriptors keeps a bounded queue depth of
//! block I/Os moving. Two bitmaps describe the pool: `empty` marks
//! descriptors available to `submit_block`, `submit` marks descriptors
//! filled and waiting for the submitter. Managing the pool through
//! atomics keeps producers (cache submit worker) and consumers (reaper)
//! off each other's locks.
//!
//! Two long-lived threads drive the pool: the submitter gathers marked
//! descriptors and performs the positioned I/O batch, the reaper turns
//! results into `end_io` completions and returns descriptors to the
//! empty pool.

use crate::cache::EndIoHandle;
use crate::page::PageBuf;
use crate::sync::WaitQueue;
use crate::transport::{BlockTransport, SubmitOp};
use crossbeam_queue::SegQueue;
use mfs_error::{MfsError, Result};
use mfs_types::{BlockNumber, BLOCK_SIZE};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, trace, warn};

/// Pool size; one word of bitmap bits minus one for slop.
pub const QUEUE_DEPTH: usize = (u64::BITS - 1) as usize;

const FULL_POOL: u64 = (1_u64 << QUEUE_DEPTH) - 1;

struct Descriptor {
    op: Option<SubmitOp>,
    bnr: BlockNumber,
    data: Option<PageBuf>,
}

impl Descriptor {
    fn empty() -> Self {
        Self {
            op: None,
            bnr: BlockNumber(0),
            data: None,
        }
    }
}

struct DirectInner {
    file: File,
    direct_io: bool,
    end_io: EndIoHandle,

    descs: Vec<Mutex<Descriptor>>,
    empty_bmap: AtomicU64,
    submit_bmap: AtomicU64,
    submit_waitq: WaitQueue,

    /// Completed descriptor indices with their raw result: the block size
    /// on success, a negative errno on failure.
    completions: SegQueue<(usize, i64)>,
    reap_waitq: WaitQueue,
    stop: AtomicBool,
}

/// Direct-I/O block transport against a local device path.
pub struct DirectTransport {
    inner: Arc<DirectInner>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

/// Claim the lowest set bit of `bmap`, racing against peers.
///
/// Returns `None` only when the bitmap is empty. A lost test-and-clear
/// race spins and retries.
fn claim_bit(bmap: &AtomicU64) -> Option<usize> {
    loop {
        let bits = bmap.load(Ordering::SeqCst);
        if bits == 0 {
            return None;
        }
        let nr = bits.trailing_zeros() as usize;
        let prev = bmap.fetch_and(!(1_u64 << nr), Ordering::SeqCst);
        if prev & (1_u64 << nr) != 0 {
            return Some(nr);
        }
        std::hint::spin_loop();
    }
}

fn io_errno(err: &std::io::Error) -> i64 {
    i64::from(-err.raw_os_error().unwrap_or(libc::EIO))
}

impl DirectTransport {
    /// Open `path` for direct I/O, falling back to buffered I/O when the
    /// filesystem rejects `O_DIRECT`.
    pub fn open(path: &Path, end_io: EndIoHandle) -> Result<Self> {
        let mut direct_io = true;
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_DIRECT)
            .open(path)
        {
            Ok(file) => file,
            Err(err) if err.raw_os_error() == Some(libc::EINVAL) => {
                direct_io = false;
                info!(
                    target: "mfs::block::direct",
                    event = "direct_io_unsupported",
                    path = %path.display()
                );
                OpenOptions::new().read(true).write(true).open(path)?
            }
            Err(err) => return Err(MfsError::Io(err)),
        };

        let mut descs = Vec::with_capacity(QUEUE_DEPTH);
        for _ in 0..QUEUE_DEPTH {
            descs.push(Mutex::new(Descriptor::empty()));
        }

        let inner = Arc::new(DirectInner {
            file,
            direct_io,
            end_io,
            descs,
            empty_bmap: AtomicU64::new(FULL_POOL),
            submit_bmap: AtomicU64::new(0),
            submit_waitq: WaitQueue::new(),
            completions: SegQueue::new(),
            reap_waitq: WaitQueue::new(),
            stop: AtomicBool::new(false),
        });

        let submitter = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("mfs-direct-submit".to_owned())
                .spawn(move || submit_thread(&inner))?
        };
        let reaper = {
            let inner = Arc::clone(&inner);
            thread::Builder::new()
                .name("mfs-direct-reap".to_owned())
                .spawn(move || reap_thread(&inner))?
        };

        debug!(
            target: "mfs::block::direct",
            event = "transport_open",
            path = %path.display(),
            direct_io,
            queue_depth = QUEUE_DEPTH
        );
        Ok(Self {
            inner,
            threads: Mutex::new(vec![submitter, reaper]),
        })
    }

    /// Whether the device was opened with `O_DIRECT`.
    #[must_use]
    pub fn direct_io(&self) -> bool {
        self.inner.direct_io
    }

    /// Number of descriptors currently out of the empty pool.
    #[must_use]
    pub fn in_flight(&self) -> u32 {
        QUEUE_DEPTH as u32 - self.inner.empty_bmap.load(Ordering::SeqCst).count_ones()
    }
}

impl BlockTransport for DirectTransport {
    fn queue_depth(&self) -> usize {
        QUEUE_DEPTH
    }

    fn submit_block(&self, op: SubmitOp, bnr: BlockNumber, data: Option<PageBuf>) -> Result<()> {
        let inner = &self.inner;
        if inner.stop.load(Ordering::SeqCst) {
            return Err(MfsError::ShuttingDown);
        }

        // The cache bounds submissions by our queue depth; an empty pool
        // here is a broken caller.
        let nr = claim_bit(&inner.empty_bmap)
            .unwrap_or_else(|| panic!("direct transport descriptor pool exhausted"));

        {
            let mut desc = inner.descs[nr].lock();
            desc.op = Some(op);
            desc.bnr = bnr;
            desc.data = data;
        }

        trace!(
            target: "mfs::block::direct",
            event = "descriptor_filled",
            descriptor = nr,
            block = bnr.0,
            op = ?op
        );
        inner.submit_bmap.fetch_or(1_u64 << nr, Ordering::SeqCst);
        inner.submit_waitq.wake_all();
        Ok(())
    }

    fn shutdown(&self) {
        if self.inner.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.submit_waitq.wake_all();
        self.inner.reap_waitq.wake_all();
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
        debug!(target: "mfs::block::direct", event = "transport_shutdown");
    }
}

impl Drop for DirectTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Waits for filled descriptors and performs the positioned I/O batch.
fn submit_thread(inner: &Arc<DirectInner>) {
    loop {
        inner.submit_waitq.wait_until(|| {
            inner.submit_bmap.load(Ordering::SeqCst) != 0 || inner.stop.load(Ordering::SeqCst)
        });
        if inner.stop.load(Ordering::SeqCst) {
            break;
        }

        let mut batch = Vec::with_capacity(QUEUE_DEPTH);
        while let Some(nr) = claim_bit(&inner.submit_bmap) {
            batch.push(nr);
        }

        let mut completed = 0_usize;
        for nr in batch {
            let mut desc = inner.descs[nr].lock();
            let op = desc.op.expect("submitted descriptor without an op");
            let offset = desc
                .bnr
                .byte_offset()
                .expect("block number overflows device offset");

            let res: i64 = match op {
                SubmitOp::GetRead | SubmitOp::GetWrite => {
                    let mut page = PageBuf::zeroed();
                    match inner.file.read_exact_at(page.as_mut_slice(), offset) {
                        Ok(()) => {
                            desc.data = Some(page);
                            BLOCK_SIZE as i64
                        }
                        Err(err) => io_errno(&err),
                    }
                }
                SubmitOp::Write => {
                    let data = desc.data.as_ref().expect("write submitted without payload");
                    match inner.file.write_all_at(data.as_slice(), offset) {
                        Ok(()) => BLOCK_SIZE as i64,
                        Err(err) => io_errno(&err),
                    }
                }
            };

            drop(desc);
            inner.completions.push((nr, res));
            completed += 1;
        }

        if completed > 0 {
            inner.reap_waitq.wake_all();
        }
    }
}

/// Turns raw results into `end_io` completions and returns descriptors to
/// the empty pool.
fn reap_thread(inner: &Arc<DirectInner>) {
    loop {
        inner.reap_waitq.wait_until(|| {
            !inner.completions.is_empty() || inner.stop.load(Ordering::SeqCst)
        });

        while let Some((nr, res)) = inner.completions.pop() {
            let (op, bnr, data) = {
                let mut desc = inner.descs[nr].lock();
                let op = desc.op.take().expect("completion for an empty descriptor");
                (op, desc.bnr, desc.data.take())
            };

            let err = if res == BLOCK_SIZE as i64 {
                0
            } else if res < 0 {
                res as i32
            } else {
                -libc::EIO
            };
            if err < 0 {
                warn!(
                    target: "mfs::block::direct",
                    event = "io_failed",
                    block = bnr.0,
                    errno = err
                );
            }

            let fresh = if op.is_read() && err == 0 { data } else { None };
            inner.end_io.end_io(bnr, fresh, err);

            // Descriptor fields are consumed above; only then may the
            // empty bit make it claimable again.
            inner.empty_bmap.fetch_or(1_u64 << nr, Ordering::SeqCst);
        }

        if inner.stop.load(Ordering::SeqCst) && inner.completions.is_empty() {
            break;
        }
    }
}
