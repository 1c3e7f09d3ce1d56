//! The pluggable block transport contract.
//!
//! A transport moves whole blocks between the cache and a backing store,
//! either a local device or remote device servers. Submission is
//! fire-and-forget: every accepted submission must eventually produce a
//! matching completion through the [`EndIoHandle`] the transport was built
//! with, from any thread.

use crate::page::PageBuf;
use mfs_error::Result;
use mfs_types::BlockNumber;

/// Operation carried by one block submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOp {
    /// Fetch the block for read access.
    GetRead,
    /// Fetch the block with intent to write.
    GetWrite,
    /// Write the block contents out.
    Write,
}

impl SubmitOp {
    #[must_use]
    pub fn is_read(self) -> bool {
        matches!(self, Self::GetRead | Self::GetWrite)
    }
}

/// Block mover between the cache and its backing store.
///
/// The cache bounds submissions by [`BlockTransport::queue_depth`]; a
/// transport may treat pool exhaustion as a caller bug.
pub trait BlockTransport: Send + Sync {
    /// Number of submissions the transport can hold in flight.
    fn queue_depth(&self) -> usize;

    /// Submit one block operation.
    ///
    /// `data` carries the block contents for [`SubmitOp::Write`] and is
    /// `None` for reads. An `Ok` return promises a later `end_io` for the
    /// same block number; an `Err` return means nothing was queued.
    fn submit_block(&self, op: SubmitOp, bnr: BlockNumber, data: Option<PageBuf>) -> Result<()>;

    /// Stop accepting submissions and stop producing completions.
    fn shutdown(&self) {}
}
