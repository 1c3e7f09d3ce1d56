#![forbid(unsafe_code)]
//! Multi-block atomic transactions.
//!
//! Callers describe a transaction as a list of blocks with access modes
//! and per-block callbacks. Execution acquires every block in order,
//! running the fallible `prepare` callbacks as it goes, and then commits
//! all write blocks inside one `dirty_begin`/`dirty_end` bracket so they
//! reach the store as an atomic unit.
//!
//! Prepare is where every failure lives: it runs before any buffer is
//! modified and may veto the transaction. Commit cannot fail, which is
//! what removes any need to roll back buffer mutations.

use mfs_block::{Access, BlockCache, BlockRef};
use mfs_error::Result;
use mfs_types::BlockNumber;
use tracing::trace;

/// Fallible per-block preparation, run with the acquired reference before
/// any modification happens.
pub type PrepareFn = Box<dyn FnMut(&BlockRef) -> Result<()> + Send>;

/// Infallible per-block commit, run inside the dirty bracket.
pub type CommitFn = Box<dyn FnMut(&BlockRef) + Send>;

struct TxnBlock {
    bnr: BlockNumber,
    access: Access,
    prepare: Option<PrepareFn>,
    commit: Option<CommitFn>,
    blref: Option<BlockRef>,
}

/// A reusable multi-block transaction.
#[derive(Default)]
pub struct Transaction {
    blocks: Vec<TxnBlock>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

impl Transaction {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a block entry.
    ///
    /// It is legitimate to add a block with neither callback just to hold
    /// access to it across the transaction.
    pub fn add_block(
        &mut self,
        bnr: BlockNumber,
        access: Access,
        prepare: Option<PrepareFn>,
        commit: Option<CommitFn>,
    ) -> &mut Self {
        self.blocks.push(TxnBlock {
            bnr,
            access,
            prepare,
            commit,
            blref: None,
        });
        self
    }

    /// Acquire, prepare and commit every block of the transaction.
    ///
    /// On error the references acquired so far stay held until
    /// [`Transaction::destroy`] (or drop) releases them.
    pub fn execute(&mut self, cache: &BlockCache) -> Result<()> {
        for tb in &mut self.blocks {
            let blref = cache.acquire(tb.bnr, tb.access)?;
            if let Some(prepare) = tb.prepare.as_mut() {
                prepare(&blref)?;
            }
            tb.blref = Some(blref);
        }

        let writes: Vec<BlockRef> = self
            .blocks
            .iter()
            .filter(|tb| tb.access.contains(Access::WRITE))
            .filter_map(|tb| tb.blref.clone())
            .collect();

        if !writes.is_empty() {
            cache.dirty_begin(&writes)?;
            for tb in &mut self.blocks {
                if !tb.access.contains(Access::WRITE) {
                    continue;
                }
                if let (Some(commit), Some(blref)) = (tb.commit.as_mut(), tb.blref.as_ref()) {
                    commit(blref);
                }
            }
            cache.dirty_end(&writes);
            trace!(target: "mfs::txn", event = "txn_committed", writes = writes.len());
        }

        Ok(())
    }

    /// Release every reference acquired by `execute`.
    ///
    /// The entry list survives, so the same transaction may be executed
    /// again afterwards. Calling this repeatedly, or on a transaction
    /// that never ran, is a no-op.
    pub fn destroy(&mut self) {
        for tb in &mut self.blocks {
            tb.blref = None;
        }
    }
}
