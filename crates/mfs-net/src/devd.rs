//! devd's handling of received block messages.
//!
//! A device server answers `GET_BLOCK` from its local cache and applies
//! `WRITE_BLOCK` through a transaction followed by a sync, so the write
//! is durable on its device before the acknowledgement leaves.

use crate::msg::{MsgDesc, Messenger, RecvFn};
use crate::wire::{
    self, GetBlock, GetBlockResult, MsgType, WriteBlock, WriteBlockResult, BLOCK_ACCESS_NR,
};
use mfs_block::{Access, BlockCache, BlockRef, PageBuf};
use mfs_error::{MfsError, Result};
use mfs_types::{BlockNumber, BLOCK_SIZE};
use std::sync::Arc;
use tracing::{debug, trace};

fn get_block_handler(msg: &Messenger, cache: Arc<BlockCache>) -> RecvFn {
    let sender = msg.handle();
    Arc::new(move |desc: &MsgDesc| {
        let request = GetBlock::decode(&desc.ctl)?;
        if request.access >= BLOCK_ACCESS_NR {
            return Err(MfsError::Protocol("invalid block access".to_owned()));
        }
        if desc.data_size != 0 {
            return Err(MfsError::Protocol("GET_BLOCK carries data".to_owned()));
        }

        let looked_up = cache.acquire(BlockNumber(request.bnr), Access::READ);
        let errno = match &looked_up {
            Ok(_) => 0,
            Err(err) => err.to_errno(),
        };
        trace!(
            target: "mfs::devd",
            event = "get_block",
            block = request.bnr,
            peer = %desc.addr,
            errno
        );

        let ctl = GetBlockResult {
            bnr: request.bnr,
            access: request.access,
            err: wire::err_to_wire(errno),
        };
        let reply = match looked_up {
            Ok(blref) => MsgDesc::with_data(
                desc.addr,
                MsgType::GetBlockResult,
                ctl.encode().to_vec(),
                blref.snapshot(),
            ),
            Err(_) => MsgDesc::with_ctl(desc.addr, MsgType::GetBlockResult, ctl.encode().to_vec()),
        };
        sender.send(&reply)
    })
}

fn write_block_handler(msg: &Messenger, cache: Arc<BlockCache>) -> RecvFn {
    let sender = msg.handle();
    Arc::new(move |desc: &MsgDesc| {
        let request = WriteBlock::decode(&desc.ctl)?;
        if usize::from(desc.data_size) != BLOCK_SIZE {
            return Err(MfsError::Protocol(
                "WRITE_BLOCK without a full data block".to_owned(),
            ));
        }
        let Some(data) = &desc.data else {
            return Err(MfsError::Protocol("WRITE_BLOCK without data".to_owned()));
        };

        let payload = PageBuf::clone(data);
        let mut txn = mfs_txn::Transaction::new();
        txn.add_block(
            BlockNumber(request.bnr),
            Access::NEW | Access::WRITE,
            None,
            Some(Box::new(move |blref: &BlockRef| {
                blref
                    .buf_mut()
                    .as_mut_slice()
                    .copy_from_slice(payload.as_slice());
            })),
        );
        let applied = match txn.execute(&cache) {
            Ok(()) => cache.sync(),
            Err(err) => Err(err),
        };
        txn.destroy();
        let errno = match &applied {
            Ok(()) => 0,
            Err(err) => err.to_errno(),
        };
        debug!(
            target: "mfs::devd",
            event = "write_block",
            block = request.bnr,
            peer = %desc.addr,
            errno
        );

        let ctl = WriteBlockResult {
            bnr: request.bnr,
            err: wire::err_to_wire(errno),
        };
        sender.send(&MsgDesc::with_ctl(
            desc.addr,
            MsgType::WriteBlockResult,
            ctl.encode().to_vec(),
        ))
    })
}

/// Register the devd block service over `cache`.
pub fn register(msg: &Messenger, cache: &Arc<BlockCache>) -> Result<()> {
    msg.register_recv(MsgType::GetBlock, get_block_handler(msg, Arc::clone(cache)))?;
    msg.register_recv(
        MsgType::WriteBlock,
        write_block_handler(msg, Arc::clone(cache)),
    )
}

/// Remove the devd block service handlers.
pub fn unregister(msg: &Messenger) {
    msg.unregister_recv(MsgType::GetBlock);
    msg.unregister_recv(MsgType::WriteBlock);
}
