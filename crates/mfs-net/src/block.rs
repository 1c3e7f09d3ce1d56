//! Network block transport: moves cache blocks to and from remote devd
//! servers over the messaging layer.
//!
//! Submissions resolve their block number to a server through the
//! manifest map and leave as typed messages; the two result handlers
//! convert replies back into cache completions.

use crate::manifest::ManifestMap;
use crate::msg::{MsgDesc, MsgHandle, Messenger, RecvFn};
use crate::wire::{
    self, GetBlock, GetBlockResult, MsgType, WriteBlock, WriteBlockResult, BLOCK_ACCESS_READ,
    BLOCK_ACCESS_WRITE, MSG_ERR_OK,
};
use mfs_block::{BlockTransport, EndIoHandle, PageBuf, SubmitOp};
use mfs_error::{MfsError, Result};
use mfs_types::{BlockNumber, BLOCK_SIZE};
use std::sync::Arc;
use tracing::trace;

/// In-flight budget advertised to the cache.
pub const MSG_QUEUE_DEPTH: usize = 32;

/// `BlockTransport` over the messaging substrate.
pub struct MsgTransport {
    msg: MsgHandle,
    map: Arc<ManifestMap>,
}

impl MsgTransport {
    /// Register the result handlers and build the transport.
    pub fn setup(msg: &Messenger, map: Arc<ManifestMap>, end_io: EndIoHandle) -> Result<Self> {
        let get_result: RecvFn = {
            let end_io = end_io.clone();
            Arc::new(move |desc: &MsgDesc| {
                let result = GetBlockResult::decode(&desc.ctl)?;
                let data_size = usize::from(desc.data_size);
                if (result.err == MSG_ERR_OK && data_size != BLOCK_SIZE)
                    || (result.err != MSG_ERR_OK && data_size != 0)
                {
                    return Err(MfsError::Protocol(
                        "GET_BLOCK_RESULT payload size mismatch".to_owned(),
                    ));
                }

                let page = desc.data.as_ref().map(PageBuf::clone);
                end_io.end_io(
                    BlockNumber(result.bnr),
                    page,
                    wire::wire_to_errno(result.err),
                );
                Ok(())
            })
        };
        msg.register_recv(MsgType::GetBlockResult, get_result)?;

        let write_result: RecvFn = {
            let end_io = end_io.clone();
            Arc::new(move |desc: &MsgDesc| {
                let result = WriteBlockResult::decode(&desc.ctl)?;
                if desc.data_size != 0 {
                    return Err(MfsError::Protocol(
                        "WRITE_BLOCK_RESULT carries data".to_owned(),
                    ));
                }
                end_io.end_io(
                    BlockNumber(result.bnr),
                    None,
                    wire::wire_to_errno(result.err),
                );
                Ok(())
            })
        };
        msg.register_recv(MsgType::WriteBlockResult, write_result)?;

        Ok(Self {
            msg: msg.handle(),
            map,
        })
    }
}

impl BlockTransport for MsgTransport {
    fn queue_depth(&self) -> usize {
        MSG_QUEUE_DEPTH
    }

    fn submit_block(&self, op: SubmitOp, bnr: BlockNumber, data: Option<PageBuf>) -> Result<()> {
        let addr = self.map.map_block(bnr)?;

        let desc = match op {
            SubmitOp::GetRead | SubmitOp::GetWrite => {
                let access = if op == SubmitOp::GetRead {
                    BLOCK_ACCESS_READ
                } else {
                    BLOCK_ACCESS_WRITE
                };
                let ctl = GetBlock { bnr: bnr.0, access };
                MsgDesc::with_ctl(addr, MsgType::GetBlock, ctl.encode().to_vec())
            }
            SubmitOp::Write => {
                let Some(page) = data else {
                    return Err(MfsError::Invalid("network write without payload"));
                };
                let ctl = WriteBlock { bnr: bnr.0 };
                MsgDesc::with_data(addr, MsgType::WriteBlock, ctl.encode().to_vec(), page)
            }
        };

        trace!(
            target: "mfs::msg",
            event = "block_submit",
            block = bnr.0,
            server = %addr,
            op = ?op
        );
        self.msg.send(&desc)
    }
}
