//! The manifest: a sequence-numbered map from block numbers to the devd
//! servers that own them.
//!
//! Clients hold an RCU-published snapshot; within one snapshot the
//! mapping `bnr mod N` is deterministic. A newer manifest (larger
//! sequence number) replaces the snapshot atomically and wakes anybody
//! waiting for an update. The client/server exchange moves the manifest
//! as one marshalled data block.

use crate::msg::{MsgDesc, Messenger, RecvFn};
use crate::wire::{
    self, GetManifest, GetManifestResult, MsgType, MSG_ERR_OK,
};
use arc_swap::ArcSwapOption;
use mfs_block::sync::WaitQueue;
use mfs_block::PageBuf;
use mfs_error::{MfsError, Result};
use mfs_types::{BlockNumber, ManifestSeq, BLOCK_SIZE};
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use tracing::{debug, warn};

/// Bytes per marshalled address entry: ip, port, padding.
const ADDR_ENTRY_SIZE: usize = 8;

/// One immutable manifest snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub seq: ManifestSeq,
    addrs: Vec<SocketAddrV4>,
}

impl Manifest {
    pub fn new(seq: ManifestSeq, addrs: Vec<SocketAddrV4>) -> Result<Self> {
        if addrs.is_empty() {
            return Err(MfsError::Invalid("manifest needs at least one address"));
        }
        if addrs.len() > usize::from(u8::MAX) {
            return Err(MfsError::Invalid("manifest address count exceeds u8"));
        }
        Ok(Self { seq, addrs })
    }

    #[must_use]
    pub fn addrs(&self) -> &[SocketAddrV4] {
        &self.addrs
    }

    /// The server owning `bnr` in this snapshot.
    #[must_use]
    pub fn map_block(&self, bnr: BlockNumber) -> SocketAddrV4 {
        let index = (bnr.0 % self.addrs.len() as u64) as usize;
        self.addrs[index]
    }

    /// Marshal into one data block: a count byte, then 8-byte entries.
    #[must_use]
    pub fn marshal(&self) -> PageBuf {
        let mut page = PageBuf::zeroed();
        let buf = page.as_mut_slice();
        buf[0] = self.addrs.len() as u8;
        for (i, addr) in self.addrs.iter().enumerate() {
            let off = 1 + i * ADDR_ENTRY_SIZE;
            buf[off..off + 4].copy_from_slice(&addr.ip().octets());
            buf[off + 4..off + 6].copy_from_slice(&addr.port().to_le_bytes());
        }
        page
    }

    /// Unmarshal a received data block.
    pub fn unmarshal(seq: ManifestSeq, data: &[u8]) -> Result<Self> {
        if data.len() != BLOCK_SIZE {
            return Err(MfsError::Protocol(format!(
                "manifest payload of {} bytes",
                data.len()
            )));
        }
        let count = usize::from(data[0]);
        if count == 0 {
            return Err(MfsError::Protocol("manifest with no addresses".to_owned()));
        }
        let mut addrs = Vec::with_capacity(count);
        for i in 0..count {
            let off = 1 + i * ADDR_ENTRY_SIZE;
            let ip = Ipv4Addr::new(data[off], data[off + 1], data[off + 2], data[off + 3]);
            let port = u16::from_le_bytes([data[off + 4], data[off + 5]]);
            addrs.push(SocketAddrV4::new(ip, port));
        }
        Self::new(seq, addrs)
    }
}

/// Process-wide manifest holder with lock-free readers.
pub struct ManifestMap {
    contents: ArcSwapOption<Manifest>,
    write_lock: Mutex<()>,
    updates: WaitQueue,
}

impl std::fmt::Debug for ManifestMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestMap")
            .field("seq", &self.seq())
            .finish_non_exhaustive()
    }
}

impl ManifestMap {
    #[must_use]
    pub fn new(initial: Option<Manifest>) -> Arc<Self> {
        Arc::new(Self {
            contents: ArcSwapOption::from(initial.map(Arc::new)),
            write_lock: Mutex::new(()),
            updates: WaitQueue::new(),
        })
    }

    #[must_use]
    pub fn current(&self) -> Option<Arc<Manifest>> {
        self.contents.load_full()
    }

    /// Sequence number of the current snapshot, zero when none.
    #[must_use]
    pub fn seq(&self) -> ManifestSeq {
        self.current().map_or(ManifestSeq(0), |m| m.seq)
    }

    /// Resolve the server owning `bnr` in the current snapshot.
    pub fn map_block(&self, bnr: BlockNumber) -> Result<SocketAddrV4> {
        let Some(manifest) = self.current() else {
            return Err(MfsError::Invalid("no manifest available"));
        };
        Ok(manifest.map_block(bnr))
    }

    /// Publish `manifest` if it is newer than the current snapshot.
    ///
    /// Readers holding the old snapshot keep it until they drop it.
    pub fn install(&self, manifest: Manifest) -> bool {
        let guard = self.write_lock.lock();
        if self.seq() >= manifest.seq && self.current().is_some() {
            return false;
        }
        let seq = manifest.seq;
        self.contents.store(Some(Arc::new(manifest)));
        drop(guard);

        debug!(target: "mfs::manifest", event = "manifest_installed", seq = seq.0);
        self.updates.wake_all();
        true
    }

    /// Block until a snapshot newer than `seq` is installed.
    pub fn wait_newer_than(&self, seq: ManifestSeq) {
        self.updates.wait_until(|| self.seq() > seq);
    }
}

/// Register the client-side result handler; received manifests land in
/// `map`.
pub fn client_setup(msg: &Messenger, map: &Arc<ManifestMap>) -> Result<()> {
    let map = Arc::clone(map);
    let handler: RecvFn = Arc::new(move |desc: &MsgDesc| {
        let result = GetManifestResult::decode(&desc.ctl)?;
        if result.err != MSG_ERR_OK {
            if desc.data_size != 0 {
                return Err(MfsError::Protocol(
                    "manifest error result with data".to_owned(),
                ));
            }
            return Err(MfsError::from_errno(wire::wire_to_errno(result.err)));
        }
        let Some(data) = &desc.data else {
            return Err(MfsError::Protocol("manifest result without data".to_owned()));
        };
        if usize::from(desc.data_size) != BLOCK_SIZE {
            return Err(MfsError::Protocol("short manifest payload".to_owned()));
        }

        let manifest = Manifest::unmarshal(ManifestSeq(result.seq_nr), data.as_slice())?;
        map.install(manifest);
        Ok(())
    });
    msg.register_recv(MsgType::GetManifestResult, handler)
}

/// Ask `server` for a manifest newer than ours and wait for it.
pub fn client_request(msg: &Messenger, map: &ManifestMap, server: SocketAddrV4) -> Result<()> {
    let seq = map.seq();
    let request = GetManifest { seq_nr: seq.0 };
    msg.send(&MsgDesc::with_ctl(
        server,
        MsgType::GetManifest,
        request.encode().to_vec(),
    ))?;

    debug!(target: "mfs::manifest", event = "manifest_request", server = %server, seq = seq.0);
    map.wait_newer_than(seq);
    Ok(())
}

/// Register the server-side handler serving `map` to clients.
pub fn server_setup(msg: &Messenger, map: &Arc<ManifestMap>) -> Result<()> {
    let map = Arc::clone(map);
    let sender = msg.handle();
    let handler: RecvFn = Arc::new(move |desc: &MsgDesc| {
        let _request = GetManifest::decode(&desc.ctl)?;
        if desc.data_size != 0 {
            return Err(MfsError::Protocol("manifest request with data".to_owned()));
        }

        let reply = match map.current() {
            Some(manifest) => {
                let ctl = GetManifestResult {
                    seq_nr: manifest.seq.0,
                    err: MSG_ERR_OK,
                };
                MsgDesc::with_data(
                    desc.addr,
                    MsgType::GetManifestResult,
                    ctl.encode().to_vec(),
                    manifest.marshal(),
                )
            }
            None => {
                warn!(target: "mfs::manifest", event = "manifest_unavailable", peer = %desc.addr);
                let ctl = GetManifestResult {
                    seq_nr: 0,
                    err: wire::err_to_wire(-libc::EIO),
                };
                MsgDesc::with_ctl(desc.addr, MsgType::GetManifestResult, ctl.encode().to_vec())
            }
        };
        sender.send(&reply)
    });
    msg.register_recv(MsgType::GetManifest, handler)
}
