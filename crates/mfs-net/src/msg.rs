//! The messaging core: peer table, send entry point, receive dispatch.
//!
//! Messaging provides one-way delivery to named peers, identified by
//! IPv4 address and port. A peer comes to life either when somebody
//! sends to its address (outbound, a connector task dials it) or when
//! the listener accepts a connection from it. Delivery is loose by
//! design: no timeouts, no reconnect, no retransmission.
//!
//! The receive path demultiplexes by the type byte in the header
//! through a bounded table of registered handlers.

use crate::socket::{bind_listener, listen_loop, Peer};
use crate::wire::{self, MsgHeader, MsgType, MAX_CTL_SIZE, MAX_DATA_SIZE, MSG_TYPE_NR};
use mfs_block::PageBuf;
use mfs_error::{MfsError, Result};
use mfs_rcu::RcuTable;
use parking_lot::{Mutex, RwLock};
use std::net::{SocketAddrV4, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, trace, warn};

/// A message in flight between the API and the socket layer.
///
/// `ctl` is the small fixed-layout control payload; `data` carries a
/// whole page when the message moves block-sized contents.
pub struct MsgDesc {
    pub addr: SocketAddrV4,
    pub mtype: MsgType,
    pub ctl: Vec<u8>,
    pub data: Option<PageBuf>,
    pub data_size: u16,
}

impl MsgDesc {
    /// A control-only message.
    #[must_use]
    pub fn with_ctl(addr: SocketAddrV4, mtype: MsgType, ctl: Vec<u8>) -> Self {
        Self {
            addr,
            mtype,
            ctl,
            data: None,
            data_size: 0,
        }
    }

    /// A message carrying a full data page.
    #[must_use]
    pub fn with_data(addr: SocketAddrV4, mtype: MsgType, ctl: Vec<u8>, data: PageBuf) -> Self {
        Self {
            addr,
            mtype,
            ctl,
            data_size: MAX_DATA_SIZE as u16,
            data: Some(data),
        }
    }
}

impl std::fmt::Debug for MsgDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MsgDesc")
            .field("addr", &self.addr)
            .field("mtype", &self.mtype)
            .field("ctl_size", &self.ctl.len())
            .field("data_size", &self.data_size)
            .finish()
    }
}

/// A registered receive handler.
///
/// The descriptor is only valid for the duration of the call; handlers
/// copy out what they keep. Header validity is already checked; the
/// handler is responsible for all payload checks.
pub type RecvFn = Arc<dyn Fn(&MsgDesc) -> Result<()> + Send + Sync>;

/// Serialize a descriptor into the single buffer the sender writes.
pub(crate) fn encode_frame(desc: &MsgDesc) -> Result<Vec<u8>> {
    if desc.ctl.len() > MAX_CTL_SIZE {
        return Err(MfsError::Invalid("control payload too large"));
    }
    let data_size = usize::from(desc.data_size);
    if data_size > MAX_DATA_SIZE {
        return Err(MfsError::Invalid("data payload too large"));
    }
    if (desc.data.is_none() && data_size != 0) || (desc.data.is_some() && data_size == 0) {
        return Err(MfsError::Invalid("data payload size mismatch"));
    }
    if desc.ctl.is_empty() && data_size == 0 {
        return Err(MfsError::Invalid("message carries no payload"));
    }

    let header = MsgHeader {
        crc: 0,
        data_size: desc.data_size,
        ctl_size: desc.ctl.len() as u8,
        mtype: desc.mtype.to_wire(),
    };

    let mut frame = Vec::with_capacity(wire::MSG_HEADER_SIZE + desc.ctl.len() + data_size);
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(&desc.ctl);
    if let Some(page) = &desc.data {
        frame.extend_from_slice(&page.as_slice()[..data_size]);
    }
    Ok(frame)
}

pub(crate) struct MsgInner {
    pub(crate) peers: RcuTable<SocketAddrV4, Peer>,
    recv_fns: RwLock<Vec<Option<RecvFn>>>,
    pub(crate) shutdown: AtomicBool,
    listen_addr: Mutex<Option<SocketAddrV4>>,
    listener_thread: Mutex<Option<JoinHandle<()>>>,
}

impl MsgInner {
    pub(crate) fn dispatch(&self, desc: &MsgDesc) -> Result<()> {
        let handler = {
            let fns = self.recv_fns.read();
            fns.get(desc.mtype.to_wire() as usize)
                .and_then(Clone::clone)
        };
        let Some(handler) = handler else {
            return Err(MfsError::Invalid("no receive handler for message type"));
        };
        trace!(target: "mfs::msg", event = "dispatch", mtype = ?desc.mtype, from = %desc.addr);
        handler(desc)
    }

    fn send(self: &Arc<Self>, desc: &MsgDesc) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(MfsError::ShuttingDown);
        }
        let frame = encode_frame(desc)?;
        let peer = self.outbound_peer(desc.addr)?;
        peer.queue_frame(frame)
    }

    /// Find the peer for `addr`, dialing a new connection on a miss.
    fn outbound_peer(self: &Arc<Self>, addr: SocketAddrV4) -> Result<Arc<Peer>> {
        if let Some(peer) = self.peers.lookup(&addr) {
            return Ok(peer);
        }

        let fresh = Arc::new(Peer::new(addr, Arc::downgrade(self)));
        let outcome = self.peers.insert_or_get(addr, fresh);
        if outcome.inserted {
            debug!(target: "mfs::msg", event = "peer_dial", peer = %addr);
            Peer::start_connector(&outcome.entry);
        }
        Ok(outcome.entry)
    }

    /// An accepted socket arrived for `addr`; reject it if a peer for
    /// that address already exists.
    pub(crate) fn accept_incoming(
        self: &Arc<Self>,
        addr: SocketAddrV4,
        stream: TcpStream,
    ) -> Result<()> {
        let fresh = Arc::new(Peer::new(addr, Arc::downgrade(self)));
        let outcome = self.peers.insert_or_get(addr, fresh);
        if !outcome.inserted {
            return Err(MfsError::Exists("peer for accepted address"));
        }
        debug!(target: "mfs::msg", event = "peer_accept", peer = %addr);
        Peer::start_io(&outcome.entry, stream);
        Ok(())
    }
}

/// The messaging endpoint of one process.
pub struct Messenger {
    inner: Arc<MsgInner>,
}

impl std::fmt::Debug for Messenger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messenger")
            .field("peers", &self.inner.peers.len())
            .field("listen_addr", &*self.inner.listen_addr.lock())
            .finish()
    }
}

impl Messenger {
    /// Bring up messaging, optionally listening for inbound peers.
    ///
    /// Binding to port zero picks an ephemeral port; the effective
    /// address is available through [`Messenger::listen_addr`].
    pub fn setup(listen: Option<SocketAddrV4>) -> Result<Self> {
        let inner = Arc::new(MsgInner {
            peers: RcuTable::new(),
            recv_fns: RwLock::new(vec![None; MSG_TYPE_NR]),
            shutdown: AtomicBool::new(false),
            listen_addr: Mutex::new(None),
            listener_thread: Mutex::new(None),
        });

        if let Some(addr) = listen {
            let listener = bind_listener(addr)?;
            let bound = match listener.local_addr()? {
                std::net::SocketAddr::V4(v4) => v4,
                std::net::SocketAddr::V6(_) => {
                    return Err(MfsError::Invalid("listener bound to an IPv6 address"))
                }
            };
            *inner.listen_addr.lock() = Some(bound);

            let weak = Arc::downgrade(&inner);
            let handle = thread::Builder::new()
                .name("mfs-msg-listen".to_owned())
                .spawn(move || listen_loop(&weak, listener))?;
            *inner.listener_thread.lock() = Some(handle);
            debug!(target: "mfs::msg", event = "listening", addr = %bound);
        }

        Ok(Self { inner })
    }

    /// The bound listen address, when listening.
    #[must_use]
    pub fn listen_addr(&self) -> Option<SocketAddrV4> {
        *self.inner.listen_addr.lock()
    }

    /// Number of peers currently in the table.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.inner.peers.len()
    }

    /// A cloneable send handle that does not keep the messenger alive.
    #[must_use]
    pub fn handle(&self) -> MsgHandle {
        MsgHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Install the receive handler for a message type.
    ///
    /// Registration is expected to happen single-threaded at setup;
    /// duplicate registration is an error.
    pub fn register_recv(&self, mtype: MsgType, handler: RecvFn) -> Result<()> {
        let mut fns = self.inner.recv_fns.write();
        let slot = &mut fns[mtype.to_wire() as usize];
        if slot.is_some() {
            return Err(MfsError::Exists("receive handler for message type"));
        }
        *slot = Some(handler);
        Ok(())
    }

    /// Remove the receive handler for a message type, if any.
    pub fn unregister_recv(&self, mtype: MsgType) {
        let mut fns = self.inner.recv_fns.write();
        fns[mtype.to_wire() as usize] = None;
    }

    /// Send one message; the descriptor may be dropped on return.
    pub fn send(&self, desc: &MsgDesc) -> Result<()> {
        self.inner.send(desc)
    }

    /// Hand an accepted socket for `addr` to the peer table.
    ///
    /// Fails with `Exists` when a peer for that address is already
    /// present; the caller drops the socket in that case.
    pub fn accept(&self, addr: SocketAddrV4, stream: TcpStream) -> Result<()> {
        self.inner.accept_incoming(addr, stream)
    }

    /// Dispatch a descriptor as if it had arrived from the wire.
    pub fn deliver(&self, desc: &MsgDesc) -> Result<()> {
        self.inner.dispatch(desc)
    }

    /// Stop the listener and every peer, then release them. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = self.inner.listener_thread.lock().take() {
            let _ = handle.join();
        }

        let snapshot = self.inner.peers.clear();
        for peer in snapshot.values() {
            peer.shutdown(0);
        }
        for peer in snapshot.values() {
            peer.join_threads();
        }
        debug!(target: "mfs::msg", event = "messenger_shutdown");
    }
}

impl Drop for Messenger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Weak, cloneable sending handle for receive handlers and transports.
#[derive(Clone)]
pub struct MsgHandle {
    inner: Weak<MsgInner>,
}

impl MsgHandle {
    pub fn send(&self, desc: &MsgDesc) -> Result<()> {
        let Some(inner) = self.inner.upgrade() else {
            warn!(target: "mfs::msg", event = "send_after_shutdown");
            return Err(MfsError::ShuttingDown);
        };
        inner.send(desc)
    }
}
