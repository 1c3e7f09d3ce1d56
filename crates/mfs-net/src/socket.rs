//! Threaded TCP transport under the messaging core.
//!
//! Every peer owns up to three long-lived threads: a connector for
//! outbound peers that have not connected yet, a sender draining the
//! peer's queue of prebuilt frames, and a receiver reading frames and
//! dispatching them. The listener pseudo-task accepts inbound sockets
//! and hands them to the peer table.
//!
//! Shutting a peer down is idempotent: a flag flips once, the socket is
//! half-closed in both directions so blocked reads and writes fail, and
//! the threads observe the flag and exit. Peer memory is released with
//! the last reference.

use crate::msg::{MsgDesc, MsgInner};
use crate::wire::{MsgHeader, MSG_HEADER_SIZE};
use crossbeam_queue::SegQueue;
use mfs_block::sync::WaitQueue;
use mfs_block::PageBuf;
use mfs_error::{MfsError, Result};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, SocketAddrV4, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace, warn};

const LISTEN_BACKLOG: i32 = 255;
const ACCEPT_POLL: Duration = Duration::from_millis(10);

pub(crate) struct Peer {
    pub(crate) addr: SocketAddrV4,
    inner: Weak<MsgInner>,
    send_q: SegQueue<Vec<u8>>,
    waitq: WaitQueue,
    stream: Mutex<Option<TcpStream>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    shut: AtomicBool,
    err: AtomicI32,
}

impl Peer {
    pub(crate) fn new(addr: SocketAddrV4, inner: Weak<MsgInner>) -> Self {
        Self {
            addr,
            inner,
            send_q: SegQueue::new(),
            waitq: WaitQueue::new(),
            stream: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
            shut: AtomicBool::new(false),
            err: AtomicI32::new(0),
        }
    }

    fn is_shutdown(&self) -> bool {
        self.shut.load(Ordering::SeqCst)
    }

    /// Queue a prebuilt frame for the sender.
    pub(crate) fn queue_frame(&self, frame: Vec<u8>) -> Result<()> {
        let errno = self.err.load(Ordering::SeqCst);
        if errno < 0 {
            return Err(MfsError::from_errno(errno));
        }
        if self.is_shutdown() {
            return Err(MfsError::ShuttingDown);
        }
        self.send_q.push(frame);
        self.waitq.wake_all();
        Ok(())
    }

    /// Stop activity on the peer. Safe to call repeatedly.
    pub(crate) fn shutdown(&self, errno: i32) {
        if !self.shut.swap(true, Ordering::SeqCst) {
            if let Some(stream) = self.stream.lock().as_ref() {
                let _ = stream.shutdown(Shutdown::Both);
            }
            self.waitq.wake_all();
            debug!(target: "mfs::msg::sock", event = "peer_shutdown", peer = %self.addr, errno);
        }
        // Keep the first error; a benign race here is fine.
        if errno < 0 {
            let _ = self
                .err
                .compare_exchange(0, errno, Ordering::SeqCst, Ordering::SeqCst);
        }
    }

    pub(crate) fn join_threads(&self) {
        loop {
            let Some(handle) = self.threads.lock().pop() else {
                return;
            };
            let _ = handle.join();
        }
    }

    /// Dial the peer from a dedicated thread, then start frame I/O.
    pub(crate) fn start_connector(peer: &Arc<Self>) {
        let me = Arc::clone(peer);
        let handle = thread::Builder::new()
            .name("mfs-peer-connect".to_owned())
            .spawn(move || match TcpStream::connect(SocketAddr::V4(me.addr)) {
                Ok(stream) => Self::start_io(&me, stream),
                Err(err) => {
                    warn!(
                        target: "mfs::msg::sock",
                        event = "connect_failed",
                        peer = %me.addr,
                        error = %err
                    );
                    let errno = -err.raw_os_error().unwrap_or(libc::EIO);
                    me.shutdown(errno);
                }
            });
        match handle {
            Ok(handle) => peer.threads.lock().push(handle),
            Err(err) => {
                warn!(target: "mfs::msg::sock", event = "spawn_failed", error = %err);
                peer.shutdown(-libc::EIO);
            }
        }
    }

    /// Start sender and receiver threads over a connected stream.
    pub(crate) fn start_io(peer: &Arc<Self>, stream: TcpStream) {
        if let Err(err) = stream.set_nodelay(true) {
            warn!(
                target: "mfs::msg::sock",
                event = "nodelay_failed",
                peer = %peer.addr,
                error = %err
            );
        }

        // One descriptor each for the sender, the receiver, and the
        // shutdown path.
        let clones = stream
            .try_clone()
            .and_then(|send| stream.try_clone().map(|shut| (send, shut)));
        let (send_stream, shut_stream) = match clones {
            Ok(pair) => pair,
            Err(err) => {
                warn!(
                    target: "mfs::msg::sock",
                    event = "stream_clone_failed",
                    peer = %peer.addr,
                    error = %err
                );
                peer.shutdown(-err.raw_os_error().unwrap_or(libc::EIO));
                return;
            }
        };
        *peer.stream.lock() = Some(shut_stream);

        let mut handles = Vec::with_capacity(2);
        {
            let me = Arc::clone(peer);
            let spawned = thread::Builder::new()
                .name("mfs-peer-send".to_owned())
                .spawn(move || {
                    let errno = match send_loop(&me, send_stream) {
                        Ok(()) => 0,
                        Err(err) => err.to_errno(),
                    };
                    me.shutdown(errno);
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    warn!(target: "mfs::msg::sock", event = "spawn_failed", error = %err);
                    peer.shutdown(-libc::EIO);
                }
            }
        }
        {
            let me = Arc::clone(peer);
            let spawned = thread::Builder::new()
                .name("mfs-peer-recv".to_owned())
                .spawn(move || {
                    let errno = match recv_loop(&me, stream) {
                        Ok(()) => 0,
                        Err(err) => {
                            if !me.is_shutdown() {
                                debug!(
                                    target: "mfs::msg::sock",
                                    event = "recv_ended",
                                    peer = %me.addr,
                                    error = %err
                                );
                            }
                            err.to_errno()
                        }
                    };
                    me.shutdown(errno);
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(err) => {
                    warn!(target: "mfs::msg::sock", event = "spawn_failed", error = %err);
                    peer.shutdown(-libc::EIO);
                }
            }
        }
        peer.threads.lock().append(&mut handles);

        if peer.is_shutdown() {
            // Shutdown raced with startup; make sure the fresh socket is
            // closed so the new threads exit promptly.
            if let Some(stream) = peer.stream.lock().as_ref() {
                let _ = stream.shutdown(Shutdown::Both);
            }
            peer.waitq.wake_all();
        }
    }
}

/// Drain the peer's send queue, writing each frame whole.
fn send_loop(peer: &Arc<Peer>, mut stream: TcpStream) -> Result<()> {
    loop {
        peer.waitq
            .wait_until(|| !peer.send_q.is_empty() || peer.is_shutdown());
        if peer.is_shutdown() {
            return Ok(());
        }

        while let Some(frame) = peer.send_q.pop() {
            stream.write_all(&frame)?;
            trace!(
                target: "mfs::msg::sock",
                event = "frame_sent",
                peer = %peer.addr,
                bytes = frame.len()
            );
        }
    }
}

/// Read frames and dispatch them until the socket dies.
fn recv_loop(peer: &Arc<Peer>, mut stream: TcpStream) -> Result<()> {
    loop {
        if peer.is_shutdown() {
            return Ok(());
        }

        let mut hdr_buf = [0_u8; MSG_HEADER_SIZE];
        stream.read_exact(&mut hdr_buf)?;
        let header = MsgHeader::decode(&hdr_buf);
        let mtype = header.verify()?;

        let mut ctl = vec![0_u8; usize::from(header.ctl_size)];
        stream.read_exact(&mut ctl)?;

        let data = if header.data_size > 0 {
            let mut page = PageBuf::zeroed();
            stream.read_exact(&mut page.as_mut_slice()[..usize::from(header.data_size)])?;
            Some(page)
        } else {
            None
        };

        let desc = MsgDesc {
            addr: peer.addr,
            mtype,
            ctl,
            data,
            data_size: header.data_size,
        };

        let Some(inner) = peer.inner.upgrade() else {
            return Ok(());
        };
        inner.dispatch(&desc)?;
    }
}

/// Bind the listening socket with the configured backlog.
pub(crate) fn bind_listener(addr: SocketAddrV4) -> Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&SocketAddr::V4(addr).into())?;
    socket.listen(LISTEN_BACKLOG)?;
    let listener: TcpListener = socket.into();
    // Non-blocking accepts let the loop notice shutdown.
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Accept inbound connections until shutdown.
pub(crate) fn listen_loop(inner: &Weak<MsgInner>, listener: TcpListener) {
    loop {
        let Some(strong) = inner.upgrade() else {
            return;
        };
        if strong.shutdown.load(Ordering::SeqCst) {
            return;
        }

        match listener.accept() {
            Ok((stream, addr)) => {
                let SocketAddr::V4(addr) = addr else {
                    continue;
                };
                let _ = stream.set_nonblocking(false);
                if let Err(err) = strong.accept_incoming(addr, stream) {
                    debug!(
                        target: "mfs::msg::sock",
                        event = "accept_rejected",
                        peer = %addr,
                        error = %err
                    );
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                drop(strong);
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                warn!(target: "mfs::msg::sock", event = "accept_failed", error = %err);
                return;
            }
        }
    }
}
