#![forbid(unsafe_code)]
//! MeshFS public API facade.
//!
//! Wires the layers into the two process roles: a client [`Mount`] that
//! caches blocks served by remote devd hosts, and a [`Devd`] server that
//! owns a local device and answers block messages. Teardown runs in
//! dependency order: the block cache first (it stops producing I/O),
//! then messaging.

use mfs_block::{BlockCache, BlockTransport, CacheTunables, DirectTransport};
use mfs_error::Result;
use mfs_net::{manifest, Manifest, ManifestMap, Messenger, MsgTransport};
use mfs_types::ManifestSeq;
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

pub use mfs_block::{Access, BlockRef, CacheMetrics, CacheTunables as Tunables, PageBuf};
pub use mfs_error::{MfsError, Result as MfsResult};
pub use mfs_txn::Transaction;
pub use mfs_types::{BlockNumber, BLOCK_SIZE};

/// Configuration for a client mount.
#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    /// Static devd addresses; used as manifest seq 1 when non-empty.
    pub devd_addrs: Vec<SocketAddrV4>,
    /// Manifest server to fetch from when no static addresses are given.
    pub manifest_server: Option<SocketAddrV4>,
    pub tunables: CacheTunables,
}

/// A mounted client: block cache over the network transport.
pub struct Mount {
    cache: Arc<BlockCache>,
    msg: Messenger,
    map: Arc<ManifestMap>,
}

impl Mount {
    /// Bring up messaging, the manifest and the cache for a client.
    pub fn client(options: MountOptions) -> Result<Self> {
        let msg = Messenger::setup(None)?;
        let map = ManifestMap::new(None);
        manifest::client_setup(&msg, &map)?;

        if !options.devd_addrs.is_empty() {
            map.install(Manifest::new(ManifestSeq(1), options.devd_addrs)?);
        } else if let Some(server) = options.manifest_server {
            manifest::client_request(&msg, &map, server)?;
        } else {
            return Err(MfsError::Invalid(
                "mount needs devd addresses or a manifest server",
            ));
        }

        let cache = {
            let map = Arc::clone(&map);
            let msg = &msg;
            Arc::new(BlockCache::setup(options.tunables, move |end_io| {
                let transport = MsgTransport::setup(msg, map, end_io)?;
                Ok(Box::new(transport) as Box<dyn BlockTransport>)
            })?)
        };

        info!(target: "mfs", event = "mounted");
        Ok(Self { cache, msg, map })
    }

    #[must_use]
    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    #[must_use]
    pub fn manifest(&self) -> &Arc<ManifestMap> {
        &self.map
    }

    /// Tear the mount down: cache first, then messaging.
    pub fn unmount(self) {
        self.cache.shutdown();
        self.msg.shutdown();
        info!(target: "mfs", event = "unmounted");
    }
}

/// Configuration for a device server.
#[derive(Debug, Clone)]
pub struct DevdOptions {
    /// Path of the block device or image file served by this devd.
    pub device: PathBuf,
    /// Listen address; port zero picks an ephemeral port.
    pub listen: SocketAddrV4,
    /// Cluster addresses served as the manifest (must include this devd).
    pub devd_addrs: Vec<SocketAddrV4>,
    pub tunables: CacheTunables,
}

/// A running device server.
pub struct Devd {
    cache: Arc<BlockCache>,
    msg: Messenger,
    listen: SocketAddrV4,
}

impl Devd {
    /// Open the device, start listening and register the services.
    pub fn serve(options: DevdOptions) -> Result<Self> {
        let cache = {
            let device = options.device.clone();
            Arc::new(BlockCache::setup(options.tunables, move |end_io| {
                let transport = DirectTransport::open(&device, end_io)?;
                Ok(Box::new(transport) as Box<dyn BlockTransport>)
            })?)
        };

        let msg = Messenger::setup(Some(options.listen))?;
        let listen = msg
            .listen_addr()
            .ok_or(MfsError::Invalid("devd listener did not bind"))?;
        mfs_net::devd::register(&msg, &cache)?;

        let mut addrs = options.devd_addrs;
        if addrs.is_empty() {
            // A lone devd serves a manifest of just itself.
            addrs.push(listen);
        }
        let map = ManifestMap::new(Some(Manifest::new(ManifestSeq(1), addrs)?));
        manifest::server_setup(&msg, &map)?;

        info!(target: "mfs", event = "devd_serving", addr = %listen);
        Ok(Self { cache, msg, listen })
    }

    /// The effective listen address.
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddrV4 {
        self.listen
    }

    #[must_use]
    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    /// Stop serving: cache first, then messaging.
    pub fn stop(self) {
        self.cache.shutdown();
        self.msg.shutdown();
        info!(target: "mfs", event = "devd_stopped");
    }
}
