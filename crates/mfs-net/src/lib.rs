#![forbid(unsafe_code)]
//! Messaging, manifest and network block transport for MeshFS.
//!
//! The messaging substrate maintains a peer per remote address with
//! dedicated sender/receiver threads over TCP, and demultiplexes
//! received messages through a registered handler table. On top of it
//! sit the manifest exchange, the network block transport used by
//! client mounts, and the devd-side block service.

pub mod devd;
pub mod manifest;
mod msg;
mod socket;
pub mod wire;

mod block;

pub use block::{MsgTransport, MSG_QUEUE_DEPTH};
pub use manifest::{Manifest, ManifestMap};
pub use msg::{MsgDesc, MsgHandle, Messenger, RecvFn};
