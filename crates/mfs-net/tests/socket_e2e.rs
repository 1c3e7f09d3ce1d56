#![forbid(unsafe_code)]

use mfs_block::PageBuf;
use mfs_error::MfsError;
use mfs_net::wire::{GetManifest, MsgType};
use mfs_net::{manifest, Manifest, ManifestMap, MsgDesc, Messenger, RecvFn};
use mfs_types::{ManifestSeq, BLOCK_SIZE};
use parking_lot::Mutex;
use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn loopback(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
}

fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("timed out waiting for {what}");
}

#[test]
fn ctl_message_crosses_the_wire() {
    let server = Messenger::setup(Some(loopback(0))).expect("server messenger");
    let server_addr = server.listen_addr().expect("bound address");

    let seen: Arc<Mutex<Vec<u64>>> = Arc::default();
    let handler: RecvFn = {
        let seen = Arc::clone(&seen);
        Arc::new(move |desc: &MsgDesc| {
            let request = GetManifest::decode(&desc.ctl)?;
            seen.lock().push(request.seq_nr);
            Ok(())
        })
    };
    server.register_recv(MsgType::GetManifest, handler).unwrap();

    let client = Messenger::setup(None).expect("client messenger");
    for seq in [3_u64, 4, 5] {
        let request = GetManifest { seq_nr: seq };
        client
            .send(&MsgDesc::with_ctl(
                server_addr,
                MsgType::GetManifest,
                request.encode().to_vec(),
            ))
            .expect("send");
    }

    wait_for("all requests to arrive", || seen.lock().len() == 3);
    assert_eq!(*seen.lock(), vec![3, 4, 5]);

    client.shutdown();
    server.shutdown();
}

#[test]
fn data_pages_cross_the_wire_intact() {
    let server = Messenger::setup(Some(loopback(0))).expect("server messenger");
    let server_addr = server.listen_addr().expect("bound address");

    let received: Arc<Mutex<Option<(Vec<u8>, Vec<u8>)>>> = Arc::default();
    let handler: RecvFn = {
        let received = Arc::clone(&received);
        Arc::new(move |desc: &MsgDesc| {
            let data = desc.data.as_ref().expect("data payload");
            *received.lock() = Some((desc.ctl.clone(), data.as_slice().to_vec()));
            Ok(())
        })
    };
    server.register_recv(MsgType::WriteBlock, handler).unwrap();

    let client = Messenger::setup(None).expect("client messenger");
    let mut page = PageBuf::zeroed();
    for (i, byte) in page.as_mut_slice().iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    let expected = page.as_slice().to_vec();
    client
        .send(&MsgDesc::with_data(
            server_addr,
            MsgType::WriteBlock,
            vec![7; 8],
            page,
        ))
        .expect("send data frame");

    wait_for("data frame to arrive", || received.lock().is_some());
    let (ctl, data) = received.lock().take().unwrap();
    assert_eq!(ctl, vec![7; 8]);
    assert_eq!(data.len(), BLOCK_SIZE);
    assert_eq!(data, expected);

    client.shutdown();
    server.shutdown();
}

#[test]
fn send_to_unreachable_peer_surfaces_an_error() {
    let client = Messenger::setup(None).expect("client messenger");
    // Nothing listens here; the connector fails and the peer latches the
    // error for subsequent sends.
    let dead = loopback(1);

    let request = GetManifest { seq_nr: 0 };
    let desc = MsgDesc::with_ctl(dead, MsgType::GetManifest, request.encode().to_vec());
    // The first send may only queue; the connector failure lands on the
    // peer asynchronously.
    let _ = client.send(&desc);

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut failed = false;
    while Instant::now() < deadline {
        if client.send(&desc).is_err() {
            failed = true;
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(failed, "sends to a dead peer must start failing");

    client.shutdown();
}

#[test]
fn s6_duplicate_accept_is_rejected() {
    let server = Messenger::setup(Some(loopback(0))).expect("server messenger");
    let server_addr = server.listen_addr().expect("bound address");

    // Two distinct client connections produce one peer entry each.
    let c1 = TcpStream::connect(server_addr).expect("first connect");
    let c2 = TcpStream::connect(server_addr).expect("second connect");
    wait_for("both peers to be accepted", || server.peer_count() == 2);

    // A third accept claiming an already-present peer address is
    // rejected with an existence error.
    let local = match c1.local_addr().expect("local addr") {
        std::net::SocketAddr::V4(v4) => v4,
        other => panic!("unexpected address family {other:?}"),
    };
    let c3 = TcpStream::connect(server_addr).expect("third connect");
    let err = server
        .accept(local, c3)
        .expect_err("duplicate peer accept must fail");
    assert!(matches!(err, MfsError::Exists(_)));

    drop(c1);
    drop(c2);
    server.shutdown();
}

#[test]
fn manifest_exchange_over_sockets() {
    let server = Messenger::setup(Some(loopback(0))).expect("server messenger");
    let server_addr = server.listen_addr().expect("bound address");

    let served = Manifest::new(
        ManifestSeq(1),
        vec![loopback(9001), loopback(9002)],
    )
    .unwrap();
    let server_map = ManifestMap::new(Some(served.clone()));
    manifest::server_setup(&server, &server_map).expect("server manifest setup");

    let client = Messenger::setup(None).expect("client messenger");
    let client_map = ManifestMap::new(None);
    manifest::client_setup(&client, &client_map).expect("client manifest setup");

    manifest::client_request(&client, &client_map, server_addr).expect("manifest request");

    let got = client_map.current().expect("manifest installed");
    assert_eq!(got.seq, ManifestSeq(1));
    assert_eq!(got.addrs(), served.addrs());

    client.shutdown();
    server.shutdown();
}

#[test]
fn duplicate_handler_counter() {
    let msg = Messenger::setup(None).expect("messenger");
    let calls = Arc::new(AtomicUsize::new(0));
    let handler: RecvFn = {
        let calls = Arc::clone(&calls);
        Arc::new(move |_: &MsgDesc| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    };
    msg.register_recv(MsgType::GetBlock, Arc::clone(&handler))
        .unwrap();
    assert!(matches!(
        msg.register_recv(MsgType::GetBlock, handler),
        Err(MfsError::Exists(_))
    ));
    msg.shutdown();
}
