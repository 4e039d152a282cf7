//! Transfers over loopback TCP into real files.

mod common;

use std::sync::Arc;

use common::{ALICE, BOB, init_tracing, pattern, spawn_peer};
use peerxfer_data_channel::{NegotiationConfig, SignalingHub, TcpNetwork};
use peerxfer_protocol::Method;
use peerxfer_transfer::{DiskStorage, XferStatus};

fn loopback(methods: Vec<Method>, download_dir: Option<std::path::PathBuf>) -> NegotiationConfig {
    NegotiationConfig {
        methods,
        listen_host: "127.0.0.1".into(),
        download_dir,
        ..Default::default()
    }
}

async fn transfer(methods: Vec<Method>, len: usize) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let share = dir.path().join("share");
    let downloads = dir.path().join("downloads");
    std::fs::create_dir_all(&share).unwrap();
    std::fs::create_dir_all(&downloads).unwrap();
    let data = pattern(len);
    std::fs::write(share.join("archive.tar"), &data).unwrap();

    let hub = SignalingHub::new();
    let alice = spawn_peer(
        &hub,
        ALICE,
        loopback(methods.clone(), None),
        Arc::new(TcpNetwork),
        Arc::new(DiskStorage),
    );
    let bob = spawn_peer(
        &hub,
        BOB,
        loopback(methods.clone(), Some(downloads.clone())),
        Arc::new(TcpNetwork),
        Arc::new(DiskStorage),
    );

    let xfer = alice
        .session
        .send_file(BOB, share.join("archive.tar"))
        .await
        .unwrap();
    assert_eq!(xfer.size(), len as u64);
    alice.ui.wait_for("completed").await;
    bob.ui.wait_for("completed").await;

    assert_eq!(xfer.status(), XferStatus::Done);
    assert_eq!(xfer.transport_history(), vec![methods[0].as_str()]);
    assert_eq!(std::fs::read(downloads.join("archive.tar")).unwrap(), data);
}

#[tokio::test]
async fn socks5_over_loopback() {
    transfer(vec![Method::Bytestreams], 300_000).await;
}

#[tokio::test]
async fn relay_over_loopback() {
    transfer(vec![Method::Relay], 200_000).await;
}

#[tokio::test]
async fn empty_file_over_loopback() {
    transfer(vec![Method::Bytestreams], 0).await;
}
