//! End-to-end overlay scenarios over in-memory streams.
//!
//! Peer sessions run their real I/O pumps against duplex pipes, so these
//! tests exercise framing, dispatch, relay suppression and shutdown the
//! same way a TLS socket would.

use bytes::BytesMut;
use futures::StreamExt;
use rill_common::{Config, Hash256};
use rill_crypto::SecretKey;
use rill_overlay::{
    endpoint_v4, Disposition, Endpoint, Manifest, ManifestSet, Message, MessageCodec, Overlay,
    OverlayEvent, PeerHandle, PeerSet, Proposal, Setup, VerifiedHello, CURRENT_PROTOCOL,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tokio_util::codec::FramedRead;

fn client_tls() -> Arc<rustls::ClientConfig> {
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth(),
    )
}

fn overlay_with(mut mutate: impl FnMut(&mut Config)) -> Arc<Overlay> {
    let mut config = Config::default();
    mutate(&mut config);
    let setup = Setup {
        config,
        secret: SecretKey::from_seed(&[99u8; 32]),
        cluster: BTreeSet::new(),
        server_tls: None,
        client_tls: client_tls(),
        manifest_db: None,
        boot_cache_db: None,
    };
    Overlay::new(setup).unwrap()
}

fn overlay() -> Arc<Overlay> {
    overlay_with(|_| {})
}

struct RemoteEnd {
    frames: FramedRead<ReadHalf<DuplexStream>, MessageCodec>,
    write: WriteHalf<DuplexStream>,
}

impl RemoteEnd {
    async fn send(&mut self, message: &Message) {
        let frame = message.to_frame().unwrap();
        self.write.write_all(&frame).await.unwrap();
    }

    async fn recv(&mut self) -> Message {
        timeout(Duration::from_secs(2), self.frames.next())
            .await
            .expect("timed out waiting for relay")
            .expect("stream closed")
            .expect("decode failed")
    }

    async fn expect_silence(&mut self) {
        let got = timeout(Duration::from_millis(300), self.frames.next()).await;
        assert!(got.is_err(), "unexpected message: {:?}", got);
    }
}

/// Wires a fake handshaked peer into the overlay through a duplex pipe.
async fn add_peer(overlay: &Arc<Overlay>, seed: u8) -> (Arc<PeerHandle>, RemoteEnd) {
    let local = endpoint_v4(203, 0, 113, 9, 51235);
    let remote = endpoint_v4(198, 51, 100, seed, 40000 + seed as u16);
    let slot = overlay
        .finder()
        .new_inbound_slot(local, remote)
        .expect("slot");

    let verified = VerifiedHello {
        public_key: SecretKey::from_seed(&[seed; 32]).public_key(),
        version: CURRENT_PROTOCOL,
        cluster: false,
        hops_aware: true,
        public_ip: None,
        closed_ledger: None,
    };
    assert_eq!(
        overlay
            .finder()
            .activate(slot, verified.public_key, verified.cluster),
        rill_overlay::ActivateResult::Success
    );

    let (ours, theirs) = tokio::io::duplex(256 * 1024);
    let (read, write) = tokio::io::split(ours);
    let handle = overlay
        .add_active(
            &verified,
            slot,
            true,
            remote,
            true,
            None,
            read,
            write,
            BytesMut::new(),
        )
        .unwrap();

    let (their_read, their_write) = tokio::io::split(theirs);
    (
        handle,
        RemoteEnd {
            frames: FramedRead::new(their_read, MessageCodec::new()),
            write: their_write,
        },
    )
}

fn proposal(hops: Option<u32>) -> Proposal {
    Proposal {
        ledger_seq: 42,
        prev_ledger: Hash256::from_bytes([1u8; 32]),
        tx_set: Hash256::from_bytes([2u8; 32]),
        payload: vec![1, 2, 3, 4],
        signer: vec![7u8; 32],
        hops,
    }
}

async fn next_proposal_event(rx: &mut broadcast::Receiver<OverlayEvent>) -> Option<(u32, Proposal)> {
    loop {
        let event = timeout(Duration::from_secs(2), rx.recv()).await.ok()?.ok()?;
        match event {
            OverlayEvent::Proposal { from, proposal } => return Some((from, proposal)),
            _ => continue,
        }
    }
}

#[tokio::test]
async fn relay_reaches_every_other_peer_exactly_once() {
    let overlay = overlay();
    let mut events = overlay.subscribe();

    let (_a, mut a) = add_peer(&overlay, 1).await;
    let (_b, mut b) = add_peer(&overlay, 2).await;
    let (_c, mut c) = add_peer(&overlay, 3).await;
    let (_d, mut d) = add_peer(&overlay, 4).await;

    // Peer A floods a proposal.
    a.send(&Message::Proposal(proposal(Some(1)))).await;

    // Everyone else gets it, with the hop count advanced.
    for end in [&mut b, &mut c, &mut d] {
        match end.recv().await {
            Message::Proposal(p) => assert_eq!(p.hops, Some(2)),
            other => panic!("expected proposal, got {other:?}"),
        }
    }
    // The sender does not get its own message back.
    a.expect_silence().await;

    // Local dispatch happened exactly once.
    let (from, _) = next_proposal_event(&mut events).await.unwrap();
    assert_eq!(from, 1);

    // Peer B echoes the same proposal a moment later: suppressed.
    b.send(&Message::Proposal(proposal(Some(2)))).await;
    c.expect_silence().await;
    d.expect_silence().await;
    a.expect_silence().await;
}

#[tokio::test]
async fn ttl_exceeded_consumes_locally_without_relay() {
    let overlay = overlay(); // max_ttl = 3
    let mut events = overlay.subscribe();

    let (_a, mut a) = add_peer(&overlay, 1).await;
    let (_b, mut b) = add_peer(&overlay, 2).await;

    a.send(&Message::Proposal(proposal(Some(3)))).await;

    // Local dispatch still happens.
    let (from, p) = next_proposal_event(&mut events).await.unwrap();
    assert_eq!(from, 1);
    assert_eq!(p.hops, Some(3));

    // But no outbound relay occurs.
    b.expect_silence().await;
}

#[tokio::test]
async fn ttl_exceeded_copy_does_not_suppress_later_relay() {
    let overlay = overlay(); // max_ttl = 3
    let mut events = overlay.subscribe();

    let (_a, mut a) = add_peer(&overlay, 1).await;
    let (_b, mut b) = add_peer(&overlay, 2).await;
    let (_c, mut c) = add_peer(&overlay, 3).await;

    // The first copy arrives over a long path with its TTL spent:
    // consumed locally, no relay, and no hash router entry.
    a.send(&Message::Proposal(proposal(Some(3)))).await;
    let (from, _) = next_proposal_event(&mut events).await.unwrap();
    assert_eq!(from, 1);
    b.expect_silence().await;
    c.expect_silence().await;

    // The same content then arrives under TTL via a shorter path. It
    // must still relay as if seen for the first time.
    c.send(&Message::Proposal(proposal(Some(1)))).await;
    for end in [&mut a, &mut b] {
        match end.recv().await {
            Message::Proposal(p) => assert_eq!(p.hops, Some(2)),
            other => panic!("expected proposal, got {other:?}"),
        }
    }
    // The peer it came from is skipped.
    c.expect_silence().await;

    let (from, p) = next_proposal_event(&mut events).await.unwrap();
    assert_eq!(from, 3);
    assert_eq!(p.hops, Some(1));
}

#[tokio::test]
async fn expire_zeroes_hops_on_send() {
    let overlay = overlay_with(|c| c.overlay.expire = true);
    let (_a, mut a) = add_peer(&overlay, 1).await;

    overlay.send(&Message::Proposal(proposal(Some(5))));

    match a.recv().await {
        Message::Proposal(p) => assert_eq!(p.hops, Some(0)),
        other => panic!("expected proposal, got {other:?}"),
    }
}

#[tokio::test]
async fn accepted_manifest_is_relayed_but_history_is_not() {
    let master = SecretKey::from_seed(&[50u8; 32]);
    let overlay = overlay_with(|c| {
        c.validator_keys = vec![master.public_key().to_base64()];
    });
    let mut events = overlay.subscribe();

    let (_a, mut a) = add_peer(&overlay, 1).await;
    let (_b, mut b) = add_peer(&overlay, 2).await;

    // A live manifest is applied and re-announced to other peers.
    let m1 = Manifest::new(&master, &SecretKey::from_seed(&[51u8; 32]).public_key(), 10);
    a.send(&Message::Manifests(ManifestSet {
        history: false,
        manifests: vec![m1.encode()],
    }))
    .await;

    match b.recv().await {
        Message::Manifests(set) => {
            assert!(!set.history);
            assert_eq!(set.manifests, vec![m1.encode()]);
        }
        other => panic!("expected manifests, got {other:?}"),
    }
    loop {
        match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
            Ok(OverlayEvent::Manifest {
                manifest,
                disposition,
            }) => {
                assert_eq!(manifest, m1);
                assert_eq!(disposition, Disposition::Accepted);
                break;
            }
            Ok(_) => continue,
            Err(e) => panic!("event stream broken: {e}"),
        }
    }

    // A history batch is applied but never forwarded.
    let m2 = Manifest::new(&master, &SecretKey::from_seed(&[52u8; 32]).public_key(), 11);
    a.send(&Message::Manifests(ManifestSet {
        history: true,
        manifests: vec![m2.encode()],
    }))
    .await;

    b.expect_silence().await;
    assert_eq!(
        overlay.manifests().current(&master.public_key()).unwrap(),
        m2
    );
}

#[tokio::test]
async fn no_two_live_sessions_share_a_node_key() {
    let overlay = overlay();
    let (_a, _a_end) = add_peer(&overlay, 1).await;

    // A second inbound connection presenting the same node key is caught
    // at activation.
    let local = endpoint_v4(203, 0, 113, 9, 51235);
    let remote = endpoint_v4(198, 51, 100, 9, 40900);
    let slot = overlay.finder().new_inbound_slot(local, remote).unwrap();
    let same_key = SecretKey::from_seed(&[1u8; 32]).public_key();
    assert_eq!(
        overlay.finder().activate(slot, same_key, false),
        rill_overlay::ActivateResult::Duplicate
    );
}

#[tokio::test]
async fn select_peers_prefers_item_holders() {
    let overlay = overlay();
    let (_a, _ea) = add_peer(&overlay, 1).await;
    let (b, _eb) = add_peer(&overlay, 2).await;
    let (_c, _ec) = add_peer(&overlay, 3).await;

    let wanted = b.id();
    let mut set = PeerSet::new();
    let accepted = overlay.select_peers(&mut set, 2, |p| p.id() == wanted);
    assert_eq!(accepted, 2);
    assert_eq!(set.iter().next().unwrap().id(), wanted);
}

#[tokio::test]
async fn crawl_reports_active_peers() {
    let overlay = overlay();
    let (_a, _ea) = add_peer(&overlay, 1).await;

    let crawl = overlay.crawl();
    let active = crawl["active"].as_array().unwrap();
    assert_eq!(active.len(), 1);
    let entry = &active[0];
    assert_eq!(entry["type"], "in");
    assert!(entry["public_key"].is_string());
    assert!(entry["uptime"].is_u64());
    // This peer opted into crawl, so its address is visible.
    assert_eq!(entry["ip"], "198.51.100.1");
}

#[tokio::test]
async fn graceful_shutdown_drains_all_children() {
    let overlay = overlay();
    let (a, _ea) = add_peer(&overlay, 1).await;
    let (b, _eb) = add_peer(&overlay, 2).await;

    // An in-flight outbound attempt: the listener accepts TCP but never
    // speaks TLS, so the attempt parks in its handshake phase.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    overlay.connect(Endpoint::from_socket(addr));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(overlay.children_len() >= 3);

    timeout(Duration::from_secs(5), overlay.shutdown())
        .await
        .expect("shutdown hung");

    assert_eq!(overlay.children_len(), 0);
    assert!(a.is_closed());
    assert!(b.is_closed());
    assert_eq!(overlay.size(), 0);
}

#[tokio::test]
async fn no_new_work_after_stop() {
    let overlay = overlay();
    overlay.shutdown().await;

    // Outbound connects are silently refused.
    overlay.connect(endpoint_v4(198, 51, 100, 1, 51235));
    assert_eq!(overlay.children_len(), 0);

    // Registering a peer is refused outright.
    let verified = VerifiedHello {
        public_key: SecretKey::from_seed(&[1u8; 32]).public_key(),
        version: CURRENT_PROTOCOL,
        cluster: false,
        hops_aware: true,
        public_ip: None,
        closed_ledger: None,
    };
    let (ours, _theirs) = tokio::io::duplex(1024);
    let (read, write) = tokio::io::split(ours);
    let err = overlay
        .add_active(
            &verified,
            1,
            true,
            endpoint_v4(198, 51, 100, 1, 40001),
            false,
            None,
            read,
            write,
            BytesMut::new(),
        )
        .unwrap_err();
    assert!(matches!(err, rill_overlay::OverlayError::ShuttingDown));
}

#[tokio::test]
async fn peer_disconnect_frees_slot_and_endpoint() {
    let overlay = overlay();
    let (a, ea) = add_peer(&overlay, 1).await;
    assert_eq!(overlay.size(), 1);

    // Remote closes its end; the session winds down.
    drop(ea);
    timeout(Duration::from_secs(2), async {
        while overlay.size() != 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("peer never deactivated");

    assert!(overlay.find_peer(a.id()).is_none());

    // The endpoint can be admitted again.
    let local = endpoint_v4(203, 0, 113, 9, 51235);
    let remote = endpoint_v4(198, 51, 100, 1, 40001);
    assert!(overlay.finder().new_inbound_slot(local, remote).is_some());
}
