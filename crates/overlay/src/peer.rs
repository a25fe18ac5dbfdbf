//! A live peer session.
//!
//! After a successful handshake each peer is represented by a
//! [`PeerHandle`] plus two pump tasks: a reader that decodes frames and
//! hands them to the overlay for dispatch, and a writer that drains the
//! bounded outbound queue. Within one session there is exactly one
//! outstanding read and writes go out strictly FIFO; the two streams
//! progress independently of each other.
//!
//! The handle is what the overlay's tables store. It owns no socket: when
//! it is cancelled the pumps notice, the socket drops, and the overlay is
//! notified exactly once.

use crate::handshake::VerifiedHello;
use crate::manager::Overlay;
use crate::message::{Message, MessageCodec};
use crate::resource::Consumer;
use crate::slots::SlotId;
use crate::{Endpoint, OverlayError, ProtocolVersion, Result};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use parking_lot::Mutex;
use rill_common::Hash256;
use rill_crypto::PublicKey;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Outbound queue depth. Overflow closes the session.
pub(crate) const SEND_QUEUE_DEPTH: usize = 256;

/// Recently-seen hashes remembered per peer.
const RECENT_ITEMS: usize = 128;

/// Ledger sequences a peer may lag behind before a sanity check counts
/// against it.
const SANITY_DRIFT: u64 = 24;

/// Consecutive failed sanity checks before the peer is dropped.
const MAX_INSANITY: u32 = 3;

/// A handshaked peer as seen by the rest of the node.
pub struct PeerHandle {
    id: u32,
    node_key: PublicKey,
    remote: Endpoint,
    slot: SlotId,
    inbound: bool,
    version: ProtocolVersion,
    hops_aware: bool,
    cluster: bool,
    /// Whether the peer opted into crawl visibility (`Crawl: public`).
    crawl: bool,
    connected_at: Instant,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    latest_ledger: AtomicU64,
    recent_ledgers: Mutex<VecDeque<Hash256>>,
    recent_tx_sets: Mutex<VecDeque<Hash256>>,
    insanity: AtomicU32,
    /// Keeps the per-IP resource charge alive for the session's lifetime.
    _usage: Option<Consumer>,
}

impl PeerHandle {
    /// Creates a handle and the receiving end of its outbound queue.
    pub(crate) fn new(
        id: u32,
        slot: SlotId,
        inbound: bool,
        remote: Endpoint,
        verified: &VerifiedHello,
        crawl: bool,
        usage: Option<Consumer>,
    ) -> (Arc<Self>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let handle = Arc::new(Self {
            id,
            node_key: verified.public_key,
            remote,
            slot,
            inbound,
            version: verified.version,
            hops_aware: verified.hops_aware,
            cluster: verified.cluster,
            crawl,
            connected_at: Instant::now(),
            tx,
            cancel: CancellationToken::new(),
            latest_ledger: AtomicU64::new(0),
            recent_ledgers: Mutex::new(VecDeque::new()),
            recent_tx_sets: Mutex::new(VecDeque::new()),
            insanity: AtomicU32::new(0),
            _usage: usage,
        });
        (handle, rx)
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn node_key(&self) -> &PublicKey {
        &self.node_key
    }

    pub fn remote(&self) -> Endpoint {
        self.remote
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn inbound(&self) -> bool {
        self.inbound
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn hops_aware(&self) -> bool {
        self.hops_aware
    }

    pub fn cluster(&self) -> bool {
        self.cluster
    }

    pub fn crawl(&self) -> bool {
        self.crawl
    }

    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signals the session to close. Idempotent; the pumps notice and the
    /// overlay removes the peer.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Encodes and queues a message for this peer.
    pub fn send(&self, message: &Message) -> Result<()> {
        self.send_frame(message.to_frame()?)
    }

    /// Queues an already-encoded frame. A full queue closes the session:
    /// bounded memory beats a peer that cannot keep up.
    pub fn send_frame(&self, frame: Bytes) -> Result<()> {
        match self.tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(peer = self.id, "send queue overflow, closing");
                self.close();
                Err(OverlayError::QueueOverflow)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(OverlayError::PeerDisconnected),
        }
    }

    /// Records a validation observed from this peer.
    pub(crate) fn on_validation_seen(&self, seq: u64, hash: Hash256) {
        self.latest_ledger.fetch_max(seq, Ordering::Relaxed);
        let mut recent = self.recent_ledgers.lock();
        if !recent.contains(&hash) {
            recent.push_back(hash);
            if recent.len() > RECENT_ITEMS {
                recent.pop_front();
            }
        }
    }

    /// Records a proposal's transaction set observed from this peer.
    pub(crate) fn on_proposal_seen(&self, tx_set: Hash256) {
        let mut recent = self.recent_tx_sets.lock();
        if !recent.contains(&tx_set) {
            recent.push_back(tx_set);
            if recent.len() > RECENT_ITEMS {
                recent.pop_front();
            }
        }
    }

    /// Whether the peer is known to have the given ledger.
    pub fn has_ledger(&self, hash: &Hash256, seq: u64) -> bool {
        if self.recent_ledgers.lock().contains(hash) {
            return true;
        }
        seq != 0 && seq <= self.latest_ledger.load(Ordering::Relaxed)
    }

    /// Whether the peer is known to have the given transaction set.
    pub fn has_tx_set(&self, hash: &Hash256) -> bool {
        self.recent_tx_sets.lock().contains(hash)
    }

    /// The newest ledger sequence observed from this peer.
    pub fn latest_ledger(&self) -> u64 {
        self.latest_ledger.load(Ordering::Relaxed)
    }

    /// Fan-out score: peers that have the wanted item rank first, then
    /// longer-lived peers, with a random component breaking up herds.
    pub fn get_score(&self, has_item: bool) -> i64 {
        let mut score: i64 = if has_item { 10_000 } else { 0 };
        score += self.uptime().as_secs().min(3_600) as i64;
        score += (rand::random::<u16>() % 1_000) as i64;
        score
    }

    /// Per-peer liveness indexed by ledger sequence: a peer that keeps
    /// lagging the network accumulates insanity and is eventually
    /// disconnected by [`check`](PeerHandle::check).
    pub fn check_sanity(&self, index: u64) {
        let latest = self.latest_ledger.load(Ordering::Relaxed);
        if latest + SANITY_DRIFT < index {
            self.insanity.fetch_add(1, Ordering::Relaxed);
        } else {
            self.insanity.store(0, Ordering::Relaxed);
        }
    }

    /// Periodic health check; closes the session when the peer has failed
    /// too many sanity checks in a row.
    pub fn check(&self) {
        if self.insanity.load(Ordering::Relaxed) >= MAX_INSANITY {
            debug!(peer = self.id, "dropping insane peer");
            self.close();
        }
    }
}

impl std::fmt::Debug for PeerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerHandle")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("inbound", &self.inbound)
            .finish()
    }
}

/// Drives one peer's I/O until the socket closes or the session is
/// cancelled, then tells the overlay. Any bytes already read past the
/// HTTP exchange are handed over as the initial read buffer so nothing is
/// lost.
pub(crate) async fn run_session<R, W>(
    overlay: Arc<Overlay>,
    handle: Arc<PeerHandle>,
    read: R,
    write: W,
    initial: BytesMut,
    rx: mpsc::Receiver<Bytes>,
) where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let writer = tokio::spawn(write_pump(write, rx, handle.cancel_token()));

    read_pump(&overlay, &handle, read, initial).await;

    // Reader finished first or was cancelled; stop the writer too.
    handle.close();
    let _ = writer.await;
    overlay.on_peer_closed(&handle);
}

async fn read_pump<R>(
    overlay: &Arc<Overlay>,
    handle: &Arc<PeerHandle>,
    read: R,
    initial: BytesMut,
) where
    R: AsyncRead + Send + Unpin + 'static,
{
    let cancel = handle.cancel_token();
    let mut framed = FramedRead::new(read, MessageCodec::new());
    if !initial.is_empty() {
        framed.read_buffer_mut().extend_from_slice(&initial);
    }

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = framed.next() => frame,
        };
        match frame {
            Some(Ok(message)) => {
                trace!(peer = handle.id(), kind = message.type_name(), "recv");
                overlay.on_message(handle, message);
            }
            Some(Err(e)) => {
                // A malformed message fails this session only.
                if !e.is_benign_close() {
                    debug!(peer = handle.id(), error = %e, "read failed");
                }
                break;
            }
            None => {
                debug!(peer = handle.id(), "connection closed by remote");
                break;
            }
        }
    }
}

async fn write_pump<W>(mut write: W, mut rx: mpsc::Receiver<Bytes>, cancel: CancellationToken)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = rx.recv() => frame,
        };
        let Some(frame) = frame else { break };
        if let Err(e) = write.write_all(&frame).await {
            debug!(error = %e, "write failed");
            break;
        }
    }
    // Best effort close-notify; aborted operations are normal here.
    let _ = write.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint_v4;
    use crate::handshake::VerifiedHello;
    use crate::CURRENT_PROTOCOL;
    use rill_crypto::SecretKey;

    fn verified(seed: u8) -> VerifiedHello {
        VerifiedHello {
            public_key: SecretKey::from_seed(&[seed; 32]).public_key(),
            version: CURRENT_PROTOCOL,
            cluster: false,
            hops_aware: true,
            public_ip: None,
            closed_ledger: None,
        }
    }

    fn handle() -> (Arc<PeerHandle>, mpsc::Receiver<Bytes>) {
        PeerHandle::new(
            1,
            1,
            true,
            endpoint_v4(198, 51, 100, 1, 40000),
            &verified(1),
            true,
            None,
        )
    }

    #[test]
    fn queue_overflow_closes_session() {
        let (peer, _rx) = handle();
        let frame = Bytes::from_static(b"x");
        for _ in 0..SEND_QUEUE_DEPTH {
            peer.send_frame(frame.clone()).unwrap();
        }
        let err = peer.send_frame(frame).unwrap_err();
        assert!(matches!(err, OverlayError::QueueOverflow));
        assert!(peer.is_closed());
    }

    #[test]
    fn ledger_tracking() {
        let (peer, _rx) = handle();
        let hash = Hash256::from_bytes([5u8; 32]);
        peer.on_validation_seen(100, hash);

        assert!(peer.has_ledger(&hash, 100));
        assert!(peer.has_ledger(&Hash256::ZERO, 99));
        assert!(!peer.has_ledger(&Hash256::ZERO, 101));
        assert_eq!(peer.latest_ledger(), 100);
    }

    #[test]
    fn tx_set_tracking() {
        let (peer, _rx) = handle();
        let hash = Hash256::from_bytes([6u8; 32]);
        assert!(!peer.has_tx_set(&hash));
        peer.on_proposal_seen(hash);
        assert!(peer.has_tx_set(&hash));
    }

    #[test]
    fn score_prefers_item_holders() {
        let (peer, _rx) = handle();
        assert!(peer.get_score(true) > peer.get_score(false));
    }

    #[test]
    fn sanity_accumulates_then_drops() {
        let (peer, _rx) = handle();
        peer.on_validation_seen(10, Hash256::ZERO);

        for _ in 0..MAX_INSANITY {
            peer.check_sanity(10 + SANITY_DRIFT + 1);
        }
        peer.check();
        assert!(peer.is_closed());
    }

    #[test]
    fn sanity_resets_on_catchup() {
        let (peer, _rx) = handle();
        peer.on_validation_seen(10, Hash256::ZERO);
        peer.check_sanity(10 + SANITY_DRIFT + 1);
        peer.check_sanity(10 + SANITY_DRIFT + 1);

        // The peer catches up; the counter resets.
        peer.on_validation_seen(1000, Hash256::ZERO);
        peer.check_sanity(1000);
        peer.check();
        assert!(!peer.is_closed());
    }
}
