//! The overlay manager.
//!
//! [`Overlay`] owns every child object: peer sessions, in-flight connect
//! attempts, the listener and the once-per-second timer. It fields HTTP
//! handoffs from the TLS listener, runs admission, fans messages out to
//! peers, and choreographs shutdown: `stop()` signals every child,
//! children deregister as their tasks finish, and [`Overlay::shutdown`]
//! blocks until the children table is empty so no callback of ours can
//! fire afterwards.

use crate::connect::ConnectAttempt;
use crate::finder::{BootCache, PeerFinder};
use crate::handshake::{self, shared_value, Hello, VerifiedHello};
use crate::http::{self, Headers, Request, Response};
use crate::manifests::{Disposition, Manifest, ManifestCache};
use crate::message::{ManifestSet, Message};
use crate::peer::{self, PeerHandle};
use crate::resource::{Consumer, ResourceManager};
use crate::router::{HashRouter, RELAYED};
use crate::slots::{ActivateResult, FinderConfig, SlotId};
use crate::{
    parse_protocol_versions, Endpoint, HandshakeError, OverlayError, Result, CURRENT_PROTOCOL,
    USER_AGENT,
};
use bytes::BytesMut;
use parking_lot::Mutex;
use rill_common::{Config, Hash256};
use rill_crypto::{PublicKey, SecretKey};
use rusqlite::Connection;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Notify};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Watchdog applied to each phase of connection setup.
pub(crate) const IO_TIMEOUT: Duration = Duration::from_secs(15);

/// Timer ticks between peer health sweeps.
const CHECK_TICKS: u64 = 30;

/// Server-side TLS stream over TCP.
pub type TlsServerStream = tokio_rustls::server::TlsStream<TcpStream>;

/// Everything the overlay needs injected at construction. TLS context
/// construction, config parsing and logging sinks live outside this
/// crate.
pub struct Setup {
    pub config: Config,
    /// This node's long-lived identity key.
    pub secret: SecretKey,
    /// Node keys of the trusted cluster.
    pub cluster: BTreeSet<PublicKey>,
    /// TLS acceptor context; `None` for nodes that only dial out.
    pub server_tls: Option<Arc<rustls::ServerConfig>>,
    pub client_tls: Arc<rustls::ClientConfig>,
    /// Manifest persistence; `None` keeps manifests in memory only.
    pub manifest_db: Option<PathBuf>,
    /// Boot cache persistence; `None` keeps the cache in memory only.
    pub boot_cache_db: Option<PathBuf>,
}

/// What became of an accepted connection handed to the overlay.
pub enum Handoff {
    /// Neither a peer upgrade nor an admin route; the stream is handed
    /// back for other handlers (or to be dropped).
    Unhandled { stream: TlsServerStream },
    /// Handled at the HTTP layer; write this response and close.
    Response {
        stream: TlsServerStream,
        response: Response,
    },
    /// Upgraded: the overlay took ownership and spawned a peer session.
    Peer(Arc<PeerHandle>),
}

/// Messages and membership changes surfaced to the consensus engine and
/// other observers.
#[derive(Debug, Clone)]
pub enum OverlayEvent {
    Proposal {
        from: u32,
        proposal: crate::message::Proposal,
    },
    Validation {
        from: u32,
        validation: crate::message::Validation,
    },
    /// An accepted or untrusted manifest was received; stale and invalid
    /// ones are not published.
    Manifest {
        manifest: Manifest,
        disposition: Disposition,
    },
    PeerActivated {
        id: u32,
        key: PublicKey,
    },
    PeerDisconnected {
        id: u32,
        key: PublicKey,
    },
}

/// An insertion-ordered, deduplicating set of peers used for request
/// fan-out.
#[derive(Default)]
pub struct PeerSet {
    members: Vec<Arc<PeerHandle>>,
    seen: HashSet<u32>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when the peer was newly inserted.
    pub fn insert(&mut self, peer: Arc<PeerHandle>) -> bool {
        if self.seen.insert(peer.id()) {
            self.members.push(peer);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, id: u32) -> bool {
        self.seen.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<PeerHandle>> {
        self.members.iter()
    }
}

struct State {
    stopping: bool,
    /// Peer sessions keyed by slot.
    peers_by_slot: HashMap<SlotId, Weak<PeerHandle>>,
    /// Peer sessions keyed by short id. BTreeMap keeps id (insertion)
    /// order for deterministic fan-out tie-breaks.
    ids: BTreeMap<u32, Weak<PeerHandle>>,
    /// Every child object's stop handle: peer sessions, connect attempts,
    /// the timer, the listener.
    children: HashMap<u64, CancellationToken>,
}

/// The overlay network manager.
pub struct Overlay {
    finder: PeerFinder,
    resource: ResourceManager,
    router: HashRouter,
    manifests: ManifestCache,
    manifest_db: Option<Mutex<Connection>>,
    cluster: BTreeSet<PublicKey>,
    secret: SecretKey,
    node_key: PublicKey,
    public_ip: Option<std::net::Ipv4Addr>,
    expire: bool,
    max_ttl: u32,
    bootstrap_ips: Vec<String>,
    fixed_ips: Vec<String>,
    server_tls: Option<Arc<rustls::ServerConfig>>,
    pub(crate) client_tls: Arc<rustls::ClientConfig>,
    state: Mutex<State>,
    /// Signalled whenever the children table drains.
    done: Notify,
    next_peer_id: AtomicU32,
    next_child_id: AtomicU64,
    events: broadcast::Sender<OverlayEvent>,
}

impl Overlay {
    /// Builds the overlay from its setup. Configuration problems are
    /// fatal here; the node refuses to come up.
    pub fn new(setup: Setup) -> Result<Arc<Self>> {
        setup.config.validate()?;

        let finder_config = FinderConfig::from_config(&setup.config);
        let boot = match &setup.boot_cache_db {
            Some(path) => BootCache::open(path)?,
            None => BootCache::in_memory(),
        };
        let finder = PeerFinder::new(finder_config, boot, setup.config.public_ip());

        let manifests = ManifestCache::new();
        manifests.load_validator_keys(&setup.config.validator_keys)?;
        if let Some(text) = &setup.config.validation_manifest {
            manifests.config_manifest_base64(text)?;
        }
        let manifest_db = match &setup.manifest_db {
            Some(path) => {
                let conn = Connection::open(path)?;
                manifests.load(&conn)?;
                Some(Mutex::new(conn))
            }
            None => None,
        };

        let (events, _) = broadcast::channel(1024);
        let node_key = setup.secret.public_key();

        Ok(Arc::new(Self {
            finder,
            resource: ResourceManager::new(),
            router: HashRouter::new(),
            manifests,
            manifest_db,
            cluster: setup.cluster,
            node_key,
            secret: setup.secret,
            public_ip: setup.config.public_ip(),
            expire: setup.config.overlay.expire,
            max_ttl: setup.config.overlay.max_ttl,
            bootstrap_ips: setup.config.bootstrap_ips(),
            fixed_ips: setup.config.ips_fixed.clone(),
            server_tls: setup.server_tls,
            client_tls: setup.client_tls,
            state: Mutex::new(State {
                stopping: false,
                peers_by_slot: HashMap::new(),
                ids: BTreeMap::new(),
                children: HashMap::new(),
            }),
            done: Notify::new(),
            next_peer_id: AtomicU32::new(1),
            next_child_id: AtomicU64::new(1),
            events,
        }))
    }

    /// This node's public key.
    pub fn node_key(&self) -> &PublicKey {
        &self.node_key
    }

    pub fn finder(&self) -> &PeerFinder {
        &self.finder
    }

    pub fn resource(&self) -> &ResourceManager {
        &self.resource
    }

    pub fn manifests(&self) -> &ManifestCache {
        &self.manifests
    }

    pub(crate) fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub(crate) fn public_ip(&self) -> Option<std::net::Ipv4Addr> {
        self.public_ip
    }

    pub(crate) fn cluster_roster(&self) -> &BTreeSet<PublicKey> {
        &self.cluster
    }

    pub(crate) fn is_cluster_member(&self) -> bool {
        self.cluster.contains(&self.node_key)
    }

    /// Subscribes to overlay events (inbound messages, membership).
    pub fn subscribe(&self) -> broadcast::Receiver<OverlayEvent> {
        self.events.subscribe()
    }

    // ----- lifecycle ----------------------------------------------------

    /// Resolves bootstrap configuration and starts the timer.
    pub async fn start(self: &Arc<Self>) {
        // Boot cache: [ips], falling back to [ips_fixed], falling back to
        // the configured bootstrap entry.
        for entry in &self.bootstrap_ips {
            let endpoints = resolve_endpoint_str(entry).await;
            let strings: Vec<String> = endpoints.iter().map(|e| e.to_string()).collect();
            self.finder.add_fallback_strings(entry, &strings);
        }
        for entry in &self.fixed_ips {
            let endpoints = resolve_endpoint_str(entry).await;
            if !endpoints.is_empty() {
                self.finder.add_fixed_peer(entry, &endpoints);
            }
        }

        let Some((child, cancel)) = self.register_child() else {
            return;
        };
        let overlay = Arc::clone(self);
        tokio::spawn(async move {
            overlay.timer_loop(cancel).await;
            overlay.deregister_child(child);
        });
    }

    async fn timer_loop(self: &Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        let mut ticks: u64 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            ticks += 1;
            self.finder.once_per_second();
            self.send_endpoints();
            self.auto_connect();
            if ticks % CHECK_TICKS == 0 {
                self.check();
                self.router.sweep();
            }
        }
    }

    /// Accepts connections and hands each one off. The listener is a
    /// child; `stop()` shuts it down with everything else.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) {
        let Some(server_tls) = self.server_tls.clone() else {
            warn!("no server TLS context, not accepting peers");
            return;
        };
        let Some((child, cancel)) = self.register_child() else {
            return;
        };
        let acceptor = TlsAcceptor::from(server_tls);
        info!(addr = ?listener.local_addr().ok(), "overlay listening");

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, remote) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let Some((conn_child, conn_cancel)) = self.register_child() else {
                break;
            };
            let overlay = Arc::clone(self);
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = conn_cancel.cancelled() => {}
                    _ = overlay.handle_connection(acceptor, stream, remote) => {}
                }
                overlay.deregister_child(conn_child);
            });
        }
        self.deregister_child(child);
    }

    async fn handle_connection(
        self: &Arc<Self>,
        acceptor: TlsAcceptor,
        stream: TcpStream,
        remote: SocketAddr,
    ) {
        let result = async {
            let mut tls = tokio::time::timeout(IO_TIMEOUT, acceptor.accept(stream))
                .await
                .map_err(|_| OverlayError::Timeout("tls accept".into()))??;
            let mut buf = BytesMut::new();
            let request = tokio::time::timeout(IO_TIMEOUT, http::read_request(&mut tls, &mut buf))
                .await
                .map_err(|_| OverlayError::Timeout("read request".into()))??;

            match self.on_handoff(tls, request, buf, remote).await? {
                Handoff::Response {
                    mut stream,
                    response,
                } => {
                    stream.write_all(&response.encode()).await?;
                    let _ = stream.shutdown().await;
                }
                Handoff::Unhandled { stream } => {
                    // No other handlers behind this listener; drop.
                    drop(stream);
                }
                Handoff::Peer(_) => {}
            }
            Ok::<(), OverlayError>(())
        }
        .await;

        if let Err(e) = result {
            if !e.is_benign_close() {
                debug!(%remote, error = %e, "inbound connection failed");
            }
        }
    }

    // ----- inbound admission -------------------------------------------

    /// Classifies and, where possible, completes an accepted connection:
    /// the `/crawl` admin route is answered, peer upgrades run the full
    /// admission pipeline, anything else is handed back.
    ///
    /// On the `Peer` outcome the `101` response has already been written
    /// and a session spawned around the stream; `buf` carries any bytes
    /// read past the request head into the session's initial read buffer
    /// so nothing is lost.
    pub async fn on_handoff(
        self: &Arc<Self>,
        mut tls: TlsServerStream,
        request: Request,
        mut buf: BytesMut,
        remote: SocketAddr,
    ) -> Result<Handoff> {
        if request.target == "/crawl" {
            let response = Response::new(200, "OK").with_json(&json!({ "overlay": self.crawl() }));
            return Ok(Handoff::Response {
                stream: tls,
                response,
            });
        }
        if !is_peer_upgrade(&request) {
            return Ok(Handoff::Unhandled { stream: tls });
        }

        debug!(%remote, "peer connection upgrade");

        // Strict request validation before any admission work.
        if let Err(e) = request.validate() {
            debug!(%remote, error = %e, "rejecting invalid upgrade request");
            return Ok(Handoff::Response {
                stream: tls,
                response: Response::new(400, "Bad Request"),
            });
        }

        let local = match tls.get_ref().0.local_addr() {
            Ok(addr) => Endpoint::from_socket(addr),
            Err(e) => {
                debug!(%remote, error = %e, "no local endpoint");
                return Err(e.into());
            }
        };
        let remote_endpoint = Endpoint::from_socket(remote);

        let usage = self.resource.new_inbound_endpoint(remote.ip());
        if usage.disconnect() {
            debug!(%remote, "over resource limit");
            return Err(OverlayError::OverResourceLimit);
        }

        let Some(slot) = self.finder.new_inbound_slot(local, remote_endpoint) else {
            // Self-connect or per-IP limit: drop without a response.
            debug!(%remote, "no inbound slot");
            return Err(OverlayError::SlotsFull);
        };

        // Connect-As is a comma list compared case-insensitively; unknown
        // values get a redirect rather than a hard close.
        let connect_as_peer = request
            .headers
            .get("Connect-As")
            .map(|v| http::split_commas(v).any(|tok| tok.eq_ignore_ascii_case("peer")))
            .unwrap_or(false);
        if !connect_as_peer {
            let response = self.make_redirect_response(slot, remote.ip());
            self.finder.on_closed(slot);
            return Ok(Handoff::Response {
                stream: tls,
                response,
            });
        }

        let shared = match shared_value(tls.get_ref().1) {
            Ok(shared) => shared,
            Err(e) => {
                self.finder.on_closed(slot);
                return Err(e.into());
            }
        };

        let verified = match Hello::parse(&request.headers).and_then(|hello| {
            handshake::verify_hello(&hello, &shared, &self.node_key, &self.cluster, |key| {
                self.finder.key_active(key)
            })
        }) {
            Ok(verified) => verified,
            Err(HandshakeError::DuplicateNode) => {
                debug!(%remote, "duplicate node");
                let response = self.make_redirect_response(slot, remote.ip());
                self.finder.on_closed(slot);
                return Ok(Handoff::Response {
                    stream: tls,
                    response,
                });
            }
            Err(e) => {
                // Self-connects and bad hellos are dropped without a
                // response.
                debug!(%remote, error = %e, "hello verification failed");
                self.finder.on_closed(slot);
                return Err(e.into());
            }
        };

        match self
            .finder
            .activate(slot, verified.public_key, verified.cluster)
        {
            ActivateResult::Success => {}
            result => {
                debug!(%remote, ?result, "peer redirected, slots full");
                let response = self.make_redirect_response(slot, remote.ip());
                self.finder.on_closed(slot);
                return Ok(Handoff::Response {
                    stream: tls,
                    response,
                });
            }
        }
        self.finder.set_version(slot, verified.version);

        // Accept: 101 with our own hello bound to the same shared value.
        let mut response = Response::new(101, "Switching Protocols")
            .with_header("Connection", "Upgrade")
            .with_header("Upgrade", verified.version.to_string());
        let hello = Hello::build(
            &self.secret,
            &shared,
            handshake::supported_versions(),
            None,
            Some(remote.ip()),
            None,
            self.is_cluster_member(),
        );
        hello.append_to(&mut response.headers);
        if let Err(e) = tls.write_all(&response.encode()).await {
            self.finder.on_closed(slot);
            return Err(e.into());
        }

        let crawl = request
            .headers
            .get("Crawl")
            .map(|v| v.trim().eq_ignore_ascii_case("public"))
            .unwrap_or(false);

        let leftover = buf.split();
        let (read, write) = tokio::io::split(tls);
        let handle = match self.add_active(
            &verified,
            slot,
            true,
            remote_endpoint,
            crawl,
            Some(usage),
            read,
            write,
            leftover,
        ) {
            Ok(handle) => handle,
            Err(e) => {
                self.finder.on_closed(slot);
                return Err(e);
            }
        };
        Ok(Handoff::Peer(handle))
    }

    /// `503 Service Unavailable` carrying a short list of healthy peers.
    pub(crate) fn make_redirect_response(
        &self,
        slot: SlotId,
        remote_ip: std::net::IpAddr,
    ) -> Response {
        let ips: Vec<String> = self
            .finder
            .redirect(slot)
            .iter()
            .map(|e| e.to_string())
            .collect();
        Response::new(503, "Service Unavailable")
            .with_header("Remote-Address", remote_ip.to_string())
            .with_json(&json!({ "peer-ips": ips }))
    }

    // ----- outbound -----------------------------------------------------

    /// Initiates an outbound attempt. Silently ignored when out of slots
    /// or over resource budget.
    pub fn connect(self: &Arc<Self>, remote: Endpoint) {
        let usage = self.resource.new_outbound_endpoint(remote.ip);
        if usage.disconnect() {
            info!(%remote, "over resource limit");
            return;
        }
        let Some(slot) = self.finder.new_outbound_slot(remote) else {
            debug!(%remote, "connect: no slot");
            return;
        };
        let Some((child, cancel)) = self.register_child() else {
            self.finder.on_closed(slot);
            return;
        };

        let overlay = Arc::clone(self);
        tokio::spawn(async move {
            let attempt = ConnectAttempt::new(Arc::clone(&overlay), remote, slot, usage);
            attempt.run(cancel).await;
            overlay.deregister_child(child);
        });
    }

    fn auto_connect(self: &Arc<Self>) {
        for endpoint in self.finder.autoconnect() {
            self.connect(endpoint);
        }
    }

    // ----- peer registration -------------------------------------------

    /// Registers a fully handshaked peer and starts its I/O pumps. The
    /// slot must already be activated; normally only the handshake paths
    /// call this.
    ///
    /// The session is inserted into the children table and its pumps are
    /// spawned while the overlay lock is held: otherwise a racing
    /// `stop()` could iterate the table before the new session is in it
    /// and new I/O would be scheduled after shutdown began.
    #[allow(clippy::too_many_arguments)]
    pub fn add_active<R, W>(
        self: &Arc<Self>,
        verified: &VerifiedHello,
        slot: SlotId,
        inbound: bool,
        remote: Endpoint,
        crawl: bool,
        usage: Option<Consumer>,
        read: R,
        write: W,
        leftover: BytesMut,
    ) -> Result<Arc<PeerHandle>>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let id = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        let (handle, rx) = PeerHandle::new(id, slot, inbound, remote, verified, crawl, usage);

        {
            let mut state = self.state.lock();
            if state.stopping {
                return Err(OverlayError::ShuttingDown);
            }
            state.peers_by_slot.insert(slot, Arc::downgrade(&handle));
            state.ids.insert(id, Arc::downgrade(&handle));

            let child = self.next_child_id.fetch_add(1, Ordering::Relaxed);
            state.children.insert(child, handle.cancel_token());

            let overlay = Arc::clone(self);
            let session_handle = Arc::clone(&handle);
            tokio::spawn(async move {
                peer::run_session(
                    Arc::clone(&overlay),
                    session_handle,
                    read,
                    write,
                    leftover,
                    rx,
                )
                .await;
                overlay.deregister_child(child);
            });
        }

        info!(
            peer = id,
            %remote,
            key = %verified.public_key,
            inbound,
            "activated"
        );
        let _ = self.events.send(OverlayEvent::PeerActivated {
            id,
            key: verified.public_key,
        });
        Ok(handle)
    }

    /// Called exactly once by a session's pump task as it winds down.
    pub(crate) fn on_peer_closed(&self, handle: &Arc<PeerHandle>) {
        {
            let mut state = self.state.lock();
            state.ids.remove(&handle.id());
            state.peers_by_slot.remove(&handle.slot());
        }
        self.finder.on_closed(handle.slot());
        debug!(peer = handle.id(), "deactivated");
        let _ = self.events.send(OverlayEvent::PeerDisconnected {
            id: handle.id(),
            key: *handle.node_key(),
        });
    }

    // ----- children / shutdown -----------------------------------------

    /// Adds a stop handle to the children table. Returns `None` when the
    /// overlay is already stopping, in which case no new work may start.
    pub(crate) fn register_child(&self) -> Option<(u64, CancellationToken)> {
        let mut state = self.state.lock();
        if state.stopping {
            return None;
        }
        let id = self.next_child_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        state.children.insert(id, cancel.clone());
        Some((id, cancel))
    }

    pub(crate) fn deregister_child(&self, id: u64) {
        let empty = {
            let mut state = self.state.lock();
            state.children.remove(&id);
            state.children.is_empty()
        };
        if empty {
            self.done.notify_waiters();
        }
    }

    /// Signals every child to stop. Idempotent; new work is refused from
    /// this point on.
    pub fn stop(&self) {
        let children: Vec<CancellationToken> = {
            let mut state = self.state.lock();
            if state.stopping {
                return;
            }
            state.stopping = true;
            state.children.values().cloned().collect()
        };
        info!(children = children.len(), "overlay stopping");
        for cancel in children {
            cancel.cancel();
        }
        if self.state.lock().children.is_empty() {
            self.done.notify_waiters();
        }
    }

    /// Stops and blocks until every child has wound down. After this
    /// returns, the children table is empty and no outstanding
    /// asynchronous operation remains.
    pub async fn shutdown(&self) {
        self.stop();
        loop {
            let notified = self.done.notified();
            if self.state.lock().children.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Number of children still alive; zero after shutdown.
    pub fn children_len(&self) -> usize {
        self.state.lock().children.len()
    }

    // ----- message fan-out ---------------------------------------------

    /// Live peer handles in short-id (insertion) order.
    pub fn active_peers(&self) -> Vec<Arc<PeerHandle>> {
        self.state
            .lock()
            .ids
            .values()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn find_peer(&self, id: u32) -> Option<Arc<PeerHandle>> {
        self.state.lock().ids.get(&id).and_then(Weak::upgrade)
    }

    /// Number of active peers.
    pub fn size(&self) -> usize {
        self.active_peers().len()
    }

    /// The configured peer cap.
    pub fn limit(&self) -> usize {
        self.finder.config().max_peers
    }

    /// Sends a message to every active peer. When `expire` is set, hop
    /// counts are zeroed first so downstream nodes cannot observe our
    /// relay topology. Messages that declare hops only go to hop-aware
    /// peers.
    pub fn send(&self, message: &Message) {
        let mut out = message.clone();
        if self.expire {
            out.set_hops(0);
        }
        let Ok(frame) = out.to_frame() else { return };
        let has_hops = out.hops().is_some();
        for peer in self.active_peers() {
            if has_hops && !peer.hops_aware() {
                continue;
            }
            self.resource
                .report_traffic(out.category(), false, frame.len() as u64);
            let _ = peer.send_frame(frame.clone());
        }
    }

    /// Relays a message at most once per content hash, skipping peers
    /// that already saw the content and respecting the hop-count TTL.
    /// Returns the number of peers the message went to.
    pub fn relay(&self, message: &Message, uid: Hash256) -> usize {
        if let Some(hops) = message.hops() {
            if hops >= self.max_ttl {
                trace!(%uid, hops, "TTL exceeded, not relaying");
                return 0;
            }
        }
        let mut skip = HashSet::new();
        if !self.router.swap_set(uid, &mut skip, RELAYED) {
            return 0;
        }

        let mut out = message.clone();
        if let Some(hops) = out.hops() {
            out.set_hops(if self.expire { 0 } else { hops + 1 });
        }
        let Ok(frame) = out.to_frame() else { return 0 };
        let has_hops = out.hops().is_some();

        let mut sent = 0;
        for peer in self.active_peers() {
            if skip.contains(&peer.id()) {
                continue;
            }
            if has_hops && !peer.hops_aware() {
                continue;
            }
            self.resource
                .report_traffic(out.category(), false, frame.len() as u64);
            if peer.send_frame(frame.clone()).is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Scores every active peer, sorts descending and inserts into `set`
    /// until `limit` are accepted. Ties break by insertion order.
    pub fn select_peers(
        &self,
        set: &mut PeerSet,
        limit: usize,
        score: impl Fn(&Arc<PeerHandle>) -> bool,
    ) -> usize {
        let mut scored: Vec<(i64, Arc<PeerHandle>)> = self
            .active_peers()
            .into_iter()
            .map(|p| (p.get_score(score(&p)), p))
            .collect();
        // Stable sort keeps insertion order among equal scores.
        scored.sort_by(|a, b| b.0.cmp(&a.0));

        let mut accepted = 0;
        for (_, peer) in scored {
            if set.insert(peer) {
                accepted += 1;
                if accepted >= limit {
                    break;
                }
            }
        }
        accepted
    }

    /// Runs a sanity sweep against the given ledger index.
    pub fn check_sanity(&self, index: u64) {
        for peer in self.active_peers() {
            peer.check_sanity(index);
        }
    }

    /// Periodic health check; insane peers get closed.
    pub fn check(&self) {
        for peer in self.active_peers() {
            peer.check();
        }
    }

    // ----- inbound dispatch --------------------------------------------

    /// Dispatches one decoded message from a peer session.
    pub(crate) fn on_message(&self, from: &Arc<PeerHandle>, message: Message) {
        let size = bincode::serialized_size(&message).unwrap_or(0);
        self.resource.report_traffic(message.category(), true, size);

        match message {
            Message::Proposal(proposal) => {
                let uid = proposal.uid();
                // The TTL check comes before any hash router update: a
                // copy arriving with its hops spent is consumed locally
                // but must not create a suppression entry, or a later
                // under-TTL copy of the same content would never relay.
                if proposal.hops.map_or(false, |h| h >= self.max_ttl) {
                    trace!(peer = from.id(), %uid, hops = ?proposal.hops, "TTL exceeded");
                    from.on_proposal_seen(proposal.tx_set);
                    let _ = self.events.send(OverlayEvent::Proposal {
                        from: from.id(),
                        proposal,
                    });
                    return;
                }
                if !self.router.add_suppression_peer(uid, from.id()) {
                    trace!(peer = from.id(), %uid, "duplicate proposal");
                    return;
                }
                from.on_proposal_seen(proposal.tx_set);
                let _ = self.events.send(OverlayEvent::Proposal {
                    from: from.id(),
                    proposal: proposal.clone(),
                });
                self.relay(&Message::Proposal(proposal), uid);
            }
            Message::Validation(validation) => {
                let uid = validation.uid();
                if validation.hops.map_or(false, |h| h >= self.max_ttl) {
                    trace!(peer = from.id(), %uid, hops = ?validation.hops, "TTL exceeded");
                    from.on_validation_seen(validation.ledger_seq, validation.ledger_hash);
                    let _ = self.events.send(OverlayEvent::Validation {
                        from: from.id(),
                        validation,
                    });
                    return;
                }
                if !self.router.add_suppression_peer(uid, from.id()) {
                    trace!(peer = from.id(), %uid, "duplicate validation");
                    return;
                }
                from.on_validation_seen(validation.ledger_seq, validation.ledger_hash);
                let _ = self.events.send(OverlayEvent::Validation {
                    from: from.id(),
                    validation: validation.clone(),
                });
                self.relay(&Message::Validation(validation), uid);
            }
            Message::Manifests(set) => self.on_manifests(from, set),
            Message::Endpoints(gossip) => {
                self.finder.on_endpoint_gossip(from.slot(), &gossip);
            }
        }
    }

    /// Applies a manifest batch: accepted manifests are persisted and
    /// re-announced, untrusted ones only published, stale and invalid
    /// ones dropped. A "history" set is never re-relayed.
    fn on_manifests(&self, from: &Arc<PeerHandle>, set: ManifestSet) {
        let n = set.manifests.len();
        debug!(peer = from.id(), n, history = set.history, "manifests");

        for (i, raw) in set.manifests.iter().enumerate() {
            let manifest = match Manifest::decode(raw) {
                Ok(m) => m,
                Err(_) => {
                    warn!(peer = from.id(), index = i, "malformed manifest");
                    continue;
                }
            };
            let hash = manifest.hash();
            if !self.router.add_suppression_peer(hash, from.id()) {
                continue;
            }

            let disposition = self.manifests.apply_manifest(&manifest);
            match disposition {
                Disposition::Accepted | Disposition::Untrusted => {
                    let _ = self.events.send(OverlayEvent::Manifest {
                        manifest: manifest.clone(),
                        disposition,
                    });
                }
                Disposition::Stale | Disposition::Invalid => {
                    info!(peer = from.id(), index = i, ?disposition, "bad manifest");
                }
            }

            if disposition == Disposition::Accepted {
                if let Some(db) = &self.manifest_db {
                    if let Err(e) = ManifestCache::store_raw(&db.lock(), raw) {
                        warn!(error = %e, "manifest write-through failed");
                    }
                }
            }

            if set.history {
                // Historical manifests are applied but never forwarded.
                let mut skip = HashSet::new();
                self.router.swap_set(hash, &mut skip, RELAYED);
                continue;
            }

            if disposition == Disposition::Accepted {
                let mut skip = HashSet::new();
                if self.router.swap_set(hash, &mut skip, RELAYED) {
                    let announce = Message::Manifests(ManifestSet {
                        history: false,
                        manifests: vec![raw.clone()],
                    });
                    if let Ok(frame) = announce.to_frame() {
                        for peer in self.active_peers() {
                            if !skip.contains(&peer.id()) {
                                let _ = peer.send_frame(frame.clone());
                            }
                        }
                    }
                }
            }
        }
    }

    /// Pushes the finder's endpoint gossip to each recipient.
    fn send_endpoints(&self) {
        let by_slot: HashMap<SlotId, Weak<PeerHandle>> = {
            let state = self.state.lock();
            state.peers_by_slot.clone()
        };
        for (slot, gossip) in self.finder.build_endpoints_for_peers() {
            if let Some(peer) = by_slot.get(&slot).and_then(Weak::upgrade) {
                let _ = peer.send(&Message::Endpoints(gossip));
            }
        }
    }

    // ----- admin --------------------------------------------------------

    /// The `/crawl` payload: active peers with identity, direction and
    /// uptime; address details only for peers that opted into crawl.
    pub fn crawl(&self) -> serde_json::Value {
        let mut active = Vec::new();
        for peer in self.active_peers() {
            let mut entry = json!({
                "public_key": peer.node_key().to_base64(),
                "type": if peer.inbound() { "in" } else { "out" },
                "uptime": peer.uptime().as_secs(),
                "version": peer.version().to_string(),
            });
            if peer.crawl() {
                let map = entry.as_object_mut().expect("object");
                map.insert("ip".into(), json!(peer.remote().ip.to_string()));
                let port = if peer.inbound() {
                    self.finder
                        .get_slot(peer.slot())
                        .and_then(|s| s.listening_port)
                } else {
                    Some(peer.remote().port)
                };
                if let Some(port) = port {
                    map.insert("port".into(), json!(port));
                }
            }
            active.push(entry);
        }
        json!({ "active": active })
    }

    /// Verbose per-peer JSON for operators.
    pub fn json(&self) -> serde_json::Value {
        let peers: Vec<serde_json::Value> = self
            .active_peers()
            .iter()
            .map(|peer| {
                json!({
                    "id": peer.id(),
                    "public_key": peer.node_key().to_base64(),
                    "address": peer.remote().to_string(),
                    "inbound": peer.inbound(),
                    "uptime": peer.uptime().as_secs(),
                    "cluster": peer.cluster(),
                    "version": peer.version().to_string(),
                    "latest_ledger": peer.latest_ledger(),
                })
            })
            .collect();
        json!({
            "size": peers.len(),
            "peers": peers,
            "traffic": self.resource.traffic().iter().map(|t| json!({
                "category": t.category,
                "bytes_in": t.bytes_in,
                "bytes_out": t.bytes_out,
                "messages_in": t.messages_in,
                "messages_out": t.messages_out,
            })).collect::<Vec<_>>(),
        })
    }
}

/// Upgrade detection: the request must ask for an upgrade and name at
/// least one version of our protocol token.
pub(crate) fn is_peer_upgrade(request: &Request) -> bool {
    if !request.is_upgrade() {
        return false;
    }
    request
        .headers
        .get("Upgrade")
        .map(|v| !parse_protocol_versions(v).is_empty())
        .unwrap_or(false)
}

/// Builds the dialer's upgrade request with hello headers appended.
pub(crate) fn make_peer_request(crawl_public: bool, hello_headers: Headers) -> Request {
    let mut request = Request::get("/");
    request.headers.insert("User-Agent", USER_AGENT);
    request
        .headers
        .insert("Upgrade", CURRENT_PROTOCOL.to_string());
    request.headers.insert("Connection", "Upgrade");
    request.headers.insert("Connect-As", "Peer");
    request
        .headers
        .insert("Crawl", if crawl_public { "public" } else { "private" });
    for (name, value) in hello_headers.iter() {
        request.headers.insert(name.to_string(), value.to_string());
    }
    request
}

/// Resolves a config endpoint string (`ip:port`, `ip port` or
/// `host port`) to socket endpoints.
pub(crate) async fn resolve_endpoint_str(s: &str) -> Vec<Endpoint> {
    if let Ok(endpoint) = s.parse::<Endpoint>() {
        return vec![endpoint];
    }
    let normalized = match s.trim().rsplit_once(' ') {
        Some((host, port)) => format!("{}:{}", host.trim(), port.trim()),
        None => s.trim().to_string(),
    };
    let result = tokio::net::lookup_host(&normalized).await;
    match result {
        Ok(addrs) => addrs.map(Endpoint::from_socket).collect(),
        Err(e) => {
            debug!(entry = s, error = %e, "cannot resolve bootstrap entry");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint_v4;

    fn client_tls() -> Arc<rustls::ClientConfig> {
        Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(rustls::RootCertStore::empty())
                .with_no_client_auth(),
        )
    }

    fn overlay() -> Arc<Overlay> {
        let setup = Setup {
            config: Config::default(),
            secret: SecretKey::from_seed(&[99u8; 32]),
            cluster: BTreeSet::new(),
            server_tls: None,
            client_tls: client_tls(),
            manifest_db: None,
            boot_cache_db: None,
        };
        Overlay::new(setup).unwrap()
    }

    fn key(seed: u8) -> PublicKey {
        SecretKey::from_seed(&[seed; 32]).public_key()
    }

    #[test]
    fn redirect_response_carries_known_peers() {
        let overlay = overlay();
        let local = endpoint_v4(203, 0, 113, 9, 51235);

        // One admitted peer whose listening port we know.
        let first = overlay
            .finder()
            .new_inbound_slot(local, endpoint_v4(198, 51, 100, 1, 40000))
            .unwrap();
        assert_eq!(
            overlay.finder().activate(first, key(1), false),
            ActivateResult::Success
        );
        overlay.finder().set_listening_port(first, 51235);

        // A client we cannot admit gets pointed at it.
        let full = overlay
            .finder()
            .new_inbound_slot(local, endpoint_v4(198, 51, 100, 2, 40001))
            .unwrap();
        let remote_ip: std::net::IpAddr = "198.51.100.2".parse().unwrap();
        let response = overlay.make_redirect_response(full, remote_ip);

        assert_eq!(response.status, 503);
        assert_eq!(response.headers.get("Remote-Address"), Some("198.51.100.2"));
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        let ips: Vec<&str> = body["peer-ips"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|v| v.as_str())
            .collect();
        assert!(ips.contains(&"198.51.100.1:51235"));
    }

    #[test]
    fn upgrade_detection_requires_known_protocol() {
        let mut request = Request::get("/");
        request.headers.insert("Connection", "Upgrade");
        request.headers.insert("Upgrade", "websocket");
        assert!(!is_peer_upgrade(&request));

        let mut request = Request::get("/");
        request.headers.insert("Connection", "Upgrade");
        request.headers.insert("Upgrade", CURRENT_PROTOCOL.to_string());
        assert!(is_peer_upgrade(&request));
    }

    #[test]
    fn peer_request_has_required_headers() {
        let request = make_peer_request(true, Headers::new());
        assert_eq!(request.method, "GET");
        assert_eq!(request.target, "/");
        assert!(request.is_upgrade());
        assert_eq!(request.headers.get("Connect-As"), Some("Peer"));
        assert_eq!(request.headers.get("Crawl"), Some("public"));
        assert!(request.headers.get("User-Agent").is_some());

        let request = make_peer_request(false, Headers::new());
        assert_eq!(request.headers.get("Crawl"), Some("private"));
    }

    #[tokio::test]
    async fn endpoint_strings_resolve() {
        assert_eq!(
            resolve_endpoint_str("198.51.100.1 51235").await,
            vec![endpoint_v4(198, 51, 100, 1, 51235)]
        );
        assert_eq!(
            resolve_endpoint_str("198.51.100.1:51235").await,
            vec![endpoint_v4(198, 51, 100, 1, 51235)]
        );
        assert!(resolve_endpoint_str("garbage").await.is_empty());
    }
}
