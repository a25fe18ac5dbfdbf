//! The outbound dialer.
//!
//! A connect attempt is a short-lived child of the overlay that walks
//!
//! ```text
//! Connecting -> TlsHandshake -> HttpSend -> HttpReceive -> Handoff | Fail
//! ```
//!
//! with each phase under a 15-second watchdog. On any failure the attempt
//! releases its slot and backs the endpoint off in the boot cache; a `503`
//! with a parseable `peer-ips` body additionally feeds the peer finder
//! before teardown. On success the peer session takes over the stream,
//! including any bytes already read past the HTTP response.

use crate::handshake::{self, shared_value, Hello};
use crate::manager::{make_peer_request, Overlay, IO_TIMEOUT};
use crate::resource::Consumer;
use crate::slots::{ActivateResult, SlotId};
use crate::{http, Endpoint, OverlayError, Result};
use bytes::BytesMut;
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One outbound connection attempt, owned by the overlay.
pub(crate) struct ConnectAttempt {
    overlay: Arc<Overlay>,
    remote: Endpoint,
    slot: SlotId,
    usage: Option<Consumer>,
}

impl ConnectAttempt {
    pub fn new(overlay: Arc<Overlay>, remote: Endpoint, slot: SlotId, usage: Consumer) -> Self {
        debug!(remote = %remote, "connect");
        Self {
            overlay,
            remote,
            slot,
            usage: Some(usage),
        }
    }

    /// Drives the attempt to completion or cancellation. Either way the
    /// slot ends up owned by a peer session or released.
    pub async fn run(mut self, cancel: CancellationToken) {
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(OverlayError::ShuttingDown),
            result = self.attempt() => result,
        };
        if let Err(e) = result {
            match &e {
                // Cancellation is not the endpoint's fault; no backoff.
                OverlayError::ShuttingDown => {}
                e => {
                    if !e.is_benign_close() {
                        debug!(remote = %self.remote, error = %e, "connect attempt failed");
                    }
                    self.overlay.finder().on_connect_failure(self.remote);
                }
            }
            self.overlay.finder().on_closed(self.slot);
        }
    }

    /// The phases themselves; `Ok` means the slot and stream were handed
    /// to a peer session.
    async fn attempt(&mut self) -> Result<()> {
        // Connecting.
        let tcp = timeout(IO_TIMEOUT, TcpStream::connect(self.remote.to_socket()))
            .await
            .map_err(|_| OverlayError::Timeout("connect".into()))??;
        tcp.set_nodelay(true)?;
        let local = Endpoint::from_socket(tcp.local_addr()?);

        if !self.overlay.finder().on_connected(self.slot, local) {
            return Err(OverlayError::Protocol("duplicate connection".into()));
        }

        // TlsHandshake.
        let connector = TlsConnector::from(Arc::clone(&self.overlay.client_tls));
        let server_name = ServerName::try_from(self.remote.ip.to_string())
            .map_err(|_| OverlayError::Protocol("bad server name".into()))?;
        let mut tls = timeout(IO_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| OverlayError::Timeout("tls handshake".into()))??;

        let shared = shared_value(tls.get_ref().1)?;

        // HttpSend: upgrade request plus our hello bound to this session.
        let hello = Hello::build(
            self.overlay.secret(),
            &shared,
            handshake::supported_versions(),
            self.overlay.public_ip(),
            Some(self.remote.ip),
            None,
            self.overlay.is_cluster_member(),
        );
        let mut hello_headers = http::Headers::new();
        hello.append_to(&mut hello_headers);
        let crawl_public = !self.overlay.finder().config().peer_private;
        let request = make_peer_request(crawl_public, hello_headers);

        timeout(IO_TIMEOUT, tls.write_all(&request.encode()))
            .await
            .map_err(|_| OverlayError::Timeout("send request".into()))??;

        // HttpReceive.
        let mut buf = BytesMut::new();
        let response = timeout(IO_TIMEOUT, http::read_response(&mut tls, &mut buf))
            .await
            .map_err(|_| OverlayError::Timeout("read response".into()))??;

        if response.status == 503 {
            // A full peer suggests alternatives before we part ways.
            self.absorb_redirects(&response.body);
            return Err(OverlayError::SlotsFull);
        }
        if !response.is_upgrade() {
            return Err(OverlayError::Http(format!(
                "HTTP response: {} {}",
                response.status, response.reason
            )));
        }

        // Handoff: verify their hello against the same shared value.
        let verified = Hello::parse(&response.headers).and_then(|hello| {
            handshake::verify_hello(
                &hello,
                &shared,
                self.overlay.node_key(),
                self.overlay.cluster_roster(),
                |key| self.overlay.finder().key_active(key),
            )
        })?;
        info!(remote = %self.remote, key = %verified.public_key, "outbound handshake complete");

        match self
            .overlay
            .finder()
            .activate(self.slot, verified.public_key, verified.cluster)
        {
            ActivateResult::Success => {}
            _ => return Err(OverlayError::SlotsFull),
        }
        self.overlay.finder().set_version(self.slot, verified.version);

        let crawl = response
            .headers
            .get("Crawl")
            .map(|v| v.trim().eq_ignore_ascii_case("public"))
            .unwrap_or(false);

        // Bytes already read past the response become the session's
        // initial buffer.
        let leftover = buf.split();
        let (read, write) = tokio::io::split(tls);
        self.overlay.add_active(
            &verified,
            self.slot,
            false,
            self.remote,
            crawl,
            self.usage.take(),
            read,
            write,
            leftover,
        )?;
        Ok(())
    }

    /// Feeds a `peer-ips` redirect body into the finder.
    fn absorb_redirects(&self, body: &[u8]) {
        let Ok(json) = serde_json::from_slice::<serde_json::Value>(body) else {
            return;
        };
        let Some(ips) = json.get("peer-ips").and_then(|v| v.as_array()) else {
            return;
        };
        let endpoints: Vec<Endpoint> = ips
            .iter()
            .filter_map(|v| v.as_str())
            .filter_map(|s| s.parse().ok())
            .collect();
        debug!(remote = %self.remote, n = endpoints.len(), "absorbing redirects");
        self.overlay.finder().on_redirects(self.remote, &endpoints);
    }
}
