//! Minimal HTTP/1.1 exchange on top of the TLS stream.
//!
//! The overlay speaks exactly one HTTP round trip per connection: the
//! upgrade request and its response. Parsing is delegated to `httparse`;
//! this module adds async framing, strict validation of what we accept,
//! and response serialization.

use crate::{OverlayError, Result};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Hard cap on the request/response head. Anything larger is rejected
/// before parsing continues.
pub const MAX_HEAD_BYTES: usize = 8 * 1024;

/// Cap on a response body (`peer-ips` redirect lists are tiny).
const MAX_BODY_BYTES: usize = 64 * 1024;

const MAX_HEADERS: usize = 64;

/// An ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// First value for `name`, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// A parsed HTTP request head.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub target: String,
    /// Minor version of HTTP/1.x.
    pub version: u8,
    pub headers: Headers,
}

impl Request {
    /// Builds an upgrade request for the dialer side.
    pub fn get(target: &str) -> Self {
        Self {
            method: "GET".to_string(),
            target: target.to_string(),
            version: 1,
            headers: Headers::new(),
        }
    }

    /// True when the request asks for a connection upgrade.
    pub fn is_upgrade(&self) -> bool {
        let connection_upgrade = self
            .headers
            .get("Connection")
            .map(|v| {
                v.split(',')
                    .any(|tok| tok.trim().eq_ignore_ascii_case("upgrade"))
            })
            .unwrap_or(false);
        connection_upgrade && self.headers.contains("Upgrade")
    }

    /// Strict validation of an inbound request before upgrade handling:
    /// only `GET`, no transfer encodings, no body.
    pub fn validate(&self) -> Result<()> {
        if self.method != "GET" {
            return Err(OverlayError::Http(format!(
                "method not allowed: {}",
                self.method
            )));
        }
        if self.headers.contains("Transfer-Encoding") {
            return Err(OverlayError::Http("transfer encoding not allowed".into()));
        }
        if let Some(len) = self.headers.get("Content-Length") {
            if len.trim() != "0" {
                return Err(OverlayError::Http("request body not allowed".into()));
            }
        }
        Ok(())
    }

    /// Serializes the request head.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("{} {} HTTP/1.{}\r\n", self.method, self.target, self.version);
        for (name, value) in self.headers.iter() {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out.into_bytes()
    }
}

/// An HTTP response, either parsed from the wire or built for sending.
#[derive(Debug, Clone)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: u16, reason: &str) -> Self {
        Self {
            status,
            reason: reason.to_string(),
            headers: Headers::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name, value.into());
        self
    }

    /// Attaches a JSON body with the matching content type.
    pub fn with_json(mut self, value: &serde_json::Value) -> Self {
        self.body = value.to_string().into_bytes();
        self.headers.insert("Content-Type", "application/json");
        self
    }

    /// True when the response upgrades the connection to the peer
    /// protocol.
    pub fn is_upgrade(&self) -> bool {
        self.status == 101 && self.headers.contains("Upgrade")
    }

    /// Serializes status line, headers, `Content-Length` and body.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = format!("HTTP/1.1 {} {}\r\n", self.status, self.reason);
        for (name, value) in self.headers.iter() {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        if !self.body.is_empty() || self.status != 101 {
            out.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        out.push_str("\r\n");
        let mut bytes = out.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

/// Reads one request head from `stream` into `buf`. Bytes past the head
/// remain in `buf` for the caller.
pub async fn read_request<S>(stream: &mut S, buf: &mut BytesMut) -> Result<Request>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(request) = try_parse_request(buf)? {
            return Ok(request);
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(OverlayError::Http("oversize request head".into()));
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(OverlayError::PeerDisconnected);
        }
    }
}

/// Parses a request head out of `buf`, consuming it on success. Bytes
/// past the head are left for the caller.
fn try_parse_request(buf: &mut BytesMut) -> Result<Option<Request>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);
    match parsed.parse(buf) {
        Ok(httparse::Status::Complete(head_len)) => {
            let mut out = Request {
                method: parsed.method.unwrap_or_default().to_string(),
                target: parsed.path.unwrap_or_default().to_string(),
                version: parsed.version.unwrap_or(1),
                headers: Headers::new(),
            };
            for h in parsed.headers.iter() {
                out.headers.insert(
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).to_string(),
                );
            }
            let _ = buf.split_to(head_len);
            Ok(Some(out))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(OverlayError::Http(format!("bad request: {e}"))),
    }
}

/// Reads one response (head plus `Content-Length` body) from `stream`.
/// Bytes past the response remain in `buf`.
pub async fn read_response<S>(stream: &mut S, buf: &mut BytesMut) -> Result<Response>
where
    S: AsyncRead + Unpin,
{
    // Head first.
    let (mut response, body_len) = loop {
        if let Some(parsed) = try_parse_response(buf)? {
            break parsed;
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(OverlayError::Http("oversize response head".into()));
        }
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(OverlayError::PeerDisconnected);
        }
    };

    // Then the declared body.
    if body_len > MAX_BODY_BYTES {
        return Err(OverlayError::Http(format!("oversize body: {body_len}")));
    }
    while buf.len() < body_len {
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(OverlayError::PeerDisconnected);
        }
    }
    response.body = buf.split_to(body_len).to_vec();
    Ok(response)
}

/// Parses a response head out of `buf`, consuming it on success and
/// returning the declared body length.
fn try_parse_response(buf: &mut BytesMut) -> Result<Option<(Response, usize)>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut headers);
    match parsed.parse(buf) {
        Ok(httparse::Status::Complete(head_len)) => {
            let mut out = Response::new(
                parsed.code.unwrap_or(0),
                parsed.reason.unwrap_or_default(),
            );
            for h in parsed.headers.iter() {
                out.headers.insert(
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).to_string(),
                );
            }
            let body_len = out
                .headers
                .get("Content-Length")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            let _ = buf.split_to(head_len);
            Ok(Some((out, body_len)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(OverlayError::Http(format!("bad response: {e}"))),
    }
}

/// Splits a comma-separated header value into trimmed tokens.
pub fn split_commas(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_request(text: &str) -> Result<Request> {
        let mut buf = BytesMut::from(text.as_bytes());
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        match parsed.parse(&buf).unwrap() {
            httparse::Status::Complete(head_len) => {
                let mut out = Request {
                    method: parsed.method.unwrap().to_string(),
                    target: parsed.path.unwrap().to_string(),
                    version: parsed.version.unwrap(),
                    headers: Headers::new(),
                };
                for h in parsed.headers.iter() {
                    out.headers
                        .insert(h.name.to_string(), String::from_utf8_lossy(h.value).to_string());
                }
                let _ = buf.split_to(head_len);
                Ok(out)
            }
            httparse::Status::Partial => panic!("partial"),
        }
    }

    #[test]
    fn request_encode_parse_round_trip() {
        let mut request = Request::get("/");
        request.headers.insert("Upgrade", "RILL/1.2");
        request.headers.insert("Connection", "Upgrade");
        request.headers.insert("Connect-As", "Peer");

        let bytes = request.encode();
        let parsed = parse_request(std::str::from_utf8(&bytes).unwrap()).unwrap();
        assert_eq!(parsed.method, "GET");
        assert_eq!(parsed.target, "/");
        assert!(parsed.is_upgrade());
        assert_eq!(parsed.headers.get("connect-as"), Some("Peer"));
    }

    #[test]
    fn upgrade_detection_requires_both_headers() {
        let mut request = Request::get("/");
        assert!(!request.is_upgrade());
        request.headers.insert("Upgrade", "RILL/1.2");
        assert!(!request.is_upgrade());
        request.headers.insert("Connection", "keep-alive, Upgrade");
        assert!(request.is_upgrade());
    }

    #[test]
    fn validate_rejects_non_get() {
        let mut request = Request::get("/");
        request.method = "POST".to_string();
        assert!(request.validate().is_err());
    }

    #[test]
    fn validate_rejects_transfer_encoding() {
        let mut request = Request::get("/");
        request.headers.insert("Transfer-Encoding", "chunked");
        assert!(request.validate().is_err());
    }

    #[test]
    fn response_encode_includes_body_and_length() {
        let response = Response::new(503, "Service Unavailable")
            .with_header("Remote-Address", "198.51.100.1")
            .with_json(&serde_json::json!({"peer-ips": ["198.51.100.2:51235"]}));
        let text = String::from_utf8(response.encode()).unwrap();
        assert!(text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
        assert!(text.contains("Remote-Address: 198.51.100.1\r\n"));
        assert!(text.contains("Content-Length:"));
        assert!(text.ends_with("{\"peer-ips\":[\"198.51.100.2:51235\"]}"));
    }

    #[tokio::test]
    async fn read_response_with_body() {
        let payload =
            b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 2\r\n\r\n{}extra".to_vec();
        let mut stream = std::io::Cursor::new(payload);
        let mut buf = BytesMut::new();
        let response = read_response(&mut stream, &mut buf).await.unwrap();
        assert_eq!(response.status, 503);
        assert_eq!(response.body, b"{}");
        // Bytes past the response stay buffered for the peer session.
        assert_eq!(&buf[..], b"extra");
    }

    #[tokio::test]
    async fn read_request_leaves_leftover() {
        let payload = b"GET / HTTP/1.1\r\nUpgrade: RILL/1.2\r\nConnection: Upgrade\r\n\r\nLEFT".to_vec();
        let mut stream = std::io::Cursor::new(payload);
        let mut buf = BytesMut::new();
        let request = read_request(&mut stream, &mut buf).await.unwrap();
        assert!(request.is_upgrade());
        assert_eq!(&buf[..], b"LEFT");
    }

    #[tokio::test]
    async fn oversize_head_rejected() {
        let mut payload = b"GET / HTTP/1.1\r\n".to_vec();
        payload.extend(std::iter::repeat(b'a').take(MAX_HEAD_BYTES + 1024));
        let mut stream = std::io::Cursor::new(payload);
        let mut buf = BytesMut::new();
        let err = read_request(&mut stream, &mut buf).await.unwrap_err();
        assert!(matches!(err, OverlayError::Http(_)));
    }
}
