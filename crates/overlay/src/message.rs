//! Protocol messages and wire framing.
//!
//! Each message travels as a 4-byte big-endian length prefix followed by a
//! bincode-encoded [`Message`]. The overlay does not interpret consensus
//! payloads; it needs only enough structure to identify messages (content
//! hash), route them (hop counts) and index per-peer state (ledger
//! sequence numbers).

use crate::resource::TrafficCategory;
use crate::{Endpoint, OverlayError, Result};
use bytes::{Buf, Bytes, BytesMut};
use rill_common::Hash256;
use rill_crypto::sha512_half_multi;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

/// Maximum encoded message size (16 MB).
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// A consensus proposal in flight.
///
/// The `payload` is opaque to the overlay. `hops` is present only when the
/// sender speaks a hop-aware protocol version; it counts relay steps taken
/// so far.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// Ledger sequence this proposal is for.
    pub ledger_seq: u64,
    /// Hash of the previous ledger.
    pub prev_ledger: Hash256,
    /// Hash of the proposed transaction set.
    pub tx_set: Hash256,
    /// Opaque consensus payload.
    pub payload: Vec<u8>,
    /// Raw public key of the proposing validator.
    pub signer: Vec<u8>,
    /// Relay hop count, if the origin speaks hop counts.
    pub hops: Option<u32>,
}

impl Proposal {
    /// Content identity, independent of the hop count.
    pub fn uid(&self) -> Hash256 {
        sha512_half_multi(&[
            b"PRP\0",
            &self.ledger_seq.to_be_bytes(),
            self.prev_ledger.as_bytes(),
            self.tx_set.as_bytes(),
            &self.payload,
            &self.signer,
        ])
    }
}

/// A validation (signed ledger close statement) in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validation {
    /// Sequence of the validated ledger.
    pub ledger_seq: u64,
    /// Hash of the validated ledger.
    pub ledger_hash: Hash256,
    /// Opaque consensus payload.
    pub payload: Vec<u8>,
    /// Raw public key of the validating node.
    pub signer: Vec<u8>,
    /// Relay hop count, if the origin speaks hop counts.
    pub hops: Option<u32>,
}

impl Validation {
    /// Content identity, independent of the hop count.
    pub fn uid(&self) -> Hash256 {
        sha512_half_multi(&[
            b"VAL\0",
            &self.ledger_seq.to_be_bytes(),
            self.ledger_hash.as_bytes(),
            &self.payload,
            &self.signer,
        ])
    }
}

/// A batch of raw signed manifests.
///
/// `history` marks the bulk set sent on initial connection; historical
/// manifests are applied but never re-relayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestSet {
    pub history: bool,
    /// Raw manifest bytes, each independently decodable.
    pub manifests: Vec<Vec<u8>>,
}

/// Known-endpoint gossip.
///
/// `hops == 0` entries describe the sender itself and carry the port it
/// listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointGossip {
    pub endpoints: Vec<(Endpoint, u32)>,
}

/// A protocol message between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Proposal(Proposal),
    Validation(Validation),
    Manifests(ManifestSet),
    Endpoints(EndpointGossip),
}

impl Message {
    /// Short name for logging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::Proposal(_) => "PROPOSAL",
            Message::Validation(_) => "VALIDATION",
            Message::Manifests(_) => "MANIFESTS",
            Message::Endpoints(_) => "ENDPOINTS",
        }
    }

    /// Traffic accounting bucket.
    pub fn category(&self) -> TrafficCategory {
        match self {
            Message::Proposal(_) => TrafficCategory::Proposal,
            Message::Validation(_) => TrafficCategory::Validation,
            Message::Manifests(_) => TrafficCategory::Manifests,
            Message::Endpoints(_) => TrafficCategory::Endpoints,
        }
    }

    /// Hop count, for the message kinds that carry one.
    pub fn hops(&self) -> Option<u32> {
        match self {
            Message::Proposal(p) => p.hops,
            Message::Validation(v) => v.hops,
            _ => None,
        }
    }

    /// Overwrites the hop count where one is present.
    pub fn set_hops(&mut self, hops: u32) {
        match self {
            Message::Proposal(p) => {
                if p.hops.is_some() {
                    p.hops = Some(hops);
                }
            }
            Message::Validation(v) => {
                if v.hops.is_some() {
                    v.hops = Some(hops);
                }
            }
            _ => {}
        }
    }

    /// Content identity for relay suppression; `None` for message kinds
    /// that are never relayed by hash.
    pub fn uid(&self) -> Option<Hash256> {
        match self {
            Message::Proposal(p) => Some(p.uid()),
            Message::Validation(v) => Some(v.uid()),
            _ => None,
        }
    }

    /// Serializes the message body (no length prefix).
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| OverlayError::Protocol(e.to_string()))
    }

    /// Deserializes a message body.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| OverlayError::Protocol(e.to_string()))
    }

    /// Produces a complete wire frame: length prefix plus body. The
    /// returned [`Bytes`] is cheap to clone, so one encoding can be shared
    /// across every peer in a fan-out.
    pub fn to_frame(&self) -> Result<Bytes> {
        let body = self.encode()?;
        if body.len() > MAX_MESSAGE_SIZE {
            return Err(OverlayError::Protocol(format!(
                "message too large: {} bytes",
                body.len()
            )));
        }
        let mut frame = BytesMut::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame.freeze())
    }
}

/// Decoder/encoder for length-prefixed message frames.
#[derive(Debug, Default)]
pub struct MessageCodec {
    state: DecodeState,
}

#[derive(Debug, Default)]
enum DecodeState {
    #[default]
    ReadingLength,
    ReadingBody(usize),
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = OverlayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        loop {
            match self.state {
                DecodeState::ReadingLength => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
                    if len == 0 || len > MAX_MESSAGE_SIZE {
                        return Err(OverlayError::Protocol(format!(
                            "bad frame length: {len}"
                        )));
                    }
                    src.advance(4);
                    src.reserve(len);
                    self.state = DecodeState::ReadingBody(len);
                }
                DecodeState::ReadingBody(len) => {
                    if src.len() < len {
                        return Ok(None);
                    }
                    let body = src.split_to(len);
                    self.state = DecodeState::ReadingLength;
                    return Ok(Some(Message::decode(&body)?));
                }
            }
        }
    }
}

impl Encoder<&Message> for MessageCodec {
    type Error = OverlayError;

    fn encode(&mut self, message: &Message, dst: &mut BytesMut) -> Result<()> {
        let frame = message.to_frame()?;
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint_v4;

    fn sample_proposal(hops: Option<u32>) -> Proposal {
        Proposal {
            ledger_seq: 7,
            prev_ledger: Hash256::from_bytes([1u8; 32]),
            tx_set: Hash256::from_bytes([2u8; 32]),
            payload: vec![1, 2, 3],
            signer: vec![9u8; 32],
            hops,
        }
    }

    #[test]
    fn frame_round_trip() {
        let msg = Message::Proposal(sample_proposal(Some(1)));
        let frame = msg.to_frame().unwrap();

        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&frame[..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let msg = Message::Endpoints(EndpointGossip {
            endpoints: vec![(endpoint_v4(198, 51, 100, 1, 51235), 1)],
        });
        let frame = msg.to_frame().unwrap();

        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&frame[..3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[3..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), msg);
    }

    #[test]
    fn uid_ignores_hops() {
        let with = sample_proposal(Some(3));
        let without = sample_proposal(Some(0));
        assert_eq!(with.uid(), without.uid());

        let mut other = sample_proposal(Some(3));
        other.payload = vec![4, 5, 6];
        assert_ne!(with.uid(), other.uid());
    }

    #[test]
    fn set_hops_only_touches_existing() {
        let mut msg = Message::Proposal(sample_proposal(None));
        msg.set_hops(0);
        assert_eq!(msg.hops(), None);

        let mut msg = Message::Proposal(sample_proposal(Some(5)));
        msg.set_hops(0);
        assert_eq!(msg.hops(), Some(0));
    }

    #[test]
    fn zero_length_frame_rejected() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::from(&0u32.to_be_bytes()[..]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
