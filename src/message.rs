//! Message codec.
//!
//! Every message is framed as an ordered sequence of opaque byte frames:
//!
//! ```text
//! [signature, signer-public-key, type-tag, reply-identity-or-empty, ...payload]
//! ```
//!
//! The signature covers the concatenation of every frame after itself and
//! is produced with the local `ed25519_dalek::SigningKey`. When a message
//! is read off the inbound ROUTER socket, ZeroMQ has already prepended one
//! extra frame — the sending DEALER's connection identity — ahead of the
//! signed frames; `parse(frames, reply = false)` strips that frame first
//! and keeps it as the message's `reply_identity`, so a handler can answer
//! by re-prepending it as the ROUTER envelope frame on the way out. When
//! `reply = true` (decoding a message we are about to relay as a reply, or
//! round-tripping one in a test) no such leading frame exists and the
//! `reply-identity-or-empty` field inside the signed frames is used as-is.

use crate::chain::{BlockHash, TxId};
use crate::error::CodecError;
use crate::peer::{Address, Peer};
use byteorder::{BigEndian, ByteOrder};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

/// Header-minimum frame count: signature, public key, tag, reply-identity.
pub const HEADER_MIN_FRAMES: usize = 4;

/// Raw ZeroMQ multipart frames, in wire order.
pub type Frames = Vec<Vec<u8>>;

/// A snapshot of one peer-set delta.
#[derive(Clone, Debug)]
pub struct PeerSetDelta {
    pub sender: Peer,
    pub timestamp_ms: u64,
    pub added: Vec<Peer>,
    pub removed: Vec<Peer>,
    /// Present only on full (re-sync) broadcasts.
    pub existing: Option<Vec<Peer>>,
}

/// The tagged variant over every message kind on the wire.
#[derive(Clone, Debug)]
pub enum MessageKind {
    Ping,
    Pong { app_protocol_version: i32 },
    GetBlockHashes { locator: Vec<BlockHash>, stop: Option<BlockHash> },
    BlockHashes { sender: Address, hashes: Vec<BlockHash> },
    GetBlocks { hashes: Vec<BlockHash> },
    Block { payload: Vec<u8> },
    GetTxs { ids: Vec<TxId> },
    Tx { payload: Vec<u8> },
    TxIds { sender: Address, ids: Vec<TxId> },
    PeerSetDelta(PeerSetDelta),
}

impl MessageKind {
    fn tag(&self) -> u8 {
        match self {
            MessageKind::Ping => 0x01,
            MessageKind::Pong { .. } => 0x02,
            MessageKind::GetBlockHashes { .. } => 0x03,
            MessageKind::BlockHashes { .. } => 0x04,
            MessageKind::GetBlocks { .. } => 0x05,
            MessageKind::Block { .. } => 0x06,
            MessageKind::GetTxs { .. } => 0x07,
            MessageKind::Tx { .. } => 0x08,
            MessageKind::TxIds { .. } => 0x09,
            MessageKind::PeerSetDelta(_) => 0x0A,
        }
    }

    /// Payload frames for this variant, in wire order.
    fn payload_frames(&self) -> Vec<Vec<u8>> {
        match self {
            MessageKind::Ping => vec![],
            MessageKind::Pong { app_protocol_version } => {
                let mut buf = [0u8; 4];
                BigEndian::write_i32(&mut buf, *app_protocol_version);
                vec![buf.to_vec()]
            }
            MessageKind::GetBlockHashes { locator, stop } => {
                vec![encode_hash_list(locator), encode_optional_hash(*stop)]
            }
            MessageKind::BlockHashes { sender, hashes } => {
                vec![sender.0.to_vec(), encode_hash_list(hashes)]
            }
            MessageKind::GetBlocks { hashes } => vec![encode_hash_list(hashes)],
            MessageKind::Block { payload } => vec![payload.clone()],
            MessageKind::GetTxs { ids } => vec![encode_id_list(ids)],
            MessageKind::Tx { payload } => vec![payload.clone()],
            MessageKind::TxIds { sender, ids } => {
                vec![sender.0.to_vec(), encode_id_list(ids)]
            }
            MessageKind::PeerSetDelta(delta) => vec![encode_delta(delta)],
        }
    }

    fn from_tag_and_payload(tag: u8, payload: &[Vec<u8>]) -> Result<Self, CodecError> {
        match tag {
            0x01 => Ok(MessageKind::Ping),
            0x02 => {
                let frame = expect_frame(payload, 0, "Pong.appProtocolVersion")?;
                if frame.len() != 4 {
                    return Err(CodecError::BadPayload("Pong.appProtocolVersion must be 4 bytes".into()));
                }
                Ok(MessageKind::Pong { app_protocol_version: BigEndian::read_i32(frame) })
            }
            0x03 => {
                let locator = decode_hash_list(expect_frame(payload, 0, "GetBlockHashes.locator")?)?;
                let stop = decode_optional_hash(expect_frame(payload, 1, "GetBlockHashes.stop")?)?;
                Ok(MessageKind::GetBlockHashes { locator, stop })
            }
            0x04 => {
                let sender = decode_address(expect_frame(payload, 0, "BlockHashes.sender")?)?;
                let hashes = decode_hash_list(expect_frame(payload, 1, "BlockHashes.hashes")?)?;
                Ok(MessageKind::BlockHashes { sender, hashes })
            }
            0x05 => {
                let hashes = decode_hash_list(expect_frame(payload, 0, "GetBlocks.hashes")?)?;
                Ok(MessageKind::GetBlocks { hashes })
            }
            0x06 => {
                let bytes = expect_frame(payload, 0, "Block.payload")?.clone();
                Ok(MessageKind::Block { payload: bytes })
            }
            0x07 => {
                let ids = decode_id_list(expect_frame(payload, 0, "GetTxs.ids")?)?;
                Ok(MessageKind::GetTxs { ids })
            }
            0x08 => {
                let bytes = expect_frame(payload, 0, "Tx.payload")?.clone();
                Ok(MessageKind::Tx { payload: bytes })
            }
            0x09 => {
                let sender = decode_address(expect_frame(payload, 0, "TxIds.sender")?)?;
                let ids = decode_id_list(expect_frame(payload, 1, "TxIds.ids")?)?;
                Ok(MessageKind::TxIds { sender, ids })
            }
            0x0A => {
                let delta = decode_delta(expect_frame(payload, 0, "PeerSetDelta")?)?;
                Ok(MessageKind::PeerSetDelta(delta))
            }
            other => Err(CodecError::UnknownTag(other)),
        }
    }
}

/// A parsed (or about-to-be-sent) message plus its header fields.
#[derive(Clone, Debug)]
pub struct Message {
    pub signer: VerifyingKey,
    /// Opaque correlation id: the ROUTER-stripped connection identity for
    /// inbound requests, or an explicit value for outbound replies. Empty
    /// means "no reply expected/possible".
    pub reply_identity: Vec<u8>,
    pub kind: MessageKind,
}

impl Message {
    /// Build the signed wire frames for an outbound message.
    pub fn encode(signing_key: &SigningKey, reply_identity: &[u8], kind: &MessageKind) -> Vec<Vec<u8>> {
        let pubkey = signing_key.verifying_key().to_bytes().to_vec();
        let tag = vec![kind.tag()];
        let reply_frame = reply_identity.to_vec();

        let mut signed_frames = vec![pubkey, tag, reply_frame];
        signed_frames.extend(kind.payload_frames());

        let to_sign: Vec<u8> = signed_frames.iter().flat_map(|f| f.iter().copied()).collect();
        let signature: Signature = signing_key.sign(&to_sign);

        let mut frames = Vec::with_capacity(signed_frames.len() + 1);
        frames.push(signature.to_bytes().to_vec());
        frames.extend(signed_frames);
        frames
    }

    /// Parse frames received either off a ROUTER socket (`reply = false`,
    /// a connection-identity frame is stripped first) or already isolated
    /// signed frames (`reply = true`).
    pub fn parse(mut frames: Vec<Vec<u8>>, reply: bool) -> Result<Message, CodecError> {
        let stripped_identity = if !reply {
            if frames.is_empty() {
                return Err(CodecError::TooFewFrames { got: 0, min: HEADER_MIN_FRAMES + 1 });
            }
            Some(frames.remove(0))
        } else {
            None
        };

        if frames.len() < HEADER_MIN_FRAMES {
            return Err(CodecError::TooFewFrames { got: frames.len(), min: HEADER_MIN_FRAMES });
        }

        let signature_bytes = &frames[0];
        let pubkey_bytes = &frames[1];
        let tag = frames[2].first().copied().ok_or(CodecError::BadPayload("empty tag frame".into()))?;
        let reply_identity_frame = frames[3].clone();
        let payload = &frames[4..];

        let signer = VerifyingKey::from_bytes(
            pubkey_bytes.as_slice().try_into().map_err(|_| CodecError::BadPublicKey)?,
        )
        .map_err(|_| CodecError::BadPublicKey)?;

        let signature = Signature::from_slice(signature_bytes).map_err(|_| CodecError::BadSignature)?;
        let to_verify: Vec<u8> = frames[1..].iter().flat_map(|f| f.iter().copied()).collect();
        signer.verify(&to_verify, &signature).map_err(|_| CodecError::BadSignature)?;

        let kind = MessageKind::from_tag_and_payload(tag, payload)?;
        let reply_identity = stripped_identity.unwrap_or(reply_identity_frame);

        Ok(Message { signer, reply_identity, kind })
    }
}

fn expect_frame<'a>(payload: &'a [Vec<u8>], idx: usize, what: &str) -> Result<&'a Vec<u8>, CodecError> {
    payload.get(idx).ok_or_else(|| CodecError::BadPayload(format!("missing frame for {what}")))
}

fn encode_32byte_list<'a>(items: impl ExactSizeIterator<Item = &'a [u8; 32]>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + items.len() * 32);
    let mut count_buf = [0u8; 4];
    BigEndian::write_u32(&mut count_buf, items.len() as u32);
    buf.extend_from_slice(&count_buf);
    for item in items {
        buf.extend_from_slice(item);
    }
    buf
}

fn decode_32byte_list(buf: &[u8]) -> Result<Vec<[u8; 32]>, CodecError> {
    if buf.len() < 4 {
        return Err(CodecError::BadPayload("list missing count prefix".into()));
    }
    let count = BigEndian::read_u32(&buf[..4]) as usize;
    let body = &buf[4..];
    if body.len() != count * 32 {
        return Err(CodecError::BadPayload("list length mismatch".into()));
    }
    Ok(body.chunks_exact(32).map(|c| c.try_into().unwrap()).collect())
}

fn encode_hash_list(hashes: &[BlockHash]) -> Vec<u8> {
    encode_32byte_list(hashes.iter().map(|h| &h.0))
}

fn decode_hash_list(buf: &[u8]) -> Result<Vec<BlockHash>, CodecError> {
    Ok(decode_32byte_list(buf)?.into_iter().map(BlockHash).collect())
}

fn encode_id_list(ids: &[TxId]) -> Vec<u8> {
    encode_32byte_list(ids.iter().map(|id| &id.0))
}

fn decode_id_list(buf: &[u8]) -> Result<Vec<TxId>, CodecError> {
    Ok(decode_32byte_list(buf)?.into_iter().map(TxId).collect())
}

fn encode_optional_hash(hash: Option<BlockHash>) -> Vec<u8> {
    match hash {
        Some(h) => h.0.to_vec(),
        None => Vec::new(),
    }
}

fn decode_optional_hash(buf: &[u8]) -> Result<Option<BlockHash>, CodecError> {
    if buf.is_empty() {
        return Ok(None);
    }
    if buf.len() != 32 {
        return Err(CodecError::BadPayload("stop hash must be 32 bytes or empty".into()));
    }
    let mut h = [0u8; 32];
    h.copy_from_slice(buf);
    Ok(Some(BlockHash(h)))
}

fn decode_address(buf: &[u8]) -> Result<Address, CodecError> {
    if buf.len() != 20 {
        return Err(CodecError::BadPayload("address must be 20 bytes".into()));
    }
    let mut a = [0u8; 20];
    a.copy_from_slice(buf);
    Ok(Address(a))
}

fn encode_peer(peer: &Peer) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32 + 1 + 16 + 2);
    buf.extend_from_slice(peer.public_key.as_bytes());
    match peer.host {
        std::net::IpAddr::V4(v4) => {
            buf.push(4);
            buf.extend_from_slice(&v4.octets());
        }
        std::net::IpAddr::V6(v6) => {
            buf.push(6);
            buf.extend_from_slice(&v6.octets());
        }
    }
    let mut port_buf = [0u8; 2];
    BigEndian::write_u16(&mut port_buf, peer.port);
    buf.extend_from_slice(&port_buf);
    buf
}

fn decode_peer(buf: &[u8]) -> Result<(Peer, usize), CodecError> {
    if buf.len() < 33 {
        return Err(CodecError::BadPayload("peer record truncated".into()));
    }
    let pubkey_bytes: [u8; 32] = buf[..32].try_into().unwrap();
    let public_key = VerifyingKey::from_bytes(&pubkey_bytes).map_err(|_| CodecError::BadPublicKey)?;
    let family = buf[32];
    let (host, addr_len): (std::net::IpAddr, usize) = match family {
        4 => {
            if buf.len() < 33 + 4 {
                return Err(CodecError::BadPayload("peer record truncated (v4)".into()));
            }
            let octets: [u8; 4] = buf[33..37].try_into().unwrap();
            (std::net::Ipv4Addr::from(octets).into(), 4)
        }
        6 => {
            if buf.len() < 33 + 16 {
                return Err(CodecError::BadPayload("peer record truncated (v6)".into()));
            }
            let octets: [u8; 16] = buf[33..49].try_into().unwrap();
            (std::net::Ipv6Addr::from(octets).into(), 16)
        }
        other => return Err(CodecError::BadPayload(format!("unknown address family {other}"))),
    };
    let port_start = 33 + addr_len;
    if buf.len() < port_start + 2 {
        return Err(CodecError::BadPayload("peer record truncated (port)".into()));
    }
    let port = BigEndian::read_u16(&buf[port_start..port_start + 2]);
    Ok((Peer::new(public_key, host, port), port_start + 2))
}

fn encode_peer_list(peers: &[Peer]) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut count_buf = [0u8; 4];
    BigEndian::write_u32(&mut count_buf, peers.len() as u32);
    buf.extend_from_slice(&count_buf);
    for p in peers {
        buf.extend_from_slice(&encode_peer(p));
    }
    buf
}

fn decode_peer_list(buf: &[u8]) -> Result<Vec<Peer>, CodecError> {
    if buf.len() < 4 {
        return Err(CodecError::BadPayload("peer list missing count prefix".into()));
    }
    let count = BigEndian::read_u32(&buf[..4]) as usize;
    let mut offset = 4;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let (peer, consumed) = decode_peer(&buf[offset..])?;
        offset += consumed;
        out.push(peer);
    }
    Ok(out)
}

fn encode_delta(delta: &PeerSetDelta) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&encode_peer(&delta.sender));
    let mut ts_buf = [0u8; 8];
    BigEndian::write_u64(&mut ts_buf, delta.timestamp_ms);
    buf.extend_from_slice(&ts_buf);
    buf.extend_from_slice(&encode_peer_list(&delta.added));
    buf.extend_from_slice(&encode_peer_list(&delta.removed));
    match &delta.existing {
        Some(existing) => {
            buf.push(1);
            buf.extend_from_slice(&encode_peer_list(existing));
        }
        None => buf.push(0),
    }
    buf
}

fn decode_delta(buf: &[u8]) -> Result<PeerSetDelta, CodecError> {
    let (sender, mut offset) = decode_peer(buf)?;
    if buf.len() < offset + 8 {
        return Err(CodecError::BadPayload("delta timestamp truncated".into()));
    }
    let timestamp_ms = BigEndian::read_u64(&buf[offset..offset + 8]);
    offset += 8;

    let (added, consumed) = decode_peer_list_with_len(&buf[offset..])?;
    offset += consumed;
    let (removed, consumed) = decode_peer_list_with_len(&buf[offset..])?;
    offset += consumed;

    let existing = match buf.get(offset) {
        Some(0) => None,
        Some(1) => {
            offset += 1;
            Some(decode_peer_list(&buf[offset..])?)
        }
        _ => return Err(CodecError::BadPayload("delta missing existing-flag".into())),
    };

    Ok(PeerSetDelta { sender, timestamp_ms, added, removed, existing })
}

fn decode_peer_list_with_len(buf: &[u8]) -> Result<(Vec<Peer>, usize), CodecError> {
    if buf.len() < 4 {
        return Err(CodecError::BadPayload("peer list missing count prefix".into()));
    }
    let count = BigEndian::read_u32(&buf[..4]) as usize;
    let mut offset = 4;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let (peer, consumed) = decode_peer(&buf[offset..])?;
        offset += consumed;
        out.push(peer);
    }
    Ok((out, offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn rand_peer() -> Peer {
        let signing = SigningKey::generate(&mut OsRng);
        Peer::new(signing.verifying_key(), "127.0.0.1".parse().unwrap(), 9001)
    }

    fn roundtrip(kind: MessageKind) -> MessageKind {
        let signing = SigningKey::generate(&mut OsRng);
        let frames = Message::encode(&signing, b"abc", &kind);
        let parsed = Message::parse(frames, true).expect("parse should succeed");
        assert_eq!(parsed.reply_identity, b"abc");
        assert_eq!(parsed.signer, signing.verifying_key());
        parsed.kind
    }

    #[test]
    fn ping_roundtrip() {
        matches!(roundtrip(MessageKind::Ping), MessageKind::Ping);
    }

    #[test]
    fn pong_roundtrip() {
        match roundtrip(MessageKind::Pong { app_protocol_version: 7 }) {
            MessageKind::Pong { app_protocol_version } => assert_eq!(app_protocol_version, 7),
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn get_block_hashes_roundtrip_with_and_without_stop() {
        let h1 = BlockHash([1u8; 32]);
        let h2 = BlockHash([2u8; 32]);
        match roundtrip(MessageKind::GetBlockHashes { locator: vec![h1, h2], stop: Some(h1) }) {
            MessageKind::GetBlockHashes { locator, stop } => {
                assert_eq!(locator, vec![h1, h2]);
                assert_eq!(stop, Some(h1));
            }
            _ => panic!("wrong kind"),
        }
        match roundtrip(MessageKind::GetBlockHashes { locator: vec![], stop: None }) {
            MessageKind::GetBlockHashes { locator, stop } => {
                assert!(locator.is_empty());
                assert_eq!(stop, None);
            }
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn peer_set_delta_roundtrip() {
        let delta = PeerSetDelta {
            sender: rand_peer(),
            timestamp_ms: 1234,
            added: vec![rand_peer(), rand_peer()],
            removed: vec![rand_peer()],
            existing: Some(vec![rand_peer()]),
        };
        match roundtrip(MessageKind::PeerSetDelta(delta.clone())) {
            MessageKind::PeerSetDelta(got) => {
                assert_eq!(got.timestamp_ms, delta.timestamp_ms);
                assert_eq!(got.added.len(), delta.added.len());
                assert_eq!(got.removed.len(), delta.removed.len());
                assert_eq!(got.existing.map(|e| e.len()), Some(1));
            }
            _ => panic!("wrong kind"),
        }
    }

    #[test]
    fn inbound_from_router_strips_connection_identity() {
        let signing = SigningKey::generate(&mut OsRng);
        let signed = Message::encode(&signing, b"", &MessageKind::Ping);
        let mut wire = vec![b"conn-17".to_vec()];
        wire.extend(signed);
        let parsed = Message::parse(wire, false).expect("parse should succeed");
        assert_eq!(parsed.reply_identity, b"conn-17");
    }

    #[test]
    fn too_few_frames_is_rejected() {
        let err = Message::parse(vec![vec![1], vec![2]], true).unwrap_err();
        assert!(matches!(err, CodecError::TooFewFrames { .. }));
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let signing = SigningKey::generate(&mut OsRng);
        let mut frames = Message::encode(&signing, b"", &MessageKind::Ping);
        frames[2] = vec![0xFF];
        // Re-sign isn't done here on purpose: an attacker-mutated tag with a
        // stale signature must fail on signature check first in real use,
        // but we want to isolate the unknown-tag path, so sign fresh.
        let to_sign: Vec<u8> = frames[1..].iter().flat_map(|f| f.iter().copied()).collect();
        let sig: Signature = signing.sign(&to_sign);
        frames[0] = sig.to_bytes().to_vec();
        let err = Message::parse(frames, true).unwrap_err();
        assert!(matches!(err, CodecError::UnknownTag(0xFF)));
    }

    #[test]
    fn tampered_signature_is_rejected() {
        let signing = SigningKey::generate(&mut OsRng);
        let mut frames = Message::encode(&signing, b"", &MessageKind::Ping);
        frames[0][0] ^= 0xFF;
        let err = Message::parse(frames, true).unwrap_err();
        assert!(matches!(err, CodecError::BadSignature));
    }
}
