//! Binary Packet Codec
//!
//! This module implements the incremental decoder and the encoder for the
//! binary packet format described in [`crate::protocol::types`].
//!
//! ## How the Codec Works
//!
//! The decoder reads from a buffer and returns either:
//! - `Ok(Some((packet, consumed)))` - A full packet was decoded, `consumed` bytes were used
//! - `Ok(None)` - Need more data, the packet is incomplete
//! - `Err(ParseError)` - The header is malformed; the connection must be closed
//!
//! Unlike a text protocol there is no way to resynchronise on a corrupt
//! binary stream, so every decode error is fatal to the connection.
//!
//! ## Negotiated Features
//!
//! Two HELLO features change the framing:
//! - `AltRequests` allows the alternative magic and framing extras
//! - `Collections` prefixes request document keys with a LEB128 collection id
//!
//! A request whose collection prefix cannot be read still decodes; it is
//! flagged with [`Packet::invalid_collection_prefix`] and rejected by the
//! command layer like any other bad argument.
//!
//! Enabling a feature only affects packets decoded or encoded afterwards.

use crate::protocol::frames::{
    decode_frames, decode_leb128, encode_frames, encode_leb128, FrameError,
};
use crate::protocol::status::Status;
use crate::protocol::types::{FeatureSet, Magic, Opcode, Packet, HEADER_LEN};
use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Maximum size of a packet body (20 MiB document plus room for key and extras)
pub const MAX_BODY_SIZE: usize = 20 * 1024 * 1024 + 1024;

/// Errors that can occur while decoding a packet.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// Unknown magic byte
    #[error("invalid magic: {0:#04x}")]
    InvalidMagic(u8),

    /// Alternative framing used before it was negotiated
    #[error("alternative framing magic {0:#04x} used before it was negotiated")]
    AltFramingNotNegotiated(u8),

    /// The declared body is larger than we accept
    #[error("packet body too large: {size} bytes (max: {max})")]
    BodyTooLarge { size: usize, max: usize },

    /// Field lengths do not fit into the declared body
    #[error("field lengths exceed body: framing={framing} extras={extras} key={key} body={body}")]
    LengthMismatch {
        framing: usize,
        extras: usize,
        key: usize,
        body: usize,
    },

    /// The framing extras block is malformed
    #[error("invalid framing extras: {0}")]
    InvalidFrames(#[from] FrameError),
}

/// Errors that can occur while encoding a packet.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum EncodeError {
    #[error("key too long: {len} bytes (max: {max})")]
    KeyTooLong { len: usize, max: usize },

    #[error("extras too long: {0} bytes")]
    ExtrasTooLong(usize),

    #[error("framing extras too long: {0} bytes")]
    FramesTooLong(usize),

    #[error("body too large: {0} bytes")]
    BodyTooLarge(usize),

    #[error("framing extras present but alternative framing not negotiated")]
    AltFramingNotNegotiated,

    #[error("collection id present but collections not negotiated")]
    CollectionsNotNegotiated,

    #[error("invalid framing extras: {0}")]
    InvalidFrames(#[from] FrameError),
}

/// Result type for decoding operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Decodes and encodes packets for one connection.
///
/// # Example
///
/// ```
/// use kvbridge::protocol::{Opcode, Packet, PacketCodec};
///
/// let codec = PacketCodec::new();
/// let request = Packet::request(Opcode::Get).with_key("user:101").with_opaque(7);
/// let bytes = codec.encode(&request).unwrap();
///
/// let (decoded, consumed) = codec.decode(&bytes).unwrap().unwrap();
/// assert_eq!(consumed, bytes.len());
/// assert_eq!(decoded.opaque, 7);
/// ```
#[derive(Debug, Default, Clone)]
pub struct PacketCodec {
    features: FeatureSet,
}

impl PacketCodec {
    /// Creates a codec with no features enabled.
    pub fn new() -> Self {
        Self {
            features: FeatureSet::empty(),
        }
    }

    /// Returns the features that currently alter framing.
    pub fn features(&self) -> FeatureSet {
        self.features
    }

    /// Enables a feature for subsequent packets.
    pub fn enable_feature(&mut self, feature: FeatureSet) {
        self.features.insert(feature);
    }

    /// Disables every feature, as a fresh HELLO does before renegotiating.
    pub fn reset_features(&mut self) {
        self.features = FeatureSet::empty();
    }

    /// Attempts to decode one packet from the buffer.
    ///
    /// # Returns
    ///
    /// - `Ok(Some((packet, consumed)))` - Successfully decoded a packet
    /// - `Ok(None)` - Incomplete data, need more bytes
    /// - `Err(e)` - Malformed header
    pub fn decode(&self, buf: &[u8]) -> ParseResult<Option<(Packet, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // Validate the magic as soon as we see it so garbage is rejected early
        let magic = Magic::from_byte(buf[0]).ok_or(ParseError::InvalidMagic(buf[0]))?;
        if magic.is_alt() && !self.features.contains(FeatureSet::ALT_REQUESTS) {
            return Err(ParseError::AltFramingNotNegotiated(buf[0]));
        }

        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let header = &buf[..HEADER_LEN];
        let (framing_len, key_len) = if magic.is_alt() {
            (usize::from(header[2]), usize::from(header[3]))
        } else {
            (0, usize::from(u16::from_be_bytes([header[2], header[3]])))
        };
        let extras_len = usize::from(header[4]);
        let datatype = header[5];
        let vbucket_or_status = u16::from_be_bytes([header[6], header[7]]);
        let body_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let opaque = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
        let cas = u64::from_be_bytes([
            header[16], header[17], header[18], header[19], header[20], header[21], header[22],
            header[23],
        ]);

        if body_len > MAX_BODY_SIZE {
            return Err(ParseError::BodyTooLarge {
                size: body_len,
                max: MAX_BODY_SIZE,
            });
        }

        if framing_len + extras_len + key_len > body_len {
            return Err(ParseError::LengthMismatch {
                framing: framing_len,
                extras: extras_len,
                key: key_len,
                body: body_len,
            });
        }

        let total = HEADER_LEN + body_len;
        if buf.len() < total {
            return Ok(None);
        }

        let body = &buf[HEADER_LEN..total];
        let (framing, rest) = body.split_at(framing_len);
        let (extras, rest) = rest.split_at(extras_len);
        let (key, value) = rest.split_at(key_len);

        let frames = if framing.is_empty() {
            Vec::new()
        } else {
            decode_frames(framing)?
        };

        let opcode = Opcode::from_byte(header[1]);
        let (collection_id, invalid_collection_prefix, key) =
            if self.collections_apply(magic, opcode) {
                match decode_leb128(key) {
                    Some((cid, used)) => (Some(cid), false, &key[used..]),
                    None => (None, true, key),
                }
            } else {
                (None, false, key)
            };

        let (vbucket, status) = if magic.is_request() {
            (vbucket_or_status, Status::SUCCESS)
        } else {
            (0, Status(vbucket_or_status))
        };

        let packet = Packet {
            magic,
            opcode,
            datatype,
            vbucket,
            status,
            opaque,
            cas,
            collection_id,
            invalid_collection_prefix,
            frames,
            extras: Bytes::copy_from_slice(extras),
            key: Bytes::copy_from_slice(key),
            value: Bytes::copy_from_slice(value),
        };

        Ok(Some((packet, total)))
    }

    /// Serializes a packet to bytes for sending over the wire.
    pub fn encode(&self, packet: &Packet) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::with_capacity(
            HEADER_LEN + packet.extras.len() + packet.key.len() + packet.value.len() + 8,
        );
        self.encode_into(packet, &mut buf)?;
        Ok(buf.freeze())
    }

    /// Serializes a packet into an existing buffer.
    ///
    /// The magic is adjusted to the alternative form when the packet has
    /// frames and to the classic form when it has none.
    pub fn encode_into(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut framing = BytesMut::new();
        if !packet.frames.is_empty() {
            if !self.features.contains(FeatureSet::ALT_REQUESTS) {
                return Err(EncodeError::AltFramingNotNegotiated);
            }
            encode_frames(&packet.frames, &mut framing)?;
        }
        let alt = !framing.is_empty();

        let mut key = BytesMut::with_capacity(packet.key.len() + 5);
        if let Some(cid) = packet.collection_id {
            if !self.collections_apply(packet.magic, packet.opcode) {
                return Err(EncodeError::CollectionsNotNegotiated);
            }
            encode_leb128(cid, &mut key);
        }
        key.extend_from_slice(&packet.key);

        let max_key = if alt { usize::from(u8::MAX) } else { usize::from(u16::MAX) };
        if key.len() > max_key {
            return Err(EncodeError::KeyTooLong {
                len: key.len(),
                max: max_key,
            });
        }
        if packet.extras.len() > usize::from(u8::MAX) {
            return Err(EncodeError::ExtrasTooLong(packet.extras.len()));
        }
        if framing.len() > usize::from(u8::MAX) {
            return Err(EncodeError::FramesTooLong(framing.len()));
        }

        let body_len = framing.len() + packet.extras.len() + key.len() + packet.value.len();
        let body_len32 = u32::try_from(body_len).map_err(|_| EncodeError::BodyTooLarge(body_len))?;

        let magic = if alt {
            packet.magic.to_alt()
        } else {
            packet.magic.to_classic()
        };
        let vbucket_or_status = if magic.is_request() {
            packet.vbucket
        } else {
            packet.status.code()
        };

        buf.reserve(HEADER_LEN + body_len);
        buf.extend_from_slice(&[magic.as_byte(), packet.opcode.as_byte()]);
        if alt {
            buf.extend_from_slice(&[framing.len() as u8, key.len() as u8]);
        } else {
            buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
        }
        buf.extend_from_slice(&[packet.extras.len() as u8, packet.datatype]);
        buf.extend_from_slice(&vbucket_or_status.to_be_bytes());
        buf.extend_from_slice(&body_len32.to_be_bytes());
        buf.extend_from_slice(&packet.opaque.to_be_bytes());
        buf.extend_from_slice(&packet.cas.to_be_bytes());
        buf.extend_from_slice(&framing);
        buf.extend_from_slice(&packet.extras);
        buf.extend_from_slice(&key);
        buf.extend_from_slice(&packet.value);

        Ok(())
    }

    /// Only request keys carry a collection prefix.
    fn collections_apply(&self, magic: Magic, opcode: Opcode) -> bool {
        self.features.contains(FeatureSet::COLLECTIONS)
            && magic.is_request()
            && opcode.is_document_keyed()
    }
}
