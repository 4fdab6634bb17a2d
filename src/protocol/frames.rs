//! Framing extras and collection-id prefixes.
//!
//! Packets sent with the alternative magic carry a block of "frame info"
//! entries ahead of the regular extras. Each entry starts with one byte whose
//! high nibble is the frame id and low nibble the payload length. A nibble
//! value of 15 is an escape: one more byte follows and is added to 15.
//!
//! Once collections are negotiated, document keys are prefixed with the
//! collection id encoded as unsigned LEB128.

use bytes::{Bytes, BytesMut};
use std::time::Duration;
use thiserror::Error;

/// Request frame ids.
pub mod frame_id {
    pub const BARRIER: u16 = 0x00;
    pub const DURABILITY: u16 = 0x01;
    pub const DCP_STREAM_ID: u16 = 0x02;
    pub const OPEN_TRACING: u16 = 0x03;
    pub const IMPERSONATE: u16 = 0x04;
    pub const PRESERVE_TTL: u16 = 0x05;
}

const ESCAPE: u16 = 0x0f;

/// A single framing extras entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameInfo {
    pub id: u16,
    pub data: Bytes,
}

impl FrameInfo {
    pub fn new(id: u16, data: impl Into<Bytes>) -> Self {
        Self {
            id,
            data: data.into(),
        }
    }

    /// Builds a durability requirement frame.
    pub fn durability(level: DurabilityLevel, timeout: Option<u16>) -> Self {
        let mut data = vec![level.as_byte()];
        if let Some(ms) = timeout {
            data.extend_from_slice(&ms.to_be_bytes());
        }
        Self::new(frame_id::DURABILITY, data)
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("frame header truncated")]
    TruncatedHeader,

    #[error("frame {id} declares {len} bytes but only {available} remain")]
    TruncatedPayload { id: u16, len: usize, available: usize },

    #[error("frame id {0} out of range")]
    IdOutOfRange(u16),

    #[error("frame length {0} out of range")]
    LengthOutOfRange(usize),
}

/// Parses a framing extras block into its entries.
pub fn decode_frames(mut buf: &[u8]) -> Result<Vec<FrameInfo>, FrameError> {
    let mut frames = Vec::new();

    while !buf.is_empty() {
        let header = buf[0];
        buf = &buf[1..];

        let mut id = u16::from(header >> 4);
        if id == ESCAPE {
            let (&ext, rest) = buf.split_first().ok_or(FrameError::TruncatedHeader)?;
            id += u16::from(ext);
            buf = rest;
        }

        let mut len = usize::from(header & 0x0f);
        if len == usize::from(ESCAPE) {
            let (&ext, rest) = buf.split_first().ok_or(FrameError::TruncatedHeader)?;
            len += usize::from(ext);
            buf = rest;
        }

        if buf.len() < len {
            return Err(FrameError::TruncatedPayload {
                id,
                len,
                available: buf.len(),
            });
        }

        frames.push(FrameInfo::new(id, Bytes::copy_from_slice(&buf[..len])));
        buf = &buf[len..];
    }

    Ok(frames)
}

/// Serializes frame entries into a framing extras block.
pub fn encode_frames(frames: &[FrameInfo], out: &mut BytesMut) -> Result<(), FrameError> {
    for frame in frames {
        let max = ESCAPE + u16::from(u8::MAX);
        if frame.id > max {
            return Err(FrameError::IdOutOfRange(frame.id));
        }
        if frame.data.len() > usize::from(max) {
            return Err(FrameError::LengthOutOfRange(frame.data.len()));
        }

        let len = frame.data.len() as u16;
        let id_nibble = frame.id.min(ESCAPE) as u8;
        let len_nibble = len.min(ESCAPE) as u8;
        out.extend_from_slice(&[(id_nibble << 4) | len_nibble]);
        if frame.id >= ESCAPE {
            out.extend_from_slice(&[(frame.id - ESCAPE) as u8]);
        }
        if len >= ESCAPE {
            out.extend_from_slice(&[(len - ESCAPE) as u8]);
        }
        out.extend_from_slice(&frame.data);
    }
    Ok(())
}

/// Synchronous replication levels carried by the durability frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DurabilityLevel {
    Majority,
    MajorityAndPersistToActive,
    PersistToMajority,
}

impl DurabilityLevel {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(DurabilityLevel::Majority),
            0x02 => Some(DurabilityLevel::MajorityAndPersistToActive),
            0x03 => Some(DurabilityLevel::PersistToMajority),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            DurabilityLevel::Majority => 0x01,
            DurabilityLevel::MajorityAndPersistToActive => 0x02,
            DurabilityLevel::PersistToMajority => 0x03,
        }
    }
}

/// A decoded durability requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurabilityRequirement {
    pub level: DurabilityLevel,
    pub timeout: Option<Duration>,
}

impl DurabilityRequirement {
    /// Decodes the payload of a durability frame.
    ///
    /// Returns `None` for an unknown level or a malformed payload.
    pub fn from_frame_data(data: &[u8]) -> Option<Self> {
        let level = DurabilityLevel::from_byte(*data.first()?)?;
        let timeout = match data.len() {
            1 => None,
            3 => {
                let ms = u16::from_be_bytes([data[1], data[2]]);
                Some(Duration::from_millis(u64::from(ms)))
            }
            _ => return None,
        };
        Some(Self { level, timeout })
    }
}

/// Decodes an unsigned LEB128 `u32` from the front of `buf`.
///
/// Returns the value and the number of bytes it occupied.
pub fn decode_leb128(buf: &[u8]) -> Option<(u32, usize)> {
    let mut value: u32 = 0;
    for (i, &byte) in buf.iter().enumerate().take(5) {
        let bits = u32::from(byte & 0x7f);
        if i == 4 && bits > 0x0f {
            return None;
        }
        value |= bits << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

/// Appends `value` as unsigned LEB128.
pub fn encode_leb128(mut value: u32, out: &mut BytesMut) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.extend_from_slice(&[byte]);
            return;
        }
        out.extend_from_slice(&[byte | 0x80]);
    }
}
