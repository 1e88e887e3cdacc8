//! Payload frame codec
//!
//! Frame layout:
//!
//! ```text
//! [flags: u8][metadata_len: u24 BE, only if M][metadata][data]
//!
//! flags bit 7 (M): metadata present
//! flags bit 6 (D): data present
//! flags bits 0-5 : reserved, always zero
//! ```
//!
//! The data length is whatever remains of the frame after the header and the
//! metadata, so the enclosing transport must deliver exact frame boundaries.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, RsmError};
use crate::payload::Payload;

pub const FLAG_METADATA: u8 = 0b1000_0000;
pub const FLAG_DATA: u8 = 0b0100_0000;
const RESERVED_MASK: u8 = 0b0011_1111;

pub const FLAGS_LEN: usize = 1;
pub const METADATA_LEN_BYTES: usize = 3;
/// Largest metadata section a u24 length can describe
pub const MAX_METADATA_LEN: usize = 0x00FF_FFFF;

/// Exact encoded size of a payload
pub fn encoded_len(payload: &Payload) -> usize {
    let mut len = FLAGS_LEN + payload.data_len();
    if payload.has_metadata() {
        len += METADATA_LEN_BYTES + payload.metadata_len();
    }
    len
}

/// Append the frame for `payload` to `buf`
pub fn encode_into(payload: &Payload, buf: &mut BytesMut) -> Result<()> {
    if payload.metadata_len() > MAX_METADATA_LEN {
        return Err(RsmError::ResourceExhausted(format!(
            "metadata of {} bytes exceeds the u24 limit",
            payload.metadata_len()
        )));
    }

    let mut flags = 0u8;
    if payload.has_metadata() {
        flags |= FLAG_METADATA;
    }
    if payload.has_data() {
        flags |= FLAG_DATA;
    }

    buf.reserve(encoded_len(payload));
    buf.put_u8(flags);
    if let Some(metadata) = payload.metadata() {
        let len = metadata.len() as u32;
        buf.put_slice(&len.to_be_bytes()[1..]);
        buf.put_slice(metadata);
    }
    if let Some(data) = payload.data() {
        buf.put_slice(data);
    }
    Ok(())
}

pub fn encode(payload: &Payload) -> Result<Bytes> {
    let mut buf = BytesMut::with_capacity(encoded_len(payload));
    encode_into(payload, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode one complete frame; the returned payload shares `frame`'s buffer
pub fn decode(frame: Bytes) -> Result<Payload> {
    let Some(&flags) = frame.first() else {
        return Err(RsmError::malformed("empty frame"));
    };
    if flags & RESERVED_MASK != 0 {
        return Err(RsmError::malformed(format!(
            "reserved flag bits set: {:#04x}",
            flags
        )));
    }

    let mut offset = FLAGS_LEN;
    let metadata = if flags & FLAG_METADATA != 0 {
        if frame.len() < offset + METADATA_LEN_BYTES {
            return Err(RsmError::malformed("truncated metadata length"));
        }
        let len = u32::from_be_bytes([0, frame[offset], frame[offset + 1], frame[offset + 2]]) as usize;
        offset += METADATA_LEN_BYTES;
        let remaining = frame.len() - offset;
        if len > remaining {
            return Err(RsmError::malformed(format!(
                "metadata length {} exceeds remaining {} bytes",
                len, remaining
            )));
        }
        let metadata = frame.slice(offset..offset + len);
        offset += len;
        Some(metadata)
    } else {
        None
    };

    let data = if flags & FLAG_DATA != 0 {
        Some(frame.slice(offset..))
    } else {
        if offset != frame.len() {
            return Err(RsmError::malformed(format!(
                "{} trailing bytes without data flag",
                frame.len() - offset
            )));
        }
        None
    };

    Ok(Payload::new(data, metadata))
}

/// Stateless codec carrying the vectorized-batch hint from the transport tuning
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec {
    vectorized: bool,
}

impl FrameCodec {
    pub fn new(vectorized: bool) -> Self {
        Self { vectorized }
    }

    pub fn is_vectorized(&self) -> bool {
        self.vectorized
    }

    pub fn encode(&self, payload: &Payload) -> Result<Bytes> {
        encode(payload)
    }

    pub fn decode(&self, frame: Bytes) -> Result<Payload> {
        decode(frame)
    }

    /// Encode several payloads at once.
    ///
    /// The vectorized path sizes one buffer for the whole batch and splits the
    /// frames off it without copying; output is identical to encoding each
    /// payload on its own.
    pub fn encode_batch(&self, payloads: &[Payload]) -> Result<Vec<Bytes>> {
        if !self.vectorized {
            return payloads.iter().map(encode).collect();
        }

        let total: usize = payloads.iter().map(encoded_len).sum();
        let mut buf = BytesMut::with_capacity(total);
        let mut frames = Vec::with_capacity(payloads.len());
        for payload in payloads {
            encode_into(payload, &mut buf)?;
            frames.push(buf.split().freeze());
        }
        Ok(frames)
    }

    pub fn decode_batch(&self, frames: Vec<Bytes>) -> Result<Vec<Payload>> {
        frames.into_iter().map(decode).collect()
    }
}
