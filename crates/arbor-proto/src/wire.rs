// SPDX-License-Identifier: Apache-2.0
//! Deterministic framing and CBOR helpers for the proximity substream.
//!
//! Packet layout:
//!
//! ``MAGIC(4) || VERSION(2) || FLAGS(2) || LENGTH(4) || PAYLOAD || CHECKSUM(32)``
//!
//! * PAYLOAD is a CBOR `OpEnvelope`
//! * CHECKSUM = blake3-256 over HEADER (first 12 bytes) || PAYLOAD
//!
//! Framing is symmetric: command frames and result frames share the layout
//! and differ only in the envelope's `op`.

use blake3::Hasher;
use serde::{Deserialize, Serialize};
use serde_cbor::Value;
use thiserror::Error;

use crate::{Message, ProximityResults, QueryRequest};

/// Protocol magic constant "PRX!".
pub const MAGIC: [u8; 4] = [0x50, 0x52, 0x58, 0x21];
/// Wire protocol version (big-endian u16).
pub const VERSION: u16 = 0x0001;
/// Reserved flags (zero for v1).
pub const FLAGS: u16 = 0x0000;
/// Header length in bytes.
pub const HEADER_LEN: usize = 12;
/// Checksum length in bytes.
pub const CHECKSUM_LEN: usize = 32;

/// Framing and codec errors.
#[derive(Debug, Error)]
pub enum WireError {
    /// Not enough bytes for a complete packet.
    #[error("incomplete packet")]
    Incomplete,
    /// The magic constant did not match.
    #[error("bad magic")]
    BadMagic,
    /// The version field is not supported.
    #[error("unsupported version {0:#06x}")]
    UnsupportedVersion(u16),
    /// The checksum over header and payload did not verify.
    #[error("checksum mismatch")]
    ChecksumMismatch,
    /// The envelope named an operation this peer does not know.
    #[error("unknown op {0:?}")]
    UnknownOp(String),
    /// CBOR encoding or decoding failed.
    #[error(transparent)]
    Cbor(#[from] serde_cbor::Error),
}

/// Generic operation envelope: op name, logical timestamp, payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpEnvelope<P> {
    /// Operation name.
    pub op: String,
    /// Logical timestamp (server simulation time for results).
    pub ts: u64,
    /// Operation payload.
    pub payload: P,
}

/// Encode to CBOR bytes.
pub fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    Ok(serde_cbor::to_vec(value)?)
}

/// Decode from CBOR bytes.
pub fn from_cbor<'de, T: Deserialize<'de>>(bytes: &'de [u8]) -> Result<T, WireError> {
    Ok(serde_cbor::from_slice(bytes)?)
}

/// A full packet (header + payload + checksum).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Raw header (12 bytes).
    pub header: [u8; HEADER_LEN],
    /// CBOR payload bytes.
    pub payload: Vec<u8>,
    /// blake3 checksum over header || payload.
    pub checksum: [u8; CHECKSUM_LEN],
}

impl Packet {
    /// Builds a packet from a CBOR payload.
    #[must_use]
    pub fn from_payload(payload: Vec<u8>) -> Self {
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&MAGIC);
        header[4..6].copy_from_slice(&VERSION.to_be_bytes());
        header[6..8].copy_from_slice(&FLAGS.to_be_bytes());
        #[allow(clippy::cast_possible_truncation)]
        header[8..12].copy_from_slice(&(payload.len() as u32).to_be_bytes());

        let mut hasher = Hasher::new();
        hasher.update(&header);
        hasher.update(&payload);
        let checksum = *hasher.finalize().as_bytes();

        Packet {
            header,
            payload,
            checksum,
        }
    }

    /// Encodes an envelope into a full packet byte vector.
    pub fn encode_envelope<P: Serialize>(env: &OpEnvelope<P>) -> Result<Vec<u8>, WireError> {
        let payload = to_cbor(env)?;
        let packet = Packet::from_payload(payload);
        let mut out =
            Vec::with_capacity(HEADER_LEN + packet.payload.len() + CHECKSUM_LEN);
        out.extend_from_slice(&packet.header);
        out.extend_from_slice(&packet.payload);
        out.extend_from_slice(&packet.checksum);
        Ok(out)
    }

    /// Decodes a packet from a byte slice, returning the envelope and the
    /// bytes consumed.
    pub fn decode_envelope<'de, P: Deserialize<'de>>(
        bytes: &'de [u8],
    ) -> Result<(OpEnvelope<P>, usize), WireError> {
        if bytes.len() < HEADER_LEN + CHECKSUM_LEN {
            return Err(WireError::Incomplete);
        }
        if bytes[0..4] != MAGIC {
            return Err(WireError::BadMagic);
        }
        let version = u16::from_be_bytes([bytes[4], bytes[5]]);
        if version != VERSION {
            return Err(WireError::UnsupportedVersion(version));
        }
        let len = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        if bytes.len() < HEADER_LEN + len + CHECKSUM_LEN {
            return Err(WireError::Incomplete);
        }
        let header = &bytes[0..HEADER_LEN];
        let payload = &bytes[HEADER_LEN..HEADER_LEN + len];
        let checksum = &bytes[HEADER_LEN + len..HEADER_LEN + len + CHECKSUM_LEN];

        let mut hasher = Hasher::new();
        hasher.update(header);
        hasher.update(payload);
        if hasher.finalize().as_bytes() != checksum {
            return Err(WireError::ChecksumMismatch);
        }

        let env: OpEnvelope<P> = from_cbor(payload)?;
        Ok((env, HEADER_LEN + len + CHECKSUM_LEN))
    }
}

/// Total frame length implied by a buffered header, or `None` when fewer
/// than [`HEADER_LEN`] bytes are available. Used by read loops to find
/// complete frames in a partial-frame buffer.
#[must_use]
pub fn frame_length(buf: &[u8]) -> Option<usize> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
    Some(HEADER_LEN + len + CHECKSUM_LEN)
}

/// Encodes a [`Message`] into a packet with the given logical timestamp.
pub fn encode_message(msg: &Message, ts: u64) -> Result<Vec<u8>, WireError> {
    let (op, payload) = match msg {
        Message::QueryRequest(p) => ("query_request", serde_cbor::value::to_value(p)?),
        Message::Results(p) => ("proximity_results", serde_cbor::value::to_value(p)?),
    };
    let env = OpEnvelope {
        op: op.to_string(),
        ts,
        payload,
    };
    Packet::encode_envelope(&env)
}

/// Decodes bytes into `(Message, ts, bytes_consumed)`.
pub fn decode_message(bytes: &[u8]) -> Result<(Message, u64, usize), WireError> {
    let (env, used) = Packet::decode_envelope::<Value>(bytes)?;
    let ts = env.ts;
    let msg = match env.op.as_str() {
        "query_request" => {
            let p: QueryRequest = serde_cbor::value::from_value(env.payload)?;
            Message::QueryRequest(p)
        }
        "proximity_results" => {
            let p: ProximityResults = serde_cbor::value::from_value(env.payload)?;
            Message::Results(p)
        }
        other => return Err(WireError::UnknownOp(other.to_string())),
    };
    Ok((msg, ts, used))
}

// --- Unit tests -----------------------------------------------------------
