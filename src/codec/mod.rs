//! Frame codec
//!
//! Converts raw IP packets to and from text-safe chat message payloads.
//! Every tunnel payload starts with a header tag identifying its kind,
//! followed by a base64 rendition of the packet data:
//!
//! ```text
//! "#iot "   <free text>          peer announcement, informational only
//! "#iotts " <base64(packet)>     one packet
//! "#iottm " <base64(records)>    batch frame, concatenated records
//! ```
//!
//! A batch frame record is a little-endian u16 length prefix followed by
//! that many packet bytes. Records are concatenated with no separator.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::warn;

/// Largest packet a batch record can carry; the length prefix is a u16
pub const RECORD_MAX_SIZE: usize = u16::MAX as usize;

/// Peer announcement header
pub const HEADER_WELCOME: &str = "#iot ";

/// Single-packet payload header
pub const HEADER_SINGLE: &str = "#iotts ";

/// Batch frame payload header
pub const HEADER_MULTIPLE: &str = "#iottm ";

/// Length prefix bytes per batch frame record
const RECORD_HEADER_SIZE: usize = 2;

/// Codec errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("payload is not valid base64: {0}")]
    InvalidEncoding(String),

    #[error("zero-length record #{index} in batch frame")]
    ZeroLengthRecord { index: usize },

    #[error("truncated record #{index}: declared {declared} bytes, {remaining} remaining")]
    TruncatedRecord {
        index: usize,
        declared: usize,
        remaining: usize,
    },
}

/// Payload kind, identified by the header tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Peer announcement, body is free text
    Welcome,
    /// One packet per message
    Single,
    /// Several packets framed into one message
    Multiple,
}

impl PayloadKind {
    /// Header tag for this kind
    pub fn header(self) -> &'static str {
        match self {
            PayloadKind::Welcome => HEADER_WELCOME,
            PayloadKind::Single => HEADER_SINGLE,
            PayloadKind::Multiple => HEADER_MULTIPLE,
        }
    }

    /// Classify a message text by its header tag.
    ///
    /// Returns the kind and the body after the tag, or `None` for text
    /// that is not a tunnel payload.
    pub fn classify(text: &str) -> Option<(PayloadKind, &str)> {
        for kind in [PayloadKind::Single, PayloadKind::Multiple, PayloadKind::Welcome] {
            if let Some(body) = text.strip_prefix(kind.header()) {
                return Some((kind, body));
            }
        }
        None
    }
}

/// Result of decoding a batch frame.
///
/// Decoding recovers every record up to the first malformed one, so a
/// partially corrupted frame still yields its leading packets alongside
/// the corruption that stopped the scan.
#[derive(Debug)]
pub struct BatchDecode {
    /// Packets recovered in frame order
    pub packets: Vec<Bytes>,
    /// First malformed record encountered, if any
    pub corruption: Option<CodecError>,
}

/// Encode one packet as a single-packet payload.
pub fn encode_single(packet: &[u8]) -> String {
    let mut out = String::with_capacity(HEADER_SINGLE.len() + encoded_len(packet.len()));
    out.push_str(HEADER_SINGLE);
    BASE64.encode_string(packet, &mut out);
    out
}

/// Decode the body of a single-packet payload.
pub fn decode_single(body: &str) -> std::result::Result<Bytes, CodecError> {
    let raw = BASE64
        .decode(body)
        .map_err(|e| CodecError::InvalidEncoding(e.to_string()))?;
    Ok(Bytes::from(raw))
}

/// Encode a set of packets as one batch frame payload.
///
/// Packets longer than [`RECORD_MAX_SIZE`] cannot be framed and are
/// dropped with a log line; a truncated length prefix would
/// desynchronize every record after it on the peer.
pub fn encode_batch(packets: &[Bytes]) -> String {
    let framed: usize = packets
        .iter()
        .filter(|p| p.len() <= RECORD_MAX_SIZE)
        .map(|p| RECORD_HEADER_SIZE + p.len())
        .sum();
    let mut buf = BytesMut::with_capacity(framed);
    for packet in packets {
        if packet.len() > RECORD_MAX_SIZE {
            warn!("dropping {}-byte packet, batch records cap at {} bytes", packet.len(), RECORD_MAX_SIZE);
            continue;
        }
        buf.put_u16_le(packet.len() as u16);
        buf.extend_from_slice(packet);
    }
    let mut out = String::with_capacity(HEADER_MULTIPLE.len() + encoded_len(framed));
    out.push_str(HEADER_MULTIPLE);
    BASE64.encode_string(&buf, &mut out);
    out
}

/// Encode packets into as few batch frame payloads as necessary.
///
/// Packets are packed greedily in order. A new payload is started
/// whenever adding the next record would push the encoded payload past
/// `max_payload_len`. A single oversized packet still gets a payload of
/// its own rather than being dropped.
pub fn encode_batches(packets: &[Bytes], max_payload_len: usize) -> Vec<String> {
    let budget = max_payload_len.saturating_sub(HEADER_MULTIPLE.len()) / 4 * 3;
    let mut payloads = Vec::new();
    let mut group: Vec<Bytes> = Vec::new();
    let mut group_framed = 0usize;
    for packet in packets {
        if packet.len() > RECORD_MAX_SIZE {
            warn!("dropping {}-byte packet, batch records cap at {} bytes", packet.len(), RECORD_MAX_SIZE);
            continue;
        }
        let record = RECORD_HEADER_SIZE + packet.len();
        if !group.is_empty() && group_framed + record > budget {
            payloads.push(encode_batch(&group));
            group.clear();
            group_framed = 0;
        }
        group.push(packet.clone());
        group_framed += record;
    }
    if !group.is_empty() {
        payloads.push(encode_batch(&group));
    }
    payloads
}

/// Decode the body of a batch frame payload.
///
/// An undecodable base64 body fails outright. A decodable body always
/// yields a [`BatchDecode`]: records are scanned front to back and the
/// scan stops at the first zero-length or truncated record.
pub fn decode_batch(body: &str) -> std::result::Result<BatchDecode, CodecError> {
    let raw = BASE64
        .decode(body)
        .map_err(|e| CodecError::InvalidEncoding(e.to_string()))?;
    let mut buf = Bytes::from(raw);
    let mut packets = Vec::new();
    let mut corruption = None;
    let mut index = 0;
    while buf.remaining() >= RECORD_HEADER_SIZE {
        let declared = buf.get_u16_le() as usize;
        if declared == 0 {
            corruption = Some(CodecError::ZeroLengthRecord { index });
            break;
        }
        if buf.remaining() < declared {
            corruption = Some(CodecError::TruncatedRecord {
                index,
                declared,
                remaining: buf.remaining(),
            });
            break;
        }
        packets.push(buf.split_to(declared));
        index += 1;
    }
    // a dangling byte means the length prefix itself was cut short
    if corruption.is_none() && buf.has_remaining() {
        corruption = Some(CodecError::TruncatedRecord {
            index,
            declared: RECORD_HEADER_SIZE,
            remaining: buf.remaining(),
        });
    }
    Ok(BatchDecode { packets, corruption })
}

/// Base64 output length for `len` input bytes
fn encoded_len(len: usize) -> usize {
    (len + 2) / 3 * 4
}
