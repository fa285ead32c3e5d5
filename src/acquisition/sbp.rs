//! SBP (Swift Binary Protocol) framing and payload decoding
//!
//! Frame layout, all integers little-endian:
//!
//! ```text
//! 0x55 | msg_type u16 | sender u16 | len u8 | payload[len] | crc u16
//! ```
//!
//! The CRC is CRC-16/XMODEM over everything between the preamble and the CRC.
//! Only the message types the aggregator fuses are decoded; every other type
//! is framed and discarded.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::types::{
    GpsTime, MessageKind, NavMessage, OrientEuler, PosLlh, MSG_GPS_TIME, MSG_ORIENT_EULER,
    MSG_POS_LLH,
};

pub const PREAMBLE: u8 = 0x55;

const HEADER_LEN: usize = 6;
const CRC_LEN: usize = 2;

const GPS_TIME_LEN: usize = 11;
const POS_LLH_LEN: usize = 34;
const ORIENT_EULER_LEN: usize = 29;

/// A malformed or unusable message. Never fatal: the message is dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("CRC mismatch on msg_type {msg_type:#06x} (frame {expected:#06x}, computed {actual:#06x})")]
    Crc {
        msg_type: u16,
        expected: u16,
        actual: u16,
    },
    #[error("msg_type {msg_type:#06x} payload too short ({len} of {need} bytes)")]
    ShortPayload { msg_type: u16, len: usize, need: usize },
    #[error("invalid SBP-JSON line: {0}")]
    Json(String),
    #[error("msg_type {msg_type:#06x} payload of {len} bytes does not fit a frame (max 255)")]
    PayloadTooLong { msg_type: u16, len: usize },
}

/// One CRC-checked SBP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbpFrame {
    pub msg_type: u16,
    pub sender: u16,
    pub payload: Bytes,
}

/// CRC-16/XMODEM (poly 0x1021, init 0).
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        let mut crc = crc ^ (u16::from(byte) << 8);
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
        crc
    })
}

// ============================================================================
// Framing
// ============================================================================

/// Splits a byte stream into SBP frames.
///
/// Bytes before a preamble are skipped. A frame with a bad CRC yields
/// `Some(Err(ProtocolError::Crc))` and decoding resumes one byte after its
/// preamble, so a spurious `0x55` inside garbage cannot swallow a real frame.
#[derive(Debug, Default)]
pub struct SbpCodec {
    skipped_bytes: u64,
}

impl SbpCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes discarded while hunting for a preamble.
    pub fn skipped_bytes(&self) -> u64 {
        self.skipped_bytes
    }
}

impl Decoder for SbpCodec {
    type Item = Result<SbpFrame, ProtocolError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.iter().position(|&b| b == PREAMBLE) {
            Some(0) => {}
            Some(offset) => {
                self.skipped_bytes += offset as u64;
                src.advance(offset);
            }
            None => {
                self.skipped_bytes += src.len() as u64;
                src.clear();
                return Ok(None);
            }
        }

        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = usize::from(src[5]);
        let frame_len = HEADER_LEN + len + CRC_LEN;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        let msg_type = u16::from_le_bytes([src[1], src[2]]);
        let sender = u16::from_le_bytes([src[3], src[4]]);
        let crc_at = HEADER_LEN + len;
        let expected = u16::from_le_bytes([src[crc_at], src[crc_at + 1]]);
        let actual = crc16(&src[1..crc_at]);

        if expected != actual {
            src.advance(1);
            self.skipped_bytes += 1;
            return Ok(Some(Err(ProtocolError::Crc { msg_type, expected, actual })));
        }

        let mut frame = src.split_to(frame_len);
        frame.advance(HEADER_LEN);
        frame.truncate(len);
        trace!(msg_type, sender, len, "SBP frame");
        Ok(Some(Ok(SbpFrame {
            msg_type,
            sender,
            payload: frame.freeze(),
        })))
    }

    /// A preamble whose declared length runs past EOF is skipped one byte at
    /// a time, so complete frames behind it are still decoded.
    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while !buf.is_empty() {
            if let Some(item) = self.decode(buf)? {
                return Ok(Some(item));
            }
            if !buf.is_empty() {
                buf.advance(1);
                self.skipped_bytes += 1;
            }
        }
        Ok(None)
    }
}

/// Encode a payload as a complete SBP frame.
pub fn encode_frame(msg_type: u16, sender: u16, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let len = u8::try_from(payload.len()).map_err(|_| ProtocolError::PayloadTooLong {
        msg_type,
        len: payload.len(),
    })?;

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len() + CRC_LEN);
    buf.put_u8(PREAMBLE);
    buf.put_u16_le(msg_type);
    buf.put_u16_le(sender);
    buf.put_u8(len);
    buf.put_slice(payload);
    let crc = crc16(&buf[1..]);
    buf.put_u16_le(crc);
    Ok(buf.freeze())
}

// ============================================================================
// Payloads
// ============================================================================

fn require_len(msg_type: u16, payload: &[u8], need: usize) -> Result<(), ProtocolError> {
    if payload.len() < need {
        return Err(ProtocolError::ShortPayload {
            msg_type,
            len: payload.len(),
            need,
        });
    }
    Ok(())
}

/// Decode a frame's payload. `Ok(None)` for message types that are not fused.
pub fn decode_frame(frame: &SbpFrame) -> Result<Option<NavMessage>, ProtocolError> {
    let mut p = &frame.payload[..];
    let msg = match frame.msg_type {
        MSG_GPS_TIME => {
            require_len(frame.msg_type, p, GPS_TIME_LEN)?;
            NavMessage::GpsTime(GpsTime {
                wn: p.get_u16_le(),
                tow: p.get_u32_le(),
                ns_residual: p.get_i32_le(),
                flags: p.get_u8(),
            })
        }
        MSG_POS_LLH => {
            require_len(frame.msg_type, p, POS_LLH_LEN)?;
            NavMessage::PosLlh(PosLlh {
                tow: p.get_u32_le(),
                lat: p.get_f64_le(),
                lon: p.get_f64_le(),
                height: p.get_f64_le(),
                h_accuracy: p.get_u16_le(),
                v_accuracy: p.get_u16_le(),
                n_sats: p.get_u8(),
                flags: p.get_u8(),
            })
        }
        MSG_ORIENT_EULER => {
            require_len(frame.msg_type, p, ORIENT_EULER_LEN)?;
            NavMessage::OrientEuler(OrientEuler {
                tow: p.get_u32_le(),
                roll: p.get_i32_le(),
                pitch: p.get_i32_le(),
                yaw: p.get_i32_le(),
                roll_accuracy: p.get_f32_le(),
                pitch_accuracy: p.get_f32_le(),
                yaw_accuracy: p.get_f32_le(),
                flags: p.get_u8(),
            })
        }
        _ => return Ok(None),
    };
    Ok(Some(msg))
}

/// Serialize a message into its SBP payload.
pub fn encode_payload(msg: &NavMessage) -> Vec<u8> {
    let mut buf = Vec::with_capacity(POS_LLH_LEN);
    match msg {
        NavMessage::GpsTime(m) => {
            buf.put_u16_le(m.wn);
            buf.put_u32_le(m.tow);
            buf.put_i32_le(m.ns_residual);
            buf.put_u8(m.flags);
        }
        NavMessage::PosLlh(m) => {
            buf.put_u32_le(m.tow);
            buf.put_f64_le(m.lat);
            buf.put_f64_le(m.lon);
            buf.put_f64_le(m.height);
            buf.put_u16_le(m.h_accuracy);
            buf.put_u16_le(m.v_accuracy);
            buf.put_u8(m.n_sats);
            buf.put_u8(m.flags);
        }
        NavMessage::OrientEuler(m) => {
            buf.put_u32_le(m.tow);
            buf.put_i32_le(m.roll);
            buf.put_i32_le(m.pitch);
            buf.put_i32_le(m.yaw);
            buf.put_f32_le(m.roll_accuracy);
            buf.put_f32_le(m.pitch_accuracy);
            buf.put_f32_le(m.yaw_accuracy);
            buf.put_u8(m.flags);
        }
    }
    buf
}

/// Encode a message as a complete frame.
pub fn encode_message(msg: &NavMessage, sender: u16) -> Result<Bytes, ProtocolError> {
    encode_frame(msg.kind().msg_type(), sender, &encode_payload(msg))
}

// ============================================================================
// SBP-JSON
// ============================================================================

/// Decode one SBP-JSON line (`{"msg_type": 522, "tow": ..., ...}`).
///
/// Blank lines and unfused message types yield `Ok(None)`.
pub fn decode_json_line(line: &str) -> Result<Option<NavMessage>, ProtocolError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let value: serde_json::Value =
        serde_json::from_str(line).map_err(|e| ProtocolError::Json(e.to_string()))?;
    let msg_type = value
        .get("msg_type")
        .and_then(serde_json::Value::as_u64)
        .and_then(|t| u16::try_from(t).ok())
        .ok_or_else(|| ProtocolError::Json("missing or invalid msg_type".to_string()))?;

    let Some(kind) = MessageKind::from_msg_type(msg_type) else {
        return Ok(None);
    };
    let json_err = |e: serde_json::Error| ProtocolError::Json(format!("msg_type {msg_type}: {e}"));
    let msg = match kind {
        MessageKind::GpsTime => NavMessage::GpsTime(serde_json::from_value(value).map_err(json_err)?),
        MessageKind::Position => NavMessage::PosLlh(serde_json::from_value(value).map_err(json_err)?),
        MessageKind::Orientation => {
            NavMessage::OrientEuler(serde_json::from_value(value).map_err(json_err)?)
        }
    };
    Ok(Some(msg))
}
