// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! SML message envelopes and file framing (C4, §4.4).
//!
//! A single SML message is the 5-tuple `(transactionId, groupNo,
//! abortOnError, body, crc16)`. Several messages are concatenated inside
//! an **SML file**, which is framed as:
//!
//! ```text
//! 1B 1B 1B 1B 01 01 01 01  [messages...]  1B 1B 1B 1B 1A PP CC CC
//! ```
//!
//! `PP` is the pad-byte count (0-3) needed to align the file body to a
//! 4-byte boundary; `CC CC` is the CRC16/X-25 of everything from the first
//! `1B` through the `PP` byte inclusive. Any `0x1B` appearing inside
//! message data is escaped by quadrupling so it can never be confused with
//! the start/end markers (which always appear as *exactly* four
//! consecutive `0x1B` bytes).

use crc::{Crc, CRC_16_IBM_SDLC};
use thiserror::Error;

use crate::sml::tlv::{self, Value};

const ESCAPE: u8 = 0x1B;
const START_MARKER: [u8; 8] = [0x1B, 0x1B, 0x1B, 0x1B, 0x01, 0x01, 0x01, 0x01];
const END_TAG: u8 = 0x1A;

const CRC16_X25: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_SDLC);

#[derive(Debug, Clone, PartialEq)]
pub struct SmlMessage {
    pub transaction_id: Vec<u8>,
    pub group_no: u8,
    pub abort_on_error: u8,
    pub body: Value,
}

#[derive(Debug, Error)]
pub enum SmlFileError {
    #[error("TLV decode error: {0}")]
    Tlv(#[from] tlv::TlvError),
    #[error("missing or malformed SML start marker")]
    BadStart,
    #[error("missing or malformed SML end marker")]
    BadEnd,
    #[error("CRC16 mismatch: expected {expected:04x}, computed {computed:04x}")]
    Crc { expected: u16, computed: u16 },
    #[error("message envelope did not decode to a 5-element list")]
    BadEnvelope,
}

/// Quadruples every `0x1B` byte in message data (§4.4).
fn escape_quad(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &b in data {
        out.push(b);
        if b == ESCAPE {
            out.extend_from_slice(&[ESCAPE, ESCAPE, ESCAPE]);
        }
    }
    out
}

/// Inverse of [`escape_quad`].
fn unescape_quad(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        let b = data[i];
        out.push(b);
        if b == ESCAPE && data.get(i + 1..i + 4) == Some(&[ESCAPE, ESCAPE, ESCAPE]) {
            i += 4;
        } else {
            i += 1;
        }
    }
    out
}

impl SmlMessage {
    /// Encodes this message as a TLV list, with the CRC16 computed over
    /// the serialized `(transactionId, groupNo, abortOnError, body)`
    /// quadruple and appended as the fifth list element.
    pub fn encode(&self) -> Vec<u8> {
        let prefix = Value::List(vec![
            Value::OctetString(self.transaction_id.clone()),
            Value::Unsigned(self.group_no as u64),
            Value::Unsigned(self.abort_on_error as u64),
            self.body.clone(),
        ]);
        let mut prefix_bytes = Vec::new();
        tlv::encode(&prefix, &mut prefix_bytes);

        let crc = CRC16_X25.checksum(&prefix_bytes);

        let full = Value::List(vec![
            Value::OctetString(self.transaction_id.clone()),
            Value::Unsigned(self.group_no as u64),
            Value::Unsigned(self.abort_on_error as u64),
            self.body.clone(),
            Value::Unsigned(crc as u64),
        ]);
        let mut out = Vec::new();
        tlv::encode(&full, &mut out);
        out
    }

    pub fn decode(buf: &[u8], pos: &mut usize) -> Result<Self, SmlFileError> {
        let value = tlv::decode(buf, pos)?;
        let Value::List(mut items) = value else {
            return Err(SmlFileError::BadEnvelope);
        };
        if items.len() != 5 {
            return Err(SmlFileError::BadEnvelope);
        }
        let crc_val = items.pop().expect("len checked");
        let body = items.pop().expect("len checked");
        let Value::Unsigned(abort) = items.pop().expect("len checked") else {
            return Err(SmlFileError::BadEnvelope);
        };
        let Value::Unsigned(group) = items.pop().expect("len checked") else {
            return Err(SmlFileError::BadEnvelope);
        };
        let Value::OctetString(transaction_id) = items.pop().expect("len checked") else {
            return Err(SmlFileError::BadEnvelope);
        };
        let Value::Unsigned(expected_crc) = crc_val else {
            return Err(SmlFileError::BadEnvelope);
        };

        let prefix = Value::List(vec![
            Value::OctetString(transaction_id.clone()),
            Value::Unsigned(group),
            Value::Unsigned(abort),
            body.clone(),
        ]);
        let mut prefix_bytes = Vec::new();
        tlv::encode(&prefix, &mut prefix_bytes);
        let computed = CRC16_X25.checksum(&prefix_bytes);
        if computed as u64 != expected_crc {
            return Err(SmlFileError::Crc {
                expected: expected_crc as u16,
                computed,
            });
        }

        Ok(Self {
            transaction_id,
            group_no: group as u8,
            abort_on_error: abort as u8,
            body,
        })
    }
}

/// Frames one or more messages into a complete SML file.
pub fn encode_file(messages: &[SmlMessage]) -> Vec<u8> {
    let mut body = Vec::new();
    for m in messages {
        body.extend(escape_quad(&m.encode()));
    }

    let mut file = Vec::new();
    file.extend_from_slice(&START_MARKER);
    file.extend_from_slice(&body);

    let unpadded_len = file.len() + 2 /* end marker tail: 1A PP */;
    let pad = (4 - (unpadded_len % 4)) % 4;
    file.extend(std::iter::repeat_n(0u8, pad));
    file.extend_from_slice(&[ESCAPE, ESCAPE, ESCAPE, ESCAPE, END_TAG, pad as u8]);

    let crc = CRC16_X25.checksum(&file);
    file.extend_from_slice(&crc.to_be_bytes());
    file
}

/// Parses a complete SML file, verifying the trailer CRC (P3) and
/// returning the decoded messages.
pub fn decode_file(file: &[u8]) -> Result<Vec<SmlMessage>, SmlFileError> {
    if file.len() < START_MARKER.len() + 6 || file[..8] != START_MARKER {
        return Err(SmlFileError::BadStart);
    }

    let trailer_crc_pos = file.len() - 2;
    let expected_crc = u16::from_be_bytes([file[trailer_crc_pos], file[trailer_crc_pos + 1]]);
    let computed_crc = CRC16_X25.checksum(&file[..trailer_crc_pos]);
    if computed_crc != expected_crc {
        return Err(SmlFileError::Crc {
            expected: expected_crc,
            computed: computed_crc,
        });
    }

    if file.len() < 8 {
        return Err(SmlFileError::BadEnd);
    }
    let end_marker_start = file.len() - 8;
    if file.get(end_marker_start..end_marker_start + 4) != Some(&[ESCAPE, ESCAPE, ESCAPE, ESCAPE])
    {
        return Err(SmlFileError::BadEnd);
    }
    let pad = file[file.len() - 3] as usize;
    let body_end = end_marker_start
        .checked_sub(pad)
        .ok_or(SmlFileError::BadEnd)?;

    let escaped_body = &file[START_MARKER.len()..body_end];
    let body = unescape_quad(escaped_body);

    let mut messages = Vec::new();
    let mut pos = 0;
    while pos < body.len() {
        messages.push(SmlMessage::decode(&body, &mut pos)?);
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message(tid: &[u8]) -> SmlMessage {
        SmlMessage {
            transaction_id: tid.to_vec(),
            group_no: 0,
            abort_on_error: 0,
            body: Value::List(vec![
                Value::Unsigned(0x0100), // body code placeholder
                Value::OctetString(b"payload".to_vec()),
            ]),
        }
    }

    #[test]
    fn single_message_round_trip() {
        let msg = sample_message(b"tid-1");
        let encoded = msg.encode();
        let mut pos = 0;
        let decoded = SmlMessage::decode(&encoded, &mut pos).expect("decode");
        assert_eq!(decoded, msg);
    }

    /// P3: for every generated SML file F, crc16_x25(F without trailer
    /// crc) == trailer crc of F.
    #[test]
    fn file_trailer_crc_matches() {
        let file = encode_file(&[sample_message(b"tid-1"), sample_message(b"tid-2")]);
        let trailer_crc_pos = file.len() - 2;
        let expected = u16::from_be_bytes([file[trailer_crc_pos], file[trailer_crc_pos + 1]]);
        let computed = CRC16_X25.checksum(&file[..trailer_crc_pos]);
        assert_eq!(expected, computed);
    }

    #[test]
    fn file_round_trip_multiple_messages() {
        let msgs = vec![sample_message(b"a"), sample_message(b"bb"), sample_message(b"ccc")];
        let file = encode_file(&msgs);
        let decoded = decode_file(&file).expect("decode file");
        assert_eq!(decoded, msgs);
    }

    #[test]
    fn file_is_padded_to_four_byte_boundary() {
        let file = encode_file(&[sample_message(b"x")]);
        assert_eq!(file.len() % 4, 0);
    }

    #[test]
    fn embedded_escape_bytes_are_quadrupled_and_recovered() {
        let msg = SmlMessage {
            transaction_id: vec![ESCAPE, 0x02],
            group_no: 0,
            abort_on_error: 0,
            body: Value::OctetString(vec![ESCAPE, ESCAPE]),
        };
        let file = encode_file(&[msg.clone()]);
        let decoded = decode_file(&file).expect("decode");
        assert_eq!(decoded[0], msg);
    }

    #[test]
    fn tampered_file_fails_crc() {
        let mut file = encode_file(&[sample_message(b"tid")]);
        let last = file.len() - 1;
        file[last] ^= 0xFF;
        assert!(matches!(decode_file(&file), Err(SmlFileError::Crc { .. })));
    }
}
