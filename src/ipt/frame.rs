// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! IP-T wire framing (C2, §4.2).
//!
//! ```text
//!  byte:   0    1    2    3    4    5    6    7
//!        +----+----+----+----+----+----+----+----+
//!        | command(LE) |seq | 0  |   total_len(LE)|
//!        +----+----+----+----+----+----+----+----+
//! ```
//!
//! `total_len` counts the header itself plus the *escaped* body — the
//! receiver has to know how many wire bytes to read before it can
//! unescape them. Every command except the two login commands is preceded
//! on the wire by a single `0x1B` resynchronisation sentinel (§4.2); the
//! login commands are not, so a listener can always find the start of the
//! very first frame without having negotiated anything yet.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{error::SegwError, ipt::codes};

pub const HEADER_LEN: usize = 8;
pub const ESCAPE: u8 = 0x1B;

/// Default cap on a frame's declared total length (§4.2).
pub const DEFAULT_MAX_FRAME_LEN: u32 = 64 * 1024;

/// A decoded IP-T frame: command word, sequence number and raw body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: codes::Command,
    pub sequence: u8,
    pub body: Bytes,
}

/// Push-data-transfer frames are the one exception to the escape rule
/// (§4.3): their body is forwarded byte-transparent.
fn is_transparent_body(cmd: codes::Command) -> bool {
    matches!(
        cmd,
        codes::TP_REQ_PUSHDATA_TRANSFER | codes::TP_RES_PUSHDATA_TRANSFER
    )
}

/// Doubles every `0x1B` byte (escape-on-send, §4.2).
pub fn escape(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    for &b in body {
        out.push(b);
        if b == ESCAPE {
            out.push(ESCAPE);
        }
    }
    out
}

/// Drops every second `0x1B` occurrence (unescape-on-receive, §4.2).
pub fn unescape(wire: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(wire.len());
    let mut i = 0;
    while i < wire.len() {
        let b = wire[i];
        out.push(b);
        if b == ESCAPE && wire.get(i + 1) == Some(&ESCAPE) {
            i += 2;
        } else {
            i += 1;
        }
    }
    out
}

impl Frame {
    pub fn new(command: codes::Command, sequence: u8, body: impl Into<Bytes>) -> Self {
        Self {
            command,
            sequence,
            body: body.into(),
        }
    }

    /// Serialises this frame to its wire form, including the leading
    /// escape sentinel for any non-login command.
    pub fn to_wire(&self, max_len: u32) -> Result<Vec<u8>, SegwError> {
        let escaped_body: Vec<u8> = if is_transparent_body(self.command) {
            self.body.to_vec()
        } else {
            escape(&self.body)
        };

        let total_len = HEADER_LEN as u32 + escaped_body.len() as u32;
        if total_len > max_len {
            return Err(SegwError::protocol(format!(
                "frame length {total_len} exceeds limit {max_len}"
            )));
        }

        let mut out = BytesMut::with_capacity(1 + HEADER_LEN + escaped_body.len());
        if !codes::is_login_command(self.command) {
            out.put_u8(ESCAPE);
        }
        out.put_u16_le(self.command);
        out.put_u8(self.sequence);
        out.put_u8(0); // reserved
        out.put_u32_le(total_len);
        out.put_slice(&escaped_body);
        Ok(out.to_vec())
    }

    /// Parses a frame header + body already stripped of any leading
    /// sentinel byte (used by tests and by [`read_frame`]).
    pub fn from_header_and_wire_body(
        header: [u8; HEADER_LEN],
        wire_body: &[u8],
    ) -> Result<Self, SegwError> {
        let command = u16::from_le_bytes([header[0], header[1]]);
        let sequence = header[2];
        let body = if is_transparent_body(command) {
            wire_body.to_vec()
        } else {
            unescape(wire_body)
        };
        Ok(Self {
            command,
            sequence,
            body: Bytes::from(body),
        })
    }
}

/// Reads one frame from an async byte stream, honouring the leading
/// escape sentinel and the transparent push-data-transfer exception.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: u32,
) -> Result<Frame, SegwError> {
    let mut first = [0u8; 1];
    reader
        .read_exact(&mut first)
        .await
        .map_err(|e| SegwError::transport(e.to_string()))?;

    let mut header = [0u8; HEADER_LEN];
    if first[0] == ESCAPE {
        reader
            .read_exact(&mut header)
            .await
            .map_err(|e| SegwError::transport(e.to_string()))?;
    } else {
        header[0] = first[0];
        reader
            .read_exact(&mut header[1..])
            .await
            .map_err(|e| SegwError::transport(e.to_string()))?;
    }

    let command = u16::from_le_bytes([header[0], header[1]]);
    let mut total_len_buf = &header[4..8];
    let total_len = total_len_buf.get_u32_le();

    if total_len < HEADER_LEN as u32 || total_len > max_len {
        return Err(SegwError::protocol(format!(
            "declared length {total_len} out of range (max {max_len})"
        )));
    }

    let body_len = (total_len as usize) - HEADER_LEN;
    let mut wire_body = vec![0u8; body_len];
    reader
        .read_exact(&mut wire_body)
        .await
        .map_err(|e| SegwError::transport(e.to_string()))?;

    Frame::from_header_and_wire_body(header, &wire_body)
}
