// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! OBIS identifiers (IEC 62056-6-1) and OBIS paths (§3, §4.6 of the design).
//!
//! An OBIS code is a fixed 6-byte tuple `{A,B,C,D,E,F}`. This module keeps
//! it as a plain `[u8; 6]` newtype (no zerocopy needed — OBIS codes never
//! appear raw on an M-Bus/SML wire the way an iSCSI BHS opcode byte does)
//! and provides the two printable forms used by SML tooling and by the
//! legacy colon-separated-hex textual form at the SQL boundary (§9 design
//! notes: "store as structured `Vec<Obis>` in memory, render to legacy
//! textual form only at the SQL boundary").

use std::fmt;

use thiserror::Error;

/// Last-byte wildcard: "matches any" per §3.
pub const WILDCARD: u8 = 0xFF;

/// A 6-byte OBIS identifier `{A,B,C,D,E,F}`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Obis(pub [u8; 6]);

impl Obis {
    pub const fn new(a: u8, b: u8, c: u8, d: u8, e: u8, f: u8) -> Self {
        Self([a, b, c, d, e, f])
    }

    /// Equality that treats a wildcard `F` byte on either side as matching
    /// anything.
    pub fn matches(&self, other: &Self) -> bool {
        self.0[..5] == other.0[..5]
            && (self.0[5] == other.0[5]
                || self.0[5] == WILDCARD
                || other.0[5] == WILDCARD)
    }

    /// `AA-BB-CC-DD-EE-FF` form.
    pub fn to_hex_dashed(self) -> String {
        let [a, b, c, d, e, f] = self.0;
        format!("{a:02X}-{b:02X}-{c:02X}-{d:02X}-{e:02X}-{f:02X}")
    }

    /// `A-B:C.D.E*F` form (dotted DLMS notation).
    pub fn to_dotted(self) -> String {
        let [a, b, c, d, e, f] = self.0;
        format!("{a}-{b}:{c}.{d}.{e}*{f}")
    }
}

impl fmt::Debug for Obis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Obis({})", self.to_hex_dashed())
    }
}

impl fmt::Display for Obis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex_dashed())
    }
}

/// Returned when a textual OBIS form can't be parsed.
#[derive(Debug, Error)]
#[error("invalid OBIS literal: {0:?}")]
pub struct InvalidObis(pub String);

impl std::str::FromStr for Obis {
    type Err = InvalidObis;

    /// Accepts the `AA-BB-CC-DD-EE-FF` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 6 {
            return Err(InvalidObis(s.to_string()));
        }
        let mut bytes = [0u8; 6];
        for (i, p) in parts.iter().enumerate() {
            bytes[i] = u8::from_str_radix(p, 16).map_err(|_| InvalidObis(s.to_string()))?;
        }
        Ok(Obis(bytes))
    }
}

/// An ordered sequence of OBIS identifiers naming a node in the
/// configuration tree (§3: "An OBIS path is an ordered sequence of
/// identifiers and names a node in the configuration tree").
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct ObisPath(pub Vec<Obis>);

impl ObisPath {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(mut self, o: Obis) -> Self {
        self.0.push(o);
        self
    }

    pub fn root(&self) -> Option<&Obis> {
        self.0.first()
    }

    /// Legacy colon-separated-hex textual form, used only at the SQL
    /// boundary (§9).
    pub fn to_legacy_text(&self) -> String {
        self.0
            .iter()
            .map(|o| hex::encode_upper(o.0))
            .collect::<Vec<_>>()
            .join(":")
    }

    pub fn from_legacy_text(text: &str) -> Result<Self, InvalidObis> {
        let mut path = Vec::new();
        for seg in text.split(':') {
            let raw = hex::decode(seg).map_err(|_| InvalidObis(text.to_string()))?;
            let bytes: [u8; 6] = raw
                .as_slice()
                .try_into()
                .map_err(|_| InvalidObis(text.to_string()))?;
            path.push(Obis(bytes));
        }
        Ok(ObisPath(path))
    }
}

impl fmt::Debug for ObisPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

/// Well-known root sections of the configuration tree (§3).
pub mod roots {
    use super::Obis;

    pub const ROOT_IPT_PARAM: Obis = Obis::new(0x81, 0x49, 0x0D, 0x06, 0x00, 0xFF);
    pub const ROOT_NTP: Obis = Obis::new(0x81, 0x81, 0xC7, 0x88, 0x01, 0xFF);
    pub const ROOT_SECURITY: Obis = Obis::new(0x81, 0x81, 0xC7, 0x86, 0x00, 0xFF);
    pub const ROOT_ACCESS_RIGHTS: Obis = Obis::new(0x81, 0x81, 0xC7, 0x86, 0x01, 0xFF);
    pub const ROOT_SENSOR_PARAMS: Obis = Obis::new(0x81, 0x81, 0xC7, 0x86, 0x02, 0xFF);
    pub const ROOT_DATA_COLLECTOR: Obis = Obis::new(0x81, 0x81, 0xC7, 0x86, 0x03, 0xFF);
    pub const ROOT_PUSH_OPERATIONS: Obis = Obis::new(0x81, 0x81, 0xC7, 0x86, 0x04, 0xFF);
    pub const ROOT_BROKER: Obis = Obis::new(0x81, 0x81, 0xC7, 0x86, 0x05, 0xFF);
    pub const ROOT_SERIAL: Obis = Obis::new(0x81, 0x81, 0xC7, 0x86, 0x06, 0xFF);
    pub const IF_WMBUS: Obis = Obis::new(0x81, 0x06, 0x19, 0x07, 0x00, 0xFF);
    pub const IF_1107: Obis = Obis::new(0x81, 0x81, 0xC7, 0x93, 0x00, 0xFF);
    pub const CLASS_MBUS: Obis = Obis::new(0x81, 0x06, 0x0F, 0x06, 0x00, 0xFF);
    pub const ROOT_CUSTOM_INTERFACE: Obis = Obis::new(0x81, 0x81, 0xC7, 0x86, 0x07, 0xFF);
    pub const ROOT_CUSTOM_PARAM: Obis = Obis::new(0x81, 0x81, 0xC7, 0x86, 0x08, 0xFF);
    pub const CLASS_OP_LOG_STATUS_WORD: Obis =
        Obis::new(0x81, 0x81, 0xC7, 0x86, 0x09, 0xFF);
    pub const OBIS_REBOOT: Obis = Obis::new(0x81, 0x81, 0xC7, 0x86, 0x0A, 0xFF);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dashed_and_dotted_forms() {
        let o = Obis::new(0x01, 0x00, 0x01, 0x08, 0x00, 0xFF);
        assert_eq!(o.to_hex_dashed(), "01-00-01-08-00-FF");
        assert_eq!(o.to_dotted(), "1-0:1.8.0*255");
    }

    #[test]
    fn wildcard_matches_any_last_byte() {
        let wildcard = Obis::new(0x01, 0x00, 0x01, 0x08, 0x00, WILDCARD);
        let concrete = Obis::new(0x01, 0x00, 0x01, 0x08, 0x00, 0x01);
        assert!(wildcard.matches(&concrete));
        assert!(concrete.matches(&wildcard));

        let mismatched_prefix = Obis::new(0x01, 0x00, 0x02, 0x08, 0x00, 0x01);
        assert!(!wildcard.matches(&mismatched_prefix));
    }

    #[test]
    fn from_str_round_trip() {
        let o = Obis::new(0x01, 0x00, 0x01, 0x08, 0x00, 0xFF);
        let text = o.to_hex_dashed();
        let parsed: Obis = text.parse().expect("parse");
        assert_eq!(o, parsed);
    }

    #[test]
    fn path_legacy_text_round_trip() {
        let path = ObisPath::new()
            .push(roots::ROOT_IPT_PARAM)
            .push(Obis::new(0, 0, 0, 0, 0, 1));
        let text = path.to_legacy_text();
        let back = ObisPath::from_legacy_text(&text).expect("parse");
        assert_eq!(path, back);
    }
}
