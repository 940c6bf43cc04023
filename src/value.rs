// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The run-time-typed value carried by configuration-tree leaves, SML
//! proc-parameter payloads and M-Bus readout data (§3: "Values carry a
//! run-time type tag").
//!
//! One shared enum backs all three surfaces so a value read off the wire
//! by the wM-Bus VDB decoder, stored in the cache, mirrored to SQL and
//! rendered back out through `GET_PROC_PARAMETER_RES` never needs more
//! than one conversion at each boundary.

use std::{net::SocketAddr, time::Duration};

use thiserror::Error;

/// A 32-bit type tag, persisted alongside every non-primitive SQL value so
/// it can be restored symmetrically (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TypeTag {
    Bool = 1,
    I8 = 2,
    I16 = 3,
    I32 = 4,
    I64 = 5,
    U8 = 6,
    U16 = 7,
    U32 = 8,
    U64 = 9,
    Str = 10,
    Buffer = 11,
    Timestamp = 12,
    Duration = 13,
    Aes128Key = 14,
    Endpoint = 15,
    Mac = 16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    Str(String),
    Buffer(Vec<u8>),
    /// Unix seconds.
    Timestamp(i64),
    Duration(Duration),
    Aes128Key([u8; 16]),
    Endpoint(SocketAddr),
    Mac([u8; 6]),
}

#[derive(Debug, Error)]
#[error("cannot coerce value {0:?} to the type required at this OBIS path")]
pub struct CoercionError(pub Value);

impl Value {
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Self::Bool(_) => TypeTag::Bool,
            Self::I8(_) => TypeTag::I8,
            Self::I16(_) => TypeTag::I16,
            Self::I32(_) => TypeTag::I32,
            Self::I64(_) => TypeTag::I64,
            Self::U8(_) => TypeTag::U8,
            Self::U16(_) => TypeTag::U16,
            Self::U32(_) => TypeTag::U32,
            Self::U64(_) => TypeTag::U64,
            Self::Str(_) => TypeTag::Str,
            Self::Buffer(_) => TypeTag::Buffer,
            Self::Timestamp(_) => TypeTag::Timestamp,
            Self::Duration(_) => TypeTag::Duration,
            Self::Aes128Key(_) => TypeTag::Aes128Key,
            Self::Endpoint(_) => TypeTag::Endpoint,
            Self::Mac(_) => TypeTag::Mac,
        }
    }

    /// Textual form used at the SQL boundary (§6: "serialised textually
    /// alongside a 32-bit type tag and restored symmetrically") and for
    /// `GET_LIST_REQ`/profile readout string values.
    pub fn to_text(&self) -> String {
        match self {
            Self::Bool(b) => b.to_string(),
            Self::I8(v) => v.to_string(),
            Self::I16(v) => v.to_string(),
            Self::I32(v) => v.to_string(),
            Self::I64(v) => v.to_string(),
            Self::U8(v) => v.to_string(),
            Self::U16(v) => v.to_string(),
            Self::U32(v) => v.to_string(),
            Self::U64(v) => v.to_string(),
            Self::Str(s) => s.clone(),
            Self::Buffer(b) => hex::encode_upper(b),
            Self::Timestamp(t) => t.to_string(),
            Self::Duration(d) => d.as_secs().to_string(),
            Self::Aes128Key(k) => hex::encode_upper(k),
            Self::Endpoint(e) => e.to_string(),
            Self::Mac(m) => hex::encode_upper(m),
        }
    }

    pub fn from_text(tag: TypeTag, text: &str) -> Result<Self, CoercionError> {
        let invalid = || CoercionError(Value::Str(text.to_string()));
        Ok(match tag {
            TypeTag::Bool => Self::Bool(text == "true" || text == "1"),
            TypeTag::I8 => Self::I8(text.parse().map_err(|_| invalid())?),
            TypeTag::I16 => Self::I16(text.parse().map_err(|_| invalid())?),
            TypeTag::I32 => Self::I32(text.parse().map_err(|_| invalid())?),
            TypeTag::I64 => Self::I64(text.parse().map_err(|_| invalid())?),
            TypeTag::U8 => Self::U8(text.parse().map_err(|_| invalid())?),
            TypeTag::U16 => Self::U16(text.parse().map_err(|_| invalid())?),
            TypeTag::U32 => Self::U32(text.parse().map_err(|_| invalid())?),
            TypeTag::U64 => Self::U64(text.parse().map_err(|_| invalid())?),
            TypeTag::Str => Self::Str(text.to_string()),
            TypeTag::Buffer => Self::Buffer(hex::decode(text).map_err(|_| invalid())?),
            TypeTag::Timestamp => Self::Timestamp(text.parse().map_err(|_| invalid())?),
            TypeTag::Duration => {
                Self::Duration(Duration::from_secs(text.parse().map_err(|_| invalid())?))
            },
            TypeTag::Aes128Key => {
                let raw = hex::decode(text).map_err(|_| invalid())?;
                Self::Aes128Key(raw.try_into().map_err(|_| invalid())?)
            },
            TypeTag::Endpoint => Self::Endpoint(text.parse().map_err(|_| invalid())?),
            TypeTag::Mac => {
                let raw = hex::decode(text).map_err(|_| invalid())?;
                Self::Mac(raw.try_into().map_err(|_| invalid())?)
            },
        })
    }

    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::U8(v) => Some(v as u64),
            Self::U16(v) => Some(v as u64),
            Self::U32(v) => Some(v as u64),
            Self::U64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_round_trip_for_every_tag() {
        let samples = [
            Value::Bool(true),
            Value::I32(-42),
            Value::U64(9000),
            Value::Str("hello".into()),
            Value::Buffer(vec![1, 2, 3]),
            Value::Timestamp(1_600_000_000),
            Value::Duration(Duration::from_secs(122)),
            Value::Aes128Key([7u8; 16]),
            Value::Mac([1, 2, 3, 4, 5, 6]),
        ];
        for v in samples {
            let tag = v.type_tag();
            let text = v.to_text();
            let back = Value::from_text(tag, &text).expect("round trip");
            assert_eq!(back, v);
        }
    }
}
