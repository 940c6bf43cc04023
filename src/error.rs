// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Typed error kinds shared by every component (§7 of the design).
//!
//! Library code returns [`SegwError`] so that callers can pattern-match on
//! the *kind* of failure (to pick an SML attention code, an IP-T response
//! byte, or an exit code) without parsing a message string. Task bodies and
//! `main.rs` wrap these in `anyhow::Context` the same way the teacher's
//! `main.rs` wraps `Result<_, anyhow::Error>`.

use thiserror::Error;

/// One variant per error kind named in spec.md §7.
#[derive(Debug, Error)]
pub enum SegwError {
    /// Socket/serial read-write failure or peer reset.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed IP-T frame, bad SML CRC, or a declared length out of
    /// range.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Wrong credentials, wrong server id, or unknown user.
    #[error("authorization error: {0}")]
    Authorization(String),

    /// Mode-5 decrypt yielded an implausible plaintext.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// SQL read/write failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Unknown OBIS path or type coercion failure.
    #[error("config error at {path}: {reason}")]
    Config { path: String, reason: String },

    /// Watchdog or gatekeeper timeout.
    #[error("timing error: {0}")]
    Timing(String),
}

impl SegwError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn config(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Config {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Maps a failure to the nearest SML attention code (§4.5/§7).
    pub fn attention_code(&self) -> crate::sml::messages::AttentionCode {
        use crate::sml::messages::AttentionCode;
        match self {
            Self::Authorization(_) => AttentionCode::NotAuthorized,
            Self::Config { .. } => AttentionCode::NotExecuted,
            _ => AttentionCode::NotExecuted,
        }
    }

    /// Maps a failure to a CLI exit code per spec.md §6.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } => 1,
            Self::Storage(_) => 2,
            Self::Transport(_) | Self::Timing(_) => 3,
            Self::Protocol(_) | Self::Authorization(_) | Self::Crypto(_) => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, SegwError>;
