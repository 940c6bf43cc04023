// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Scenario tests S1/S3 driven over a framed `tokio::io::duplex` loopback
//! (§8). S2 (scrambled login key rotation), S4 (mode-5 decode), S5
//! (15-minute bucketing) and S6 (reboot attention) are covered as
//! `#[cfg(test)]` unit tests beside the modules they exercise.

mod integration_tests {
    pub mod common;

    pub mod public_login_over_wire;
    pub mod push_target_register_over_wire;
}
