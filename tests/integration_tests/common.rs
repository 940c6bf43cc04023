// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use tokio::io::DuplexStream;

/// An in-process loopback pair standing in for the real TCP/serial
/// transport (§8's "driven through an in-process loopback `tokio::io::
/// duplex` pair instead of a real TCP/serial port").
pub fn wire_pair() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(4096)
}
