// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Smart Message Language: TLV codec, file framing, message bodies and
//! the proc-parameter router (C4-C5, §4.4-§4.5).

pub mod file;
pub mod messages;
pub mod router;
pub mod tlv;
