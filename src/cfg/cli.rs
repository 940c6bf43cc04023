// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Command-line surface (§4.14/§6). The teacher repo parses no
//! subcommands (a single static binary); this is enriched from the
//! `clap` derive CLIs used elsewhere in the retrieval pack.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "segw", about = "Smart electricity gateway")]
pub struct Cli {
    /// JSON bootstrap document (§6: "A `--config <file>` flag selects
    /// the JSON bootstrap file").
    #[arg(long, default_value = "segw.json")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Seeds the configuration cache and relational mirror from the
    /// bootstrap document.
    InitDb,
    /// Re-applies the bootstrap document onto an already-initialised
    /// store.
    TransferConfig,
    /// Erases every cache table and its SQL mirror.
    ClearConfig,
    /// Prints the full configuration tree.
    ListConfig,
    /// Prints the profile storage table for one profile OBIS.
    DumpProfile {
        profile_id: String,
    },
    /// Prints the `_DeviceMBUS` table.
    DumpDevices,
    /// Prints the `_PushOps` table.
    DumpPushOps,
    /// Writes one OBIS path to the configuration cache.
    Set {
        obis_path: String,
        value: String,
    },
    /// Runs the gateway: opens the IP-T session(s), the serial readers,
    /// the readout dispatcher and the push scheduler.
    Run,
}

/// Resolves `--config` to an absolute, canonical path (§6).
pub fn resolve_config_path(path: &std::path::Path) -> anyhow::Result<PathBuf> {
    use anyhow::Context;

    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().context("cannot get current working dir")?.join(path)
    };
    abs.canonicalize().with_context(|| format!("failed to canonicalize path {abs:?}"))
}
