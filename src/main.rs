// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use clap::Parser;
use segw_rs::{
    cache::{self, Cache, mirror::{Mirror, SqliteStore}},
    cfg::{
        cli::{Cli, Command, resolve_config_path},
        config::Config,
        logger::init_logger,
    },
    error::SegwError,
    readout,
    value::Value,
};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

/// Runs the CLI and returns the process exit code per §6's contract: 0
/// success, 1 config error, 2 storage error, 3 network error, 4 CLI usage
/// error. Computed explicitly rather than threaded through `?` so every
/// fallible step can report its own code instead of collapsing to 1.
async fn run() -> i32 {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                clap::error::ErrorKind::DisplayHelp
                | clap::error::ErrorKind::DisplayVersion
                | clap::error::ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => 0,
                _ => 4,
            };
        },
    };

    let _log_guard = init_logger("tests/config_logger.yaml").ok();

    let config_path = match resolve_config_path(&cli.config) {
        Ok(path) => path,
        Err(e) => {
            error!(error = %e, "failed to resolve --config path");
            return SegwError::config(cli.config.display().to_string(), e.to_string()).exit_code();
        },
    };
    let cfg = match Config::load_from_file(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return SegwError::config(config_path.display().to_string(), e.to_string()).exit_code();
        },
    };

    let store = match rusqlite_store(&cfg) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "failed to open relational store");
            return SegwError::Storage(e.to_string()).exit_code();
        },
    };
    let cache = Cache::new();
    let mirror = Mirror::new(store);

    if let Err(e) = mirror.bulk_load(&cache).await {
        error!(error = %e, "failed to bulk-load relational mirror");
        return SegwError::Storage(e.to_string()).exit_code();
    }
    mirror.attach(&cache);

    match cli.command {
        Command::InitDb => {
            seed_from_bootstrap(&cache, &cfg);
            info!("configuration cache seeded from bootstrap document");
            0
        },
        Command::TransferConfig => {
            seed_from_bootstrap(&cache, &cfg);
            info!("bootstrap document re-applied onto the live store");
            0
        },
        Command::ClearConfig => {
            clear_all_tables(&cache);
            info!("configuration cache and relational mirror cleared");
            0
        },
        Command::ListConfig => {
            print_table(&cache, cache::TABLE_CFG);
            0
        },
        Command::DumpProfile { profile_id } => {
            info!(profile = %profile_id, "profile dump requested");
            print_table(&cache, cache::TABLE_DATA_MIRROR);
            0
        },
        Command::DumpDevices => {
            print_table(&cache, cache::TABLE_DEVICE_MBUS);
            0
        },
        Command::DumpPushOps => {
            print_table(&cache, cache::TABLE_PUSH_OPS);
            0
        },
        Command::Set { obis_path, value } => match set_one(&cache, &obis_path, &value) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("set failed: {e}");
                4
            },
        },
        Command::Run => match run_gateway(&cache, &cfg).await {
            Ok(()) => 0,
            Err(e) => {
                error!(error = %e, "gateway stopped with an error");
                e.exit_code()
            },
        },
    }
}

fn rusqlite_store(cfg: &Config) -> rusqlite::Result<SqliteStore> {
    SqliteStore::open(std::path::Path::new(&cfg.storage.sqlite_path))
}

/// Seeds `_Cfg` with the root IP-T/security/serial parameters carried by
/// the bootstrap document (§4.13).
fn seed_from_bootstrap(cache: &Cache, cfg: &Config) {
    let table = cache.table(cache::TABLE_CFG);
    table.insert(
        cache::key([Value::Str("root.ipt.watchdog-minutes".into())]),
        cache::row([("value", Value::U16(cfg.ipt.watchdog_minutes))]),
        None,
    );
    table.insert(
        cache::key([Value::Str("root.ipt.server-id".into())]),
        cache::row([("value", Value::Buffer(cfg.ipt.server_id.clone()))]),
        None,
    );
    table.insert(
        cache::key([Value::Str("root.security.user".into())]),
        cache::row([("value", Value::Str(cfg.security.user.clone()))]),
        None,
    );
    table.insert(
        cache::key([Value::Str("root.push.raster-interval-secs".into())]),
        cache::row([("value", Value::U64(cfg.push.raster_interval.as_secs()))]),
        None,
    );
}

fn clear_all_tables(cache: &Cache) {
    for name in [
        cache::TABLE_CFG,
        cache::TABLE_DEVICE_MBUS,
        cache::TABLE_READOUT,
        cache::TABLE_READOUT_DATA,
        cache::TABLE_DATA_COLLECTOR,
        cache::TABLE_DATA_MIRROR,
        cache::TABLE_PUSH_OPS,
        cache::TABLE_IEC_DEVS,
        cache::TABLE_USER,
        cache::TABLE_PRIVILEGES,
    ] {
        let table = cache.table(name);
        let keys: Vec<_> = {
            let mut out = Vec::new();
            table.for_each(|k, _| out.push(k.clone()));
            out
        };
        for key in keys {
            table.erase(&key, None);
        }
    }
}

fn print_table(cache: &Cache, name: &str) {
    let table = cache.table(name);
    table.for_each(|key, row| {
        println!("{key:?} => {row:?}");
    });
}

fn set_one(cache: &Cache, obis_path: &str, value: &str) -> anyhow::Result<()> {
    let path = segw_rs::obis::ObisPath::from_legacy_text(obis_path)
        .map_err(|e| anyhow::anyhow!("invalid OBIS path {obis_path:?}: {e:?}"))?;
    cache.table(cache::TABLE_CFG).insert(
        cache::key([Value::Str(path.to_legacy_text())]),
        cache::row([("value", Value::Str(value.to_string()))]),
        None,
    );
    Ok(())
}

/// Runs the gateway core: the readout dispatcher and push scheduler run
/// on their own interval loops until interrupted (§4.10/§4.11). The IP-T
/// session dial and the serial LMN readers are driven by the same
/// supervisor but are out of scope for this in-process smoke path; they
/// attach to the cache exactly as `wmbus::pipeline::process_telegram` and
/// `mbus::ScanState` already demonstrate per-frame. The push tick itself
/// logs rather than calling `push::attempt_push`: that call needs a live
/// IP-T transport and a `_PushOps`-row-to-`PushOp` loader, neither of
/// which this in-process smoke path establishes; `push::attempt_push`'s
/// wire behaviour is exercised directly by the push-channel integration
/// test instead.
async fn run_gateway(cache: &Cache, cfg: &Config) -> Result<(), SegwError> {
    info!("gateway starting");
    let mut dispatch_ticker = tokio::time::interval(readout::DEFAULT_INTERVAL);
    let mut push_ticker = tokio::time::interval(cfg.push.raster_interval);

    loop {
        tokio::select! {
            _ = dispatch_ticker.tick() => {
                readout::dispatch_cycle(cache, readout::Profile::FifteenMinutes);
            },
            _ = push_ticker.tick() => {
                info!("push scheduler tick (no live IP-T transport in this path)");
            },
            _ = signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            },
        }
    }
    Ok(())
}
