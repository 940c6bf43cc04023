// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The configuration cache: a multi-table in-memory store with
//! write-through listeners (C7, §4.6).
//!
//! Ten named tables hold every configured and transient object the
//! gateway core operates on. Readers take a shared reference to
//! [`Cache`] and may run concurrently; every table is independently
//! lockable via [`dashmap::DashMap`], so a writer on one table never
//! blocks a reader on another (§5: "concurrent readers allowed,
//! exclusive writer" is per-table, not a single global lock).

pub mod mirror;
pub mod table;

use std::sync::Arc;

use table::{Key, Row, Table, TableEvent};

pub use table::uuid_lite;

/// Names of the ten cache tables (§4.6).
pub const TABLE_CFG: &str = "_Cfg";
pub const TABLE_DEVICE_MBUS: &str = "_DeviceMBUS";
pub const TABLE_READOUT: &str = "_Readout";
pub const TABLE_READOUT_DATA: &str = "_ReadoutData";
pub const TABLE_DATA_COLLECTOR: &str = "_DataCollector";
pub const TABLE_DATA_MIRROR: &str = "_DataMirror";
pub const TABLE_PUSH_OPS: &str = "_PushOps";
pub const TABLE_IEC_DEVS: &str = "_IECDevs";
pub const TABLE_USER: &str = "_User";
pub const TABLE_PRIVILEGES: &str = "_Privileges";

const ALL_TABLES: &[&str] = &[
    TABLE_CFG,
    TABLE_DEVICE_MBUS,
    TABLE_READOUT,
    TABLE_READOUT_DATA,
    TABLE_DATA_COLLECTOR,
    TABLE_DATA_MIRROR,
    TABLE_PUSH_OPS,
    TABLE_IEC_DEVS,
    TABLE_USER,
    TABLE_PRIVILEGES,
];

/// A batch-mutation bracket emitted to listeners before/after a
/// transaction (§4.6: "A transaction bracket ... is emitted to
/// downstream listeners before/after a batch mutation").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionEvent {
    Start,
    Commit,
    Rollback,
}

/// The configuration cache: named tables plus a transaction-bracket
/// broadcast channel shared by every listener (the relational mirror,
/// first and foremost — C8).
pub struct Cache {
    tables: std::collections::HashMap<&'static str, Table>,
    tx_listeners: std::sync::RwLock<Vec<Arc<dyn Fn(TransactionEvent) + Send + Sync>>>,
}

impl Cache {
    pub fn new() -> Self {
        let tables = ALL_TABLES.iter().map(|&name| (name, Table::new(name))).collect();
        Self { tables, tx_listeners: std::sync::RwLock::new(Vec::new()) }
    }

    pub fn table(&self, name: &str) -> &Table {
        self.tables.get(name).unwrap_or_else(|| panic!("unknown cache table {name:?}"))
    }

    /// Registers a listener on every table, matching the relational
    /// mirror's need to observe all ten tables uniformly.
    pub fn subscribe_all(&self, listener: Arc<dyn Fn(TableEvent) + Send + Sync>) {
        for table in self.tables.values() {
            table.subscribe(listener.clone());
        }
    }

    pub fn subscribe_transactions(&self, listener: Arc<dyn Fn(TransactionEvent) + Send + Sync>) {
        self.tx_listeners.write().expect("lock poisoned").push(listener);
    }

    fn notify_tx(&self, event: TransactionEvent) {
        for listener in self.tx_listeners.read().expect("lock poisoned").iter() {
            listener(event);
        }
    }

    /// Runs `f` inside a transaction bracket: emits [`TransactionEvent::Start`]
    /// before and [`TransactionEvent::Commit`] after. If `f` returns `Err`,
    /// emits [`TransactionEvent::Rollback`] instead of `Commit` (the mutations
    /// already applied to in-memory tables are NOT rolled back in-process —
    /// only the mirror is told to roll back its SQL transaction, per §4.7:
    /// "Transactions from C7 are mapped one-to-one to SQL transactions").
    pub fn transaction<T, E>(&self, f: impl FnOnce(&Self) -> Result<T, E>) -> Result<T, E> {
        self.notify_tx(TransactionEvent::Start);
        match f(self) {
            Ok(v) => {
                self.notify_tx(TransactionEvent::Commit);
                Ok(v)
            },
            Err(e) => {
                self.notify_tx(TransactionEvent::Rollback);
                Err(e)
            },
        }
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

/// Convenience re-exports for callers building row keys/columns.
pub fn key(values: impl IntoIterator<Item = crate::value::Value>) -> Key {
    values.into_iter().collect()
}

pub fn row(columns: impl IntoIterator<Item = (&'static str, crate::value::Value)>) -> Row {
    columns.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn every_named_table_is_reachable() {
        let cache = Cache::new();
        for name in ALL_TABLES {
            assert_eq!(cache.table(name).name(), *name);
        }
    }

    #[test]
    fn transaction_emits_start_then_commit_on_success() {
        let cache = Cache::new();
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let events_clone = events.clone();
        cache.subscribe_transactions(Arc::new(move |e| events_clone.lock().expect("lock").push(e)));

        let result: Result<(), ()> = cache.transaction(|c| {
            c.table(TABLE_CFG).insert(key([Value::U32(1)]), row([]), None);
            Ok(())
        });
        assert!(result.is_ok());
        let seen = events.lock().expect("lock");
        assert_eq!(*seen, vec![TransactionEvent::Start, TransactionEvent::Commit]);
    }

    #[test]
    fn transaction_emits_rollback_on_failure() {
        let cache = Cache::new();
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let events_clone = events.clone();
        cache.subscribe_transactions(Arc::new(move |e| events_clone.lock().expect("lock").push(e)));

        let result: Result<(), &'static str> = cache.transaction(|_| Err("boom"));
        assert_eq!(result, Err("boom"));
        let seen = events.lock().expect("lock");
        assert_eq!(*seen, vec![TransactionEvent::Start, TransactionEvent::Rollback]);
    }

    #[test]
    fn subscribe_all_sees_events_from_every_table() {
        let cache = Cache::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        cache.subscribe_all(Arc::new(move |e| seen_clone.lock().expect("lock").push(e)));

        cache.table(TABLE_CFG).insert(key([Value::U32(1)]), row([]), None);
        cache.table(TABLE_USER).insert(key([Value::U32(2)]), row([]), None);
        assert_eq!(seen.lock().expect("lock").len(), 2);
    }
}
