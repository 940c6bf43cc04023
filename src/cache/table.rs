// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! A single named table of the configuration cache (C7, §4.6).
//!
//! Rows are keyed by a composite key (the table's primary-key column
//! values, in declared order) and carry a column map. This mirrors the
//! teacher's `DashMap<u32, _>` concurrent-map-of-state idiom
//! (`client/client.rs`), generalized from a single `u32` ITT key to an
//! arbitrary multi-column key.

use std::sync::Arc;

use dashmap::DashMap;

use crate::value::Value;

/// Composite primary key: the table's key-column values in declared order.
pub type Key = Vec<Value>;
/// A row's non-key columns, by name.
pub type Row = std::collections::BTreeMap<String, Value>;

/// A mutation observed by a [`super::CacheListener`], carrying the
/// originating session's source tag so the listener can suppress echo
/// back to the session that caused it (§4.6: "takes a source tag ...
/// to suppress echo on listeners").
#[derive(Debug, Clone)]
pub enum TableEvent {
    Insert { table: &'static str, key: Key, row: Row, source: Option<uuid_lite::Uuid> },
    Update { table: &'static str, key: Key, row: Row, source: Option<uuid_lite::Uuid> },
    Erase { table: &'static str, key: Key, source: Option<uuid_lite::Uuid> },
}

pub use crate::ipt::session::uuid_lite;

/// One named table: insert, merge (upsert), modify-column, erase, loop,
/// find-all-by-column (§4.6).
pub struct Table {
    name: &'static str,
    rows: DashMap<Key, Row>,
    listeners: std::sync::RwLock<Vec<Arc<dyn Fn(TableEvent) + Send + Sync>>>,
}

impl Table {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            rows: DashMap::new(),
            listeners: std::sync::RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn subscribe(&self, listener: Arc<dyn Fn(TableEvent) + Send + Sync>) {
        self.listeners.write().expect("lock poisoned").push(listener);
    }

    fn notify(&self, event: TableEvent) {
        for listener in self.listeners.read().expect("lock poisoned").iter() {
            listener(event.clone());
        }
    }

    /// Inserts a brand-new row. Overwrites silently if the key already
    /// exists (use [`Table::merge`] when upsert semantics are wanted).
    pub fn insert(&self, key: Key, row: Row, source: Option<uuid_lite::Uuid>) {
        self.rows.insert(key.clone(), row.clone());
        self.notify(TableEvent::Insert { table: self.name, key, row, source });
    }

    /// Upsert: inserts if absent, otherwise merges columns into the
    /// existing row (new columns win on conflict).
    pub fn merge(&self, key: Key, columns: Row, source: Option<uuid_lite::Uuid>) {
        let existed = self.rows.contains_key(&key);
        let merged = {
            let mut entry = self.rows.entry(key.clone()).or_default();
            for (col, val) in columns {
                entry.insert(col, val);
            }
            entry.clone()
        };
        if existed {
            self.notify(TableEvent::Update { table: self.name, key, row: merged, source });
        } else {
            self.notify(TableEvent::Insert { table: self.name, key, row: merged, source });
        }
    }

    /// Sets a single column in place. No-op (does not create a row) if
    /// `key` is absent.
    pub fn modify_column(
        &self,
        key: &Key,
        column: &str,
        value: Value,
        source: Option<uuid_lite::Uuid>,
    ) -> bool {
        let Some(mut row) = self.rows.get_mut(key) else {
            return false;
        };
        row.insert(column.to_string(), value);
        let snapshot = row.clone();
        drop(row);
        self.notify(TableEvent::Update {
            table: self.name,
            key: key.clone(),
            row: snapshot,
            source,
        });
        true
    }

    pub fn erase(&self, key: &Key, source: Option<uuid_lite::Uuid>) -> bool {
        if self.rows.remove(key).is_some() {
            self.notify(TableEvent::Erase { table: self.name, key: key.clone(), source });
            true
        } else {
            false
        }
    }

    pub fn get(&self, key: &Key) -> Option<Row> {
        self.rows.get(key).map(|r| r.clone())
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.rows.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Iterates every row (the "loop" operation of §4.6).
    pub fn for_each(&self, mut f: impl FnMut(&Key, &Row)) {
        for entry in self.rows.iter() {
            f(entry.key(), entry.value());
        }
    }

    /// Returns every `(key, row)` pair whose `column` equals `value`.
    pub fn find_all_by_column(&self, column: &str, value: &Value) -> Vec<(Key, Row)> {
        self.rows
            .iter()
            .filter(|entry| entry.value().get(column) == Some(value))
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}
