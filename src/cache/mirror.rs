// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The relational mirror: a write-through SQL shadow of the
//! configuration cache (C8, §4.7).
//!
//! Table names mirror the cache's with a one-letter prefix difference
//! (`_Cfg` in the cache, `TCfg` in SQL). On start every cache table is
//! bulk-loaded from its SQL counterpart; from then on cache mutations
//! are pushed through via [`Cache::subscribe_all`] and translated to
//! parametrised SQL, with every complex value serialised textually
//! alongside its type tag (§3, §6) so it restores symmetrically.
//!
//! `rusqlite` has no teacher precedent (the iSCSI target has no SQL
//! surface); it's driven through `tokio::task::spawn_blocking`, the
//! same pattern the teacher uses to keep blocking work off the async
//! reactor (`client/pool_sessions.rs`).

use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{error, warn};

use crate::{
    cache::{
        table::{Key, Row, TableEvent},
        Cache,
        TransactionEvent,
    },
    value::{TypeTag, Value},
};

/// Every table the mirror knows how to shadow, cache name first.
const TABLE_MAP: &[(&str, &str)] = &[
    ("_Cfg", "TCfg"),
    ("_DeviceMBUS", "TDeviceMBUS"),
    ("_Readout", "TReadout"),
    ("_ReadoutData", "TReadoutData"),
    ("_DataCollector", "TDataCollector"),
    ("_DataMirror", "TDataMirror"),
    ("_PushOps", "TPushOps"),
    ("_IECDevs", "TIECDevs"),
    ("_User", "TUser"),
    ("_Privileges", "TPrivileges"),
];

fn sql_table_name(cache_table: &str) -> &'static str {
    TABLE_MAP
        .iter()
        .find(|(cache, _)| *cache == cache_table)
        .map(|(_, sql)| *sql)
        .unwrap_or("TUnknown")
}

/// Abstracts the SQL backend so the mirror's write-through logic can be
/// tested against an in-memory fake without touching a real file.
pub trait RelationalStore: Send + Sync {
    fn init_schema(&self) -> rusqlite::Result<()>;
    fn load_table(&self, sql_table: &str) -> rusqlite::Result<Vec<(Key, Row)>>;
    fn upsert(&self, sql_table: &str, key: &Key, row: &Row) -> rusqlite::Result<()>;
    fn delete(&self, sql_table: &str, key: &Key) -> rusqlite::Result<()>;
    fn append_op_log(&self, severity: u8, msg_id: &str, text: &str, srv_id: Option<&str>) -> rusqlite::Result<()>;
    fn begin(&self) -> rusqlite::Result<()>;
    fn commit(&self) -> rusqlite::Result<()>;
    fn rollback(&self) -> rusqlite::Result<()>;
}

/// `rusqlite`-backed store. Columns beyond the key are stored generically
/// as `name TEXT, value TEXT, type_tag INTEGER` rows keyed by the owning
/// table row's primary key, since cache tables don't have a fixed schema
/// known at compile time (§6: "serialising complex values to their
/// textual form together with a type tag").
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &std::path::Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Ok(Self { conn: Mutex::new(Connection::open_in_memory()?) })
    }

    fn key_text(key: &Key) -> String {
        key.iter().map(Value::to_text).collect::<Vec<_>>().join("\u{1f}")
    }
}

impl RelationalStore for SqliteStore {
    fn init_schema(&self) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("lock poisoned");
        for (_, sql_table) in TABLE_MAP {
            conn.execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS {sql_table} (
                        row_key TEXT NOT NULL,
                        col_name TEXT NOT NULL,
                        col_value TEXT NOT NULL,
                        type_tag INTEGER NOT NULL,
                        PRIMARY KEY (row_key, col_name)
                    )"
                ),
                [],
            )?;
        }
        conn.execute(
            "CREATE TABLE IF NOT EXISTS TOpLog (
                rowid INTEGER PRIMARY KEY AUTOINCREMENT,
                ts INTEGER NOT NULL,
                severity INTEGER NOT NULL,
                msg_id TEXT NOT NULL,
                text TEXT NOT NULL,
                srv_id TEXT
            )",
            [],
        )?;
        Ok(())
    }

    fn load_table(&self, sql_table: &str) -> rusqlite::Result<Vec<(Key, Row)>> {
        let conn = self.conn.lock().expect("lock poisoned");
        let mut stmt =
            conn.prepare(&format!("SELECT row_key, col_name, col_value, type_tag FROM {sql_table}"))?;
        let mut rows: std::collections::HashMap<String, Row> = std::collections::HashMap::new();
        let mut iter = stmt.query([])?;
        while let Some(sql_row) = iter.next()? {
            let row_key: String = sql_row.get(0)?;
            let col_name: String = sql_row.get(1)?;
            let col_value: String = sql_row.get(2)?;
            let type_tag: u32 = sql_row.get(3)?;
            let tag = tag_from_u32(type_tag);
            let value = Value::from_text(tag, &col_value)
                .unwrap_or_else(|_| Value::Str(col_value.clone()));
            rows.entry(row_key).or_default().insert(col_name, value);
        }
        Ok(rows
            .into_iter()
            .map(|(row_key, row)| (vec![Value::Str(row_key)], row))
            .collect())
    }

    fn upsert(&self, sql_table: &str, key: &Key, row: &Row) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("lock poisoned");
        let row_key = Self::key_text(key);
        for (col, value) in row {
            conn.execute(
                &format!(
                    "INSERT INTO {sql_table} (row_key, col_name, col_value, type_tag)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(row_key, col_name) DO UPDATE SET col_value = excluded.col_value, type_tag = excluded.type_tag"
                ),
                rusqlite::params![row_key, col, value.to_text(), value.type_tag() as u32],
            )?;
        }
        Ok(())
    }

    fn delete(&self, sql_table: &str, key: &Key) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("lock poisoned");
        let row_key = Self::key_text(key);
        conn.execute(&format!("DELETE FROM {sql_table} WHERE row_key = ?1"), [row_key])?;
        Ok(())
    }

    fn append_op_log(
        &self,
        severity: u8,
        msg_id: &str,
        text: &str,
        srv_id: Option<&str>,
    ) -> rusqlite::Result<()> {
        let conn = self.conn.lock().expect("lock poisoned");
        conn.execute(
            "INSERT INTO TOpLog (ts, severity, msg_id, text, srv_id) VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![now_unix(), severity, msg_id, text, srv_id],
        )?;
        Ok(())
    }

    fn begin(&self) -> rusqlite::Result<()> {
        self.conn.lock().expect("lock poisoned").execute("BEGIN", [])?;
        Ok(())
    }

    fn commit(&self) -> rusqlite::Result<()> {
        self.conn.lock().expect("lock poisoned").execute("COMMIT", [])?;
        Ok(())
    }

    fn rollback(&self) -> rusqlite::Result<()> {
        self.conn.lock().expect("lock poisoned").execute("ROLLBACK", [])?;
        Ok(())
    }
}

fn tag_from_u32(n: u32) -> TypeTag {
    match n {
        1 => TypeTag::Bool,
        2 => TypeTag::I8,
        3 => TypeTag::I16,
        4 => TypeTag::I32,
        5 => TypeTag::I64,
        6 => TypeTag::U8,
        7 => TypeTag::U16,
        8 => TypeTag::U32,
        9 => TypeTag::U64,
        11 => TypeTag::Buffer,
        12 => TypeTag::Timestamp,
        13 => TypeTag::Duration,
        14 => TypeTag::Aes128Key,
        15 => TypeTag::Endpoint,
        16 => TypeTag::Mac,
        _ => TypeTag::Str,
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Wires a [`RelationalStore`] to a [`Cache`] as a write-through listener
/// and performs the initial bulk load (§4.7).
///
/// Blocking SQL calls are dispatched via `tokio::task::spawn_blocking`
/// from the listener closure so cache mutations (which may run on any
/// task) never block the async reactor on file I/O.
pub struct Mirror<S: RelationalStore + 'static> {
    store: Arc<S>,
}

impl<S: RelationalStore + 'static> Mirror<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Loads every cache table from its SQL counterpart. Call once at
    /// startup, before [`Mirror::attach`].
    pub async fn bulk_load(&self, cache: &Cache) -> rusqlite::Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.init_schema())
            .await
            .expect("blocking task panicked")?;

        for (cache_table, sql_table) in TABLE_MAP {
            let store = self.store.clone();
            let rows = tokio::task::spawn_blocking(move || store.load_table(sql_table))
                .await
                .expect("blocking task panicked")?;
            let table = cache.table(cache_table);
            for (key, row) in rows {
                table.insert(key, row, None);
            }
        }
        Ok(())
    }

    /// Subscribes the mirror to every cache table and to transaction
    /// brackets, translating each event to SQL. Failures log and
    /// continue (§4.7: "Failures log and continue").
    pub fn attach(&self, cache: &Cache) {
        let store = self.store.clone();
        cache.subscribe_all(Arc::new(move |event: TableEvent| {
            let store = store.clone();
            tokio::spawn(async move {
                let result = tokio::task::spawn_blocking(move || apply_table_event(&store, &event))
                    .await
                    .expect("blocking task panicked");
                if let Err(e) = result {
                    error!(error = %e, "relational mirror write-through failed");
                }
            });
        }));

        let store = self.store.clone();
        cache.subscribe_transactions(Arc::new(move |event: TransactionEvent| {
            let store = store.clone();
            tokio::spawn(async move {
                let result = tokio::task::spawn_blocking(move || match event {
                    TransactionEvent::Start => store.begin(),
                    TransactionEvent::Commit => store.commit(),
                    TransactionEvent::Rollback => store.rollback(),
                })
                .await
                .expect("blocking task panicked");
                if let Err(e) = result {
                    warn!(error = %e, "relational mirror transaction bracket failed");
                }
            });
        }));
    }

    /// Appends a row to `TOpLog` (§3 elaboration: status-word writes,
    /// login attempts and `SET_PROC_PARAMETER` mutations all funnel
    /// through here as a plain cache-event listener, not a first-class
    /// cache table).
    pub async fn log_operation(
        &self,
        severity: u8,
        msg_id: impl Into<String>,
        text: impl Into<String>,
        srv_id: Option<String>,
    ) {
        let store = self.store.clone();
        let msg_id = msg_id.into();
        let text = text.into();
        let result = tokio::task::spawn_blocking(move || {
            store.append_op_log(severity, &msg_id, &text, srv_id.as_deref())
        })
        .await
        .expect("blocking task panicked");
        if let Err(e) = result {
            error!(error = %e, "failed to append TOpLog row");
        }
    }
}

fn apply_table_event<S: RelationalStore>(store: &S, event: &TableEvent) -> rusqlite::Result<()> {
    match event {
        TableEvent::Insert { table, key, row, .. } | TableEvent::Update { table, key, row, .. } => {
            store.upsert(sql_table_name(table), key, row)
        },
        TableEvent::Erase { table, key, .. } => {
            // A missing SQL row on delete is not an error; degrade silently.
            store.delete(sql_table_name(table), key)
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{key, row};

    #[tokio::test]
    async fn bulk_load_then_attach_round_trips_a_row() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("open"));
        let cache = Cache::new();
        let mirror = Mirror::new(store.clone());
        mirror.bulk_load(&cache).await.expect("bulk load");
        mirror.attach(&cache);

        cache
            .table("_Cfg")
            .insert(key([Value::Str("root".into())]), row([("val", Value::U32(42))]), None);

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let loaded = store.load_table("TCfg").expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].1.get("val"), Some(&Value::U32(42)));
    }

    #[tokio::test]
    async fn op_log_row_is_appended() {
        let store = Arc::new(SqliteStore::open_in_memory().expect("open"));
        store.init_schema().expect("schema");
        let mirror = Mirror::new(store.clone());
        mirror.log_operation(1, "LOGIN", "public login accepted", None).await;

        let conn = store.conn.lock().expect("lock");
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM TOpLog", [], |r| r.get(0))
            .expect("count");
        assert_eq!(count, 1);
    }
}
