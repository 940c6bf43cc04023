// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Periodic readout dispatcher: drains `_Readout`/`_ReadoutData` rows
//! into per-profile meta/storage rows (C11, §4.10).

use std::time::Duration;

use tracing::debug;

use crate::{
    cache::{self, Cache},
    value::Value,
};

/// Default dispatch interval (§4.10: "Periodic (configurable, default
/// 122 s)").
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(122);

/// Profile granularity, used both to quantise timestamps into
/// time-index buckets (P4) and to clamp push rasterisation (§4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Profile {
    OneMinute,
    FifteenMinutes,
    SixtyMinutes,
    TwentyFourHours,
    OneMonth,
    OneYear,
}

impl Profile {
    pub fn granularity_secs(self) -> i64 {
        match self {
            Self::OneMinute => 60,
            Self::FifteenMinutes => 900,
            Self::SixtyMinutes => 3600,
            Self::TwentyFourHours => 86_400,
            Self::OneMonth => 30 * 86_400,
            Self::OneYear => 365 * 86_400,
        }
    }
}

/// Quantises a Unix timestamp into its time-index bucket for `profile`
/// (§3 time-index table, property P4).
pub fn time_index(profile: Profile, unix_seconds: i64) -> u64 {
    (unix_seconds.div_euclid(profile.granularity_secs())) as u64
}

pub fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// One dispatch cycle (§4.10): for each `_Readout` row, find active
/// `_DataCollector` rows for the same `srv_id`, merge a meta row into
/// `_DataCollector` and a storage row into `_DataMirror` per matching
/// `_ReadoutData` entry, then delete the consumed readout rows.
pub fn dispatch_cycle(cache: &Cache, profile: Profile) {
    let readout = cache.table(cache::TABLE_READOUT);
    let readout_data = cache.table(cache::TABLE_READOUT_DATA);
    let collectors = cache.table(cache::TABLE_DATA_COLLECTOR);
    let mirror = cache.table(cache::TABLE_DATA_MIRROR);

    let mut consumed = Vec::new();
    readout.for_each(|key, row| {
        let Some(Value::Buffer(srv_id)) = row.get("srv_id") else {
            return;
        };
        let Some(Value::Timestamp(ts)) = row.get("timestamp") else {
            return;
        };
        let bucket = time_index(profile, *ts);

        let active_collectors = collectors.find_all_by_column("active", &Value::Bool(true));
        for (collector_key, collector_row) in &active_collectors {
            if collector_key.first() != Some(&Value::Buffer(srv_id.clone())) {
                continue;
            }
            let Some(mirror_obis) = collector_row.get("mirror_obis") else {
                continue;
            };

            collectors.modify_column(collector_key, "time_index", Value::U64(bucket), None);
            collectors.modify_column(collector_key, "act_time", Value::I64(*ts), None);

            let matching: Vec<_> = readout_data
                .find_all_by_column("obis", mirror_obis)
                .into_iter()
                .filter(|(data_key, _)| data_key.first() == Some(&Value::Buffer(srv_id.clone())))
                .collect();

            for (_, mut data_row) in matching {
                data_row.insert("srv_id".to_string(), Value::Buffer(srv_id.clone()));
                data_row.insert("time_index".to_string(), Value::U64(bucket));
                let storage_key = cache::key([
                    Value::Buffer(srv_id.clone()),
                    Value::U64(bucket),
                    data_row.get("obis").cloned().unwrap_or(Value::Str(String::new())),
                ]);
                mirror.merge(storage_key, data_row, None);
            }
        }
        consumed.push(key.clone());
    });

    for key in consumed {
        readout.erase(&key, None);
    }

    debug!(profile = ?profile, "readout dispatch cycle complete");
}

/// Trims each profile's storage table down to `max_size` most recent
/// time-index rows per `srv_id` (§4.10: "an hourly limiter task trims
/// oldest rows past N").
pub fn trim_to_max_size(cache: &Cache, srv_id: &[u8], max_size: usize) {
    let mirror = cache.table(cache::TABLE_DATA_MIRROR);
    let mut rows = mirror.find_all_by_column("srv_id", &Value::Buffer(srv_id.to_vec()));
    if rows.len() <= max_size {
        return;
    }
    rows.sort_by_key(|(key, _)| key.get(1).and_then(Value::as_u64).unwrap_or(0));
    let drop_count = rows.len() - max_size;
    for (key, _) in &rows[..drop_count] {
        mirror.erase(key, None);
    }
}
