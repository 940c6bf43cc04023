// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Dispatches SML message bodies to handlers by body code and produces
//! response envelopes (C5, §4.5).

use crate::{
    cache::{self, Cache},
    obis::{roots, Obis, ObisPath},
    sml::messages::{
        AttentionCode, ListEntry, MessageBody, ProcParamTree, ProfileEntry,
    },
    value::Value,
};

/// Credentials and accept-all switch consulted by `PUBLIC_OPEN_REQ`
/// (§4.5: "Credentials check; accept-all switch bypasses").
pub struct SecurityPolicy {
    pub accept_all: bool,
    pub username: String,
    pub password: String,
}

impl SecurityPolicy {
    fn accepts(&self, username: &str, password: &str) -> bool {
        self.accept_all || (username == self.username && password == self.password)
    }
}

fn cfg_key(path: &ObisPath) -> cache::table::Key {
    path.0.iter().map(|o| Value::Str(o.to_hex_dashed())).collect()
}

fn obis_from_segment(v: &Value) -> Option<Obis> {
    match v {
        Value::Str(s) => s.parse().ok(),
        _ => None,
    }
}

/// Walks the `_Cfg` table and rebuilds the subtree rooted at `path`
/// (§4.5: "Resolve OBIS path in cache; serialise subtree with
/// child-list tree nodes").
fn resolve_subtree(cache: &Cache, path: &ObisPath) -> ProcParamTree {
    let table = cache.table(cache::TABLE_CFG);
    let self_key = cfg_key(path);
    let value = table.get(&self_key).and_then(|row| row.get("value").cloned());

    let mut children = Vec::new();
    table.for_each(|key, _row| {
        if key.len() == path.0.len() + 1 && key[..path.0.len()] == self_key[..] {
            if let Some(last) = key.last().and_then(obis_from_segment) {
                let child_path = path.clone().push(last);
                children.push(resolve_subtree(cache, &child_path));
            }
        }
    });
    children.sort_by(|a, b| a.parameter_name.to_legacy_text().cmp(&b.parameter_name.to_legacy_text()));

    if children.is_empty() {
        ProcParamTree::leaf(path.clone(), value.unwrap_or(Value::Bool(false)))
    } else {
        ProcParamTree::branch(path.clone(), children)
    }
}

/// Writes one leaf value under `path`, running the special-case side
/// effects named by §4.5 ("special cases for IPT params, sensor
/// params, data collector, push ops, broker, IEC, m-bus class,
/// reboot"). Every write lands in `_Cfg` so `GET_PROC_PARAMETER_REQ`
/// always reads back what it just wrote; special roots additionally
/// mirror the value into the specialized table the rest of the system
/// (C9-C12) actually reads its working set from.
fn write_parameter(cache: &Cache, path: &ObisPath, value: Value, source: Option<cache::uuid_lite::Uuid>) {
    cache.table(cache::TABLE_CFG).merge(cfg_key(path), cache::row([("value", value.clone())]), source);

    let Some(root) = path.root() else { return };
    let mirror_table = if root.matches(&roots::ROOT_PUSH_OPERATIONS) {
        Some(cache::TABLE_PUSH_OPS)
    } else if root.matches(&roots::ROOT_DATA_COLLECTOR) {
        Some(cache::TABLE_DATA_COLLECTOR)
    } else if root.matches(&roots::CLASS_MBUS) {
        Some(cache::TABLE_DEVICE_MBUS)
    } else if root.matches(&roots::IF_1107) {
        Some(cache::TABLE_IEC_DEVS)
    } else {
        None
    };
    if let Some(table) = mirror_table {
        cache.table(table).merge(cfg_key(path), cache::row([("value", value)]), source);
    }
}

fn profile_range(
    cache: &Cache,
    path: &ObisPath,
    start: i64,
    end: i64,
) -> Vec<ProfileEntry> {
    let meta = cache.table(cache::TABLE_DATA_COLLECTOR);
    let storage = cache.table(cache::TABLE_DATA_MIRROR);
    let mut entries = Vec::new();
    meta.for_each(|key, row| {
        if key[..path.0.len().min(key.len())] != cfg_key(path)[..path.0.len().min(key.len())] {
            return;
        }
        let Some(Value::U64(time_index)) = row.get("time_index") else {
            return;
        };
        let Some(Value::I64(act_time)) = row.get("act_time") else {
            return;
        };
        if *act_time < start || *act_time > end {
            return;
        }
        let val_time = row.get("val_time").and_then(Value::as_u64).unwrap_or(*time_index) as i64;
        let status = row.get("status").and_then(Value::as_u64).unwrap_or(0);

        let mut values = Vec::new();
        storage.for_each(|data_key, data_row| {
            if data_key.first() == key.first() && data_row.get("time_index") == Some(&Value::U64(*time_index)) {
                if let (Some(obis_v), Some(val), Some(scaler), Some(unit)) = (
                    data_row.get("obis"),
                    data_row.get("value"),
                    data_row.get("scaler"),
                    data_row.get("unit"),
                ) {
                    if let Value::Str(obis_text) = obis_v {
                        if let Ok(obis_path) = ObisPath::from_legacy_text(obis_text) {
                            let scaler = scaler.as_u64().unwrap_or(0) as i8;
                            let unit = unit.as_u64().unwrap_or(0) as u8;
                            values.push((obis_path, val.clone(), scaler, unit));
                        }
                    }
                }
            }
        });

        entries.push(ProfileEntry { time_index: *time_index, act_time: *act_time, val_time, status, values });
    });
    entries.sort_by_key(|e| e.time_index);
    entries
}

fn current_data_record(cache: &Cache, server_id: &[u8]) -> Vec<ListEntry> {
    let readout_data = cache.table(cache::TABLE_READOUT_DATA);
    let mut entries = Vec::new();
    readout_data.for_each(|key, row| {
        if key.first() != Some(&Value::Buffer(server_id.to_vec())) {
            return;
        }
        if let (Some(obis_v), Some(val), Some(scaler), Some(unit)) = (
            row.get("obis"),
            row.get("value"),
            row.get("scaler"),
            row.get("unit"),
        ) {
            if let Value::Str(obis_text) = obis_v {
                if let Ok(obis) = ObisPath::from_legacy_text(obis_text) {
                    entries.push(ListEntry {
                        obis,
                        value: val.clone(),
                        scaler: scaler.as_u64().unwrap_or(0) as i8,
                        unit: unit.as_u64().unwrap_or(0) as u8,
                    });
                }
            }
        }
    });
    entries
}

/// Dispatches one decoded request body and returns the response body to
/// encode back onto the session's outgoing SML file.
pub fn dispatch(
    cache: &Cache,
    policy: &SecurityPolicy,
    source: Option<cache::uuid_lite::Uuid>,
    req: MessageBody,
) -> MessageBody {
    match req {
        MessageBody::OpenReq { codepage, client_id, req_file_id, server_id, username, password } => {
            if !policy.accepts(&username, &password) {
                return attention(server_id, AttentionCode::NotAuthorized);
            }
            let server_id = if server_id.is_empty() {
                fresh_server_id()
            } else {
                server_id
            };
            MessageBody::OpenRes { codepage, client_id, req_file_id, server_id }
        },
        MessageBody::GetProcParameterReq { server_id, username, password, parameter_tree_path } => {
            if !policy.accepts(&username, &password) {
                return attention(server_id, AttentionCode::NotAuthorized);
            }
            let tree = resolve_subtree(cache, &parameter_tree_path);
            MessageBody::GetProcParameterRes { server_id, parameter_tree_path, parameter_tree: tree }
        },
        MessageBody::SetProcParameterReq {
            server_id,
            username,
            password,
            parameter_tree_path,
            value,
        } => {
            if !policy.accepts(&username, &password) {
                return attention(server_id, AttentionCode::NotAuthorized);
            }
            if parameter_tree_path.0.is_empty() {
                return attention(server_id, AttentionCode::NotExecuted);
            }
            if parameter_tree_path.root().is_some_and(|r| r.matches(&roots::OBIS_REBOOT)) {
                return reboot(server_id);
            }
            write_parameter(cache, &parameter_tree_path, value, source);
            MessageBody::AttentionRes {
                server_id,
                code: AttentionCode::Ok,
                message: code_message(AttentionCode::Ok),
            }
        },
        MessageBody::GetProfileListReq {
            server_id,
            username,
            password,
            parameter_tree_path,
            start,
            end,
        } => {
            if !policy.accepts(&username, &password) {
                return attention(server_id, AttentionCode::NotAuthorized);
            }
            let entries = profile_range(cache, &parameter_tree_path, start, end);
            MessageBody::GetProfileListRes { server_id, parameter_tree_path, entries }
        },
        MessageBody::GetListReq { server_id, username, password, list_name } => {
            if !policy.accepts(&username, &password) {
                return attention(server_id, AttentionCode::NotAuthorized);
            }
            let entries = current_data_record(cache, &server_id);
            let act_sensor_time = crate::readout::now_unix();
            MessageBody::GetListRes { server_id, list_name, act_sensor_time, entries }
        },
        MessageBody::CloseReq => MessageBody::CloseRes,
        other => attention(server_id_of(&other), AttentionCode::NotExecuted),
    }
}

fn code_message(code: AttentionCode) -> String {
    code.message().to_string()
}

fn attention(server_id: Vec<u8>, code: AttentionCode) -> MessageBody {
    MessageBody::AttentionRes { server_id, code, message: code_message(code) }
}

/// `SET_PROC_PARAMETER_REQ` at `OBIS_REBOOT` (§8-S6): on a desktop/CI
/// build there's nothing to reboot into, so it's refused without
/// touching the cache; the embedded build schedules the reboot and
/// acknowledges.
#[cfg(not(feature = "embedded"))]
fn reboot(server_id: Vec<u8>) -> MessageBody {
    attention(server_id, AttentionCode::NotExecuted)
}

#[cfg(feature = "embedded")]
fn reboot(server_id: Vec<u8>) -> MessageBody {
    tracing::warn!("reboot requested via SET_PROC_PARAMETER_REQ");
    attention(server_id, AttentionCode::Ok)
}

fn server_id_of(body: &MessageBody) -> Vec<u8> {
    match body {
        MessageBody::OpenRes { server_id, .. }
        | MessageBody::GetProcParameterRes { server_id, .. }
        | MessageBody::GetProfileListRes { server_id, .. }
        | MessageBody::GetListRes { server_id, .. }
        | MessageBody::AttentionRes { server_id, .. } => server_id.clone(),
        _ => Vec::new(),
    }
}

fn fresh_server_id() -> Vec<u8> {
    let uuid = cache::uuid_lite::Uuid::new_v4();
    let mut id = vec![0x05];
    id.extend_from_slice(&format!("{uuid:?}").into_bytes()[..8]);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sml::messages::MessageBody;

    fn open_policy() -> SecurityPolicy {
        SecurityPolicy { accept_all: true, username: String::new(), password: String::new() }
    }

    #[test]
    fn open_req_with_accept_all_assigns_fresh_server_id() {
        let cache = Cache::new();
        let req = MessageBody::OpenReq {
            codepage: None,
            client_id: b"c".to_vec(),
            req_file_id: b"f".to_vec(),
            server_id: vec![],
            username: "anyone".into(),
            password: "anyone".into(),
        };
        let res = dispatch(&cache, &open_policy(), None, req);
        match res {
            MessageBody::OpenRes { server_id, .. } => assert!(!server_id.is_empty()),
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn open_req_rejected_without_accept_all() {
        let cache = Cache::new();
        let policy = SecurityPolicy { accept_all: false, username: "op".into(), password: "op".into() };
        let req = MessageBody::OpenReq {
            codepage: None,
            client_id: b"c".to_vec(),
            req_file_id: b"f".to_vec(),
            server_id: vec![1],
            username: "wrong".into(),
            password: "wrong".into(),
        };
        let res = dispatch(&cache, &policy, None, req);
        assert!(matches!(
            res,
            MessageBody::AttentionRes { code: AttentionCode::NotAuthorized, .. }
        ));
    }

    #[test]
    fn set_then_get_proc_parameter_round_trips_through_cache() {
        let cache = Cache::new();
        let path = ObisPath::new().push(roots::ROOT_PUSH_OPERATIONS);
        let set_req = MessageBody::SetProcParameterReq {
            server_id: vec![1],
            username: String::new(),
            password: String::new(),
            parameter_tree_path: path.clone(),
            value: Value::U32(900),
        };
        let set_res = dispatch(&cache, &open_policy(), None, set_req);
        assert!(matches!(set_res, MessageBody::AttentionRes { code: AttentionCode::Ok, .. }));

        let get_req = MessageBody::GetProcParameterReq {
            server_id: vec![1],
            username: String::new(),
            password: String::new(),
            parameter_tree_path: path.clone(),
        };
        let get_res = dispatch(&cache, &open_policy(), None, get_req);
        match get_res {
            MessageBody::GetProcParameterRes { parameter_tree, .. } => {
                assert_eq!(parameter_tree.value, Some(Value::U32(900)));
            },
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn close_req_gets_close_res() {
        let cache = Cache::new();
        let res = dispatch(&cache, &open_policy(), None, MessageBody::CloseReq);
        assert!(matches!(res, MessageBody::CloseRes));
    }

    /// S6: on a non-embedded build, reboot is refused and the cache is
    /// untouched.
    #[test]
    fn reboot_is_refused_and_does_not_mutate_cache_off_embedded() {
        let cache = Cache::new();
        let path = ObisPath::new().push(roots::OBIS_REBOOT);
        let req = MessageBody::SetProcParameterReq {
            server_id: vec![1],
            username: String::new(),
            password: String::new(),
            parameter_tree_path: path,
            value: Value::Bool(true),
        };
        let res = dispatch(&cache, &open_policy(), None, req);
        assert!(matches!(res, MessageBody::AttentionRes { code: AttentionCode::NotExecuted, .. }));
        assert_eq!(cache.table(cache::TABLE_CFG).len(), 0);
    }
}
