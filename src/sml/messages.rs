// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! SML message body types and body codes (§4.4, §4.5).

use crate::{error::SegwError, obis::ObisPath, sml::tlv, value::Value};

pub type BodyCode = u32;

pub const PUBLIC_OPEN_REQ: BodyCode = 0x0000_0100;
pub const PUBLIC_OPEN_RES: BodyCode = 0x0000_0101;
pub const PUBLIC_CLOSE_REQ: BodyCode = 0x0000_0200;
pub const PUBLIC_CLOSE_RES: BodyCode = 0x0000_0201;
pub const GET_PROFILE_LIST_REQ: BodyCode = 0x0000_0400;
pub const GET_PROFILE_LIST_RES: BodyCode = 0x0000_0401;
pub const GET_PROC_PARAMETER_REQ: BodyCode = 0x0000_0500;
pub const GET_PROC_PARAMETER_RES: BodyCode = 0x0000_0501;
pub const SET_PROC_PARAMETER_REQ: BodyCode = 0x0000_0600;
pub const GET_LIST_REQ: BodyCode = 0x0000_0700;
pub const GET_LIST_RES: BodyCode = 0x0000_0701;
pub const ATTENTION_RES: BodyCode = 0x0000_FF01;

/// Attention codes (§4.5, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttentionCode {
    Ok,
    NotAuthorized,
    NoServerId,
    NotExecuted,
}

impl AttentionCode {
    pub fn message(self) -> &'static str {
        match self {
            Self::Ok => "operation succeeded",
            Self::NotAuthorized => "not authorized",
            Self::NoServerId => "no server id",
            Self::NotExecuted => "not executed",
        }
    }
}

/// A tree node in a `GET_PROC_PARAMETER_RES` subtree (§4.5: "serialise
/// subtree with child-list tree nodes").
#[derive(Debug, Clone, PartialEq)]
pub struct ProcParamTree {
    pub parameter_name: ObisPath,
    pub value: Option<Value>,
    pub child_list: Vec<ProcParamTree>,
}

impl ProcParamTree {
    pub fn leaf(parameter_name: ObisPath, value: Value) -> Self {
        Self {
            parameter_name,
            value: Some(value),
            child_list: Vec::new(),
        }
    }

    pub fn branch(parameter_name: ObisPath, child_list: Vec<ProcParamTree>) -> Self {
        Self {
            parameter_name,
            value: None,
            child_list,
        }
    }
}

/// One row of a `GET_PROFILE_LIST_RES` (one time-index entry, §3, §4.5).
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileEntry {
    pub time_index: u64,
    pub act_time: i64,
    pub val_time: i64,
    pub status: u64,
    pub values: Vec<(ObisPath, Value, i8 /* scaler */, u8 /* unit */)>,
}

/// One row of a `GET_LIST_RES` (the meter's current data record, §4.5).
#[derive(Debug, Clone, PartialEq)]
pub struct ListEntry {
    pub obis: ObisPath,
    pub value: Value,
    pub scaler: i8,
    pub unit: u8,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    OpenReq {
        codepage: Option<String>,
        client_id: Vec<u8>,
        req_file_id: Vec<u8>,
        server_id: Vec<u8>,
        username: String,
        password: String,
    },
    OpenRes {
        codepage: Option<String>,
        client_id: Vec<u8>,
        req_file_id: Vec<u8>,
        server_id: Vec<u8>,
    },
    CloseReq,
    CloseRes,
    GetProcParameterReq {
        server_id: Vec<u8>,
        username: String,
        password: String,
        parameter_tree_path: ObisPath,
    },
    GetProcParameterRes {
        server_id: Vec<u8>,
        parameter_tree_path: ObisPath,
        parameter_tree: ProcParamTree,
    },
    SetProcParameterReq {
        server_id: Vec<u8>,
        username: String,
        password: String,
        parameter_tree_path: ObisPath,
        value: Value,
    },
    GetProfileListReq {
        server_id: Vec<u8>,
        username: String,
        password: String,
        parameter_tree_path: ObisPath,
        start: i64,
        end: i64,
    },
    GetProfileListRes {
        server_id: Vec<u8>,
        parameter_tree_path: ObisPath,
        entries: Vec<ProfileEntry>,
    },
    GetListReq {
        server_id: Vec<u8>,
        username: String,
        password: String,
        list_name: ObisPath,
    },
    GetListRes {
        server_id: Vec<u8>,
        list_name: ObisPath,
        act_sensor_time: i64,
        entries: Vec<ListEntry>,
    },
    AttentionRes {
        server_id: Vec<u8>,
        code: AttentionCode,
        message: String,
    },
}

impl MessageBody {
    pub fn body_code(&self) -> BodyCode {
        match self {
            Self::OpenReq { .. } => PUBLIC_OPEN_REQ,
            Self::OpenRes { .. } => PUBLIC_OPEN_RES,
            Self::CloseReq => PUBLIC_CLOSE_REQ,
            Self::CloseRes => PUBLIC_CLOSE_RES,
            Self::GetProcParameterReq { .. } => GET_PROC_PARAMETER_REQ,
            Self::GetProcParameterRes { .. } => GET_PROC_PARAMETER_RES,
            Self::SetProcParameterReq { .. } => SET_PROC_PARAMETER_REQ,
            Self::GetProfileListReq { .. } => GET_PROFILE_LIST_REQ,
            Self::GetProfileListRes { .. } => GET_PROFILE_LIST_RES,
            Self::GetListReq { .. } => GET_LIST_REQ,
            Self::GetListRes { .. } => GET_LIST_RES,
            Self::AttentionRes { .. } => ATTENTION_RES,
        }
    }

    /// Encodes this body to the generic TLV `Value` that
    /// [`crate::sml::file::SmlMessage`] carries.
    pub fn encode(&self) -> tlv::Value {
        use tlv::Value as V;
        let code = V::Unsigned(self.body_code() as u64);
        let fields = match self {
            Self::OpenReq {
                codepage,
                client_id,
                req_file_id,
                server_id,
                username,
                password,
            } => vec![
                opt_octet(codepage.as_deref().map(str::as_bytes)),
                V::OctetString(client_id.clone()),
                V::OctetString(req_file_id.clone()),
                V::OctetString(server_id.clone()),
                V::OctetString(username.clone().into_bytes()),
                V::OctetString(password.clone().into_bytes()),
            ],
            Self::OpenRes {
                codepage,
                client_id,
                req_file_id,
                server_id,
            } => vec![
                opt_octet(codepage.as_deref().map(str::as_bytes)),
                V::OctetString(client_id.clone()),
                V::OctetString(req_file_id.clone()),
                V::OctetString(server_id.clone()),
            ],
            Self::CloseReq | Self::CloseRes => vec![],
            Self::GetProcParameterReq {
                server_id,
                username,
                password,
                parameter_tree_path,
            } => vec![
                V::OctetString(server_id.clone()),
                V::OctetString(username.clone().into_bytes()),
                V::OctetString(password.clone().into_bytes()),
                obis_path_to_tlv(parameter_tree_path),
            ],
            Self::GetProcParameterRes {
                server_id,
                parameter_tree_path,
                parameter_tree,
            } => vec![
                V::OctetString(server_id.clone()),
                obis_path_to_tlv(parameter_tree_path),
                tree_to_tlv(parameter_tree),
            ],
            Self::SetProcParameterReq {
                server_id,
                username,
                password,
                parameter_tree_path,
                value,
            } => vec![
                V::OctetString(server_id.clone()),
                V::OctetString(username.clone().into_bytes()),
                V::OctetString(password.clone().into_bytes()),
                obis_path_to_tlv(parameter_tree_path),
                value_to_tlv(value),
            ],
            Self::GetProfileListReq {
                server_id,
                username,
                password,
                parameter_tree_path,
                start,
                end,
            } => vec![
                V::OctetString(server_id.clone()),
                V::OctetString(username.clone().into_bytes()),
                V::OctetString(password.clone().into_bytes()),
                obis_path_to_tlv(parameter_tree_path),
                V::Integer(*start),
                V::Integer(*end),
            ],
            Self::GetProfileListRes {
                server_id,
                parameter_tree_path,
                entries,
            } => vec![
                V::OctetString(server_id.clone()),
                obis_path_to_tlv(parameter_tree_path),
                V::List(entries.iter().map(entry_to_tlv).collect()),
            ],
            Self::GetListReq {
                server_id,
                username,
                password,
                list_name,
            } => vec![
                V::OctetString(server_id.clone()),
                V::OctetString(username.clone().into_bytes()),
                V::OctetString(password.clone().into_bytes()),
                obis_path_to_tlv(list_name),
            ],
            Self::GetListRes {
                server_id,
                list_name,
                act_sensor_time,
                entries,
            } => vec![
                V::OctetString(server_id.clone()),
                obis_path_to_tlv(list_name),
                V::Integer(*act_sensor_time),
                V::List(entries.iter().map(list_entry_to_tlv).collect()),
            ],
            Self::AttentionRes {
                server_id,
                code,
                message,
            } => vec![
                V::OctetString(server_id.clone()),
                V::Unsigned(attention_code_number(*code)),
                V::OctetString(message.clone().into_bytes()),
            ],
        };
        V::List(vec![code, V::List(fields)])
    }

    /// Decodes a body previously produced by [`MessageBody::encode`].
    pub fn decode(value: &tlv::Value) -> Result<Self, SegwError> {
        let tlv::Value::List(outer) = value else {
            return Err(SegwError::protocol("SML body is not a 2-element list"));
        };
        let [code_v, fields_v] = outer.as_slice() else {
            return Err(SegwError::protocol("SML body envelope malformed"));
        };
        let tlv::Value::Unsigned(code) = code_v else {
            return Err(SegwError::protocol("SML body code is not unsigned"));
        };
        let tlv::Value::List(fields) = fields_v else {
            return Err(SegwError::protocol("SML body fields are not a list"));
        };
        let code = *code as BodyCode;

        let octet_string = |v: &tlv::Value| -> Result<Vec<u8>, SegwError> {
            match v {
                tlv::Value::OctetString(b) => Ok(b.clone()),
                _ => Err(SegwError::protocol("expected octet string field")),
            }
        };
        let as_string = |v: &tlv::Value| -> Result<String, SegwError> {
            Ok(String::from_utf8_lossy(&octet_string(v)?).into_owned())
        };

        match code {
            PUBLIC_OPEN_REQ => {
                let [codepage, client_id, req_file_id, server_id, username, password] =
                    fields.as_slice()
                else {
                    return Err(SegwError::protocol("OpenReq field count mismatch"));
                };
                Ok(Self::OpenReq {
                    codepage: opt_octet_decode(codepage)?,
                    client_id: octet_string(client_id)?,
                    req_file_id: octet_string(req_file_id)?,
                    server_id: octet_string(server_id)?,
                    username: as_string(username)?,
                    password: as_string(password)?,
                })
            },
            PUBLIC_OPEN_RES => {
                let [codepage, client_id, req_file_id, server_id] = fields.as_slice() else {
                    return Err(SegwError::protocol("OpenRes field count mismatch"));
                };
                Ok(Self::OpenRes {
                    codepage: opt_octet_decode(codepage)?,
                    client_id: octet_string(client_id)?,
                    req_file_id: octet_string(req_file_id)?,
                    server_id: octet_string(server_id)?,
                })
            },
            PUBLIC_CLOSE_REQ => Ok(Self::CloseReq),
            PUBLIC_CLOSE_RES => Ok(Self::CloseRes),
            GET_PROC_PARAMETER_REQ => {
                let [server_id, username, password, path] = fields.as_slice() else {
                    return Err(SegwError::protocol("GetProcParameterReq field count"));
                };
                Ok(Self::GetProcParameterReq {
                    server_id: octet_string(server_id)?,
                    username: as_string(username)?,
                    password: as_string(password)?,
                    parameter_tree_path: tlv_to_obis_path(path)?,
                })
            },
            GET_PROC_PARAMETER_RES => {
                let [server_id, path, tree] = fields.as_slice() else {
                    return Err(SegwError::protocol("GetProcParameterRes field count"));
                };
                Ok(Self::GetProcParameterRes {
                    server_id: octet_string(server_id)?,
                    parameter_tree_path: tlv_to_obis_path(path)?,
                    parameter_tree: tlv_to_tree(tree)?,
                })
            },
            SET_PROC_PARAMETER_REQ => {
                let [server_id, username, password, path, value] = fields.as_slice() else {
                    return Err(SegwError::protocol("SetProcParameterReq field count"));
                };
                Ok(Self::SetProcParameterReq {
                    server_id: octet_string(server_id)?,
                    username: as_string(username)?,
                    password: as_string(password)?,
                    parameter_tree_path: tlv_to_obis_path(path)?,
                    value: tlv_to_value(value)?,
                })
            },
            GET_PROFILE_LIST_REQ => {
                let [server_id, username, password, path, start, end] = fields.as_slice()
                else {
                    return Err(SegwError::protocol("GetProfileListReq field count"));
                };
                let tlv::Value::Integer(start) = start else {
                    return Err(SegwError::protocol("start is not an integer"));
                };
                let tlv::Value::Integer(end) = end else {
                    return Err(SegwError::protocol("end is not an integer"));
                };
                Ok(Self::GetProfileListReq {
                    server_id: octet_string(server_id)?,
                    username: as_string(username)?,
                    password: as_string(password)?,
                    parameter_tree_path: tlv_to_obis_path(path)?,
                    start: *start,
                    end: *end,
                })
            },
            GET_PROFILE_LIST_RES => {
                let [server_id, path, entries] = fields.as_slice() else {
                    return Err(SegwError::protocol("GetProfileListRes field count"));
                };
                let tlv::Value::List(entries) = entries else {
                    return Err(SegwError::protocol("profile entries is not a list"));
                };
                Ok(Self::GetProfileListRes {
                    server_id: octet_string(server_id)?,
                    parameter_tree_path: tlv_to_obis_path(path)?,
                    entries: entries.iter().map(tlv_to_entry).collect::<Result<_, _>>()?,
                })
            },
            GET_LIST_REQ => {
                let [server_id, username, password, list_name] = fields.as_slice() else {
                    return Err(SegwError::protocol("GetListReq field count"));
                };
                Ok(Self::GetListReq {
                    server_id: octet_string(server_id)?,
                    username: as_string(username)?,
                    password: as_string(password)?,
                    list_name: tlv_to_obis_path(list_name)?,
                })
            },
            GET_LIST_RES => {
                let [server_id, list_name, act_sensor_time, entries] = fields.as_slice() else {
                    return Err(SegwError::protocol("GetListRes field count"));
                };
                let tlv::Value::Integer(act_sensor_time) = act_sensor_time else {
                    return Err(SegwError::protocol("act_sensor_time is not an integer"));
                };
                let tlv::Value::List(entries) = entries else {
                    return Err(SegwError::protocol("list entries is not a list"));
                };
                Ok(Self::GetListRes {
                    server_id: octet_string(server_id)?,
                    list_name: tlv_to_obis_path(list_name)?,
                    act_sensor_time: *act_sensor_time,
                    entries: entries
                        .iter()
                        .map(tlv_to_list_entry)
                        .collect::<Result<_, _>>()?,
                })
            },
            ATTENTION_RES => {
                let [server_id, code, message] = fields.as_slice() else {
                    return Err(SegwError::protocol("AttentionRes field count"));
                };
                let tlv::Value::Unsigned(code) = code else {
                    return Err(SegwError::protocol("attention code is not unsigned"));
                };
                Ok(Self::AttentionRes {
                    server_id: octet_string(server_id)?,
                    code: attention_code_from_number(*code)?,
                    message: as_string(message)?,
                })
            },
            other => Err(SegwError::protocol(format!("unknown SML body code 0x{other:08x}"))),
        }
    }
}

fn opt_octet(bytes: Option<&[u8]>) -> tlv::Value {
    match bytes {
        Some(b) => tlv::Value::OctetString(b.to_vec()),
        None => tlv::Value::EndOfMessage,
    }
}

fn opt_octet_decode(v: &tlv::Value) -> Result<Option<String>, SegwError> {
    match v {
        tlv::Value::EndOfMessage => Ok(None),
        tlv::Value::OctetString(b) => Ok(Some(String::from_utf8_lossy(b).into_owned())),
        _ => Err(SegwError::protocol("expected optional octet string")),
    }
}

fn obis_path_to_tlv(path: &ObisPath) -> tlv::Value {
    tlv::Value::List(path.0.iter().map(|o| tlv::Value::OctetString(o.0.to_vec())).collect())
}

fn tlv_to_obis_path(v: &tlv::Value) -> Result<ObisPath, SegwError> {
    let tlv::Value::List(items) = v else {
        return Err(SegwError::protocol("OBIS path is not a list"));
    };
    let mut path = Vec::with_capacity(items.len());
    for item in items {
        let tlv::Value::OctetString(bytes) = item else {
            return Err(SegwError::protocol("OBIS element is not an octet string"));
        };
        let arr: [u8; 6] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| SegwError::protocol("OBIS element is not 6 bytes"))?;
        path.push(crate::obis::Obis(arr));
    }
    Ok(ObisPath(path))
}

/// Tags every leaf value with its [`crate::value::TypeTag`] discriminant
/// so the round trip through TLV preserves width/signedness (§3).
fn value_to_tlv(v: &Value) -> tlv::Value {
    use tlv::Value as V;
    let tag = v.type_tag() as u64;
    let payload = match v {
        Value::Bool(b) => V::Boolean(*b),
        Value::I8(x) => V::Integer(*x as i64),
        Value::I16(x) => V::Integer(*x as i64),
        Value::I32(x) => V::Integer(*x as i64),
        Value::I64(x) => V::Integer(*x),
        Value::U8(x) => V::Unsigned(*x as u64),
        Value::U16(x) => V::Unsigned(*x as u64),
        Value::U32(x) => V::Unsigned(*x as u64),
        Value::U64(x) => V::Unsigned(*x),
        Value::Str(s) => V::OctetString(s.clone().into_bytes()),
        Value::Buffer(b) => V::OctetString(b.clone()),
        Value::Timestamp(t) => V::Integer(*t),
        Value::Duration(d) => V::Unsigned(d.as_secs()),
        Value::Aes128Key(k) => V::OctetString(k.to_vec()),
        Value::Endpoint(e) => V::OctetString(e.to_string().into_bytes()),
        Value::Mac(m) => V::OctetString(m.to_vec()),
    };
    V::List(vec![V::Unsigned(tag), payload])
}

fn tlv_to_value(v: &tlv::Value) -> Result<Value, SegwError> {
    use crate::value::TypeTag as T;
    let tlv::Value::List(items) = v else {
        return Err(SegwError::protocol("tagged value is not a list"));
    };
    let [tag_v, payload] = items.as_slice() else {
        return Err(SegwError::protocol("tagged value field count mismatch"));
    };
    let tlv::Value::Unsigned(tag) = tag_v else {
        return Err(SegwError::protocol("value type tag is not unsigned"));
    };

    let as_int = || match payload {
        tlv::Value::Integer(i) => Ok(*i),
        tlv::Value::Unsigned(u) => Ok(*u as i64),
        _ => Err(SegwError::protocol("expected integer payload")),
    };
    let as_uint = || match payload {
        tlv::Value::Unsigned(u) => Ok(*u),
        tlv::Value::Integer(i) => Ok(*i as u64),
        _ => Err(SegwError::protocol("expected unsigned payload")),
    };
    let as_bytes = || match payload {
        tlv::Value::OctetString(b) => Ok(b.clone()),
        _ => Err(SegwError::protocol("expected octet string payload")),
    };

    Ok(match *tag {
        t if t == T::Bool as u64 => Value::Bool(matches!(payload, tlv::Value::Boolean(true))),
        t if t == T::I8 as u64 => Value::I8(as_int()? as i8),
        t if t == T::I16 as u64 => Value::I16(as_int()? as i16),
        t if t == T::I32 as u64 => Value::I32(as_int()? as i32),
        t if t == T::I64 as u64 => Value::I64(as_int()?),
        t if t == T::U8 as u64 => Value::U8(as_uint()? as u8),
        t if t == T::U16 as u64 => Value::U16(as_uint()? as u16),
        t if t == T::U32 as u64 => Value::U32(as_uint()? as u32),
        t if t == T::U64 as u64 => Value::U64(as_uint()?),
        t if t == T::Str as u64 => Value::Str(String::from_utf8_lossy(&as_bytes()?).into_owned()),
        t if t == T::Buffer as u64 => Value::Buffer(as_bytes()?),
        t if t == T::Timestamp as u64 => Value::Timestamp(as_int()?),
        t if t == T::Duration as u64 => {
            Value::Duration(std::time::Duration::from_secs(as_uint()?))
        },
        t if t == T::Aes128Key as u64 => {
            let raw = as_bytes()?;
            Value::Aes128Key(raw.try_into().map_err(|_| {
                SegwError::protocol("AES-128 key payload is not 16 bytes")
            })?)
        },
        t if t == T::Endpoint as u64 => {
            let text = String::from_utf8_lossy(&as_bytes()?).into_owned();
            Value::Endpoint(
                text.parse()
                    .map_err(|_| SegwError::protocol("invalid endpoint literal"))?,
            )
        },
        t if t == T::Mac as u64 => {
            let raw = as_bytes()?;
            Value::Mac(
                raw.try_into()
                    .map_err(|_| SegwError::protocol("MAC payload is not 6 bytes"))?,
            )
        },
        other => return Err(SegwError::protocol(format!("unknown value type tag {other}"))),
    })
}

fn tree_to_tlv(tree: &ProcParamTree) -> tlv::Value {
    tlv::Value::List(vec![
        obis_path_to_tlv(&tree.parameter_name),
        match &tree.value {
            Some(v) => value_to_tlv(v),
            None => tlv::Value::EndOfMessage,
        },
        tlv::Value::List(tree.child_list.iter().map(tree_to_tlv).collect()),
    ])
}

fn tlv_to_tree(v: &tlv::Value) -> Result<ProcParamTree, SegwError> {
    let tlv::Value::List(fields) = v else {
        return Err(SegwError::protocol("proc-param tree node is not a list"));
    };
    let [name, value, children] = fields.as_slice() else {
        return Err(SegwError::protocol("proc-param tree node field count"));
    };
    let tlv::Value::List(children) = children else {
        return Err(SegwError::protocol("proc-param tree child_list is not a list"));
    };
    Ok(ProcParamTree {
        parameter_name: tlv_to_obis_path(name)?,
        value: match value {
            tlv::Value::EndOfMessage => None,
            other => Some(tlv_to_value(other)?),
        },
        child_list: children.iter().map(tlv_to_tree).collect::<Result<_, _>>()?,
    })
}

fn entry_to_tlv(e: &ProfileEntry) -> tlv::Value {
    tlv::Value::List(vec![
        tlv::Value::Unsigned(e.time_index),
        tlv::Value::Integer(e.act_time),
        tlv::Value::Integer(e.val_time),
        tlv::Value::Unsigned(e.status),
        tlv::Value::List(
            e.values
                .iter()
                .map(|(obis, val, scaler, unit)| {
                    tlv::Value::List(vec![
                        obis_path_to_tlv(obis),
                        value_to_tlv(val),
                        tlv::Value::Integer(*scaler as i64),
                        tlv::Value::Unsigned(*unit as u64),
                    ])
                })
                .collect(),
        ),
    ])
}

fn tlv_to_entry(v: &tlv::Value) -> Result<ProfileEntry, SegwError> {
    let tlv::Value::List(fields) = v else {
        return Err(SegwError::protocol("profile entry is not a list"));
    };
    let [time_index, act_time, val_time, status, values] = fields.as_slice() else {
        return Err(SegwError::protocol("profile entry field count"));
    };
    let (tlv::Value::Unsigned(time_index), tlv::Value::Integer(act_time), tlv::Value::Integer(val_time), tlv::Value::Unsigned(status), tlv::Value::List(values)) =
        (time_index, act_time, val_time, status, values)
    else {
        return Err(SegwError::protocol("profile entry field type mismatch"));
    };
    let values = values
        .iter()
        .map(|item| {
            let tlv::Value::List(fields) = item else {
                return Err(SegwError::protocol("profile value tuple is not a list"));
            };
            let [obis, val, scaler, unit] = fields.as_slice() else {
                return Err(SegwError::protocol("profile value tuple field count"));
            };
            let (tlv::Value::Integer(scaler), tlv::Value::Unsigned(unit)) = (scaler, unit) else {
                return Err(SegwError::protocol("profile value scaler/unit type mismatch"));
            };
            Ok((tlv_to_obis_path(obis)?, tlv_to_value(val)?, *scaler as i8, *unit as u8))
        })
        .collect::<Result<_, SegwError>>()?;
    Ok(ProfileEntry {
        time_index: *time_index,
        act_time: *act_time,
        val_time: *val_time,
        status: *status,
        values,
    })
}

fn list_entry_to_tlv(e: &ListEntry) -> tlv::Value {
    tlv::Value::List(vec![
        obis_path_to_tlv(&e.obis),
        value_to_tlv(&e.value),
        tlv::Value::Integer(e.scaler as i64),
        tlv::Value::Unsigned(e.unit as u64),
    ])
}

fn tlv_to_list_entry(v: &tlv::Value) -> Result<ListEntry, SegwError> {
    let tlv::Value::List(fields) = v else {
        return Err(SegwError::protocol("list entry is not a list"));
    };
    let [obis, val, scaler, unit] = fields.as_slice() else {
        return Err(SegwError::protocol("list entry field count"));
    };
    let (tlv::Value::Integer(scaler), tlv::Value::Unsigned(unit)) = (scaler, unit) else {
        return Err(SegwError::protocol("list entry scaler/unit type mismatch"));
    };
    Ok(ListEntry {
        obis: tlv_to_obis_path(obis)?,
        value: tlv_to_value(val)?,
        scaler: *scaler as i8,
        unit: *unit as u8,
    })
}

fn attention_code_number(code: AttentionCode) -> u64 {
    match code {
        AttentionCode::Ok => 0,
        AttentionCode::NotAuthorized => 1,
        AttentionCode::NoServerId => 2,
        AttentionCode::NotExecuted => 3,
    }
}

fn attention_code_from_number(n: u64) -> Result<AttentionCode, SegwError> {
    Ok(match n {
        0 => AttentionCode::Ok,
        1 => AttentionCode::NotAuthorized,
        2 => AttentionCode::NoServerId,
        3 => AttentionCode::NotExecuted,
        other => return Err(SegwError::protocol(format!("unknown attention code {other}"))),
    })
}
