// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Gateway proxy: serialises SML interactions from the cluster onto
//! one device's IP-T session (C13, §4.12, master side).

use std::sync::Mutex;

use dashmap::DashMap;

use crate::sml::messages::MessageBody;

/// Proxy session state (§4.12: "`OFFLINE -> WAITING -> CONNECTED ->
/// OFFLINE`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Offline,
    Waiting,
    Connected,
}

/// One pending cluster request: one SML file to send to the device.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub sender: String,
    pub body: MessageBody,
}

/// Tracks an outgoing transaction so the device's response can be
/// routed back to whoever asked for it (§4.12: "placing each outgoing
/// transaction id into a reply map together with the originating
/// cluster sender, sequence, key and job flag").
#[derive(Debug, Clone)]
pub struct ReplyEntry {
    pub sender: String,
    pub sequence: u8,
    pub key: Vec<u8>,
    pub is_job: bool,
}

/// A per-device proxy: input queue, reply map and a local mirror of
/// the last observed configuration values (§4.12: "A per-device
/// configuration cache mirrors the last observed values to answer
/// `GET_PROC_PARAMETER_REQ` locally when allowed").
pub struct DeviceProxy {
    state: Mutex<ProxyState>,
    queue: Mutex<std::collections::VecDeque<ProxyRequest>>,
    reply_map: DashMap<Vec<u8>, ReplyEntry>,
    request_count: std::sync::atomic::AtomicU32,
    local_mirror: DashMap<String, crate::value::Value>,
}

impl DeviceProxy {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProxyState::Offline),
            queue: Mutex::new(std::collections::VecDeque::new()),
            reply_map: DashMap::new(),
            request_count: std::sync::atomic::AtomicU32::new(0),
            local_mirror: DashMap::new(),
        }
    }

    pub fn state(&self) -> ProxyState {
        *self.state.lock().expect("lock poisoned")
    }

    /// Enqueues a new cluster request, redirecting the session to
    /// proxy mode if it was idle (§4.12: "On a new request the session
    /// is redirected to proxy mode").
    pub fn enqueue(&self, request: ProxyRequest) {
        self.request_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.queue.lock().expect("lock poisoned").push_back(request);
        let mut state = self.state.lock().expect("lock poisoned");
        if *state == ProxyState::Offline {
            *state = ProxyState::Waiting;
        }
    }

    /// Drains one queued request on ack, assigning it a transaction
    /// key and recording it in the reply map (§4.12).
    pub fn drain_one(&self, sequence: u8, key: Vec<u8>, is_job: bool) -> Option<ProxyRequest> {
        let request = self.queue.lock().expect("lock poisoned").pop_front()?;
        *self.state.lock().expect("lock poisoned") = ProxyState::Connected;
        self.reply_map.insert(
            key,
            ReplyEntry { sender: request.sender.clone(), sequence, key: Vec::new(), is_job },
        );
        Some(request)
    }

    /// Looks up the originating requester for an incoming response
    /// keyed by transaction id, per §4.12.
    pub fn resolve_reply(&self, transaction_id: &[u8]) -> Option<ReplyEntry> {
        self.reply_map.remove(transaction_id).map(|(_, v)| v)
    }

    /// Called when the device closes the SML file: decrements the
    /// request counter; at zero the proxy leaves proxy mode (§4.12).
    pub fn on_sml_file_closed(&self) {
        let prev = self.request_count.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
        if prev <= 1 {
            *self.state.lock().expect("lock poisoned") = ProxyState::Offline;
        }
    }

    pub fn mirror_value(&self, obis_path_text: String, value: crate::value::Value) {
        self.local_mirror.insert(obis_path_text, value);
    }

    pub fn mirrored_value(&self, obis_path_text: &str) -> Option<crate::value::Value> {
        self.local_mirror.get(obis_path_text).map(|v| v.clone())
    }
}

impl Default for DeviceProxy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn sample_request() -> ProxyRequest {
        ProxyRequest { sender: "cluster-node-1".into(), body: MessageBody::CloseReq }
    }

    #[test]
    fn enqueue_transitions_offline_to_waiting() {
        let proxy = DeviceProxy::new();
        assert_eq!(proxy.state(), ProxyState::Offline);
        proxy.enqueue(sample_request());
        assert_eq!(proxy.state(), ProxyState::Waiting);
    }

    #[test]
    fn drain_one_connects_and_registers_reply_entry() {
        let proxy = DeviceProxy::new();
        proxy.enqueue(sample_request());
        let drained = proxy.drain_one(1, vec![0xAA], false);
        assert!(drained.is_some());
        assert_eq!(proxy.state(), ProxyState::Connected);

        let reply = proxy.resolve_reply(&[0xAA]).expect("reply entry");
        assert_eq!(reply.sender, "cluster-node-1");
    }

    #[test]
    fn request_counter_reaches_zero_returns_to_offline() {
        let proxy = DeviceProxy::new();
        proxy.enqueue(sample_request());
        proxy.enqueue(sample_request());
        proxy.drain_one(1, vec![0xAA], false);
        proxy.on_sml_file_closed();
        assert_eq!(proxy.state(), ProxyState::Connected);
        proxy.on_sml_file_closed();
        assert_eq!(proxy.state(), ProxyState::Offline);
    }

    #[test]
    fn local_mirror_answers_without_a_round_trip() {
        let proxy = DeviceProxy::new();
        proxy.mirror_value("01-00-01-08-00-FF".into(), Value::U32(42));
        assert_eq!(proxy.mirrored_value("01-00-01-08-00-FF"), Some(Value::U32(42)));
        assert_eq!(proxy.mirrored_value("missing"), None);
    }
}
