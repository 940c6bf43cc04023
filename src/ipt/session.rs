// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The IP-T session state machine (C3, §4.3).
//!
//! States: `Start -> Authorized -> Online <-> Connected -> Closing ->
//! Terminated`. A [`Session`] owns the pending-response map (keyed by the
//! 8-bit sequence number, wrapping per §4.3's "sequence numbers are 8-bit,
//! monotone per session with wrap-around"), the push-channel registry and
//! the scrambler pair — the same shape as the teacher's `ClientConnection`
//! (a `DashMap<u32, _>` of in-flight requests keyed by initiator task tag),
//! generalized from per-ITT to per-sequence routing and widened with the
//! push-channel and open-connection bookkeeping IP-T layers on top.

use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

use bytes::{Buf, Bytes};
use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::warn;

use crate::{
    error::SegwError,
    ipt::{
        codes,
        frame::Frame,
        scramble::{ScrambleKey, Scrambler},
    },
};

/// Bits OR-ed into a push-data-transfer response's status byte to signal
/// the block was received and acknowledged (§8-S3: "status byte ORed
/// with 0xC1").
pub const PUSHDATA_TRANSFER_ACK: u8 = 0xC1;

/// Fields returned by a successful open-push-channel exchange (§4.3:
/// "Success reply carries channel id, source id, packet size, window
/// size, status byte, target count").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushChannelOpened {
    pub channel: u32,
    pub source: u32,
    pub packet_size: u16,
    pub window_size: u8,
    pub status: u8,
    pub target_count: u8,
}

/// Fields returned by a push-data-transfer acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushTransferAck {
    pub channel: u32,
    pub source: u32,
    pub status: u8,
    pub block: u16,
}

/// Writes an IP-T "short string" field: one length byte followed by the
/// UTF-8 bytes (bounded to 255 bytes, the widest this field ever needs
/// to carry: target/account/number/version/device-id tokens).
fn put_short_str(out: &mut Vec<u8>, s: &str) {
    let bytes = &s.as_bytes()[..s.len().min(255)];
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
}

/// Reads a length-prefixed short string written by [`put_short_str`].
fn get_short_str(buf: &mut Bytes) -> Result<String, SegwError> {
    if buf.is_empty() {
        return Err(SegwError::protocol("short string: missing length byte"));
    }
    let len = buf.get_u8() as usize;
    if buf.remaining() < len {
        return Err(SegwError::protocol("short string: truncated"));
    }
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|e| SegwError::protocol(format!("short string: {e}")))
}

/// The five short-string fields plus timeout carried by a
/// `TP_REQ_OPEN_PUSH_CHANNEL` request body (§4.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenPushChannelRequest {
    pub target: String,
    pub account: String,
    pub number: String,
    pub version: String,
    pub device_id: String,
    pub timeout_secs: u16,
}

/// Parses a `TP_REQ_OPEN_PUSH_CHANNEL` request body built by
/// [`Session::build_open_push_channel_request`].
pub fn parse_open_push_channel_request(frame: &Frame) -> Result<OpenPushChannelRequest, SegwError> {
    if frame.command != codes::TP_REQ_OPEN_PUSH_CHANNEL {
        return Err(SegwError::protocol("not an open-push-channel request"));
    }
    let mut buf = frame.body.clone();
    let target = get_short_str(&mut buf)?;
    let account = get_short_str(&mut buf)?;
    let number = get_short_str(&mut buf)?;
    let version = get_short_str(&mut buf)?;
    let device_id = get_short_str(&mut buf)?;
    if buf.remaining() < 2 {
        return Err(SegwError::protocol("open-push-channel request: missing timeout"));
    }
    let timeout_secs = buf.get_u16_le();
    Ok(OpenPushChannelRequest { target, account, number, version, device_id, timeout_secs })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Start,
    Authorized,
    Online,
    Connected,
    Closing,
    Terminated,
}

/// Public-login credentials, unscrambled (§4.3).
#[derive(Debug, Clone)]
pub struct PublicLogin {
    pub name: String,
    pub pwd: String,
}

/// Scrambled-login credentials: name/pwd plus the client-proposed session
/// key (§4.3: "scramble key becomes the key proposed by the client
/// (scrambled variant)").
#[derive(Debug, Clone)]
pub struct ScrambledLogin {
    pub name: String,
    pub pwd: String,
    pub key: ScrambleKey,
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub accepted: bool,
    pub watchdog_minutes: u16,
    pub redirect: String,
}

/// Not-yet-acknowledged push channel / open-connection request, resolved
/// either by a matching response frame or by the session entering
/// `Closing` (§4.3: "On `Closing` all outstanding push-channel and
/// connection-open entries are resolved with `NO_MASTER`").
struct Pending {
    waiter: oneshot::Sender<Result<Frame, SegwError>>,
}

/// One IP-T session, gateway or master side.
pub struct Session {
    pub uuid: uuid_lite::Uuid,
    state: std::sync::Mutex<SessionState>,
    pub sequence: AtomicU8,
    pending: DashMap<u8, Pending>,
    /// Channel id -> target name, unique per session (§4.3).
    push_channels: DashMap<u32, String>,
    next_channel_id: AtomicU8,
    read_key: std::sync::Mutex<Scrambler>,
    write_key: std::sync::Mutex<Scrambler>,
}

impl Session {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            uuid: uuid_lite::Uuid::new_v4(),
            state: std::sync::Mutex::new(SessionState::Start),
            sequence: AtomicU8::new(1), // 0 is reserved for the login pair
            pending: DashMap::new(),
            push_channels: DashMap::new(),
            next_channel_id: AtomicU8::new(1),
            read_key: std::sync::Mutex::new(Scrambler::default_key()),
            write_key: std::sync::Mutex::new(Scrambler::default_key()),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, s: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = s;
    }

    /// Allocates the next 8-bit sequence number, skipping the reserved
    /// login value 0 on wrap-around (§4.3).
    pub fn next_sequence(&self) -> u8 {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        if seq == codes::LOGIN_SEQUENCE {
            self.sequence.store(1, Ordering::SeqCst);
            1
        } else {
            seq
        }
    }

    /// Processes a public-login request; accepts everything but a fixed
    /// demo credential pair is checked in the gatekeeper layer above this
    /// module. Scramble key stays at its default (§4.1).
    pub fn accept_public_login(&self, watchdog_minutes: u16, redirect: impl Into<String>) -> LoginOutcome {
        self.set_state(SessionState::Authorized);
        LoginOutcome {
            accepted: true,
            watchdog_minutes,
            redirect: redirect.into(),
        }
    }

    /// Processes a scrambled-login request. Per §9's negotiation-race
    /// note, the write-side permutation only swaps *after* the login
    /// response has been emitted; callers must call
    /// [`Session::activate_scrambled_key`] once that response is on the
    /// wire, not before.
    pub fn accept_scrambled_login(
        &self,
        login: &ScrambledLogin,
        watchdog_minutes: u16,
    ) -> LoginOutcome {
        self.set_state(SessionState::Authorized);
        *self.read_key.lock().unwrap_or_else(|e| e.into_inner()) = Scrambler::new(&login.key);
        LoginOutcome {
            accepted: true,
            watchdog_minutes,
            redirect: String::new(),
        }
    }

    /// Swaps the write-side scrambler to `key`. Called right after the
    /// login response has been emitted with the *old* key (§9).
    pub fn activate_scrambled_key(&self, key: &ScrambleKey) {
        *self.write_key.lock().unwrap_or_else(|e| e.into_inner()) = Scrambler::new(key);
    }

    pub fn scramble_outgoing(&self, data: &[u8]) -> Vec<u8> {
        self.write_key
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .scramble(data)
    }

    pub fn descramble_incoming(&self, data: &[u8]) -> Vec<u8> {
        self.read_key
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .descramble(data)
    }

    /// Moves the session online after login (used once a watchdog or
    /// push-target registration has happened; §4.3's `Online` state is
    /// entered implicitly once authorized traffic begins).
    pub fn go_online(&self) {
        self.set_state(SessionState::Online);
    }

    /// Registers a push target, returning a freshly assigned channel id
    /// unique within this session (§4.3: "register push target ...
    /// server assigns a 32-bit channel id on success; channel is unique
    /// per server").
    pub fn register_target(&self, target: impl Into<String>) -> u32 {
        let id = self.next_channel_id.fetch_add(1, Ordering::SeqCst) as u32;
        self.push_channels.insert(id, target.into());
        id
    }

    pub fn deregister_target(&self, channel: u32) -> bool {
        self.push_channels.remove(&channel).is_some()
    }

    pub fn target_for_channel(&self, channel: u32) -> Option<String> {
        self.push_channels.get(&channel).map(|e| e.value().clone())
    }

    /// Builds a `TP_REQ_OPEN_PUSH_CHANNEL` request for a previously
    /// registered `target` (§4.3: "input (target name, account, number,
    /// version, device id, u16 timeout)").
    pub fn build_open_push_channel_request(
        &self,
        target: &str,
        account: &str,
        number: &str,
        version: &str,
        device_id: &str,
        timeout_secs: u16,
    ) -> (u8, Frame) {
        let seq = self.next_sequence();
        let mut body = Vec::new();
        put_short_str(&mut body, target);
        put_short_str(&mut body, account);
        put_short_str(&mut body, number);
        put_short_str(&mut body, version);
        put_short_str(&mut body, device_id);
        body.extend_from_slice(&timeout_secs.to_le_bytes());
        (seq, Frame::new(codes::TP_REQ_OPEN_PUSH_CHANNEL, seq, body))
    }

    /// Parses a `TP_RES_OPEN_PUSH_CHANNEL` response body: channel id,
    /// source id, packet size, window size, status byte, target count
    /// (§4.3, §8-S3).
    pub fn parse_open_push_channel_response(frame: &Frame) -> Result<PushChannelOpened, SegwError> {
        if frame.command != codes::TP_RES_OPEN_PUSH_CHANNEL {
            return Err(SegwError::protocol("not an open-push-channel response"));
        }
        let mut buf = frame.body.clone();
        if buf.remaining() < 4 + 4 + 2 + 1 + 1 + 1 {
            return Err(SegwError::protocol("open-push-channel response: truncated body"));
        }
        Ok(PushChannelOpened {
            channel: buf.get_u32_le(),
            source: buf.get_u32_le(),
            packet_size: buf.get_u16_le(),
            window_size: buf.get_u8(),
            status: buf.get_u8(),
            target_count: buf.get_u8(),
        })
    }

    /// Builds a `TP_REQ_PUSHDATA_TRANSFER` request carrying one
    /// length-prefixed, byte-transparent block (§4.3: "body (channel,
    /// source, status, block, length-prefixed bytes)").
    pub fn build_pushdata_transfer_request(&self, channel: u32, source: u32, block: u16, data: &[u8]) -> (u8, Frame) {
        let seq = self.next_sequence();
        let mut body = Vec::with_capacity(4 + 4 + 1 + 2 + 4 + data.len());
        body.extend_from_slice(&channel.to_le_bytes());
        body.extend_from_slice(&source.to_le_bytes());
        body.push(0); // status, request side always starts at 0
        body.extend_from_slice(&block.to_le_bytes());
        body.extend_from_slice(&(data.len() as u32).to_le_bytes());
        body.extend_from_slice(data);
        (seq, Frame::new(codes::TP_REQ_PUSHDATA_TRANSFER, seq, body))
    }

    /// Computes the acknowledged status byte for a push-data-transfer
    /// response: the peer's base status OR-ed with [`PUSHDATA_TRANSFER_ACK`]
    /// (§8-S3: "status byte ORed with 0xC1").
    pub fn pushdata_transfer_status(base: u8) -> u8 {
        base | PUSHDATA_TRANSFER_ACK
    }

    /// Builds a `TP_RES_PUSHDATA_TRANSFER` acknowledgement for a received
    /// block, with the status byte computed by
    /// [`Session::pushdata_transfer_status`] rather than a literal.
    pub fn build_pushdata_transfer_response(&self, seq: u8, channel: u32, source: u32, block: u16) -> Frame {
        let mut body = Vec::with_capacity(4 + 4 + 1 + 2);
        body.extend_from_slice(&channel.to_le_bytes());
        body.extend_from_slice(&source.to_le_bytes());
        body.push(Self::pushdata_transfer_status(0));
        body.extend_from_slice(&block.to_le_bytes());
        Frame::new(codes::TP_RES_PUSHDATA_TRANSFER, seq, body)
    }

    /// Parses a `TP_RES_PUSHDATA_TRANSFER` response body.
    pub fn parse_pushdata_transfer_response(frame: &Frame) -> Result<PushTransferAck, SegwError> {
        if frame.command != codes::TP_RES_PUSHDATA_TRANSFER {
            return Err(SegwError::protocol("not a pushdata-transfer response"));
        }
        let mut buf = frame.body.clone();
        if buf.remaining() < 4 + 4 + 1 + 2 {
            return Err(SegwError::protocol("pushdata-transfer response: truncated body"));
        }
        Ok(PushTransferAck {
            channel: buf.get_u32_le(),
            source: buf.get_u32_le(),
            status: buf.get_u8(),
            block: buf.get_u16_le(),
        })
    }

    /// Builds a `TP_REQ_CLOSE_PUSH_CHANNEL` request for `channel`.
    pub fn build_close_push_channel_request(&self, channel: u32) -> (u8, Frame) {
        let seq = self.next_sequence();
        (seq, Frame::new(codes::TP_REQ_CLOSE_PUSH_CHANNEL, seq, channel.to_le_bytes().to_vec()))
    }

    /// Parses a `TP_RES_CLOSE_PUSH_CHANNEL` response body: channel id and
    /// status byte.
    pub fn parse_close_push_channel_response(frame: &Frame) -> Result<(u32, u8), SegwError> {
        if frame.command != codes::TP_RES_CLOSE_PUSH_CHANNEL {
            return Err(SegwError::protocol("not a close-push-channel response"));
        }
        let mut buf = frame.body.clone();
        if buf.remaining() < 5 {
            return Err(SegwError::protocol("close-push-channel response: truncated body"));
        }
        Ok((buf.get_u32_le(), buf.get_u8()))
    }

    /// Accepts an incoming `TP_REQ_OPEN_PUSH_CHANNEL` for a target
    /// registered via [`Session::register_target`], returning the
    /// already-assigned channel id and fresh transfer parameters
    /// (§4.3, §8-S3).
    pub fn accept_open_push_channel(
        &self,
        request: &OpenPushChannelRequest,
        source: u32,
        packet_size: u16,
        window_size: u8,
    ) -> Option<PushChannelOpened> {
        let channel = self.push_channels.iter().find(|e| e.value() == &request.target).map(|e| *e.key())?;
        Some(PushChannelOpened {
            channel,
            source,
            packet_size,
            window_size,
            status: 0,
            target_count: self.push_channels.len() as u8,
        })
    }

    /// Registers a sequence number awaiting a response, returning the
    /// receiver half. Per §4.3, a duplicate sequence in the pending map
    /// replaces the older entry with a warning.
    pub fn await_response(&self, seq: u8) -> oneshot::Receiver<Result<Frame, SegwError>> {
        let (tx, rx) = oneshot::channel();
        if self.pending.insert(seq, Pending { waiter: tx }).is_some() {
            warn!(seq, "duplicate pending sequence number, replacing entry");
        }
        rx
    }

    /// Resolves a pending request with an incoming response frame. The
    /// response carries the sequence number of the corresponding request
    /// (§5: "responses carry the sequence number of the corresponding
    /// request").
    pub fn resolve_response(&self, frame: Frame) {
        if let Some((_, pending)) = self.pending.remove(&frame.sequence) {
            let _ = pending.waiter.send(Ok(frame));
        } else {
            warn!(seq = frame.sequence, cmd = frame.command, "response to unknown sequence");
        }
    }

    /// Enters `Closing` and resolves every outstanding pending entry with
    /// a `NO_MASTER` failure (§4.3).
    pub fn begin_closing(&self) {
        self.set_state(SessionState::Closing);
        for (_, pending) in self.pending.clone().into_iter() {
            let _ = pending.waiter.send(Err(SegwError::transport("NO_MASTER")));
        }
        self.pending.clear();
    }

    pub fn terminate(&self) {
        self.set_state(SessionState::Terminated);
    }

    /// Builds the `UNKNOWN` response for an unrecognised command word
    /// (§4.3).
    pub fn unknown_response(original: &Frame) -> Frame {
        let mut body = Vec::with_capacity(2);
        body.extend_from_slice(&original.command.to_le_bytes());
        Frame::new(codes::UNKNOWN, original.sequence, body)
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("uuid", &self.uuid)
            .field("state", &self.state())
            .finish()
    }
}

/// A minimal, dependency-free UUID so the session doesn't need to pull in
/// the `uuid` crate for a single v4 identifier used only for cache
/// source-tag suppression (§4.6).
pub mod uuid_lite {
    use rand::RngCore;

    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Uuid([u8; 16]);

    impl Uuid {
        pub fn new_v4() -> Self {
            let mut bytes = [0u8; 16];
            rand::rng().fill_bytes(&mut bytes);
            bytes[6] = (bytes[6] & 0x0F) | 0x40;
            bytes[8] = (bytes[8] & 0x3F) | 0x80;
            Self(bytes)
        }
    }

    impl std::fmt::Debug for Uuid {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", hex::encode(self.0))
        }
    }

    impl std::fmt::Display for Uuid {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", hex::encode(self.0))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// S1: public login accept reaches Authorized.
    #[test]
    fn public_login_transitions_to_authorized() {
        let session = Session::new();
        assert_eq!(session.state(), SessionState::Start);
        let outcome = session.accept_public_login(12, "");
        assert!(outcome.accepted);
        assert_eq!(outcome.watchdog_minutes, 12);
        assert_eq!(session.state(), SessionState::Authorized);
    }

    /// S2: scrambled login with key rotation; write key only swaps when
    /// explicitly activated.
    #[test]
    fn scrambled_login_rotates_key_on_activation() {
        let session = Session::new();
        let mut bytes = [0u8; 32];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = (i as u8 + 1) % 32;
        }
        let key = ScrambleKey::from_bytes(bytes);
        let login = ScrambledLogin {
            name: "a".into(),
            pwd: "b".into(),
            key: key.clone(),
        };
        session.accept_scrambled_login(&login, 12);
        assert_eq!(session.state(), SessionState::Authorized);

        // Write side still uses the default key until explicitly activated.
        let before = session.scramble_outgoing(&[5]);
        session.activate_scrambled_key(&key);
        let after = session.scramble_outgoing(&[5]);
        assert_ne!(before, after);
    }

    /// S3: push target register & channel transfer status byte handling.
    #[test]
    fn register_and_transfer_status_byte() {
        let session = Session::new();
        let channel = session.register_target("power@ch1");
        assert_eq!(session.target_for_channel(channel), Some("power@ch1".to_string()));

        let (seq, open_req) =
            session.build_open_push_channel_request("power@ch1", "acc", "1", "1.0", "dev", 30);
        let parsed_req = parse_open_push_channel_request(&open_req).expect("parse open request");
        assert_eq!(parsed_req.target, "power@ch1");

        let opened = session.accept_open_push_channel(&parsed_req, 0xA1E2_4BBA, 0xFFFF, 1).expect("target registered");
        assert_eq!(opened.channel, channel);
        assert_eq!(opened.status, 0);

        let transfer_response = session.build_pushdata_transfer_response(seq, opened.channel, opened.source, 0);
        let ack = Session::parse_pushdata_transfer_response(&transfer_response).expect("parse transfer ack");
        assert_eq!(ack.status, Session::pushdata_transfer_status(0));
        assert_eq!(ack.status, 0xC1);
    }

    #[test]
    fn closing_resolves_pending_with_no_master() {
        let session = Session::new();
        let rx = session.await_response(5);
        session.begin_closing();
        let result = rx.try_recv().expect("resolved");
        assert!(result.is_err());
        assert_eq!(session.state(), SessionState::Closing);
    }

    #[test]
    fn sequence_allocation_skips_reserved_login_value() {
        let session = Session::new();
        session.sequence.store(255, Ordering::SeqCst);
        let first = session.next_sequence(); // wraps to 0, which is skipped
        assert_ne!(first, codes::LOGIN_SEQUENCE);
    }

    #[test]
    fn unknown_command_gets_unknown_response() {
        let frame = Frame::new(0x1234, 9, Vec::new());
        let resp = Session::unknown_response(&frame);
        assert_eq!(resp.command, codes::UNKNOWN);
        assert_eq!(resp.sequence, 9);
        assert_eq!(u16::from_le_bytes([resp.body[0], resp.body[1]]), 0x1234);
    }
}
