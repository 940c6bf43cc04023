// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Push scheduler: rasterised fire-times, windowed transfer and
//! low-water-mark advance (C12, §4.11).

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};

use crate::{
    cache::{self, Cache},
    error::SegwError,
    ipt::{
        frame::{DEFAULT_MAX_FRAME_LEN, read_frame},
        session::{PUSHDATA_TRANSFER_ACK, Session},
    },
    readout::Profile,
    sml::{
        file::{SmlMessage, encode_file},
        messages::{MessageBody, ProfileEntry},
    },
    value::Value,
};

/// One `_PushOps` row (§3: "Push operation").
#[derive(Debug, Clone)]
pub struct PushOp {
    pub srv_id: Vec<u8>,
    pub nr: u32,
    pub push_interval: Duration,
    pub push_delay: Duration,
    pub source_obis: crate::obis::ObisPath,
    pub target_name: String,
    pub low_water_mark: u64,
}

/// Rasterises `interval`: clamp up to `profile`'s granularity, then
/// round down to a multiple of it (§4.11: "interval is clamped up to
/// the profile granularity, then rounded down to a multiple of it").
pub fn rasterize_interval(interval: Duration, profile: Profile) -> Duration {
    let granularity = Duration::from_secs(profile.granularity_secs() as u64);
    let clamped = interval.max(granularity);
    let secs = clamped.as_secs();
    let g = granularity.as_secs().max(1);
    Duration::from_secs((secs / g) * g)
}

/// The next fire-time strictly after `now`, on a rasterised grid
/// anchored at the Unix epoch.
pub fn next_fire_time(rasterized_interval: Duration, now_unix: i64) -> i64 {
    let period = rasterized_interval.as_secs().max(1) as i64;
    let next_tick = (now_unix / period + 1) * period;
    next_tick
}

/// Computes the target push window `(lowerBound, now]` (§4.11).
pub fn push_window(low_water_mark: u64, now_time_index: u64) -> Option<(u64, u64)> {
    if now_time_index <= low_water_mark {
        None
    } else {
        Some((low_water_mark, now_time_index))
    }
}

/// Collects `_DataMirror` rows for `srv_id` whose time-index falls in
/// `(lower, upper]` and wraps them as profile entries ready to encode
/// into a `GET_PROFILE_LIST_RES`.
pub fn collect_window(cache: &Cache, srv_id: &[u8], lower: u64, upper: u64) -> Vec<ProfileEntry> {
    let mirror = cache.table(cache::TABLE_DATA_MIRROR);
    let mut by_bucket: std::collections::BTreeMap<u64, Vec<(crate::obis::ObisPath, Value, i8, u8)>> =
        std::collections::BTreeMap::new();

    mirror.for_each(|key, row| {
        if key.first() != Some(&Value::Buffer(srv_id.to_vec())) {
            return;
        }
        let Some(bucket) = key.get(1).and_then(Value::as_u64) else {
            return;
        };
        if bucket <= lower || bucket > upper {
            return;
        }
        let (Some(Value::Str(obis_text)), Some(val), Some(scaler), Some(unit)) =
            (row.get("obis"), row.get("value"), row.get("scaler"), row.get("unit"))
        else {
            return;
        };
        let Ok(obis) = crate::obis::ObisPath::from_legacy_text(obis_text) else {
            return;
        };
        by_bucket.entry(bucket).or_default().push((
            obis,
            val.clone(),
            scaler.as_u64().unwrap_or(0) as i8,
            unit.as_u64().unwrap_or(0) as u8,
        ));
    });

    by_bucket
        .into_iter()
        .map(|(time_index, values)| ProfileEntry {
            time_index,
            act_time: 0,
            val_time: 0,
            status: 0,
            values,
        })
        .collect()
}

/// Splits `entries` into `packet_size`-sized `GET_PROFILE_LIST_RES`
/// message bodies for windowed transfer (§4.11: "transfer data in
/// `packet_size`-sized blocks with ack windowing `window_size`" — the
/// window/ack bookkeeping lives in the IP-T push-channel transfer loop
/// that calls this; this function only shapes the packets).
pub fn packetize(
    server_id: Vec<u8>,
    path: crate::obis::ObisPath,
    entries: Vec<ProfileEntry>,
    packet_size: usize,
) -> Vec<MessageBody> {
    if entries.is_empty() {
        return Vec::new();
    }
    entries
        .chunks(packet_size.max(1))
        .map(|chunk| MessageBody::GetProfileListRes {
            server_id: server_id.clone(),
            parameter_tree_path: path.clone(),
            entries: chunk.to_vec(),
        })
        .collect()
}

/// Wraps `bodies` as one SML file: one message per body, transaction id
/// derived from the push operation's channel number and a monotone
/// per-file counter (§4.11: "wrap them in SML `GET_PROFILE_LIST_RES`
/// messages under one SML file").
fn wrap_as_sml_file(op: &PushOp, bodies: Vec<MessageBody>) -> Vec<u8> {
    let messages: Vec<SmlMessage> = bodies
        .into_iter()
        .enumerate()
        .map(|(i, body)| SmlMessage {
            transaction_id: [op.nr.to_le_bytes().as_slice(), &[i as u8]].concat(),
            group_no: 0,
            abort_on_error: 0,
            body: body.encode(),
        })
        .collect();
    encode_file(&messages)
}

/// Runs one push attempt over `transport`: opens a push channel for the
/// operation's registered target, transfers the window's data in
/// `packet_size`-sized blocks, and closes the channel. Advances
/// `low_water_mark` only on full success (P6: monotone, and only on
/// success); returns the new mark. Skipped silently (mark unchanged) if
/// the session isn't online, and on any transfer failure the mark is
/// left unchanged so the next tick retries the same window (§4.11).
pub async fn attempt_push<T>(
    cache: &Cache,
    session: &Session,
    transport: &mut T,
    op: &PushOp,
    now_time_index: u64,
    packet_size: usize,
) -> u64
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    use crate::ipt::session::SessionState;

    if session.state() != SessionState::Online {
        return op.low_water_mark;
    }

    let Some((lower, upper)) = push_window(op.low_water_mark, now_time_index) else {
        return op.low_water_mark;
    };

    let entries = collect_window(cache, &op.srv_id, lower, upper);
    if entries.is_empty() {
        return op.low_water_mark;
    }

    let Some(target_name) = session.target_for_channel(op.nr) else {
        warn!(nr = op.nr, "no registered push target for this operation; skipping");
        return op.low_water_mark;
    };

    let packets = packetize(op.srv_id.clone(), op.source_obis.clone(), entries, packet_size);
    let sml_file = wrap_as_sml_file(op, packets);
    info!(target = %target_name, bytes = sml_file.len(), "push window ready for transfer");

    match run_push_transfer(session, transport, &target_name, op, &sml_file, packet_size).await {
        Ok(()) => upper,
        Err(e) => {
            warn!(target = %target_name, error = %e, "push transfer failed, retrying next tick");
            op.low_water_mark
        },
    }
}

/// Drives the open/transfer/close push-channel exchange for one window
/// of data (§4.3, §4.11).
async fn run_push_transfer<T>(
    session: &Session,
    transport: &mut T,
    target_name: &str,
    op: &PushOp,
    sml_file: &[u8],
    packet_size: usize,
) -> Result<(), SegwError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let (_, open_req) = session.build_open_push_channel_request(
        target_name,
        target_name,
        &op.nr.to_string(),
        "1.0",
        &hex::encode(&op.srv_id),
        30,
    );
    send_frame(transport, &open_req).await?;
    let open_res = read_frame(transport, DEFAULT_MAX_FRAME_LEN).await?;
    let opened = Session::parse_open_push_channel_response(&open_res)?;
    if opened.status != 0 {
        return Err(SegwError::protocol(format!("open push channel refused, status {:#04x}", opened.status)));
    }

    for (block, chunk) in sml_file.chunks(packet_size.max(1)).enumerate() {
        let (_, transfer_req) =
            session.build_pushdata_transfer_request(opened.channel, opened.source, block as u16, chunk);
        send_frame(transport, &transfer_req).await?;
        let transfer_res = read_frame(transport, DEFAULT_MAX_FRAME_LEN).await?;
        let ack = Session::parse_pushdata_transfer_response(&transfer_res)?;
        if ack.status & PUSHDATA_TRANSFER_ACK != PUSHDATA_TRANSFER_ACK {
            return Err(SegwError::protocol(format!("push block {block} not acknowledged, status {:#04x}", ack.status)));
        }
    }

    let (_, close_req) = session.build_close_push_channel_request(opened.channel);
    send_frame(transport, &close_req).await?;
    let close_res = read_frame(transport, DEFAULT_MAX_FRAME_LEN).await?;
    let (_, status) = Session::parse_close_push_channel_response(&close_res)?;
    if status != 0 {
        return Err(SegwError::protocol(format!("close push channel failed, status {:#04x}", status)));
    }
    Ok(())
}

async fn send_frame<T: AsyncWrite + Unpin>(transport: &mut T, frame: &crate::ipt::frame::Frame) -> Result<(), SegwError> {
    let wire = frame.to_wire(DEFAULT_MAX_FRAME_LEN)?;
    transport.write_all(&wire).await.map_err(|e| SegwError::transport(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rasterize_clamps_below_granularity_up_to_it() {
        let r = rasterize_interval(Duration::from_secs(30), Profile::FifteenMinutes);
        assert_eq!(r, Duration::from_secs(900));
    }

    #[test]
    fn rasterize_rounds_down_to_a_multiple() {
        let r = rasterize_interval(Duration::from_secs(2000), Profile::FifteenMinutes);
        assert_eq!(r, Duration::from_secs(1800));
    }

    /// P6: low-water-mark only ever advances, never regresses.
    #[test]
    fn push_window_is_none_when_caught_up() {
        assert_eq!(push_window(10, 10), None);
        assert_eq!(push_window(10, 9), None);
        assert_eq!(push_window(10, 15), Some((10, 15)));
    }

    #[test]
    fn packetize_splits_into_chunks() {
        let entries = (0..5)
            .map(|i| ProfileEntry { time_index: i, act_time: 0, val_time: 0, status: 0, values: vec![] })
            .collect();
        let packets = packetize(vec![1], crate::obis::ObisPath::new(), entries, 2);
        assert_eq!(packets.len(), 3);
    }

    #[test]
    fn packetize_of_empty_window_produces_no_packets() {
        let packets = packetize(vec![1], crate::obis::ObisPath::new(), vec![], 5);
        assert!(packets.is_empty());
    }
}
