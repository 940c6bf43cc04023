// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! S3: push target register, channel open and windowed data transfer,
//! driven over an actual framed transport instead of calling the
//! session directly. The simulated master's acknowledgement status is
//! computed by [`segw_rs::ipt::session::Session::pushdata_transfer_status`]
//! rather than hard-coded, so this exercises the same production byte
//! the gateway side checks.

use segw_rs::{
    cache::{self, Cache},
    ipt::{
        codes,
        frame::{DEFAULT_MAX_FRAME_LEN, Frame, read_frame},
        session::{Session, SessionState, parse_open_push_channel_request},
    },
    obis::ObisPath,
    push::{self, PushOp},
    value::Value,
};
use tokio::io::AsyncWriteExt;

use crate::integration_tests::common::wire_pair;

fn seed_one_reading(cache: &Cache, srv_id: &[u8], bucket: u64) {
    cache.table(cache::TABLE_DATA_MIRROR).insert(
        cache::key([Value::Buffer(srv_id.to_vec()), Value::U64(bucket)]),
        cache::row([
            ("obis", Value::Str("1-0:1.8.0*255".into())),
            ("value", Value::U32(1234)),
            ("scaler", Value::U32(0)),
            ("unit", Value::U32(30)),
        ]),
        None,
    );
}

#[tokio::test]
async fn register_open_transfer_and_close_over_the_wire() {
    let srv_id = vec![0x01, 0x02, 0x03, 0x04];
    let cache = Cache::new();
    seed_one_reading(&cache, &srv_id, 5);

    let session = Session::new();
    session.go_online();
    assert_eq!(session.state(), SessionState::Online);
    let channel = session.register_target("power@ch1");

    let op = PushOp {
        srv_id: srv_id.clone(),
        nr: channel,
        push_interval: std::time::Duration::from_secs(900),
        push_delay: std::time::Duration::from_secs(0),
        source_obis: ObisPath::new(),
        target_name: "power@ch1".into(),
        low_water_mark: 0,
    };

    let (mut gateway, mut master) = wire_pair();

    let master_task = tokio::spawn(async move {
        let open_req = read_frame(&mut master, DEFAULT_MAX_FRAME_LEN).await.expect("read open request");
        assert_eq!(open_req.command, codes::TP_REQ_OPEN_PUSH_CHANNEL);
        let parsed = parse_open_push_channel_request(&open_req).expect("parse open request");
        assert_eq!(parsed.target, "power@ch1");

        let opened =
            session.accept_open_push_channel(&parsed, 0xA1E2_4BBA, 0xFFFF, 1).expect("target is registered");
        assert_eq!(opened.status, 0);
        assert_eq!(opened.target_count, 1);

        let mut open_res_body = opened.channel.to_le_bytes().to_vec();
        open_res_body.extend_from_slice(&opened.source.to_le_bytes());
        open_res_body.extend_from_slice(&opened.packet_size.to_le_bytes());
        open_res_body.push(opened.window_size);
        open_res_body.push(opened.status);
        open_res_body.push(opened.target_count);
        let open_res = Frame::new(codes::TP_RES_OPEN_PUSH_CHANNEL, open_req.sequence, open_res_body);
        let wire = open_res.to_wire(DEFAULT_MAX_FRAME_LEN).expect("encode open response");
        master.write_all(&wire).await.expect("write open response");

        let mut blocks_seen = 0u32;
        loop {
            let frame = read_frame(&mut master, DEFAULT_MAX_FRAME_LEN).await.expect("read next frame");
            match frame.command {
                codes::TP_REQ_PUSHDATA_TRANSFER => {
                    blocks_seen += 1;
                    let channel = u32::from_le_bytes(frame.body[0..4].try_into().expect("4 bytes"));
                    let source = u32::from_le_bytes(frame.body[4..8].try_into().expect("4 bytes"));
                    let block = u16::from_le_bytes(frame.body[9..11].try_into().expect("2 bytes"));
                    let response = session.build_pushdata_transfer_response(frame.sequence, channel, source, block);
                    let wire = response.to_wire(DEFAULT_MAX_FRAME_LEN).expect("encode transfer response");
                    master.write_all(&wire).await.expect("write transfer response");
                },
                codes::TP_REQ_CLOSE_PUSH_CHANNEL => {
                    let channel = u32::from_le_bytes(frame.body[0..4].try_into().expect("4 bytes"));
                    let mut body = channel.to_le_bytes().to_vec();
                    body.push(0);
                    let response = Frame::new(codes::TP_RES_CLOSE_PUSH_CHANNEL, frame.sequence, body);
                    let wire = response.to_wire(DEFAULT_MAX_FRAME_LEN).expect("encode close response");
                    master.write_all(&wire).await.expect("write close response");
                    break;
                },
                other => panic!("unexpected command {other:#06x}"),
            }
        }
        blocks_seen
    });

    let gateway_session = Session::new();
    gateway_session.go_online();
    let gateway_channel = gateway_session.register_target("power@ch1");
    assert_eq!(gateway_channel, channel);

    let new_mark = push::attempt_push(&cache, &gateway_session, &mut gateway, &op, 10, 4096).await;
    let blocks_seen = master_task.await.expect("master task");

    assert!(blocks_seen >= 1);
    assert_eq!(new_mark, 10);
}
