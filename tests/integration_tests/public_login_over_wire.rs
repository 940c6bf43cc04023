// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! S1: public login accept, driven over an actual framed transport
//! instead of calling the session directly.

use segw_rs::ipt::{
    codes,
    frame::{DEFAULT_MAX_FRAME_LEN, Frame, read_frame},
    session::{Session, SessionState},
};

use crate::integration_tests::common::wire_pair;

#[tokio::test]
async fn public_login_accept_round_trips_over_the_wire() {
    let (mut master, mut gateway) = wire_pair();

    let gateway_task = tokio::spawn(async move {
        let request = read_frame(&mut gateway, DEFAULT_MAX_FRAME_LEN).await.expect("read login request");
        assert_eq!(request.command, codes::CTRL_REQ_LOGIN_PUBLIC);
        assert_eq!(request.sequence, codes::LOGIN_SEQUENCE);

        let session = Session::new();
        let outcome = session.accept_public_login(12, "");
        assert_eq!(session.state(), SessionState::Authorized);

        let mut body = outcome.watchdog_minutes.to_le_bytes().to_vec();
        body.extend_from_slice(outcome.redirect.as_bytes());
        let response = Frame::new(codes::CTRL_RES_LOGIN_PUBLIC, codes::LOGIN_SEQUENCE, body);
        let wire = response.to_wire(DEFAULT_MAX_FRAME_LEN).expect("encode response");
        tokio::io::AsyncWriteExt::write_all(&mut gateway, &wire).await.expect("write response");
    });

    let request = Frame::new(codes::CTRL_REQ_LOGIN_PUBLIC, codes::LOGIN_SEQUENCE, b"user\x00pass".to_vec());
    let wire = request.to_wire(DEFAULT_MAX_FRAME_LEN).expect("encode request");
    tokio::io::AsyncWriteExt::write_all(&mut master, &wire).await.expect("write request");

    let response = read_frame(&mut master, DEFAULT_MAX_FRAME_LEN).await.expect("read response");
    gateway_task.await.expect("gateway task");

    assert_eq!(response.command, codes::CTRL_RES_LOGIN_PUBLIC);
    let watchdog_minutes = u16::from_le_bytes(response.body[0..2].try_into().expect("2 bytes"));
    assert_eq!(watchdog_minutes, 12);
}
