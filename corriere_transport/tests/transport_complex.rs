// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! Connection-complex transport against a live in-process peer.

mod support;

use std::time::{Duration, Instant};

use bytes::Bytes;
use corriere_proto::headers::{InitResponseMeta, StreamCloseMeta, StreamInitMeta};
use corriere_proto::{Frame, StreamClose, StreamData, StreamInit};
use corriere_stream::CallInfo;
use corriere_transport::{BackupRequest, ClientError, ConnComplex, InvokeRequest, TransportOptions};
use tokio::sync::oneshot;

use support::{close_marker, echo_reply, request_frame, response_frame, spawn_server};

fn call_info(func: &str) -> CallInfo {
    CallInfo {
        caller: "test_client".into(),
        callee: "corriere.test.streaming".into(),
        func: func.into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn invoke_round_trip() {
    let addr = spawn_server(|| |frame: Bytes| vec![(Duration::ZERO, echo_reply(&frame))]).await;
    let transport = ConnComplex::connect(addr, TransportOptions::default());

    let response = transport
        .invoke(7, request_frame(7, b"ping"), Duration::from_secs(1))
        .await
        .unwrap();

    assert_eq!(response.header.request_id, 7);
    assert_eq!(response.body, Bytes::from_static(b"ping"));
}

#[tokio::test]
async fn one_connection_multiplexes_concurrent_requests() {
    let addr = spawn_server(|| {
        |frame: Bytes| {
            // Stagger replies so completions interleave.
            let reply = echo_reply(&frame);
            let delay = Duration::from_millis((reply.len() % 7) as u64 * 5);
            vec![(delay, reply)]
        }
    })
    .await;
    let transport = ConnComplex::connect(addr, TransportOptions::default());

    let mut handles = Vec::new();
    for id in 1..=10u32 {
        let transport = transport.clone();
        handles.push(tokio::spawn(async move {
            transport
                .invoke(id, request_frame(id, b"concurrent"), Duration::from_secs(1))
                .await
        }));
    }
    for (index, handle) in handles.into_iter().enumerate() {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.header.request_id, index as u32 + 1);
    }
}

#[tokio::test]
async fn timeout_fires_when_the_peer_stays_silent() {
    let addr = spawn_server(|| |_frame: Bytes| Vec::new()).await;
    let transport = ConnComplex::connect(addr, TransportOptions::default());

    let started = Instant::now();
    let error = transport
        .invoke(1, request_frame(1, b"void"), Duration::from_millis(80))
        .await
        .unwrap_err();

    assert!(matches!(error, ClientError::InvokeTimeout(_)), "{error}");
    assert!(started.elapsed() >= Duration::from_millis(80));
}

#[tokio::test]
async fn response_with_unknown_request_id_is_discarded() {
    let addr =
        spawn_server(|| |_frame: Bytes| vec![(Duration::ZERO, response_frame(999, b"stray"))])
            .await;
    let transport = ConnComplex::connect(addr, TransportOptions::default());

    let error = transport
        .invoke(1, request_frame(1, b"x"), Duration::from_millis(80))
        .await
        .unwrap_err();
    assert!(matches!(error, ClientError::InvokeTimeout(_)));
}

#[tokio::test]
async fn peer_close_fails_requests_in_flight() {
    let addr = spawn_server(|| |_frame: Bytes| vec![(Duration::ZERO, close_marker())]).await;
    let transport = ConnComplex::connect(addr, TransportOptions::default());

    let started = Instant::now();
    let error = transport
        .invoke(1, request_frame(1, b"bye"), Duration::from_secs(2))
        .await
        .unwrap_err();

    assert!(matches!(error, ClientError::Network(_)), "{error}");
    assert!(started.elapsed() < Duration::from_secs(1), "must not wait for the deadline");
}

#[tokio::test]
async fn connect_refused_surfaces_as_connect_error() {
    // Bind then drop, so the port is (very likely) unoccupied.
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let transport = ConnComplex::connect(addr, TransportOptions::default());

    let error = transport
        .invoke(1, request_frame(1, b"x"), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(error, ClientError::Connect(_)), "{error}");

    // The follow-up attempt is rate limited for connect_interval.
    let error = transport
        .invoke(2, request_frame(2, b"x"), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(error, ClientError::Connect(_)), "{error}");
}

#[tokio::test]
async fn backup_request_hedges_and_the_first_reply_wins() {
    // The primary peer answers late; the hedge peer answers at once.
    let slow = spawn_server(|| {
        |frame: Bytes| {
            let request = corriere_proto::Request::decode(frame).unwrap();
            vec![(
                Duration::from_millis(300),
                support::response_frame_owned(request.header.request_id, b"slow".to_vec()),
            )]
        }
    })
    .await;
    let fast = spawn_server(|| {
        |frame: Bytes| {
            let request = corriere_proto::Request::decode(frame).unwrap();
            vec![(
                Duration::ZERO,
                support::response_frame_owned(request.header.request_id, b"fast".to_vec()),
            )]
        }
    })
    .await;

    let primary = ConnComplex::connect(slow, TransportOptions::default());
    let hedge_transport = ConnComplex::connect(fast, TransportOptions::default());

    let (hedge_tx, hedge_rx) = oneshot::channel();
    let (reply_tx, primary_rx) = oneshot::channel();
    primary.submit(InvokeRequest {
        request_id: 42,
        frame: request_frame(42, b"payload"),
        timeout: Duration::from_secs(1),
        backup: Some(BackupRequest {
            delay: Duration::from_millis(40),
            notify: hedge_tx,
        }),
        reply: reply_tx,
    });

    // The wheel fires after the hedge delay and asks us to dispatch a copy.
    hedge_rx.await.expect("hedge trigger must fire");
    let started = Instant::now();
    let hedged = hedge_transport
        .invoke(42, request_frame(42, b"payload"), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(hedged.body, Bytes::from_static(b"fast"));
    assert!(started.elapsed() < Duration::from_millis(200));

    // The primary's own (late) completion is an independent sink; whatever
    // it yields, the caller already went with the hedge. Wait for it so the
    // late response is provably consumed without crosstalk.
    let primary_result = primary_rx.await.expect("primary sink must settle");
    if let Ok(response) = primary_result {
        assert_eq!(response.body, Bytes::from_static(b"slow"));
    }
}

#[tokio::test]
async fn streaming_over_the_multiplexed_connection() {
    let addr = spawn_server(|| {
        |frame: Bytes| match Frame::decode_server(frame).unwrap() {
            Frame::Init(init) => {
                let id = init.stream_id;
                let mut replies = vec![(
                    Duration::ZERO,
                    StreamInit {
                        stream_id: id,
                        meta: StreamInitMeta {
                            response_meta: Some(InitResponseMeta::default()),
                            init_window_size: 65535,
                            ..Default::default()
                        },
                    }
                    .encode()
                    .unwrap(),
                )];
                for chunk in 0..10u8 {
                    replies.push((
                        Duration::ZERO,
                        StreamData {
                            stream_id: id,
                            body: Bytes::from(vec![chunk; 8]),
                        }
                        .encode()
                        .unwrap(),
                    ));
                }
                replies.push((
                    Duration::ZERO,
                    StreamClose {
                        stream_id: id,
                        meta: StreamCloseMeta::default(),
                    }
                    .encode()
                    .unwrap(),
                ));
                replies
            }
            _ => Vec::new(),
        }
    })
    .await;

    let transport = ConnComplex::connect(addr, TransportOptions::default());
    let (mut reader, _writer) = transport
        .open_stream(call_info("/svc/subscribe"))
        .await
        .unwrap();

    for chunk in 0..10u8 {
        let body = reader.recv().await.unwrap().expect("expected payload");
        assert_eq!(body, Bytes::from(vec![chunk; 8]));
    }
    assert_eq!(reader.recv().await.unwrap(), None, "expected EOF");
}
