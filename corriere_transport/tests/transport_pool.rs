// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! Connection-pool transport: free-list handoff, pending queue, pinning.

mod support;

use std::time::Duration;

use bytes::Bytes;
use corriere_proto::headers::{InitResponseMeta, StreamCloseMeta, StreamInitMeta};
use corriere_proto::{Frame, StreamData, StreamInit};
use corriere_stream::CallInfo;
use corriere_transport::{ClientError, ConnPool, TransportOptions};

use support::{echo_reply, request_frame, spawn_server};

fn pool_options(max_conn_num: usize) -> TransportOptions {
    TransportOptions {
        max_conn_num,
        ..TransportOptions::default()
    }
}

#[tokio::test]
async fn more_requests_than_connectors_drain_through_the_pending_queue() {
    let addr = spawn_server(|| {
        |frame: Bytes| vec![(Duration::from_millis(30), echo_reply(&frame))]
    })
    .await;
    let pool = ConnPool::connect(addr, pool_options(2));

    let mut handles = Vec::new();
    for id in 1..=6u32 {
        let pool = pool.clone();
        handles.push(tokio::spawn(async move {
            pool.invoke(id, request_frame(id, b"queued"), Duration::from_secs(2))
                .await
        }));
    }
    for (index, handle) in handles.into_iter().enumerate() {
        let response = handle.await.unwrap().unwrap();
        assert_eq!(response.header.request_id, index as u32 + 1);
        assert_eq!(response.body, Bytes::from_static(b"queued"));
    }
}

#[tokio::test]
async fn pending_waiter_times_out_with_its_own_deadline() {
    let addr = spawn_server(|| {
        |frame: Bytes| vec![(Duration::from_millis(250), echo_reply(&frame))]
    })
    .await;
    let pool = ConnPool::connect(addr, pool_options(1));

    let slow = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.invoke(1, request_frame(1, b"slow"), Duration::from_secs(2))
                .await
        })
    };
    // Give the first request the only connector.
    tokio::time::sleep(Duration::from_millis(20)).await;

    let error = pool
        .invoke(2, request_frame(2, b"waiter"), Duration::from_millis(60))
        .await
        .unwrap_err();
    assert!(matches!(error, ClientError::InvokeTimeout(_)), "{error}");

    let response = slow.await.unwrap().unwrap();
    assert_eq!(response.header.request_id, 1);
}

#[tokio::test]
async fn a_pinned_connector_leaves_the_free_list_until_released() {
    let addr = spawn_server(|| |frame: Bytes| vec![(Duration::ZERO, echo_reply(&frame))]).await;
    let pool = ConnPool::connect(addr, pool_options(1));

    let pinned = pool.pin().await.unwrap();
    assert_eq!(pinned.index(), 0);

    // The only connector is pinned, so this invoke has to wait.
    let waiting = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.invoke(5, request_frame(5, b"after pin"), Duration::from_secs(2))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiting.is_finished(), "must wait while the pin holds");

    drop(pinned);
    let response = waiting.await.unwrap().unwrap();
    assert_eq!(response.header.request_id, 5);
}

#[tokio::test]
async fn pinning_with_no_free_connector_is_refused() {
    let addr = spawn_server(|| |frame: Bytes| vec![(Duration::ZERO, echo_reply(&frame))]).await;
    let pool = ConnPool::connect(addr, pool_options(1));

    let _first = pool.pin().await.unwrap();
    let error = pool.pin().await.unwrap_err();
    assert!(matches!(error, ClientError::Overload(_)), "{error}");
}

#[tokio::test]
async fn streams_ride_on_a_pinned_connector() {
    let addr = spawn_server(|| {
        |frame: Bytes| match Frame::decode_server(frame.clone()) {
            Ok(Frame::Init(init)) => {
                let id = init.stream_id;
                vec![
                    (
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
                    ),
                    (
                        Duration::ZERO,
                        StreamData {
                            stream_id: id,
                            body: Bytes::from_static(b"pinned payload"),
                        }
                        .encode()
                        .unwrap(),
                    ),
                    (
                        Duration::ZERO,
                        corriere_proto::StreamClose {
                            stream_id: id,
                            meta: StreamCloseMeta::default(),
                        }
                        .encode()
                        .unwrap(),
                    ),
                ]
            }
            _ => vec![(Duration::ZERO, echo_reply(&frame))],
        }
    })
    .await;
    let pool = ConnPool::connect(addr, pool_options(2));

    let pinned = pool.pin().await.unwrap();
    let (mut reader, _writer) = pinned
        .open_stream(CallInfo {
            caller: "test_client".into(),
            func: "/svc/pinned".into(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(
        reader.recv().await.unwrap(),
        Some(Bytes::from_static(b"pinned payload"))
    );
    assert_eq!(reader.recv().await.unwrap(), None);

    // The unpinned connector still serves unary traffic meanwhile.
    let response = pool
        .invoke(9, request_frame(9, b"meanwhile"), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(response.header.request_id, 9);
}
