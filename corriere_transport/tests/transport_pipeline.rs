// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! Pipeline transport: FIFO correspondence and its violation.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use corriere_proto::Request;
use corriere_transport::{ClientError, InvokeRequest, Pipeline, TransportOptions};
use tokio::sync::oneshot;

use support::{echo_reply, request_frame, spawn_server};

fn pipeline_options(max_conn_num: usize) -> TransportOptions {
    TransportOptions {
        max_conn_num,
        ..TransportOptions::default()
    }
}

#[tokio::test]
async fn responses_complete_in_submission_order() {
    let addr = spawn_server(|| |frame: Bytes| vec![(Duration::ZERO, echo_reply(&frame))]).await;
    let pipeline = Pipeline::connect(addr, pipeline_options(1));

    let (reply1, mut rx1) = oneshot::channel();
    let (reply2, rx2) = oneshot::channel();
    pipeline.submit(InvokeRequest {
        request_id: 1,
        frame: request_frame(1, b"first"),
        timeout: Duration::from_secs(1),
        backup: None,
        reply: reply1,
    });
    pipeline.submit(InvokeRequest {
        request_id: 2,
        frame: request_frame(2, b"second"),
        timeout: Duration::from_secs(1),
        backup: None,
        reply: reply2,
    });

    // Once the second completion is visible, the first must already be:
    // completions are delivered strictly in submission order.
    let second = rx2.await.unwrap().unwrap();
    assert_eq!(second.header.request_id, 2);
    let first = rx1
        .try_recv()
        .expect("first completion must precede the second")
        .unwrap();
    assert_eq!(first.header.request_id, 1);
}

#[tokio::test]
async fn out_of_order_response_is_fatal_for_the_connection() {
    // Reply to request 7 late and request 8 immediately: the wire carries
    // 8 before 7, which breaks the pipeline contract.
    let addr = spawn_server(|| {
        |frame: Bytes| {
            let request = Request::decode(frame.clone()).unwrap();
            let delay = if request.header.request_id == 7 {
                Duration::from_millis(80)
            } else {
                Duration::ZERO
            };
            vec![(delay, echo_reply(&frame))]
        }
    })
    .await;
    let pipeline = Pipeline::connect(addr, pipeline_options(1));

    let (reply7, rx7) = oneshot::channel();
    let (reply8, rx8) = oneshot::channel();
    pipeline.submit(InvokeRequest {
        request_id: 7,
        frame: request_frame(7, b"slow"),
        timeout: Duration::from_secs(2),
        backup: None,
        reply: reply7,
    });
    pipeline.submit(InvokeRequest {
        request_id: 8,
        frame: request_frame(8, b"fast"),
        timeout: Duration::from_secs(2),
        backup: None,
        reply: reply8,
    });

    let error7 = rx7.await.unwrap().unwrap_err();
    let error8 = rx8.await.unwrap().unwrap_err();
    assert!(matches!(error7, ClientError::Network(_)), "{error7}");
    assert!(matches!(error8, ClientError::Network(_)), "{error8}");
}

#[tokio::test]
async fn requests_round_robin_across_connections() {
    let seen = Arc::new([AtomicUsize::new(0), AtomicUsize::new(0)]);
    let connection_counter = Arc::new(AtomicUsize::new(0));

    let addr = {
        let seen = Arc::clone(&seen);
        spawn_server(move || {
            let connection = connection_counter.fetch_add(1, Ordering::SeqCst);
            let seen = Arc::clone(&seen);
            move |frame: Bytes| {
                seen[connection.min(1)].fetch_add(1, Ordering::SeqCst);
                vec![(Duration::ZERO, echo_reply(&frame))]
            }
        })
        .await
    };
    let pipeline = Pipeline::connect(addr, pipeline_options(2));

    for id in 1..=4u32 {
        let response = pipeline
            .invoke(id, request_frame(id, b"rr"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(response.header.request_id, id);
    }

    assert_eq!(seen[0].load(Ordering::SeqCst), 2);
    assert_eq!(seen[1].load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn timed_out_entry_keeps_the_fifo_intact() {
    // First request is answered too late, second in time; the late reply
    // must be consumed in order and dropped, not shift the queue.
    let addr = spawn_server(|| {
        |frame: Bytes| {
            let request = Request::decode(frame.clone()).unwrap();
            let delay = if request.header.request_id == 1 {
                Duration::from_millis(120)
            } else {
                Duration::from_millis(140)
            };
            vec![(delay, echo_reply(&frame))]
        }
    })
    .await;
    let pipeline = Pipeline::connect(addr, pipeline_options(1));

    let (reply1, rx1) = oneshot::channel();
    let (reply2, rx2) = oneshot::channel();
    pipeline.submit(InvokeRequest {
        request_id: 1,
        frame: request_frame(1, b"late"),
        timeout: Duration::from_millis(50),
        backup: None,
        reply: reply1,
    });
    pipeline.submit(InvokeRequest {
        request_id: 2,
        frame: request_frame(2, b"ok"),
        timeout: Duration::from_secs(1),
        backup: None,
        reply: reply2,
    });

    let error = rx1.await.unwrap().unwrap_err();
    assert!(matches!(error, ClientError::InvokeTimeout(_)), "{error}");

    let response = rx2.await.unwrap().unwrap();
    assert_eq!(response.header.request_id, 2);
    assert_eq!(response.body, Bytes::from_static(b"ok"));
}
