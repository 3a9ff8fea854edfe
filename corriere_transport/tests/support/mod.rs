// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

#![allow(dead_code)] // each test binary uses its own subset

//! A scriptable in-process peer for transport tests: accepts connections,
//! splits whole frames and lets each test decide what to send back, with
//! an optional delay per reply. An empty reply frame makes the server shut
//! its write half, which the client observes as a peer close.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use corriere_proto::headers::{RequestHeader, ResponseHeader};
use corriere_proto::{check_frames, Request, Response};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Replies a handler wants sent, each after its own delay.
pub type Replies = Vec<(Duration, Bytes)>;

/// Starts a server; `factory` builds one handler per accepted connection.
pub async fn spawn_server<F, H>(factory: F) -> SocketAddr
where
    F: Fn() -> H + Send + Sync + 'static,
    H: FnMut(Bytes) -> Replies + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let mut handler = factory();

            tokio::spawn(async move {
                let (mut read_half, mut write_half) = stream.into_split();
                let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Bytes>();

                let writer = tokio::spawn(async move {
                    while let Some(frame) = reply_rx.recv().await {
                        if frame.is_empty() {
                            // Sentinel: shut the write half, the peer sees EOF.
                            break;
                        }
                        if write_half.write_all(&frame).await.is_err() {
                            break;
                        }
                    }
                });

                let mut buf = BytesMut::new();
                let mut frames = VecDeque::new();
                loop {
                    match read_half.read_buf(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            if check_frames(0, &mut buf, &mut frames).is_err() {
                                break;
                            }
                            for frame in frames.drain(..) {
                                for (delay, reply) in handler(frame) {
                                    if delay.is_zero() {
                                        let _ = reply_tx.send(reply);
                                    } else {
                                        let tx = reply_tx.clone();
                                        tokio::spawn(async move {
                                            tokio::time::sleep(delay).await;
                                            let _ = tx.send(reply);
                                        });
                                    }
                                }
                            }
                        }
                    }
                }
                writer.abort();
            });
        }
    });

    addr
}

/// An encoded unary request.
pub fn request_frame(request_id: u32, body: &'static [u8]) -> Bytes {
    Request {
        header: RequestHeader {
            request_id,
            timeout: 1000,
            caller: "test_client".into(),
            callee: "corriere.test.echo".into(),
            func: "/corriere.test.echo/echo".into(),
            ..Default::default()
        },
        body: Bytes::from_static(body),
        attachment: Bytes::new(),
    }
    .encode()
    .unwrap()
}

/// Echoes a request frame back as a response carrying the same body.
pub fn echo_reply(frame: &Bytes) -> Bytes {
    let request = Request::decode(frame.clone()).unwrap();
    Response {
        header: ResponseHeader {
            request_id: request.header.request_id,
            ..Default::default()
        },
        body: request.body,
        attachment: Bytes::new(),
    }
    .encode()
    .unwrap()
}

/// A response frame with an arbitrary request id and body.
pub fn response_frame(request_id: u32, body: &'static [u8]) -> Bytes {
    Response {
        header: ResponseHeader {
            request_id,
            ..Default::default()
        },
        body: Bytes::from_static(body),
        attachment: Bytes::new(),
    }
    .encode()
    .unwrap()
}

/// A response frame with an owned body.
pub fn response_frame_owned(request_id: u32, body: Vec<u8>) -> Bytes {
    Response {
        header: ResponseHeader {
            request_id,
            ..Default::default()
        },
        body: Bytes::from(body),
        attachment: Bytes::new(),
    }
    .encode()
    .unwrap()
}

/// The write-half shutdown sentinel.
pub fn close_marker() -> Bytes {
    Bytes::new()
}
