// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use corriere_proto::headers::TransInfo;
use corriere_proto::Status;
use tokio::sync::{mpsc, oneshot};

use crate::flow::{SendCreditError, SendFlow};
use crate::StreamError;

/// Who is calling what, carried in the INIT metadata.
#[derive(Clone, Debug, Default)]
pub struct CallInfo {
    pub caller: String,
    pub callee: String,
    pub func: String,
    pub message_type: u32,
    pub content_type: u32,
    pub content_encoding: u32,
    pub trans_info: TransInfo,
}

/// Writer-side operations posted to the connection loop that owns the
/// stream state.
#[derive(Debug)]
pub enum StreamOp {
    SendData { id: u32, body: Bytes },
    SendClose { id: u32, status: Status },
    SendReset { id: u32, status: Status },
}

/// What the handler delivers into a reader's inbox.
#[derive(Debug)]
pub(crate) enum StreamItem {
    Data(Bytes),
    /// Clean end of stream, with the trans-info the CLOSE frame carried.
    Eof(TransInfo),
    Error(StreamError),
}

/// Receiving half of a stream.
///
/// Frames are yielded in exactly the order they arrived on the wire.
#[derive(Debug)]
pub struct StreamReader {
    id: u32,
    items: mpsc::UnboundedReceiver<StreamItem>,
    trailers: Option<TransInfo>,
    finished: bool,
}

impl StreamReader {
    pub(crate) fn new(id: u32, items: mpsc::UnboundedReceiver<StreamItem>) -> Self {
        StreamReader {
            id,
            items,
            trailers: None,
            finished: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Trans-info carried by the peer's CLOSE. Present after [`recv`]
    /// returned the end of stream.
    ///
    /// [`recv`]: Self::recv
    pub fn trailers(&self) -> Option<&TransInfo> {
        self.trailers.as_ref()
    }

    /// Waits for the next payload. `Ok(None)` is the clean end of stream.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, StreamError> {
        if self.finished {
            return Ok(None);
        }
        match self.items.recv().await {
            Some(StreamItem::Data(body)) => Ok(Some(body)),
            Some(StreamItem::Eof(trailers)) => {
                self.finished = true;
                self.trailers = Some(trailers);
                Ok(None)
            }
            Some(StreamItem::Error(error)) => {
                self.finished = true;
                Err(error)
            }
            // The handler vanished without a verdict; the connection is gone.
            None => {
                self.finished = true;
                Err(StreamError::Closed { id: self.id })
            }
        }
    }

    /// [`recv`](Self::recv) with a deadline.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Bytes>, StreamError> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(result) => result,
            Err(_) => Err(StreamError::ReadTimeout { id: self.id }),
        }
    }
}

/// Sending half of a stream.
#[derive(Debug)]
pub struct StreamWriter {
    id: u32,
    ops: mpsc::UnboundedSender<StreamOp>,
    flow: Arc<SendFlow>,
    closed: bool,
}

impl StreamWriter {
    pub(crate) fn new(id: u32, ops: mpsc::UnboundedSender<StreamOp>, flow: Arc<SendFlow>) -> Self {
        StreamWriter {
            id,
            ops,
            flow,
            closed: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Sends one DATA payload, suspending until send-window credit covers
    /// it.
    pub async fn send(&mut self, body: Bytes) -> Result<(), StreamError> {
        if self.closed {
            return Err(StreamError::Closed { id: self.id });
        }

        self.flow
            .acquire(body.len() as u32)
            .await
            .map_err(|error| match error {
                SendCreditError::StreamGone => StreamError::Closed { id: self.id },
                SendCreditError::PayloadTooLarge { len, window } => {
                    StreamError::PayloadTooLarge {
                        id: self.id,
                        len,
                        window,
                    }
                }
            })?;

        self.ops
            .send(StreamOp::SendData {
                id: self.id,
                body,
            })
            .map_err(|_| StreamError::Closed { id: self.id })
    }

    /// Ends this direction cleanly.
    pub fn close(&mut self) -> Result<(), StreamError> {
        self.close_with(Status::OK)
    }

    /// Ends this direction, carrying `status` in the CLOSE metadata.
    pub fn close_with(&mut self, status: Status) -> Result<(), StreamError> {
        if self.closed {
            return Err(StreamError::Closed { id: self.id });
        }
        self.closed = true;
        self.ops
            .send(StreamOp::SendClose {
                id: self.id,
                status,
            })
            .map_err(|_| StreamError::Closed { id: self.id })
    }

    /// Tears the whole stream down abortively.
    pub fn reset(&mut self, status: Status) -> Result<(), StreamError> {
        self.closed = true;
        self.ops
            .send(StreamOp::SendReset {
                id: self.id,
                status,
            })
            .map_err(|_| StreamError::Closed { id: self.id })
    }
}

/// A client stream whose INIT round trip is still in flight.
#[derive(Debug)]
pub struct PendingStream {
    pub(crate) reader: StreamReader,
    pub(crate) writer: StreamWriter,
    pub(crate) ready: oneshot::Receiver<Result<(), StreamError>>,
}

impl PendingStream {
    pub fn stream_id(&self) -> u32 {
        self.reader.id()
    }

    /// Waits for the server's INIT reply and hands out the working halves.
    pub async fn ready(self) -> Result<(StreamReader, StreamWriter), StreamError> {
        match self.ready.await {
            Ok(Ok(())) => Ok((self.reader, self.writer)),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(StreamError::network(
                crate::StreamRole::Client,
                "connection closed before the INIT reply",
            )),
        }
    }
}
