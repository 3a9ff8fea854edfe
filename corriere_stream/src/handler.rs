// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use std::sync::Arc;

use bytes::Bytes;
use corriere_proto::headers::{
    InitRequestMeta, InitResponseMeta, StreamCloseMeta, StreamInitMeta, TransInfo,
};
use corriere_proto::{
    CloseType, FrameMetadata, RetCode, Status, StreamClose, StreamData, StreamFeedback,
    StreamFrameType, StreamInit,
};
use hashbrown::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace};

use crate::flow::{RecvFlow, SendFlow};
use crate::state::permitted;
use crate::stream::{PendingStream, StreamItem};
use crate::{
    CallInfo, StreamAction, StreamError, StreamOp, StreamReader, StreamRole, StreamState,
    StreamWriter, StreamingDispatcher,
};

/// Client stream ids count up from here; 0 is reserved for unary traffic.
const CLIENT_STREAM_ID_START: u32 = 100;

/// How the handler classified one inbound frame.
#[derive(Debug)]
pub enum Routed {
    /// The frame belonged to the streaming subsystem and was consumed.
    Stream,
    /// A unary frame; the connection's request path must take it.
    Unary(Bytes),
}

#[derive(Clone)]
pub struct StreamHandlerOptions {
    pub role: StreamRole,
    /// Receive window advertised in INIT frames; 0 disables flow control.
    pub window_size: u32,
    /// Server-side dispatch; unused on the client.
    pub dispatcher: Option<Arc<dyn StreamingDispatcher>>,
}

struct StreamEntry {
    state: StreamState,
    call: CallInfo,
    to_reader: mpsc::UnboundedSender<StreamItem>,
    send_flow: Arc<SendFlow>,
    recv_flow: Option<RecvFlow>,
    /// Pending INIT round trip of a client stream.
    ready: Option<oneshot::Sender<Result<(), StreamError>>>,
}

impl StreamEntry {
    /// Terminates the entry with `error`, waking reader, writer and any
    /// pending open.
    fn fail(&mut self, error: StreamError) {
        self.state = StreamState::Closed;
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Err(error.clone()));
        }
        let _ = self.to_reader.send(StreamItem::Error(error));
        self.send_flow.fail();
    }

    /// Ends the read direction cleanly.
    fn finish(&mut self, trailers: TransInfo) {
        let _ = self.to_reader.send(StreamItem::Eof(trailers));
    }
}

/// Demultiplexer from connection frames to streams.
///
/// Owned by the task that owns the connection; every mutation happens on
/// that task. Writers on other tasks post [`StreamOp`]s through the channel
/// returned by [`StreamHandler::new`], and the owning task feeds them to
/// [`handle_op`](StreamHandler::handle_op).
pub struct StreamHandler {
    role: StreamRole,
    window_size: u32,
    dispatcher: Option<Arc<dyn StreamingDispatcher>>,
    streams: HashMap<u32, StreamEntry>,
    outbound: mpsc::UnboundedSender<Bytes>,
    ops_tx: mpsc::UnboundedSender<StreamOp>,
    next_stream_id: u32,
}

impl StreamHandler {
    pub fn new(
        options: StreamHandlerOptions,
        outbound: mpsc::UnboundedSender<Bytes>,
    ) -> (Self, mpsc::UnboundedReceiver<StreamOp>) {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let handler = StreamHandler {
            role: options.role,
            window_size: options.window_size,
            dispatcher: options.dispatcher,
            streams: HashMap::new(),
            outbound,
            ops_tx,
            next_stream_id: CLIENT_STREAM_ID_START,
        };
        (handler, ops_rx)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Opens a client stream: transmits INIT and hands back the halves plus
    /// a ready signal that fires on the server's INIT reply.
    pub fn open_stream(&mut self, call: CallInfo) -> Result<PendingStream, StreamError> {
        debug_assert_eq!(self.role, StreamRole::Client, "only clients open streams");

        let id = self.next_stream_id;
        self.next_stream_id += 1;

        let init = StreamInit {
            stream_id: id,
            meta: StreamInitMeta {
                request_meta: Some(InitRequestMeta {
                    caller: call.caller.clone(),
                    callee: call.callee.clone(),
                    func: call.func.clone(),
                    message_type: call.message_type,
                    trans_info: call.trans_info.clone(),
                }),
                response_meta: None,
                init_window_size: self.window_size,
                content_type: call.content_type,
                content_encoding: call.content_encoding,
            },
        };
        let frame = init.encode()?;
        if self.outbound.send(frame).is_err() {
            return Err(StreamError::network(self.role, "connection writer is gone"));
        }

        let (items_tx, items_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let send_flow = Arc::new(SendFlow::new());

        self.streams.insert(
            id,
            StreamEntry {
                // Idle -> SendInit -> Init.
                state: StreamState::Init,
                call,
                to_reader: items_tx,
                send_flow: Arc::clone(&send_flow),
                recv_flow: None,
                ready: Some(ready_tx),
            },
        );
        trace!(stream = id, "stream created");

        Ok(PendingStream {
            reader: StreamReader::new(id, items_rx),
            writer: StreamWriter::new(id, self.ops_tx.clone(), send_flow),
            ready: ready_rx,
        })
    }

    /// Routes one whole inbound frame.
    ///
    /// Returns `Routed::Unary` for frames the request path must take. An
    /// `Err` means the byte stream itself is broken and the connection must
    /// be dropped; per-stream trouble is settled internally with RESET.
    pub fn handle_frame(&mut self, frame: Bytes) -> Result<Routed, StreamError> {
        let meta = FrameMetadata::pick(&frame)?;
        if !meta.is_stream || meta.stream_id == 0 {
            return Ok(Routed::Unary(frame));
        }

        let id = meta.stream_id;
        match StreamFrameType::from_u8(meta.stream_frame_type) {
            Some(StreamFrameType::Init) => self.on_init(id, frame),
            Some(StreamFrameType::Data) => self.on_data(id, frame),
            Some(StreamFrameType::Feedback) => self.on_feedback(id, frame),
            Some(StreamFrameType::Close) => self.on_close(id, frame),
            Some(StreamFrameType::Unary) | None => {
                debug!(
                    stream = id,
                    frame_type = meta.stream_frame_type,
                    "dropping stream frame of unknown kind"
                );
                Ok(Routed::Stream)
            }
        }
    }

    /// Applies one writer-side operation.
    pub fn handle_op(&mut self, op: StreamOp) {
        match op {
            StreamOp::SendData { id, body } => self.op_send_data(id, body),
            StreamOp::SendClose { id, status } => self.op_send_close(id, status),
            StreamOp::SendReset { id, status } => self.op_send_reset(id, status),
        }
    }

    /// Fails every attached stream; the connection is gone.
    pub fn connection_closed(&mut self) {
        for (id, mut entry) in self.streams.drain() {
            trace!(stream = id, "stream torn down with the connection");
            entry.fail(StreamError::network(self.role, "connection closed"));
        }
    }

    fn on_init(&mut self, id: u32, frame: Bytes) -> Result<Routed, StreamError> {
        let init = match StreamInit::decode(frame) {
            Ok(init) => init,
            Err(error) => return self.on_decode_error(id, error),
        };

        if self.streams.contains_key(&id) {
            match self.role {
                // The server's INIT reply.
                StreamRole::Client => self.client_handle_init(id, init),
                // A second INIT on a live stream is never legal.
                StreamRole::Server => {
                    self.violation(id, StreamAction::HandleInit);
                    Ok(Routed::Stream)
                }
            }
        } else {
            match self.role {
                // The server cannot open streams towards us.
                StreamRole::Client => {
                    debug!(stream = id, "dropping INIT for unknown stream on client");
                    Ok(Routed::Stream)
                }
                StreamRole::Server => self.genesis(id, init),
            }
        }
    }

    /// Client side of the INIT round trip.
    fn client_handle_init(&mut self, id: u32, init: StreamInit) -> Result<Routed, StreamError> {
        if !self.check(id, StreamAction::HandleInit) {
            return Ok(Routed::Stream);
        }

        let response = init.meta.response_meta.unwrap_or_default();
        if response.ret != RetCode::Success.as_i32() {
            let status = Status {
                ret: response.ret,
                func_ret: 0,
                msg: response.error_msg,
            };
            error!(stream = id, %status, "server refused the stream");
            if let Some(mut entry) = self.streams.remove(&id) {
                entry.fail(StreamError::Remote { id, status });
            }
            return Ok(Routed::Stream);
        }

        let Some(entry) = self.streams.get_mut(&id) else {
            return Ok(Routed::Stream);
        };
        entry.state = StreamState::Open;

        // Flow control runs only when both ends advertise a window;
        // a zero from either side turns it off for compatibility with
        // peers that do not implement it.
        let send_window = init.meta.init_window_size;
        if send_window != 0 && self.window_size != 0 {
            entry.send_flow.enable(send_window);
            entry.recv_flow = Some(RecvFlow::new(self.window_size));
        } else {
            entry.send_flow.disable();
        }

        if let Some(ready) = entry.ready.take() {
            let _ = ready.send(Ok(()));
        }
        trace!(stream = id, send_window, "stream open");
        Ok(Routed::Stream)
    }

    /// Server side: a fresh stream id arrived with INIT.
    fn genesis(&mut self, id: u32, init: StreamInit) -> Result<Routed, StreamError> {
        let request = init.meta.request_meta.clone().unwrap_or_default();
        let call = CallInfo {
            caller: request.caller,
            callee: request.callee,
            func: request.func,
            message_type: request.message_type,
            content_type: init.meta.content_type,
            content_encoding: init.meta.content_encoding,
            trans_info: request.trans_info,
        };
        debug!(stream = id, func = %call.func, "incoming stream");

        // Idle -> HandleInit -> Init; then the INIT reply decides whether
        // the stream opens.
        let dispatcher = self.dispatcher.clone();
        let checked = match &dispatcher {
            Some(dispatcher) => dispatcher.check(&call.func),
            None => Err(Status::new(
                RetCode::ServerNoFunc,
                "no streaming dispatcher registered",
            )),
        };

        let peer_window = init.meta.init_window_size;
        let flow_on = peer_window != 0 && self.window_size != 0;
        let advertised = if flow_on { self.window_size } else { 0 };

        let (ret, error_msg) = match &checked {
            Ok(()) => (RetCode::Success.as_i32(), String::new()),
            Err(status) => {
                error!(stream = id, %status, "stream dispatch refused");
                (status.ret, status.msg.clone())
            }
        };
        let reply = StreamInit {
            stream_id: id,
            meta: StreamInitMeta {
                request_meta: None,
                response_meta: Some(InitResponseMeta { ret, error_msg }),
                init_window_size: advertised,
                content_type: call.content_type,
                content_encoding: call.content_encoding,
            },
        };
        self.transmit(reply.encode()?);

        if checked.is_err() {
            // The stream never opens; nothing to keep.
            return Ok(Routed::Stream);
        }

        let (items_tx, items_rx) = mpsc::unbounded_channel();
        let send_flow = Arc::new(SendFlow::new());
        if flow_on {
            send_flow.enable(peer_window);
        } else {
            send_flow.disable();
        }

        let reader = StreamReader::new(id, items_rx);
        let writer = StreamWriter::new(id, self.ops_tx.clone(), Arc::clone(&send_flow));

        self.streams.insert(
            id,
            StreamEntry {
                state: StreamState::Open,
                call: call.clone(),
                to_reader: items_tx,
                send_flow,
                recv_flow: flow_on.then(|| RecvFlow::new(self.window_size)),
                ready: None,
            },
        );

        if let Some(dispatcher) = dispatcher {
            dispatcher.handle(crate::StreamCall {
                caller: call.caller,
                func: call.func,
                content_type: call.content_type,
                trans_info: call.trans_info,
                reader,
                writer,
            });
        }
        Ok(Routed::Stream)
    }

    fn on_data(&mut self, id: u32, frame: Bytes) -> Result<Routed, StreamError> {
        let data = match StreamData::decode(frame) {
            Ok(data) => data,
            Err(error) => return self.on_decode_error(id, error),
        };

        if !self.streams.contains_key(&id) {
            return self.unknown_stream(id, "DATA");
        }
        if !self.check(id, StreamAction::HandleData) {
            return Ok(Routed::Stream);
        }

        let len = data.body.len() as u32;
        let mut feedback = None;
        let mut exceeded = None;
        if let Some(entry) = self.streams.get_mut(&id) {
            match entry.recv_flow.as_mut() {
                Some(flow) => match flow.consume(len) {
                    Ok(grant) => {
                        feedback = grant;
                        // Reader may already be gone; the payload is dropped.
                        let _ = entry.to_reader.send(StreamItem::Data(data.body));
                    }
                    Err(e) => exceeded = Some(e),
                },
                None => {
                    let _ = entry.to_reader.send(StreamItem::Data(data.body));
                }
            }
        }

        if let Some(e) = exceeded {
            // The peer ignored the window it was given.
            let error = StreamError::FlowViolation {
                id,
                got: e.got,
                remaining: e.remaining,
            };
            error!(stream = id, %error, "receive window violated");
            self.teardown(id, error);
            return Ok(Routed::Stream);
        }

        if let Some(increment) = feedback {
            let frame = StreamFeedback {
                stream_id: id,
                meta: corriere_proto::headers::StreamFeedbackMeta {
                    window_size_increment: increment,
                },
            }
            .encode()?;
            self.transmit(frame);
            trace!(stream = id, increment, "feedback sent");
        }
        Ok(Routed::Stream)
    }

    fn on_feedback(&mut self, id: u32, frame: Bytes) -> Result<Routed, StreamError> {
        let feedback = match StreamFeedback::decode(frame) {
            Ok(feedback) => feedback,
            Err(error) => return self.on_decode_error(id, error),
        };

        if !self.streams.contains_key(&id) {
            return self.unknown_stream(id, "FEEDBACK");
        }
        if !self.check(id, StreamAction::HandleFeedback) {
            return Ok(Routed::Stream);
        }

        if let Some(entry) = self.streams.get(&id) {
            entry.send_flow.grant(feedback.meta.window_size_increment);
            trace!(
                stream = id,
                increment = feedback.meta.window_size_increment,
                "send credit granted"
            );
        }
        Ok(Routed::Stream)
    }

    fn on_close(&mut self, id: u32, frame: Bytes) -> Result<Routed, StreamError> {
        let close = match StreamClose::decode(frame) {
            Ok(close) => close,
            Err(error) => return self.on_decode_error(id, error),
        };

        if !self.streams.contains_key(&id) {
            // Both peers closing at once leaves a trailing CLOSE; tolerated.
            trace!(stream = id, "CLOSE for a settled stream, ignored");
            return Ok(Routed::Stream);
        }

        let meta = close.meta;
        let mut status = Status {
            ret: meta.ret,
            func_ret: meta.func_ret,
            msg: meta.msg,
        };

        if CloseType::from_i32(meta.close_type) == Some(CloseType::Reset) {
            // RESET wins over everything; no state check.
            if status.is_ok() {
                // A reset is supposed to carry its reason.
                status = Status::new(RetCode::StreamUnknown, "stream reset without error detail");
            }
            error!(stream = id, %status, "stream reset by peer");
            if let Some(mut entry) = self.streams.remove(&id) {
                entry.fail(StreamError::Reset { id, status });
            }
            return Ok(Routed::Stream);
        }

        if !self.check(id, StreamAction::HandleClose) {
            return Ok(Routed::Stream);
        }

        match self.role {
            StreamRole::Client => {
                let Some(mut entry) = self.streams.remove(&id) else {
                    return Ok(Routed::Stream);
                };
                entry.state = StreamState::Closed;
                if status.is_ok() {
                    entry.finish(meta.trans_info);
                    entry.send_flow.fail();
                } else {
                    entry.fail(StreamError::Remote { id, status });
                }
                trace!(stream = id, "stream closed by server");
            }
            StreamRole::Server => {
                // Peer is done writing; tail writes stay permitted.
                if let Some(entry) = self.streams.get_mut(&id) {
                    entry.state = StreamState::RemoteClosed;
                    entry.finish(meta.trans_info);
                }
                trace!(stream = id, "stream remote-closed by client");
            }
        }
        Ok(Routed::Stream)
    }

    fn op_send_data(&mut self, id: u32, body: Bytes) {
        // The stream may have died while the op was in flight.
        if !self.streams.contains_key(&id) {
            trace!(stream = id, "dropping write to a settled stream");
            return;
        }
        if !self.check(id, StreamAction::SendData) {
            return;
        }

        match (StreamData {
            stream_id: id,
            body,
        })
        .encode()
        {
            Ok(frame) => self.transmit(frame),
            Err(error) => {
                let code = match self.role {
                    StreamRole::Client => RetCode::StreamClientEncodeError,
                    StreamRole::Server => RetCode::StreamServerEncodeError,
                };
                self.reset_with(id, Status::new(code, error.to_string()));
            }
        }
    }

    fn op_send_close(&mut self, id: u32, status: Status) {
        if !self.streams.contains_key(&id) {
            return;
        }
        if !self.check(id, StreamAction::SendClose) {
            return;
        }

        let trans_info = match (self.role, self.streams.get(&id)) {
            // The server's CLOSE carries its response trans-info.
            (StreamRole::Server, Some(entry)) => entry.call.trans_info.clone(),
            _ => TransInfo::default(),
        };
        let frame = StreamClose {
            stream_id: id,
            meta: StreamCloseMeta {
                close_type: CloseType::Close as i32,
                ret: status.ret,
                func_ret: status.func_ret,
                msg: status.msg,
                message_type: 0,
                trans_info,
            },
        };
        match frame.encode() {
            Ok(bytes) => self.transmit(bytes),
            Err(error) => {
                debug!(stream = id, %error, "failed to encode CLOSE");
                return;
            }
        }

        match self.role {
            StreamRole::Client => {
                if let Some(entry) = self.streams.get_mut(&id) {
                    entry.state = StreamState::LocalClosed;
                }
                trace!(stream = id, "stream local-closed");
            }
            StreamRole::Server => {
                if let Some(mut entry) = self.streams.remove(&id) {
                    entry.state = StreamState::Closed;
                    // Unblock a reader that never saw the client's CLOSE.
                    entry.finish(TransInfo::default());
                    entry.send_flow.fail();
                }
                trace!(stream = id, "stream closed");
            }
        }
    }

    fn op_send_reset(&mut self, id: u32, status: Status) {
        if !self.streams.contains_key(&id) {
            return;
        }
        self.reset_with(id, status);
    }

    /// Emits RESET for `id` and terminates the local entry.
    fn reset_with(&mut self, id: u32, status: Status) {
        self.send_reset_frame(id, status.clone());
        if let Some(mut entry) = self.streams.remove(&id) {
            entry.fail(StreamError::Reset { id, status });
        }
    }

    /// The path for every illegal (state, action) pair.
    fn violation(&mut self, id: u32, action: StreamAction) {
        let Some(mut entry) = self.streams.remove(&id) else {
            return;
        };
        let error = StreamError::Protocol {
            id,
            state: entry.state,
            action,
        };
        error!(stream = id, %error, "stream protocol violation");
        self.send_reset_frame(id, Status::new(RetCode::StreamUnknown, error.to_string()));
        entry.fail(error);
    }

    /// Checks the transition table; on violation the stream is reset and
    /// `false` comes back.
    fn check(&mut self, id: u32, action: StreamAction) -> bool {
        let Some(entry) = self.streams.get(&id) else {
            return false;
        };
        if permitted(self.role, entry.state, action) {
            true
        } else {
            self.violation(id, action);
            false
        }
    }

    fn teardown(&mut self, id: u32, error: StreamError) {
        let code = error.ret_code(self.role);
        self.send_reset_frame(id, Status::new(code, error.to_string()));
        if let Some(mut entry) = self.streams.remove(&id) {
            entry.fail(error);
        }
    }

    fn on_decode_error(
        &mut self,
        id: u32,
        error: corriere_proto::CodecError,
    ) -> Result<Routed, StreamError> {
        if self.streams.contains_key(&id) {
            error!(stream = id, %error, "stream frame failed to decode");
            self.teardown(id, StreamError::Codec(error));
        } else {
            debug!(stream = id, %error, "undecodable frame for unknown stream dropped");
        }
        Ok(Routed::Stream)
    }

    fn unknown_stream(&mut self, id: u32, kind: &'static str) -> Result<Routed, StreamError> {
        match self.role {
            StreamRole::Client => {
                debug!(stream = id, kind, "dropping frame for unknown stream");
            }
            StreamRole::Server => {
                // Tell the peer the stream does not exist on this side.
                debug!(stream = id, kind, "resetting unknown stream");
                self.send_reset_frame(
                    id,
                    Status::new(RetCode::StreamUnknown, "frame for unknown stream"),
                );
            }
        }
        Ok(Routed::Stream)
    }

    fn send_reset_frame(&mut self, id: u32, status: Status) {
        let frame = StreamClose {
            stream_id: id,
            meta: StreamCloseMeta {
                close_type: CloseType::Reset as i32,
                ret: status.ret,
                func_ret: status.func_ret,
                msg: status.msg,
                message_type: 0,
                trans_info: TransInfo::default(),
            },
        };
        match frame.encode() {
            Ok(bytes) => self.transmit(bytes),
            Err(error) => debug!(stream = id, %error, "failed to encode RESET"),
        }
    }

    fn transmit(&mut self, frame: Bytes) {
        // A failed send means the connection writer is gone; the owner will
        // call connection_closed shortly.
        if self.outbound.send(frame).is_err() {
            trace!("connection writer gone, frame dropped");
        }
    }
}
