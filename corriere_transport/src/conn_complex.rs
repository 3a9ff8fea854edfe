// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use corriere_proto::Response;
use corriere_stream::{
    CallInfo, Routed, StreamError, StreamHandler, StreamHandlerOptions, StreamOp, StreamReader,
    StreamRole, StreamWriter,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, trace};

use crate::backup::InFlight;
use crate::connector::{ConnEvent, ConnState, Connector};
use crate::options::NO_TIMEOUT_MS;
use crate::timeout_queue::{PushOutcome, TimeoutQueue};
use crate::{ClientError, InvokeRequest, TransportOptions, SEND_QUEUE_CAPACITY};

enum Command {
    Invoke(InvokeRequest),
    SendOnly {
        frame: Bytes,
    },
    OpenStream {
        call: CallInfo,
        reply: oneshot::Sender<Result<corriere_stream::PendingStream, StreamError>>,
    },
    Shutdown,
}

/// Connection-complex transport: one connection multiplexes every request
/// for a peer, keyed by request id.
///
/// Cheap handle; the transport itself is a task owning the connection, the
/// timeout wheel and the stream handler.
#[derive(Clone)]
pub struct ConnComplex {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl ConnComplex {
    pub fn connect(peer: SocketAddr, options: TransportOptions) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(ComplexLoop::new(peer, options, cmd_rx).run());
        ConnComplex { cmd_tx }
    }

    /// Hands a prepared request to the transport.
    pub fn submit(&self, request: InvokeRequest) {
        if let Err(mpsc::error::SendError(Command::Invoke(request))) =
            self.cmd_tx.send(Command::Invoke(request))
        {
            let _ = request
                .reply
                .send(Err(ClientError::Network("transport stopped".into())));
        }
    }

    /// Sends one request and waits for its response.
    pub async fn invoke(
        &self,
        request_id: u32,
        frame: Bytes,
        timeout: Duration,
    ) -> Result<Response, ClientError> {
        let (reply, result) = oneshot::channel();
        self.submit(InvokeRequest {
            request_id,
            frame,
            timeout,
            backup: None,
            reply,
        });
        result
            .await
            .map_err(|_| ClientError::Network("transport stopped".into()))?
    }

    /// One-way send: no response is expected or tracked.
    pub fn send_only(&self, frame: Bytes) {
        let _ = self.cmd_tx.send(Command::SendOnly { frame });
    }

    /// Opens a stream over the multiplexed connection.
    pub async fn open_stream(
        &self,
        call: CallInfo,
    ) -> Result<(StreamReader, StreamWriter), StreamError> {
        let (reply, pending) = oneshot::channel();
        self.cmd_tx
            .send(Command::OpenStream { call, reply })
            .map_err(|_| StreamError::network(StreamRole::Client, "transport stopped"))?;
        let pending = pending
            .await
            .map_err(|_| StreamError::network(StreamRole::Client, "transport stopped"))??;
        pending.ready().await
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown);
    }
}

struct ComplexLoop {
    peer: SocketAddr,
    options: TransportOptions,
    epoch: Instant,
    connector: Connector,
    events_rx: mpsc::UnboundedReceiver<ConnEvent>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    timeouts: TimeoutQueue<InFlight>,
    handler: StreamHandler,
    ops_rx: mpsc::UnboundedReceiver<StreamOp>,
    wire_rx: mpsc::UnboundedReceiver<Bytes>,
}

impl ComplexLoop {
    fn new(
        peer: SocketAddr,
        options: TransportOptions,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (wire_tx, wire_rx) = mpsc::unbounded_channel();
        let (handler, ops_rx) = StreamHandler::new(
            StreamHandlerOptions {
                role: StreamRole::Client,
                window_size: options.stream_max_window_size,
                dispatcher: None,
            },
            wire_tx,
        );
        let connector = Connector::new(
            0,
            peer,
            options.connect_interval,
            options.max_packet_size,
            events_tx,
        );
        ComplexLoop {
            peer,
            options,
            epoch: Instant::now(),
            connector,
            events_rx,
            cmd_rx,
            timeouts: TimeoutQueue::new(SEND_QUEUE_CAPACITY),
            handler,
            ops_rx,
            wire_rx,
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64 + 1
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(
            self.options
                .request_timeout_check_interval
                .max(Duration::from_millis(1)),
        );
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Invoke(request)) => self.on_invoke(request),
                    Some(Command::SendOnly { frame }) => self.on_send_only(frame),
                    Some(Command::OpenStream { call, reply }) => self.on_open_stream(call, reply),
                    Some(Command::Shutdown) | None => break,
                },
                Some(event) = self.events_rx.recv() => self.on_event(event),
                Some(op) = self.ops_rx.recv() => self.handler.handle_op(op),
                Some(frame) = self.wire_rx.recv() => {
                    if self.connector.send(frame).is_err() {
                        trace!(peer = %self.peer, "stream frame dropped, connection down");
                    }
                },
                _ = tick.tick() => self.on_tick(),
            }
        }

        self.finish();
    }

    fn on_invoke(&mut self, request: InvokeRequest) {
        let InvokeRequest {
            request_id,
            frame,
            timeout,
            backup,
            reply,
        } = request;

        if !self.connector.ensure_connected() {
            let _ = reply.send(Err(ClientError::Connect(format!(
                "connect attempts to {} are rate limited",
                self.peer
            ))));
            return;
        }

        let now = self.now_ms();
        let entry = InFlight {
            request_id,
            conn: 0,
            timeout,
            backup,
            reply,
        };
        let deadline = if self.options.disable_request_timeout {
            now + NO_TIMEOUT_MS
        } else {
            entry.first_deadline(now)
        };

        match self.timeouts.push(request_id, entry, deadline) {
            PushOutcome::Ok => {
                if self.connector.send(frame).is_err() {
                    if let Some(entry) = self.timeouts.pop(request_id) {
                        entry.fail(ClientError::Network(format!(
                            "send to {} failed",
                            self.peer
                        )));
                    }
                }
            }
            PushOutcome::Duplicate(entry) => {
                // A hedge sharing the request id: transmit, the queued
                // entry's sink wins.
                trace!(request = request_id, "duplicate request id, hedge transmitted");
                let _ = self.connector.send(frame);
                drop(entry);
            }
            PushOutcome::Full(entry) => {
                entry.fail(ClientError::Overload(format!(
                    "timeout queue at its {SEND_QUEUE_CAPACITY} entry cap"
                )));
            }
        }
    }

    fn on_send_only(&mut self, frame: Bytes) {
        if !self.connector.ensure_connected() {
            debug!(peer = %self.peer, "one-way send dropped, connect rate limited");
            return;
        }
        let _ = self.connector.send(frame);
    }

    fn on_open_stream(
        &mut self,
        call: CallInfo,
        reply: oneshot::Sender<Result<corriere_stream::PendingStream, StreamError>>,
    ) {
        if !self.connector.ensure_connected() {
            let _ = reply.send(Err(StreamError::network(
                StreamRole::Client,
                "connect attempts are rate limited",
            )));
            return;
        }
        let _ = reply.send(self.handler.open_stream(call));
    }

    fn on_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Connected { token, .. } => self.connector.on_connected(token),
            ConnEvent::Frame { token, frame, .. } => {
                if !self.connector.is_current(token) {
                    return;
                }
                self.connector.touch();
                match self.handler.handle_frame(frame) {
                    Ok(Routed::Unary(frame)) => self.on_response(frame),
                    Ok(Routed::Stream) => {}
                    Err(stream_error) => {
                        // The byte stream itself is broken.
                        error!(peer = %self.peer, %stream_error, "dropping connection");
                        self.connector.close();
                        self.fail_connection("protocol error".into(), true);
                    }
                }
            }
            ConnEvent::Closed {
                token,
                was_connected,
                reason,
                ..
            } => {
                if self.connector.on_closed(token) {
                    debug!(peer = %self.peer, %reason, "connection closed");
                    self.fail_connection(reason, was_connected);
                }
            }
        }
    }

    fn on_response(&mut self, frame: Bytes) {
        match Response::decode(frame) {
            Ok(response) => {
                let request_id = response.header.request_id;
                match self.timeouts.pop(request_id) {
                    Some(entry) => entry.complete(response),
                    // Timed out, cancelled, or a lost hedge: discarded.
                    None => debug!(request = request_id, "late response dropped"),
                }
            }
            Err(error) => error!(peer = %self.peer, %error, "undecodable response dropped"),
        }
    }

    /// Fails everything in flight; `was_connected` false means nothing was
    /// ever established, which surfaces as a connect error.
    fn fail_connection(&mut self, reason: String, was_connected: bool) {
        while let Some((_, entry)) = self.timeouts.pop_any() {
            if was_connected {
                entry.fail(ClientError::Network(reason.clone()));
            } else {
                entry.fail(ClientError::Connect(reason.clone()));
            }
        }
        self.handler.connection_closed();
    }

    fn on_tick(&mut self) {
        let now = self.now_ms();
        let peer = self.peer.to_string();
        self.timeouts.tick(now, |_, entry| entry.expire(now, &peer));

        let idle = self.options.connection_idle_timeout;
        if !idle.is_zero()
            && self.connector.state() == ConnState::Connected
            && self.connector.idle_for() >= idle
        {
            debug!(peer = %self.peer, "idle connection reaped");
            self.connector.close();
            self.fail_connection("idle connection closed".into(), true);
            if self.options.is_reconnection {
                self.connector.ensure_connected();
            }
        }
    }

    fn finish(mut self) {
        self.connector.close();
        self.fail_connection("transport shut down".into(), true);
    }
}
