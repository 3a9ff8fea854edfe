// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use std::collections::VecDeque;
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
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::{StreamExt, StreamMap};
use tracing::{debug, error, trace};

use crate::backup::InFlight;
use crate::connector::{ConnEvent, ConnState, Connector};
use crate::options::NO_TIMEOUT_MS;
use crate::timeout_queue::{PushOutcome, TimeoutQueue};
use crate::{
    ClientError, InvokeRequest, TransportOptions, PENDING_QUEUE_CAPACITY, SEND_QUEUE_CAPACITY,
};

enum PoolCommand {
    Invoke(InvokeRequest),
    Pin {
        reply: oneshot::Sender<Result<usize, ClientError>>,
    },
    Release {
        index: usize,
    },
    OpenStream {
        index: usize,
        call: CallInfo,
        reply: oneshot::Sender<Result<corriere_stream::PendingStream, StreamError>>,
    },
    Shutdown,
}

/// Connection-pool transport: up to `max_conn_num` connections per peer,
/// each carrying at most one in-flight request. Requests that find no free
/// connector wait in a bounded FIFO pending queue.
#[derive(Clone)]
pub struct ConnPool {
    cmd_tx: mpsc::UnboundedSender<PoolCommand>,
}

impl ConnPool {
    pub fn connect(peer: SocketAddr, options: TransportOptions) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(PoolLoop::new(peer, options, cmd_rx).run());
        ConnPool { cmd_tx }
    }

    pub fn submit(&self, request: InvokeRequest) {
        if let Err(mpsc::error::SendError(PoolCommand::Invoke(request))) =
            self.cmd_tx.send(PoolCommand::Invoke(request))
        {
            let _ = request
                .reply
                .send(Err(ClientError::Network("transport stopped".into())));
        }
    }

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

    /// Reserves a connector exclusively; it stops participating in
    /// free/pending bookkeeping until the pin is dropped. Long-lived
    /// sessions and streams live on pinned connectors.
    pub async fn pin(&self) -> Result<PinnedConn, ClientError> {
        let (reply, result) = oneshot::channel();
        self.cmd_tx
            .send(PoolCommand::Pin { reply })
            .map_err(|_| ClientError::Network("transport stopped".into()))?;
        let index = result
            .await
            .map_err(|_| ClientError::Network("transport stopped".into()))??;
        Ok(PinnedConn {
            index,
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(PoolCommand::Shutdown);
    }
}

/// Exclusive hold on one pool connector. Released on drop.
#[derive(Debug)]
pub struct PinnedConn {
    index: usize,
    cmd_tx: mpsc::UnboundedSender<PoolCommand>,
}

impl PinnedConn {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Opens a stream on the pinned connector.
    pub async fn open_stream(
        &self,
        call: CallInfo,
    ) -> Result<(StreamReader, StreamWriter), StreamError> {
        let (reply, pending) = oneshot::channel();
        self.cmd_tx
            .send(PoolCommand::OpenStream {
                index: self.index,
                call,
                reply,
            })
            .map_err(|_| StreamError::network(StreamRole::Client, "transport stopped"))?;
        let pending = pending
            .await
            .map_err(|_| StreamError::network(StreamRole::Client, "transport stopped"))??;
        pending.ready().await
    }
}

impl Drop for PinnedConn {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(PoolCommand::Release { index: self.index });
    }
}

struct Slot {
    connector: Connector,
    pinned: bool,
    handler: Option<StreamHandler>,
}

struct PoolLoop {
    peer: SocketAddr,
    options: TransportOptions,
    epoch: Instant,
    slots: Vec<Slot>,
    free: VecDeque<usize>,
    events_tx: mpsc::UnboundedSender<ConnEvent>,
    events_rx: mpsc::UnboundedReceiver<ConnEvent>,
    cmd_rx: mpsc::UnboundedReceiver<PoolCommand>,
    /// One in-flight request per connector, keyed by connector index.
    send_queue: TimeoutQueue<InFlight>,
    /// Requests waiting for a free connector, keyed by request id.
    pending: TimeoutQueue<InvokeRequest>,
    pending_order: VecDeque<u32>,
    ops_map: StreamMap<usize, UnboundedReceiverStream<StreamOp>>,
    wire_map: StreamMap<usize, UnboundedReceiverStream<Bytes>>,
}

impl PoolLoop {
    fn new(
        peer: SocketAddr,
        options: TransportOptions,
        cmd_rx: mpsc::UnboundedReceiver<PoolCommand>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let slots = (0..options.max_conn_num)
            .map(|index| Slot {
                connector: Connector::new(
                    index,
                    peer,
                    options.connect_interval,
                    options.max_packet_size,
                    events_tx.clone(),
                ),
                pinned: false,
                handler: None,
            })
            .collect();
        let free = (0..options.max_conn_num).collect();

        PoolLoop {
            peer,
            options,
            epoch: Instant::now(),
            slots,
            free,
            events_tx,
            events_rx,
            cmd_rx,
            send_queue: TimeoutQueue::new(SEND_QUEUE_CAPACITY),
            pending: TimeoutQueue::new(PENDING_QUEUE_CAPACITY),
            pending_order: VecDeque::new(),
            ops_map: StreamMap::new(),
            wire_map: StreamMap::new(),
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
                    Some(PoolCommand::Invoke(request)) => self.on_invoke(request),
                    Some(PoolCommand::Pin { reply }) => self.on_pin(reply),
                    Some(PoolCommand::Release { index }) => self.on_release(index),
                    Some(PoolCommand::OpenStream { index, call, reply }) => {
                        self.on_open_stream(index, call, reply)
                    }
                    Some(PoolCommand::Shutdown) | None => break,
                },
                Some(event) = self.events_rx.recv() => self.on_event(event),
                Some((index, op)) = self.ops_map.next() => {
                    if let Some(handler) = self.slots[index].handler.as_mut() {
                        handler.handle_op(op);
                    }
                },
                Some((index, frame)) = self.wire_map.next() => {
                    let _ = self.slots[index].connector.send(frame);
                },
                _ = tick.tick() => self.on_tick(),
            }
        }

        self.finish();
    }

    fn on_invoke(&mut self, request: InvokeRequest) {
        match self.free.pop_front() {
            Some(index) => self.dispatch_on(index, request),
            None => self.queue_pending(request),
        }
    }

    /// Binds `request` to connector `index` and transmits.
    fn dispatch_on(&mut self, index: usize, request: InvokeRequest) {
        let InvokeRequest {
            request_id,
            frame,
            timeout,
            backup,
            reply,
        } = request;

        if !self.slots[index].connector.ensure_connected() {
            let _ = reply.send(Err(ClientError::Connect(format!(
                "connect attempts to {} are rate limited",
                self.peer
            ))));
            self.put_back_free(index);
            return;
        }

        let now = self.now_ms();
        let entry = InFlight {
            request_id,
            conn: index,
            timeout,
            backup,
            reply,
        };
        let deadline = if self.options.disable_request_timeout {
            now + NO_TIMEOUT_MS
        } else {
            entry.first_deadline(now)
        };

        match self.send_queue.push(index as u32, entry, deadline) {
            PushOutcome::Ok => {
                if self.slots[index].connector.send(frame).is_err() {
                    if let Some(entry) = self.send_queue.pop(index as u32) {
                        entry.fail(ClientError::Network(format!(
                            "send to {} failed",
                            self.peer
                        )));
                    }
                    self.reset_connector(index);
                    self.put_back_free(index);
                }
            }
            // A reserved connector cannot have an in-flight entry; treat
            // both rejections as transient overload.
            PushOutcome::Duplicate(entry) | PushOutcome::Full(entry) => {
                entry.fail(ClientError::Overload(
                    "connector already carries a request".into(),
                ));
                self.put_back_free(index);
            }
        }
    }

    fn queue_pending(&mut self, request: InvokeRequest) {
        let now = self.now_ms();
        let request_id = request.request_id;
        let delay = match &request.backup {
            Some(backup) => backup.delay,
            None => request.timeout,
        };
        let deadline = if self.options.disable_request_timeout {
            now + NO_TIMEOUT_MS
        } else {
            now + delay.as_millis() as u64
        };

        match self.pending.push(request_id, request, deadline) {
            PushOutcome::Ok => {
                self.pending_order.push_back(request_id);
                trace!(request = request_id, "queued, all connectors busy");
            }
            PushOutcome::Duplicate(request) => {
                // A hedge waiting behind its own primary; consumed silently.
                trace!(request = request_id, "duplicate pending request dropped");
                drop(request);
            }
            PushOutcome::Full(request) => {
                let _ = request.reply.send(Err(ClientError::Overload(format!(
                    "pending queue at its {PENDING_QUEUE_CAPACITY} entry cap"
                ))));
            }
        }
    }

    fn on_pin(&mut self, reply: oneshot::Sender<Result<usize, ClientError>>) {
        let Some(index) = self.free.pop_front() else {
            let _ = reply.send(Err(ClientError::Overload(
                "no free connector to pin".into(),
            )));
            return;
        };
        self.slots[index].pinned = true;
        self.ensure_handler(index);
        trace!(conn = index, "connector pinned");
        let _ = reply.send(Ok(index));
    }

    fn on_release(&mut self, index: usize) {
        if index >= self.slots.len() || !self.slots[index].pinned {
            return;
        }
        self.slots[index].pinned = false;
        if let Some(handler) = self.slots[index].handler.as_mut() {
            // Whatever streams the owner left behind die with the pin.
            handler.connection_closed();
        }
        trace!(conn = index, "connector released");
        self.put_back_free(index);
        self.drain_pending();
    }

    fn on_open_stream(
        &mut self,
        index: usize,
        call: CallInfo,
        reply: oneshot::Sender<Result<corriere_stream::PendingStream, StreamError>>,
    ) {
        if index >= self.slots.len() || !self.slots[index].pinned {
            let _ = reply.send(Err(StreamError::network(
                StreamRole::Client,
                "stream requested on an unpinned connector",
            )));
            return;
        }
        if !self.slots[index].connector.ensure_connected() {
            let _ = reply.send(Err(StreamError::network(
                StreamRole::Client,
                "connect attempts are rate limited",
            )));
            return;
        }
        self.ensure_handler(index);
        let result = match self.slots[index].handler.as_mut() {
            Some(handler) => handler.open_stream(call),
            None => Err(StreamError::network(
                StreamRole::Client,
                "stream handler unavailable",
            )),
        };
        let _ = reply.send(result);
    }

    fn ensure_handler(&mut self, index: usize) {
        if self.slots[index].handler.is_some() {
            return;
        }
        let (wire_tx, wire_rx) = mpsc::unbounded_channel();
        let (handler, ops_rx) = StreamHandler::new(
            StreamHandlerOptions {
                role: StreamRole::Client,
                window_size: self.options.stream_max_window_size,
                dispatcher: None,
            },
            wire_tx,
        );
        self.ops_map
            .insert(index, UnboundedReceiverStream::new(ops_rx));
        self.wire_map
            .insert(index, UnboundedReceiverStream::new(wire_rx));
        self.slots[index].handler = Some(handler);
    }

    fn on_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Connected { conn, token } => {
                self.slots[conn].connector.on_connected(token);
            }
            ConnEvent::Frame { conn, token, frame } => {
                if !self.slots[conn].connector.is_current(token) {
                    return;
                }
                self.slots[conn].connector.touch();
                match self.slots[conn].handler.as_mut() {
                    Some(handler) => match handler.handle_frame(frame) {
                        Ok(Routed::Unary(frame)) => self.on_response(conn, frame),
                        Ok(Routed::Stream) => {}
                        Err(stream_error) => {
                            error!(conn, %stream_error, "dropping pool connection");
                            self.fail_connector(conn, "protocol error".into(), true);
                        }
                    },
                    None => self.on_response(conn, frame),
                }
            }
            ConnEvent::Closed {
                conn,
                token,
                was_connected,
                reason,
            } => {
                if self.slots[conn].connector.on_closed(token) {
                    debug!(conn, %reason, "pool connection closed");
                    self.fail_connector(conn, reason, was_connected);
                }
            }
        }
    }

    fn on_response(&mut self, index: usize, frame: Bytes) {
        let response = match Response::decode(frame) {
            Ok(response) => response,
            Err(error) => {
                error!(conn = index, %error, "undecodable response dropped");
                return;
            }
        };
        let request_id = response.header.request_id;

        match self.send_queue.get(index as u32) {
            Some(entry) if entry.request_id == request_id => {
                if let Some(entry) = self.send_queue.pop(index as u32) {
                    entry.complete(response);
                }
                self.put_back_free(index);
                self.drain_pending();
            }
            Some(_) => {
                debug!(
                    conn = index,
                    request = request_id,
                    "response does not match the in-flight request, dropped"
                );
            }
            None => {
                debug!(conn = index, request = request_id, "late response dropped");
            }
        }
    }

    /// Tears one connector down, failing whatever rides on it, and makes
    /// the slot usable again with a fresh connector.
    fn fail_connector(&mut self, index: usize, reason: String, was_connected: bool) {
        if let Some(entry) = self.send_queue.pop(index as u32) {
            if was_connected {
                entry.fail(ClientError::Network(reason.clone()));
            } else {
                entry.fail(ClientError::Connect(reason.clone()));
            }
        }
        if let Some(handler) = self.slots[index].handler.as_mut() {
            handler.connection_closed();
        }
        self.reset_connector(index);
        self.put_back_free(index);
        self.drain_pending();
    }

    /// Replaces the slot's connector with a brand-new unconnected one, so
    /// the next use dials immediately instead of inheriting the old
    /// connector's rate-limit window.
    fn reset_connector(&mut self, index: usize) {
        self.slots[index].connector.close();
        self.slots[index].connector = Connector::new(
            index,
            self.peer,
            self.options.connect_interval,
            self.options.max_packet_size,
            self.events_tx.clone(),
        );
    }

    fn put_back_free(&mut self, index: usize) {
        if self.slots[index].pinned {
            return;
        }
        if self.send_queue.contains(index as u32) {
            // Still carrying a request (hedge re-arm); not free yet.
            return;
        }
        if !self.free.contains(&index) {
            self.free.push_back(index);
        }
    }

    /// Hands free connectors to waiting requests, FIFO.
    fn drain_pending(&mut self) {
        while !self.pending.is_empty() {
            let Some(index) = self.free.pop_front() else {
                break;
            };
            let mut dispatched = false;
            while let Some(request_id) = self.pending_order.pop_front() {
                if let Some(request) = self.pending.pop(request_id) {
                    self.dispatch_on(index, request);
                    dispatched = true;
                    break;
                }
            }
            if !dispatched {
                self.free.push_front(index);
                break;
            }
        }
    }

    fn on_tick(&mut self) {
        let now = self.now_ms();
        let peer = self.peer.to_string();

        // In-flight deadlines. A timed-out connector cannot be reused: its
        // response may still arrive and would desynchronize the next call.
        let mut timed_out = Vec::new();
        self.send_queue.tick(now, |_, entry| {
            let conn = entry.conn;
            match entry.expire(now, &peer) {
                Some(rearm) => Some(rearm),
                None => {
                    timed_out.push(conn);
                    None
                }
            }
        });
        for index in timed_out {
            self.reset_connector(index);
            self.put_back_free(index);
        }

        // Waiters expire with their own deadlines; hedged ones re-arm.
        self.pending.tick(now, |_, mut request| {
            if let Some(backup) = request.backup.take() {
                let _ = backup.notify.send(());
                let remaining = request.timeout.saturating_sub(backup.delay);
                request.timeout = remaining;
                Some((request, now + remaining.as_millis() as u64))
            } else {
                let _ = request.reply.send(Err(ClientError::InvokeTimeout(format!(
                    "no free connector to {peer} within the deadline"
                ))));
                None
            }
        });

        // Idle reaping of unpinned, idle, request-free connectors.
        let idle = self.options.connection_idle_timeout;
        if !idle.is_zero() {
            for index in 0..self.slots.len() {
                let slot = &self.slots[index];
                if slot.pinned
                    || slot.connector.state() != ConnState::Connected
                    || self.send_queue.contains(index as u32)
                    || slot.connector.idle_for() < idle
                {
                    continue;
                }
                debug!(conn = index, "idle pool connection reaped");
                if self.options.is_reconnection {
                    self.reset_connector(index);
                    self.slots[index].connector.ensure_connected();
                } else {
                    self.slots[index].connector.close();
                }
            }
        }

        self.drain_pending();
    }

    fn finish(mut self) {
        while let Some((_, entry)) = self.send_queue.pop_any() {
            entry.fail(ClientError::Network("transport shut down".into()));
        }
        while let Some((_, request)) = self.pending.pop_any() {
            let _ = request
                .reply
                .send(Err(ClientError::Network("transport shut down".into())));
        }
        for slot in &mut self.slots {
            if let Some(handler) = slot.handler.as_mut() {
                handler.connection_closed();
            }
            slot.connector.close();
        }
    }
}
