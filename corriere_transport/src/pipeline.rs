// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use corriere_proto::Response;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, trace};

use crate::backup::InFlight;
use crate::connector::{ConnEvent, Connector};
use crate::options::NO_TIMEOUT_MS;
use crate::timeout_queue::{PushOutcome, TimeoutQueue};
use crate::{ClientError, InvokeRequest, TransportOptions, SEND_QUEUE_CAPACITY};

enum PipelineCommand {
    Invoke(InvokeRequest),
    Shutdown,
}

/// Pipeline transport: requests go out back to back over round-robin
/// connections, and every connection's responses are required to arrive in
/// submission order. A response out of order is fatal for its connection.
#[derive(Clone)]
pub struct Pipeline {
    cmd_tx: mpsc::UnboundedSender<PipelineCommand>,
}

impl Pipeline {
    pub fn connect(peer: SocketAddr, options: TransportOptions) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        tokio::spawn(PipelineLoop::new(peer, options, cmd_rx).run());
        Pipeline { cmd_tx }
    }

    pub fn submit(&self, request: InvokeRequest) {
        if let Err(mpsc::error::SendError(PipelineCommand::Invoke(request))) =
            self.cmd_tx.send(PipelineCommand::Invoke(request))
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

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(PipelineCommand::Shutdown);
    }
}

struct PipeSlot {
    connector: Connector,
    /// Request ids in submission order; responses must match the head.
    outstanding: VecDeque<u32>,
}

struct PipelineLoop {
    peer: SocketAddr,
    options: TransportOptions,
    epoch: Instant,
    slots: Vec<PipeSlot>,
    round_robin: usize,
    events_tx: mpsc::UnboundedSender<ConnEvent>,
    events_rx: mpsc::UnboundedReceiver<ConnEvent>,
    cmd_rx: mpsc::UnboundedReceiver<PipelineCommand>,
    send_queue: TimeoutQueue<InFlight>,
}

impl PipelineLoop {
    fn new(
        peer: SocketAddr,
        options: TransportOptions,
        cmd_rx: mpsc::UnboundedReceiver<PipelineCommand>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let slots = (0..options.max_conn_num)
            .map(|index| PipeSlot {
                connector: Connector::new(
                    index,
                    peer,
                    options.connect_interval,
                    options.max_packet_size,
                    events_tx.clone(),
                ),
                outstanding: VecDeque::new(),
            })
            .collect();

        PipelineLoop {
            peer,
            options,
            epoch: Instant::now(),
            slots,
            round_robin: 0,
            events_tx,
            events_rx,
            cmd_rx,
            send_queue: TimeoutQueue::new(SEND_QUEUE_CAPACITY),
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
                    Some(PipelineCommand::Invoke(request)) => self.on_invoke(request),
                    Some(PipelineCommand::Shutdown) | None => break,
                },
                Some(event) = self.events_rx.recv() => self.on_event(event),
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

        // No pending queue in pipeline mode: round-robin and transmit.
        let index = self.round_robin % self.slots.len();
        self.round_robin = self.round_robin.wrapping_add(1);

        if !self.slots[index].connector.ensure_connected() {
            let _ = reply.send(Err(ClientError::Connect(format!(
                "connect attempts to {} are rate limited",
                self.peer
            ))));
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

        match self.send_queue.push(request_id, entry, deadline) {
            PushOutcome::Ok => {
                self.slots[index].outstanding.push_back(request_id);
                if self.slots[index].connector.send(frame).is_err() {
                    self.slots[index].outstanding.pop_back();
                    if let Some(entry) = self.send_queue.pop(request_id) {
                        entry.fail(ClientError::Network(format!(
                            "send to {} failed",
                            self.peer
                        )));
                    }
                }
            }
            PushOutcome::Duplicate(entry) => {
                // Hedge sharing the id; transmitted without its own slot in
                // the wheel, the queued entry's sink wins.
                trace!(request = request_id, "duplicate request id, hedge transmitted");
                self.slots[index].outstanding.push_back(request_id);
                let _ = self.slots[index].connector.send(frame);
                drop(entry);
            }
            PushOutcome::Full(entry) => {
                entry.fail(ClientError::Overload(format!(
                    "send queue at its {SEND_QUEUE_CAPACITY} entry cap"
                )));
            }
        }
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
                self.on_response(conn, frame);
            }
            ConnEvent::Closed {
                conn,
                token,
                was_connected,
                reason,
            } => {
                if self.slots[conn].connector.on_closed(token) {
                    debug!(conn, %reason, "pipeline connection closed");
                    self.fail_connection(conn, reason, was_connected);
                }
            }
        }
    }

    fn on_response(&mut self, index: usize, frame: Bytes) {
        let response = match Response::decode(frame) {
            Ok(response) => response,
            Err(error) => {
                error!(conn = index, %error, "undecodable pipeline response");
                self.slots[index].connector.close();
                self.fail_connection(index, "undecodable response".into(), true);
                return;
            }
        };
        let request_id = response.header.request_id;

        match self.slots[index].outstanding.front() {
            Some(&head) if head == request_id => {
                self.slots[index].outstanding.pop_front();
                match self.send_queue.pop(request_id) {
                    Some(entry) => entry.complete(response),
                    // Timed out earlier; order is intact, drop the payload.
                    None => debug!(request = request_id, "late pipeline response dropped"),
                }
            }
            Some(&head) => {
                // The server broke FIFO correspondence. Nothing on this
                // connection can be trusted any more.
                error!(
                    conn = index,
                    expected = head,
                    got = request_id,
                    "pipeline order violated, dropping connection"
                );
                self.slots[index].connector.close();
                self.fail_connection(index, "pipeline order violated".into(), true);
            }
            None => {
                debug!(
                    conn = index,
                    request = request_id,
                    "response with nothing outstanding, dropped"
                );
            }
        }
    }

    /// Fails every outstanding request on connection `index`.
    fn fail_connection(&mut self, index: usize, reason: String, was_connected: bool) {
        let outstanding = std::mem::take(&mut self.slots[index].outstanding);
        for request_id in outstanding {
            if let Some(entry) = self.send_queue.pop(request_id) {
                if was_connected {
                    entry.fail(ClientError::Network(reason.clone()));
                } else {
                    entry.fail(ClientError::Connect(reason.clone()));
                }
            }
        }
        // A fresh connector so the next round-robin pick redials at once.
        self.slots[index].connector.close();
        self.slots[index].connector = Connector::new(
            index,
            self.peer,
            self.options.connect_interval,
            self.options.max_packet_size,
            self.events_tx.clone(),
        );
    }

    fn on_tick(&mut self) {
        let now = self.now_ms();
        let peer = self.peer.to_string();
        // Expired entries stay in their connection's outstanding FIFO: the
        // response, if it ever arrives, must still be consumed in order.
        self.send_queue.tick(now, |_, entry| entry.expire(now, &peer));
    }

    fn finish(mut self) {
        while let Some((_, entry)) = self.send_queue.pop_any() {
            entry.fail(ClientError::Network("transport shut down".into()));
        }
        for slot in &mut self.slots {
            slot.connector.close();
        }
    }
}
