// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use corriere_proto::{check_frames, CheckOutcome};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Events a connector reports to its owning transport loop.
#[derive(Debug)]
pub(crate) enum ConnEvent {
    Connected {
        conn: usize,
        token: u64,
    },
    /// One whole frame, already split by the checker.
    Frame {
        conn: usize,
        token: u64,
        frame: Bytes,
    },
    Closed {
        conn: usize,
        token: u64,
        /// False when the TCP connect itself failed.
        was_connected: bool,
        reason: String,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum ConnState {
    Unconnected,
    Connecting,
    Connected,
}

fn next_token() -> u64 {
    static TOKEN: AtomicU64 = AtomicU64::new(1);
    TOKEN.fetch_add(1, Ordering::Relaxed)
}

/// One TCP connection and its I/O tasks.
///
/// The owning loop drives this synchronously; the spawned read task feeds
/// whole frames back through the shared event channel. Each connection
/// attempt carries a token so events from a torn-down socket cannot be
/// mistaken for the live one.
pub(crate) struct Connector {
    conn: usize,
    peer: SocketAddr,
    state: ConnState,
    token: u64,
    write_tx: Option<mpsc::UnboundedSender<Bytes>>,
    task: Option<JoinHandle<()>>,
    connect_interval: Duration,
    max_packet_size: u32,
    last_connect_at: Option<Instant>,
    last_active_at: Instant,
    events: mpsc::UnboundedSender<ConnEvent>,
}

impl Connector {
    pub fn new(
        conn: usize,
        peer: SocketAddr,
        connect_interval: Duration,
        max_packet_size: u32,
        events: mpsc::UnboundedSender<ConnEvent>,
    ) -> Self {
        Connector {
            conn,
            peer,
            state: ConnState::Unconnected,
            token: 0,
            write_tx: None,
            task: None,
            connect_interval,
            max_packet_size,
            last_connect_at: None,
            last_active_at: Instant::now(),
            events,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_current(&self, token: u64) -> bool {
        self.token == token
    }

    pub fn touch(&mut self) {
        self.last_active_at = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_active_at.elapsed()
    }

    /// Makes sure a connection exists or is being established.
    ///
    /// Returns false when the connector is down and the rate limit forbids
    /// another attempt right now; the caller fails the request instead of
    /// waiting.
    pub fn ensure_connected(&mut self) -> bool {
        match self.state {
            ConnState::Connected | ConnState::Connecting => true,
            ConnState::Unconnected => {
                let now = Instant::now();
                if let Some(last) = self.last_connect_at {
                    if now.duration_since(last) < self.connect_interval {
                        trace!(conn = self.conn, peer = %self.peer, "connect attempt rate limited");
                        return false;
                    }
                }
                self.last_connect_at = Some(now);
                self.spawn_connect();
                true
            }
        }
    }

    pub fn on_connected(&mut self, token: u64) {
        if self.is_current(token) {
            self.state = ConnState::Connected;
            self.touch();
            trace!(conn = self.conn, peer = %self.peer, "connected");
        }
    }

    /// Returns true when the closed connection was the live one.
    pub fn on_closed(&mut self, token: u64) -> bool {
        if !self.is_current(token) {
            return false;
        }
        self.teardown();
        true
    }

    /// Queues one frame for the wire. Frames queued while the connection is
    /// still being established go out once it is up.
    pub fn send(&mut self, frame: Bytes) -> Result<(), ()> {
        match &self.write_tx {
            Some(tx) => {
                tx.send(frame).map_err(|_| ())?;
                self.touch();
                Ok(())
            }
            None => Err(()),
        }
    }

    /// Drops the connection on purpose (idle reap, shutdown, protocol
    /// error).
    pub fn close(&mut self) {
        if self.state != ConnState::Unconnected {
            debug!(conn = self.conn, peer = %self.peer, "closing connection");
        }
        self.teardown();
    }

    fn teardown(&mut self) {
        self.state = ConnState::Unconnected;
        self.token = 0;
        self.write_tx = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn spawn_connect(&mut self) {
        let token = next_token();
        self.token = token;
        self.state = ConnState::Connecting;

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        self.write_tx = Some(write_tx);

        let conn = self.conn;
        let peer = self.peer;
        let max_packet_size = self.max_packet_size;
        let events = self.events.clone();

        self.task = Some(tokio::spawn(async move {
            run_connection(conn, token, peer, max_packet_size, write_rx, events).await;
        }));
    }
}

async fn run_connection(
    conn: usize,
    token: u64,
    peer: SocketAddr,
    max_packet_size: u32,
    mut write_rx: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<ConnEvent>,
) {
    let stream = match TcpStream::connect(peer).await {
        Ok(stream) => stream,
        Err(error) => {
            let _ = events.send(ConnEvent::Closed {
                conn,
                token,
                was_connected: false,
                reason: format!("connect to {peer}: {error}"),
            });
            return;
        }
    };
    if stream.set_nodelay(true).is_err() {
        trace!(conn, "TCP_NODELAY not available");
    }
    let _ = events.send(ConnEvent::Connected { conn, token });

    let (mut read_half, mut write_half) = stream.into_split();

    let writer = tokio::spawn(async move {
        while let Some(frame) = write_rx.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let mut buf = BytesMut::with_capacity(16 * 1024);
    let mut frames = VecDeque::new();
    let reason = loop {
        match read_half.read_buf(&mut buf).await {
            Ok(0) => break "closed by peer".to_string(),
            Ok(_) => match check_frames(max_packet_size, &mut buf, &mut frames) {
                Ok(CheckOutcome::Full) => {
                    for frame in frames.drain(..) {
                        if events
                            .send(ConnEvent::Frame { conn, token, frame })
                            .is_err()
                        {
                            // The owning loop is gone.
                            writer.abort();
                            return;
                        }
                    }
                }
                Ok(CheckOutcome::Less) => {}
                Err(error) => break format!("broken byte stream: {error}"),
            },
            Err(error) => break error.to_string(),
        }
    };

    writer.abort();
    let _ = events.send(ConnEvent::Closed {
        conn,
        token,
        was_connected: true,
        reason,
    });
}
