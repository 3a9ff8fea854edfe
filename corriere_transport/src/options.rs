// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use std::time::Duration;

/// Per-transport tuning knobs, threaded in at construction.
#[derive(Clone, Debug)]
pub struct TransportOptions {
    /// Connectors per peer in pool and pipeline mode.
    pub max_conn_num: usize,

    /// Minimum spacing between connect attempts on one connector.
    pub connect_interval: Duration,

    /// Close a connection after this long without traffic. Zero disables
    /// reaping.
    pub connection_idle_timeout: Duration,

    /// How often the timeout wheel is driven. The wheel itself keeps
    /// millisecond slots.
    pub request_timeout_check_interval: Duration,

    /// Receive window advertised on streams; 0 disables flow control.
    pub stream_max_window_size: u32,

    /// Re-establish idle-reaped connections instead of leaving them down.
    pub is_reconnection: bool,

    /// Keep requests in the wheel without ever firing them; for
    /// fire-and-forget setups that route responses elsewhere.
    pub disable_request_timeout: bool,

    /// Upper bound on one frame; decoding larger ones is a protocol error.
    pub max_packet_size: u32,
}

impl Default for TransportOptions {
    fn default() -> Self {
        TransportOptions {
            max_conn_num: 2,
            connect_interval: Duration::from_millis(2000),
            connection_idle_timeout: Duration::ZERO,
            request_timeout_check_interval: Duration::from_millis(10),
            stream_max_window_size: 65535,
            is_reconnection: false,
            disable_request_timeout: false,
            max_packet_size: 10_000_000,
        }
    }
}

/// The deadline used when request timeouts are disabled: far enough out to
/// never fire inside a connection's lifetime.
pub(crate) const NO_TIMEOUT_MS: u64 = 24 * 60 * 60 * 1000;
