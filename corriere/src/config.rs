// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use std::time::Duration;

use corriere_transport::TransportOptions;

use crate::Discipline;

/// Client-wide configuration, threaded from startup. There is no file
/// loading and no environment lookup; embedders construct this directly.
#[derive(Clone, Debug)]
pub struct Config {
    /// Name this process reports as the caller.
    pub caller: String,

    /// Which connection discipline new channels use.
    pub discipline: Discipline,

    /// Connections per peer in pool and pipeline mode.
    pub max_conn_num: usize,

    /// Minimum spacing between connect attempts, milliseconds.
    pub connect_interval_ms: u64,

    /// Idle-connection reap threshold, milliseconds; 0 disables reaping.
    pub connection_idle_timeout_ms: u64,

    /// Timeout-wheel drive interval, milliseconds.
    pub request_timeout_check_interval_ms: u64,

    /// Stream receive window advertised in INIT; 0 disables flow control.
    pub stream_max_window_size: u32,

    /// Re-establish reaped connections instead of leaving them down.
    pub is_reconnection: bool,

    /// Never fire request deadlines.
    pub disable_request_timeout: bool,

    /// Largest frame accepted on a connection.
    pub max_packet_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            caller: String::new(),
            discipline: Discipline::ConnComplex,
            max_conn_num: 2,
            connect_interval_ms: 2000,
            connection_idle_timeout_ms: 0,
            request_timeout_check_interval_ms: 10,
            stream_max_window_size: 65535,
            is_reconnection: false,
            disable_request_timeout: false,
            max_packet_size: 10_000_000,
        }
    }
}

impl Config {
    pub(crate) fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            max_conn_num: self.max_conn_num,
            connect_interval: Duration::from_millis(self.connect_interval_ms),
            connection_idle_timeout: Duration::from_millis(self.connection_idle_timeout_ms),
            request_timeout_check_interval: Duration::from_millis(
                self.request_timeout_check_interval_ms,
            ),
            stream_max_window_size: self.stream_max_window_size,
            is_reconnection: self.is_reconnection,
            disable_request_timeout: self.disable_request_timeout,
            max_packet_size: self.max_packet_size,
        }
    }
}
