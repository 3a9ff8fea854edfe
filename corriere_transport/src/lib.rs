// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! The client transport engine.
//!
//! Three connection disciplines share one request timeout wheel design:
//! connection-complex (one multiplexed connection per peer), connection-pool
//! (N connections, one in-flight request each) and pipeline (FIFO
//! correspondence between requests and responses). Each transport runs as
//! one owning task; every per-connection structure is single-writer and all
//! submission happens over channels.

mod backup;
mod conn_complex;
mod conn_pool;
mod connector;
mod error;
mod options;
mod pipeline;
mod timeout_queue;

pub use backup::BackupRequest;
pub use conn_complex::ConnComplex;
pub use conn_pool::{ConnPool, PinnedConn};
pub use error::ClientError;
pub use options::TransportOptions;
pub use pipeline::Pipeline;
pub use timeout_queue::{PushOutcome, TimeoutQueue};

use bytes::Bytes;
use corriere_proto::Response;
use std::time::Duration;
use tokio::sync::oneshot;

/// One unary request handed to a transport, already encoded.
#[derive(Debug)]
pub struct InvokeRequest {
    pub request_id: u32,
    pub frame: Bytes,
    /// Total budget for the call.
    pub timeout: Duration,
    /// Present when the caller wants a hedged retry.
    pub backup: Option<BackupRequest>,
    /// Where the outcome lands. Dropping the receiver cancels the call.
    pub reply: oneshot::Sender<Result<Response, ClientError>>,
}

/// Default cap of a transport's in-flight timeout wheel.
pub const SEND_QUEUE_CAPACITY: usize = 50_000;

/// Default cap of a pool's pending queue.
pub const PENDING_QUEUE_CAPACITY: usize = 10_000;
