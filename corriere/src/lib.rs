// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! corriere is the client core of a tRPC-style RPC runtime: the wire codec
//! ([`corriere_proto`]), the streaming engine ([`corriere_stream`]) and the
//! transport disciplines ([`corriere_transport`]), assembled behind a small
//! [`Client`].
//!
//! Serialization, compression, server dispatch and address resolution are
//! collaborator seats: traits this crate consumes but does not implement
//! beyond trivial defaults.
//!
//! Everything runs on tokio, single- or multi-threaded runtime alike: each
//! connection group is owned by one task, so per-connection state stays
//! single-writer and cross-task submission is message passing.

mod client;
mod config;
mod traits;

pub use client::{CallOptions, Client, Discipline};
pub use config::Config;
pub use traits::{
    AddressResolver, Compressor, DispatchContext, Serializer, StaticResolver, UnaryDispatcher,
};

pub use corriere_proto::{RetCode, Status};
pub use corriere_stream::{StreamCall, StreamError, StreamReader, StreamWriter, StreamingDispatcher};
pub use corriere_transport::ClientError;
