// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! Seats for external collaborators. The runtime calls these; it ships only
//! trivial implementations.

use std::any::Any;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use corriere_proto::headers::TransInfo;
use corriere_proto::Status;
use hashbrown::HashMap;

/// Body (de)serialization. The runtime treats message types as opaque; the
/// embedder's serializer bridges them to bytes.
pub trait Serializer: Send + Sync {
    fn serialize(&self, message: &dyn Any, out: &mut BytesMut) -> bool;
    fn deserialize(&self, bytes: &Bytes, out: &mut dyn Any) -> bool;
}

/// Optional body/attachment compression, applied after serialization.
pub trait Compressor: Send + Sync {
    fn compress(&self, input: &Bytes) -> Option<Bytes>;
    fn decompress(&self, input: &Bytes) -> Option<Bytes>;
}

/// What a unary server handler sees about the call.
#[derive(Clone, Debug, Default)]
pub struct DispatchContext {
    pub caller: String,
    pub func: String,
    pub request_id: u32,
    pub trans_info: TransInfo,
}

/// Server-side unary dispatch: request bytes in, response bytes out.
pub trait UnaryDispatcher: Send + Sync {
    fn dispatch_unary(&self, context: &DispatchContext, request: Bytes) -> Result<Bytes, Status>;
}

/// Maps a call target to candidate endpoints. The first endpoint is the
/// primary; backup requests hedge towards the second.
pub trait AddressResolver: Send + Sync {
    fn resolve(&self, target: &str) -> Vec<SocketAddr>;
}

/// A fixed target table; enough for tests and static deployments.
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    targets: HashMap<String, Vec<SocketAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, target: impl Into<String>, endpoints: Vec<SocketAddr>) {
        self.targets.insert(target.into(), endpoints);
    }

    pub fn with(mut self, target: impl Into<String>, endpoints: Vec<SocketAddr>) -> Self {
        self.insert(target, endpoints);
        self
    }
}

impl AddressResolver for StaticResolver {
    fn resolve(&self, target: &str) -> Vec<SocketAddr> {
        self.targets.get(target).cloned().unwrap_or_default()
    }
}
