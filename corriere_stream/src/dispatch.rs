// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use corriere_proto::headers::TransInfo;
use corriere_proto::Status;

use crate::{StreamReader, StreamWriter};

/// One accepted server stream, ready for the RPC method to consume.
#[derive(Debug)]
pub struct StreamCall {
    pub caller: String,
    pub func: String,
    pub content_type: u32,
    pub trans_info: TransInfo,
    pub reader: StreamReader,
    pub writer: StreamWriter,
}

/// What the stream core requires from server-side dispatch.
///
/// `check` runs before the INIT reply goes out; its error (typically
/// RPC-method-not-found) is carried back to the caller in the reply and the
/// stream never opens. `handle` receives ownership of streams that did open.
pub trait StreamingDispatcher: Send + Sync + 'static {
    fn check(&self, func: &str) -> Result<(), Status>;
    fn handle(&self, call: StreamCall);
}
