// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! The streaming engine: per-stream state machines, credit-based flow
//! control and the demultiplexer that routes connection frames to streams.
//!
//! A [`StreamHandler`] is owned by the task that owns the connection; every
//! piece of stream state is single-writer. Readers and writers live on
//! arbitrary tasks and talk to the handler through channels.

mod dispatch;
mod error;
mod flow;
mod handler;
mod state;
mod stream;

pub use dispatch::{StreamCall, StreamingDispatcher};
pub use error::StreamError;
pub use flow::{RecvFlow, SendCreditError, SendFlow, WindowExceeded};
pub use handler::{Routed, StreamHandler, StreamHandlerOptions};
pub use state::{permitted, StreamAction, StreamRole, StreamState};
pub use stream::{CallInfo, PendingStream, StreamOp, StreamReader, StreamWriter};
