// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use corriere_proto::{CodecError, RetCode, Status};

use crate::{StreamAction, StreamRole, StreamState};

/// Errors surfaced to stream readers and writers.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    /// An action hit a state that does not permit it. The stream has been
    /// reset and closed.
    #[error("stream {id}: {action:?} not permitted in {state:?}")]
    Protocol {
        id: u32,
        state: StreamState,
        action: StreamAction,
    },

    /// The peer tore the stream down with a RESET frame.
    #[error("stream {id} reset: {status}")]
    Reset { id: u32, status: Status },

    /// The peer refused or failed the call (INIT reply or CLOSE carrying a
    /// non-zero framework code).
    #[error("stream {id} failed remotely: {status}")]
    Remote { id: u32, status: Status },

    /// The connection under the stream went away.
    #[error("stream network failure: {status}")]
    Network { status: Status },

    /// A DATA frame arrived larger than the receive window the peer was
    /// given. The peer is misbehaving; the stream has been reset.
    #[error("stream {id}: DATA of {got} bytes exceeds {remaining} bytes of receive window")]
    FlowViolation { id: u32, got: u32, remaining: u32 },

    /// A payload can never fit the negotiated send window.
    #[error("stream {id}: payload of {len} bytes exceeds the {window} byte send window")]
    PayloadTooLarge { id: u32, len: u32, window: u32 },

    /// No frame arrived within the read deadline.
    #[error("stream {id}: read timed out")]
    ReadTimeout { id: u32 },

    /// The stream is already closed on this side.
    #[error("stream {id} is closed")]
    Closed { id: u32 },

    /// A frame belonging to the stream failed to decode.
    #[error("stream codec failure: {0}")]
    Codec(#[from] CodecError),
}

impl StreamError {
    /// The framework code this error maps to on the wire, from `role`'s
    /// point of view.
    pub fn ret_code(&self, role: StreamRole) -> RetCode {
        let client = role == StreamRole::Client;
        match self {
            StreamError::Protocol { .. } => RetCode::StreamUnknown,
            StreamError::Reset { status, .. } | StreamError::Remote { status, .. } => {
                RetCode::from_i32(status.ret).unwrap_or(RetCode::StreamUnknown)
            }
            StreamError::Network { .. } if client => RetCode::StreamClientNetworkError,
            StreamError::Network { .. } => RetCode::StreamServerNetworkError,
            StreamError::FlowViolation { .. } | StreamError::PayloadTooLarge { .. } => {
                RetCode::StreamUnknown
            }
            StreamError::ReadTimeout { .. } if client => RetCode::StreamClientReadTimeout,
            StreamError::ReadTimeout { .. } => RetCode::StreamServerReadTimeout,
            StreamError::Closed { .. } => RetCode::StreamUnknown,
            StreamError::Codec(_) if client => RetCode::StreamClientDecodeError,
            StreamError::Codec(_) => RetCode::StreamServerDecodeError,
        }
    }

    /// A network failure carrying the right code for `role`.
    pub fn network(role: StreamRole, msg: impl Into<String>) -> Self {
        let code = match role {
            StreamRole::Client => RetCode::StreamClientNetworkError,
            StreamRole::Server => RetCode::StreamServerNetworkError,
        };
        StreamError::Network {
            status: Status::new(code, msg),
        }
    }
}
