// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use corriere_proto::{CodecError, RetCode};

/// Errors a transport reports into a caller's result sink.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// The deadline fired before a response arrived.
    #[error("invoke timed out: {0}")]
    InvokeTimeout(String),

    /// No connection could be established (refused, or attempts are being
    /// rate limited).
    #[error("connect failed: {0}")]
    Connect(String),

    /// The connection died with the request in flight.
    #[error("network failure: {0}")]
    Network(String),

    /// A queue cap was hit; the request was rejected immediately.
    #[error("client overloaded: {0}")]
    Overload(String),

    /// The request could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The response could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),

    /// Catch-all for situations the protocol cannot express better.
    #[error("invoke failed: {0}")]
    Unknown(String),
}

impl ClientError {
    /// The framework code this error maps to.
    pub fn ret_code(&self) -> RetCode {
        match self {
            ClientError::InvokeTimeout(_) => RetCode::ClientInvokeTimeout,
            ClientError::Connect(_) => RetCode::ClientConnectError,
            ClientError::Network(_) => RetCode::ClientNetworkError,
            ClientError::Overload(_) => RetCode::ClientOverload,
            ClientError::Encode(_) => RetCode::ClientEncodeError,
            ClientError::Decode(_) => RetCode::ClientDecodeError,
            ClientError::Unknown(_) => RetCode::InvokeUnknown,
        }
    }
}

impl From<CodecError> for ClientError {
    fn from(error: CodecError) -> Self {
        ClientError::Decode(error.to_string())
    }
}
