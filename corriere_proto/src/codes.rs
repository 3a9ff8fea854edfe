// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

/// Framework return codes observable to peers in response headers and CLOSE
/// frames. The numeric values are part of the protocol.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum RetCode {
    Success = 0,

    ServerDecodeError = 1,
    ServerEncodeError = 2,
    ServerNoService = 11,
    ServerNoFunc = 12,
    ServerTimeout = 21,
    ServerOverload = 22,
    ServerFullLinkTimeout = 24,

    ClientInvokeTimeout = 101,
    ClientFullLinkTimeout = 102,
    ClientConnectError = 111,
    ClientEncodeError = 121,
    ClientDecodeError = 122,
    ClientOverload = 124,
    ClientNetworkError = 141,

    StreamServerNetworkError = 201,
    StreamServerEncodeError = 221,
    StreamServerDecodeError = 222,
    StreamServerReadTimeout = 254,

    StreamClientNetworkError = 301,
    StreamClientEncodeError = 321,
    StreamClientDecodeError = 322,
    StreamClientReadTimeout = 354,

    InvokeUnknown = 999,
    StreamUnknown = 1000,
}

impl RetCode {
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    pub const fn from_i32(value: i32) -> Option<Self> {
        Some(match value {
            0 => Self::Success,
            1 => Self::ServerDecodeError,
            2 => Self::ServerEncodeError,
            11 => Self::ServerNoService,
            12 => Self::ServerNoFunc,
            21 => Self::ServerTimeout,
            22 => Self::ServerOverload,
            24 => Self::ServerFullLinkTimeout,
            101 => Self::ClientInvokeTimeout,
            102 => Self::ClientFullLinkTimeout,
            111 => Self::ClientConnectError,
            121 => Self::ClientEncodeError,
            122 => Self::ClientDecodeError,
            124 => Self::ClientOverload,
            141 => Self::ClientNetworkError,
            201 => Self::StreamServerNetworkError,
            221 => Self::StreamServerEncodeError,
            222 => Self::StreamServerDecodeError,
            254 => Self::StreamServerReadTimeout,
            301 => Self::StreamClientNetworkError,
            321 => Self::StreamClientEncodeError,
            322 => Self::StreamClientDecodeError,
            354 => Self::StreamClientReadTimeout,
            999 => Self::InvokeUnknown,
            1000 => Self::StreamUnknown,
            _ => return None,
        })
    }
}

/// Outcome of an RPC as carried on the wire: a framework code, the
/// function's own return code and a human-readable message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Status {
    pub ret: i32,
    pub func_ret: i32,
    pub msg: String,
}

impl Status {
    pub const OK: Status = Status {
        ret: 0,
        func_ret: 0,
        msg: String::new(),
    };

    pub fn new(ret: RetCode, msg: impl Into<String>) -> Self {
        Status {
            ret: ret.as_i32(),
            func_ret: 0,
            msg: msg.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.ret == RetCode::Success.as_i32()
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.msg.is_empty() {
            write!(f, "ret {} (func ret {})", self.ret, self.func_ret)
        } else {
            write!(f, "ret {} (func ret {}): {}", self.ret, self.func_ret, self.msg)
        }
    }
}
