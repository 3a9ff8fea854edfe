// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! Wire format of the corriere RPC protocol.
//!
//! Every protocol message starts with a fixed 16-byte header followed by an
//! optional variable header (a protobuf blob whose length rides in the fixed
//! header), the body, and an optional unframed attachment. Streaming frames
//! reuse the same prefix with a non-zero stream id.

mod checker;
mod codes;
mod error;
mod fixed_header;
pub mod headers;
mod message;

pub use checker::{check_frames, CheckOutcome, FrameMetadata};
pub use codes::{RetCode, Status};
pub use error::CodecError;
pub use fixed_header::{FixedHeader, FIXED_HEADER_LEN, MAGIC};
pub use message::{
    Frame, Request, Response, StreamClose, StreamData, StreamFeedback, StreamInit,
};

/// Distinguishes unary data frames from streaming ones.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum DataFrameType {
    Unary = 0,
    Stream = 1,
}

impl DataFrameType {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Unary),
            1 => Some(Self::Stream),
            _ => None,
        }
    }
}

/// The streaming frame kind carried in the fixed header.
///
/// `Unary` is the filler value used by non-streaming frames. The code points
/// are part of the protocol and must not be renumbered.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum StreamFrameType {
    Unary = 0,
    Init = 1,
    Data = 2,
    Feedback = 3,
    Close = 4,
}

impl StreamFrameType {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Unary),
            1 => Some(Self::Init),
            2 => Some(Self::Data),
            3 => Some(Self::Feedback),
            4 => Some(Self::Close),
            _ => None,
        }
    }
}

/// Close frames either end a stream cleanly or tear it down.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i32)]
pub enum CloseType {
    Close = 0,
    Reset = 1,
}

impl CloseType {
    pub const fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Close),
            1 => Some(Self::Reset),
            _ => None,
        }
    }
}
