// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

/// Everything that can go wrong while encoding or decoding frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The first two bytes of a frame were not the protocol magic.
    #[error("bad magic {0:#06x}")]
    BadMagic(u16),

    /// Fewer bytes than a complete fixed header or message requires.
    #[error("buffer too short: need {need} bytes, have {have}")]
    ShortBuffer { need: usize, have: usize },

    /// The size fields describe a layout that cannot fit inside the frame,
    /// e.g. `data_frame_size < 16 + header_size` or an attachment larger
    /// than the remaining payload.
    #[error("frame of {frame_size} bytes overruns its own layout")]
    LayoutOverrun { frame_size: u32 },

    /// The frame announces more bytes than the connection allows.
    #[error("frame of {frame_size} bytes exceeds the {limit} byte packet limit")]
    OversizedFrame { frame_size: u32, limit: u32 },

    /// A streaming codec was handed a frame of a different kind.
    #[error("frame type mismatch: expected {expected}, got data/stream type {got_data}/{got_stream}")]
    FrameTypeMismatch {
        expected: &'static str,
        got_data: u8,
        got_stream: u8,
    },

    /// The variable header blob failed to deserialize.
    #[error("variable header: {0}")]
    Header(String),
}

impl From<prost::DecodeError> for CodecError {
    fn from(error: prost::DecodeError) -> Self {
        CodecError::Header(error.to_string())
    }
}
