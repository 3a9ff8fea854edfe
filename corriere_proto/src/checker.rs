// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::{CodecError, DataFrameType, FixedHeader, FIXED_HEADER_LEN};

/// Result of a checker pass that did not fail.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CheckOutcome {
    /// At least one whole frame was moved to the output queue.
    Full,
    /// Not enough buffered bytes for the next frame; input left untouched.
    Less,
}

/// Splits as many whole frames as `src` holds onto `out`, each as one opaque
/// buffer starting with its fixed header.
///
/// `max_packet_size` of 0 disables the upper size check. Errors (bad magic,
/// impossible sizes) indicate a corrupt byte stream; the connection owning
/// the buffer must be dropped.
pub fn check_frames(
    max_packet_size: u32,
    src: &mut BytesMut,
    out: &mut VecDeque<Bytes>,
) -> Result<CheckOutcome, CodecError> {
    let mut produced = false;

    loop {
        if src.len() < FIXED_HEADER_LEN {
            trace!(buffered = src.len(), "checker less, no full fixed header");
            break;
        }

        let fixed = FixedHeader::peek(src)?;

        if (fixed.data_frame_size as usize) < FIXED_HEADER_LEN + fixed.header_size as usize {
            return Err(CodecError::LayoutOverrun {
                frame_size: fixed.data_frame_size,
            });
        }
        if max_packet_size != 0 && fixed.data_frame_size > max_packet_size {
            return Err(CodecError::OversizedFrame {
                frame_size: fixed.data_frame_size,
                limit: max_packet_size,
            });
        }

        if src.len() < fixed.data_frame_size as usize {
            trace!(
                buffered = src.len(),
                frame_size = fixed.data_frame_size,
                "checker less, partial frame"
            );
            break;
        }

        out.push_back(src.split_to(fixed.data_frame_size as usize).freeze());
        produced = true;
    }

    Ok(if produced {
        CheckOutcome::Full
    } else {
        CheckOutcome::Less
    })
}

/// The routing facts of one frame, read without paying a full decode.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameMetadata {
    pub data_frame_type: u8,
    pub stream_frame_type: u8,
    pub stream_id: u32,
    pub is_stream: bool,
}

impl FrameMetadata {
    pub fn pick(frame: &[u8]) -> Result<FrameMetadata, CodecError> {
        let fixed = FixedHeader::peek(frame)?;
        Ok(FrameMetadata {
            data_frame_type: fixed.data_frame_type,
            stream_frame_type: fixed.stream_frame_type,
            stream_id: fixed.stream_id,
            is_stream: fixed.data_frame_type == DataFrameType::Stream as u8,
        })
    }
}
