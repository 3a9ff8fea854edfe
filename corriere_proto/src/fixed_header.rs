// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use bytes::{Buf, BufMut};

use crate::CodecError;

/// Magic number opening every frame.
pub const MAGIC: u16 = 0x930B;

/// Encoded size of the fixed header.
pub const FIXED_HEADER_LEN: usize = 16;

/// The fixed 16-byte prefix shared by every frame, network byte order.
///
/// Layout: magic (u16), data_frame_type (u8), stream_frame_type (u8),
/// data_frame_size (u32, whole frame including this prefix), header_size
/// (u16, length of the variable header block; 0 for streaming frames),
/// stream_id (u32; 0 for unary), 2 reserved zero bytes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FixedHeader {
    pub data_frame_type: u8,
    pub stream_frame_type: u8,
    pub data_frame_size: u32,
    pub header_size: u16,
    pub stream_id: u32,
}

impl FixedHeader {
    /// Writes the seven fields, each multi-byte one big-endian.
    pub fn encode<B: BufMut>(&self, dst: &mut B) {
        dst.put_u16(MAGIC);
        dst.put_u8(self.data_frame_type);
        dst.put_u8(self.stream_frame_type);
        dst.put_u32(self.data_frame_size);
        dst.put_u16(self.header_size);
        dst.put_u32(self.stream_id);
        dst.put_u16(0); // reserved
    }

    /// Reads a fixed header from the front of `src` without consuming it.
    ///
    /// Size relations are not validated here; callers compare
    /// `data_frame_size` against their own limits.
    pub fn peek(src: &[u8]) -> Result<FixedHeader, CodecError> {
        if src.len() < FIXED_HEADER_LEN {
            return Err(CodecError::ShortBuffer {
                need: FIXED_HEADER_LEN,
                have: src.len(),
            });
        }

        let magic = u16::from_be_bytes([src[0], src[1]]);
        if magic != MAGIC {
            return Err(CodecError::BadMagic(magic));
        }

        Ok(FixedHeader {
            data_frame_type: src[2],
            stream_frame_type: src[3],
            data_frame_size: u32::from_be_bytes([src[4], src[5], src[6], src[7]]),
            header_size: u16::from_be_bytes([src[8], src[9]]),
            stream_id: u32::from_be_bytes([src[10], src[11], src[12], src[13]]),
        })
    }

    /// Reads a fixed header, consuming the 16 bytes from `src`.
    pub fn decode<B: Buf>(src: &mut B) -> Result<FixedHeader, CodecError> {
        if src.remaining() < FIXED_HEADER_LEN {
            return Err(CodecError::ShortBuffer {
                need: FIXED_HEADER_LEN,
                have: src.remaining(),
            });
        }

        let magic = src.get_u16();
        if magic != MAGIC {
            return Err(CodecError::BadMagic(magic));
        }

        let header = FixedHeader {
            data_frame_type: src.get_u8(),
            stream_frame_type: src.get_u8(),
            data_frame_size: src.get_u32(),
            header_size: src.get_u16(),
            stream_id: src.get_u32(),
        };
        src.advance(2); // reserved

        Ok(header)
    }
}
