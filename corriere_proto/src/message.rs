// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

use bytes::{Buf, Bytes, BytesMut};
use prost::Message as _;

use crate::headers::{
    encode_to, RequestHeader, ResponseHeader, StreamCloseMeta, StreamFeedbackMeta, StreamInitMeta,
};
use crate::{CodecError, DataFrameType, FixedHeader, StreamFrameType, FIXED_HEADER_LEN};

/// A unary request: variable header, body, optional unframed attachment.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Request {
    pub header: RequestHeader,
    pub body: Bytes,
    pub attachment: Bytes,
}

/// A unary response. Mirrors [`Request`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Response {
    pub header: ResponseHeader,
    pub body: Bytes,
    pub attachment: Bytes,
}

/// Opens a stream (caller side) or acknowledges it (callee side).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamInit {
    pub stream_id: u32,
    pub meta: StreamInitMeta,
}

/// One chunk of stream payload. No variable header.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamData {
    pub stream_id: u32,
    pub body: Bytes,
}

/// Grants the peer additional send-window credit.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamFeedback {
    pub stream_id: u32,
    pub meta: StreamFeedbackMeta,
}

/// Ends a stream, cleanly (CLOSE) or abortively (RESET).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamClose {
    pub stream_id: u32,
    pub meta: StreamCloseMeta,
}

/// Splits one whole frame off `buf` and returns its variable-header block
/// and payload. The caller has already sized `buf` to at least one frame.
fn split_frame(buf: &mut Bytes) -> Result<(FixedHeader, Bytes, Bytes), CodecError> {
    let fixed = FixedHeader::peek(buf)?;
    let frame_size = fixed.data_frame_size as usize;
    if frame_size < FIXED_HEADER_LEN + fixed.header_size as usize {
        return Err(CodecError::LayoutOverrun {
            frame_size: fixed.data_frame_size,
        });
    }
    if frame_size > buf.len() {
        return Err(CodecError::ShortBuffer {
            need: frame_size,
            have: buf.len(),
        });
    }

    let mut frame = buf.split_to(frame_size);
    frame.advance(FIXED_HEADER_LEN);
    let header = frame.split_to(fixed.header_size as usize);
    Ok((fixed, header, frame))
}

/// Splits a payload into body and trailing attachment of `attachment_size`
/// bytes.
fn split_attachment(
    mut payload: Bytes,
    attachment_size: u32,
    frame_size: u32,
) -> Result<(Bytes, Bytes), CodecError> {
    let attachment_size = attachment_size as usize;
    if attachment_size > payload.len() {
        return Err(CodecError::LayoutOverrun { frame_size });
    }
    let body = payload.split_to(payload.len() - attachment_size);
    Ok((body, payload))
}

fn frame_size_of(parts: usize) -> Result<u32, CodecError> {
    u32::try_from(parts).map_err(|_| CodecError::LayoutOverrun {
        frame_size: u32::MAX,
    })
}

/// Checks the frame-type code points before a streaming variant decodes.
fn expect_stream_frame(
    fixed: &FixedHeader,
    expected: StreamFrameType,
    name: &'static str,
) -> Result<(), CodecError> {
    if fixed.data_frame_type != DataFrameType::Stream as u8
        || fixed.stream_frame_type != expected as u8
    {
        return Err(CodecError::FrameTypeMismatch {
            expected: name,
            got_data: fixed.data_frame_type,
            got_stream: fixed.stream_frame_type,
        });
    }
    Ok(())
}

impl Request {
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut header = self.header.clone();
        header.attachment_size = self.attachment.len() as u32;

        let header_len = header.encoded_len();
        let header_size = u16::try_from(header_len).map_err(|_| CodecError::LayoutOverrun {
            frame_size: u32::MAX,
        })?;
        let frame_size = frame_size_of(
            FIXED_HEADER_LEN + header_len + self.body.len() + self.attachment.len(),
        )?;

        let mut dst = BytesMut::with_capacity(frame_size as usize);
        FixedHeader {
            data_frame_type: DataFrameType::Unary as u8,
            stream_frame_type: StreamFrameType::Unary as u8,
            data_frame_size: frame_size,
            header_size,
            stream_id: 0,
        }
        .encode(&mut dst);
        encode_to(&header, &mut dst);
        dst.extend_from_slice(&self.body);
        dst.extend_from_slice(&self.attachment);
        Ok(dst.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, CodecError> {
        let (fixed, header_bytes, payload) = split_frame(&mut buf)?;
        let header = RequestHeader::decode(header_bytes)?;
        let (body, attachment) =
            split_attachment(payload, header.attachment_size, fixed.data_frame_size)?;
        Ok(Request {
            header,
            body,
            attachment,
        })
    }
}

impl Response {
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let mut header = self.header.clone();
        header.attachment_size = self.attachment.len() as u32;

        let header_len = header.encoded_len();
        let header_size = u16::try_from(header_len).map_err(|_| CodecError::LayoutOverrun {
            frame_size: u32::MAX,
        })?;
        let frame_size = frame_size_of(
            FIXED_HEADER_LEN + header_len + self.body.len() + self.attachment.len(),
        )?;

        let mut dst = BytesMut::with_capacity(frame_size as usize);
        FixedHeader {
            data_frame_type: DataFrameType::Unary as u8,
            stream_frame_type: StreamFrameType::Unary as u8,
            data_frame_size: frame_size,
            header_size,
            stream_id: 0,
        }
        .encode(&mut dst);
        encode_to(&header, &mut dst);
        dst.extend_from_slice(&self.body);
        dst.extend_from_slice(&self.attachment);
        Ok(dst.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, CodecError> {
        let (fixed, header_bytes, payload) = split_frame(&mut buf)?;
        let header = ResponseHeader::decode(header_bytes)?;
        let (body, attachment) =
            split_attachment(payload, header.attachment_size, fixed.data_frame_size)?;
        Ok(Response {
            header,
            body,
            attachment,
        })
    }
}

/// Encodes a streaming frame whose payload is a metadata blob.
fn encode_meta_frame(
    stream_id: u32,
    frame_type: StreamFrameType,
    meta: &impl prost::Message,
) -> Result<Bytes, CodecError> {
    let frame_size = frame_size_of(FIXED_HEADER_LEN + meta.encoded_len())?;
    let mut dst = BytesMut::with_capacity(frame_size as usize);
    FixedHeader {
        data_frame_type: DataFrameType::Stream as u8,
        stream_frame_type: frame_type as u8,
        data_frame_size: frame_size,
        header_size: 0,
        stream_id,
    }
    .encode(&mut dst);
    encode_to(meta, &mut dst);
    Ok(dst.freeze())
}

impl StreamInit {
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        encode_meta_frame(self.stream_id, StreamFrameType::Init, &self.meta)
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, CodecError> {
        let (fixed, _, payload) = split_frame(&mut buf)?;
        expect_stream_frame(&fixed, StreamFrameType::Init, "INIT")?;
        Ok(StreamInit {
            stream_id: fixed.stream_id,
            meta: StreamInitMeta::decode(payload)?,
        })
    }
}

impl StreamData {
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        let frame_size = frame_size_of(FIXED_HEADER_LEN + self.body.len())?;
        let mut dst = BytesMut::with_capacity(frame_size as usize);
        FixedHeader {
            data_frame_type: DataFrameType::Stream as u8,
            stream_frame_type: StreamFrameType::Data as u8,
            data_frame_size: frame_size,
            header_size: 0,
            stream_id: self.stream_id,
        }
        .encode(&mut dst);
        dst.extend_from_slice(&self.body);
        Ok(dst.freeze())
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, CodecError> {
        let (fixed, _, payload) = split_frame(&mut buf)?;
        expect_stream_frame(&fixed, StreamFrameType::Data, "DATA")?;
        Ok(StreamData {
            stream_id: fixed.stream_id,
            body: payload,
        })
    }
}

impl StreamFeedback {
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        encode_meta_frame(self.stream_id, StreamFrameType::Feedback, &self.meta)
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, CodecError> {
        let (fixed, _, payload) = split_frame(&mut buf)?;
        expect_stream_frame(&fixed, StreamFrameType::Feedback, "FEEDBACK")?;
        Ok(StreamFeedback {
            stream_id: fixed.stream_id,
            meta: StreamFeedbackMeta::decode(payload)?,
        })
    }
}

impl StreamClose {
    pub fn encode(&self) -> Result<Bytes, CodecError> {
        encode_meta_frame(self.stream_id, StreamFrameType::Close, &self.meta)
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, CodecError> {
        let (fixed, _, payload) = split_frame(&mut buf)?;
        expect_stream_frame(&fixed, StreamFrameType::Close, "CLOSE")?;
        Ok(StreamClose {
            stream_id: fixed.stream_id,
            meta: StreamCloseMeta::decode(payload)?,
        })
    }
}

/// Every frame the protocol knows, as one tagged sum.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Request(Request),
    Response(Response),
    Init(StreamInit),
    Data(StreamData),
    Feedback(StreamFeedback),
    Close(StreamClose),
}

impl Frame {
    /// Decodes a frame as seen by the client: unary frames are responses.
    pub fn decode_client(buf: Bytes) -> Result<Frame, CodecError> {
        Self::decode(buf, false)
    }

    /// Decodes a frame as seen by the server: unary frames are requests.
    pub fn decode_server(buf: Bytes) -> Result<Frame, CodecError> {
        Self::decode(buf, true)
    }

    fn decode(buf: Bytes, unary_is_request: bool) -> Result<Frame, CodecError> {
        let fixed = FixedHeader::peek(&buf)?;
        if fixed.data_frame_type != DataFrameType::Stream as u8 {
            return if unary_is_request {
                Ok(Frame::Request(Request::decode(buf)?))
            } else {
                Ok(Frame::Response(Response::decode(buf)?))
            };
        }

        match StreamFrameType::from_u8(fixed.stream_frame_type) {
            Some(StreamFrameType::Init) => Ok(Frame::Init(StreamInit::decode(buf)?)),
            Some(StreamFrameType::Data) => Ok(Frame::Data(StreamData::decode(buf)?)),
            Some(StreamFrameType::Feedback) => Ok(Frame::Feedback(StreamFeedback::decode(buf)?)),
            Some(StreamFrameType::Close) => Ok(Frame::Close(StreamClose::decode(buf)?)),
            Some(StreamFrameType::Unary) | None => Err(CodecError::FrameTypeMismatch {
                expected: "INIT, DATA, FEEDBACK or CLOSE",
                got_data: fixed.data_frame_type,
                got_stream: fixed.stream_frame_type,
            }),
        }
    }

    pub fn encode(&self) -> Result<Bytes, CodecError> {
        match self {
            Frame::Request(frame) => frame.encode(),
            Frame::Response(frame) => frame.encode(),
            Frame::Init(frame) => frame.encode(),
            Frame::Data(frame) => frame.encode(),
            Frame::Feedback(frame) => frame.encode(),
            Frame::Close(frame) => frame.encode(),
        }
    }
}

#[cfg(test)]
mod tests {
    use prost::Message as _;

    use crate::headers::{InitRequestMeta, InitResponseMeta};
    use crate::CloseType;

    use super::*;

    fn sample_request() -> Request {
        let mut header = RequestHeader {
            request_id: 1,
            timeout: 1000,
            caller: "test_client".into(),
            callee: "corriere.test.greeter".into(),
            func: "/corriere.test.greeter/say_hello".into(),
            ..Default::default()
        };
        header.trans_info.insert("tier".into(), b"canary".to_vec());
        Request {
            header,
            body: Bytes::from_static(b"hello world"),
            attachment: Bytes::from_static(b"raw attachment bytes"),
        }
    }

    #[test]
    fn request_round_trip_with_attachment() {
        let request = sample_request();
        let encoded = request.encode().unwrap();

        let fixed = FixedHeader::peek(&encoded).unwrap();
        assert_eq!(fixed.data_frame_size as usize, encoded.len());
        assert_eq!(fixed.stream_id, 0);

        let decoded = Request::decode(encoded).unwrap();
        assert_eq!(decoded.body, request.body);
        assert_eq!(decoded.attachment, request.attachment);
        assert_eq!(decoded.header.func, request.header.func);
        assert_eq!(
            decoded.header.attachment_size as usize,
            request.attachment.len()
        );
    }

    #[test]
    fn response_round_trip() {
        let response = Response {
            header: ResponseHeader {
                request_id: 42,
                ret: 0,
                ..Default::default()
            },
            body: Bytes::from_static(b"reply"),
            attachment: Bytes::new(),
        };
        let decoded = Response::decode(response.encode().unwrap()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn attachment_larger_than_payload_is_a_layout_error() {
        // The honest encode path recomputes attachment_size, so build the
        // lying frame by hand.
        let mut lying_header = sample_request().header;
        lying_header.attachment_size = 1_000_000;
        let header_len = lying_header.encoded_len();

        let mut dst = BytesMut::new();
        FixedHeader {
            data_frame_type: DataFrameType::Unary as u8,
            stream_frame_type: StreamFrameType::Unary as u8,
            data_frame_size: (FIXED_HEADER_LEN + header_len + 5) as u32,
            header_size: header_len as u16,
            stream_id: 0,
        }
        .encode(&mut dst);
        encode_to(&lying_header, &mut dst);
        dst.extend_from_slice(b"body!");

        let err = Request::decode(dst.freeze()).unwrap_err();
        assert!(matches!(err, CodecError::LayoutOverrun { .. }));
    }

    #[test]
    fn init_round_trip() {
        let init = StreamInit {
            stream_id: 100,
            meta: StreamInitMeta {
                request_meta: Some(InitRequestMeta {
                    caller: "caller".into(),
                    callee: "callee".into(),
                    func: "/svc/stream".into(),
                    ..Default::default()
                }),
                init_window_size: 65535,
                ..Default::default()
            },
        };
        let decoded = StreamInit::decode(init.encode().unwrap()).unwrap();
        assert_eq!(decoded, init);
    }

    #[test]
    fn init_reply_carries_status() {
        let init = StreamInit {
            stream_id: 101,
            meta: StreamInitMeta {
                response_meta: Some(InitResponseMeta {
                    ret: 12,
                    error_msg: "no such func".into(),
                }),
                ..Default::default()
            },
        };
        let decoded = StreamInit::decode(init.encode().unwrap()).unwrap();
        assert_eq!(decoded.meta.response_meta.unwrap().ret, 12);
    }

    #[test]
    fn data_round_trip_keeps_stream_id() {
        let data = StreamData {
            stream_id: 100,
            body: Bytes::from_static(b"0123456789"),
        };
        let encoded = data.encode().unwrap();
        assert_eq!(encoded.len(), FIXED_HEADER_LEN + 10);
        let decoded = StreamData::decode(encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn feedback_and_close_round_trip() {
        let feedback = StreamFeedback {
            stream_id: 102,
            meta: StreamFeedbackMeta {
                window_size_increment: 49152,
            },
        };
        assert_eq!(
            StreamFeedback::decode(feedback.encode().unwrap()).unwrap(),
            feedback
        );

        let close = StreamClose {
            stream_id: 102,
            meta: StreamCloseMeta {
                close_type: CloseType::Reset as i32,
                ret: 1000,
                msg: "went sideways".into(),
                ..Default::default()
            },
        };
        assert_eq!(StreamClose::decode(close.encode().unwrap()).unwrap(), close);
    }

    #[test]
    fn stream_decoder_rejects_wrong_variant() {
        let data = StreamData {
            stream_id: 1,
            body: Bytes::from_static(b"payload"),
        };
        let err = StreamInit::decode(data.encode().unwrap()).unwrap_err();
        assert!(matches!(err, CodecError::FrameTypeMismatch { .. }));

        let unary = sample_request().encode().unwrap();
        let err = StreamData::decode(unary).unwrap_err();
        assert!(matches!(err, CodecError::FrameTypeMismatch { .. }));
    }

    #[test]
    fn frame_sum_dispatches_on_metadata() {
        let close = StreamClose {
            stream_id: 7,
            meta: StreamCloseMeta::default(),
        };
        match Frame::decode_client(close.encode().unwrap()).unwrap() {
            Frame::Close(decoded) => assert_eq!(decoded.stream_id, 7),
            other => panic!("expected CLOSE, got {other:?}"),
        }

        let response = Response::default().encode().unwrap();
        assert!(matches!(
            Frame::decode_client(response.clone()).unwrap(),
            Frame::Response(_)
        ));
        assert!(matches!(
            Frame::decode_server(response).unwrap(),
            Frame::Request(_)
        ));
    }
}
