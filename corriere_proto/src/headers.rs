// Copyright (C) 2023 Tristan Gerritsen <tristan@thewoosh.org>
// All Rights Reserved.

//! The variable header blobs riding between the fixed header and the body.
//!
//! These are protocol-buffers messages; only their serialized length matters
//! to the framing layer, which is why they live behind plain prost derives
//! instead of a codegen step.

use std::collections::HashMap;

use bytes::BytesMut;
use prost::Message;

/// Transported key/value metadata, propagated end to end.
pub type TransInfo = HashMap<String, Vec<u8>>;

/// Variable header of a unary request.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestHeader {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(uint32, tag = "2")]
    pub call_type: u32,
    #[prost(uint32, tag = "3")]
    pub request_id: u32,
    /// Remaining budget for this call, milliseconds.
    #[prost(uint32, tag = "4")]
    pub timeout: u32,
    #[prost(string, tag = "5")]
    pub caller: String,
    #[prost(string, tag = "6")]
    pub callee: String,
    #[prost(string, tag = "7")]
    pub func: String,
    #[prost(uint32, tag = "8")]
    pub message_type: u32,
    #[prost(map = "string, bytes", tag = "9")]
    pub trans_info: TransInfo,
    #[prost(uint32, tag = "10")]
    pub content_type: u32,
    #[prost(uint32, tag = "11")]
    pub content_encoding: u32,
    /// Length of the attachment bytes that follow the body unframed.
    #[prost(uint32, tag = "12")]
    pub attachment_size: u32,
}

/// Variable header of a unary response.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseHeader {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(uint32, tag = "2")]
    pub call_type: u32,
    #[prost(uint32, tag = "3")]
    pub request_id: u32,
    #[prost(int32, tag = "4")]
    pub ret: i32,
    #[prost(int32, tag = "5")]
    pub func_ret: i32,
    #[prost(string, tag = "6")]
    pub error_msg: String,
    #[prost(uint32, tag = "7")]
    pub message_type: u32,
    #[prost(map = "string, bytes", tag = "8")]
    pub trans_info: TransInfo,
    #[prost(uint32, tag = "9")]
    pub content_type: u32,
    #[prost(uint32, tag = "10")]
    pub content_encoding: u32,
    #[prost(uint32, tag = "12")]
    pub attachment_size: u32,
}

/// Caller-side half of the INIT metadata.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitRequestMeta {
    #[prost(string, tag = "1")]
    pub caller: String,
    #[prost(string, tag = "2")]
    pub callee: String,
    #[prost(string, tag = "3")]
    pub func: String,
    #[prost(uint32, tag = "4")]
    pub message_type: u32,
    #[prost(map = "string, bytes", tag = "5")]
    pub trans_info: TransInfo,
}

/// Server-side half of the INIT metadata, filled in the INIT reply.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InitResponseMeta {
    #[prost(int32, tag = "1")]
    pub ret: i32,
    #[prost(string, tag = "2")]
    pub error_msg: String,
}

/// Metadata of an INIT frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamInitMeta {
    #[prost(message, optional, tag = "1")]
    pub request_meta: Option<InitRequestMeta>,
    #[prost(message, optional, tag = "2")]
    pub response_meta: Option<InitResponseMeta>,
    /// 0 advertises that the sender does not do flow control.
    #[prost(uint32, tag = "3")]
    pub init_window_size: u32,
    #[prost(uint32, tag = "4")]
    pub content_type: u32,
    #[prost(uint32, tag = "5")]
    pub content_encoding: u32,
}

/// Metadata of a FEEDBACK frame: a window credit grant.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamFeedbackMeta {
    #[prost(uint32, tag = "1")]
    pub window_size_increment: u32,
}

/// Metadata of a CLOSE frame.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StreamCloseMeta {
    /// 0 = CLOSE, 1 = RESET.
    #[prost(int32, tag = "1")]
    pub close_type: i32,
    #[prost(int32, tag = "2")]
    pub ret: i32,
    #[prost(string, tag = "3")]
    pub msg: String,
    #[prost(uint32, tag = "4")]
    pub message_type: u32,
    #[prost(map = "string, bytes", tag = "5")]
    pub trans_info: TransInfo,
    #[prost(int32, tag = "6")]
    pub func_ret: i32,
}

/// Serializes a header into `dst`.
pub(crate) fn encode_to(msg: &impl Message, dst: &mut BytesMut) {
    msg.encode(dst)
        .expect("BytesMut grows on demand, encoding cannot run out of space");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_header_round_trip() {
        let mut header = RequestHeader {
            version: 0,
            call_type: 0,
            request_id: 7,
            timeout: 1000,
            caller: "test_client".into(),
            callee: "corriere.test.greeter".into(),
            func: "/corriere.test.greeter/say_hello".into(),
            ..Default::default()
        };
        header
            .trans_info
            .insert("shard".into(), b"eu-west".to_vec());

        let mut buf = BytesMut::new();
        encode_to(&header, &mut buf);
        assert_eq!(buf.len(), header.encoded_len());

        let decoded = RequestHeader::decode(buf.freeze()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn init_meta_with_both_halves() {
        let meta = StreamInitMeta {
            request_meta: Some(InitRequestMeta {
                caller: "caller".into(),
                func: "/svc/stream".into(),
                ..Default::default()
            }),
            response_meta: Some(InitResponseMeta {
                ret: 12,
                error_msg: "no such func".into(),
            }),
            init_window_size: 65535,
            ..Default::default()
        };

        let mut buf = BytesMut::new();
        encode_to(&meta, &mut buf);
        let decoded = StreamInitMeta::decode(buf.freeze()).unwrap();
        assert_eq!(decoded, meta);
    }
}
