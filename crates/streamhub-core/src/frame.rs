//! StreamingHub messages and their wire encoding.
//!
//! Every message is a MessagePack array. The direction of travel and the
//! array length select the message kind; where two kinds share a length, the
//! first element is a small type tag.
//!
//! ```text
//! server -> client
//!   [methodId, args]                                   Broadcast
//!   [callId, methodId, result]                         Response (callId -1: handshake marker)
//!   [callId, status, detail, message|nil]              ResponseWithError
//!   [0x00, nil, uuid, methodId, args]                  ClientResultRequest
//!   [0x7f, seq, serverSentAt, nil, metadata]           ServerHeartbeat
//!   [0x7e, seq, clientSentAt, nil, extra]              ClientHeartbeatResponse
//!
//! client -> server
//!   [methodId, args]                                   Request
//!   [callId, methodId, args]                           RequestWithResponse
//!   [0x00, uuid, methodId, result]                     ClientResultResponse
//!   [0x01, uuid, methodId, [status, detail, message]]  ClientResultResponseError
//!   [0x7e, seq, clientSentAt, extra]                   ClientHeartbeat
//!   [0x7f, seq, serverSentAt, nil]                     ServerHeartbeatResponse
//! ```
//!
//! Payload fields (`args`, `result`, `metadata`, `extra`) are always the last
//! element and are kept as raw bytes; they are produced and consumed by a
//! [`PayloadSerializer`](crate::PayloadSerializer).

use std::fmt::Display;

use bytes::Bytes;
use serde::Serialize;
use uuid::Uuid;

use crate::serializer::NIL;
use crate::{BufferPool, DecodeError, EncodeError, MethodId, PayloadSerializer, StatusCode};

/// Header carrying the protocol revision in the handshake marker.
pub const VERSION_HEADER: &str = "x-magiconion-streaminghub-version";

/// Protocol revision spoken by this crate.
pub const PROTOCOL_VERSION: &str = "2";

/// Call id reserved for the handshake marker. Real calls never use ids <= 0.
pub const MARKER_CALL_ID: i32 = -1;

const TYPE_CLIENT_RESULT: i64 = 0x00;
const TYPE_CLIENT_RESULT_ERROR: i64 = 0x01;
const TYPE_CLIENT_HEARTBEAT: i64 = 0x7e;
const TYPE_SERVER_HEARTBEAT: i64 = 0x7f;

/// Which side of the connection sent a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Client,
    Server,
}

/// One message on the duplex stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Fire-and-forget call; no response is sent.
    Request { method_id: MethodId, args: Bytes },
    RequestWithResponse {
        call_id: i32,
        method_id: MethodId,
        args: Bytes,
    },
    Response {
        call_id: i32,
        method_id: MethodId,
        result: Bytes,
    },
    ResponseWithError {
        call_id: i32,
        status: StatusCode,
        detail: String,
        message: Option<String>,
    },
    Broadcast { method_id: MethodId, args: Bytes },
    ClientResultRequest {
        client_call_id: Uuid,
        method_id: MethodId,
        args: Bytes,
    },
    ClientResultResponse {
        client_call_id: Uuid,
        method_id: MethodId,
        result: Bytes,
    },
    ClientResultResponseError {
        client_call_id: Uuid,
        method_id: MethodId,
        status: StatusCode,
        detail: String,
        message: Option<String>,
    },
    /// Server-initiated liveness probe, broadcast to every connection per tick.
    ServerHeartbeat {
        sequence: i16,
        sent_at: i64,
        metadata: Bytes,
    },
    /// Echoes the probe's `sent_at` back to the server.
    ServerHeartbeatResponse { sequence: i16, sent_at: i64 },
    /// Client-initiated probe; `sent_at` comes back in the response for RTT.
    ClientHeartbeat {
        sequence: i16,
        sent_at: i64,
        extra: Bytes,
    },
    ClientHeartbeatResponse {
        sequence: i16,
        sent_at: i64,
        extra: Bytes,
    },
    /// First frame written by a hub, announcing the protocol revision.
    Handshake { headers: Vec<(String, String)> },
}

/// The bytes of an empty payload (a lone nil).
pub fn nil_payload() -> Bytes {
    Bytes::from_static(&[NIL])
}

/// Header of a payload-carrying frame, written ahead of a serialized value.
///
/// This lets typed callers serialize straight into the outgoing buffer
/// instead of building an intermediate payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameHead {
    Request { method_id: MethodId },
    RequestWithResponse { call_id: i32, method_id: MethodId },
    Response { call_id: i32, method_id: MethodId },
    Broadcast { method_id: MethodId },
    ClientResultRequest { client_call_id: Uuid, method_id: MethodId },
    ClientResultResponse { client_call_id: Uuid, method_id: MethodId },
}

impl FrameHead {
    pub fn write(&self, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
        match *self {
            Self::Request { method_id } | Self::Broadcast { method_id } => {
                array(buf, 2)?;
                int(buf, method_id)
            }
            Self::RequestWithResponse { call_id, method_id }
            | Self::Response { call_id, method_id } => {
                array(buf, 3)?;
                int(buf, call_id)?;
                int(buf, method_id)
            }
            Self::ClientResultRequest {
                client_call_id,
                method_id,
            } => {
                array(buf, 5)?;
                int(buf, TYPE_CLIENT_RESULT)?;
                nil(buf)?;
                uuid(buf, &client_call_id)?;
                int(buf, method_id)
            }
            Self::ClientResultResponse {
                client_call_id,
                method_id,
            } => {
                array(buf, 4)?;
                int(buf, TYPE_CLIENT_RESULT)?;
                uuid(buf, &client_call_id)?;
                int(buf, method_id)
            }
        }
    }

    /// Encode this head followed by `value` into a pooled buffer.
    pub fn encode<S, T>(&self, pool: &BufferPool, value: &T) -> Result<Bytes, EncodeError>
    where
        S: PayloadSerializer,
        T: Serialize + ?Sized,
    {
        let mut buf = pool.get();
        self.write(&mut buf)?;
        S::serialize(value, &mut buf)?;
        Ok(buf.freeze())
    }
}

impl Frame {
    pub fn origin(&self) -> Origin {
        match self {
            Self::Request { .. }
            | Self::RequestWithResponse { .. }
            | Self::ClientResultResponse { .. }
            | Self::ClientResultResponseError { .. }
            | Self::ServerHeartbeatResponse { .. }
            | Self::ClientHeartbeat { .. } => Origin::Client,
            Self::Response { .. }
            | Self::ResponseWithError { .. }
            | Self::Broadcast { .. }
            | Self::ClientResultRequest { .. }
            | Self::ServerHeartbeat { .. }
            | Self::ClientHeartbeatResponse { .. }
            | Self::Handshake { .. } => Origin::Server,
        }
    }

    /// The handshake marker announcing [`PROTOCOL_VERSION`].
    pub fn handshake() -> Self {
        Self::Handshake {
            headers: vec![(VERSION_HEADER.to_string(), PROTOCOL_VERSION.to_string())],
        }
    }

    /// Append the wire encoding of this frame to `buf`.
    pub fn encode_into(&self, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
        match self {
            Self::Request { method_id, args } => {
                FrameHead::Request {
                    method_id: *method_id,
                }
                .write(buf)?;
                buf.extend_from_slice(args);
            }
            Self::RequestWithResponse {
                call_id,
                method_id,
                args,
            } => {
                FrameHead::RequestWithResponse {
                    call_id: *call_id,
                    method_id: *method_id,
                }
                .write(buf)?;
                buf.extend_from_slice(args);
            }
            Self::Response {
                call_id,
                method_id,
                result,
            } => {
                FrameHead::Response {
                    call_id: *call_id,
                    method_id: *method_id,
                }
                .write(buf)?;
                buf.extend_from_slice(result);
            }
            Self::ResponseWithError {
                call_id,
                status,
                detail,
                message,
            } => {
                array(buf, 4)?;
                int(buf, *call_id)?;
                int(buf, status.as_i32())?;
                string(buf, detail)?;
                opt_string(buf, message.as_deref())?;
            }
            Self::Broadcast { method_id, args } => {
                FrameHead::Broadcast {
                    method_id: *method_id,
                }
                .write(buf)?;
                buf.extend_from_slice(args);
            }
            Self::ClientResultRequest {
                client_call_id,
                method_id,
                args,
            } => {
                FrameHead::ClientResultRequest {
                    client_call_id: *client_call_id,
                    method_id: *method_id,
                }
                .write(buf)?;
                buf.extend_from_slice(args);
            }
            Self::ClientResultResponse {
                client_call_id,
                method_id,
                result,
            } => {
                FrameHead::ClientResultResponse {
                    client_call_id: *client_call_id,
                    method_id: *method_id,
                }
                .write(buf)?;
                buf.extend_from_slice(result);
            }
            Self::ClientResultResponseError {
                client_call_id,
                method_id,
                status,
                detail,
                message,
            } => {
                array(buf, 4)?;
                int(buf, TYPE_CLIENT_RESULT_ERROR)?;
                uuid(buf, client_call_id)?;
                int(buf, *method_id)?;
                array(buf, 3)?;
                int(buf, status.as_i32())?;
                string(buf, detail)?;
                opt_string(buf, message.as_deref())?;
            }
            Self::ServerHeartbeat {
                sequence,
                sent_at,
                metadata,
            } => {
                array(buf, 5)?;
                int(buf, TYPE_SERVER_HEARTBEAT)?;
                int(buf, *sequence)?;
                int(buf, *sent_at)?;
                nil(buf)?;
                payload_or_nil(buf, metadata);
            }
            Self::ServerHeartbeatResponse { sequence, sent_at } => {
                array(buf, 4)?;
                int(buf, TYPE_SERVER_HEARTBEAT)?;
                int(buf, *sequence)?;
                int(buf, *sent_at)?;
                nil(buf)?;
            }
            Self::ClientHeartbeat {
                sequence,
                sent_at,
                extra,
            } => {
                array(buf, 4)?;
                int(buf, TYPE_CLIENT_HEARTBEAT)?;
                int(buf, *sequence)?;
                int(buf, *sent_at)?;
                payload_or_nil(buf, extra);
            }
            Self::ClientHeartbeatResponse {
                sequence,
                sent_at,
                extra,
            } => {
                array(buf, 5)?;
                int(buf, TYPE_CLIENT_HEARTBEAT)?;
                int(buf, *sequence)?;
                int(buf, *sent_at)?;
                nil(buf)?;
                payload_or_nil(buf, extra);
            }
            Self::Handshake { headers } => {
                array(buf, 3)?;
                int(buf, MARKER_CALL_ID)?;
                int(buf, 0)?;
                let len = u32::try_from(headers.len())
                    .map_err(|_| EncodeError::Header("too many handshake headers".into()))?;
                rmp::encode::write_map_len(buf, len).map_err(header_err)?;
                for (key, value) in headers {
                    string(buf, key)?;
                    string(buf, value)?;
                }
            }
        }
        Ok(())
    }

    /// Encode into a buffer drawn from `pool`.
    pub fn encode(&self, pool: &BufferPool) -> Result<Bytes, EncodeError> {
        let mut buf = pool.get();
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a frame sent by `origin`.
    ///
    /// Payload fields are zero-copy slices of `bytes`.
    pub fn decode(bytes: &Bytes, origin: Origin) -> Result<Self, DecodeError> {
        match origin {
            Origin::Client => decode_from_client(bytes),
            Origin::Server => decode_from_server(bytes),
        }
    }

    /// Method id of frames that address a method.
    pub fn method_id(&self) -> Option<MethodId> {
        match self {
            Self::Request { method_id, .. }
            | Self::RequestWithResponse { method_id, .. }
            | Self::Response { method_id, .. }
            | Self::Broadcast { method_id, .. }
            | Self::ClientResultRequest { method_id, .. }
            | Self::ClientResultResponse { method_id, .. }
            | Self::ClientResultResponseError { method_id, .. } => Some(*method_id),
            _ => None,
        }
    }
}

fn decode_from_client(bytes: &Bytes) -> Result<Frame, DecodeError> {
    let mut rd = Reader::new(bytes);
    let len = rd.array_len()?;
    let frame = match len {
        2 => Frame::Request {
            method_id: rd.int()?,
            args: rd.rest(),
        },
        3 => Frame::RequestWithResponse {
            call_id: rd.int()?,
            method_id: rd.int()?,
            args: rd.rest(),
        },
        4 => match rd.int::<i64>()? {
            TYPE_CLIENT_RESULT => Frame::ClientResultResponse {
                client_call_id: rd.uuid()?,
                method_id: rd.int()?,
                result: rd.rest(),
            },
            TYPE_CLIENT_RESULT_ERROR => {
                let client_call_id = rd.uuid()?;
                let method_id = rd.int()?;
                let fields = rd.array_len()?;
                if fields != 3 {
                    return Err(DecodeError::InvalidData(format!(
                        "client result error has {fields} fields, expected 3"
                    )));
                }
                Frame::ClientResultResponseError {
                    client_call_id,
                    method_id,
                    status: StatusCode::from_i32(rd.int()?),
                    detail: rd.opt_string()?.unwrap_or_default(),
                    message: rd.opt_string()?,
                }
            }
            TYPE_CLIENT_HEARTBEAT => Frame::ClientHeartbeat {
                sequence: rd.int()?,
                sent_at: rd.int()?,
                extra: rd.rest(),
            },
            TYPE_SERVER_HEARTBEAT => Frame::ServerHeartbeatResponse {
                sequence: rd.int()?,
                // Older clients leave the timestamp nil.
                sent_at: rd.opt_int()?.unwrap_or_default(),
            },
            kind => {
                return Err(DecodeError::UnknownMessage {
                    len,
                    kind: Some(kind),
                });
            }
        },
        _ => return Err(DecodeError::UnknownMessage { len, kind: None }),
    };
    Ok(frame)
}

fn decode_from_server(bytes: &Bytes) -> Result<Frame, DecodeError> {
    let mut rd = Reader::new(bytes);
    let len = rd.array_len()?;
    let frame = match len {
        2 => Frame::Broadcast {
            method_id: rd.int()?,
            args: rd.rest(),
        },
        3 => {
            let call_id = rd.int()?;
            let method_id = rd.int()?;
            if call_id == MARKER_CALL_ID {
                Frame::Handshake {
                    headers: rd.headers()?,
                }
            } else {
                Frame::Response {
                    call_id,
                    method_id,
                    result: rd.rest(),
                }
            }
        }
        4 => Frame::ResponseWithError {
            call_id: rd.int()?,
            status: StatusCode::from_i32(rd.int()?),
            detail: rd.opt_string()?.unwrap_or_default(),
            message: rd.opt_string()?,
        },
        5 => match rd.int::<i64>()? {
            TYPE_CLIENT_RESULT => {
                rd.skip_nil()?;
                Frame::ClientResultRequest {
                    client_call_id: rd.uuid()?,
                    method_id: rd.int()?,
                    args: rd.rest(),
                }
            }
            TYPE_SERVER_HEARTBEAT => {
                let sequence = rd.int()?;
                let sent_at = rd.int()?;
                rd.skip_nil()?;
                Frame::ServerHeartbeat {
                    sequence,
                    sent_at,
                    metadata: rd.rest(),
                }
            }
            TYPE_CLIENT_HEARTBEAT => {
                let sequence = rd.int()?;
                let sent_at = rd.int()?;
                rd.skip_nil()?;
                Frame::ClientHeartbeatResponse {
                    sequence,
                    sent_at,
                    extra: rd.rest(),
                }
            }
            kind => {
                return Err(DecodeError::UnknownMessage {
                    len,
                    kind: Some(kind),
                });
            }
        },
        _ => return Err(DecodeError::UnknownMessage { len, kind: None }),
    };
    Ok(frame)
}

// ----------------------------------------------------------------------------
// Writing
// ----------------------------------------------------------------------------

fn header_err<E: Display>(e: E) -> EncodeError {
    EncodeError::Header(e.to_string())
}

fn array(buf: &mut Vec<u8>, len: u32) -> Result<(), EncodeError> {
    rmp::encode::write_array_len(buf, len)
        .map(|_| ())
        .map_err(header_err)
}

fn int(buf: &mut Vec<u8>, value: impl Into<i64>) -> Result<(), EncodeError> {
    rmp::encode::write_sint(buf, value.into())
        .map(|_| ())
        .map_err(header_err)
}

fn nil(buf: &mut Vec<u8>) -> Result<(), EncodeError> {
    rmp::encode::write_nil(buf).map_err(header_err)
}

fn string(buf: &mut Vec<u8>, value: &str) -> Result<(), EncodeError> {
    rmp::encode::write_str(buf, value).map_err(header_err)
}

fn opt_string(buf: &mut Vec<u8>, value: Option<&str>) -> Result<(), EncodeError> {
    match value {
        Some(value) => string(buf, value),
        None => nil(buf),
    }
}

fn uuid(buf: &mut Vec<u8>, id: &Uuid) -> Result<(), EncodeError> {
    rmp::encode::write_bin(buf, id.as_bytes()).map_err(header_err)
}

fn payload_or_nil(buf: &mut Vec<u8>, payload: &Bytes) {
    if payload.is_empty() {
        buf.push(NIL);
    } else {
        buf.extend_from_slice(payload);
    }
}

// ----------------------------------------------------------------------------
// Reading
// ----------------------------------------------------------------------------

struct Reader<'a> {
    source: &'a Bytes,
    rd: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(source: &'a Bytes) -> Self {
        Self {
            source,
            rd: &source[..],
        }
    }

    fn ensure_more(&self) -> Result<(), DecodeError> {
        if self.rd.is_empty() {
            Err(DecodeError::UnexpectedEof)
        } else {
            Ok(())
        }
    }

    fn array_len(&mut self) -> Result<u32, DecodeError> {
        self.ensure_more()?;
        rmp::decode::read_array_len(&mut self.rd).map_err(invalid)
    }

    fn int<T: wire_int::FromWire>(&mut self) -> Result<T, DecodeError> {
        self.ensure_more()?;
        let value: i64 = rmp::decode::read_int(&mut self.rd).map_err(invalid)?;
        T::from_wire(value)
    }

    fn opt_int<T: wire_int::FromWire>(&mut self) -> Result<Option<T>, DecodeError> {
        self.ensure_more()?;
        if self.rd[0] == NIL {
            self.rd = &self.rd[1..];
            return Ok(None);
        }
        self.int::<T>().map(Some)
    }

    fn skip_nil(&mut self) -> Result<(), DecodeError> {
        self.ensure_more()?;
        rmp::decode::read_nil(&mut self.rd).map_err(invalid)
    }

    fn opt_string(&mut self) -> Result<Option<String>, DecodeError> {
        self.ensure_more()?;
        if self.rd[0] == NIL {
            self.rd = &self.rd[1..];
            return Ok(None);
        }
        let len = rmp::decode::read_str_len(&mut self.rd).map_err(invalid)? as usize;
        let raw = self.take(len)?;
        std::str::from_utf8(raw)
            .map(|s| Some(s.to_owned()))
            .map_err(invalid)
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        self.opt_string()?
            .ok_or_else(|| DecodeError::InvalidData("expected string, found nil".into()))
    }

    fn uuid(&mut self) -> Result<Uuid, DecodeError> {
        self.ensure_more()?;
        let len = rmp::decode::read_bin_len(&mut self.rd).map_err(invalid)? as usize;
        let raw = self.take(len)?;
        Uuid::from_slice(raw).map_err(invalid)
    }

    fn headers(&mut self) -> Result<Vec<(String, String)>, DecodeError> {
        self.ensure_more()?;
        if self.rd[0] == NIL {
            return Ok(Vec::new());
        }
        let len = rmp::decode::read_map_len(&mut self.rd).map_err(invalid)?;
        let mut headers = Vec::with_capacity(len.min(16) as usize);
        for _ in 0..len {
            let key = self.string()?;
            let value = self.string()?;
            headers.push((key, value));
        }
        Ok(headers)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.rd.len() < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let rd: &'a [u8] = self.rd;
        let (head, tail) = rd.split_at(len);
        self.rd = tail;
        Ok(head)
    }

    /// The remaining bytes, as a slice of the source buffer.
    fn rest(&mut self) -> Bytes {
        let offset = self.source.len() - self.rd.len();
        self.rd = &[];
        self.source.slice(offset..)
    }
}

fn invalid<E: Display>(e: E) -> DecodeError {
    DecodeError::InvalidData(e.to_string())
}

mod wire_int {
    use crate::DecodeError;

    /// Narrowing from the wire's i64 with an explicit range check.
    pub trait FromWire: Sized {
        fn from_wire(value: i64) -> Result<Self, DecodeError>;
    }

    macro_rules! from_wire {
        ($($ty:ty),*) => {$(
            impl FromWire for $ty {
                fn from_wire(value: i64) -> Result<Self, DecodeError> {
                    <$ty>::try_from(value).map_err(|_| {
                        DecodeError::InvalidData(format!(
                            "{value} out of range for {}",
                            stringify!($ty)
                        ))
                    })
                }
            }
        )*};
    }

    from_wire!(i16, i32, i64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MessagePackSerializer;

    fn roundtrip(frame: Frame) {
        let pool = BufferPool::new();
        let bytes = frame.encode(&pool).unwrap();
        let decoded = Frame::decode(&bytes, frame.origin()).unwrap();
        assert_eq!(decoded, frame);
    }

    fn packed<T: Serialize>(value: &T) -> Bytes {
        let mut buf = Vec::new();
        MessagePackSerializer::serialize(value, &mut buf).unwrap();
        Bytes::from(buf)
    }

    #[test]
    fn every_variant_roundtrips() {
        let id = Uuid::new_v4();
        let frames = vec![
            Frame::Request {
                method_id: 7,
                args: packed(&()),
            },
            Frame::RequestWithResponse {
                call_id: 1,
                method_id: crate::method_id("Add"),
                args: packed(&(2, 3)),
            },
            Frame::Response {
                call_id: 1,
                method_id: crate::method_id("Add"),
                result: packed(&5),
            },
            Frame::ResponseWithError {
                call_id: 9,
                status: StatusCode::Internal,
                detail: "boom".into(),
                message: None,
            },
            Frame::ResponseWithError {
                call_id: 10,
                status: StatusCode::NotFound,
                detail: "missing".into(),
                message: Some("stack".into()),
            },
            Frame::Broadcast {
                method_id: -12345,
                args: packed(&"hi"),
            },
            Frame::ClientResultRequest {
                client_call_id: id,
                method_id: 3,
                args: packed(&("a", 1, true)),
            },
            Frame::ClientResultResponse {
                client_call_id: id,
                method_id: 3,
                result: packed(&42u8),
            },
            Frame::ClientResultResponseError {
                client_call_id: id,
                method_id: 3,
                status: StatusCode::Unknown,
                detail: "receiver failed".into(),
                message: Some("detail".into()),
            },
            Frame::ServerHeartbeat {
                sequence: -1,
                sent_at: 1_700_000_000_000,
                metadata: packed(&"meta"),
            },
            Frame::ServerHeartbeatResponse {
                sequence: 12,
                sent_at: 1_700_000_000_000,
            },
            Frame::ClientHeartbeat {
                sequence: i16::MAX,
                sent_at: 123,
                extra: nil_payload(),
            },
            Frame::ClientHeartbeatResponse {
                sequence: i16::MIN,
                sent_at: 123,
                extra: nil_payload(),
            },
            Frame::handshake(),
        ];
        for frame in frames {
            roundtrip(frame);
        }
    }

    #[test]
    fn request_layout_matches_wire_format() {
        let frame = Frame::RequestWithResponse {
            call_id: 1,
            method_id: 2,
            args: packed(&(2, 3)),
        };
        let bytes = frame.encode(&BufferPool::new()).unwrap();
        assert_eq!(&bytes[..], &[0x93, 0x01, 0x02, 0x92, 0x02, 0x03]);
    }

    #[test]
    fn handshake_marker_uses_reserved_call_id() {
        let bytes = Frame::handshake().encode(&BufferPool::new()).unwrap();
        // [-1, 0, {..}]
        assert_eq!(&bytes[..3], &[0x93, 0xff, 0x00]);
    }

    #[test]
    fn server_heartbeat_response_echoes_sent_at() {
        let frame = Frame::ServerHeartbeatResponse {
            sequence: 3,
            sent_at: 5,
        };
        let bytes = frame.encode(&BufferPool::new()).unwrap();
        assert_eq!(&bytes[..], &[0x94, 0x7f, 0x03, 0x05, 0xc0]);

        // [0x7f, 3, nil, nil]
        let legacy = Bytes::from_static(&[0x94, 0x7f, 0x03, 0xc0, 0xc0]);
        assert_eq!(
            Frame::decode(&legacy, Origin::Client).unwrap(),
            Frame::ServerHeartbeatResponse {
                sequence: 3,
                sent_at: 0
            }
        );
    }

    #[test]
    fn direction_selects_kind_for_two_element_arrays() {
        let bytes = Frame::Request {
            method_id: 5,
            args: packed(&1),
        }
        .encode(&BufferPool::new())
        .unwrap();
        assert!(matches!(
            Frame::decode(&bytes, Origin::Server).unwrap(),
            Frame::Broadcast { method_id: 5, .. }
        ));
    }

    #[test]
    fn unknown_discriminant_is_rejected() {
        // array(6)
        let bytes = Bytes::from_static(&[0x96, 0, 0, 0, 0, 0, 0]);
        assert_eq!(
            Frame::decode(&bytes, Origin::Server),
            Err(DecodeError::UnknownMessage { len: 6, kind: None })
        );

        // array(4) with type 0x42 from a client
        let bytes = Bytes::from_static(&[0x94, 0x42, 0xc0, 0xc0, 0xc0]);
        assert_eq!(
            Frame::decode(&bytes, Origin::Client),
            Err(DecodeError::UnknownMessage {
                len: 4,
                kind: Some(0x42)
            })
        );
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let bytes = Bytes::from_static(&[0x93, 0x01]);
        assert_eq!(
            Frame::decode(&bytes, Origin::Client),
            Err(DecodeError::UnexpectedEof)
        );
        assert_eq!(
            Frame::decode(&Bytes::new(), Origin::Client),
            Err(DecodeError::UnexpectedEof)
        );
    }

    #[test]
    fn typed_head_encoding_matches_frame_encoding() {
        let pool = BufferPool::new();
        let head = FrameHead::Broadcast { method_id: 11 };
        let typed = head
            .encode::<MessagePackSerializer, _>(&pool, &("room", 3))
            .unwrap();
        let framed = Frame::Broadcast {
            method_id: 11,
            args: packed(&("room", 3)),
        }
        .encode(&pool)
        .unwrap();
        assert_eq!(typed, framed);
    }
}
