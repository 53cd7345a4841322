//! The cross-scope wire format.
//!
//! Every frame is `| type: u8 | length: u32 BE | payload |`. Payloads are
//! postcard-encoded structs defined below, so every field of the data model
//! survives a round trip exactly. The length prefix replaces any in-band
//! end-of-message marker; frames above [`MAX_FRAME_LEN`] are refused.
//!
//! Control payloads carry an explicit `txn` id so acknowledgements can be
//! correlated on a full-duplex channel, the same way responses correlate to
//! requests by `request_id`.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{
    ApiRequest, ApiResponse, InterceptorId, Message, Metadata, RequestId, SubscriptionId,
};

/// Largest payload a peer will accept.
pub const MAX_FRAME_LEN: u32 = 1024 * 1024;

/// A framing or payload-codec failure.
#[derive(Debug, Error)]
pub enum WireError {
    /// The frame length prefix exceeds [`MAX_FRAME_LEN`].
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLong {
        /// Declared payload length.
        len: u32,
        /// The limit that was exceeded.
        max: u32,
    },
    /// The type tag is not one of the assigned codes.
    #[error("unknown frame type {0}")]
    UnknownType(u8),
    /// Payload (de)serialization failed.
    #[error("payload codec failure: {0}")]
    Codec(#[from] postcard::Error),
    /// The peer closed the connection at a frame boundary.
    #[error("connection closed")]
    Closed,
    /// The underlying stream failed.
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Assigned frame type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// An endpoint request. Sent client→hub, and hub→client when the hub
    /// dispatches to a remotely owned endpoint.
    Request = 1,
    /// The response to a request, publish, or intercept invocation.
    Response = 2,
    /// A published message; also used for subscription deliveries.
    Publish = 3,
    /// The hub asks a client to run a remotely registered interceptor.
    Intercept = 4,
    /// Register (or withdraw) an endpoint.
    RegisterApi = 5,
    /// Acknowledges `RegisterApi`.
    RegisterAck = 6,
    /// Subscribe (or unsubscribe) a pattern.
    Subscribe = 7,
    /// Acknowledges `Subscribe`.
    SubscribeAck = 8,
    /// Register (or withdraw) a message interceptor.
    RegisterInterceptor = 9,
    /// Acknowledges `RegisterInterceptor`.
    InterceptorAck = 10,
    /// Orderly teardown.
    Shutdown = 99,
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, WireError> {
        Ok(match value {
            1 => FrameKind::Request,
            2 => FrameKind::Response,
            3 => FrameKind::Publish,
            4 => FrameKind::Intercept,
            5 => FrameKind::RegisterApi,
            6 => FrameKind::RegisterAck,
            7 => FrameKind::Subscribe,
            8 => FrameKind::SubscribeAck,
            9 => FrameKind::RegisterInterceptor,
            10 => FrameKind::InterceptorAck,
            99 => FrameKind::Shutdown,
            other => return Err(WireError::UnknownType(other)),
        })
    }
}

/// A decoded frame: type tag plus raw payload bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// The type tag.
    pub kind: FrameKind,
    /// Postcard-encoded payload.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Build a frame from a serializable payload.
    pub fn encode_payload<T: Serialize>(kind: FrameKind, payload: &T) -> Result<Self, WireError> {
        Ok(Self {
            kind,
            payload: postcard::to_stdvec(payload)?,
        })
    }

    /// Decode the payload into a concrete type.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, WireError> {
        Ok(postcard::from_bytes(&self.payload)?)
    }

    /// Serialize to wire bytes: tag, big-endian length, payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 4 + self.payload.len());
        out.push(self.kind as u8);
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Decode one frame from a byte slice, returning the remainder.
    pub fn take_from_slice(buf: &[u8]) -> Result<(Self, &[u8]), WireError> {
        let (&tag, rest) = buf.split_first().ok_or(WireError::Closed)?;
        let kind = FrameKind::try_from(tag)?;
        if rest.len() < 4 {
            return Err(WireError::Closed);
        }
        let (len_bytes, rest) = rest.split_at(4);
        let len = u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]);
        if len > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLong {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        if rest.len() < len as usize {
            return Err(WireError::Closed);
        }
        let (payload, rest) = rest.split_at(len as usize);
        Ok((
            Self {
                kind,
                payload: payload.to_vec(),
            },
            rest,
        ))
    }
}

/// Read a single frame from the stream.
///
/// A clean EOF at the frame boundary reports [`WireError::Closed`].
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, WireError> {
    let mut tag = [0u8; 1];
    match reader.read_exact(&mut tag).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Err(WireError::Closed),
        Err(e) => return Err(e.into()),
    }
    let kind = FrameKind::try_from(tag[0])?;

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLong {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Frame { kind, payload })
}

/// Write a single frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), WireError> {
    writer.write_all(&frame.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

//////////////////////////////////////////////////////////////////////////////
// PAYLOADS
//////////////////////////////////////////////////////////////////////////////

/// Payload of [`FrameKind::Response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// The request / publish / invocation this answers.
    pub request_id: RequestId,
    /// The response itself.
    pub response: ApiResponse,
}

/// Payload of [`FrameKind::Publish`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishFrame {
    /// Correlates the publisher's response (the intercept value). Ignored
    /// on hub→client subscription deliveries.
    pub publish_id: RequestId,
    /// The message.
    pub message: Message,
}

/// Payload of [`FrameKind::Intercept`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterceptFrame {
    /// Correlates the client's answer.
    pub invocation_id: RequestId,
    /// The message (or reframed request) under interception.
    pub message: Message,
}

/// Payload of [`FrameKind::RegisterApi`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterFrame {
    /// Correlates the acknowledgement.
    pub txn: RequestId,
    /// The endpoint path.
    pub path: String,
    /// Registration metadata; never the handler.
    pub metadata: Metadata,
    /// True to withdraw the registration instead.
    pub remove: bool,
}

/// Payload of [`FrameKind::RegisterAck`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterAckFrame {
    /// The transaction being acknowledged.
    pub txn: RequestId,
    /// Outcome; the error text mirrors the hub-side failure.
    pub result: Result<(), String>,
}

/// Payload of [`FrameKind::Subscribe`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeFrame {
    /// Correlates the acknowledgement.
    pub txn: RequestId,
    /// The subscription pattern.
    pub pattern: String,
    /// Dispatch priority.
    pub priority: i32,
    /// `Some` to remove that subscription instead.
    pub remove: Option<SubscriptionId>,
}

/// Payload of [`FrameKind::SubscribeAck`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeAckFrame {
    /// The transaction being acknowledged.
    pub txn: RequestId,
    /// The assigned subscription id, or the hub-side failure.
    pub result: Result<SubscriptionId, String>,
}

/// Payload of [`FrameKind::RegisterInterceptor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterInterceptorFrame {
    /// Correlates the acknowledgement.
    pub txn: RequestId,
    /// The interception pattern.
    pub pattern: String,
    /// Consultation priority.
    pub priority: i32,
    /// `Some` to remove that interceptor instead.
    pub remove: Option<InterceptorId>,
}

/// Payload of [`FrameKind::InterceptorAck`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterceptorAckFrame {
    /// The transaction being acknowledged.
    pub txn: RequestId,
    /// The assigned interceptor id, or the hub-side failure.
    pub result: Result<InterceptorId, String>,
}

impl Frame {
    /// A request frame.
    pub fn request(request: &ApiRequest) -> Result<Self, WireError> {
        Self::encode_payload(FrameKind::Request, request)
    }

    /// A response frame answering `request_id`.
    pub fn response(request_id: RequestId, response: &ApiResponse) -> Result<Self, WireError> {
        Self::encode_payload(
            FrameKind::Response,
            &ResponseFrame {
                request_id,
                response: response.clone(),
            },
        )
    }

    /// A publish frame.
    pub fn publish(publish_id: RequestId, message: &Message) -> Result<Self, WireError> {
        Self::encode_payload(
            FrameKind::Publish,
            &PublishFrame {
                publish_id,
                message: message.clone(),
            },
        )
    }

    /// An intercept-invocation frame.
    pub fn intercept(invocation_id: RequestId, message: &Message) -> Result<Self, WireError> {
        Self::encode_payload(
            FrameKind::Intercept,
            &InterceptFrame {
                invocation_id,
                message: message.clone(),
            },
        )
    }

    /// A shutdown frame.
    pub fn shutdown() -> Self {
        Self {
            kind: FrameKind::Shutdown,
            payload: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ClientId, HubId, ResponseStatus};

    fn sample_request() -> ApiRequest {
        let mut metadata = Metadata::new();
        metadata.insert("fallback".into(), "/api/v1/users".into());
        metadata.insert("source".into(), "web".into());
        ApiRequest::new(
            "/api/v2/users",
            b"body".to_vec(),
            metadata,
            ClientId::new(),
            HubId::new(),
        )
    }

    #[test]
    fn frame_bytes_round_trip() {
        let frame = Frame::request(&sample_request()).unwrap();
        let bytes = frame.to_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(
            u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize,
            frame.payload.len()
        );

        let (decoded, rest) = Frame::take_from_slice(&bytes).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, frame);
        let req: ApiRequest = decoded.decode_payload().unwrap();
        assert_eq!(req.path, "/api/v2/users");
        assert_eq!(req.payload, b"body");
        assert_eq!(req.metadata.get("source").map(String::as_str), Some("web"));
    }

    #[test]
    fn every_payload_type_round_trips() {
        let request = sample_request();
        let response = ApiResponse {
            status: ResponseStatus::Approximated,
            payload: b"x".to_vec(),
            metadata: {
                let mut m = Metadata::new();
                m.insert("matched_path".into(), "/products/search".into());
                m
            },
        };
        let message = Message::new("/search/files", b"q".to_vec(), Metadata::new(), ClientId::new());

        let frames = vec![
            Frame::request(&request).unwrap(),
            Frame::response(request.request_id, &response).unwrap(),
            Frame::publish(RequestId::new(), &message).unwrap(),
            Frame::intercept(RequestId::new(), &message).unwrap(),
            Frame::encode_payload(
                FrameKind::RegisterApi,
                &RegisterFrame {
                    txn: RequestId::new(),
                    path: "/echo".into(),
                    metadata: Metadata::new(),
                    remove: false,
                },
            )
            .unwrap(),
            Frame::encode_payload(
                FrameKind::RegisterAck,
                &RegisterAckFrame {
                    txn: RequestId::new(),
                    result: Err("endpoint `/echo` is already registered".into()),
                },
            )
            .unwrap(),
            Frame::encode_payload(
                FrameKind::Subscribe,
                &SubscribeFrame {
                    txn: RequestId::new(),
                    pattern: "/search/*".into(),
                    priority: 10,
                    remove: None,
                },
            )
            .unwrap(),
            Frame::encode_payload(
                FrameKind::SubscribeAck,
                &SubscribeAckFrame {
                    txn: RequestId::new(),
                    result: Ok(SubscriptionId::new()),
                },
            )
            .unwrap(),
            Frame::encode_payload(
                FrameKind::RegisterInterceptor,
                &RegisterInterceptorFrame {
                    txn: RequestId::new(),
                    pattern: "/search/files".into(),
                    priority: 10,
                    remove: None,
                },
            )
            .unwrap(),
            Frame::encode_payload(
                FrameKind::InterceptorAck,
                &InterceptorAckFrame {
                    txn: RequestId::new(),
                    result: Ok(InterceptorId::new()),
                },
            )
            .unwrap(),
            Frame::shutdown(),
        ];

        for frame in frames {
            let bytes = frame.to_bytes();
            let (decoded, rest) = Frame::take_from_slice(&bytes).unwrap();
            assert!(rest.is_empty());
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn unknown_type_is_refused() {
        let bytes = [42u8, 0, 0, 0, 0];
        assert!(matches!(
            Frame::take_from_slice(&bytes),
            Err(WireError::UnknownType(42))
        ));
    }

    #[test]
    fn oversized_frames_are_refused() {
        let mut bytes = vec![1u8];
        bytes.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());
        assert!(matches!(
            Frame::take_from_slice(&bytes),
            Err(WireError::FrameTooLong { .. })
        ));
    }

    #[tokio::test]
    async fn frames_survive_a_stream() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let frame = Frame::request(&sample_request()).unwrap();
        write_frame(&mut a, &frame).await.unwrap();
        write_frame(&mut a, &Frame::shutdown()).await.unwrap();

        let first = read_frame(&mut b).await.unwrap();
        assert_eq!(first, frame);
        let second = read_frame(&mut b).await.unwrap();
        assert_eq!(second.kind, FrameKind::Shutdown);

        drop(a);
        assert!(matches!(read_frame(&mut b).await, Err(WireError::Closed)));
    }
}
