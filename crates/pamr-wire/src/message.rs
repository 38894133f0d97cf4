//! Wire protocol message types and binary framing.
//!
//! Every frame starts with a fixed 20-byte big-endian header:
//!
//! ```text
//! LENGTH u32 | PROTO_ID u32 | MSG_TYPE u32 | MSG_ID u64
//! ```
//!
//! `LENGTH` covers the whole frame, header included. The body layout depends
//! on `MSG_TYPE`; data messages end with the opaque payload, which the router
//! relays without looking at it.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use pamr_types::id::COOKIE_LEN;
use pamr_types::{AgentId, MagicCookie, PamrError, RouterId};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Protocol identifier carried by every frame.
pub const PROTOCOL_ID: u32 = 2;

/// Size of the common header.
pub const HEADER_LEN: usize = 20;

/// Maximum single message size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Encoding of "no agent" in id fields.
const NO_AGENT: u64 = u64::MAX;

/// Errors from the framing layer.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Protocol mismatch: local={local}, remote={remote}")]
    VersionMismatch { local: u32, remote: u32 },
    #[error("Malformed message: {reason}")]
    Malformed {
        /// Correlation id, when the header could be read.
        msg_id: Option<u64>,
        reason: String,
    },
}

impl WireError {
    /// The peer broke the framing rules, as opposed to the connection
    /// failing underneath.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            WireError::Malformed { .. }
                | WireError::VersionMismatch { .. }
                | WireError::MessageTooLarge { .. }
        )
    }

    /// Correlation id of the offending frame, when its header was read.
    pub fn msg_id(&self) -> Option<u64> {
        match self {
            WireError::Malformed { msg_id, .. } => *msg_id,
            _ => None,
        }
    }

    fn malformed(msg_id: Option<u64>, reason: impl Into<String>) -> Self {
        WireError::Malformed {
            msg_id,
            reason: reason.into(),
        }
    }
}

impl From<WireError> for PamrError {
    fn from(err: WireError) -> Self {
        match err {
            WireError::Io(e) => PamrError::Io(e),
            other => PamrError::TunnelFailure(other.to_string()),
        }
    }
}

/// Message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    RegistrationRequest = 0,
    RegistrationReply = 1,
    DataRequest = 2,
    DataReply = 3,
    Error = 4,
    HeartbeatClient = 5,
    HeartbeatRouter = 6,
    ReloadConfiguration = 7,
}

impl MessageType {
    fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => MessageType::RegistrationRequest,
            1 => MessageType::RegistrationReply,
            2 => MessageType::DataRequest,
            3 => MessageType::DataReply,
            4 => MessageType::Error,
            5 => MessageType::HeartbeatClient,
            6 => MessageType::HeartbeatRouter,
            7 => MessageType::ReloadConfiguration,
            _ => return None,
        })
    }
}

/// Error codes carried by [`ErrorMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// The faulty agent lost its tunnel. Broadcast to every other client.
    DisconnectionBroadcast = 0,
    /// The recipient is known but currently has no tunnel.
    NotConnectedRecipient = 1,
    /// The router never registered the recipient.
    UnknownRecipient = 2,
    /// The requested agent id cannot be granted.
    InvalidAgentId = 3,
    /// The router id presented on reconnection is not this router's.
    InvalidRouterId = 4,
    /// The magic cookie does not match.
    WrongMagicCookie = 5,
    /// The router could not parse a frame.
    MalformedMessage = 6,
}

impl ErrorCode {
    fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => ErrorCode::DisconnectionBroadcast,
            1 => ErrorCode::NotConnectedRecipient,
            2 => ErrorCode::UnknownRecipient,
            3 => ErrorCode::InvalidAgentId,
            4 => ErrorCode::InvalidRouterId,
            5 => ErrorCode::WrongMagicCookie,
            6 => ErrorCode::MalformedMessage,
            _ => return None,
        })
    }
}

/// Registration sent by an agent as the first frame of a tunnel.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationRequest {
    pub msg_id: u64,
    /// Id to reclaim, or `None` to get a fresh one.
    pub agent_id: Option<AgentId>,
    /// Router the id was obtained from, on reconnection.
    pub router_id: Option<RouterId>,
    pub heartbeat_period_ms: u32,
    pub cookie: MagicCookie,
    pub hostname: String,
}

/// Router's answer to a successful registration.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationReply {
    pub msg_id: u64,
    pub agent_id: AgentId,
    pub router_id: RouterId,
    /// Heartbeat timeout of the router. Agents use it as their read timeout.
    pub heartbeat_period_ms: u32,
    pub cookie: MagicCookie,
}

/// A data request or reply.
#[derive(Debug, Clone, PartialEq)]
pub struct DataMessage {
    pub msg_id: u64,
    pub src: AgentId,
    pub dst: AgentId,
    /// Only meaningful for requests. Replies are never one-way.
    pub one_way: bool,
    pub payload: Bytes,
}

/// A delivery or protocol failure notification.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorMessage {
    /// Correlation id of the message the error is about.
    pub msg_id: u64,
    /// Agent the error is about: the unreachable recipient, the
    /// disconnected agent, or the sender of a malformed frame.
    pub faulty: Option<AgentId>,
    /// Agent the error is delivered to.
    pub recipient: Option<AgentId>,
    pub code: ErrorCode,
    /// Whether the undeliverable message was a reply rather than a request.
    pub about_reply: bool,
}

/// A PAMR protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    RegistrationRequest(RegistrationRequest),
    RegistrationReply(RegistrationReply),
    DataRequest(DataMessage),
    DataReply(DataMessage),
    Error(ErrorMessage),
    /// Agent's answer to a router heartbeat.
    HeartbeatClient { heartbeat_id: u64, agent_id: AgentId },
    /// Liveness probe sent by the router.
    HeartbeatRouter { heartbeat_id: u64 },
    /// Ask the router to reload its reserved-agents file.
    ReloadConfiguration { msg_id: u64, cookie: MagicCookie },
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::RegistrationRequest(_) => MessageType::RegistrationRequest,
            Message::RegistrationReply(_) => MessageType::RegistrationReply,
            Message::DataRequest(_) => MessageType::DataRequest,
            Message::DataReply(_) => MessageType::DataReply,
            Message::Error(_) => MessageType::Error,
            Message::HeartbeatClient { .. } => MessageType::HeartbeatClient,
            Message::HeartbeatRouter { .. } => MessageType::HeartbeatRouter,
            Message::ReloadConfiguration { .. } => MessageType::ReloadConfiguration,
        }
    }

    pub fn msg_id(&self) -> u64 {
        match self {
            Message::RegistrationRequest(m) => m.msg_id,
            Message::RegistrationReply(m) => m.msg_id,
            Message::DataRequest(m) | Message::DataReply(m) => m.msg_id,
            Message::Error(m) => m.msg_id,
            Message::HeartbeatClient { heartbeat_id, .. } => *heartbeat_id,
            Message::HeartbeatRouter { heartbeat_id } => *heartbeat_id,
            Message::ReloadConfiguration { msg_id, .. } => *msg_id,
        }
    }

    /// Payload size of data messages, 0 for everything else.
    pub fn payload_len(&self) -> usize {
        match self {
            Message::DataRequest(m) | Message::DataReply(m) => m.payload.len(),
            _ => 0,
        }
    }

    /// Size of the encoded frame, header included.
    pub fn encoded_len(&self) -> usize {
        match self {
            // src + dst + one-way flag
            Message::DataRequest(m) => HEADER_LEN + 17 + m.payload.len(),
            // src + dst
            Message::DataReply(m) => HEADER_LEN + 16 + m.payload.len(),
            other => other.encode().len(),
        }
    }

    /// Encode into a complete frame, header included.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 64 + self.payload_len());
        buf.put_u32(0); // patched below
        buf.put_u32(PROTOCOL_ID);
        buf.put_u32(self.message_type() as u32);
        buf.put_u64(self.msg_id());

        match self {
            Message::RegistrationRequest(m) => {
                buf.put_u64(encode_agent(m.agent_id));
                buf.put_u64(m.router_id.map(|r| r.0).unwrap_or(0));
                buf.put_u32(m.heartbeat_period_ms);
                buf.put_slice(m.cookie.as_bytes());
                let host = m.hostname.as_bytes();
                let len = host.len().min(u16::MAX as usize);
                buf.put_u16(len as u16);
                buf.put_slice(&host[..len]);
            }
            Message::RegistrationReply(m) => {
                buf.put_u64(m.agent_id.0);
                buf.put_u64(m.router_id.0);
                buf.put_u32(m.heartbeat_period_ms);
                buf.put_slice(m.cookie.as_bytes());
            }
            Message::DataRequest(m) => {
                buf.put_u64(m.src.0);
                buf.put_u64(m.dst.0);
                buf.put_u8(u8::from(m.one_way));
                buf.put_slice(&m.payload);
            }
            Message::DataReply(m) => {
                buf.put_u64(m.src.0);
                buf.put_u64(m.dst.0);
                buf.put_slice(&m.payload);
            }
            Message::Error(m) => {
                buf.put_u64(encode_agent(m.faulty));
                buf.put_u64(encode_agent(m.recipient));
                buf.put_u32(m.code as u32);
                buf.put_u8(u8::from(m.about_reply));
            }
            Message::HeartbeatClient {
                heartbeat_id,
                agent_id,
            } => {
                buf.put_u64(*heartbeat_id);
                buf.put_u64(agent_id.0);
            }
            Message::HeartbeatRouter { heartbeat_id } => {
                buf.put_u64(*heartbeat_id);
                buf.put_u64(NO_AGENT);
            }
            Message::ReloadConfiguration { cookie, .. } => {
                buf.put_slice(cookie.as_bytes());
            }
        }

        let len = buf.len() as u32;
        buf[0..4].copy_from_slice(&len.to_be_bytes());
        buf.freeze()
    }

    /// Decode a complete frame, header included.
    pub fn decode(mut frame: Bytes) -> Result<Message, WireError> {
        if frame.len() < HEADER_LEN {
            return Err(WireError::malformed(None, "frame shorter than header"));
        }
        let length = frame.get_u32();
        let proto = frame.get_u32();
        let kind = frame.get_u32();
        let msg_id = frame.get_u64();
        let id = Some(msg_id);

        if length as usize != frame.len() + HEADER_LEN {
            return Err(WireError::malformed(id, "length field does not match frame"));
        }
        if proto != PROTOCOL_ID {
            return Err(WireError::VersionMismatch {
                local: PROTOCOL_ID,
                remote: proto,
            });
        }
        let kind = MessageType::from_code(kind)
            .ok_or_else(|| WireError::malformed(id, format!("unknown message type {kind}")))?;

        let mut body = Body { buf: frame, msg_id };
        let msg = match kind {
            MessageType::RegistrationRequest => {
                let agent_id = decode_agent(body.u64("agent_id")?);
                let router_id = match body.u64("router_id")? {
                    0 => None,
                    r => Some(RouterId(r)),
                };
                let heartbeat_period_ms = body.u32("heartbeat_period")?;
                let cookie = body.cookie()?;
                let host_len = body.u16("hostname length")? as usize;
                let host = body.take(host_len, "hostname")?;
                let hostname = String::from_utf8(host.to_vec())
                    .map_err(|_| WireError::malformed(id, "hostname is not UTF-8"))?;
                body.finish()?;
                Message::RegistrationRequest(RegistrationRequest {
                    msg_id,
                    agent_id,
                    router_id,
                    heartbeat_period_ms,
                    cookie,
                    hostname,
                })
            }
            MessageType::RegistrationReply => {
                let agent_id = AgentId(body.u64("agent_id")?);
                let router_id = RouterId(body.u64("router_id")?);
                let heartbeat_period_ms = body.u32("heartbeat_period")?;
                let cookie = body.cookie()?;
                body.finish()?;
                if router_id.0 == 0 {
                    return Err(WireError::malformed(id, "registration reply without router id"));
                }
                Message::RegistrationReply(RegistrationReply {
                    msg_id,
                    agent_id,
                    router_id,
                    heartbeat_period_ms,
                    cookie,
                })
            }
            MessageType::DataRequest => {
                let src = AgentId(body.u64("src")?);
                let dst = AgentId(body.u64("dst")?);
                let flags = body.u8("flags")?;
                Message::DataRequest(DataMessage {
                    msg_id,
                    src,
                    dst,
                    one_way: flags & 1 == 1,
                    payload: body.rest(),
                })
            }
            MessageType::DataReply => {
                let src = AgentId(body.u64("src")?);
                let dst = AgentId(body.u64("dst")?);
                Message::DataReply(DataMessage {
                    msg_id,
                    src,
                    dst,
                    one_way: false,
                    payload: body.rest(),
                })
            }
            MessageType::Error => {
                let faulty = decode_agent(body.u64("faulty")?);
                let recipient = decode_agent(body.u64("recipient")?);
                let raw = body.u32("error code")?;
                let code = ErrorCode::from_code(raw)
                    .ok_or_else(|| WireError::malformed(id, format!("unknown error code {raw}")))?;
                let about_reply = body.u8("flags")? & 1 == 1;
                body.finish()?;
                Message::Error(ErrorMessage {
                    msg_id,
                    faulty,
                    recipient,
                    code,
                    about_reply,
                })
            }
            MessageType::HeartbeatClient | MessageType::HeartbeatRouter => {
                let heartbeat_id = body.u64("heartbeat_id")?;
                let src = body.u64("src")?;
                body.finish()?;
                if kind == MessageType::HeartbeatClient {
                    Message::HeartbeatClient {
                        heartbeat_id,
                        agent_id: AgentId(src),
                    }
                } else {
                    Message::HeartbeatRouter { heartbeat_id }
                }
            }
            MessageType::ReloadConfiguration => {
                let cookie = body.cookie()?;
                body.finish()?;
                Message::ReloadConfiguration { msg_id, cookie }
            }
        };
        Ok(msg)
    }
}

fn encode_agent(id: Option<AgentId>) -> u64 {
    id.map(|a| a.0).unwrap_or(NO_AGENT)
}

fn decode_agent(raw: u64) -> Option<AgentId> {
    if raw == NO_AGENT {
        None
    } else {
        Some(AgentId(raw))
    }
}

/// Bounds-checked reader over a frame body.
struct Body {
    buf: Bytes,
    msg_id: u64,
}

impl Body {
    fn need(&self, n: usize, field: &str) -> Result<(), WireError> {
        if self.buf.remaining() < n {
            return Err(WireError::malformed(
                Some(self.msg_id),
                format!("truncated {field}"),
            ));
        }
        Ok(())
    }

    fn u8(&mut self, field: &str) -> Result<u8, WireError> {
        self.need(1, field)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self, field: &str) -> Result<u16, WireError> {
        self.need(2, field)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self, field: &str) -> Result<u32, WireError> {
        self.need(4, field)?;
        Ok(self.buf.get_u32())
    }

    fn u64(&mut self, field: &str) -> Result<u64, WireError> {
        self.need(8, field)?;
        Ok(self.buf.get_u64())
    }

    fn take(&mut self, n: usize, field: &str) -> Result<Bytes, WireError> {
        self.need(n, field)?;
        Ok(self.buf.split_to(n))
    }

    fn cookie(&mut self) -> Result<MagicCookie, WireError> {
        let raw = self.take(COOKIE_LEN, "magic cookie")?;
        let mut bytes = [0u8; COOKIE_LEN];
        bytes.copy_from_slice(&raw);
        Ok(MagicCookie::from_bytes(bytes))
    }

    fn rest(self) -> Bytes {
        self.buf
    }

    fn finish(self) -> Result<(), WireError> {
        if self.buf.has_remaining() {
            return Err(WireError::malformed(
                Some(self.msg_id),
                format!("{} trailing bytes", self.buf.remaining()),
            ));
        }
        Ok(())
    }
}

/// Write a framed message.
pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let bytes = msg.encode();
    if bytes.len() > MAX_MESSAGE_SIZE as usize {
        return Err(WireError::MessageTooLarge {
            size: bytes.len() as u32,
            max: MAX_MESSAGE_SIZE,
        });
    }
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a framed message.
pub async fn read_message<R>(reader: &mut R) -> Result<Message, WireError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed);
        }
        Err(e) => return Err(WireError::Io(e)),
    }

    let len = u32::from_be_bytes(header);
    if len > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    if (len as usize) < HEADER_LEN {
        return Err(WireError::malformed(None, format!("frame length {len} below header size")));
    }

    let mut frame = BytesMut::zeroed(len as usize);
    frame[..4].copy_from_slice(&header);
    reader.read_exact(&mut frame[4..]).await?;
    Message::decode(frame.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_request() -> Message {
        Message::DataRequest(DataMessage {
            msg_id: 77,
            src: AgentId(4096),
            dst: AgentId(4097),
            one_way: true,
            payload: Bytes::from_static(b"payload bytes"),
        })
    }

    #[test]
    fn test_header_layout() {
        let frame = data_request().encode();
        assert_eq!(&frame[0..4], &(frame.len() as u32).to_be_bytes());
        assert_eq!(&frame[4..8], &PROTOCOL_ID.to_be_bytes());
        assert_eq!(&frame[8..12], &2u32.to_be_bytes());
        assert_eq!(&frame[12..20], &77u64.to_be_bytes());
    }

    #[test]
    fn test_encoded_len_matches_frame() {
        let request = data_request();
        assert_eq!(request.encoded_len(), request.encode().len());
        let reply = Message::DataReply(DataMessage {
            msg_id: 3,
            src: AgentId(4097),
            dst: AgentId(4096),
            one_way: false,
            payload: Bytes::from_static(b"done"),
        });
        assert_eq!(reply.encoded_len(), reply.encode().len());
    }

    #[test]
    fn test_data_request_decode() {
        let msg = data_request();
        let decoded = Message::decode(msg.encode()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_registration_request_without_id() {
        let msg = Message::RegistrationRequest(RegistrationRequest {
            msg_id: 1,
            agent_id: None,
            router_id: None,
            heartbeat_period_ms: 0,
            cookie: MagicCookie::from_secret("c"),
            hostname: "compute-17".to_string(),
        });
        match Message::decode(msg.encode()).unwrap() {
            Message::RegistrationRequest(req) => {
                assert_eq!(req.agent_id, None);
                assert_eq!(req.router_id, None);
                assert_eq!(req.hostname, "compute-17");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_error_message_unknown_faulty() {
        let msg = Message::Error(ErrorMessage {
            msg_id: 9,
            faulty: None,
            recipient: Some(AgentId(4100)),
            code: ErrorCode::MalformedMessage,
            about_reply: false,
        });
        assert_eq!(Message::decode(msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_truncated_frame_is_malformed() {
        let frame = Message::HeartbeatRouter { heartbeat_id: 3 }.encode();
        let mut cut = BytesMut::from(&frame[..frame.len() - 4]);
        let len = cut.len() as u32;
        cut[0..4].copy_from_slice(&len.to_be_bytes());
        match Message::decode(cut.freeze()) {
            Err(WireError::Malformed { msg_id, .. }) => assert_eq!(msg_id, Some(3)),
            other => panic!("expected malformed, got {other:?}"),
        }
    }

    #[test]
    fn test_wrong_protocol_rejected() {
        let frame = data_request().encode();
        let mut bad = BytesMut::from(&frame[..]);
        bad[4..8].copy_from_slice(&9u32.to_be_bytes());
        assert!(matches!(
            Message::decode(bad.freeze()),
            Err(WireError::VersionMismatch { remote: 9, .. })
        ));
    }

    #[test]
    fn test_protocol_violations_are_classified() {
        let bad_proto = WireError::VersionMismatch { local: PROTOCOL_ID, remote: 9 };
        assert!(bad_proto.is_protocol_violation());
        assert_eq!(bad_proto.msg_id(), None);
        let malformed = WireError::malformed(Some(4), "short");
        assert!(malformed.is_protocol_violation());
        assert_eq!(malformed.msg_id(), Some(4));
        assert!(!WireError::ConnectionClosed.is_protocol_violation());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let frame = data_request().encode();
        let mut bad = BytesMut::from(&frame[..]);
        bad[8..12].copy_from_slice(&42u32.to_be_bytes());
        assert!(matches!(
            Message::decode(bad.freeze()),
            Err(WireError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn test_stream_read_write() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let sent = vec![
            data_request(),
            Message::HeartbeatClient {
                heartbeat_id: 5,
                agent_id: AgentId(4096),
            },
        ];
        for msg in &sent {
            write_message(&mut a, msg).await.unwrap();
        }
        drop(a);
        for msg in &sent {
            assert_eq!(&read_message(&mut b).await.unwrap(), msg);
        }
        assert!(matches!(
            read_message(&mut b).await,
            Err(WireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_MESSAGE_SIZE + 1).to_be_bytes()).await.unwrap();
        assert!(matches!(
            read_message(&mut b).await,
            Err(WireError::MessageTooLarge { .. })
        ));
    }
}
