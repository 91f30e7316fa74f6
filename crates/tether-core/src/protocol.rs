//! Binary frame vocabulary spoken between the relay and its clients.
//!
//! Every binary frame starts with a one-byte [`MessageType`] tag. Tags
//! `0x00`/`0x01` carry opaque application bytes that the relay forwards
//! untouched; tags `0x08`/`0x09` are relay-level control frames.
//!
//! Abnormal terminations are reported exclusively through [`CloseCode`].

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

/// First byte of every binary frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Application bytes travelling from the device side to the tool side.
    WatchToPhone = 0x00,
    /// Application bytes travelling from the tool side to the device side.
    PhoneToWatch = 0x01,
    /// Relay notification that this connection's pairing went up or down.
    ProxyConnectionStatusUpdate = 0x08,
    /// Authentication request (client) or reply (relay).
    ProxyAuthentication = 0x09,
}

impl MessageType {
    /// Wire tag.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = FrameError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0x00 => Ok(Self::WatchToPhone),
            0x01 => Ok(Self::PhoneToWatch),
            0x08 => Ok(Self::ProxyConnectionStatusUpdate),
            0x09 => Ok(Self::ProxyAuthentication),
            other => Err(FrameError::UnknownTag(other)),
        }
    }
}

/// Payload byte of a [`MessageType::ProxyConnectionStatusUpdate`] frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionStatus {
    /// A peer is now paired with this connection.
    Connected = 0xFF,
    /// The previous peer is gone.
    Disconnected = 0x00,
}

/// Payload byte of a [`MessageType::ProxyAuthentication`] reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthResult {
    /// The token resolved to an account.
    Success = 0x00,
    /// The token was rejected; the client may retry on the same socket.
    Failed = 0x01,
}

/// WebSocket close codes used by the relay.
///
/// The 1xxx codes come from RFC 6455 §7.4.1; the 4xxx codes are
/// application specific and mirror the HTTP status they resemble.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    /// Normal closure.
    Done = 1000,
    /// The relay is going away.
    Shutdown = 1001,
    /// Protocol violation at the WebSocket level.
    ProtocolError = 1002,
    /// A text frame was received; only binary frames are accepted.
    UnsupportedDataType = 1003,
    /// A frame was structurally invalid.
    InvalidMessage = 1008,
    /// A frame exceeded the configured size limit.
    MessageTooLarge = 1009,
    /// The relay hit an internal fault while handling the connection.
    InternalError = 1011,
    /// A non-authentication frame arrived before authentication.
    AuthorizationRequired = 4401,
    /// The connection missed its keepalive window.
    Timeout = 4408,
    /// A newer connection took this connection's slot.
    ConnectionReplaced = 4409,
}

impl CloseCode {
    /// Numeric code sent on the wire.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Short reason phrase carried in the close frame.
    pub fn reason(self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Shutdown => "shutting down",
            Self::ProtocolError => "protocol error",
            Self::UnsupportedDataType => "unsupported data type",
            Self::InvalidMessage => "invalid message",
            Self::MessageTooLarge => "message too large",
            Self::InternalError => "internal error",
            Self::AuthorizationRequired => "authorization required",
            Self::Timeout => "timeout",
            Self::ConnectionReplaced => "connection replaced",
        }
    }
}

impl TryFrom<u16> for CloseCode {
    type Error = FrameError;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        Ok(match code {
            1000 => Self::Done,
            1001 => Self::Shutdown,
            1002 => Self::ProtocolError,
            1003 => Self::UnsupportedDataType,
            1008 => Self::InvalidMessage,
            1009 => Self::MessageTooLarge,
            1011 => Self::InternalError,
            4401 => Self::AuthorizationRequired,
            4408 => Self::Timeout,
            4409 => Self::ConnectionReplaced,
            other => return Err(FrameError::UnknownCloseCode(other)),
        })
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_u16(), self.reason())
    }
}

/// Errors produced while decoding relay frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The frame had no bytes at all.
    #[error("empty frame")]
    Empty,
    /// The first byte is not a known message tag.
    #[error("unknown message tag 0x{0:02x}")]
    UnknownTag(u8),
    /// The numeric close code is not part of the relay vocabulary.
    #[error("unknown close code {0}")]
    UnknownCloseCode(u16),
    /// A frame with a different tag was handed to a decoder.
    #[error("expected {expected:?} frame, got tag 0x{actual:02x}")]
    UnexpectedTag {
        /// Tag the decoder handles.
        expected: MessageType,
        /// Tag actually present.
        actual: u8,
    },
    /// The authentication frame is missing its length byte.
    #[error("authentication frame has no token length")]
    MissingLength,
    /// The authentication frame carries no token bytes.
    #[error("authentication frame has an empty token")]
    EmptyToken,
    /// The token contains bytes outside 7-bit ASCII.
    #[error("authentication token is not ASCII")]
    NonAsciiToken,
}

/// Build a `[0x08, status]` frame.
pub fn status_frame(status: ConnectionStatus) -> Bytes {
    Bytes::copy_from_slice(&[
        MessageType::ProxyConnectionStatusUpdate.as_u8(),
        status as u8,
    ])
}

/// Build a `[0x09, result]` authentication reply frame.
pub fn auth_reply_frame(result: AuthResult) -> Bytes {
    Bytes::copy_from_slice(&[MessageType::ProxyAuthentication.as_u8(), result as u8])
}

/// Decoded client authentication request.
///
/// Layout: `[0x09, L, token[0], .., token[L-1]]`. A frame shorter than
/// `2 + L` yields the bytes that are actually present.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthRequest {
    token: String,
}

impl AuthRequest {
    /// Decode an authentication frame.
    pub fn parse(frame: &[u8]) -> Result<Self, FrameError> {
        let (&tag, rest) = frame.split_first().ok_or(FrameError::Empty)?;
        if tag != MessageType::ProxyAuthentication.as_u8() {
            return Err(FrameError::UnexpectedTag {
                expected: MessageType::ProxyAuthentication,
                actual: tag,
            });
        }
        let (&len, body) = rest.split_first().ok_or(FrameError::MissingLength)?;
        let end = usize::from(len).min(body.len());
        let token = &body[..end];
        if token.is_empty() {
            return Err(FrameError::EmptyToken);
        }
        if !token.is_ascii() {
            return Err(FrameError::NonAsciiToken);
        }
        Ok(Self {
            token: String::from_utf8_lossy(token).into_owned(),
        })
    }

    /// The access token carried by the frame.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Encode a request frame. Tokens longer than 255 bytes are truncated.
    pub fn encode(token: &str) -> Bytes {
        let raw = token.as_bytes();
        let len = raw.len().min(usize::from(u8::MAX));
        let mut frame = Vec::with_capacity(len + 2);
        frame.push(MessageType::ProxyAuthentication.as_u8());
        #[allow(clippy::cast_possible_truncation)]
        frame.push(len as u8);
        frame.extend_from_slice(&raw[..len]);
        Bytes::from(frame)
    }
}

// Tokens are credentials; keep them out of logs.
impl fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRequest")
            .field("token_len", &self.token.len())
            .finish()
    }
}
