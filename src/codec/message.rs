//! Schema 5 tagged messages.
//!
//! Message bodies, by type:
//!
//! | Type | Id | Body |
//! |------|----|------|
//! | SuccessResponse | 0 | responseId |
//! | ErrorResponse | 1 | responseId, message |
//! | ShutDownProcess | 2 | (empty) |
//! | Active | 3 | (empty) |
//! | CanFormat | 4 | path |
//! | CanFormatResponse | 5 | responseId, canFormat (0/1) |
//! | FormatFile | 6 | path, startByte, endByte, overrideConfig (0), content |
//! | FormatFileResponse | 7 | responseId, hasChanged (0/1), [content] |
//! | CancelFormat | 8 | formatId |

use tokio::io::AsyncRead;

use crate::error::ServiceError;
use crate::transport::{WireReader, MAX_MESSAGE_SIZE, SUCCESS_SENTINEL};

/// Size of the `id | type | bodyLength` header.
const HEADER_LEN: usize = 12;

/// Schema 5 message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    SuccessResponse,
    ErrorResponse,
    ShutDownProcess,
    Active,
    CanFormat,
    CanFormatResponse,
    FormatFile,
    FormatFileResponse,
    CancelFormat,
}

impl MessageKind {
    pub fn as_u32(&self) -> u32 {
        match self {
            MessageKind::SuccessResponse => 0,
            MessageKind::ErrorResponse => 1,
            MessageKind::ShutDownProcess => 2,
            MessageKind::Active => 3,
            MessageKind::CanFormat => 4,
            MessageKind::CanFormatResponse => 5,
            MessageKind::FormatFile => 6,
            MessageKind::FormatFileResponse => 7,
            MessageKind::CancelFormat => 8,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(MessageKind::SuccessResponse),
            1 => Some(MessageKind::ErrorResponse),
            2 => Some(MessageKind::ShutDownProcess),
            3 => Some(MessageKind::Active),
            4 => Some(MessageKind::CanFormat),
            5 => Some(MessageKind::CanFormatResponse),
            6 => Some(MessageKind::FormatFile),
            7 => Some(MessageKind::FormatFileResponse),
            8 => Some(MessageKind::CancelFormat),
            _ => None,
        }
    }
}

/// One body element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePart {
    Int(u32),
    /// Written as `len | bytes`.
    Bytes(Vec<u8>),
}

impl MessagePart {
    fn encoded_len(&self) -> usize {
        match self {
            MessagePart::Int(_) => 4,
            MessagePart::Bytes(bytes) => 4 + bytes.len(),
        }
    }
}

/// A message built by the client, serialised once into a flat buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub id: u32,
    pub kind: MessageKind,
    pub parts: Vec<MessagePart>,
}

impl OutgoingMessage {
    pub fn new(id: u32, kind: MessageKind) -> Self {
        Self {
            id,
            kind,
            parts: Vec::new(),
        }
    }

    pub fn add_int(mut self, value: u32) -> Self {
        self.parts.push(MessagePart::Int(value));
        self
    }

    pub fn add_string(mut self, value: &str) -> Self {
        self.parts.push(MessagePart::Bytes(value.as_bytes().to_vec()));
        self
    }

    pub fn can_format(id: u32, path: &str) -> Self {
        Self::new(id, MessageKind::CanFormat).add_string(path)
    }

    /// `start_byte`/`end_byte` must already be UTF-8 byte offsets.
    pub fn format_file(id: u32, path: &str, start_byte: u32, end_byte: u32, content: &str) -> Self {
        Self::new(id, MessageKind::FormatFile)
            .add_string(path)
            .add_int(start_byte)
            .add_int(end_byte)
            .add_int(0) // no override config
            .add_string(content)
    }

    pub fn cancel_format(id: u32, format_id: u32) -> Self {
        Self::new(id, MessageKind::CancelFormat).add_int(format_id)
    }

    pub fn shut_down(id: u32) -> Self {
        Self::new(id, MessageKind::ShutDownProcess)
    }

    pub fn success(id: u32, response_id: u32) -> Self {
        Self::new(id, MessageKind::SuccessResponse).add_int(response_id)
    }

    pub fn error(id: u32, response_id: u32, message: &str) -> Self {
        Self::new(id, MessageKind::ErrorResponse)
            .add_int(response_id)
            .add_string(message)
    }

    pub fn body_len(&self) -> usize {
        self.parts.iter().map(MessagePart::encoded_len).sum()
    }

    /// `[id][type][bodyLength][parts...][sentinel]`
    pub fn encode(&self) -> Vec<u8> {
        let body_len = self.body_len();
        let mut buf = Vec::with_capacity(HEADER_LEN + body_len + SUCCESS_SENTINEL.len());
        buf.extend_from_slice(&self.id.to_be_bytes());
        buf.extend_from_slice(&self.kind.as_u32().to_be_bytes());
        buf.extend_from_slice(&(body_len as u32).to_be_bytes());
        for part in &self.parts {
            match part {
                MessagePart::Int(value) => buf.extend_from_slice(&value.to_be_bytes()),
                MessagePart::Bytes(bytes) => {
                    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
                    buf.extend_from_slice(bytes);
                }
            }
        }
        buf.extend_from_slice(&SUCCESS_SENTINEL);
        buf
    }
}

/// A message as read off the wire; the body is decoded lazily.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingFrame {
    pub id: u32,
    /// Raw type, which may be one this client does not know.
    pub kind: u32,
    pub body: Vec<u8>,
}

impl IncomingFrame {
    /// Read one full frame and assert its trailing sentinel.
    pub async fn read_from<R: AsyncRead + Unpin>(
        reader: &mut WireReader<R>,
    ) -> Result<Self, ServiceError> {
        let id = reader.read_int().await?;
        let kind = reader.read_int().await?;
        let body_len = reader.read_int().await? as usize;
        let body = reader.read_buffer(body_len).await?;
        reader.read_and_assert_success().await?;
        Ok(Self { id, kind, body })
    }

    /// Decode a frame from a complete buffer.
    pub fn decode(bytes: &[u8]) -> Result<Self, ServiceError> {
        let mut cursor = BodyReader::new(bytes);
        let id = cursor.read_int()?;
        let kind = cursor.read_int()?;
        let body_len = cursor.read_int()? as usize;
        if body_len > MAX_MESSAGE_SIZE {
            return Err(ServiceError::ProtocolViolation(format!(
                "Body size {} exceeds maximum {} bytes",
                body_len, MAX_MESSAGE_SIZE
            )));
        }
        let body = cursor.read_bytes(body_len)?.to_vec();
        if cursor.read_bytes(SUCCESS_SENTINEL.len())? != SUCCESS_SENTINEL {
            return Err(ServiceError::ProtocolViolation(
                "Frame does not end with the success sentinel".to_string(),
            ));
        }
        if cursor.remaining() != 0 {
            return Err(ServiceError::ProtocolViolation(format!(
                "{} trailing bytes after frame",
                cursor.remaining()
            )));
        }
        Ok(Self { id, kind, body })
    }

    pub fn message_kind(&self) -> Option<MessageKind> {
        MessageKind::from_u32(self.kind)
    }

    pub fn body_reader(&self) -> BodyReader<'_> {
        BodyReader::new(&self.body)
    }

    /// Decode the body according to the message type.
    pub fn parse(&self) -> Result<DaemonMessage, ServiceError> {
        let mut body = self.body_reader();
        let message = match self.message_kind() {
            Some(MessageKind::SuccessResponse) => DaemonMessage::Success {
                response_id: body.read_int()?,
            },
            Some(MessageKind::ErrorResponse) => DaemonMessage::Error {
                response_id: body.read_int()?,
                message: body.read_string()?,
            },
            Some(MessageKind::CanFormatResponse) => DaemonMessage::CanFormatResponse {
                response_id: body.read_int()?,
                can_format: body.read_int()? == 1,
            },
            Some(MessageKind::FormatFileResponse) => {
                let response_id = body.read_int()?;
                let formatted = match body.read_int()? {
                    0 => None,
                    _ => Some(body.read_string()?),
                };
                DaemonMessage::FormatFileResponse {
                    response_id,
                    formatted,
                }
            }
            Some(MessageKind::Active) => DaemonMessage::Active,
            _ => DaemonMessage::Unsupported { kind: self.kind },
        };
        Ok(message)
    }
}

/// Daemon-to-client messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonMessage {
    Success {
        response_id: u32,
    },
    Error {
        response_id: u32,
        message: String,
    },
    CanFormatResponse {
        response_id: u32,
        can_format: bool,
    },
    /// `formatted == None` means the file did not change.
    FormatFileResponse {
        response_id: u32,
        formatted: Option<String>,
    },
    /// Liveness ping, answered with a `SuccessResponse`.
    Active,
    /// Unknown type, or a type the daemon should never send.
    Unsupported {
        kind: u32,
    },
}

impl DaemonMessage {
    /// Id of the request this message answers, if it is a response.
    pub fn response_id(&self) -> Option<u32> {
        match self {
            DaemonMessage::Success { response_id }
            | DaemonMessage::Error { response_id, .. }
            | DaemonMessage::CanFormatResponse { response_id, .. }
            | DaemonMessage::FormatFileResponse { response_id, .. } => Some(*response_id),
            DaemonMessage::Active | DaemonMessage::Unsupported { .. } => None,
        }
    }
}

/// Cursor over a message body.
pub struct BodyReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BodyReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ServiceError> {
        if len > self.remaining() {
            return Err(ServiceError::ProtocolViolation(format!(
                "Message body truncated: wanted {} bytes at offset {}, {} left",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_int(&mut self) -> Result<u32, ServiceError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_string(&mut self) -> Result<String, ServiceError> {
        let len = self.read_int()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| {
            ServiceError::ProtocolViolation(format!("String is not valid UTF-8: {}", e))
        })
    }
}
