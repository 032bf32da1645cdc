//! Tunnel wire protocol: text envelopes and binary chunk frames.
//!
//! The tunnel is a message-framed bidirectional byte stream (WebSocket), so
//! this layer never length-prefixes. Two frame kinds travel on it:
//!
//! - **Text**: one UTF-8 JSON object `{"id": <uuid>, "type": <tag>, "payload": {...}}`.
//!   `type` is drawn from the closed [`MessageKind`] vocabulary; an unknown
//!   tag fails deserialization and is fatal for the session.
//! - **Binary**: 36 ASCII bytes of the canonical hyphenated request UUID,
//!   followed by the payload. A frame with an empty payload (exactly 36
//!   bytes) signals end-of-stream for that request.
//!
//! One UUID namespace covers both reply and stream correlation; the 36-byte
//! prefix is the minimum that lets a recipient route opaque bytes without
//! parsing them.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Length of the ASCII request-id prefix on binary frames.
pub const CHUNK_ID_LEN: usize = 36;

/// Control vocabulary. Serialized as the wire tag strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    #[serde(rename = "AUTH")]
    Auth,
    #[serde(rename = "AUTH_OK")]
    AuthOk,
    #[serde(rename = "AUTH_FAIL")]
    AuthFail,
    #[serde(rename = "REGISTER")]
    Register,
    #[serde(rename = "LIST_VIDEOS")]
    ListVideos,
    #[serde(rename = "LIST_VIDEOS_RES")]
    ListVideosRes,
    #[serde(rename = "READ_FILE")]
    ReadFile,
    #[serde(rename = "READ_FILE_RES")]
    ReadFileRes,
    #[serde(rename = "CANCEL")]
    Cancel,
    #[serde(rename = "ERROR")]
    Error,
}

impl MessageKind {
    /// Whether this kind completes a pending request (`*_RES` or `ERROR`).
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            MessageKind::ListVideosRes | MessageKind::ReadFileRes | MessageKind::Error
        )
    }
}

/// A text frame: request, reply, or control message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Build a new request envelope with a fresh v4 id.
    pub fn request(kind: MessageKind, payload: &impl Serialize) -> Result<Self, ProtocolError> {
        Ok(Self {
            id: Uuid::new_v4(),
            kind,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Build a reply envelope correlated to an existing request id.
    pub fn reply(id: Uuid, kind: MessageKind, payload: &impl Serialize) -> Result<Self, ProtocolError> {
        Ok(Self {
            id,
            kind,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Deserialize the payload into a typed shape.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Encode a binary chunk frame: 36-byte hyphenated UUID prefix + payload.
pub fn encode_chunk(id: Uuid, data: &[u8]) -> Bytes {
    let mut buf = Vec::with_capacity(CHUNK_ID_LEN + data.len());
    let mut id_buf = [0u8; CHUNK_ID_LEN];
    id.hyphenated().encode_lower(&mut id_buf);
    buf.extend_from_slice(&id_buf);
    buf.extend_from_slice(data);
    Bytes::from(buf)
}

/// Encode the end-of-stream marker for a request (empty payload).
pub fn chunk_eos(id: Uuid) -> Bytes {
    encode_chunk(id, &[])
}

/// Decode a binary chunk frame into (request id, payload).
///
/// An empty payload means end-of-stream; the caller distinguishes that by
/// checking `payload.is_empty()`.
pub fn decode_chunk(frame: &[u8]) -> Result<(Uuid, Bytes), ProtocolError> {
    if frame.len() < CHUNK_ID_LEN {
        return Err(ProtocolError::ChunkTooShort(frame.len()));
    }
    let id = Uuid::try_parse_ascii(&frame[..CHUNK_ID_LEN])
        .map_err(|_| ProtocolError::ChunkPrefix)?;
    Ok((id, Bytes::copy_from_slice(&frame[CHUNK_ID_LEN..])))
}

/// Wire-level decode failures. All of these are fatal for the session.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("binary frame too short ({0} bytes, need at least {CHUNK_ID_LEN})")]
    ChunkTooShort(usize),
    #[error("binary frame has a malformed request-id prefix")]
    ChunkPrefix,
    #[error("unexpected {0:?} frame")]
    UnexpectedKind(MessageKind),
}

// ========== Payload shapes ==========

/// `AUTH` (agent → proxy), the first frame after transport establishment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthPayload {
    pub token: String,
}

/// `AUTH_FAIL` (proxy → agent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthFailPayload {
    pub reason: String,
}

/// `REGISTER` (agent → proxy), immediately after `AUTH_OK`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub device_id: String,
    pub camera_ids: Vec<String>,
}

/// `LIST_VIDEOS` (proxy → agent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListVideosPayload {
    pub camera_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour: Option<u32>,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

/// One file record within a `LIST_VIDEOS_RES`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoEntry {
    pub filename: String,
    pub size: u64,
    /// ISO-8601, parsed from the recording filename.
    pub timestamp: String,
    pub camera: String,
}

/// `LIST_VIDEOS_RES` (agent → proxy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListVideosResult {
    pub videos: Vec<VideoEntry>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub total_pages: usize,
}

/// `READ_FILE` (proxy → agent). `start`/`end` are inclusive byte offsets;
/// `end = None` means to end-of-file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFilePayload {
    pub camera_id: String,
    pub filename: String,
    #[serde(default)]
    pub start: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<u64>,
}

/// `READ_FILE_RES` (agent → proxy), sent before the first binary chunk.
///
/// `size` is the total file size; `start`/`end` are the actual inclusive
/// range that will be streamed; `length` is the byte count on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ReadFileMeta {
    pub size: u64,
    pub start: u64,
    pub end: u64,
    pub length: u64,
}

/// `ERROR` (agent → proxy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// One camera as exposed by `GET /cameras`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraInfo {
    pub device_id: String,
    pub camera_id: String,
}

pub(crate) fn default_page() -> usize {
    1
}

pub(crate) fn default_page_size() -> usize {
    60
}
