//! Proxy-side tunnel session: request correlation and stream demultiplexing.
//!
//! One [`DeviceSession`] owns the state for a single device tunnel: the
//! pending-request table, the outbound frame queue (drained by a single
//! sender task, which serialises all writes), the liveness clock, and the
//! close state. The gateway's reader loop feeds inbound frames into
//! [`DeviceSession::handle_text`] / [`DeviceSession::handle_chunk`], which
//! route them onto per-request completion channels:
//!
//! - non-streaming requests complete through a oneshot;
//! - `READ_FILE` is dual-mode: a oneshot for the initial `READ_FILE_RES`
//!   (or `ERROR`) text reply, plus a bounded byte channel for the binary
//!   chunk stream that follows.
//!
//! The bounded chunk channel is the backpressure knob: when an HTTP client
//! reads slowly the reader's `send().await` suspends, which stops the
//! session's socket reads and throttles the device through the transport.
//! If the HTTP client disappears the send fails instead, and the session
//! cancels the request on the wire (`CANCEL {id}`).

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::Message;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{
    decode_chunk, Envelope, ErrorPayload, MessageKind, ProtocolError, ReadFileMeta,
    ReadFilePayload,
};

/// Per-request chunk buffering, in chunks. Bounds proxy memory per stream at
/// roughly `STREAM_WINDOW_CHUNKS * chunk_size_bytes`.
pub const STREAM_WINDOW_CHUNKS: usize = 8;

/// Outbound frame queue depth per session.
const OUTBOUND_QUEUE: usize = 64;

/// Why a session reached CLOSED.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    AuthFailed,
    Superseded,
    HeartbeatTimeout,
    DecodeError,
    TransportError,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::AuthFailed => "auth-failed",
            CloseReason::Superseded => "superseded",
            CloseReason::HeartbeatTimeout => "heartbeat-timeout",
            CloseReason::DecodeError => "decode-error",
            CloseReason::TransportError => "transport-error",
            CloseReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Failures surfaced to the HTTP dispatch layer.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("device disconnected")]
    Disconnected,
    #[error("request deadline exceeded")]
    Deadline,
    #[error("session closed")]
    Closed,
    #[error("device error {}: {}", .0.code, .0.message)]
    Device(ErrorPayload),
    #[error("malformed device reply")]
    BadReply,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// One delivery on a request's chunk stream.
pub type ChunkResult = Result<Bytes, SessionError>;

/// Proxy-side view of one outstanding call.
struct Pending {
    reply: Option<oneshot::Sender<Envelope>>,
    chunks: Option<mpsc::Sender<ChunkResult>>,
}

struct Shared {
    device_id: String,
    camera_ids: Vec<String>,
    outbound: mpsc::Sender<Message>,
    pending: Mutex<HashMap<Uuid, Pending>>,
    last_frame: std::sync::Mutex<Instant>,
    closed: AtomicBool,
    close_reason: std::sync::Mutex<Option<CloseReason>>,
    cancel: CancellationToken,
    connected_since: Instant,
}

/// Handle to a live device tunnel. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct DeviceSession {
    shared: Arc<Shared>,
}

impl DeviceSession {
    /// Create a session and the outbound frame receiver the gateway's
    /// sender task drains. All writes to the socket go through that single
    /// receiver, which is what serialises them.
    pub fn new(device_id: String, camera_ids: Vec<String>) -> (Self, mpsc::Receiver<Message>) {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let session = Self {
            shared: Arc::new(Shared {
                device_id,
                camera_ids,
                outbound,
                pending: Mutex::new(HashMap::new()),
                last_frame: std::sync::Mutex::new(Instant::now()),
                closed: AtomicBool::new(false),
                close_reason: std::sync::Mutex::new(None),
                cancel: CancellationToken::new(),
                connected_since: Instant::now(),
            }),
        };
        (session, outbound_rx)
    }

    pub fn device_id(&self) -> &str {
        &self.shared.device_id
    }

    pub fn camera_ids(&self) -> &[String] {
        &self.shared.camera_ids
    }

    pub fn has_camera(&self, camera_id: &str) -> bool {
        self.shared.camera_ids.iter().any(|c| c == camera_id)
    }

    /// Identity comparison, for stale-deregistration protection.
    pub fn same_session(&self, other: &DeviceSession) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Token cancelled when the session closes; the gateway loops select on
    /// it.
    pub fn closed_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.shared.close_reason.lock().expect("close_reason lock")
    }

    pub fn connected_since(&self) -> Instant {
        self.shared.connected_since
    }

    /// Record frame arrival for the liveness check. Any inbound frame
    /// (including Ping/Pong) counts.
    pub fn touch(&self) {
        *self.shared.last_frame.lock().expect("last_frame lock") = Instant::now();
    }

    /// How long the tunnel has been silent.
    pub fn idle_for(&self) -> Duration {
        self.shared
            .last_frame
            .lock()
            .expect("last_frame lock")
            .elapsed()
    }

    /// Queue a raw frame for the sender task (Pong replies and the like).
    pub(crate) async fn send_message(&self, msg: Message) -> Result<(), SessionError> {
        self.shared
            .outbound
            .send(msg)
            .await
            .map_err(|_| SessionError::Closed)
    }

    async fn dispatch(&self, env: &Envelope) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let text = env.encode()?;
        self.send_message(Message::Text(text.into())).await
    }

    /// Send a non-streaming request and await its single reply payload.
    pub async fn request(
        &self,
        kind: MessageKind,
        payload: &impl Serialize,
        deadline: Duration,
    ) -> Result<Value, SessionError> {
        let env = Envelope::request(kind, payload)?;
        let id = env.id;
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(
            id,
            Pending {
                reply: Some(tx),
                chunks: None,
            },
        );

        if let Err(e) = self.dispatch(&env).await {
            self.shared.pending.lock().await.remove(&id);
            return Err(e);
        }

        match timeout(deadline, rx).await {
            Ok(Ok(reply)) => match reply.kind {
                MessageKind::Error => Err(SessionError::Device(error_payload(&reply))),
                _ => Ok(reply.payload),
            },
            // Sender dropped: the session drained its pending table.
            Ok(Err(_)) => Err(SessionError::Disconnected),
            Err(_) => {
                self.shared.pending.lock().await.remove(&id);
                Err(SessionError::Deadline)
            }
        }
    }

    /// Send a `READ_FILE` request. Resolves once the agent's initial text
    /// reply arrives: `READ_FILE_RES` yields the meta plus the chunk
    /// receiver; `ERROR` fails. The deadline bounds only the initial reply —
    /// the stream itself is bounded by session liveness.
    pub async fn read_file(
        &self,
        payload: &ReadFilePayload,
        deadline: Duration,
        window: usize,
    ) -> Result<(ReadFileMeta, mpsc::Receiver<ChunkResult>), SessionError> {
        let env = Envelope::request(MessageKind::ReadFile, payload)?;
        let id = env.id;
        let (tx, rx) = oneshot::channel();
        let (chunk_tx, chunk_rx) = mpsc::channel(window.max(1));
        self.shared.pending.lock().await.insert(
            id,
            Pending {
                reply: Some(tx),
                chunks: Some(chunk_tx),
            },
        );

        if let Err(e) = self.dispatch(&env).await {
            self.shared.pending.lock().await.remove(&id);
            return Err(e);
        }

        let meta_env = match timeout(deadline, rx).await {
            Ok(Ok(env)) => env,
            Ok(Err(_)) => return Err(SessionError::Disconnected),
            Err(_) => {
                // The device may be mid-read; tell it to stop.
                self.cancel_request(id).await;
                return Err(SessionError::Deadline);
            }
        };

        match meta_env.kind {
            // handle_text already removed the pending entry on ERROR.
            MessageKind::Error => Err(SessionError::Device(error_payload(&meta_env))),
            MessageKind::ReadFileRes => match meta_env.payload_as::<ReadFileMeta>() {
                Ok(meta) => Ok((meta, chunk_rx)),
                Err(_) => {
                    self.cancel_request(id).await;
                    Err(SessionError::BadReply)
                }
            },
            _ => {
                self.cancel_request(id).await;
                Err(SessionError::BadReply)
            }
        }
    }

    /// Drop a pending request and tell the agent to stop producing for it.
    pub async fn cancel_request(&self, id: Uuid) {
        let removed = self.shared.pending.lock().await.remove(&id).is_some();
        if removed {
            debug!(device = %self.shared.device_id, request = %id, "cancelling request");
            if let Ok(env) = Envelope::reply(id, MessageKind::Cancel, &serde_json::json!({})) {
                let _ = self.dispatch(&env).await;
            }
        }
    }

    /// Demultiplex one inbound text frame. A decode failure or a frame kind
    /// the device has no business sending is returned as an error, which the
    /// gateway treats as fatal (close with *decode-error*).
    pub async fn handle_text(&self, text: &str) -> Result<(), ProtocolError> {
        let env = Envelope::decode(text)?;
        if !env.kind.is_reply() {
            return Err(ProtocolError::UnexpectedKind(env.kind));
        }

        let mut pending = self.shared.pending.lock().await;
        match env.kind {
            MessageKind::ReadFileRes => {
                let streaming = pending.get(&env.id).map(|entry| entry.chunks.is_some());
                match streaming {
                    None => {
                        drop(pending);
                        warn!(device = %self.shared.device_id, request = %env.id, "reply for unknown request, discarding");
                    }
                    Some(true) => {
                        let tx = pending.get_mut(&env.id).and_then(|entry| entry.reply.take());
                        drop(pending);
                        match tx {
                            Some(tx) => {
                                let _ = tx.send(env);
                            }
                            None => {
                                warn!(device = %self.shared.device_id, request = %env.id, "duplicate READ_FILE_RES, discarding");
                            }
                        }
                    }
                    Some(false) => {
                        // Meta for a request that never asked to stream:
                        // treat as its final reply.
                        let entry = pending.remove(&env.id);
                        drop(pending);
                        if let Some(Pending {
                            reply: Some(tx), ..
                        }) = entry
                        {
                            let _ = tx.send(env);
                        }
                    }
                }
            }
            // LIST_VIDEOS_RES and ERROR are terminal for the entry.
            _ => {
                let entry = pending.remove(&env.id);
                drop(pending);
                match entry {
                    None => {
                        warn!(device = %self.shared.device_id, request = %env.id, "reply for unknown request, discarding");
                    }
                    Some(mut entry) => {
                        if let Some(tx) = entry.reply.take() {
                            let _ = tx.send(env);
                        } else if env.kind == MessageKind::Error {
                            // Mid-stream error: the meta was already
                            // delivered, fail the byte stream instead.
                            if let Some(chunks) = entry.chunks.take() {
                                let _ = chunks
                                    .send(Err(SessionError::Device(error_payload(&env))))
                                    .await;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Demultiplex one inbound binary frame onto its request's chunk
    /// channel. Frames for unknown or non-streaming requests are discarded
    /// with a warning — never routed elsewhere.
    pub async fn handle_chunk(&self, frame: &[u8]) -> Result<(), ProtocolError> {
        let (id, data) = decode_chunk(frame)?;

        if data.is_empty() {
            // End-of-stream: removing the entry drops the sender, which
            // closes the channel cleanly.
            match self.shared.pending.lock().await.remove(&id) {
                None => debug!(device = %self.shared.device_id, request = %id, "end-of-stream for unknown request"),
                Some(entry) if entry.chunks.is_none() => {
                    warn!(device = %self.shared.device_id, request = %id, "end-of-stream for non-streaming request");
                }
                Some(_) => {}
            }
            return Ok(());
        }

        let sender = {
            let pending = self.shared.pending.lock().await;
            match pending.get(&id) {
                None => {
                    warn!(device = %self.shared.device_id, request = %id, len = data.len(), "binary frame for unknown request, discarding");
                    return Ok(());
                }
                Some(entry) => match &entry.chunks {
                    None => {
                        warn!(device = %self.shared.device_id, request = %id, "binary frame for non-streaming request, discarding");
                        return Ok(());
                    }
                    Some(tx) => tx.clone(),
                },
            }
        };

        // Bounded send: suspends when the HTTP client is slow. A closed
        // receiver means the client went away — cancel on the wire.
        if sender.send(Ok(data)).await.is_err() {
            self.cancel_request(id).await;
        }
        Ok(())
    }

    /// Transition to CLOSED. One-shot: the first reason wins. Atomically
    /// fails every pending request with *disconnected* and stops the
    /// gateway loops.
    pub async fn close(&self, reason: CloseReason) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.shared.close_reason.lock().expect("close_reason lock") = Some(reason);

        let drained: Vec<Pending> = {
            let mut pending = self.shared.pending.lock().await;
            pending.drain().map(|(_, p)| p).collect()
        };
        let count = drained.len();
        for mut entry in drained {
            // Dropping the reply sender fails the dispatcher's await with
            // *disconnected*.
            drop(entry.reply.take());
            if let Some(chunks) = entry.chunks.take() {
                // Bounded send, like handle_chunk: the consumer either
                // drains its backlog and observes the terminal error, or has
                // dropped the receiver and this returns immediately.
                let _ = chunks.send(Err(SessionError::Disconnected)).await;
            }
        }
        if count > 0 {
            info!(
                device = %self.shared.device_id,
                count,
                reason = %reason,
                "failed pending requests on session close"
            );
        }
        self.shared.cancel.cancel();
    }

    #[cfg(test)]
    pub(crate) async fn pending_len(&self) -> usize {
        self.shared.pending.lock().await.len()
    }
}

fn error_payload(env: &Envelope) -> ErrorPayload {
    env.payload_as().unwrap_or_else(|_| {
        ErrorPayload::new("DEVICE_ERROR", "device sent a malformed error payload")
    })
}
