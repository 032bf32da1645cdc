//! Device WebSocket gateway: accept, authenticate, register, pump frames.
//!
//! `GET /ws/device` upgrades to the tunnel. The handshake is two envelopes:
//! `AUTH {token}` (answered with `AUTH_OK` / `AUTH_FAIL`) then
//! `REGISTER {device_id, camera_ids}`. After registration the socket is
//! driven by two loops: a sender task draining the session's outbound queue,
//! and the reader loop feeding inbound frames into the session demux. Either
//! a transport error, a protocol violation, or a session close (supersession,
//! heartbeat sweep, shutdown) ends both.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::time::timeout_at;
use tracing::{debug, info, warn};

use crate::auth::constant_time_eq;
use crate::protocol::{AuthFailPayload, AuthPayload, Envelope, MessageKind, RegisterPayload};
use crate::routes::ProxyState;
use crate::tunnel::session::{CloseReason, DeviceSession};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// `GET /ws/device` — device tunnel endpoint.
pub async fn device_ws(State(state): State<ProxyState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_device_socket(socket, state))
}

async fn handle_device_socket(socket: WebSocket, state: ProxyState) {
    let (mut sink, mut stream) = socket.split();

    let registration = match handshake(&mut sink, &mut stream, &state).await {
        Some(reg) => reg,
        None => return,
    };

    let (session, mut outbound_rx) =
        DeviceSession::new(registration.device_id, registration.camera_ids);
    state.registry.register(session.clone()).await;
    info!(
        device = %session.device_id(),
        cameras = ?session.camera_ids(),
        "device tunnel established"
    );

    // Single writer: everything the proxy sends goes through this task.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let closed = session.closed_token();
    loop {
        tokio::select! {
            () = closed.cancelled() => break,
            msg = stream.next() => {
                let Some(Ok(msg)) = msg else {
                    session.close(CloseReason::TransportError).await;
                    break;
                };
                session.touch();
                match msg {
                    Message::Text(text) => {
                        if let Err(e) = session.handle_text(text.as_str()).await {
                            warn!(device = %session.device_id(), error = %e, "protocol violation on tunnel");
                            session.close(CloseReason::DecodeError).await;
                            break;
                        }
                    }
                    Message::Binary(data) => {
                        if let Err(e) = session.handle_chunk(&data).await {
                            warn!(device = %session.device_id(), error = %e, "protocol violation on tunnel");
                            session.close(CloseReason::DecodeError).await;
                            break;
                        }
                    }
                    Message::Ping(data) => {
                        let _ = session.send_message(Message::Pong(data)).await;
                    }
                    Message::Pong(_) => {}
                    Message::Close(_) => {
                        session.close(CloseReason::TransportError).await;
                        break;
                    }
                }
            }
        }
    }

    // No-op when the session was already closed with its real reason.
    session.close(CloseReason::TransportError).await;
    state.registry.deregister(&session).await;
    send_task.abort();
    info!(
        device = %session.device_id(),
        reason = %session.close_reason().unwrap_or(CloseReason::TransportError),
        "device tunnel closed"
    );
}

/// Run the AUTH + REGISTER handshake. Returns `None` (after logging and
/// answering as appropriate) when the connection must not proceed.
async fn handshake(
    sink: &mut SplitSink<WebSocket, Message>,
    stream: &mut SplitStream<WebSocket>,
    state: &ProxyState,
) -> Option<RegisterPayload> {
    let auth = next_envelope(stream).await?;
    if auth.kind != MessageKind::Auth {
        warn!(kind = ?auth.kind, "device sent a non-AUTH frame first, dropping");
        return None;
    }
    let Ok(payload) = auth.payload_as::<AuthPayload>() else {
        warn!("device sent malformed AUTH payload, dropping");
        return None;
    };

    if !constant_time_eq(
        state.config.auth.device_token.as_bytes(),
        payload.token.as_bytes(),
    ) {
        warn!("device failed authentication");
        let fail = Envelope::reply(
            auth.id,
            MessageKind::AuthFail,
            &AuthFailPayload {
                reason: "invalid token".to_string(),
            },
        );
        if let Ok(fail) = fail {
            if let Ok(text) = fail.encode() {
                let _ = sink.send(Message::Text(text.into())).await;
            }
        }
        let _ = sink.close().await;
        return None;
    }

    let ok = Envelope::reply(auth.id, MessageKind::AuthOk, &serde_json::json!({})).ok()?;
    let text = ok.encode().ok()?;
    if sink.send(Message::Text(text.into())).await.is_err() {
        return None;
    }
    debug!("device authenticated");

    let register = next_envelope(stream).await?;
    if register.kind != MessageKind::Register {
        warn!(kind = ?register.kind, "device skipped REGISTER, dropping");
        return None;
    }
    match register.payload_as::<RegisterPayload>() {
        Ok(reg) if !reg.device_id.is_empty() => Some(reg),
        Ok(_) => {
            warn!("device registered with empty device_id, dropping");
            None
        }
        Err(_) => {
            warn!("device sent malformed REGISTER payload, dropping");
            None
        }
    }
}

/// Read the next text envelope during the handshake, skipping control
/// frames, with a hard timeout.
async fn next_envelope(stream: &mut SplitStream<WebSocket>) -> Option<Envelope> {
    let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
    loop {
        let msg = match timeout_at(deadline, stream.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(_) => {
                debug!("device disconnected during handshake");
                return None;
            }
            Err(_) => {
                warn!("handshake timed out");
                return None;
            }
        };
        match msg {
            Message::Text(text) => match Envelope::decode(text.as_str()) {
                Ok(env) => return Some(env),
                Err(e) => {
                    warn!(error = %e, "undecodable handshake frame");
                    return None;
                }
            },
            Message::Ping(_) | Message::Pong(_) => {}
            _ => {
                warn!("unexpected non-text frame during handshake");
                return None;
            }
        }
    }
}
