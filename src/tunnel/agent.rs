//! Device agent — outbound tunnel from the device to the proxy.
//!
//! Maintains a persistent WebSocket to the proxy with exponential-backoff
//! reconnect and heartbeat pings, and services proxied requests from the
//! local [`RecordingStore`]: listings as single replies, file reads as a
//! meta reply followed by a binary chunk stream. Each request runs in its
//! own task; all of them share one sink mutex so a request's frame is never
//! interleaved mid-message with another's.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout_at;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::protocol::{
    chunk_eos, encode_chunk, AuthFailPayload, AuthPayload, Envelope, ErrorPayload, MessageKind,
    RegisterPayload,
};
use crate::recordings::{RecordingError, RecordingStore};

/// How many missed heartbeat intervals before the proxy is considered dead.
const SILENCE_FACTOR: u32 = 3;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared write half of the tunnel socket. The mutex is the send mutex:
/// every frame from every request task passes through it whole.
type WsSink = Arc<Mutex<SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>>>;

/// In-flight `READ_FILE` requests, cancellable via `CANCEL {id}`.
type ActiveRequests = Arc<Mutex<HashMap<Uuid, CancellationToken>>>;

#[derive(Clone)]
struct AgentCtx {
    sink: WsSink,
    store: Arc<RecordingStore>,
    active: ActiveRequests,
    chunk_size: usize,
}

/// Run the agent forever: connect, serve, back off, reconnect.
pub async fn run(config: Arc<Config>) {
    let initial = Duration::from_secs(config.agent.reconnect_delay_secs.max(1));
    let max_delay = Duration::from_secs(config.agent.reconnect_max_delay_secs.max(1));
    let mut delay = initial;

    loop {
        info!(url = %config.agent.proxy_url, "connecting to proxy");
        match connect_and_serve(&config).await {
            Ok(()) => {
                info!("tunnel closed cleanly, reconnecting");
                delay = initial;
            }
            Err(e) => {
                warn!(error = %e, retry_secs = delay.as_secs(), "tunnel connection failed");
            }
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(max_delay);
    }
}

/// One connection attempt: handshake, then serve until disconnect.
async fn connect_and_serve(config: &Config) -> Result<(), BoxError> {
    let (socket, _response) =
        tokio_tungstenite::connect_async(config.agent.proxy_url.as_str()).await?;
    let (sink, mut stream) = socket.split();
    let sink: WsSink = Arc::new(Mutex::new(sink));

    // AUTH
    let auth = Envelope::request(
        MessageKind::Auth,
        &AuthPayload {
            token: config.auth.device_token.clone(),
        },
    )?;
    send_envelope(&sink, &auth).await?;
    let reply = expect_envelope(&mut stream).await?;
    match reply.kind {
        MessageKind::AuthOk => info!("authenticated with proxy"),
        MessageKind::AuthFail => {
            let reason = reply
                .payload_as::<AuthFailPayload>()
                .map(|p| p.reason)
                .unwrap_or_default();
            return Err(format!("proxy rejected credentials: {reason}").into());
        }
        other => return Err(format!("expected AUTH_OK, got {other:?}").into()),
    }

    // REGISTER
    let register = Envelope::request(
        MessageKind::Register,
        &RegisterPayload {
            device_id: config.agent.device_id.clone(),
            camera_ids: config.agent.camera_ids.clone(),
        },
    )?;
    send_envelope(&sink, &register).await?;
    info!(
        device = %config.agent.device_id,
        cameras = ?config.agent.camera_ids,
        "registered with proxy"
    );

    let ctx = AgentCtx {
        sink: sink.clone(),
        store: Arc::new(RecordingStore::new(config.agent.recordings_root.clone())),
        active: Arc::new(Mutex::new(HashMap::new())),
        chunk_size: config.agent.chunk_size_bytes.max(1),
    };

    let interval = Duration::from_secs(config.agent.heartbeat_interval_secs.max(1));
    let silence_limit = interval * SILENCE_FACTOR;
    let mut heartbeat = tokio::time::interval(interval);
    let mut last_rx = Instant::now();

    let result = loop {
        tokio::select! {
            msg = stream.next() => {
                let Some(msg) = msg else { break Ok(()) };
                let msg = match msg {
                    Ok(msg) => msg,
                    Err(e) => break Err(e.into()),
                };
                last_rx = Instant::now();
                match msg {
                    Message::Text(text) => match Envelope::decode(text.as_str()) {
                        Ok(env) => dispatch(env, &ctx).await,
                        Err(e) => break Err(format!("undecodable frame from proxy: {e}").into()),
                    },
                    Message::Binary(_) => warn!("unexpected binary frame from proxy"),
                    Message::Close(_) => break Ok(()),
                    Message::Ping(_) | Message::Pong(_) => {}
                    _ => {}
                }
            }
            _ = heartbeat.tick() => {
                if last_rx.elapsed() > silence_limit {
                    break Err("proxy silent past heartbeat limit".into());
                }
                if let Err(e) = send_message(&sink, Message::Ping(Bytes::new())).await {
                    break Err(e);
                }
            }
        }
    };

    // Stop any in-flight streams; their tasks notice between chunks.
    for (_, token) in ctx.active.lock().await.drain() {
        token.cancel();
    }
    result
}

/// Route one incoming request to its handler task.
async fn dispatch(env: Envelope, ctx: &AgentCtx) {
    match env.kind {
        MessageKind::ListVideos => {
            let ctx = ctx.clone();
            tokio::spawn(async move { handle_list_videos(env, &ctx).await });
        }
        MessageKind::ReadFile => {
            let token = CancellationToken::new();
            ctx.active.lock().await.insert(env.id, token.clone());
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let id = env.id;
                handle_read_file(env, &ctx, &token).await;
                ctx.active.lock().await.remove(&id);
            });
        }
        MessageKind::Cancel => {
            if let Some(token) = ctx.active.lock().await.remove(&env.id) {
                debug!(request = %env.id, "request cancelled by proxy");
                token.cancel();
            }
        }
        other => {
            warn!(kind = ?other, request = %env.id, "unknown request kind");
            send_error(
                &ctx.sink,
                env.id,
                ErrorPayload::new("UNKNOWN_REQUEST", format!("unsupported request {other:?}")),
            )
            .await;
        }
    }
}

async fn handle_list_videos(env: Envelope, ctx: &AgentCtx) {
    let query = match env.payload_as() {
        Ok(q) => q,
        Err(e) => {
            send_error(
                &ctx.sink,
                env.id,
                ErrorPayload::new("BAD_REQUEST", format!("malformed LIST_VIDEOS payload: {e}")),
            )
            .await;
            return;
        }
    };

    match ctx.store.list_videos(&query).await {
        Ok(result) => {
            match Envelope::reply(env.id, MessageKind::ListVideosRes, &result) {
                Ok(reply) => {
                    if let Err(e) = send_envelope(&ctx.sink, &reply).await {
                        debug!(error = %e, "failed to send listing reply");
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode listing reply"),
            }
        }
        Err(e) => {
            warn!(camera = %query.camera_id, error = %e, "listing failed");
            send_error(&ctx.sink, env.id, recording_error_payload(&e)).await;
        }
    }
}

/// Service a `READ_FILE`: meta reply, then chunk frames, then end-of-stream.
/// Any error before the first chunk is reported as `ERROR` with no
/// end-of-stream; a cancelled request stops quietly between chunks.
async fn handle_read_file(env: Envelope, ctx: &AgentCtx, token: &CancellationToken) {
    let req = match env.payload_as::<crate::protocol::ReadFilePayload>() {
        Ok(r) => r,
        Err(e) => {
            send_error(
                &ctx.sink,
                env.id,
                ErrorPayload::new("BAD_REQUEST", format!("malformed READ_FILE payload: {e}")),
            )
            .await;
            return;
        }
    };

    let (mut file, meta) = match ctx.store.open_range(&req).await {
        Ok(opened) => opened,
        Err(e) => {
            warn!(
                camera = %req.camera_id,
                filename = %req.filename,
                error = %e,
                "read request failed"
            );
            send_error(&ctx.sink, env.id, recording_error_payload(&e)).await;
            return;
        }
    };

    let reply = match Envelope::reply(env.id, MessageKind::ReadFileRes, &meta) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "failed to encode read reply");
            return;
        }
    };
    if send_envelope(&ctx.sink, &reply).await.is_err() {
        return;
    }

    let mut remaining = meta.length;
    let mut buf = vec![0u8; ctx.chunk_size];
    while remaining > 0 {
        if token.is_cancelled() {
            debug!(request = %env.id, "stream cancelled mid-read");
            return;
        }
        let want = ctx.chunk_size.min(remaining as usize);
        match file.read(&mut buf[..want]).await {
            Ok(0) => {
                warn!(filename = %req.filename, "file truncated under an active stream");
                send_error(
                    &ctx.sink,
                    env.id,
                    ErrorPayload::new("IO_ERROR", "file truncated during read"),
                )
                .await;
                return;
            }
            Ok(n) => {
                if send_message(&ctx.sink, Message::Binary(encode_chunk(env.id, &buf[..n])))
                    .await
                    .is_err()
                {
                    return;
                }
                remaining -= n as u64;
            }
            Err(e) => {
                warn!(filename = %req.filename, error = %e, "read failed mid-stream");
                send_error(&ctx.sink, env.id, ErrorPayload::new("IO_ERROR", e.to_string())).await;
                return;
            }
        }
    }

    if token.is_cancelled() {
        return;
    }
    let _ = send_message(&ctx.sink, Message::Binary(chunk_eos(env.id))).await;
    debug!(
        request = %env.id,
        filename = %req.filename,
        bytes = meta.length,
        "stream complete"
    );
}

fn recording_error_payload(e: &RecordingError) -> ErrorPayload {
    ErrorPayload::new(e.code(), e.to_string())
}

async fn send_error(sink: &WsSink, id: Uuid, payload: ErrorPayload) {
    if let Ok(env) = Envelope::reply(id, MessageKind::Error, &payload) {
        let _ = send_envelope(sink, &env).await;
    }
}

async fn send_envelope(sink: &WsSink, env: &Envelope) -> Result<(), BoxError> {
    let text = env.encode()?;
    sink.lock().await.send(Message::Text(text.into())).await?;
    Ok(())
}

async fn send_message(sink: &WsSink, msg: Message) -> Result<(), BoxError> {
    sink.lock().await.send(msg).await?;
    Ok(())
}

/// Await the proxy's next text envelope during the handshake.
async fn expect_envelope(
    stream: &mut (impl futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
              + Unpin),
) -> Result<Envelope, BoxError> {
    let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
    loop {
        let msg = match timeout_at(deadline, stream.next()).await {
            Ok(Some(msg)) => msg?,
            Ok(None) => return Err("proxy closed the connection during handshake".into()),
            Err(_) => return Err("handshake timed out".into()),
        };
        match msg {
            Message::Text(text) => return Ok(Envelope::decode(text.as_str())?),
            Message::Ping(_) | Message::Pong(_) => {}
            other => return Err(format!("unexpected handshake frame: {other:?}").into()),
        }
    }
}
