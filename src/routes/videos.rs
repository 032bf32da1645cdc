//! Proxied recording listing and range-aware video streaming.
//!
//! The streaming endpoint is the reason this proxy exists: HTML5 `<video>`
//! elements probe `Accept-Ranges` and issue interval fetches while seeking,
//! so every response here must be answerable as an independent ranged read.
//! Each request becomes its own `READ_FILE` tunnel call whose chunk stream
//! is bridged straight into the response body.
//!
//! # Status mapping
//!
//! | HTTP | Condition                                      |
//! |------|------------------------------------------------|
//! | 400  | Bad filename, malformed `Range`, bad query     |
//! | 403  | Agent reported `PERMISSION_DENIED`             |
//! | 404  | Unknown device/camera, agent `FILE_NOT_FOUND`  |
//! | 416  | Multi-range, non-byte units, unsatisfiable     |
//! | 500  | Other agent errors                             |
//! | 502  | Device disconnected while the call was pending |
//! | 503  | Session already closed at dispatch             |
//! | 504  | Request deadline exceeded                      |

use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::Response;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use super::ProxyState;
use crate::protocol::{
    default_page, default_page_size, ListVideosPayload, MessageKind, ReadFilePayload,
};
use crate::tunnel::session::{DeviceSession, SessionError, STREAM_WINDOW_CHUNKS};

type HttpError = (StatusCode, Json<Value>);

/// Query parameters for `GET /devices/{device}/videos`.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// `YYYYMMDD` date filter.
    pub date: Option<String>,
    /// Hour filter, 0–23.
    pub hour: Option<u32>,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

/// `GET /devices/{device}/videos` — proxied listing with filters and
/// pagination. The reply payload is passed through as-is.
pub async fn list_videos(
    State(state): State<ProxyState>,
    Path(device): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, HttpError> {
    if query.page == 0 {
        return Err(bad_request("page must be >= 1"));
    }
    if query.hour.is_some_and(|h| h > 23) {
        return Err(bad_request("hour must be 0-23"));
    }

    let session = resolve(&state, &device).await?;
    let payload = ListVideosPayload {
        camera_id: device,
        date: query.date,
        hour: query.hour,
        page: query.page,
        page_size: query.page_size.min(state.config.proxy.max_page_size).max(1),
    };

    let value = session
        .request(MessageKind::ListVideos, &payload, request_deadline(&state))
        .await
        .map_err(session_error_response)?;
    Ok(Json(value))
}

/// `GET|HEAD /devices/{device}/videos/{filename}` — stream a recording,
/// honoring single-range `Range: bytes=<start>-<end>?` headers.
pub async fn stream_video(
    State(state): State<ProxyState>,
    Path((device, filename)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    if !filename_is_safe(&filename) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid filename", "code": "INVALID_FILENAME"})),
        ));
    }

    let session = resolve(&state, &device).await?;

    let range = match headers.get(header::RANGE) {
        None => None,
        Some(value) => {
            let value = value.to_str().map_err(|_| range_malformed())?;
            Some(parse_range(value).map_err(|e| match e {
                RangeError::Malformed => range_malformed(),
                RangeError::Unsatisfiable => range_unsatisfiable(),
            })?)
        }
    };

    // HEAD only needs the size; probe a single byte instead of the body.
    let head = method == Method::HEAD;
    let (start, end) = match (range, head) {
        (Some((start, end)), false) => (start, end),
        (None, false) => (0, None),
        (Some((start, _)), true) => (start, Some(start)),
        (None, true) => (0, Some(0)),
    };

    let payload = ReadFilePayload {
        camera_id: device,
        filename,
        start,
        end,
    };
    let (meta, chunks) = session
        .read_file(&payload, request_deadline(&state), STREAM_WINDOW_CHUNKS)
        .await
        .map_err(session_error_response)?;

    debug!(
        camera = %payload.camera_id,
        filename = %payload.filename,
        start = meta.start,
        end = meta.end,
        size = meta.size,
        "streaming recording"
    );

    let status = if range.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(header::ACCEPT_RANGES, "bytes");

    if head {
        // The probe stream is dropped here, which cancels it on the wire.
        drop(chunks);
        let (length, content_range) = match range {
            Some(_) if meta.size == 0 => (0, None),
            Some((start, end)) => {
                let last = meta.size - 1;
                let end = end.map_or(last, |e| e.min(last));
                (
                    end.saturating_sub(start) + 1,
                    Some(format!("bytes {start}-{end}/{}", meta.size)),
                )
            }
            None => (meta.size, None),
        };
        builder = builder.header(header::CONTENT_LENGTH, length);
        if let Some(content_range) = content_range {
            builder = builder.header(header::CONTENT_RANGE, content_range);
        }
        return builder.body(Body::empty()).map_err(internal_error);
    }

    builder = builder.header(header::CONTENT_LENGTH, meta.length);
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", meta.start, meta.end, meta.size),
        );
    }

    // Chunks flow straight from the tunnel's bounded channel into the body.
    // Dropping the body (client disconnect) drops the receiver, which the
    // session turns into an on-wire CANCEL. A mid-stream `Err` aborts the
    // connection — there is no in-band error once headers are out.
    builder
        .body(Body::from_stream(ReceiverStream::new(chunks)))
        .map_err(internal_error)
}

async fn resolve(state: &ProxyState, id: &str) -> Result<DeviceSession, HttpError> {
    state.registry.resolve(id).await.ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("no device or camera {id:?} connected"), "code": "DEVICE_NOT_FOUND"})),
        )
    })
}

fn request_deadline(state: &ProxyState) -> Duration {
    Duration::from_secs(state.config.proxy.request_deadline_secs)
}

/// Reject names that could traverse out of the camera's recordings
/// directory. Checked before anything is dispatched on the tunnel.
fn filename_is_safe(filename: &str) -> bool {
    !filename.is_empty()
        && !filename.contains('/')
        && !filename.contains('\\')
        && !filename.contains("..")
        && !filename.contains('\0')
}

#[derive(Debug, PartialEq, Eq)]
enum RangeError {
    /// Syntactically broken — 400.
    Malformed,
    /// Well-formed but unsupported or impossible — 416.
    Unsatisfiable,
}

/// Parse a `Range` header value. Only single-range `bytes=<start>-<end>?`
/// is supported: multi-range and non-byte units are unsatisfiable, the
/// suffix form (`bytes=-N`) and garbage are malformed.
fn parse_range(value: &str) -> Result<(u64, Option<u64>), RangeError> {
    let spec = value.strip_prefix("bytes=").ok_or(RangeError::Unsatisfiable)?;
    if spec.contains(',') {
        return Err(RangeError::Unsatisfiable);
    }
    let (start, end) = spec.split_once('-').ok_or(RangeError::Malformed)?;
    let start: u64 = start.trim().parse().map_err(|_| RangeError::Malformed)?;
    let end = match end.trim() {
        "" => None,
        e => Some(e.parse::<u64>().map_err(|_| RangeError::Malformed)?),
    };
    if end.is_some_and(|e| e < start) {
        return Err(RangeError::Unsatisfiable);
    }
    Ok((start, end))
}

fn bad_request(message: &str) -> HttpError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": message, "code": "BAD_REQUEST"})),
    )
}

fn range_malformed() -> HttpError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": "malformed Range header", "code": "BAD_RANGE"})),
    )
}

fn range_unsatisfiable() -> HttpError {
    (
        StatusCode::RANGE_NOT_SATISFIABLE,
        Json(json!({"error": "unsatisfiable Range header", "code": "RANGE_NOT_SATISFIABLE"})),
    )
}

fn internal_error(e: axum::http::Error) -> HttpError {
    warn!(error = %e, "failed to build response");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal error", "code": "INTERNAL"})),
    )
}

/// Map a tunnel failure onto the HTTP surface.
fn session_error_response(e: SessionError) -> HttpError {
    match e {
        SessionError::Device(payload) => {
            let status = match payload.code.as_str() {
                "FILE_NOT_FOUND" => StatusCode::NOT_FOUND,
                "PERMISSION_DENIED" => StatusCode::FORBIDDEN,
                "INVALID_RANGE" => StatusCode::RANGE_NOT_SATISFIABLE,
                "INVALID_PATH" | "BAD_REQUEST" => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (
                status,
                Json(json!({"error": payload.message, "code": payload.code})),
            )
        }
        SessionError::Deadline => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(json!({"error": "device did not respond in time", "code": "TIMEOUT"})),
        ),
        SessionError::Disconnected => (
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": "device disconnected", "code": "DEVICE_DISCONNECTED"})),
        ),
        SessionError::Closed => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "device session is closed", "code": "DEVICE_UNAVAILABLE"})),
        ),
        SessionError::BadReply | SessionError::Protocol(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "device sent a malformed reply", "code": "BAD_DEVICE_REPLY"})),
        ),
    }
}
