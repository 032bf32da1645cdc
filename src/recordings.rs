//! Agent-side recording store.
//!
//! Recordings live under `<root>/<camera_id>/merged/YYYYMMDD_HH:MM.mp4`;
//! the timestamp is parsed from the filename. This module does the listing
//! (with date/hour filters and pagination) and opens validated byte ranges
//! for the streaming path. Containers are opaque — nothing here parses mp4.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use chrono::{NaiveDateTime, Timelike};
use tokio::fs::File;
use tokio::io::AsyncSeekExt;
use tracing::{debug, warn};

use crate::protocol::{ListVideosPayload, ListVideosResult, ReadFileMeta, ReadFilePayload, VideoEntry};

/// Filename timestamp format: `20231123_14:30.mp4`.
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H:%M";

/// Errors from the recording store, mapped to tunnel `ERROR` codes via
/// [`RecordingError::code`] and to HTTP statuses on the proxy side.
#[derive(Debug, thiserror::Error)]
pub enum RecordingError {
    #[error("file not found")]
    NotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("invalid name {0:?}")]
    InvalidName(String),
    #[error("invalid range {start}-{end:?} for file of {size} bytes")]
    InvalidRange {
        start: u64,
        end: Option<u64>,
        size: u64,
    },
    #[error("i/o error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for RecordingError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => RecordingError::NotFound,
            std::io::ErrorKind::PermissionDenied => RecordingError::PermissionDenied,
            _ => RecordingError::Io(e),
        }
    }
}

impl RecordingError {
    /// Stable error code carried in tunnel `ERROR` payloads.
    pub fn code(&self) -> &'static str {
        match self {
            RecordingError::NotFound => "FILE_NOT_FOUND",
            RecordingError::PermissionDenied => "PERMISSION_DENIED",
            RecordingError::InvalidName(_) => "INVALID_PATH",
            RecordingError::InvalidRange { .. } => "INVALID_RANGE",
            RecordingError::Io(_) => "IO_ERROR",
        }
    }
}

/// Filesystem provider for one agent's recordings root.
#[derive(Debug, Clone)]
pub struct RecordingStore {
    root: PathBuf,
}

impl RecordingStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a camera's `merged/` directory, rejecting traversal in the
    /// camera id itself.
    fn camera_dir(&self, camera: &str) -> Result<PathBuf, RecordingError> {
        validate_component(camera)?;
        Ok(self.root.join(camera).join("merged"))
    }

    /// Resolve a video file path with path-traversal rejection on both
    /// components.
    pub fn video_path(&self, camera: &str, filename: &str) -> Result<PathBuf, RecordingError> {
        validate_component(filename)?;
        Ok(self.camera_dir(camera)?.join(filename))
    }

    /// List a camera's recordings with optional date/hour filters, sorted
    /// newest-first, paginated.
    ///
    /// A missing camera directory yields an empty listing rather than an
    /// error, matching how an agent with a freshly provisioned camera looks.
    pub async fn list_videos(
        &self,
        query: &ListVideosPayload,
    ) -> Result<ListVideosResult, RecordingError> {
        let dir = self.camera_dir(&query.camera_id)?;
        let page = query.page.max(1);
        let page_size = query.page_size.max(1);

        let mut read_dir = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(camera = %query.camera_id, dir = %dir.display(), "camera directory does not exist");
                return Ok(ListVideosResult {
                    videos: Vec::new(),
                    total: 0,
                    page,
                    page_size,
                    total_pages: 0,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let mut videos: Vec<VideoEntry> = Vec::new();
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "mp4") {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let filename = entry.file_name().to_string_lossy().into_owned();

            let timestamp = match parse_timestamp(&filename) {
                Some(ts) => {
                    if let Some(ref date) = query.date {
                        if ts.format("%Y%m%d").to_string() != *date {
                            continue;
                        }
                    }
                    if let Some(hour) = query.hour {
                        if ts.hour() != hour {
                            continue;
                        }
                    }
                    ts.format("%Y-%m-%dT%H:%M:%S").to_string()
                }
                None => {
                    // Unparseable names fall back to mtime, but can't satisfy
                    // a date/hour filter.
                    if query.date.is_some() || query.hour.is_some() {
                        continue;
                    }
                    debug!(filename = %filename, "filename timestamp did not parse, using mtime");
                    match meta.modified() {
                        Ok(mtime) => chrono::DateTime::<chrono::Utc>::from(mtime)
                            .naive_utc()
                            .format("%Y-%m-%dT%H:%M:%S")
                            .to_string(),
                        Err(_) => continue,
                    }
                }
            };

            videos.push(VideoEntry {
                filename,
                size: meta.len(),
                timestamp,
                camera: query.camera_id.clone(),
            });
        }

        // Newest first. The fixed-width ISO format makes the string order
        // chronological.
        videos.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let total = videos.len();
        let total_pages = total.div_ceil(page_size);
        let videos: Vec<VideoEntry> = videos
            .into_iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .collect();

        debug!(
            camera = %query.camera_id,
            total,
            page,
            returned = videos.len(),
            "listed recordings"
        );

        Ok(ListVideosResult {
            videos,
            total,
            page,
            page_size,
            total_pages,
        })
    }

    /// Open a recording and seek to the requested range.
    ///
    /// `end` past EOF is clamped; `start` past EOF (or an inverted range) is
    /// an error. Returns the open file positioned at `start` together with
    /// the resolved [`ReadFileMeta`].
    pub async fn open_range(
        &self,
        req: &ReadFilePayload,
    ) -> Result<(File, ReadFileMeta), RecordingError> {
        let path = self.video_path(&req.camera_id, &req.filename)?;
        let mut file = File::open(&path).await?;
        let size = file.metadata().await?.len();

        if size == 0 {
            if req.start > 0 {
                return Err(RecordingError::InvalidRange {
                    start: req.start,
                    end: req.end,
                    size,
                });
            }
            return Ok((
                file,
                ReadFileMeta {
                    size: 0,
                    start: 0,
                    end: 0,
                    length: 0,
                },
            ));
        }

        let start = req.start;
        let end = req.end.map_or(size - 1, |e| e.min(size - 1));
        if start >= size || end < start {
            return Err(RecordingError::InvalidRange {
                start,
                end: req.end,
                size,
            });
        }

        file.seek(SeekFrom::Start(start)).await?;
        Ok((
            file,
            ReadFileMeta {
                size,
                start,
                end,
                length: end - start + 1,
            },
        ))
    }
}

/// Reject path components that could escape the recordings root: empty
/// names, separators, `..`, and NUL.
fn validate_component(name: &str) -> Result<(), RecordingError> {
    if name.is_empty()
        || name == "."
        || name.contains("..")
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(RecordingError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Parse `YYYYMMDD_HH:MM` from a recording filename (extension stripped).
fn parse_timestamp(filename: &str) -> Option<NaiveDateTime> {
    let stem = Path::new(filename).file_stem()?.to_str()?;
    NaiveDateTime::parse_from_str(stem, TIMESTAMP_FORMAT).ok()
}
