//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `CAMLINK_DEVICE_TOKEN`, `CAMLINK_LISTEN`,
//!    `CAMLINK_DEVICE_ID`, `CAMLINK_PROXY_URL`, `CAMLINK_RECORDINGS_ROOT`
//! 2. **Config file** — path via `--config <path>`, or `camlink.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [proxy]
//! listen = "0.0.0.0:8000"
//! heartbeat_timeout_secs = 30
//! request_deadline_secs = 30
//! chunk_size_bytes = 65536
//! max_page_size = 500
//! cors_origins = ["*"]
//!
//! [auth]
//! device_token = "your-shared-secret"
//!
//! [agent]
//! proxy_url = "ws://proxy.example.com:8000/ws/device"
//! device_id = "pi-0001"
//! camera_ids = ["cam1", "cam2"]
//! recordings_root = "~/recordings"
//! chunk_size_bytes = 65536
//! reconnect_delay_secs = 5
//! reconnect_max_delay_secs = 60
//! heartbeat_interval_secs = 10
//!
//! [logging]
//! level = "info"
//! ```

use serde::Deserialize;
use std::path::Path;

/// Top-level configuration, deserialized from TOML.
///
/// Both peers share the file format: `camlink proxy` reads `[proxy]` +
/// `[auth]`, `camlink agent` reads `[agent]` + `[auth]`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Proxy-side settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Socket address to bind (default `0.0.0.0:8000`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Seconds of tunnel silence before a device session is closed
    /// (default 30).
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Deadline for a single tunnel request in seconds (default 30).
    /// Streaming requests have no total deadline; only the initial text
    /// reply is bounded by this.
    #[serde(default = "default_request_deadline")]
    pub request_deadline_secs: u64,
    /// Expected chunk size in bytes, used to bound per-request stream
    /// buffering (default 64 KiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,
    /// Upper bound for the `page_size` query parameter (default 500).
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
    /// Allowed CORS origins. `["*"]` (the default) allows any origin.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

/// Shared-secret device credential.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared token devices present in their `AUTH` frame. Override with
    /// `CAMLINK_DEVICE_TOKEN`. Defaults to `"change-me"` which triggers a
    /// startup warning.
    #[serde(default = "default_device_token")]
    pub device_token: String,
}

/// Agent-side settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// WebSocket URL of the proxy's device endpoint.
    #[serde(default = "default_proxy_url")]
    pub proxy_url: String,
    /// Stable identifier this agent registers under. Override with
    /// `CAMLINK_DEVICE_ID`.
    #[serde(default = "default_device_id")]
    pub device_id: String,
    /// Cameras served by this agent; each maps to a directory under
    /// `recordings_root`.
    #[serde(default = "default_camera_ids")]
    pub camera_ids: Vec<String>,
    /// Root of the on-disk recording layout
    /// (`<root>/<camera_id>/merged/YYYYMMDD_HH:MM.mp4`). A leading `~` is
    /// expanded at load time.
    #[serde(default = "default_recordings_root")]
    pub recordings_root: String,
    /// Size of binary chunks streamed per frame (default 64 KiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size_bytes: usize,
    /// Initial reconnect backoff in seconds (default 5).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Max reconnect backoff in seconds (default 60).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
    /// Seconds between heartbeat pings (default 10).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}
fn default_heartbeat_timeout() -> u64 {
    30
}
fn default_request_deadline() -> u64 {
    30
}
fn default_chunk_size() -> usize {
    64 * 1024
}
fn default_max_page_size() -> usize {
    500
}
fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}
fn default_device_token() -> String {
    "change-me".to_string()
}
fn default_proxy_url() -> String {
    "ws://127.0.0.1:8000/ws/device".to_string()
}
fn default_device_id() -> String {
    "pi-0000".to_string()
}
fn default_camera_ids() -> Vec<String> {
    vec!["cam1".to_string()]
}
fn default_recordings_root() -> String {
    "~/recordings".to_string()
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_reconnect_max_delay() -> u64 {
    60
}
fn default_heartbeat_interval() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            request_deadline_secs: default_request_deadline(),
            chunk_size_bytes: default_chunk_size(),
            max_page_size: default_max_page_size(),
            cors_origins: default_cors_origins(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            device_token: default_device_token(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            proxy_url: default_proxy_url(),
            device_id: default_device_id(),
            camera_ids: default_camera_ids(),
            recordings_root: default_recordings_root(),
            chunk_size_bytes: default_chunk_size(),
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            auth: AuthConfig::default(),
            agent: AgentConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `camlink.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("camlink.toml").exists() {
            let content =
                std::fs::read_to_string("camlink.toml").expect("Failed to read camlink.toml");
            toml::from_str(&content).expect("Failed to parse camlink.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(token) = std::env::var("CAMLINK_DEVICE_TOKEN") {
            config.auth.device_token = token;
        }
        if let Ok(listen) = std::env::var("CAMLINK_LISTEN") {
            config.proxy.listen = listen;
        }
        if let Ok(id) = std::env::var("CAMLINK_DEVICE_ID") {
            config.agent.device_id = id;
        }
        if let Ok(url) = std::env::var("CAMLINK_PROXY_URL") {
            config.agent.proxy_url = url;
        }
        if let Ok(root) = std::env::var("CAMLINK_RECORDINGS_ROOT") {
            config.agent.recordings_root = root;
        }

        config.agent.recordings_root = expand_tilde(&config.agent.recordings_root);
        config
    }
}

/// Expand a leading `~` or `~/` to `$HOME`.
fn expand_tilde(path: &str) -> String {
    if path == "~" || path.starts_with("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return format!("{}{}", home, &path[1..]);
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.proxy.listen, "0.0.0.0:8000");
        assert_eq!(config.proxy.heartbeat_timeout_secs, 30);
        assert_eq!(config.proxy.chunk_size_bytes, 64 * 1024);
        assert_eq!(config.auth.device_token, "change-me");
        assert_eq!(config.agent.camera_ids, vec!["cam1"]);
        assert_eq!(config.agent.reconnect_delay_secs, 5);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: Config = toml::from_str(
            r#"
            [auth]
            device_token = "s3cret"

            [agent]
            device_id = "pi-a"
            camera_ids = ["cam1", "cam2"]
            "#,
        )
        .unwrap();

        assert_eq!(config.auth.device_token, "s3cret");
        assert_eq!(config.agent.device_id, "pi-a");
        assert_eq!(config.agent.camera_ids.len(), 2);
        // Untouched sections keep compiled defaults
        assert_eq!(config.proxy.listen, "0.0.0.0:8000");
        assert_eq!(config.agent.heartbeat_interval_secs, 10);
    }

    #[test]
    fn proxy_section_overrides() {
        let config: Config = toml::from_str(
            r#"
            [proxy]
            listen = "127.0.0.1:9999"
            max_page_size = 100
            cors_origins = ["http://localhost:5173"]
            "#,
        )
        .unwrap();

        assert_eq!(config.proxy.listen, "127.0.0.1:9999");
        assert_eq!(config.proxy.max_page_size, 100);
        assert_eq!(config.proxy.cors_origins, vec!["http://localhost:5173"]);
    }

    #[test]
    fn tilde_expansion() {
        std::env::set_var("HOME", "/home/pi");
        assert_eq!(expand_tilde("~/recordings"), "/home/pi/recordings");
        assert_eq!(expand_tilde("~"), "/home/pi");
        assert_eq!(expand_tilde("/abs/path"), "/abs/path");
        assert_eq!(expand_tilde("rel/~path"), "rel/~path");
    }
}
