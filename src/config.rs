//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `EDGESTREAM_HOSTNAME_OVERRIDE`,
//!    `EDGESTREAM_SERVER`
//! 2. **Config file**: path via `--config <path>`, or `edgestream.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [cloud]
//! tunnel_listen = "0.0.0.0:10004"
//! stream_listen = "0.0.0.0:10003"
//! tls_tunnel_ca_file = "/etc/kubeedge/ca/rootCA.crt"
//! tls_tunnel_cert_file = "/etc/kubeedge/certs/server.crt"
//! tls_tunnel_private_key_file = "/etc/kubeedge/certs/server.key"
//! tls_stream_ca_file = "/etc/kubeedge/ca/streamCA.crt"
//! tls_stream_cert_file = "/etc/kubeedge/certs/stream.crt"
//! tls_stream_private_key_file = "/etc/kubeedge/certs/stream.key"
//! kubelet_port = 10350
//! session_key = "pod"                      # "pod" or "host"
//!
//! [cloud.pod_nodes]
//! "default/nginx-0" = "edge-node-1"
//!
//! [edge]
//! server = "wss://cloudcore.example.com:10004"
//! hostname_override = "edge-node-1"
//! reconnect_delay_secs = 5
//! reconnect_max_delay_secs = 60
//!
//! [[edge.video]]
//! ep = "camera-1"
//! url = "rtsp://10.0.0.20:554/stream1"
//!
//! [logging]
//! level = "info"
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::util::split_host_port;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cloud: CloudConfig,
    #[serde(default)]
    pub edge: EdgeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How the stream server picks the session for a pod-scoped request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKeyMode {
    /// Resolve the node hosting the pod.
    Pod,
    /// Use the hostname of the request's `Host` header.
    Host,
}

/// Cloud side: tunnel server (edge-facing) and stream server (API-server-facing).
#[derive(Debug, Clone, Deserialize)]
pub struct CloudConfig {
    /// Tunnel server bind address (default `0.0.0.0:10004`).
    #[serde(default = "default_tunnel_listen")]
    pub tunnel_listen: String,
    /// Stream server bind address (default `0.0.0.0:10003`).
    #[serde(default = "default_stream_listen")]
    pub stream_listen: String,
    /// Port published into node status. Defaults to the tunnel listen port.
    pub tunnel_port: Option<u16>,
    #[serde(default = "default_tunnel_ca")]
    pub tls_tunnel_ca_file: String,
    #[serde(default = "default_tunnel_cert")]
    pub tls_tunnel_cert_file: String,
    #[serde(default = "default_tunnel_key")]
    pub tls_tunnel_private_key_file: String,
    #[serde(default = "default_stream_ca")]
    pub tls_stream_ca_file: String,
    #[serde(default = "default_stream_cert")]
    pub tls_stream_cert_file: String,
    #[serde(default = "default_stream_key")]
    pub tls_stream_private_key_file: String,
    /// Seconds between node-status publish attempts (default 20).
    #[serde(default = "default_node_status_retry")]
    pub node_status_retry_secs: u64,
    /// Seconds before node-status publishing gives up (default 120).
    #[serde(default = "default_node_status_timeout")]
    pub node_status_timeout_secs: u64,
    /// Largest tunnel frame payload accepted (default 4 MB).
    #[serde(default = "default_max_resp_body_length")]
    pub max_resp_body_length: usize,
    /// Kubelet port the edge serves logs/exec on (default 10350).
    #[serde(default = "default_kubelet_port")]
    pub kubelet_port: u16,
    #[serde(default = "default_session_key")]
    pub session_key: SessionKeyMode,
    /// `namespace/pod` → node, for the static pod resolver.
    #[serde(default)]
    pub pod_nodes: HashMap<String, String>,
    /// Publish the tunnel port into node status on handshake (default true).
    #[serde(default = "default_true")]
    pub node_status_publish: bool,
}

/// One video endpoint served by the edge.
#[derive(Debug, Clone, Deserialize)]
pub struct VideoEndpoint {
    pub ep: String,
    pub url: String,
}

/// Edge side: the tunnel client.
#[derive(Debug, Clone, Deserialize)]
pub struct EdgeConfig {
    /// Tunnel server base URL. Override with `EDGESTREAM_SERVER`.
    #[serde(default = "default_server")]
    pub server: String,
    /// Node name sent in the handshake. Override with `EDGESTREAM_HOSTNAME_OVERRIDE`.
    #[serde(default = "default_hostname_override")]
    pub hostname_override: String,
    /// Node internal IP sent in the handshake. The cloud uses the socket
    /// address when unset.
    pub internal_ip: Option<String>,
    #[serde(default = "default_tunnel_ca")]
    pub tls_ca_file: String,
    #[serde(default = "default_edge_cert")]
    pub tls_cert_file: String,
    #[serde(default = "default_edge_key")]
    pub tls_private_key_file: String,
    /// Initial reconnect backoff (default 5).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Max reconnect backoff (default 60).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
    #[serde(default = "default_max_resp_body_length")]
    pub max_resp_body_length: usize,
    /// Transcoder binary for video streams (default `ffmpeg`).
    #[serde(default = "default_transcoder")]
    pub transcoder: String,
    /// Transcoder arguments; `{url}` is replaced by the RTSP URL.
    #[serde(default = "default_transcoder_args")]
    pub transcoder_args: Vec<String>,
    #[serde(default)]
    pub video: Vec<VideoEndpoint>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_tunnel_listen() -> String {
    "0.0.0.0:10004".to_string()
}
fn default_stream_listen() -> String {
    "0.0.0.0:10003".to_string()
}
fn default_tunnel_ca() -> String {
    "/etc/kubeedge/ca/rootCA.crt".to_string()
}
fn default_tunnel_cert() -> String {
    "/etc/kubeedge/certs/server.crt".to_string()
}
fn default_tunnel_key() -> String {
    "/etc/kubeedge/certs/server.key".to_string()
}
fn default_stream_ca() -> String {
    "/etc/kubeedge/ca/streamCA.crt".to_string()
}
fn default_stream_cert() -> String {
    "/etc/kubeedge/certs/stream.crt".to_string()
}
fn default_stream_key() -> String {
    "/etc/kubeedge/certs/stream.key".to_string()
}
fn default_edge_cert() -> String {
    "/etc/kubeedge/certs/edge.crt".to_string()
}
fn default_edge_key() -> String {
    "/etc/kubeedge/certs/edge.key".to_string()
}
fn default_node_status_retry() -> u64 {
    20
}
fn default_node_status_timeout() -> u64 {
    120
}
fn default_max_resp_body_length() -> usize {
    4 * 1024 * 1024 // 4 MB
}
fn default_kubelet_port() -> u16 {
    10350
}
fn default_session_key() -> SessionKeyMode {
    SessionKeyMode::Pod
}
fn default_true() -> bool {
    true
}
fn default_server() -> String {
    "wss://127.0.0.1:10004".to_string()
}
fn default_hostname_override() -> String {
    "edge-node".to_string()
}
fn default_reconnect_delay() -> u64 {
    5
}
fn default_reconnect_max_delay() -> u64 {
    60
}
fn default_transcoder() -> String {
    "ffmpeg".to_string()
}
fn default_transcoder_args() -> Vec<String> {
    [
        "-rtsp_transport", "tcp", "-i", "{url}", "-f", "mpegts", "-codec:v", "mpeg1video",
        "-r", "30", "-b:v", "800k", "-bf", "0", "-",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            tunnel_listen: default_tunnel_listen(),
            stream_listen: default_stream_listen(),
            tunnel_port: None,
            tls_tunnel_ca_file: default_tunnel_ca(),
            tls_tunnel_cert_file: default_tunnel_cert(),
            tls_tunnel_private_key_file: default_tunnel_key(),
            tls_stream_ca_file: default_stream_ca(),
            tls_stream_cert_file: default_stream_cert(),
            tls_stream_private_key_file: default_stream_key(),
            node_status_retry_secs: default_node_status_retry(),
            node_status_timeout_secs: default_node_status_timeout(),
            max_resp_body_length: default_max_resp_body_length(),
            kubelet_port: default_kubelet_port(),
            session_key: default_session_key(),
            pod_nodes: HashMap::new(),
            node_status_publish: default_true(),
        }
    }
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            hostname_override: default_hostname_override(),
            internal_ip: None,
            tls_ca_file: default_tunnel_ca(),
            tls_cert_file: default_edge_cert(),
            tls_private_key_file: default_edge_key(),
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
            max_resp_body_length: default_max_resp_body_length(),
            transcoder: default_transcoder(),
            transcoder_args: default_transcoder_args(),
            video: Vec::new(),
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

impl CloudConfig {
    /// Port published into node status: `tunnel_port`, else the port of
    /// `tunnel_listen`, else 10004.
    pub fn published_tunnel_port(&self) -> u16 {
        self.tunnel_port
            .or_else(|| split_host_port(&self.tunnel_listen).1)
            .unwrap_or(10004)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `edgestream.toml` in the current directory, falling back to compiled
    /// defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            Self::parse(&content).unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("edgestream.toml").exists() {
            let content =
                std::fs::read_to_string("edgestream.toml").expect("Failed to read edgestream.toml");
            Self::parse(&content).expect("Failed to parse edgestream.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(name) = std::env::var("EDGESTREAM_HOSTNAME_OVERRIDE") {
            config.edge.hostname_override = name;
        }
        if let Ok(server) = std::env::var("EDGESTREAM_SERVER") {
            config.edge.server = server;
        }

        config
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}
