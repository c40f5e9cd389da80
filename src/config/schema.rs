use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// The intercepting listener clients point their proxy settings at.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    #[serde(default = "default_proxy_host")]
    pub host: String,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    /// Headers added to every forwarded response, plain or tunneled.
    #[serde(default)]
    pub response_headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_proxy_host")]
    pub host: String,
    #[serde(default = "default_admin_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Terminate TLS on CONNECT. When false, CONNECT becomes a blind byte tunnel.
    #[serde(default = "default_true")]
    pub intercept: bool,
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub ca_key_path: Option<PathBuf>,
    /// Subject of a freshly generated root. Defaults to the local hostname.
    #[serde(default)]
    pub ca_common_name: Option<String>,
    #[serde(default = "default_ca_validity_days")]
    pub ca_validity_days: u32,
    #[serde(default = "default_leaf_ttl_hours")]
    pub leaf_ttl_hours: u32,
    /// Zero disables the leaf cache.
    #[serde(default)]
    pub leaf_cache_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_ms: u64,
    #[serde(default = "default_tls_handshake_timeout")]
    pub tls_handshake_timeout_ms: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_keepalive")]
    pub keepalive_ms: u64,
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default)]
    pub extra_root_certs: Vec<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,
    #[serde(default)]
    pub sqlite_path: Option<PathBuf>,
    /// Response header carrying the capture id back to the client.
    #[serde(default = "default_id_header")]
    pub id_header: String,
    #[serde(default)]
    pub redact_headers: Vec<String>,
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_proxy_host() -> String {
    "127.0.0.1".to_string()
}

fn default_proxy_port() -> u16 {
    8888
}

fn default_admin_port() -> u16 {
    8889
}

fn default_ca_validity_days() -> u32 {
    5 * 365
}

fn default_leaf_ttl_hours() -> u32 {
    24
}

fn default_dial_timeout() -> u64 {
    30_000
}

fn default_tls_handshake_timeout() -> u64 {
    10_000
}

fn default_idle_timeout() -> u64 {
    30_000
}

fn default_keepalive() -> u64 {
    30_000
}

fn default_max_idle_per_host() -> usize {
    100
}

fn default_backend() -> StoreBackend {
    StoreBackend::Sqlite
}

fn default_id_header() -> String {
    "request_id".to_string()
}

fn default_retention_days() -> u32 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_proxy_host(),
            port: default_proxy_port(),
            response_headers: HashMap::new(),
        }
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_proxy_host(),
            port: default_admin_port(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            intercept: true,
            ca_cert_path: None,
            ca_key_path: None,
            ca_common_name: None,
            ca_validity_days: default_ca_validity_days(),
            leaf_ttl_hours: default_leaf_ttl_hours(),
            leaf_cache_ttl_seconds: 0,
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            dial_timeout_ms: default_dial_timeout(),
            tls_handshake_timeout_ms: default_tls_handshake_timeout(),
            idle_timeout_ms: default_idle_timeout(),
            keepalive_ms: default_keepalive(),
            max_idle_per_host: default_max_idle_per_host(),
            accept_invalid_certs: false,
            extra_root_certs: Vec::new(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: default_backend(),
            sqlite_path: None,
            id_header: default_id_header(),
            redact_headers: Vec::new(),
            retention_days: default_retention_days(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: None,
        }
    }
}

impl ProxyConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl AdminConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl TlsConfig {
    pub fn leaf_ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.leaf_ttl_hours) * 3600)
    }

    pub fn ca_validity(&self) -> Duration {
        Duration::from_secs(u64::from(self.ca_validity_days) * 86_400)
    }

    pub fn leaf_cache_ttl(&self) -> Option<Duration> {
        (self.leaf_cache_ttl_seconds > 0).then(|| Duration::from_secs(self.leaf_cache_ttl_seconds))
    }
}

impl UpstreamConfig {
    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn tls_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.tls_handshake_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_ms)
    }
}

/// Parses `host:port` pairs, accepting `localhost` as a loopback alias.
pub fn parse_socket_addr(host: &str, port: u16) -> Option<SocketAddr> {
    let host = if host == "localhost" { "127.0.0.1" } else { host };
    format!("{host}:{port}").parse().ok().or_else(|| {
        host.parse::<std::net::IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, port))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.proxy.port, 8888);
        assert_eq!(config.admin.port, 8889);
        assert!(config.tls.intercept);
        assert_eq!(config.tls.leaf_ttl(), Duration::from_secs(24 * 3600));
        assert_eq!(config.tls.leaf_cache_ttl(), None);
        assert_eq!(config.upstream.dial_timeout(), Duration::from_secs(30));
        assert_eq!(config.upstream.tls_handshake_timeout(), Duration::from_secs(10));
        assert_eq!(config.capture.backend, StoreBackend::Sqlite);
        assert_eq!(config.capture.id_header, "request_id");
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
proxy:
  port: 9000
  response_headers:
    x-intercepted: "yes"
tls:
  intercept: false
  leaf_cache_ttl_seconds: 60
capture:
  backend: memory
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.proxy.port, 9000);
        assert_eq!(config.proxy.host, "127.0.0.1");
        assert_eq!(
            config.proxy.response_headers.get("x-intercepted").map(String::as_str),
            Some("yes")
        );
        assert!(!config.tls.intercept);
        assert_eq!(config.tls.leaf_cache_ttl(), Some(Duration::from_secs(60)));
        assert_eq!(config.capture.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_parse_socket_addr() {
        assert_eq!(
            parse_socket_addr("localhost", 80),
            Some("127.0.0.1:80".parse().unwrap())
        );
        assert_eq!(parse_socket_addr("::1", 443), Some("[::1]:443".parse().unwrap()));
        assert_eq!(parse_socket_addr("not a host", 80), None);
    }
}
