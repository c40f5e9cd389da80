use crate::capture::{BurstReplay, MemoryRequestStore, RequestCapture, RequestStore, SqliteRequestStore};
use crate::config::{local_hostname, Config, StoreBackend};
use crate::error::{ConfigError, Result};
use crate::forward::{build_outbound_client, HeaderInjector, MetricsHook, Pipeline, StatusRecorder};
use crate::tls::{upstream, CaPaths, CaSettings, CertificateAuthority};
use crate::tunnel::{ConnectTunnel, TlsUpstreamConnector, UpstreamConnector};
use http::HeaderName;
use rustls::ClientConfig;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

pub mod metrics;

pub use metrics::Metrics;

/// Everything the proxy needs, built once at startup and passed down
/// explicitly.
pub struct AppState {
    pub config: Arc<Config>,
    /// Subject used when a root had to be generated.
    pub hostname: String,
    pub ca: Arc<CertificateAuthority>,
    pub client: reqwest::Client,
    pub upstream_tls: Arc<ClientConfig>,
    pub store: Option<Arc<dyn RequestStore>>,
    pub metrics: Arc<Metrics>,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    /// Loads or creates the CA, builds the outbound clients and opens the
    /// request store. Any failure here is fatal.
    pub async fn initialize(config: Config) -> Result<(Arc<Self>, broadcast::Receiver<()>)> {
        let hostname = config
            .tls
            .ca_common_name
            .clone()
            .unwrap_or_else(local_hostname);

        let ca = load_authority(&config, &hostname)?;
        info!(
            common_name = %ca.common_name(),
            not_after = %ca.not_after(),
            "Certificate authority ready"
        );

        let upstream_tls = upstream::client_config(&config.upstream)?;
        let client = build_outbound_client(&config.upstream)?;
        let store = open_store(&config)?;

        Ok(Self::assemble(
            config,
            hostname,
            Arc::new(ca),
            client,
            upstream_tls,
            store,
        ))
    }

    /// Builds the context from parts that already exist.
    pub fn assemble(
        config: Config,
        hostname: String,
        ca: Arc<CertificateAuthority>,
        client: reqwest::Client,
        upstream_tls: Arc<ClientConfig>,
        store: Option<Arc<dyn RequestStore>>,
    ) -> (Arc<Self>, broadcast::Receiver<()>) {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(16);

        let state = Arc::new(Self {
            config: Arc::new(config),
            hostname,
            ca,
            client,
            upstream_tls,
            store,
            metrics: Arc::new(Metrics::new()),
            shutdown_tx,
        });

        (state, shutdown_rx)
    }

    /// Capture and hooks shared by plain and tunneled traffic.
    pub fn pipeline(&self) -> Result<Pipeline> {
        let mut pipeline = Pipeline::new()
            .with_hook(Arc::new(StatusRecorder))
            .with_hook(Arc::new(MetricsHook::new(self.metrics.clone())));

        let injector = HeaderInjector::new(&self.config.proxy.response_headers);
        if !injector.is_empty() {
            pipeline = pipeline.with_hook(Arc::new(injector));
        }

        if let Some(store) = &self.store {
            let id_header = HeaderName::from_bytes(self.config.capture.id_header.as_bytes())
                .map_err(|e| ConfigError::Validation(format!("capture.id_header: {e}")))?;
            let capture = RequestCapture::new(store.clone(), id_header, self.metrics.clone())
                .with_redacted_headers(&self.config.capture.redact_headers);
            pipeline = pipeline.with_capture(Arc::new(capture));
        }

        Ok(pipeline)
    }

    pub fn replay(&self) -> BurstReplay {
        BurstReplay::new(self.store.clone(), self.client.clone(), self.metrics.clone())
    }

    pub fn upstream_connector(&self) -> Arc<dyn UpstreamConnector> {
        Arc::new(TlsUpstreamConnector::new(
            self.upstream_tls.clone(),
            self.config.upstream.dial_timeout(),
            self.config.upstream.tls_handshake_timeout(),
        ))
    }

    pub fn connect_tunnel(
        &self,
        connector: Arc<dyn UpstreamConnector>,
        pipeline: Pipeline,
    ) -> ConnectTunnel {
        ConnectTunnel::new(self.ca.clone(), connector, pipeline, self.metrics.clone())
            .with_intercept(self.config.tls.intercept)
            .with_timeouts(
                self.config.upstream.dial_timeout(),
                self.config.upstream.tls_handshake_timeout(),
            )
    }

    pub fn shutdown(&self) {
        info!("Initiating application shutdown");
        let _ = self.shutdown_tx.send(());
    }
}

/// Loads the root pair named in `config`, generating it on first use.
pub fn load_authority(config: &Config, hostname: &str) -> Result<CertificateAuthority> {
    let (Some(cert), Some(key)) = (&config.tls.ca_cert_path, &config.tls.ca_key_path) else {
        return Err(ConfigError::MissingField("tls.ca_cert_path / tls.ca_key_path".into()).into());
    };

    let paths = CaPaths {
        cert: cert.clone(),
        key: key.clone(),
    };
    let settings = CaSettings {
        validity: config.tls.ca_validity(),
        leaf_ttl: config.tls.leaf_ttl(),
        leaf_cache_ttl: config.tls.leaf_cache_ttl(),
        ..CaSettings::new(hostname)
    };
    Ok(CertificateAuthority::load(&paths, &settings)?)
}

fn open_store(config: &Config) -> Result<Option<Arc<dyn RequestStore>>> {
    if !config.capture.enabled {
        info!("Request capture disabled");
        return Ok(None);
    }

    let store: Arc<dyn RequestStore> = match config.capture.backend {
        StoreBackend::Memory => Arc::new(MemoryRequestStore::new()),
        StoreBackend::Sqlite => {
            let path = config
                .capture
                .sqlite_path
                .clone()
                .ok_or_else(|| ConfigError::MissingField("capture.sqlite_path".into()))?;
            let store = SqliteRequestStore::new(&path)?;
            info!(path = %path.display(), "Opened request store");
            Arc::new(store)
        }
    };
    Ok(Some(store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.tls.ca_cert_path = Some(dir.path().join("ca/cert.pem"));
        config.tls.ca_key_path = Some(dir.path().join("ca/key.pem"));
        config.tls.ca_common_name = Some("state-test".into());
        config.capture.sqlite_path = Some(dir.path().join("requests.db"));
        config
    }

    #[tokio::test]
    async fn test_initialize_creates_ca_and_store() {
        let dir = TempDir::new().unwrap();
        let (state, _rx) = AppState::initialize(config_in(&dir)).await.unwrap();

        assert_eq!(state.hostname, "state-test");
        assert_eq!(state.ca.common_name(), "state-test");
        assert!(dir.path().join("ca/cert.pem").exists());
        assert!(dir.path().join("requests.db").exists());
        assert!(state.store.is_some());
    }

    #[tokio::test]
    async fn test_capture_disabled_has_no_store() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.capture.enabled = false;

        let (state, _rx) = AppState::initialize(config).await.unwrap();
        assert!(state.store.is_none());
        assert!(!dir.path().join("requests.db").exists());
    }

    #[tokio::test]
    async fn test_shutdown_broadcasts() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.capture.backend = StoreBackend::Memory;

        let (state, mut rx) = AppState::initialize(config).await.unwrap();
        state.shutdown();
        assert!(rx.recv().await.is_ok());
    }
}
