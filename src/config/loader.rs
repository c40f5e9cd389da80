use super::schema::{Config, StoreBackend};
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use http::{HeaderName, HeaderValue};
use std::path::{Path, PathBuf};

const ENV_PREFIX: &str = "BURST_PROXY_";
const STATE_DIR: &str = ".burst-proxy";

pub async fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        .merge(Toml::file("burst-proxy.toml"))
        .merge(Json::file("burst-proxy.json"))
        .merge(Yaml::file("burst-proxy.yaml"))
        .merge(Yaml::file("burst-proxy.yml"))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(config)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    let config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(config)
}

fn finish(config: Config) -> Result<Config> {
    let config = apply_env_substitutions(config)?;
    validate(&config)?;
    resolve_paths(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.admin.enabled
        && config.proxy.port == config.admin.port
        && config.proxy.host == config.admin.host
        && config.proxy.port != 0
    {
        return Err(
            ConfigError::Validation("Proxy and admin listeners must be different".into()).into(),
        );
    }

    let upstream = &config.upstream;
    if upstream.dial_timeout_ms == 0
        || upstream.tls_handshake_timeout_ms == 0
        || upstream.idle_timeout_ms == 0
    {
        return Err(
            ConfigError::Validation("Upstream timeouts must be greater than 0".into()).into(),
        );
    }

    if config.tls.leaf_ttl_hours == 0 || config.tls.ca_validity_days == 0 {
        return Err(ConfigError::Validation(
            "Certificate lifetimes must be greater than 0".into(),
        )
        .into());
    }

    if config.tls.leaf_cache_ttl_seconds > u64::from(config.tls.leaf_ttl_hours) * 3600 {
        return Err(ConfigError::Validation(
            "leaf_cache_ttl_seconds must not exceed the leaf lifetime".into(),
        )
        .into());
    }

    if HeaderName::from_bytes(config.capture.id_header.as_bytes()).is_err() {
        return Err(ConfigError::Validation(format!(
            "Capture id header '{}' is not a valid header name",
            config.capture.id_header
        ))
        .into());
    }

    for (name, value) in &config.proxy.response_headers {
        if HeaderName::from_bytes(name.as_bytes()).is_err()
            || HeaderValue::from_str(value).is_err()
        {
            return Err(ConfigError::Validation(format!(
                "Response header '{name}' has an invalid name or value"
            ))
            .into());
        }
    }

    let paired = config.tls.ca_cert_path.is_some() == config.tls.ca_key_path.is_some();
    if !paired {
        return Err(ConfigError::Validation(
            "ca_cert_path and ca_key_path must be set together".into(),
        )
        .into());
    }

    Ok(())
}

/// Fills every defaulted path so the core only ever sees concrete locations.
pub fn resolve_paths(mut config: Config) -> Result<Config> {
    if config.tls.ca_cert_path.is_none() {
        let dir = state_dir()?;
        config.tls.ca_cert_path = Some(dir.join("ca-cert.pem"));
        config.tls.ca_key_path = Some(dir.join("ca-key.pem"));
    }

    if config.capture.enabled
        && config.capture.backend == StoreBackend::Sqlite
        && config.capture.sqlite_path.is_none()
    {
        config.capture.sqlite_path = Some(state_dir()?.join("requests.db"));
    }

    Ok(config)
}

fn state_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(STATE_DIR))
        .ok_or_else(|| ConfigError::MissingField("tls.ca_cert_path (no home directory)".into()).into())
}

/// Hostname used as the subject of a generated root.
pub fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    for value in config.proxy.response_headers.values_mut() {
        *value = substitute_env_vars(value)?;
    }
    Ok(config)
}

fn substitute_env_vars(input: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Parse(e.to_string()))?;
    let mut result = input.to_string();

    for cap in re.captures_iter(input) {
        let expr = &cap[1];
        let (name, default) = match expr.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (expr, None),
        };
        let value = match (std::env::var(name), default) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.to_string(),
            (Err(_), None) => {
                return Err(ConfigError::EnvVar(format!(
                    "Environment variable '{name}' not found"
                ))
                .into())
            }
        };
        result = result.replace(&cap[0], &value);
    }

    Ok(result)
}
