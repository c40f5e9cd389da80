use std::io;
use std::net::SocketAddr;
use thiserror::Error;

use crate::capture::{ReplayError, StoreError};
use crate::forward::ForwardError;
use crate::oneshot::OneShotError;
use crate::tls::CaError;
use crate::tunnel::TunnelError;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Certificate authority error: {0}")]
    Ca(#[from] CaError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Forward error: {0}")]
    Forward(#[from] ForwardError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Replay error: {0}")]
    Replay(#[from] ReplayError),

    #[error("One-shot resource error: {0}")]
    OneShot(#[from] OneShotError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Outbound client error: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Environment variable error: {0}")]
    EnvVar(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl warp::reject::Reject for ProxyError {}
