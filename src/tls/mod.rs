//! Root CA management and leaf issuance for TLS interception.

mod authority;
mod cache;
pub mod upstream;

pub use authority::{CaPaths, CaSettings, CertificateAuthority, LeafCertificate};
pub use cache::LeafCache;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaError {
    /// Loading or creating the root failed. Fatal at startup.
    #[error("CA initialization failed: {0}")]
    Init(String),

    /// Signing a leaf failed. Aborts only the affected tunnel.
    #[error("Certificate generation failed: {0}")]
    CertGen(String),

    #[error("Invalid hostname: {0}")]
    InvalidName(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
