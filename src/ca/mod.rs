//! Certificate authority for TLS interception.
//!
//! A persistent root authority is loaded from (or generated into) two PEM
//! files at startup, and leaf certificates are forged per hostname on demand
//! and memoized for the lifetime of the process.

mod authority;
mod issuer;
mod pem;

use std::path::PathBuf;

pub use authority::{CaStorage, RootAuthority, Validity};
pub use issuer::{LeafCertificate, LeafIssuer};
pub use pem::{load_cert_chain, load_private_key};

/// The result type for CA operations.
pub type CaResult<T> = Result<T, CaError>;

#[derive(Debug, thiserror::Error)]
pub enum CaError {
    #[error("{} not found", .0.display())]
    NotFound(PathBuf),
    #[error("failed to parse {what}: {reason}")]
    Parse { what: String, reason: String },
    #[error("certificate generation failed: {0}")]
    Crypto(#[from] rcgen::Error),
    #[error("failed to create signing key: {0}")]
    SigningKey(#[source] rustls::Error),
    #[error("invalid DNS name: {0:?}")]
    InvalidDnsName(String),
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CaError {
    pub(crate) fn parse(what: impl Into<String>, reason: impl ToString) -> Self {
        Self::Parse {
            what: what.into(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(path)
        } else {
            Self::Io { path, source }
        }
    }
}

/// Draws a random 128-bit certificate serial number.
fn random_serial() -> rcgen::SerialNumber {
    rcgen::SerialNumber::from_slice(&rand::random::<[u8; 16]>())
}
