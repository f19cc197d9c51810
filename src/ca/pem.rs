//! PEM file loading for operator-supplied certificates and keys.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use super::{CaError, CaResult};

/// Reads every `CERTIFICATE` block from a PEM file, leaf first.
pub fn load_cert_chain(path: &Path) -> CaResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| CaError::io(path, e))?;
    let chain = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CaError::parse(path.display().to_string(), e))?;

    if chain.is_empty() {
        return Err(CaError::parse(
            path.display().to_string(),
            "no CERTIFICATE block",
        ));
    }
    Ok(chain)
}

/// Reads the first private key (PKCS#8, SEC1 or PKCS#1) from a PEM file.
pub fn load_private_key(path: &Path) -> CaResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| CaError::io(path, e))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| CaError::parse(path.display().to_string(), e))?
        .ok_or_else(|| CaError::parse(path.display().to_string(), "no private key block"))
}
