//! Root authority bootstrap: load from disk or generate and persist.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use super::{CaError, CaResult, random_serial};

/// Organization written into every certificate we sign.
pub(crate) const ORGANIZATION: &str = "Stun";
const ROOT_COMMON_NAME: &str = "Stun CA";

/// Roots are valid this long on either side of the moment they are created.
const VALIDITY_SPAN: Duration = Duration::days(10 * 365);

/// Where the root certificate and its private key live on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaStorage {
    /// PEM file holding a single `CERTIFICATE` block.
    pub cert: PathBuf,
    /// PEM file holding the PKCS#8 `PRIVATE KEY` block.
    pub key: PathBuf,
}

impl Default for CaStorage {
    fn default() -> Self {
        Self {
            cert: PathBuf::from("ca.pem"),
            key: PathBuf::from("ca-key.pem"),
        }
    }
}

/// Validity window shared by the root and every leaf it issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    pub not_before: OffsetDateTime,
    pub not_after: OffsetDateTime,
}

impl Validity {
    fn around_now() -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            not_before: now - VALIDITY_SPAN,
            not_after: now + VALIDITY_SPAN,
        }
    }

    fn of_certificate(der: &CertificateDer<'_>) -> CaResult<Self> {
        let (_, cert) = x509_parser::parse_x509_certificate(der.as_ref())
            .map_err(|e| CaError::parse("root certificate", e))?;
        let validity = cert.validity();
        Ok(Self {
            not_before: validity.not_before.to_datetime(),
            not_after: validity.not_after.to_datetime(),
        })
    }
}

/// The process-wide signing root.
///
/// Immutable once constructed. The in-memory certificate is always the one
/// read back from storage, so it matches the file an operator installs.
pub struct RootAuthority {
    issuer: Issuer<'static, KeyPair>,
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    validity: Validity,
}

impl std::fmt::Debug for RootAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootAuthority")
            .field("validity", &self.validity)
            .finish_non_exhaustive()
    }
}

impl RootAuthority {
    /// Loads the root from storage, generating and persisting a fresh one if
    /// loading fails for any reason.
    pub fn bootstrap(storage: &CaStorage) -> CaResult<Self> {
        match Self::load(storage) {
            Ok(root) => {
                info!(
                    "loaded certificate authority from {}",
                    storage.cert.display()
                );
                Ok(root)
            }
            Err(e) => {
                warn!("cannot load certificate authority ({}), generating", e);
                Self::generate(storage)
            }
        }
    }

    /// Reads a previously persisted root certificate and key.
    pub fn load(storage: &CaStorage) -> CaResult<Self> {
        let cert_pem = read_artifact(&storage.cert)?;
        let key_pem = read_artifact(&storage.key)?;

        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| CaError::parse(storage.key.display().to_string(), e))?;

        let cert_der = rustls_pemfile::certs(&mut cert_pem.as_bytes())
            .next()
            .ok_or_else(|| {
                CaError::parse(storage.cert.display().to_string(), "no CERTIFICATE block")
            })?
            .map_err(|e| CaError::parse(storage.cert.display().to_string(), e))?;

        ensure_key_matches(&cert_der, &key_pair)?;
        let validity = Validity::of_certificate(&cert_der)?;

        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CaError::parse(storage.cert.display().to_string(), e))?;

        debug!("root validity {:?}", validity);

        Ok(Self {
            issuer,
            cert_der,
            cert_pem,
            validity,
        })
    }

    /// Creates a new P-256 root, writes it to storage and loads it back.
    pub fn generate(storage: &CaStorage) -> CaResult<Self> {
        let validity = Validity::around_now();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, ORGANIZATION);
        dn.push(DnType::CommonName, ROOT_COMMON_NAME);

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.serial_number = Some(random_serial());
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
        ];
        params.not_before = validity.not_before;
        params.not_after = validity.not_after;

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let cert = params.self_signed(&key_pair)?;

        write_artifact(&storage.cert, cert.pem().as_bytes(), 0o644)?;
        info!("wrote certificate authority to {}", storage.cert.display());
        write_artifact(&storage.key, key_pair.serialize_pem().as_bytes(), 0o600)?;
        info!("wrote private key to {}", storage.key.display());

        Self::load(storage)
    }

    /// The root certificate in DER form, as sent at the end of every chain.
    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    /// The root certificate exactly as stored on disk.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn validity(&self) -> Validity {
        self.validity
    }

    pub(crate) fn issuer(&self) -> &Issuer<'static, KeyPair> {
        &self.issuer
    }
}

fn read_artifact(path: &Path) -> CaResult<String> {
    fs::read_to_string(path).map_err(|e| CaError::io(path, e))
}

fn write_artifact(path: &Path, contents: &[u8], mode: u32) -> CaResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| CaError::io(parent, e))?;
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(path).map_err(|e| CaError::io(path, e))?;
    // The open mode only applies to newly created files.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(mode))
            .map_err(|e| CaError::io(path, e))?;
    }
    file.write_all(contents).map_err(|e| CaError::io(path, e))
}

/// Rejects a key file that does not belong to the certificate next to it.
fn ensure_key_matches(cert_der: &CertificateDer<'_>, key_pair: &KeyPair) -> CaResult<()> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der.as_ref())
        .map_err(|e| CaError::parse("root certificate", e))?;
    if cert.public_key().subject_public_key.data.as_ref() != key_pair.public_key_raw() {
        return Err(CaError::parse(
            "root key",
            "private key does not match the root certificate",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_in(dir: &Path) -> CaStorage {
        CaStorage {
            cert: dir.join("ca.pem"),
            key: dir.join("ca-key.pem"),
        }
    }

    /// Loading from an empty directory reports the missing file.
    #[test]
    fn load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = RootAuthority::load(&storage_in(dir.path())).unwrap_err();
        assert!(matches!(err, CaError::NotFound(_)));
    }

    #[test]
    fn load_malformed_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(dir.path());
        fs::write(&storage.cert, "garbage").unwrap();
        fs::write(&storage.key, "garbage").unwrap();

        let err = RootAuthority::load(&storage).unwrap_err();
        assert!(matches!(err, CaError::Parse { .. }));
    }

    /// Generation persists both artifacts and the returned root is the one
    /// on disk, byte for byte.
    #[test]
    fn generate_round_trips_through_storage() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(dir.path());

        let generated = RootAuthority::generate(&storage).unwrap();
        assert_eq!(generated.cert_pem(), fs::read_to_string(&storage.cert).unwrap());
        assert!(
            fs::read_to_string(&storage.key)
                .unwrap()
                .contains("BEGIN PRIVATE KEY")
        );

        let loaded = RootAuthority::load(&storage).unwrap();
        assert_eq!(loaded.cert_der(), generated.cert_der());
        assert_eq!(loaded.validity(), generated.validity());
    }

    /// The root is a CA, self-signed, named after the tool, and valid for
    /// roughly ten years on either side of now.
    #[test]
    fn generated_root_shape() {
        let dir = tempfile::tempdir().unwrap();
        let root = RootAuthority::generate(&storage_in(dir.path())).unwrap();

        let (_, cert) = x509_parser::parse_x509_certificate(root.cert_der().as_ref()).unwrap();
        assert!(cert.is_ca());
        assert_eq!(cert.subject().as_raw(), cert.issuer().as_raw());
        assert_eq!(
            cert.subject().iter_common_name().next().unwrap().as_str().unwrap(),
            ROOT_COMMON_NAME
        );
        assert!(cert.tbs_certificate.serial.bits() <= 128);
        cert.verify_signature(None).unwrap();

        let key_usage = cert.key_usage().unwrap().unwrap().value;
        assert!(key_usage.digital_signature());
        assert!(key_usage.key_cert_sign());

        let now = OffsetDateTime::now_utc();
        let validity = root.validity();
        assert!(validity.not_before < now - Duration::days(3640));
        assert!(validity.not_after > now + Duration::days(3640));
    }

    /// A second bootstrap reuses the root written by the first.
    #[test]
    fn bootstrap_generates_once() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(dir.path());

        let first = RootAuthority::bootstrap(&storage).unwrap();
        let second = RootAuthority::bootstrap(&storage).unwrap();
        assert_eq!(first.cert_der(), second.cert_der());
    }

    #[test]
    fn bootstrap_replaces_mismatched_key() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(dir.path());
        let original = RootAuthority::generate(&storage).unwrap();

        let stranger = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        fs::write(&storage.key, stranger.serialize_pem()).unwrap();
        assert!(matches!(
            RootAuthority::load(&storage).unwrap_err(),
            CaError::Parse { .. }
        ));

        let replaced = RootAuthority::bootstrap(&storage).unwrap();
        assert_ne!(replaced.cert_der(), original.cert_der());
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(dir.path());
        RootAuthority::generate(&storage).unwrap();

        let mode = fs::metadata(&storage.key).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    /// Regenerating over a world-readable key file tightens it.
    #[cfg(unix)]
    #[test]
    fn existing_key_file_is_made_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(dir.path());
        fs::write(&storage.key, "stale").unwrap();
        fs::set_permissions(&storage.key, fs::Permissions::from_mode(0o644)).unwrap();

        RootAuthority::generate(&storage).unwrap();

        let mode = fs::metadata(&storage.key).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
