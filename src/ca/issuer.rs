//! On-demand leaf certificates, memoized per hostname.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, KeyPair,
    KeyUsagePurpose, PKCS_ECDSA_P256_SHA256, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use tracing::debug;

use super::authority::{ORGANIZATION, RootAuthority};
use super::{CaError, CaResult, random_serial};

/// A forged leaf: `[leaf, root]` chain plus the leaf's private key.
pub struct LeafCertificate {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    certified: Arc<CertifiedKey>,
}

impl LeafCertificate {
    /// Leaf DER followed by root DER.
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// The leaf private key in PKCS#8 DER form.
    pub fn key(&self) -> &PrivateKeyDer<'static> {
        &self.key
    }

    /// The chain and key prepared for rustls.
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified)
    }
}

impl std::fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// Signs leaf certificates with the root authority.
///
/// Entries are keyed by the exact hostname string and are never evicted or
/// replaced, so repeated requests for one name return the same bytes.
pub struct LeafIssuer {
    root: Arc<RootAuthority>,
    cache: Mutex<HashMap<String, Arc<LeafCertificate>>>,
}

impl LeafIssuer {
    pub fn new(root: Arc<RootAuthority>) -> Self {
        Self {
            root,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the leaf for `hostname`, signing one on first use.
    ///
    /// The cache lock is held across the lookup, the signing and the insert,
    /// so concurrent first requests for one name produce a single leaf.
    pub fn issue(&self, hostname: &str) -> CaResult<Arc<LeafCertificate>> {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(leaf) = cache.get(hostname) {
            return Ok(Arc::clone(leaf));
        }

        let leaf = Arc::new(self.sign(hostname)?);
        cache.insert(hostname.to_string(), Arc::clone(&leaf));
        debug!("issued leaf certificate for {}", hostname);
        Ok(leaf)
    }

    /// Number of hostnames with a cached leaf.
    pub fn len(&self) -> usize {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn root(&self) -> &RootAuthority {
        &self.root
    }

    fn sign(&self, hostname: &str) -> CaResult<LeafCertificate> {
        if hostname.is_empty() {
            return Err(CaError::InvalidDnsName(String::new()));
        }

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, ORGANIZATION);
        dn.push(DnType::CommonName, hostname);

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.serial_number = Some(random_serial());
        params.subject_alt_names = vec![SanType::DnsName(
            hostname
                .try_into()
                .map_err(|_| CaError::InvalidDnsName(hostname.to_string()))?,
        )];
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let validity = self.root.validity();
        params.not_before = validity.not_before;
        params.not_after = validity.not_after;

        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let cert = params.signed_by(&key_pair, self.root.issuer())?;

        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let signing_key =
            rustls::crypto::ring::sign::any_supported_type(&key).map_err(CaError::SigningKey)?;

        let chain = vec![
            CertificateDer::from(cert.der().to_vec()),
            self.root.cert_der().clone(),
        ];
        let certified = Arc::new(CertifiedKey::new(chain.clone(), signing_key));

        Ok(LeafCertificate {
            chain,
            key,
            certified,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CaStorage;
    use x509_parser::extensions::GeneralName;
    use x509_parser::parse_x509_certificate;

    fn issuer() -> (tempfile::TempDir, LeafIssuer) {
        let dir = tempfile::tempdir().unwrap();
        let storage = CaStorage {
            cert: dir.path().join("ca.pem"),
            key: dir.path().join("ca-key.pem"),
        };
        let root = Arc::new(RootAuthority::generate(&storage).unwrap());
        (dir, LeafIssuer::new(root))
    }

    /// Repeated requests for one hostname return byte-identical output.
    #[test]
    fn issue_is_memoized() {
        let (_dir, issuer) = issuer();

        let first = issuer.issue("example.com").unwrap();
        let second = issuer.issue("example.com").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.chain(), second.chain());
        assert_eq!(first.key().secret_der(), second.key().secret_der());
        assert_eq!(issuer.len(), 1);
    }

    /// Hostnames are matched exactly, without case folding or wildcards.
    #[test]
    fn distinct_hostnames_get_distinct_leaves() {
        let (_dir, issuer) = issuer();

        let lower = issuer.issue("example.com").unwrap();
        let upper = issuer.issue("Example.com").unwrap();
        let sub = issuer.issue("a.example.com").unwrap();

        assert_ne!(lower.chain()[0], upper.chain()[0]);
        assert_ne!(lower.chain()[0], sub.chain()[0]);
        assert_eq!(issuer.len(), 3);
    }

    /// Concurrent first requests for the same name all observe one leaf.
    #[test]
    fn concurrent_issue_signs_once() {
        let (_dir, issuer) = issuer();

        let leaves: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| issuer.issue("race.example").unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for leaf in &leaves[1..] {
            assert!(Arc::ptr_eq(&leaves[0], leaf));
        }
        assert_eq!(issuer.len(), 1);
    }

    /// The leaf is signed by the root key and the chain ends with the root.
    #[test]
    fn leaf_verifies_against_root() {
        let (_dir, issuer) = issuer();
        let leaf = issuer.issue("svc.local").unwrap();

        assert_eq!(leaf.chain().len(), 2);
        assert_eq!(&leaf.chain()[1], issuer.root().cert_der());

        let (_, root) = parse_x509_certificate(leaf.chain()[1].as_ref()).unwrap();
        let (_, cert) = parse_x509_certificate(leaf.chain()[0].as_ref()).unwrap();
        root.verify_signature(None).unwrap();
        cert.verify_signature(Some(root.public_key())).unwrap();
        assert_eq!(cert.issuer().as_raw(), root.subject().as_raw());
        assert!(!cert.is_ca());
    }

    /// Subject, SAN, usages and validity follow the leaf template.
    #[test]
    fn leaf_template() {
        let (_dir, issuer) = issuer();
        let leaf = issuer.issue("*.example.org").unwrap();
        let (_, cert) = parse_x509_certificate(leaf.chain()[0].as_ref()).unwrap();

        let cn = cert.subject().iter_common_name().next().unwrap();
        assert_eq!(cn.as_str().unwrap(), "*.example.org");

        let san = cert.subject_alternative_name().unwrap().unwrap().value;
        assert_eq!(san.general_names.len(), 1);
        assert!(matches!(san.general_names[0], GeneralName::DNSName("*.example.org")));

        let key_usage = cert.key_usage().unwrap().unwrap().value;
        assert!(key_usage.digital_signature());
        assert!(!key_usage.key_cert_sign());
        assert!(cert.extended_key_usage().unwrap().unwrap().value.server_auth);

        let validity = issuer.root().validity();
        assert_eq!(cert.validity().not_before.to_datetime(), validity.not_before);
        assert_eq!(cert.validity().not_after.to_datetime(), validity.not_after);
    }

    #[test]
    fn empty_hostname_rejected() {
        let (_dir, issuer) = issuer();
        assert!(matches!(
            issuer.issue("").unwrap_err(),
            CaError::InvalidDnsName(_)
        ));
        assert!(issuer.is_empty());
    }
}
