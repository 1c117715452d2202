//! CA and leaf certificate generation

use std::fmt;

use ::time::OffsetDateTime;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, LineEnding};
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::RsaPrivateKey;
use x509_parser::prelude::*;
use zeroize::Zeroizing;

use crate::{
    decode_pem, PkiError, Result, CERTIFICATE_PEM_TAG, CERT_VALIDITY, CLOCK_SKEW_ALLOWANCE,
    RSA_KEY_BITS, RSA_KEY_PEM_TAG,
};

/// Validity window for a generated certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    /// Start of the window
    pub not_before: OffsetDateTime,
    /// End of the window
    pub not_after: OffsetDateTime,
}

impl Validity {
    /// Backdated by the clock-skew allowance, valid for [`CERT_VALIDITY`]
    pub fn standard() -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            not_before: now - CLOCK_SKEW_ALLOWANCE,
            not_after: now + CERT_VALIDITY,
        }
    }

    /// Backdated by the clock-skew allowance, ending at `not_after`
    pub fn until(not_after: OffsetDateTime) -> Self {
        Self {
            not_before: OffsetDateTime::now_utc() - CLOCK_SKEW_ALLOWANCE,
            not_after,
        }
    }
}

/// A certificate together with its RSA private key, in parsed and PEM form
///
/// The PEM bytes are kept exactly as generated or as read from storage so
/// that re-persisting an unchanged CA writes byte-identical entries.
#[derive(Clone)]
pub struct KeyPairArtifacts {
    cert_der: Vec<u8>,
    private_key: RsaPrivateKey,
    cert_pem: Vec<u8>,
    key_pem: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for KeyPairArtifacts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPairArtifacts")
            .field("cert_pem_len", &self.cert_pem.len())
            .finish_non_exhaustive()
    }
}

impl KeyPairArtifacts {
    /// Load artifacts from a PEM certificate and a PEM RSA private key
    ///
    /// The key may be PKCS#1 (`RSA PRIVATE KEY`) or PKCS#8 (`PRIVATE KEY`).
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let cert_der = decode_pem(cert_pem, CERTIFICATE_PEM_TAG)?;
        X509Certificate::from_der(&cert_der)
            .map_err(|e| PkiError::Parse(format!("failed to parse certificate: {}", e)))?;

        let private_key = parse_private_key(key_pem)?;

        Ok(Self {
            cert_der,
            private_key,
            cert_pem: cert_pem.to_vec(),
            key_pem: Zeroizing::new(key_pem.to_vec()),
        })
    }

    /// Parsed X.509 view of the certificate
    pub fn certificate(&self) -> Result<X509Certificate<'_>> {
        X509Certificate::from_der(&self.cert_der)
            .map(|(_, cert)| cert)
            .map_err(|e| PkiError::Parse(format!("failed to parse certificate: {}", e)))
    }

    /// DER-encoded certificate
    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// RSA private key
    pub fn private_key(&self) -> &RsaPrivateKey {
        &self.private_key
    }

    /// PEM-encoded certificate
    pub fn cert_pem(&self) -> &[u8] {
        &self.cert_pem
    }

    /// PEM-encoded private key
    pub fn key_pem(&self) -> &[u8] {
        &self.key_pem
    }

    /// rcgen key pair for signing with this key
    fn signing_key(&self) -> Result<KeyPair> {
        signing_key_pair(&self.private_key)
    }
}

/// PEM-encoded leaf certificate and key, as returned by [`generate_leaf`]
#[derive(Clone)]
pub struct LeafPem {
    /// PEM-encoded certificate
    pub cert_pem: Vec<u8>,
    /// PEM-encoded PKCS#1 private key
    pub key_pem: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for LeafPem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeafPem")
            .field("cert_pem_len", &self.cert_pem.len())
            .finish_non_exhaustive()
    }
}

/// Create a new self-signed CA
///
/// The CA carries `common_name` both as its subject CN and as a DNS SAN, so it
/// can be validated against itself with [`crate::validate`].
pub fn generate_ca(common_name: &str, organization: &str) -> Result<KeyPairArtifacts> {
    generate_ca_with_validity(common_name, organization, Validity::standard())
}

/// Create a new self-signed CA with an explicit validity window
pub fn generate_ca_with_validity(
    common_name: &str,
    organization: &str,
    validity: Validity,
) -> Result<KeyPairArtifacts> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(organization.to_string()),
    );
    params.distinguished_name = dn;
    params.subject_alt_names = vec![dns_san(common_name)?];

    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::KeyCertSign,
    ];

    params.not_before = validity.not_before;
    params.not_after = validity.not_after;

    let private_key = generate_rsa_key()?;
    let key_pair = signing_key_pair(&private_key)?;

    let cert = params.self_signed(&key_pair).map_err(|e| {
        PkiError::CertificateCreation(format!("failed to create CA cert: {}", e))
    })?;

    Ok(KeyPairArtifacts {
        cert_der: cert.der().to_vec(),
        private_key: private_key.clone(),
        cert_pem: cert.pem().into_bytes(),
        key_pem: encode_private_key(&private_key)?,
    })
}

/// Create a serving certificate for `dns_name`, signed by `ca`
pub fn generate_leaf(dns_name: &str, ca: &KeyPairArtifacts) -> Result<LeafPem> {
    generate_leaf_with_validity(dns_name, ca, Validity::standard())
}

/// Create a serving certificate with an explicit validity window
pub fn generate_leaf_with_validity(
    dns_name: &str,
    ca: &KeyPairArtifacts,
    validity: Validity,
) -> Result<LeafPem> {
    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(dns_name.to_string()));
    params.distinguished_name = dn;
    params.subject_alt_names = vec![dns_san(dns_name)?];

    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    params.not_before = validity.not_before;
    params.not_after = validity.not_after;

    let private_key = generate_rsa_key()?;
    let leaf_key = signing_key_pair(&private_key)?;

    let ca_pem = std::str::from_utf8(ca.cert_pem())
        .map_err(|e| PkiError::Parse(format!("CA certificate is not UTF-8: {}", e)))?;
    let ca_key = ca.signing_key()?;
    let issuer = Issuer::from_ca_cert_pem(ca_pem, &ca_key)
        .map_err(|e| PkiError::Parse(format!("failed to create issuer: {}", e)))?;

    let cert = params.signed_by(&leaf_key, &issuer).map_err(|e| {
        PkiError::CertificateCreation(format!("failed to sign server cert: {}", e))
    })?;

    Ok(LeafPem {
        cert_pem: cert.pem().into_bytes(),
        key_pem: encode_private_key(&private_key)?,
    })
}

/// Parse a PEM RSA private key in PKCS#1 or PKCS#8 form
pub(crate) fn parse_private_key(key_pem: &[u8]) -> Result<RsaPrivateKey> {
    let block = ::pem::parse(key_pem)
        .map_err(|e| PkiError::Parse(format!("failed to parse key PEM: {}", e)))?;
    match block.tag() {
        RSA_KEY_PEM_TAG => RsaPrivateKey::from_pkcs1_der(block.contents())
            .map_err(|e| PkiError::Parse(format!("failed to parse PKCS#1 key: {}", e))),
        "PRIVATE KEY" => RsaPrivateKey::from_pkcs8_der(block.contents())
            .map_err(|e| PkiError::Parse(format!("failed to parse PKCS#8 key: {}", e))),
        other => Err(PkiError::Parse(format!(
            "unsupported private key PEM block '{}'",
            other
        ))),
    }
}

fn generate_rsa_key() -> Result<RsaPrivateKey> {
    RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)
        .map_err(|e| PkiError::KeyGeneration(format!("failed to generate RSA key: {}", e)))
}

/// rcgen only signs with keys it can load itself, so hand it the key as PKCS#8
fn signing_key_pair(key: &RsaPrivateKey) -> Result<KeyPair> {
    let pkcs8 = key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|e| PkiError::KeyGeneration(format!("failed to encode key: {}", e)))?;
    KeyPair::from_pem(&pkcs8)
        .map_err(|e| PkiError::KeyGeneration(format!("failed to load signing key: {}", e)))
}

fn encode_private_key(key: &RsaPrivateKey) -> Result<Zeroizing<Vec<u8>>> {
    let pem = key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| PkiError::KeyGeneration(format!("failed to encode key: {}", e)))?;
    Ok(Zeroizing::new(pem.as_bytes().to_vec()))
}

fn dns_san(name: &str) -> Result<SanType> {
    Ia5String::try_from(name.to_string())
        .map(SanType::DnsName)
        .map_err(|e| {
            PkiError::CertificateCreation(format!("invalid DNS name '{}': {}", name, e))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ca_is_self_signed_with_expected_subject() {
        let ca = generate_ca("webhook-ca", "certwarden").expect("CA creation should succeed");
        let cert = ca.certificate().expect("CA should parse");

        assert!(cert.is_ca());
        assert_eq!(cert.subject().to_string(), cert.issuer().to_string());
        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok());
        assert_eq!(cn, Some("webhook-ca"));
        let org = cert
            .subject()
            .iter_organization()
            .next()
            .and_then(|o| o.as_str().ok());
        assert_eq!(org, Some("certwarden"));
    }

    #[test]
    fn ca_is_backdated_for_clock_skew() {
        let before = OffsetDateTime::now_utc();
        let ca = generate_ca("webhook-ca", "certwarden").expect("CA creation should succeed");
        let cert = ca.certificate().expect("CA should parse");

        let not_before = cert.validity().not_before.timestamp();
        let not_after = cert.validity().not_after.timestamp();
        let minute = ::time::Duration::minutes(1);
        assert!(not_before <= (before - minute * 59_i32).unix_timestamp());
        assert!(not_after >= (before + CERT_VALIDITY - minute).unix_timestamp());
    }

    #[test]
    fn pem_blocks_use_expected_tags() {
        let ca = generate_ca("webhook-ca", "certwarden").expect("CA creation should succeed");
        let cert_pem = String::from_utf8(ca.cert_pem().to_vec()).expect("PEM is UTF-8");
        let key_pem = String::from_utf8(ca.key_pem().to_vec()).expect("PEM is UTF-8");

        assert!(cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(key_pem.contains("BEGIN RSA PRIVATE KEY"));
    }

    #[test]
    fn leaf_is_signed_by_ca_for_server_auth() {
        let ca = generate_ca("webhook-ca", "certwarden").expect("CA creation should succeed");
        let leaf = generate_leaf("webhook.default.svc", &ca).expect("leaf should be issued");

        let der = decode_pem(&leaf.cert_pem, CERTIFICATE_PEM_TAG).expect("leaf PEM decodes");
        let (_, cert) = X509Certificate::from_der(&der).expect("leaf parses");
        let ca_cert = ca.certificate().expect("CA parses");

        assert!(!cert.is_ca());
        assert!(cert.verify_signature(Some(ca_cert.public_key())).is_ok());
        let eku = cert
            .extended_key_usage()
            .expect("EKU extension parses")
            .expect("EKU extension present");
        assert!(eku.value.server_auth);
    }

    #[test]
    fn artifacts_reload_from_pem_byte_identical() {
        let ca = generate_ca("webhook-ca", "certwarden").expect("CA creation should succeed");
        let loaded =
            KeyPairArtifacts::from_pem(ca.cert_pem(), ca.key_pem()).expect("reload succeeds");

        assert_eq!(loaded.cert_pem(), ca.cert_pem());
        assert_eq!(loaded.key_pem(), ca.key_pem());
        assert_eq!(loaded.cert_der(), ca.cert_der());
        assert_eq!(loaded.private_key(), ca.private_key());
    }

    #[test]
    fn truncated_key_is_rejected() {
        let ca = generate_ca("webhook-ca", "certwarden").expect("CA creation should succeed");
        let truncated = &ca.key_pem()[..ca.key_pem().len() / 2];
        assert!(KeyPairArtifacts::from_pem(ca.cert_pem(), truncated).is_err());
    }

    #[test]
    fn certificate_in_key_slot_is_rejected() {
        let ca = generate_ca("webhook-ca", "certwarden").expect("CA creation should succeed");
        let err = KeyPairArtifacts::from_pem(ca.cert_pem(), ca.cert_pem()).unwrap_err();
        assert!(err.to_string().contains("unsupported private key"));
    }

    #[test]
    fn invalid_dns_name_is_a_creation_error() {
        let ca = generate_ca("webhook-ca", "certwarden").expect("CA creation should succeed");
        let err = generate_leaf("bad\u{e9}name", &ca).unwrap_err();
        assert!(matches!(err, PkiError::CertificateCreation(_)));
    }
}
