//! PKI operations for webhook serving certificates
//!
//! This crate builds and checks the two certificates a webhook server needs:
//!
//! - a self-signed CA that consumers (webhook configurations, CRD conversion
//!   endpoints) trust through their `caBundle` field
//! - a leaf serving certificate for the webhook's DNS name, signed by that CA
//!
//! All keys are 2048-bit RSA and are stored PEM-encoded (`CERTIFICATE` and
//! `RSA PRIVATE KEY` blocks) so they can be mounted by any TLS stack.
//!
//! # Validity and rotation
//!
//! Both certificates are valid from one hour in the past (to absorb clock
//! skew between signer and verifier) to ten years in the future. Callers do
//! not validate against "now" but against a lookahead instant, see
//! [`lookahead_instant`], so certificates are replaced well before expiry.

#![deny(missing_docs)]

mod artifacts;
mod validation;

pub use artifacts::{
    generate_ca, generate_ca_with_validity, generate_leaf, generate_leaf_with_validity,
    KeyPairArtifacts, LeafPem, Validity,
};
pub use validation::{lookahead_instant, validate};

use thiserror::Error;

/// RSA modulus size for every generated key
pub const RSA_KEY_BITS: usize = 2048;

/// Validity period for generated certificates (10 years)
pub const CERT_VALIDITY: time::Duration = time::Duration::days(10 * 365);

/// How far certificates are backdated to tolerate clock skew
pub const CLOCK_SKEW_ALLOWANCE: time::Duration = time::Duration::hours(1);

/// How far ahead of "now" certificates must remain valid (90 days)
pub const DEFAULT_LOOKAHEAD: time::Duration = time::Duration::days(90);

/// PEM block tag for certificates
pub const CERTIFICATE_PEM_TAG: &str = "CERTIFICATE";

/// PEM block tag for PKCS#1 RSA private keys
pub const RSA_KEY_PEM_TAG: &str = "RSA PRIVATE KEY";

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// RSA key generation failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Certificate creation or signing failed
    #[error("certificate creation failed: {0}")]
    CertificateCreation(String),

    /// Stored CA material is missing or cannot be decoded
    #[error("malformed secret: {0}")]
    MalformedSecret(String),

    /// PEM or DER parsing error
    #[error("parse error: {0}")]
    Parse(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Decode a single PEM block, checking its tag, and return the DER bytes
pub fn decode_pem(pem_data: &[u8], expected_tag: &str) -> Result<Vec<u8>> {
    let block = ::pem::parse(pem_data)
        .map_err(|e| PkiError::Parse(format!("failed to parse PEM: {}", e)))?;
    if block.tag() != expected_tag {
        return Err(PkiError::Parse(format!(
            "expected PEM block '{}', found '{}'",
            expected_tag,
            block.tag()
        )));
    }
    Ok(block.contents().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_pem(tag: &str, der: &[u8]) -> String {
        ::pem::encode(&::pem::Pem::new(tag, der.to_vec()))
    }

    #[test]
    fn pem_round_trip_preserves_tag_and_contents() {
        let encoded = encode_pem(CERTIFICATE_PEM_TAG, &[1, 2, 3, 4]);
        assert!(encoded.starts_with("-----BEGIN CERTIFICATE-----"));
        assert_eq!(
            decode_pem(encoded.as_bytes(), CERTIFICATE_PEM_TAG).expect("decode should succeed"),
            vec![1, 2, 3, 4]
        );
    }

    #[test]
    fn pem_with_wrong_tag_is_rejected() {
        let encoded = encode_pem(RSA_KEY_PEM_TAG, &[9, 9]);
        let err = decode_pem(encoded.as_bytes(), CERTIFICATE_PEM_TAG).unwrap_err();
        assert!(err.to_string().contains("RSA PRIVATE KEY"));
    }

    #[test]
    fn garbage_is_not_pem() {
        assert!(matches!(
            decode_pem(b"not a pem block", CERTIFICATE_PEM_TAG),
            Err(PkiError::Parse(_))
        ));
    }
}
