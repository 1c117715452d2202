//! Certificate validation against a CA, a DNS name and an instant

use ::time::OffsetDateTime;
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use tracing::debug;
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

use crate::artifacts::parse_private_key;
use crate::{decode_pem, PkiError, Result, CERTIFICATE_PEM_TAG};

/// The instant certificates must still be valid at: now + `window`
pub fn lookahead_instant(window: ::time::Duration) -> OffsetDateTime {
    OffsetDateTime::now_utc() + window
}

/// Check that `cert_pem`/`key_pem` is a matched pair, chains to `ca_pem`,
/// and is valid for `dns_name` at instant `at`.
///
/// Any decode or verification failure yields `false`. Passing the same
/// certificate as both `ca_pem` and `cert_pem` checks a CA against itself.
pub fn validate(
    ca_pem: &[u8],
    cert_pem: &[u8],
    key_pem: &[u8],
    dns_name: &str,
    at: OffsetDateTime,
) -> bool {
    match check_certificate(ca_pem, cert_pem, key_pem, dns_name, at) {
        Ok(()) => true,
        Err(e) => {
            debug!(dns_name = %dns_name, reason = %e, "certificate failed validation");
            false
        }
    }
}

fn check_certificate(
    ca_pem: &[u8],
    cert_pem: &[u8],
    key_pem: &[u8],
    dns_name: &str,
    at: OffsetDateTime,
) -> Result<()> {
    if ca_pem.is_empty() || cert_pem.is_empty() || key_pem.is_empty() {
        return Err(PkiError::Parse("empty certificate material".to_string()));
    }

    let ca_der = decode_pem(ca_pem, CERTIFICATE_PEM_TAG)?;
    let (_, ca) = X509Certificate::from_der(&ca_der)
        .map_err(|e| PkiError::Parse(format!("failed to parse CA cert: {}", e)))?;

    let key = parse_private_key(key_pem)?;

    let cert_der = decode_pem(cert_pem, CERTIFICATE_PEM_TAG)?;
    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|e| PkiError::Parse(format!("failed to parse cert: {}", e)))?;

    ensure_key_matches(&cert, &key)?;
    ensure_can_sign(&ca)?;

    if cert.issuer().to_string() != ca.subject().to_string() {
        return Err(PkiError::Parse(format!(
            "certificate issued by '{}', not by CA '{}'",
            cert.issuer(),
            ca.subject()
        )));
    }
    cert.verify_signature(Some(ca.public_key()))
        .map_err(|e| PkiError::Parse(format!("signature verification failed: {}", e)))?;

    ensure_valid_at(&ca, at)?;
    ensure_valid_at(&cert, at)?;
    ensure_dns_name(&cert, dns_name)?;
    ensure_server_auth(&cert)
}

fn ensure_key_matches(cert: &X509Certificate<'_>, key: &RsaPrivateKey) -> Result<()> {
    let parsed = cert
        .public_key()
        .parsed()
        .map_err(|e| PkiError::Parse(format!("failed to parse public key: {}", e)))?;
    let PublicKey::RSA(public) = parsed else {
        return Err(PkiError::Parse("certificate key is not RSA".to_string()));
    };

    let matches = strip_leading_zeros(public.modulus) == key.n().to_bytes_be().as_slice()
        && strip_leading_zeros(public.exponent) == key.e().to_bytes_be().as_slice();
    if !matches {
        return Err(PkiError::Parse(
            "private key does not match certificate".to_string(),
        ));
    }
    Ok(())
}

fn ensure_can_sign(ca: &X509Certificate<'_>) -> Result<()> {
    if !ca.is_ca() {
        return Err(PkiError::Parse("issuer is not a CA".to_string()));
    }
    let key_usage = ca
        .key_usage()
        .map_err(|e| PkiError::Parse(format!("failed to parse key usage: {}", e)))?;
    if let Some(ku) = key_usage {
        if !ku.value.key_cert_sign() {
            return Err(PkiError::Parse("CA key usage lacks certSign".to_string()));
        }
    }
    Ok(())
}

fn ensure_valid_at(cert: &X509Certificate<'_>, at: OffsetDateTime) -> Result<()> {
    let at = at.unix_timestamp();
    let not_before = cert.validity().not_before.timestamp();
    let not_after = cert.validity().not_after.timestamp();

    if at < not_before {
        return Err(PkiError::Parse(format!(
            "certificate '{}' not yet valid",
            cert.subject()
        )));
    }
    if at > not_after {
        return Err(PkiError::Parse(format!(
            "certificate '{}' expired",
            cert.subject()
        )));
    }
    Ok(())
}

fn ensure_dns_name(cert: &X509Certificate<'_>, dns_name: &str) -> Result<()> {
    let san = cert
        .subject_alternative_name()
        .map_err(|e| PkiError::Parse(format!("failed to parse SAN: {}", e)))?;

    let matched = san.is_some_and(|san| {
        san.value.general_names.iter().any(|name| match name {
            GeneralName::DNSName(pattern) => dns_name_matches(pattern, dns_name),
            _ => false,
        })
    });

    if !matched {
        return Err(PkiError::Parse(format!(
            "certificate is not valid for '{}'",
            dns_name
        )));
    }
    Ok(())
}

fn ensure_server_auth(cert: &X509Certificate<'_>) -> Result<()> {
    let eku = cert
        .extended_key_usage()
        .map_err(|e| PkiError::Parse(format!("failed to parse extended key usage: {}", e)))?;
    match eku {
        Some(eku) if !(eku.value.server_auth || eku.value.any) => Err(PkiError::Parse(
            "certificate is not valid for server auth".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Case-insensitive match, with a single leading `*.` wildcard label allowed
fn dns_name_matches(pattern: &str, name: &str) -> bool {
    let pattern = pattern.trim_end_matches('.');
    let name = name.trim_end_matches('.');

    if let Some(suffix) = pattern.strip_prefix("*.") {
        return match name.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest.eq_ignore_ascii_case(suffix),
            None => false,
        };
    }
    pattern.eq_ignore_ascii_case(name)
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[first..]
}
