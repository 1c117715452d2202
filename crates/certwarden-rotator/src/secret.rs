//! Reading and writing the four certificate entries of the Secret

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;

use certwarden_common::{CA_CERT_KEY, CA_KEY_KEY, SERVER_CERT_KEY, SERVER_KEY_KEY};
use certwarden_pki::{KeyPairArtifacts, LeafPem, PkiError};

use crate::store::SecretKey;

/// Raw bytes of a Secret entry, `None` if absent
pub fn entry<'a>(secret: &'a Secret, key: &str) -> Option<&'a [u8]> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .map(|value| value.0.as_slice())
}

/// Load the CA from the Secret
///
/// Fails with [`PkiError::MalformedSecret`] if either CA entry is missing or
/// does not decode.
pub fn parse_artifacts_from_storage(secret: &Secret) -> Result<KeyPairArtifacts, PkiError> {
    let cert = entry(secret, CA_CERT_KEY)
        .ok_or_else(|| PkiError::MalformedSecret(format!("missing {}", CA_CERT_KEY)))?;
    let key = entry(secret, CA_KEY_KEY)
        .ok_or_else(|| PkiError::MalformedSecret(format!("missing {}", CA_KEY_KEY)))?;

    KeyPairArtifacts::from_pem(cert, key)
        .map_err(|e| PkiError::MalformedSecret(format!("failed to load CA: {}", e)))
}

/// Overwrite all four certificate entries, keeping any unrelated entries
pub fn populate_secret(secret: &mut Secret, ca: &KeyPairArtifacts, leaf: &LeafPem) {
    let data = secret.data.get_or_insert_with(BTreeMap::new);
    data.insert(CA_CERT_KEY.to_string(), ByteString(ca.cert_pem().to_vec()));
    data.insert(CA_KEY_KEY.to_string(), ByteString(ca.key_pem().to_vec()));
    data.insert(SERVER_CERT_KEY.to_string(), ByteString(leaf.cert_pem.clone()));
    data.insert(SERVER_KEY_KEY.to_string(), ByteString(leaf.key_pem.to_vec()));
}

/// Empty Secret at `key`, for first bootstrap
pub fn new_secret(key: &SecretKey) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(key.name.clone()),
            namespace: Some(key.namespace.clone()),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}
