//! CA bundle injection into untyped consumer resources
//!
//! Injection rewrites only the `caBundle` leaves of an already-fetched
//! object. Every other field is carried through unchanged so the follow-up
//! replace does not clobber concurrent edits to rules, selectors or
//! failure policies.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::{Map, Value};

use certwarden_common::{Error, Result};

use crate::webhook::WebhookKind;

const CA_BUNDLE: &str = "caBundle";
const CLIENT_CONFIG: &str = "clientConfig";

/// Point every trust-bundle field of `object` at `ca_pem`
///
/// Admission configurations get `webhooks[*].clientConfig.caBundle`; CRDs
/// get the conversion webhook's `clientConfig.caBundle`. The value stored is
/// the base64 of the PEM certificate.
pub fn inject_ca_bundle(
    object: &mut DynamicObject,
    kind: WebhookKind,
    ca_pem: &[u8],
) -> Result<()> {
    let bundle = Value::String(STANDARD.encode(ca_pem));
    let name = object.name_any();

    match kind {
        WebhookKind::Validating | WebhookKind::Mutating => {
            inject_into_webhooks(&mut object.data, bundle)
        }
        WebhookKind::CrdConversion => inject_into_conversion(&mut object.data, bundle),
    }
    .map_err(|message| Error::injection(kind.kind_name(), name, message))
}

fn inject_into_webhooks(data: &mut Value, bundle: Value) -> std::result::Result<(), String> {
    let webhooks = data
        .get_mut("webhooks")
        .and_then(Value::as_array_mut)
        .ok_or_else(|| "`webhooks` field not found".to_string())?;

    for (index, webhook) in webhooks.iter_mut().enumerate() {
        let webhook = webhook
            .as_object_mut()
            .ok_or_else(|| format!("webhook {} is not well-formed", index))?;
        let client_config = child_object(webhook, CLIENT_CONFIG)
            .ok_or_else(|| format!("webhook {} has a malformed clientConfig", index))?;
        client_config.insert(CA_BUNDLE.to_string(), bundle.clone());
    }
    Ok(())
}

fn inject_into_conversion(data: &mut Value, bundle: Value) -> std::result::Result<(), String> {
    let conversion = data
        .pointer_mut("/spec/conversion")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| "`spec.conversion` field not found".to_string())?;

    // apiextensions.k8s.io/v1 nests the client config under `webhook`;
    // v1beta1 objects carry `webhookClientConfig` directly.
    let client_config = if conversion.contains_key("webhook") {
        conversion
            .get_mut("webhook")
            .and_then(Value::as_object_mut)
            .and_then(|webhook| child_object(webhook, CLIENT_CONFIG))
    } else if conversion.contains_key("webhookClientConfig") {
        conversion
            .get_mut("webhookClientConfig")
            .and_then(Value::as_object_mut)
    } else {
        return Err("conversion webhook client config not found".to_string());
    };

    client_config
        .ok_or_else(|| "conversion webhook client config is not well-formed".to_string())?
        .insert(CA_BUNDLE.to_string(), bundle);
    Ok(())
}

/// Object-valued child of `parent`, created empty if absent
fn child_object<'a>(
    parent: &'a mut Map<String, Value>,
    key: &str,
) -> Option<&'a mut Map<String, Value>> {
    parent
        .entry(key)
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
}
