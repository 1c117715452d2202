//! Consumer resources that must carry the CA bundle

use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::ApiResource;
use thiserror::Error;

/// Kind of consumer resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WebhookKind {
    /// `admissionregistration.k8s.io/v1` ValidatingWebhookConfiguration
    Validating,
    /// `admissionregistration.k8s.io/v1` MutatingWebhookConfiguration
    Mutating,
    /// `apiextensions.k8s.io/v1` CustomResourceDefinition conversion webhook
    CrdConversion,
}

impl WebhookKind {
    /// All consumer kinds
    pub const ALL: [WebhookKind; 3] = [Self::Validating, Self::Mutating, Self::CrdConversion];

    /// Kubernetes kind name
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Validating => "ValidatingWebhookConfiguration",
            Self::Mutating => "MutatingWebhookConfiguration",
            Self::CrdConversion => "CustomResourceDefinition",
        }
    }

    /// API resource for untyped access to this kind
    pub fn api_resource(&self) -> ApiResource {
        match self {
            Self::Validating => ApiResource::erase::<ValidatingWebhookConfiguration>(&()),
            Self::Mutating => ApiResource::erase::<MutatingWebhookConfiguration>(&()),
            Self::CrdConversion => ApiResource::erase::<CustomResourceDefinition>(&()),
        }
    }

    /// Short name accepted on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validating => "validating",
            Self::Mutating => "mutating",
            Self::CrdConversion => "crd",
        }
    }
}

impl fmt::Display for WebhookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind_name())
    }
}

/// Failure to parse a consumer declaration
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseWebhookError {
    /// Kind is not one of validating, mutating, crd
    #[error("unknown webhook kind '{0}', expected validating, mutating or crd")]
    UnknownKind(String),

    /// Declaration is not of the form `kind:name`
    #[error("invalid webhook '{0}', expected <kind>:<name>")]
    Malformed(String),
}

impl FromStr for WebhookKind {
    type Err = ParseWebhookError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "validating" | "validatingwebhookconfiguration" => Ok(Self::Validating),
            "mutating" | "mutatingwebhookconfiguration" => Ok(Self::Mutating),
            "crd" | "crdconversion" | "customresourcedefinition" => Ok(Self::CrdConversion),
            _ => Err(ParseWebhookError::UnknownKind(s.to_string())),
        }
    }
}

/// A consumer resource that must trust the serving certificate
///
/// Consumers are cluster-scoped and addressed by name alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WebhookInfo {
    /// Resource name
    pub name: String,
    /// Resource kind
    pub kind: WebhookKind,
}

impl WebhookInfo {
    /// Create a consumer declaration
    pub fn new(kind: WebhookKind, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

impl fmt::Display for WebhookInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

impl FromStr for WebhookInfo {
    type Err = ParseWebhookError;

    /// Parse `kind:name`, e.g. `validating:policy-webhook`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, name) = s
            .split_once(':')
            .ok_or_else(|| ParseWebhookError::Malformed(s.to_string()))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ParseWebhookError::Malformed(s.to_string()));
        }
        Ok(Self::new(kind.trim().parse()?, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_kind_and_name() {
        let info: WebhookInfo = "validating:policy-webhook".parse().unwrap();
        assert_eq!(info, WebhookInfo::new(WebhookKind::Validating, "policy-webhook"));

        let info: WebhookInfo = "CRD:widgets.example.com".parse().unwrap();
        assert_eq!(info.kind, WebhookKind::CrdConversion);
        assert_eq!(info.name, "widgets.example.com");
    }

    #[test]
    fn rejects_malformed_declarations() {
        assert_eq!(
            "policy-webhook".parse::<WebhookInfo>(),
            Err(ParseWebhookError::Malformed("policy-webhook".to_string()))
        );
        assert!(matches!(
            "mutating:".parse::<WebhookInfo>(),
            Err(ParseWebhookError::Malformed(_))
        ));
        assert_eq!(
            "service:foo".parse::<WebhookInfo>(),
            Err(ParseWebhookError::UnknownKind("service".to_string()))
        );
    }

    #[test]
    fn api_resources_point_at_stable_groups() {
        let validating = WebhookKind::Validating.api_resource();
        assert_eq!(validating.group, "admissionregistration.k8s.io");
        assert_eq!(validating.version, "v1");
        assert_eq!(validating.plural, "validatingwebhookconfigurations");

        let mutating = WebhookKind::Mutating.api_resource();
        assert_eq!(mutating.kind, "MutatingWebhookConfiguration");

        let crd = WebhookKind::CrdConversion.api_resource();
        assert_eq!(crd.group, "apiextensions.k8s.io");
        assert_eq!(crd.plural, "customresourcedefinitions");
    }

    #[test]
    fn short_names_round_trip_through_parse() {
        for kind in WebhookKind::ALL {
            assert_eq!(kind.as_str().parse::<WebhookKind>(), Ok(kind));
        }
    }
}
