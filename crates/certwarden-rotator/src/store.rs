//! Cluster object store seam
//!
//! The rotator and reconciler only ever get, create and replace objects.
//! [`ClusterStore`] captures that contract so both can be exercised against
//! mocks or an in-memory store; [`KubeStore`] is the API server backed
//! implementation. Watches are wired separately by the controller.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{DynamicObject, PostParams};
use kube::{Api, Client};
#[cfg(test)]
use mockall::automock;

use certwarden_common::{Result, FIELD_MANAGER};

use crate::webhook::WebhookInfo;

/// Namespace and name of the certificate Secret
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SecretKey {
    /// Secret namespace
    pub namespace: String,
    /// Secret name
    pub name: String,
}

impl SecretKey {
    /// Create a secret key
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Get/create/replace access to the Secret and consumer resources
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Fetch the Secret, `None` if it does not exist
    async fn get_secret(&self, key: &SecretKey) -> Result<Option<Secret>>;

    /// Create the Secret
    async fn create_secret(&self, secret: &Secret) -> Result<()>;

    /// Replace the Secret in a single write
    async fn replace_secret(&self, secret: &Secret) -> Result<()>;

    /// Fetch a consumer resource, `None` if it does not exist
    async fn get_consumer(&self, webhook: &WebhookInfo) -> Result<Option<DynamicObject>>;

    /// Replace a consumer resource
    async fn replace_consumer(&self, webhook: &WebhookInfo, object: &DynamicObject) -> Result<()>;
}

/// [`ClusterStore`] backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn consumers(&self, webhook: &WebhookInfo) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &webhook.kind.api_resource())
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

fn secret_location(secret: &Secret) -> (String, String) {
    (
        secret.metadata.namespace.clone().unwrap_or_default(),
        secret.metadata.name.clone().unwrap_or_default(),
    )
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn get_secret(&self, key: &SecretKey) -> Result<Option<Secret>> {
        Ok(self.secrets(&key.namespace).get_opt(&key.name).await?)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<()> {
        let (namespace, _) = secret_location(secret);
        self.secrets(&namespace)
            .create(&post_params(), secret)
            .await?;
        Ok(())
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<()> {
        let (namespace, name) = secret_location(secret);
        self.secrets(&namespace)
            .replace(&name, &post_params(), secret)
            .await?;
        Ok(())
    }

    async fn get_consumer(&self, webhook: &WebhookInfo) -> Result<Option<DynamicObject>> {
        Ok(self.consumers(webhook).get_opt(&webhook.name).await?)
    }

    async fn replace_consumer(&self, webhook: &WebhookInfo, object: &DynamicObject) -> Result<()> {
        self.consumers(webhook)
            .replace(&webhook.name, &post_params(), object)
            .await?;
        Ok(())
    }
}
