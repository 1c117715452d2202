//! In-memory [`ClusterStore`] for tests
//!
//! Behaves like a single API server without watches: objects get a
//! monotonically increasing resource version on every write, and reads of
//! individual consumers can be made to fail to exercise partial failure.
//!
//! Available under `cfg(test)` and the `testutil` feature:
//!
//! ```toml
//! [dev-dependencies]
//! certwarden-rotator = { path = "../certwarden-rotator", features = ["testutil"] }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::DynamicObject;

use certwarden_common::{Error, Result};

use crate::store::{ClusterStore, SecretKey};
use crate::webhook::WebhookInfo;

#[derive(Default)]
struct State {
    secrets: HashMap<SecretKey, Secret>,
    consumers: HashMap<WebhookInfo, DynamicObject>,
    failing_consumers: HashSet<WebhookInfo>,
    secret_writes: usize,
    consumer_writes: usize,
    resource_version: u64,
}

impl State {
    fn next_version(&mut self) -> Option<String> {
        self.resource_version += 1;
        Some(self.resource_version.to_string())
    }
}

/// Shared in-memory object store
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed or overwrite a Secret without counting it as a write
    pub fn put_secret(&self, key: &SecretKey, secret: Secret) {
        self.state().secrets.insert(key.clone(), secret);
    }

    /// Current Secret, if any
    pub fn secret(&self, key: &SecretKey) -> Option<Secret> {
        self.state().secrets.get(key).cloned()
    }

    /// Seed or overwrite a consumer without counting it as a write
    pub fn put_consumer(&self, webhook: &WebhookInfo, object: DynamicObject) {
        self.state().consumers.insert(webhook.clone(), object);
    }

    /// Current consumer object, if any
    pub fn consumer(&self, webhook: &WebhookInfo) -> Option<DynamicObject> {
        self.state().consumers.get(webhook).cloned()
    }

    /// Make reads of `webhook` fail until [`MemoryStore::clear_failures`]
    pub fn fail_consumer_reads(&self, webhook: &WebhookInfo) {
        self.state().failing_consumers.insert(webhook.clone());
    }

    /// Stop injecting failures
    pub fn clear_failures(&self) {
        self.state().failing_consumers.clear();
    }

    /// Number of Secret creates and replaces
    pub fn secret_writes(&self) -> usize {
        self.state().secret_writes
    }

    /// Number of consumer replaces
    pub fn consumer_writes(&self) -> usize {
        self.state().consumer_writes
    }
}

fn secret_key_of(secret: &Secret) -> Result<SecretKey> {
    match (&secret.metadata.namespace, &secret.metadata.name) {
        (Some(namespace), Some(name)) => Ok(SecretKey::new(namespace, name)),
        _ => Err(Error::internal_with_context(
            "memory-store",
            "secret has no namespace/name",
        )),
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn get_secret(&self, key: &SecretKey) -> Result<Option<Secret>> {
        Ok(self.secret(key))
    }

    async fn create_secret(&self, secret: &Secret) -> Result<()> {
        let key = secret_key_of(secret)?;
        let mut state = self.state();
        if state.secrets.contains_key(&key) {
            return Err(Error::internal_with_context(
                "memory-store",
                format!("secret {} already exists", key),
            ));
        }
        let mut secret = secret.clone();
        secret.metadata.resource_version = state.next_version();
        state.secrets.insert(key, secret);
        state.secret_writes += 1;
        Ok(())
    }

    async fn replace_secret(&self, secret: &Secret) -> Result<()> {
        let key = secret_key_of(secret)?;
        let mut state = self.state();
        if !state.secrets.contains_key(&key) {
            return Err(Error::internal_with_context(
                "memory-store",
                format!("secret {} not found", key),
            ));
        }
        let mut secret = secret.clone();
        secret.metadata.resource_version = state.next_version();
        state.secrets.insert(key, secret);
        state.secret_writes += 1;
        Ok(())
    }

    async fn get_consumer(&self, webhook: &WebhookInfo) -> Result<Option<DynamicObject>> {
        let state = self.state();
        if state.failing_consumers.contains(webhook) {
            return Err(Error::internal_with_context(
                "memory-store",
                format!("injected read failure for {}", webhook),
            ));
        }
        Ok(state.consumers.get(webhook).cloned())
    }

    async fn replace_consumer(&self, webhook: &WebhookInfo, object: &DynamicObject) -> Result<()> {
        let mut state = self.state();
        if !state.consumers.contains_key(webhook) {
            return Err(Error::internal_with_context(
                "memory-store",
                format!("{} not found", webhook),
            ));
        }
        let mut object = object.clone();
        object.metadata.resource_version = state.next_version();
        state.consumers.insert(webhook.clone(), object);
        state.consumer_writes += 1;
        Ok(())
    }
}
