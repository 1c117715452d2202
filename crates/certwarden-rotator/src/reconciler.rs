//! CA bundle reconciliation
//!
//! Triggered by changes to the certificate Secret or to any declared
//! consumer, [`WebhookReconciler`] copies the stored CA into every consumer.
//! A failure on one consumer does not stop the others; the pass still
//! returns an error so the trigger is retried.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::DynamicObject;
use kube::runtime::controller::Action;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use certwarden_common::{Error, Result, RotationMetrics};

use crate::inject::inject_ca_bundle;
use crate::secret::parse_artifacts_from_storage;
use crate::store::{ClusterStore, SecretKey};
use crate::webhook::{WebhookInfo, WebhookKind};

/// Watch timeout; kept under the API server's default request timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Requeue delay after a failed pass
const ERROR_REQUEUE: Duration = Duration::from_secs(10);

/// Keeps every declared consumer's CA bundle equal to the stored CA
pub struct WebhookReconciler {
    store: Arc<dyn ClusterStore>,
    secret_key: SecretKey,
    webhooks: Vec<WebhookInfo>,
    ca_injected: Arc<AtomicBool>,
    metrics: RotationMetrics,
}

impl WebhookReconciler {
    /// Create a reconciler that sets `ca_injected` after each successful pass
    pub fn new(
        store: Arc<dyn ClusterStore>,
        secret_key: SecretKey,
        webhooks: Vec<WebhookInfo>,
        ca_injected: Arc<AtomicBool>,
        metrics: RotationMetrics,
    ) -> Self {
        Self {
            store,
            secret_key,
            webhooks,
            ca_injected,
            metrics,
        }
    }

    /// Secret this reconciler owns
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    /// Declared consumers
    pub fn webhooks(&self) -> &[WebhookInfo] {
        &self.webhooks
    }

    /// Propagate the stored CA to all consumers
    ///
    /// A missing, terminating or malformed Secret is not an error: there is
    /// nothing to propagate yet, and the next Secret event retriggers.
    pub async fn reconcile_secret(&self) -> Result<()> {
        let timer = self.metrics.reconcile_timer();
        let result = self.reconcile_inner().await;
        match &result {
            Ok(()) => timer.success(),
            Err(_) => timer.error(),
        }
        result
    }

    async fn reconcile_inner(&self) -> Result<()> {
        let Some(secret) = self.store.get_secret(&self.secret_key).await? else {
            debug!(secret = %self.secret_key, "secret not found, nothing to inject");
            return Ok(());
        };

        if secret.metadata.deletion_timestamp.is_some() {
            debug!(secret = %self.secret_key, "secret is being deleted, skipping");
            return Ok(());
        }

        let ca = match parse_artifacts_from_storage(&secret) {
            Ok(ca) => ca,
            Err(e) => {
                error!(
                    secret = %self.secret_key,
                    error = %e,
                    "secret is not well-formed, cannot update webhook configurations"
                );
                return Ok(());
            }
        };

        self.ensure_certs(ca.cert_pem()).await?;
        self.ca_injected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Inject `ca_pem` into every consumer, returning the last error seen
    ///
    /// Every failure is logged with its consumer; only the last one is
    /// returned.
    pub async fn ensure_certs(&self, ca_pem: &[u8]) -> Result<()> {
        let mut last_error = None;

        for webhook in &self.webhooks {
            if let Err(e) = self.ensure_cert(webhook, ca_pem).await {
                error!(
                    kind = %webhook.kind,
                    name = %webhook.name,
                    error = %e,
                    "unable to update CA bundle"
                );
                last_error = Some(e);
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn ensure_cert(&self, webhook: &WebhookInfo, ca_pem: &[u8]) -> Result<()> {
        let Some(mut object) = self.store.get_consumer(webhook).await? else {
            warn!(
                kind = %webhook.kind,
                name = %webhook.name,
                "webhook not found, unable to update certificate"
            );
            return Ok(());
        };

        if object.metadata.deletion_timestamp.is_some() {
            info!(
                kind = %webhook.kind,
                name = %webhook.name,
                "webhook is being deleted, unable to update certificate"
            );
            return Ok(());
        }

        debug!(kind = %webhook.kind, name = %webhook.name, "ensuring CA cert");
        inject_ca_bundle(&mut object, webhook.kind, ca_pem)?;
        self.store.replace_consumer(webhook, &object).await
    }

    /// Secret reference to enqueue for a consumer event, if it is declared
    fn trigger_for(&self, kind: WebhookKind, object: &DynamicObject) -> Option<ObjectRef<Secret>> {
        let name = object.name_any();
        self.webhooks
            .iter()
            .any(|webhook| webhook.kind == kind && webhook.name == name)
            .then(|| ObjectRef::new(&self.secret_key.name).within(&self.secret_key.namespace))
    }
}

async fn reconcile(secret: Arc<Secret>, ctx: Arc<WebhookReconciler>) -> Result<Action> {
    let name = secret.name_any();
    let namespace = secret.namespace().unwrap_or_default();
    if name != ctx.secret_key.name || namespace != ctx.secret_key.namespace {
        return Ok(Action::await_change());
    }

    ctx.reconcile_secret().await?;
    Ok(Action::await_change())
}

fn error_policy(_secret: Arc<Secret>, error: &Error, ctx: Arc<WebhookReconciler>) -> Action {
    warn!(
        secret = %ctx.secret_key,
        error = %error,
        "CA bundle reconciliation failed, will retry"
    );
    Action::requeue(ERROR_REQUEUE)
}

/// Watch the Secret and every declared consumer kind, reconciling until
/// `shutdown` is cancelled
pub async fn run_controller(
    client: Client,
    reconciler: Arc<WebhookReconciler>,
    shutdown: CancellationToken,
) {
    let key = reconciler.secret_key().clone();
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &key.namespace);

    let mut controller = Controller::new(
        secrets,
        WatcherConfig::default()
            .fields(&format!("metadata.name={}", key.name))
            .timeout(WATCH_TIMEOUT_SECS),
    );

    let mut kinds: BTreeMap<WebhookKind, Vec<String>> = BTreeMap::new();
    for webhook in reconciler.webhooks() {
        kinds.entry(webhook.kind).or_default().push(webhook.name.clone());
    }

    for (kind, names) in kinds {
        let resource = kind.api_resource();
        let consumers: Api<DynamicObject> = Api::all_with(client.clone(), &resource);
        let watcher_config = match names.as_slice() {
            [name] => WatcherConfig::default().fields(&format!("metadata.name={}", name)),
            _ => WatcherConfig::default(),
        }
        .timeout(WATCH_TIMEOUT_SECS);

        let mapper_ctx = reconciler.clone();
        controller = controller.watches_with(consumers, resource, watcher_config, move |object| {
            mapper_ctx.trigger_for(kind, &object)
        });
    }

    info!(
        secret = %key,
        webhooks = reconciler.webhooks().len(),
        "starting CA bundle reconciler"
    );

    let run = controller
        .run(reconcile, error_policy, reconciler)
        .for_each(|result| {
            match result {
                Ok((object, action)) => {
                    debug!(secret = %object.name, ?action, "CA bundle reconciliation completed")
                }
                Err(e) => error!(error = ?e, "CA bundle reconciliation error"),
            }
            std::future::ready(())
        });

    tokio::select! {
        _ = run => {}
        _ = shutdown.cancelled() => info!("stopping CA bundle reconciler"),
    }
}
