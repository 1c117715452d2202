//! Certificate rotation
//!
//! [`CertRotator::refresh_cert_if_needed`] decides, from the Secret alone,
//! whether the CA or only the serving leaf needs replacing:
//!
//! 1. CA missing, undecodable, or expiring within the lookahead window:
//!    new CA and new leaf, written together
//! 2. Leaf not signed by the stored CA, wrong name, or expiring within the
//!    lookahead window: new leaf signed by the stored CA, CA entries untouched
//! 3. Otherwise nothing is written
//!
//! [`CertRotator::start`] bootstraps synchronously, then re-checks on a fixed
//! period until stopped or a readiness poller reports a terminal failure.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use certwarden_common::metrics::{RotationPhase, RotationScope};
use certwarden_common::{
    retry_with_backoff, Error, Result, RotationMetrics, Signal, CA_CERT_KEY, CA_KEY_KEY,
    SERVER_CERT_KEY, SERVER_KEY_KEY,
};
use certwarden_pki::{
    generate_ca, generate_leaf, lookahead_instant, validate, KeyPairArtifacts, LeafPem,
};

use crate::config::RotatorConfig;
use crate::readiness::{ensure_certs_mounted, ensure_ready, ReadinessSignals};
use crate::reconciler::WebhookReconciler;
use crate::secret::{entry, new_secret, parse_artifacts_from_storage, populate_secret};
use crate::store::ClusterStore;

/// What a rotation check did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationOutcome {
    /// Stored certificates were valid; nothing written
    Unchanged,
    /// New leaf signed by the stored CA
    RotatedLeaf,
    /// New CA and new leaf
    RotatedCa,
}

impl RotationOutcome {
    /// Whether the Secret was written
    pub fn wrote_secret(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Called after every rotation check that wrote the Secret
#[cfg_attr(test, mockall::automock)]
pub trait RotationHook: Send + Sync {
    /// React to a completed Secret write
    fn on_rotation(&self, outcome: RotationOutcome);
}

/// Hook that does nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHook;

impl RotationHook for NoopHook {
    fn on_rotation(&self, _outcome: RotationOutcome) {}
}

/// Hook that exits the process so it restarts with freshly mounted certs
///
/// Projected Secret volumes can lag an update by a minute or more; a restart
/// is the fastest way to start serving the new certificate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitOnRotation;

impl RotationHook for ExitOnRotation {
    fn on_rotation(&self, outcome: RotationOutcome) {
        info!(
            ?outcome,
            "certificates updated; exiting so the pod restarts with the new mount"
        );
        std::process::exit(0);
    }
}

/// Keeps the CA and serving certificate in the Secret valid
pub struct CertRotator {
    config: RotatorConfig,
    store: Arc<dyn ClusterStore>,
    hook: Arc<dyn RotationHook>,
    metrics: RotationMetrics,
    ca_injected: Arc<AtomicBool>,
    signals: ReadinessSignals,
}

impl CertRotator {
    /// Create a rotator
    ///
    /// Installs [`ExitOnRotation`] when `restart_on_refresh` is set, otherwise
    /// [`NoopHook`].
    pub fn new(
        config: RotatorConfig,
        store: Arc<dyn ClusterStore>,
        metrics: RotationMetrics,
    ) -> Self {
        let hook: Arc<dyn RotationHook> = if config.restart_on_refresh {
            Arc::new(ExitOnRotation)
        } else {
            Arc::new(NoopHook)
        };
        Self {
            config,
            store,
            hook,
            metrics,
            ca_injected: Arc::new(AtomicBool::new(false)),
            signals: ReadinessSignals::default(),
        }
    }

    /// Replace the post-rotation hook
    pub fn with_hook(mut self, hook: Arc<dyn RotationHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Fires once certificates are mounted and the CA has been injected
    pub fn ready_signal(&self) -> Signal {
        self.signals.ready.clone()
    }

    /// Configuration in use
    pub fn config(&self) -> &RotatorConfig {
        &self.config
    }

    /// Reconciler sharing this rotator's store and "CA injected" flag
    pub fn reconciler(&self) -> WebhookReconciler {
        WebhookReconciler::new(
            self.store.clone(),
            self.config.secret_key.clone(),
            self.config.webhooks.clone(),
            self.ca_injected.clone(),
            self.metrics.clone(),
        )
    }

    /// Run until `stop` is cancelled
    ///
    /// Returns an error if the bootstrap rotation fails, or if certificates
    /// never mount or the CA is never injected.
    pub async fn start(&self, stop: CancellationToken) -> Result<()> {
        info!(secret = %self.config.secret_key, "starting cert rotator");

        if let Err(e) = self.refresh_cert_if_needed().await {
            error!(error = %e, "could not refresh cert on startup");
            self.metrics.record_rotation_error(RotationPhase::Bootstrap);
            return Err(e);
        }

        let _pollers = PollerTasks(vec![
            tokio::spawn(ensure_certs_mounted(
                self.config.cert_file(),
                self.config.readiness_backoff.clone(),
                self.signals.clone(),
            )),
            tokio::spawn(ensure_ready(
                self.ca_injected.clone(),
                self.config.readiness_backoff.clone(),
                self.signals.clone(),
                self.metrics.clone(),
            )),
        ]);

        let period = self.config.check_period;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh_cert_if_needed().await {
                        error!(error = %e, "error rotating certs");
                        self.metrics.record_rotation_error(RotationPhase::Periodic);
                    }
                }
                _ = stop.cancelled() => break Ok(()),
                _ = self.signals.unmountable.fired() => {
                    break Err(Error::terminal("could not mount certs"));
                }
                _ = self.signals.injection_failed.fired() => {
                    break Err(Error::terminal("could not inject certs to webhooks"));
                }
            }
        };

        info!("stopping cert rotator");
        result
    }

    /// Rotate the CA and/or leaf if they will not be valid at the lookahead
    /// instant, retrying with the refresh backoff
    pub async fn refresh_cert_if_needed(&self) -> Result<RotationOutcome> {
        let outcome = retry_with_backoff(&self.config.refresh_backoff, "refresh_certs", || {
            self.refresh_once()
        })
        .await?;

        if outcome.wrote_secret() {
            self.hook.on_rotation(outcome);
        }
        Ok(outcome)
    }

    /// A single rotation check without retries
    async fn refresh_once(&self) -> Result<RotationOutcome> {
        let key = &self.config.secret_key;
        let (mut secret, exists) = match self.store.get_secret(key).await? {
            Some(secret) => (secret, true),
            None => {
                info!(secret = %key, "secret not found, creating");
                (new_secret(key), false)
            }
        };

        let at = lookahead_instant(self.config.lookahead);
        let stored = |name| entry(&secret, name).unwrap_or_default();

        let ca_valid = validate(
            stored(CA_CERT_KEY),
            stored(CA_CERT_KEY),
            stored(CA_KEY_KEY),
            &self.config.ca_name,
            at,
        );
        let leaf_valid = ca_valid
            && validate(
                stored(CA_CERT_KEY),
                stored(SERVER_CERT_KEY),
                stored(SERVER_KEY_KEY),
                &self.config.dns_name,
                at,
            );

        let (outcome, ca) = if !ca_valid {
            info!(secret = %key, "refreshing CA and server certs");
            (RotationOutcome::RotatedCa, self.create_ca().await?)
        } else if !leaf_valid {
            info!(secret = %key, "refreshing server certs");
            (
                RotationOutcome::RotatedLeaf,
                parse_artifacts_from_storage(&secret)?,
            )
        } else {
            debug!(secret = %key, "no cert refresh needed");
            return Ok(RotationOutcome::Unchanged);
        };

        let leaf = self.create_leaf(ca.clone()).await?;
        populate_secret(&mut secret, &ca, &leaf);

        if exists {
            self.store.replace_secret(&secret).await?;
        } else {
            self.store.create_secret(&secret).await?;
        }

        self.metrics.record_rotation(match outcome {
            RotationOutcome::RotatedCa => RotationScope::Ca,
            _ => RotationScope::Leaf,
        });
        info!(secret = %key, ?outcome, "server certs refreshed");
        Ok(outcome)
    }

    async fn create_ca(&self) -> Result<KeyPairArtifacts> {
        let name = self.config.ca_name.clone();
        let organization = self.config.ca_organization.clone();
        let ca = tokio::task::spawn_blocking(move || generate_ca(&name, &organization))
            .await
            .map_err(|e| join_error("CA generation", e))??;
        Ok(ca)
    }

    async fn create_leaf(&self, ca: KeyPairArtifacts) -> Result<LeafPem> {
        let dns_name = self.config.dns_name.clone();
        let leaf = tokio::task::spawn_blocking(move || generate_leaf(&dns_name, &ca))
            .await
            .map_err(|e| join_error("leaf generation", e))??;
        Ok(leaf)
    }
}

fn join_error(task: &str, e: tokio::task::JoinError) -> Error {
    Error::internal_with_context("rotator", format!("{} task failed: {}", task, e))
}

/// Aborts the readiness pollers when the control loop exits
struct PollerTasks(Vec<JoinHandle<()>>);

impl Drop for PollerTasks {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use certwarden_common::RetryConfig;
    use k8s_openapi::ByteString;
    use mockall::predicate::eq;

    use crate::memory::MemoryStore;
    use crate::store::{MockClusterStore, SecretKey};
    use certwarden_pki::{
        generate_ca_with_validity, generate_leaf_with_validity, Validity, DEFAULT_LOOKAHEAD,
    };
    use time::OffsetDateTime;

    const CA_NAME: &str = "webhook-ca";
    const DNS_NAME: &str = "webhook-service.webhook-system.svc";

    fn key() -> SecretKey {
        SecretKey::new("webhook-system", "webhook-server-cert")
    }

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
        }
    }

    fn config(cert_dir: impl Into<std::path::PathBuf>) -> RotatorConfig {
        let mut config = RotatorConfig::new(key(), cert_dir, CA_NAME, "certwarden", DNS_NAME);
        config.refresh_backoff = fast(3);
        config.readiness_backoff = fast(3);
        config
    }

    fn rotator(store: Arc<dyn ClusterStore>) -> CertRotator {
        CertRotator::new(config("/nonexistent"), store, RotationMetrics::from_global())
    }

    fn stored(store: &MemoryStore, name: &str) -> Vec<u8> {
        let secret = store.secret(&key()).expect("secret should exist");
        entry(&secret, name).expect("entry should exist").to_vec()
    }

    #[tokio::test]
    async fn bootstrap_creates_secret_with_consistent_entries() {
        let store = Arc::new(MemoryStore::new());
        let rotator = rotator(store.clone());

        let outcome = rotator.refresh_cert_if_needed().await.unwrap();

        assert_eq!(outcome, RotationOutcome::RotatedCa);
        assert_eq!(store.secret_writes(), 1);
        let now = OffsetDateTime::now_utc();
        let ca = stored(&store, CA_CERT_KEY);
        assert!(validate(&ca, &ca, &stored(&store, CA_KEY_KEY), CA_NAME, now));
        assert!(validate(
            &ca,
            &stored(&store, SERVER_CERT_KEY),
            &stored(&store, SERVER_KEY_KEY),
            DNS_NAME,
            now
        ));
    }

    #[tokio::test]
    async fn second_refresh_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let rotator = rotator(store.clone());

        rotator.refresh_cert_if_needed().await.unwrap();
        let outcome = rotator.refresh_cert_if_needed().await.unwrap();

        assert_eq!(outcome, RotationOutcome::Unchanged);
        assert_eq!(store.secret_writes(), 1);
    }

    #[tokio::test]
    async fn corrupt_ca_triggers_full_rotation() {
        let store = Arc::new(MemoryStore::new());
        let rotator = rotator(store.clone());
        rotator.refresh_cert_if_needed().await.unwrap();
        let old_ca = stored(&store, CA_CERT_KEY);

        let mut secret = store.secret(&key()).unwrap();
        if let Some(data) = secret.data.as_mut() {
            data.insert(CA_CERT_KEY.to_string(), ByteString(b"not a certificate".to_vec()));
        }
        store.put_secret(&key(), secret);

        let outcome = rotator.refresh_cert_if_needed().await.unwrap();

        assert_eq!(outcome, RotationOutcome::RotatedCa);
        assert_ne!(stored(&store, CA_CERT_KEY), old_ca);
    }

    /// A CA comfortably inside its validity window paired with a leaf that
    /// expires inside the lookahead window gets a new leaf, and the CA
    /// entries stay byte-identical.
    #[tokio::test]
    async fn expiring_leaf_is_reissued_without_touching_ca() {
        let store = Arc::new(MemoryStore::new());
        let ca = generate_ca_with_validity(CA_NAME, "certwarden", Validity::standard()).unwrap();
        let expiry = OffsetDateTime::now_utc() + DEFAULT_LOOKAHEAD - time::Duration::days(1);
        let short = Validity::until(expiry);
        let leaf = generate_leaf_with_validity(DNS_NAME, &ca, short).unwrap();
        let mut secret = new_secret(&key());
        populate_secret(&mut secret, &ca, &leaf);
        store.put_secret(&key(), secret);

        let outcome = rotator(store.clone()).refresh_cert_if_needed().await.unwrap();

        assert_eq!(outcome, RotationOutcome::RotatedLeaf);
        assert_eq!(stored(&store, CA_CERT_KEY), ca.cert_pem());
        assert_eq!(stored(&store, CA_KEY_KEY), ca.key_pem());
        assert_ne!(stored(&store, SERVER_CERT_KEY), leaf.cert_pem);
        assert!(validate(
            ca.cert_pem(),
            &stored(&store, SERVER_CERT_KEY),
            &stored(&store, SERVER_KEY_KEY),
            DNS_NAME,
            lookahead_instant(DEFAULT_LOOKAHEAD)
        ));
    }

    #[tokio::test]
    async fn leaf_signed_by_stale_ca_is_reissued() {
        let store = Arc::new(MemoryStore::new());
        let ca = certwarden_pki::generate_ca(CA_NAME, "certwarden").unwrap();
        let stale = certwarden_pki::generate_ca(CA_NAME, "certwarden").unwrap();
        let leaf = generate_leaf(DNS_NAME, &stale).unwrap();
        let mut secret = new_secret(&key());
        populate_secret(&mut secret, &ca, &leaf);
        store.put_secret(&key(), secret);

        let outcome = rotator(store.clone()).refresh_cert_if_needed().await.unwrap();

        assert_eq!(outcome, RotationOutcome::RotatedLeaf);
        assert_eq!(stored(&store, CA_CERT_KEY), ca.cert_pem());
    }

    #[tokio::test]
    async fn transient_read_errors_are_retried() {
        let mut mock = MockClusterStore::new();
        let mut calls = 0;
        mock.expect_get_secret()
            .with(eq(key()))
            .times(2)
            .returning(move |_| {
                calls += 1;
                if calls == 1 {
                    Err(Error::internal("apiserver unavailable"))
                } else {
                    Ok(None)
                }
            });
        mock.expect_create_secret().times(1).returning(|_| Ok(()));

        let outcome = rotator(Arc::new(mock)).refresh_cert_if_needed().await.unwrap();
        assert_eq!(outcome, RotationOutcome::RotatedCa);
    }

    #[tokio::test]
    async fn exhausted_retries_return_the_last_error() {
        let mut mock = MockClusterStore::new();
        mock.expect_get_secret()
            .times(3)
            .returning(|_| Err(Error::internal("apiserver unavailable")));

        let err = rotator(Arc::new(mock)).refresh_cert_if_needed().await.unwrap_err();
        assert!(err.to_string().contains("apiserver unavailable"));
    }

    #[tokio::test]
    async fn hook_runs_only_after_a_write() {
        let store = Arc::new(MemoryStore::new());
        let mut hook = MockRotationHook::new();
        hook.expect_on_rotation()
            .with(eq(RotationOutcome::RotatedCa))
            .times(1)
            .return_const(());

        let rotator = rotator(store).with_hook(Arc::new(hook));
        rotator.refresh_cert_if_needed().await.unwrap();
        // Unchanged: the mock would panic on a second call
        rotator.refresh_cert_if_needed().await.unwrap();
    }

    #[tokio::test]
    async fn start_returns_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut config = config(dir.path());
        config.readiness_backoff = fast(500);
        let rotator = CertRotator::new(config, store, RotationMetrics::from_global());

        let stop = CancellationToken::new();
        stop.cancel();
        rotator.start(stop).await.unwrap();
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "condition never held");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Story: the CA is clobbered after bootstrap; the next periodic check
    /// regenerates it without a restart.
    #[tokio::test]
    async fn periodic_check_rotates_corrupted_ca() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut config = config(dir.path());
        config.check_period = Duration::from_millis(100);
        config.readiness_backoff = fast(5000);
        let rotator = Arc::new(CertRotator::new(
            config,
            store.clone(),
            RotationMetrics::from_global(),
        ));

        let stop = CancellationToken::new();
        let control_loop = tokio::spawn({
            let (rotator, stop) = (rotator.clone(), stop.clone());
            async move { rotator.start(stop).await }
        });

        eventually(|| store.secret_writes() == 1).await;
        let mut secret = store.secret(&key()).unwrap();
        if let Some(data) = secret.data.as_mut() {
            data.insert(CA_CERT_KEY.to_string(), ByteString(b"junk".to_vec()));
        }
        store.put_secret(&key(), secret);

        eventually(|| store.secret_writes() == 2).await;
        let ca = stored(&store, CA_CERT_KEY);
        let ca_key = stored(&store, CA_KEY_KEY);
        assert!(validate(&ca, &ca, &ca_key, CA_NAME, OffsetDateTime::now_utc()));

        stop.cancel();
        control_loop.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn periodic_failure_does_not_end_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let ca = certwarden_pki::generate_ca(CA_NAME, "certwarden").unwrap();
        let leaf = generate_leaf(DNS_NAME, &ca).unwrap();
        let mut valid = new_secret(&key());
        populate_secret(&mut valid, &ca, &leaf);

        let reads = Arc::new(AtomicUsize::new(0));
        let mut mock = MockClusterStore::new();
        mock.expect_get_secret().returning({
            let reads = reads.clone();
            move |_| {
                if reads.fetch_add(1, Ordering::SeqCst) == 0 {
                    Ok(Some(valid.clone()))
                } else {
                    Err(Error::internal("apiserver unavailable"))
                }
            }
        });

        let mut config = config(dir.path());
        config.check_period = Duration::from_millis(100);
        config.readiness_backoff = fast(5000);
        let rotator = Arc::new(CertRotator::new(
            config,
            Arc::new(mock),
            RotationMetrics::from_global(),
        ));

        let stop = CancellationToken::new();
        let control_loop = tokio::spawn({
            let (rotator, stop) = (rotator.clone(), stop.clone());
            async move { rotator.start(stop).await }
        });

        // Bootstrap read plus two failed periodic checks of three attempts each
        eventually(|| reads.load(Ordering::SeqCst) >= 7).await;
        assert!(!control_loop.is_finished());

        stop.cancel();
        control_loop.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn start_fails_when_certs_never_mount() {
        let dir = tempfile::tempdir().unwrap();
        let rotator = CertRotator::new(
            config(dir.path()),
            Arc::new(MemoryStore::new()),
            RotationMetrics::from_global(),
        );

        let err = rotator.start(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Terminal { .. }));
        assert!(err.to_string().contains("mount"));
    }

    #[tokio::test]
    async fn start_fails_when_ca_is_never_injected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SERVER_CERT_KEY), b"cert").unwrap();
        let rotator = CertRotator::new(
            config(dir.path()),
            Arc::new(MemoryStore::new()),
            RotationMetrics::from_global(),
        );

        let err = rotator.start(CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("inject"));
        assert!(!rotator.ready_signal().is_fired());
    }

    #[tokio::test]
    async fn start_fails_fast_when_bootstrap_fails() {
        let mut mock = MockClusterStore::new();
        mock.expect_get_secret()
            .returning(|_| Err(Error::internal("forbidden")));
        let rotator = rotator(Arc::new(mock));

        let err = rotator.start(CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("forbidden"));
        assert!(!rotator.ca_injected.load(Ordering::SeqCst));
    }
}
