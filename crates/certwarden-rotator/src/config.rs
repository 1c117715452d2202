//! Rotator configuration

use std::path::PathBuf;
use std::time::Duration;

use certwarden_common::{Error, Result, RetryConfig, ROTATION_CHECK_PERIOD, SERVER_CERT_KEY};
use certwarden_pki::DEFAULT_LOOKAHEAD;

use crate::store::SecretKey;
use crate::webhook::WebhookInfo;

/// Everything the rotator and reconciler need to know about their environment
#[derive(Debug, Clone)]
pub struct RotatorConfig {
    /// Secret holding the CA and serving certificate
    pub secret_key: SecretKey,
    /// Directory the Secret is mounted into
    pub cert_dir: PathBuf,
    /// CA common name (also its DNS SAN)
    pub ca_name: String,
    /// CA organization
    pub ca_organization: String,
    /// DNS name the serving certificate is issued for
    pub dns_name: String,
    /// Consumers that must carry the CA bundle
    pub webhooks: Vec<WebhookInfo>,
    /// Exit the process after each Secret write so it restarts on fresh mounts
    pub restart_on_refresh: bool,
    /// Interval between rotation checks
    pub check_period: Duration,
    /// How far ahead certificates must remain valid
    pub lookahead: time::Duration,
    /// Backoff for a single rotation check
    pub refresh_backoff: RetryConfig,
    /// Backoff for the mount and injection pollers
    pub readiness_backoff: RetryConfig,
}

impl RotatorConfig {
    /// Create a config with default timing
    pub fn new(
        secret_key: SecretKey,
        cert_dir: impl Into<PathBuf>,
        ca_name: impl Into<String>,
        ca_organization: impl Into<String>,
        dns_name: impl Into<String>,
    ) -> Self {
        Self {
            secret_key,
            cert_dir: cert_dir.into(),
            ca_name: ca_name.into(),
            ca_organization: ca_organization.into(),
            dns_name: dns_name.into(),
            webhooks: Vec::new(),
            restart_on_refresh: false,
            check_period: ROTATION_CHECK_PERIOD,
            lookahead: DEFAULT_LOOKAHEAD,
            refresh_backoff: RetryConfig::refresh(),
            readiness_backoff: RetryConfig::readiness(),
        }
    }

    /// Add consumers
    pub fn with_webhooks(mut self, webhooks: impl IntoIterator<Item = WebhookInfo>) -> Self {
        self.webhooks.extend(webhooks);
        self
    }

    /// Path of the mounted serving certificate
    pub fn cert_file(&self) -> PathBuf {
        self.cert_dir.join(SERVER_CERT_KEY)
    }

    /// Reject configurations that could never produce a usable certificate
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("secret namespace", &self.secret_key.namespace),
            ("secret name", &self.secret_key.name),
            ("CA name", &self.ca_name),
            ("CA organization", &self.ca_organization),
            ("DNS name", &self.dns_name),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(Error::internal_with_context(
                    "config",
                    format!("{} must not be empty", field),
                ));
            }
        }
        if self.check_period.is_zero() {
            return Err(Error::internal_with_context(
                "config",
                "rotation check period must be positive",
            ));
        }
        Ok(())
    }
}
