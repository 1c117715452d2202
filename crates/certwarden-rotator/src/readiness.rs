//! Readiness pollers
//!
//! Two background tasks gate the external ready signal:
//!
//! - the mount poller waits for the serving certificate to appear on disk,
//!   firing `mounted` on success or `unmountable` when the backoff runs out
//! - the injection poller waits for `mounted`, then for the reconciler's
//!   "CA injected" flag, firing `ready` or `injection_failed`
//!
//! Each signal is fired at most once. The control loop watches the two
//! failure signals.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info};

use certwarden_common::{poll_with_backoff, RetryConfig, RotationMetrics, Signal};

/// One-shot signals shared by the pollers and the control loop
#[derive(Debug, Clone, Default)]
pub struct ReadinessSignals {
    /// Serving certificate exists on disk
    pub mounted: Signal,
    /// Serving certificate never appeared
    pub unmountable: Signal,
    /// CA was never injected after mounting
    pub injection_failed: Signal,
    /// Certificates are mounted and the CA is injected
    pub ready: Signal,
}

/// Poll for `cert_file` until it exists or `backoff` is exhausted
pub async fn ensure_certs_mounted(
    cert_file: PathBuf,
    backoff: RetryConfig,
    signals: ReadinessSignals,
) {
    let mounted = poll_with_backoff(&backoff, "certs_mounted", || {
        let cert_file = cert_file.clone();
        async move { tokio::fs::metadata(&cert_file).await.is_ok() }
    })
    .await;

    if mounted {
        info!(path = %cert_file.display(), "certs are mounted");
        signals.mounted.fire();
    } else {
        error!(path = %cert_file.display(), "max retries for checking certs existence");
        signals.unmountable.fire();
    }
}

/// Once mounted, poll `ca_injected` until it is set or `backoff` is exhausted
pub async fn ensure_ready(
    ca_injected: Arc<AtomicBool>,
    backoff: RetryConfig,
    signals: ReadinessSignals,
    metrics: RotationMetrics,
) {
    signals.mounted.fired().await;

    let injected = poll_with_backoff(&backoff, "ca_injected", || {
        let injected = ca_injected.load(Ordering::SeqCst);
        async move { injected }
    })
    .await;

    if injected {
        info!("CA certs are injected to webhooks");
        metrics.set_ready(true);
        signals.ready.fire();
    } else {
        error!("max retries for checking CA injection");
        signals.injection_failed.fire();
    }
}
