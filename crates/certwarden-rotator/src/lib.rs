//! Webhook serving-certificate rotation and CA bundle reconciliation
//!
//! [`CertRotator`] keeps a self-signed CA and a serving leaf valid inside a
//! Kubernetes Secret. [`WebhookReconciler`] copies the stored CA into every
//! declared webhook configuration and CRD conversion config. The two meet at
//! a single atomic "CA injected" flag, which the readiness pollers use to
//! fire the external ready signal.

#![deny(missing_docs)]

pub mod config;
pub mod inject;
#[cfg(any(test, feature = "testutil"))]
pub mod memory;
pub mod readiness;
pub mod reconciler;
pub mod rotator;
pub mod secret;
pub mod store;
pub mod webhook;

pub use config::RotatorConfig;
pub use inject::inject_ca_bundle;
pub use reconciler::{run_controller, WebhookReconciler};
pub use rotator::{CertRotator, ExitOnRotation, NoopHook, RotationHook, RotationOutcome};
pub use store::{ClusterStore, KubeStore, SecretKey};
pub use webhook::{WebhookInfo, WebhookKind};
