//! Common types for certwarden: errors, retry, signals, and telemetry

#![deny(missing_docs)]

pub mod error;
pub mod metrics;
pub mod retry;
pub mod signal;
pub mod telemetry;

pub use error::Error;
pub use metrics::RotationMetrics;
pub use retry::{poll_with_backoff, retry_with_backoff, RetryConfig};
pub use signal::Signal;

use std::time::Duration;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Secret entry holding the PEM CA certificate
pub const CA_CERT_KEY: &str = "ca.crt";

/// Secret entry holding the PEM CA private key
pub const CA_KEY_KEY: &str = "ca.key";

/// Secret entry holding the PEM serving certificate
pub const SERVER_CERT_KEY: &str = "tls.crt";

/// Secret entry holding the PEM serving private key
pub const SERVER_KEY_KEY: &str = "tls.key";

/// How often the rotator re-checks certificate validity (12 hours)
pub const ROTATION_CHECK_PERIOD: Duration = Duration::from_secs(12 * 60 * 60);

/// Field manager / user agent name for API writes
pub const FIELD_MANAGER: &str = "certwarden";
