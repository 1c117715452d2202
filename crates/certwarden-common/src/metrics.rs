//! Metrics for certificate rotation and CA bundle injection
//!
//! Instruments are owned by a [`RotationMetrics`] value built from a
//! [`Meter`] and handed to the rotator and reconciler. Nothing is registered
//! at load time; tests can build one from a no-op meter.

use std::time::Instant;

use opentelemetry::metrics::{Counter, Gauge, Histogram, Meter};
use opentelemetry::KeyValue;

/// Instrumentation scope name for certwarden meters
pub const METER_NAME: &str = "certwarden";

/// Which artifact a rotation replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationScope {
    /// New CA and new leaf
    Ca,
    /// New leaf signed by the existing CA
    Leaf,
}

impl RotationScope {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ca => "ca",
            Self::Leaf => "leaf",
        }
    }
}

/// When a rotation error happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPhase {
    /// Synchronous startup rotation
    Bootstrap,
    /// Ticker-driven rotation check
    Periodic,
}

impl RotationPhase {
    /// Convert to label value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::Periodic => "periodic",
        }
    }
}

/// Rotation and injection instruments
#[derive(Clone)]
pub struct RotationMetrics {
    rotations: Counter<u64>,
    rotation_errors: Counter<u64>,
    injections: Counter<u64>,
    reconcile_duration: Histogram<f64>,
    ready: Gauge<u64>,
}

impl RotationMetrics {
    /// Build instruments on the given meter
    pub fn new(meter: &Meter) -> Self {
        Self {
            rotations: meter
                .u64_counter("certwarden_cert_rotations_total")
                .with_description("Total number of certificate rotations by scope")
                .with_unit("{rotations}")
                .build(),
            rotation_errors: meter
                .u64_counter("certwarden_rotation_errors_total")
                .with_description("Total number of rotation attempts that exhausted retries")
                .with_unit("{errors}")
                .build(),
            injections: meter
                .u64_counter("certwarden_ca_injections_total")
                .with_description("Total number of CA bundle injection passes by result")
                .with_unit("{passes}")
                .build(),
            reconcile_duration: meter
                .f64_histogram("certwarden_reconcile_duration_seconds")
                .with_description("Duration of CA bundle reconciliation in seconds")
                .with_unit("s")
                .build(),
            ready: meter
                .u64_gauge("certwarden_ready")
                .with_description("1 once certificates are mounted and the CA is injected")
                .build(),
        }
    }

    /// Build instruments on the globally installed meter provider
    pub fn from_global() -> Self {
        Self::new(&opentelemetry::global::meter(METER_NAME))
    }

    /// Record a completed rotation
    pub fn record_rotation(&self, scope: RotationScope) {
        self.rotations
            .add(1, &[KeyValue::new("scope", scope.as_str())]);
    }

    /// Record a rotation that failed after exhausting retries
    pub fn record_rotation_error(&self, phase: RotationPhase) {
        self.rotation_errors
            .add(1, &[KeyValue::new("phase", phase.as_str())]);
    }

    /// Set the readiness gauge
    pub fn set_ready(&self, ready: bool) {
        self.ready.record(u64::from(ready), &[]);
    }

    /// Start timing a reconciliation pass
    pub fn reconcile_timer(&self) -> ReconcileTimer {
        ReconcileTimer {
            metrics: self.clone(),
            start: Instant::now(),
        }
    }
}

impl std::fmt::Debug for RotationMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotationMetrics").finish_non_exhaustive()
    }
}

/// Record a reconciliation pass with timing
pub struct ReconcileTimer {
    metrics: RotationMetrics,
    start: Instant,
}

impl ReconcileTimer {
    /// Record successful completion
    pub fn success(self) {
        self.complete("success");
    }

    /// Record error completion
    pub fn error(self) {
        self.complete("error");
    }

    fn complete(self, result: &'static str) {
        let duration = self.start.elapsed().as_secs_f64();
        let labels = [KeyValue::new("result", result)];
        self.metrics.reconcile_duration.record(duration, &labels);
        self.metrics.injections.add(1, &labels);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // No provider is installed in unit tests, so the global meter is a no-op
    fn metrics() -> RotationMetrics {
        RotationMetrics::from_global()
    }

    #[test]
    fn test_label_values() {
        assert_eq!(RotationScope::Ca.as_str(), "ca");
        assert_eq!(RotationScope::Leaf.as_str(), "leaf");
        assert_eq!(RotationPhase::Bootstrap.as_str(), "bootstrap");
        assert_eq!(RotationPhase::Periodic.as_str(), "periodic");
    }

    #[test]
    fn test_recording_does_not_panic() {
        let metrics = metrics();
        metrics.record_rotation(RotationScope::Ca);
        metrics.record_rotation_error(RotationPhase::Periodic);
        metrics.set_ready(true);
        metrics.reconcile_timer().success();
        metrics.reconcile_timer().error();
    }
}
