//! Prometheus-style counters for guard evaluations and privilege checks

use super::decision::DenyReason;
use super::guard::GuardState;
use parking_lot::RwLock;
use std::fmt::Write as _;
use std::sync::Arc;

/// Snapshot of the collected counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineMetrics {
    /// Total guard evaluations
    pub total_evaluations: u64,

    pub allowed: u64,

    pub pending: u64,

    /// Denials by reason
    pub denied_unauthenticated: u64,
    pub denied_insufficient_role: u64,
    pub denied_no_entitlement: u64,

    /// Session cache hits (evaluation served from cached resolutions)
    pub session_cache_hits: u64,

    /// Session cache misses (lookups issued)
    pub session_cache_misses: u64,

    /// Data-tier operations rejected by a row policy
    pub privilege_rejections: u64,
}

impl EngineMetrics {
    pub fn denied(&self) -> u64 {
        self.denied_unauthenticated + self.denied_insufficient_role + self.denied_no_entitlement
    }

    /// Calculate session cache hit rate
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.session_cache_hits + self.session_cache_misses;
        if total == 0 {
            0.0
        } else {
            self.session_cache_hits as f64 / total as f64
        }
    }
}

/// Thread-safe metrics collector
#[derive(Clone, Default)]
pub struct MetricsCollector {
    metrics: Arc<RwLock<EngineMetrics>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_state(&self, state: &GuardState) {
        let mut metrics = self.metrics.write();
        metrics.total_evaluations += 1;
        match state {
            GuardState::Allowed => metrics.allowed += 1,
            GuardState::Pending { .. } => metrics.pending += 1,
            GuardState::Denied { reason, .. } => match reason {
                DenyReason::Unauthenticated => metrics.denied_unauthenticated += 1,
                DenyReason::InsufficientRole => metrics.denied_insufficient_role += 1,
                DenyReason::NoEntitlement => metrics.denied_no_entitlement += 1,
            },
        }
    }

    pub fn record_cache_hit(&self) {
        self.metrics.write().session_cache_hits += 1;
    }

    pub fn record_cache_miss(&self) {
        self.metrics.write().session_cache_misses += 1;
    }

    pub fn record_privilege_rejection(&self) {
        self.metrics.write().privilege_rejections += 1;
    }

    pub fn snapshot(&self) -> EngineMetrics {
        self.metrics.read().clone()
    }

    /// Render counters in the Prometheus text exposition format
    pub fn render_prometheus(&self) -> String {
        let m = self.snapshot();
        let mut out = String::new();

        let _ = writeln!(out, "# HELP authz_guard_evaluations_total Guard chain evaluations by state");
        let _ = writeln!(out, "# TYPE authz_guard_evaluations_total counter");
        let _ = writeln!(out, "authz_guard_evaluations_total{{state=\"allowed\"}} {}", m.allowed);
        let _ = writeln!(out, "authz_guard_evaluations_total{{state=\"pending\"}} {}", m.pending);
        for (reason, count) in [
            (DenyReason::Unauthenticated, m.denied_unauthenticated),
            (DenyReason::InsufficientRole, m.denied_insufficient_role),
            (DenyReason::NoEntitlement, m.denied_no_entitlement),
        ] {
            let _ = writeln!(
                out,
                "authz_guard_evaluations_total{{state=\"denied\",reason=\"{}\"}} {}",
                reason, count
            );
        }

        let _ = writeln!(out, "# HELP authz_session_cache_total Session cache lookups");
        let _ = writeln!(out, "# TYPE authz_session_cache_total counter");
        let _ = writeln!(out, "authz_session_cache_total{{result=\"hit\"}} {}", m.session_cache_hits);
        let _ = writeln!(out, "authz_session_cache_total{{result=\"miss\"}} {}", m.session_cache_misses);

        let _ = writeln!(out, "# HELP authz_privilege_rejections_total Data-tier operations rejected");
        let _ = writeln!(out, "# TYPE authz_privilege_rejections_total counter");
        let _ = writeln!(out, "authz_privilege_rejections_total {}", m.privilege_rejections);

        out
    }
}
