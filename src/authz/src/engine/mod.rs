//! Access decision engine
//!
//! Ties the resolvers, the route table, and per-session caches together and turns a
//! navigation or action request into a [`GuardEvaluation`].
//!
//! # Architecture
//!
//! ```text
//! Request → RouteTable → GuardChain ─┐
//!                                    ├→ decide() per guard → GuardState
//! SessionContext (cached) ───────────┘
//!     ↑ miss
//! RoleResolver ∥ SubscriptionResolver         [Metrics]
//! ```

pub mod decision;
pub mod guard;
pub mod metrics;
pub mod routes;

pub use decision::{decide, DenyReason, Outcome, PendingCause, Verdict};
pub use guard::{Guard, GuardChain, GuardEvaluation, GuardState, RedirectTargets};
pub use metrics::{EngineMetrics, MetricsCollector};
pub use routes::{RouteAccess, RouteTable};

use crate::resolver::{EntitlementStore, RoleResolver, RoleStore, SubscriptionResolver};
use crate::session::SessionContext;
use crate::types::Principal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long cached role/entitlement resolutions stay valid within a session
    pub session_ttl: Duration,

    /// Redirect destinations per deny reason
    pub redirects: RedirectTargets,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(300),
            redirects: RedirectTargets::default(),
        }
    }
}

/// Presentation-tier access engine
pub struct AccessEngine {
    roles: RoleResolver,
    subscriptions: SubscriptionResolver,
    routes: RouteTable,
    config: EngineConfig,
    metrics: MetricsCollector,
}

impl AccessEngine {
    pub fn new(
        role_store: Arc<dyn RoleStore>,
        entitlement_store: Arc<dyn EntitlementStore>,
        routes: RouteTable,
        config: EngineConfig,
    ) -> Self {
        info!(
            "AccessEngine initialized with {} route rule(s), session_ttl={}s",
            routes.len(),
            config.session_ttl.as_secs()
        );

        Self {
            roles: RoleResolver::new(role_store),
            subscriptions: SubscriptionResolver::new(entitlement_store),
            routes,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    /// New session; `None` means the identity provider is still loading
    pub fn open_session(&self, principal: Option<Principal>) -> SessionContext {
        let mut session = SessionContext::new(self.config.session_ttl);
        if let Some(principal) = principal {
            session.set_identity(principal);
        }
        session
    }

    /// Guard a route, fetching roles and entitlement if the session cache is cold
    pub async fn guard_route(&self, session: &mut SessionContext, route: &str) -> GuardEvaluation {
        let chain = self.routes.chain_for(route);
        debug!("Guarding route '{}' with {} guard(s)", route, chain.guards().len());
        self.guard(session, &chain).await
    }

    /// Guard an arbitrary chain (actions, mutations)
    pub async fn guard(&self, session: &mut SessionContext, chain: &GuardChain) -> GuardEvaluation {
        if !chain.is_empty() {
            if session.needs_lookup() {
                self.metrics.record_cache_miss();
                session.load(&self.roles, &self.subscriptions).await;
            } else if session.principal().is_some_and(|p| p.authenticated) {
                self.metrics.record_cache_hit();
            }
        }

        self.evaluate_cached(session, chain)
    }

    /// Evaluate against whatever the session has cached, without lookups
    pub fn evaluate_cached(&self, session: &SessionContext, chain: &GuardChain) -> GuardEvaluation {
        let evaluation = session.evaluate(chain, &self.config.redirects);
        self.metrics.record_state(&evaluation.state);

        if let GuardState::Denied { reason, redirect } = &evaluation.state {
            info!(
                "Access denied ({}) for {}, redirecting to {}",
                reason,
                session.principal().map(|p| p.id.as_str()).unwrap_or("<loading>"),
                redirect
            );
        }

        evaluation
    }

    pub fn role_resolver(&self) -> &RoleResolver {
        &self.roles
    }

    pub fn subscription_resolver(&self) -> &SubscriptionResolver {
        &self.subscriptions
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{InMemoryEntitlementStore, InMemoryRoleStore};

    fn engine() -> AccessEngine {
        AccessEngine::new(
            Arc::new(InMemoryRoleStore::new()),
            Arc::new(InMemoryEntitlementStore::new()),
            RouteTable::appraisal_defaults(),
            EngineConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_engine_creation() {
        let engine = engine();
        assert!(!engine.routes().is_empty());
        assert_eq!(engine.metrics().snapshot(), EngineMetrics::default());
    }

    #[tokio::test]
    async fn test_cache_hit_on_reentry() {
        let engine = engine();
        let mut session =
            engine.open_session(Some(Principal::authenticated("u-1", "u@example.com")));

        let first = engine.guard_route(&mut session, "/dashboard").await;
        let second = engine.guard_route(&mut session, "/dashboard").await;
        assert!(first.state.is_allowed());
        assert_eq!(first, second);

        let metrics = engine.metrics().snapshot();
        assert_eq!(metrics.session_cache_misses, 1);
        assert_eq!(metrics.session_cache_hits, 1);
        assert_eq!(metrics.allowed, 2);
    }

    #[tokio::test]
    async fn test_public_route_needs_no_lookup() {
        let engine = engine();
        let mut session = engine.open_session(None);

        let eval = engine.guard_route(&mut session, "/").await;
        assert!(eval.state.is_allowed());
        assert_eq!(engine.metrics().snapshot().session_cache_misses, 0);
    }
}
