//! Role and subscription resolution
//!
//! Resolvers turn a ready [`Principal`] into the two inputs the decision engine needs:
//! the principal's [`RoleSet`] and its [`Entitlement`]. Both are backed by async store
//! traits so the same resolver runs against the in-memory stores (tests, local dev) and
//! the Postgres stores (production).
//!
//! Resolvers never cache. Caching is owned by the session
//! ([`crate::session::SessionContext`]) so that invalidation on sign-out or refresh has a
//! single, explicit point.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::{InMemoryEntitlementStore, InMemoryRoleStore};
#[cfg(feature = "postgres")]
pub use postgres::{PostgresEntitlementStore, PostgresRoleStore};

use crate::error::{AuthzError, Result};
use crate::types::{Entitlement, Principal, PrincipalId, Role, RoleSet, SubscriptionRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// State of a single asynchronous lookup as seen by the guard chain
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution<T> {
    /// Lookup still in flight (or not started)
    Unresolved,
    /// Lookup settled with a value
    Resolved(T),
    /// Lookup failed; treated as "not yet provably permitted"
    Failed(String),
}

impl<T> Resolution<T> {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Resolved(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Resolution::Resolved(value) => Some(value),
            _ => None,
        }
    }
}

impl<T> From<Result<T>> for Resolution<T> {
    fn from(result: Result<T>) -> Self {
        match result {
            Ok(value) => Resolution::Resolved(value),
            Err(e) => Resolution::Failed(e.to_string()),
        }
    }
}

/// Persisted role assignments, at most one row per (principal, role)
#[async_trait]
pub trait RoleStore: Send + Sync {
    /// All roles currently assigned to the principal
    async fn roles_for(&self, principal_id: &PrincipalId) -> Result<RoleSet>;

    /// Assign a role; returns false if the assignment already existed
    async fn grant(&self, principal_id: &PrincipalId, role: Role) -> Result<bool>;

    /// Remove a role; returns false if it was not assigned
    async fn revoke(&self, principal_id: &PrincipalId, role: &Role) -> Result<bool>;
}

/// Persisted subscription records and administrative blocks
#[async_trait]
pub trait EntitlementStore: Send + Sync {
    /// Latest subscription record for the principal (latest `updated_at` wins)
    async fn latest_for(&self, principal_id: &PrincipalId) -> Result<Option<SubscriptionRecord>>;

    /// Append a subscription record (webhook-driven)
    async fn record(&self, record: SubscriptionRecord) -> Result<()>;

    /// Set or clear the principal's blocked-until instant
    async fn set_blocked_until(
        &self,
        principal_id: &PrincipalId,
        until: Option<DateTime<Utc>>,
    ) -> Result<()>;
}

/// Maps a principal to its assigned roles
#[derive(Clone)]
pub struct RoleResolver {
    store: Arc<dyn RoleStore>,
}

impl RoleResolver {
    pub fn new(store: Arc<dyn RoleStore>) -> Self {
        Self { store }
    }

    /// Resolve the principal's roles
    ///
    /// Anonymous principals hold no roles and are answered without a store query.
    /// Store failures are reported as [`AuthzError::Lookup`].
    pub async fn resolve(&self, principal: &Principal) -> Result<RoleSet> {
        if !principal.authenticated {
            return Ok(RoleSet::new());
        }

        let roles = self.store.roles_for(&principal.id).await.map_err(|e| {
            warn!("Role lookup failed for {}: {}", principal.id, e);
            AuthzError::Lookup(e.to_string())
        })?;

        debug!("Resolved {} role(s) for {}", roles.len(), principal.id);
        Ok(roles)
    }
}

/// Maps a principal to its entitlement
#[derive(Clone)]
pub struct SubscriptionResolver {
    store: Arc<dyn EntitlementStore>,
}

impl SubscriptionResolver {
    pub fn new(store: Arc<dyn EntitlementStore>) -> Self {
        Self { store }
    }

    /// Resolve the entitlement as of now
    ///
    /// When the caller already knows the principal's roles and they include admin, the
    /// entitlement is granted without touching billing data.
    pub async fn resolve(
        &self,
        principal: &Principal,
        known_roles: Option<&RoleSet>,
    ) -> Result<Entitlement> {
        self.resolve_at(principal, known_roles, Utc::now()).await
    }

    pub async fn resolve_at(
        &self,
        principal: &Principal,
        known_roles: Option<&RoleSet>,
        now: DateTime<Utc>,
    ) -> Result<Entitlement> {
        if !principal.authenticated {
            return Ok(Entitlement::none());
        }

        if known_roles.is_some_and(RoleSet::is_admin) {
            debug!("Admin exemption for {}, skipping billing lookup", principal.id);
            return Ok(Entitlement::admin_exempt());
        }

        let record = self.store.latest_for(&principal.id).await.map_err(|e| {
            warn!("Subscription lookup failed for {}: {}", principal.id, e);
            AuthzError::Lookup(e.to_string())
        })?;

        let entitlement = Entitlement::from_record(record.as_ref(), now);
        debug!("Entitlement for {}: active={}", principal.id, entitlement.active);
        Ok(entitlement)
    }
}
