//! Data-tier privilege check
//!
//! The backstop behind the presentation-tier guards. Every privileged data operation is
//! re-authorized here against the persisted role assignments of the caller the trust
//! boundary authenticated, so a bypassed or forged client gains nothing.
//!
//! Results are never cached: each call re-reads the assignment store.

pub mod boundary;
pub mod policy;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use boundary::{AuthenticatedCaller, TrustBoundary};
pub use policy::{DataOperation, DataOutcome, DataRequest, DataTier, PaymentGateway, RowPolicy};
#[cfg(feature = "postgres")]
pub use postgres::{PostgresDataTier, PostgresPrivilegeCheck};

use crate::error::Result;
use crate::resolver::RoleStore;
use crate::types::{PrincipalId, Role};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// `has_role` predicate evaluated inside the trust boundary
#[async_trait]
pub trait PrivilegeCheck: Send + Sync {
    /// Whether `principal_id` holds `role`
    ///
    /// Answers `false` for any `principal_id` other than the authenticated caller's.
    async fn has_role(
        &self,
        caller: &AuthenticatedCaller,
        principal_id: &PrincipalId,
        role: &str,
    ) -> Result<bool>;
}

/// Privilege check backed directly by a [`RoleStore`]
#[derive(Clone)]
pub struct StorePrivilegeCheck {
    store: Arc<dyn RoleStore>,
}

impl StorePrivilegeCheck {
    pub fn new(store: Arc<dyn RoleStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl PrivilegeCheck for StorePrivilegeCheck {
    async fn has_role(
        &self,
        caller: &AuthenticatedCaller,
        principal_id: &PrincipalId,
        role: &str,
    ) -> Result<bool> {
        if principal_id != caller.principal_id() {
            warn!(
                "has_role called for {} by {}; answering false",
                principal_id,
                caller.principal_id()
            );
            return Ok(false);
        }

        let roles = self.store.roles_for(caller.principal_id()).await?;
        Ok(roles.contains(&Role::from(role)))
    }
}
