//! Row-level policies and the in-process data tier that enforces them

use super::{AuthenticatedCaller, PrivilegeCheck};
use crate::config::GatewaySeed;
use crate::engine::MetricsCollector;
use crate::error::{AuthzError, Result};
use crate::resolver::{EntitlementStore, RoleStore};
use crate::types::{PrincipalId, Role, SubscriptionRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Privileged operations the data tier guards
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DataOperation {
    /// Read a principal's latest subscription record
    ReadSubscription { target: PrincipalId },
    /// Set or clear another principal's blocked-until instant
    UpdateBlockedUntil {
        target: PrincipalId,
        until: Option<DateTime<Utc>>,
    },
    /// Toggle a payment gateway's activation flag
    SetGatewayActive { gateway_id: String, active: bool },
    GrantRole { target: PrincipalId, role: Role },
    RevokeRole { target: PrincipalId, role: Role },
    /// Append a subscription record on a principal's behalf
    RecordSubscription { record: SubscriptionRecord },
}

impl DataOperation {
    pub fn name(&self) -> &'static str {
        match self {
            DataOperation::ReadSubscription { .. } => "read_subscription",
            DataOperation::UpdateBlockedUntil { .. } => "update_blocked_until",
            DataOperation::SetGatewayActive { .. } => "set_gateway_active",
            DataOperation::GrantRole { .. } => "grant_role",
            DataOperation::RevokeRole { .. } => "revoke_role",
            DataOperation::RecordSubscription { .. } => "record_subscription",
        }
    }
}

/// Request body as submitted by a client
///
/// `claims` is whatever else the client sent. Policies never read it.
#[derive(Debug, Clone, Deserialize)]
pub struct DataRequest {
    pub operation: DataOperation,
    #[serde(default)]
    pub claims: serde_json::Map<String, serde_json::Value>,
}

impl From<DataOperation> for DataRequest {
    fn from(operation: DataOperation) -> Self {
        Self {
            operation,
            claims: serde_json::Map::new(),
        }
    }
}

/// Row policy attached to an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowPolicy {
    /// The row's owner, or an admin
    OwnerOrAdmin(PrincipalId),
    /// Admins only
    AdminOnly,
}

impl RowPolicy {
    pub fn for_operation(operation: &DataOperation) -> Self {
        match operation {
            DataOperation::ReadSubscription { target } => RowPolicy::OwnerOrAdmin(target.clone()),
            // Gateway activation uses the same admin predicate as every other write
            DataOperation::SetGatewayActive { .. }
            | DataOperation::UpdateBlockedUntil { .. }
            | DataOperation::GrantRole { .. }
            | DataOperation::RevokeRole { .. }
            | DataOperation::RecordSubscription { .. } => RowPolicy::AdminOnly,
        }
    }

    pub async fn permits(
        &self,
        check: &dyn PrivilegeCheck,
        caller: &AuthenticatedCaller,
    ) -> Result<bool> {
        match self {
            RowPolicy::OwnerOrAdmin(owner) if owner == caller.principal_id() => Ok(true),
            RowPolicy::OwnerOrAdmin(_) | RowPolicy::AdminOnly => {
                check
                    .has_role(caller, caller.principal_id(), Role::Admin.as_str())
                    .await
            }
        }
    }
}

/// Payment gateway configuration row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentGateway {
    pub id: String,
    pub name: String,
    pub is_active: bool,
}

/// Result of an authorized operation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DataOutcome {
    Subscription(Option<SubscriptionRecord>),
    /// Whether the operation changed anything (grant/revoke)
    Changed(bool),
    Gateway(PaymentGateway),
    Done,
}

/// In-process data tier: checks the row policy, then applies the operation
pub struct DataTier {
    check: Arc<dyn PrivilegeCheck>,
    roles: Arc<dyn RoleStore>,
    entitlements: Arc<dyn EntitlementStore>,
    gateways: RwLock<HashMap<String, PaymentGateway>>,
    metrics: Option<MetricsCollector>,
}

impl DataTier {
    pub fn new(
        check: Arc<dyn PrivilegeCheck>,
        roles: Arc<dyn RoleStore>,
        entitlements: Arc<dyn EntitlementStore>,
    ) -> Self {
        Self {
            check,
            roles,
            entitlements,
            gateways: RwLock::new(HashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Service-side setup; not reachable through [`Self::execute`]
    pub async fn register_gateway(&self, id: impl Into<String>, name: impl Into<String>) {
        let id = id.into();
        self.gateways.write().await.insert(
            id.clone(),
            PaymentGateway {
                id,
                name: name.into(),
                is_active: false,
            },
        );
    }

    /// Register every configured gateway, inactive
    pub async fn seed_gateways(&self, seeds: &[GatewaySeed]) {
        for seed in seeds {
            self.register_gateway(seed.id.as_str(), seed.name.as_str()).await;
        }
        debug!("Seeded {} payment gateway(s)", seeds.len());
    }

    pub async fn gateway(&self, id: &str) -> Option<PaymentGateway> {
        self.gateways.read().await.get(id).cloned()
    }

    /// Execute a client request. Payload claims are ignored.
    pub async fn execute(
        &self,
        caller: &AuthenticatedCaller,
        request: DataRequest,
    ) -> Result<DataOutcome> {
        if !request.claims.is_empty() {
            debug!(
                "Ignoring {} client claim(s) on {}",
                request.claims.len(),
                request.operation.name()
            );
        }
        self.execute_operation(caller, request.operation).await
    }

    pub async fn execute_operation(
        &self,
        caller: &AuthenticatedCaller,
        operation: DataOperation,
    ) -> Result<DataOutcome> {
        let policy = RowPolicy::for_operation(&operation);

        let permitted = match policy.permits(self.check.as_ref(), caller).await {
            Ok(permitted) => permitted,
            Err(e) => {
                // Fail closed; the caller only learns that it was refused
                warn!("Privilege check errored for {}: {}", operation.name(), e);
                false
            }
        };

        if !permitted {
            warn!(
                "Rejected {} by {} under {:?}",
                operation.name(),
                caller.principal_id(),
                policy
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_privilege_rejection();
            }
            return Err(AuthzError::Forbidden);
        }

        self.apply(operation).await
    }

    async fn apply(&self, operation: DataOperation) -> Result<DataOutcome> {
        match operation {
            DataOperation::ReadSubscription { target } => Ok(DataOutcome::Subscription(
                self.entitlements.latest_for(&target).await?,
            )),
            DataOperation::UpdateBlockedUntil { target, until } => {
                self.entitlements.set_blocked_until(&target, until).await?;
                Ok(DataOutcome::Done)
            }
            DataOperation::SetGatewayActive { gateway_id, active } => {
                let mut gateways = self.gateways.write().await;
                let gateway = gateways.get_mut(&gateway_id).ok_or_else(|| {
                    AuthzError::InvalidInput(format!("Unknown gateway: {}", gateway_id))
                })?;
                gateway.is_active = active;
                Ok(DataOutcome::Gateway(gateway.clone()))
            }
            DataOperation::GrantRole { target, role } => {
                Ok(DataOutcome::Changed(self.roles.grant(&target, role).await?))
            }
            DataOperation::RevokeRole { target, role } => {
                Ok(DataOutcome::Changed(self.roles.revoke(&target, &role).await?))
            }
            DataOperation::RecordSubscription { record } => {
                self.entitlements.record(record).await?;
                Ok(DataOutcome::Done)
            }
        }
    }
}
