//! In-memory role and entitlement stores

use super::{EntitlementStore, RoleStore};
use crate::error::Result;
use crate::types::{PrincipalId, Role, RoleSet, SubscriptionRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory role assignment table
#[derive(Clone, Default)]
pub struct InMemoryRoleStore {
    assignments: Arc<RwLock<HashMap<PrincipalId, RoleSet>>>,
}

impl InMemoryRoleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RoleStore for InMemoryRoleStore {
    async fn roles_for(&self, principal_id: &PrincipalId) -> Result<RoleSet> {
        let assignments = self.assignments.read().await;
        Ok(assignments.get(principal_id).cloned().unwrap_or_default())
    }

    async fn grant(&self, principal_id: &PrincipalId, role: Role) -> Result<bool> {
        let mut assignments = self.assignments.write().await;
        Ok(assignments.entry(principal_id.clone()).or_default().insert(role))
    }

    async fn revoke(&self, principal_id: &PrincipalId, role: &Role) -> Result<bool> {
        let mut assignments = self.assignments.write().await;
        Ok(assignments
            .get_mut(principal_id)
            .map(|roles| roles.remove(role))
            .unwrap_or(false))
    }
}

/// In-memory subscription history and profile blocks
#[derive(Clone, Default)]
pub struct InMemoryEntitlementStore {
    records: Arc<RwLock<HashMap<PrincipalId, Vec<SubscriptionRecord>>>>,
    blocks: Arc<RwLock<HashMap<PrincipalId, DateTime<Utc>>>>,
}

impl InMemoryEntitlementStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntitlementStore for InMemoryEntitlementStore {
    async fn latest_for(&self, principal_id: &PrincipalId) -> Result<Option<SubscriptionRecord>> {
        let records = self.records.read().await;
        let latest = records
            .get(principal_id)
            .and_then(|history| history.iter().max_by_key(|r| r.updated_at))
            .cloned();

        let Some(mut latest) = latest else {
            return Ok(None);
        };

        // The profile block overrides whatever the billing record carried
        if let Some(until) = self.blocks.read().await.get(principal_id) {
            latest.blocked_until = Some(*until);
        }

        Ok(Some(latest))
    }

    async fn record(&self, record: SubscriptionRecord) -> Result<()> {
        let mut records = self.records.write().await;
        records
            .entry(record.principal_id.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn set_blocked_until(
        &self,
        principal_id: &PrincipalId,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut blocks = self.blocks.write().await;
        match until {
            Some(until) => {
                blocks.insert(principal_id.clone(), until);
            }
            None => {
                blocks.remove(principal_id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PaymentState, SubscriptionStatus};
    use chrono::Duration;

    fn record_at(id: &str, status: SubscriptionStatus, at: DateTime<Utc>) -> SubscriptionRecord {
        SubscriptionRecord {
            principal_id: PrincipalId::new(id),
            plan: "pro".into(),
            status,
            payment: PaymentState::Paid,
            expires_at: None,
            blocked_until: None,
            appraisals_used: 0,
            appraisal_quota: None,
            updated_at: at,
        }
    }

    #[tokio::test]
    async fn test_grant_is_idempotent() {
        let store = InMemoryRoleStore::new();
        let id = PrincipalId::new("u-1");

        assert!(store.grant(&id, Role::Admin).await.unwrap());
        assert!(!store.grant(&id, Role::Admin).await.unwrap());
        assert_eq!(store.roles_for(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_revoke() {
        let store = InMemoryRoleStore::new();
        let id = PrincipalId::new("u-1");

        assert!(!store.revoke(&id, &Role::Admin).await.unwrap());
        store.grant(&id, Role::Admin).await.unwrap();
        store.grant(&id, Role::User).await.unwrap();
        assert!(store.revoke(&id, &Role::Admin).await.unwrap());

        let roles = store.roles_for(&id).await.unwrap();
        assert!(!roles.is_admin());
        assert!(roles.contains(&Role::User));
    }

    #[tokio::test]
    async fn test_unknown_principal_has_empty_roles() {
        let store = InMemoryRoleStore::new();
        assert!(store.roles_for(&PrincipalId::new("nobody")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_latest_record_wins() {
        let store = InMemoryEntitlementStore::new();
        let now = Utc::now();

        // Inserted out of order on purpose
        store
            .record(record_at("u-1", SubscriptionStatus::Canceled, now))
            .await
            .unwrap();
        store
            .record(record_at("u-1", SubscriptionStatus::Active, now - Duration::days(30)))
            .await
            .unwrap();

        let latest = store.latest_for(&PrincipalId::new("u-1")).await.unwrap().unwrap();
        assert_eq!(latest.status, SubscriptionStatus::Canceled);
    }

    #[tokio::test]
    async fn test_block_overlay() {
        let store = InMemoryEntitlementStore::new();
        let id = PrincipalId::new("u-1");
        let now = Utc::now();
        store
            .record(record_at("u-1", SubscriptionStatus::Active, now))
            .await
            .unwrap();

        let until = now + Duration::days(7);
        store.set_blocked_until(&id, Some(until)).await.unwrap();
        assert_eq!(store.latest_for(&id).await.unwrap().unwrap().blocked_until, Some(until));

        store.set_blocked_until(&id, None).await.unwrap();
        assert_eq!(store.latest_for(&id).await.unwrap().unwrap().blocked_until, None);
    }
}
