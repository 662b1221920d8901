//! PostgreSQL role and entitlement stores

use super::{EntitlementStore, RoleStore};
use crate::error::{AuthzError, Result};
use crate::types::{PrincipalId, Role, RoleSet, SubscriptionRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use std::time::Duration;
use uuid::Uuid;

/// Open a connection pool with the service's standard limits
pub async fn connect(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(25)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(3))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
        .map_err(|e| AuthzError::DatabaseError(format!("Failed to connect to database: {}", e)))
}

/// Run the bundled migrations (tables, `has_role`, row-level policies)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| AuthzError::DatabaseError(format!("Migration failed: {}", e)))?;
    Ok(())
}

pub(crate) fn parse_principal_id(id: &PrincipalId) -> Result<Uuid> {
    Uuid::parse_str(id.as_str())
        .map_err(|e| AuthzError::InvalidInput(format!("Principal id is not a UUID: {}", e)))
}

/// Role assignments in `user_roles`
///
/// # Schema
///
/// ```sql
/// CREATE TABLE user_roles (
///     id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
///     user_id UUID NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
///     role TEXT NOT NULL,
///     created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
///     UNIQUE (user_id, role)
/// );
/// ```
pub struct PostgresRoleStore {
    pool: PgPool,
}

impl PostgresRoleStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RoleStore for PostgresRoleStore {
    async fn roles_for(&self, principal_id: &PrincipalId) -> Result<RoleSet> {
        let user_id = parse_principal_id(principal_id)?;

        let rows = sqlx::query("SELECT role FROM user_roles WHERE user_id = $1")
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| AuthzError::DatabaseError(format!("Failed to load roles: {}", e)))?;

        let mut roles = RoleSet::new();
        for row in rows {
            let token: String = row
                .try_get("role")
                .map_err(|e| AuthzError::DatabaseError(format!("Failed to read role: {}", e)))?;
            roles.insert(Role::from(token));
        }

        Ok(roles)
    }

    async fn grant(&self, principal_id: &PrincipalId, role: Role) -> Result<bool> {
        let user_id = parse_principal_id(principal_id)?;

        let result = sqlx::query(
            r#"
            INSERT INTO user_roles (user_id, role)
            VALUES ($1, $2)
            ON CONFLICT (user_id, role) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(role.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| AuthzError::DatabaseError(format!("Failed to grant role: {}", e)))?;

        Ok(result.rows_affected() == 1)
    }

    async fn revoke(&self, principal_id: &PrincipalId, role: &Role) -> Result<bool> {
        let user_id = parse_principal_id(principal_id)?;

        let result = sqlx::query("DELETE FROM user_roles WHERE user_id = $1 AND role = $2")
            .bind(user_id)
            .bind(role.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| AuthzError::DatabaseError(format!("Failed to revoke role: {}", e)))?;

        Ok(result.rows_affected() > 0)
    }
}

/// Subscription records in `subscriptions`, blocks in `profiles.blocked_until`
pub struct PostgresEntitlementStore {
    pool: PgPool,
}

impl PostgresEntitlementStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntitlementStore for PostgresEntitlementStore {
    async fn latest_for(&self, principal_id: &PrincipalId) -> Result<Option<SubscriptionRecord>> {
        let user_id = parse_principal_id(principal_id)?;

        let row = sqlx::query(
            r#"
            SELECT s.plan, s.status, s.payment_status, s.expires_at,
                   s.appraisals_used, s.appraisal_quota, s.updated_at,
                   p.blocked_until
            FROM subscriptions s
            LEFT JOIN profiles p ON p.id = s.user_id
            WHERE s.user_id = $1
            ORDER BY s.updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AuthzError::DatabaseError(format!("Failed to load subscription: {}", e)))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let column_err =
            |e: sqlx::Error| AuthzError::DatabaseError(format!("Failed to read subscription: {}", e));

        let status: String = row.try_get("status").map_err(column_err)?;
        let payment: String = row.try_get("payment_status").map_err(column_err)?;
        let used: i32 = row.try_get("appraisals_used").map_err(column_err)?;
        let quota: Option<i32> = row.try_get("appraisal_quota").map_err(column_err)?;

        Ok(Some(SubscriptionRecord {
            principal_id: principal_id.clone(),
            plan: row.try_get("plan").map_err(column_err)?,
            status: status.parse()?,
            payment: payment.parse()?,
            expires_at: row.try_get("expires_at").map_err(column_err)?,
            blocked_until: row.try_get("blocked_until").map_err(column_err)?,
            appraisals_used: used.max(0) as u32,
            appraisal_quota: quota.map(|q| q.max(0) as u32),
            updated_at: row.try_get("updated_at").map_err(column_err)?,
        }))
    }

    async fn record(&self, record: SubscriptionRecord) -> Result<()> {
        let user_id = parse_principal_id(&record.principal_id)?;
        let status = serde_json::to_value(record.status)
            .map_err(|e| AuthzError::Internal(e.to_string()))?;
        let payment = serde_json::to_value(record.payment)
            .map_err(|e| AuthzError::Internal(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                user_id, plan, status, payment_status, expires_at,
                appraisals_used, appraisal_quota, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(user_id)
        .bind(&record.plan)
        .bind(status.as_str().unwrap_or_default())
        .bind(payment.as_str().unwrap_or_default())
        .bind(record.expires_at)
        .bind(record.appraisals_used as i32)
        .bind(record.appraisal_quota.map(|q| q as i32))
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AuthzError::DatabaseError(format!("Failed to record subscription: {}", e)))?;

        Ok(())
    }

    async fn set_blocked_until(
        &self,
        principal_id: &PrincipalId,
        until: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let user_id = parse_principal_id(principal_id)?;

        sqlx::query("UPDATE profiles SET blocked_until = $2, updated_at = NOW() WHERE id = $1")
            .bind(user_id)
            .bind(until)
            .execute(&self.pool)
            .await
            .map_err(|e| AuthzError::DatabaseError(format!("Failed to update block: {}", e)))?;

        Ok(())
    }
}
