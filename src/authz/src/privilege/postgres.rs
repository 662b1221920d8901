//! PostgreSQL privilege check and data tier
//!
//! Every call opens a transaction, drops to the `app_authenticated` role so row-level
//! security applies, and pins `app.current_principal` to the caller the trust boundary
//! authenticated. `public.has_role` and the RLS policies read that setting; nothing in
//! the request payload reaches them.

use super::policy::{DataOperation, DataOutcome, DataRequest, PaymentGateway, RowPolicy};
use super::{AuthenticatedCaller, PrivilegeCheck};
use crate::engine::MetricsCollector;
use crate::error::{AuthzError, Result};
use crate::resolver::postgres::parse_principal_id;
use crate::types::{PrincipalId, Role};
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Row, Transaction};
use tracing::warn;

const INSUFFICIENT_PRIVILEGE: &str = "42501";

fn db_error(context: &str, e: sqlx::Error) -> AuthzError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some(INSUFFICIENT_PRIVILEGE) {
            return AuthzError::Forbidden;
        }
    }
    AuthzError::DatabaseError(format!("{}: {}", context, e))
}

async fn caller_transaction(
    pool: &PgPool,
    caller: &AuthenticatedCaller,
) -> Result<Transaction<'static, Postgres>> {
    // Validates the id shape before it reaches the setting
    parse_principal_id(caller.principal_id())?;

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| db_error("Failed to begin transaction", e))?;

    sqlx::query("SET LOCAL ROLE app_authenticated")
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to assume caller role", e))?;

    sqlx::query("SELECT set_config('app.current_principal', $1, true)")
        .bind(caller.principal_id().as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("Failed to pin caller", e))?;

    Ok(tx)
}

/// `has_role` evaluated by the database function of the same name
#[derive(Clone)]
pub struct PostgresPrivilegeCheck {
    pool: PgPool,
}

impl PostgresPrivilegeCheck {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PrivilegeCheck for PostgresPrivilegeCheck {
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

        let user_id = parse_principal_id(principal_id)?;
        let mut tx = caller_transaction(&self.pool, caller).await?;

        let allowed: bool = sqlx::query_scalar("SELECT public.has_role($1, $2)")
            .bind(user_id)
            .bind(role)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| db_error("has_role failed", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit", e))?;

        Ok(allowed)
    }
}

/// Data tier backed by Postgres row-level security
pub struct PostgresDataTier {
    pool: PgPool,
    metrics: Option<MetricsCollector>,
}

impl PostgresDataTier {
    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn execute(
        &self,
        caller: &AuthenticatedCaller,
        request: DataRequest,
    ) -> Result<DataOutcome> {
        self.execute_operation(caller, request.operation).await
    }

    pub async fn execute_operation(
        &self,
        caller: &AuthenticatedCaller,
        operation: DataOperation,
    ) -> Result<DataOutcome> {
        let mut tx = caller_transaction(&self.pool, caller).await?;

        let permitted = match RowPolicy::for_operation(&operation) {
            RowPolicy::OwnerOrAdmin(owner) if &owner == caller.principal_id() => true,
            _ => sqlx::query_scalar::<_, bool>(
                "SELECT public.has_role(public.current_principal(), $1)",
            )
            .bind(Role::Admin.as_str())
            .fetch_one(&mut *tx)
            .await
            .unwrap_or_else(|e| {
                warn!("Privilege check errored for {}: {}", operation.name(), e);
                false
            }),
        };

        if !permitted {
            return Err(self.reject(caller, &operation));
        }

        let outcome = match Self::apply(&mut tx, &operation).await {
            Err(AuthzError::Forbidden) => return Err(self.reject(caller, &operation)),
            other => other?,
        };

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit", e))?;

        Ok(outcome)
    }

    fn reject(&self, caller: &AuthenticatedCaller, operation: &DataOperation) -> AuthzError {
        warn!("Rejected {} by {}", operation.name(), caller.principal_id());
        if let Some(metrics) = &self.metrics {
            metrics.record_privilege_rejection();
        }
        AuthzError::Forbidden
    }

    async fn apply(
        tx: &mut Transaction<'static, Postgres>,
        operation: &DataOperation,
    ) -> Result<DataOutcome> {
        match operation {
            DataOperation::ReadSubscription { target } => {
                let store_row = sqlx::query(
                    r#"
                    SELECT plan, status, payment_status, expires_at,
                           appraisals_used, appraisal_quota, updated_at
                    FROM subscriptions
                    WHERE user_id = $1
                    ORDER BY updated_at DESC
                    LIMIT 1
                    "#,
                )
                .bind(parse_principal_id(target)?)
                .fetch_optional(&mut **tx)
                .await
                .map_err(|e| db_error("Failed to read subscription", e))?;

                let Some(row) = store_row else {
                    return Ok(DataOutcome::Subscription(None));
                };

                let column = |e: sqlx::Error| db_error("Failed to read subscription", e);
                let status: String = row.try_get("status").map_err(column)?;
                let payment: String = row.try_get("payment_status").map_err(column)?;
                let used: i32 = row.try_get("appraisals_used").map_err(column)?;
                let quota: Option<i32> = row.try_get("appraisal_quota").map_err(column)?;

                Ok(DataOutcome::Subscription(Some(crate::types::SubscriptionRecord {
                    principal_id: target.clone(),
                    plan: row.try_get("plan").map_err(column)?,
                    status: status.parse()?,
                    payment: payment.parse()?,
                    expires_at: row.try_get("expires_at").map_err(column)?,
                    blocked_until: None,
                    appraisals_used: used.max(0) as u32,
                    appraisal_quota: quota.map(|q| q.max(0) as u32),
                    updated_at: row.try_get("updated_at").map_err(column)?,
                })))
            }
            DataOperation::UpdateBlockedUntil { target, until } => {
                let result = sqlx::query(
                    "UPDATE profiles SET blocked_until = $2, updated_at = NOW() WHERE id = $1",
                )
                .bind(parse_principal_id(target)?)
                .bind(*until)
                .execute(&mut **tx)
                .await
                .map_err(|e| db_error("Failed to update block", e))?;

                // RLS hides rows the caller may not touch
                if result.rows_affected() == 0 {
                    return Err(AuthzError::Forbidden);
                }
                Ok(DataOutcome::Done)
            }
            DataOperation::SetGatewayActive { gateway_id, active } => {
                let row = sqlx::query(
                    r#"
                    UPDATE payment_gateways
                    SET is_active = $2, updated_at = NOW()
                    WHERE id = $1
                    RETURNING id, name, is_active
                    "#,
                )
                .bind(gateway_id)
                .bind(*active)
                .fetch_optional(&mut **tx)
                .await
                .map_err(|e| db_error("Failed to update gateway", e))?
                .ok_or(AuthzError::Forbidden)?;

                let column = |e: sqlx::Error| db_error("Failed to read gateway", e);
                Ok(DataOutcome::Gateway(PaymentGateway {
                    id: row.try_get("id").map_err(column)?,
                    name: row.try_get("name").map_err(column)?,
                    is_active: row.try_get("is_active").map_err(column)?,
                }))
            }
            DataOperation::GrantRole { target, role } => {
                let result = sqlx::query(
                    r#"
                    INSERT INTO user_roles (user_id, role)
                    VALUES ($1, $2)
                    ON CONFLICT (user_id, role) DO NOTHING
                    "#,
                )
                .bind(parse_principal_id(target)?)
                .bind(role.as_str())
                .execute(&mut **tx)
                .await
                .map_err(|e| db_error("Failed to grant role", e))?;

                Ok(DataOutcome::Changed(result.rows_affected() == 1))
            }
            DataOperation::RevokeRole { target, role } => {
                let result = sqlx::query("DELETE FROM user_roles WHERE user_id = $1 AND role = $2")
                    .bind(parse_principal_id(target)?)
                    .bind(role.as_str())
                    .execute(&mut **tx)
                    .await
                    .map_err(|e| db_error("Failed to revoke role", e))?;

                Ok(DataOutcome::Changed(result.rows_affected() > 0))
            }
            DataOperation::RecordSubscription { record } => {
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
                .bind(parse_principal_id(&record.principal_id)?)
                .bind(&record.plan)
                .bind(status.as_str().unwrap_or_default())
                .bind(payment.as_str().unwrap_or_default())
                .bind(record.expires_at)
                .bind(record.appraisals_used as i32)
                .bind(record.appraisal_quota.map(|q| q as i32))
                .bind(record.updated_at)
                .execute(&mut **tx)
                .await
                .map_err(|e| db_error("Failed to record subscription", e))?;

                Ok(DataOutcome::Done)
            }
        }
    }
}
