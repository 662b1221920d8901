//! Server-side privilege check tests
//!
//! Forged payloads must not widen access: the caller comes only from a verified token and
//! roles only from the assignment store.

use appraisal_authz::engine::MetricsCollector;
use appraisal_authz::privilege::{
    DataOutcome, DataRequest, PrivilegeCheck, StorePrivilegeCheck,
};
use appraisal_authz::resolver::{
    EntitlementStore, InMemoryEntitlementStore, InMemoryRoleStore, RoleStore,
};
use appraisal_authz::types::{PaymentState, SubscriptionStatus};
use appraisal_authz::{
    AuthenticatedCaller, AuthzConfig, AuthzError, DataOperation, DataTier, PrincipalId, Role,
    SubscriptionRecord, TrustBoundary,
};
use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use std::sync::Arc;

const SECRET: &[u8] = b"integration-secret";

struct Fixture {
    boundary: TrustBoundary,
    roles: Arc<InMemoryRoleStore>,
    entitlements: Arc<InMemoryEntitlementStore>,
    check: Arc<StorePrivilegeCheck>,
    tier: DataTier,
    metrics: MetricsCollector,
}

async fn fixture() -> Fixture {
    let roles = Arc::new(InMemoryRoleStore::new());
    let entitlements = Arc::new(InMemoryEntitlementStore::new());
    let check = Arc::new(StorePrivilegeCheck::new(roles.clone()));
    let metrics = MetricsCollector::new();
    let tier = DataTier::new(check.clone(), roles.clone(), entitlements.clone())
        .with_metrics(metrics.clone());
    tier.register_gateway("stripe", "Stripe").await;

    roles.grant(&PrincipalId::new("admin-1"), Role::Admin).await.unwrap();
    roles.grant(&PrincipalId::new("user-1"), Role::User).await.unwrap();

    Fixture {
        boundary: TrustBoundary::new(SECRET),
        roles,
        entitlements,
        check,
        tier,
        metrics,
    }
}

fn caller(boundary: &TrustBoundary, sub: &str, extra: serde_json::Value) -> AuthenticatedCaller {
    let mut claims = json!({
        "sub": sub,
        "email": format!("{}@example.com", sub),
        "exp": Utc::now().timestamp() + 3600,
    });
    if let (Some(claims), Some(extra)) = (claims.as_object_mut(), extra.as_object()) {
        claims.extend(extra.clone());
    }
    let token = encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET)).unwrap();
    boundary.verify(&token).unwrap()
}

fn activate_stripe() -> DataOperation {
    DataOperation::SetGatewayActive {
        gateway_id: "stripe".into(),
        active: true,
    }
}

// ============================================================================
// has_role
// ============================================================================

#[tokio::test]
async fn test_has_role_reads_assignment_store() {
    let f = fixture().await;
    let admin = caller(&f.boundary, "admin-1", json!({}));
    let user = caller(&f.boundary, "user-1", json!({}));

    assert!(f.check.has_role(&admin, admin.principal_id(), "admin").await.unwrap());
    assert!(!f.check.has_role(&user, user.principal_id(), "admin").await.unwrap());
}

#[tokio::test]
async fn test_forged_role_claim_ignored() {
    let f = fixture().await;
    let forged = caller(
        &f.boundary,
        "user-1",
        json!({"role": "admin", "app_metadata": {"role": "admin"}}),
    );

    assert!(!f.check.has_role(&forged, forged.principal_id(), "admin").await.unwrap());
}

#[tokio::test]
async fn test_has_role_for_other_principal_is_false() {
    let f = fixture().await;
    let user = caller(&f.boundary, "user-1", json!({}));

    // Asking about the admin does not borrow the admin's roles
    let answer = f
        .check
        .has_role(&user, &PrincipalId::new("admin-1"), "admin")
        .await
        .unwrap();
    assert!(!answer);
}

#[tokio::test]
async fn test_revocation_visible_on_next_check() {
    let f = fixture().await;
    let admin = caller(&f.boundary, "admin-1", json!({}));
    assert!(f.check.has_role(&admin, admin.principal_id(), "admin").await.unwrap());

    f.roles.revoke(&PrincipalId::new("admin-1"), &Role::Admin).await.unwrap();
    assert!(!f.check.has_role(&admin, admin.principal_id(), "admin").await.unwrap());
}

// ============================================================================
// DATA TIER
// ============================================================================

#[tokio::test]
async fn test_non_admin_cannot_activate_gateway() {
    let f = fixture().await;
    let user = caller(&f.boundary, "user-1", json!({}));

    let request: DataRequest = serde_json::from_value(json!({
        "operation": {"op": "set_gateway_active", "gateway_id": "stripe", "active": true},
        "claims": {"role": "admin", "principal_id": "admin-1"}
    }))
    .unwrap();

    let result = f.tier.execute(&user, request).await;
    assert!(matches!(result, Err(AuthzError::Forbidden)));
    assert_eq!(result.unwrap_err().to_string(), "Forbidden");
    assert_eq!(f.tier.gateway("stripe").await.map(|g| g.is_active), Some(false));
    assert_eq!(f.metrics.snapshot().privilege_rejections, 1);
}

#[tokio::test]
async fn test_admin_can_activate_gateway() {
    let f = fixture().await;
    let admin = caller(&f.boundary, "admin-1", json!({}));

    let outcome = f.tier.execute(&admin, activate_stripe().into()).await.unwrap();
    assert!(matches!(outcome, DataOutcome::Gateway(ref g) if g.is_active));
    assert_eq!(f.tier.gateway("stripe").await.map(|g| g.is_active), Some(true));
}

#[tokio::test]
async fn test_configured_gateways_can_be_activated() {
    let config = AuthzConfig::from_lookup(|key| match key {
        "JWT_SECRET" => Some("s".to_string()),
        "PAYMENT_GATEWAYS" => Some("pix:Pix,boleto".to_string()),
        _ => None,
    })
    .unwrap();

    let roles = Arc::new(InMemoryRoleStore::new());
    roles.grant(&PrincipalId::new("admin-1"), Role::Admin).await.unwrap();
    let check = Arc::new(StorePrivilegeCheck::new(roles.clone()));
    let tier = DataTier::new(check, roles, Arc::new(InMemoryEntitlementStore::new()));
    tier.seed_gateways(&config.payment_gateways).await;

    let boundary = TrustBoundary::new(SECRET);
    let admin = caller(&boundary, "admin-1", json!({}));
    let activate = |id: &str| DataOperation::SetGatewayActive {
        gateway_id: id.into(),
        active: true,
    };

    assert_eq!(tier.gateway("pix").await.map(|g| g.name), Some("Pix".to_string()));
    let outcome = tier.execute_operation(&admin, activate("boleto")).await.unwrap();
    assert!(matches!(outcome, DataOutcome::Gateway(ref g) if g.is_active && g.name == "boleto"));

    let unknown = tier.execute_operation(&admin, activate("stripe")).await;
    assert!(matches!(unknown, Err(AuthzError::InvalidInput(_))));
}

#[tokio::test]
async fn test_non_admin_cannot_block_or_grant() {
    let f = fixture().await;
    let user = caller(&f.boundary, "user-1", json!({}));
    let target = PrincipalId::new("user-1");

    let block = DataOperation::UpdateBlockedUntil {
        target: target.clone(),
        until: None,
    };
    let grant = DataOperation::GrantRole {
        target: target.clone(),
        role: Role::Admin,
    };

    assert!(matches!(f.tier.execute(&user, block.into()).await, Err(AuthzError::Forbidden)));
    assert!(matches!(f.tier.execute(&user, grant.into()).await, Err(AuthzError::Forbidden)));
    assert!(!f.roles.roles_for(&target).await.unwrap().is_admin());
}

#[tokio::test]
async fn test_owner_reads_own_subscription_only() {
    let f = fixture().await;
    f.entitlements
        .record(SubscriptionRecord {
            principal_id: PrincipalId::new("user-1"),
            plan: "basic".into(),
            status: SubscriptionStatus::Active,
            payment: PaymentState::Paid,
            expires_at: None,
            blocked_until: None,
            appraisals_used: 0,
            appraisal_quota: None,
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

    let owner = caller(&f.boundary, "user-1", json!({}));
    let stranger = caller(&f.boundary, "user-2", json!({}));
    let admin = caller(&f.boundary, "admin-1", json!({}));
    let read = || DataOperation::ReadSubscription {
        target: PrincipalId::new("user-1"),
    };

    let outcome = f.tier.execute(&owner, read().into()).await.unwrap();
    assert!(matches!(outcome, DataOutcome::Subscription(Some(ref r)) if r.plan == "basic"));

    assert!(matches!(f.tier.execute(&stranger, read().into()).await, Err(AuthzError::Forbidden)));
    assert!(f.tier.execute(&admin, read().into()).await.is_ok());
}

#[tokio::test]
async fn test_admin_grant_is_idempotent() {
    let f = fixture().await;
    let admin = caller(&f.boundary, "admin-1", json!({}));
    let grant = || DataOperation::GrantRole {
        target: PrincipalId::new("user-2"),
        role: Role::User,
    };

    assert_eq!(
        f.tier.execute(&admin, grant().into()).await.unwrap(),
        DataOutcome::Changed(true)
    );
    assert_eq!(
        f.tier.execute(&admin, grant().into()).await.unwrap(),
        DataOutcome::Changed(false)
    );
}

#[tokio::test]
async fn test_token_signed_with_other_secret_rejected() {
    let f = fixture().await;
    let token = encode(
        &Header::default(),
        &json!({"sub": "admin-1", "exp": Utc::now().timestamp() + 3600}),
        &EncodingKey::from_secret(b"attacker"),
    )
    .unwrap();

    assert!(matches!(f.boundary.verify(&token), Err(AuthzError::InvalidToken(_))));
}
