//! Core authorization types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Opaque principal identifier (a UUID string when backed by Postgres)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrincipalId(String);

impl PrincipalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PrincipalId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Identity supplied by the identity provider for the lifetime of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Principal identifier
    pub id: PrincipalId,

    /// Email address reported by the identity provider
    pub email: String,

    /// Whether the identity provider authenticated this principal
    pub authenticated: bool,
}

impl Principal {
    /// Create an authenticated principal
    pub fn authenticated(id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: PrincipalId::new(id),
            email: email.into(),
            authenticated: true,
        }
    }

    /// The principal of a visitor with no session
    pub fn anonymous() -> Self {
        Self {
            id: PrincipalId::new(""),
            email: String::new(),
            authenticated: false,
        }
    }
}

/// Role token from the persisted assignment table
///
/// Unknown tokens are kept verbatim so newer roles survive a round trip through an
/// older build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    Admin,
    User,
    Unknown(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::Admin => "admin",
            Role::User => "user",
            Role::Unknown(token) => token,
        }
    }
}

impl FromStr for Role {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "admin" => Role::Admin,
            "user" => Role::User,
            other => Role::Unknown(other.to_string()),
        })
    }
}

impl From<String> for Role {
    fn from(token: String) -> Self {
        match token.as_str() {
            "admin" => Role::Admin,
            "user" => Role::User,
            _ => Role::Unknown(token),
        }
    }
}

impl From<&str> for Role {
    fn from(token: &str) -> Self {
        Role::from(token.to_string())
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        match role {
            Role::Unknown(token) => token,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unordered set of distinct roles held by a principal
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoleSet(BTreeSet<Role>);

impl RoleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_admin(&self) -> bool {
        self.0.contains(&Role::Admin)
    }

    pub fn contains(&self, role: &Role) -> bool {
        self.0.contains(role)
    }

    /// Whether the two sets share at least one role
    pub fn intersects(&self, other: &RoleSet) -> bool {
        self.0.iter().any(|role| other.0.contains(role))
    }

    /// Insert a role; returns false if it was already present
    pub fn insert(&mut self, role: Role) -> bool {
        self.0.insert(role)
    }

    pub fn remove(&mut self, role: &Role) -> bool {
        self.0.remove(role)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Role> {
        self.0.iter()
    }
}

impl FromIterator<Role> for RoleSet {
    fn from_iter<I: IntoIterator<Item = Role>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Plan status reported by the billing side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Pending,
}

impl FromStr for SubscriptionStatus {
    type Err = crate::error::AuthzError;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "trialing" => Ok(Self::Trialing),
            "past_due" => Ok(Self::PastDue),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            "pending" => Ok(Self::Pending),
            other => Err(crate::error::AuthzError::InvalidInput(format!(
                "Unknown subscription status: {}",
                other
            ))),
        }
    }
}

/// Payment state of the current billing period
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Paid,
    Pending,
    Failed,
    Refunded,
}

impl FromStr for PaymentState {
    type Err = crate::error::AuthzError;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s {
            "paid" | "approved" => Ok(Self::Paid),
            "pending" => Ok(Self::Pending),
            "failed" | "rejected" => Ok(Self::Failed),
            "refunded" => Ok(Self::Refunded),
            other => Err(crate::error::AuthzError::InvalidInput(format!(
                "Unknown payment state: {}",
                other
            ))),
        }
    }
}

/// Persisted subscription row, as written by payment webhooks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub principal_id: PrincipalId,

    /// Plan name (e.g., "basic", "pro")
    pub plan: String,

    pub status: SubscriptionStatus,

    pub payment: PaymentState,

    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    /// Administrative block; the entitlement is inactive until this instant passes
    #[serde(default)]
    pub blocked_until: Option<DateTime<Utc>>,

    #[serde(default)]
    pub appraisals_used: u32,

    /// Appraisal quota for the period (None = unlimited)
    #[serde(default)]
    pub appraisal_quota: Option<u32>,

    pub updated_at: DateTime<Utc>,
}

/// Usage counters carried alongside the entitlement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub used: u32,
    pub quota: Option<u32>,
}

/// Derived entitlement state of a principal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entitlement {
    /// Whether the principal currently holds an active paid subscription
    pub active: bool,

    #[serde(default)]
    pub plan: Option<String>,

    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub blocked_until: Option<DateTime<Utc>>,

    #[serde(default)]
    pub usage: Option<Usage>,

    /// Set when `active` came from the admin exemption rather than billing data
    #[serde(default)]
    pub admin_exempt: bool,
}

impl Entitlement {
    /// Entitlement of a principal with no subscription record
    pub fn none() -> Self {
        Self {
            active: false,
            plan: None,
            expires_at: None,
            blocked_until: None,
            usage: None,
            admin_exempt: false,
        }
    }

    /// Entitlement granted to admins without consulting billing data
    pub fn admin_exempt() -> Self {
        Self {
            active: true,
            admin_exempt: true,
            ..Self::none()
        }
    }

    /// Derive the entitlement from the latest record at instant `now`
    pub fn from_record(record: Option<&SubscriptionRecord>, now: DateTime<Utc>) -> Self {
        let Some(record) = record else {
            return Self::none();
        };

        let plan_ok = matches!(
            record.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        );
        let paid = record.payment == PaymentState::Paid
            || record.status == SubscriptionStatus::Trialing;
        let unexpired = record.expires_at.map_or(true, |at| at > now);
        let unblocked = record.blocked_until.map_or(true, |until| until <= now);

        Self {
            active: plan_ok && paid && unexpired && unblocked,
            plan: Some(record.plan.clone()),
            expires_at: record.expires_at,
            blocked_until: record.blocked_until,
            usage: Some(Usage {
                used: record.appraisals_used,
                quota: record.appraisal_quota,
            }),
            admin_exempt: false,
        }
    }
}

/// Declarative requirement attached to a protected route or action
///
/// Neither field set means "authenticated only".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequirement {
    /// At least one of these roles must be held
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<RoleSet>,

    /// An active entitlement is required (admins are exempt)
    #[serde(default)]
    pub requires_entitlement: bool,
}

impl AccessRequirement {
    pub fn authenticated() -> Self {
        Self::default()
    }

    pub fn with_roles(roles: impl IntoIterator<Item = Role>) -> Self {
        Self {
            roles: Some(roles.into_iter().collect()),
            requires_entitlement: false,
        }
    }

    pub fn entitled() -> Self {
        Self {
            roles: None,
            requires_entitlement: true,
        }
    }

    pub fn and_entitled(mut self) -> Self {
        self.requires_entitlement = true;
        self
    }
}
