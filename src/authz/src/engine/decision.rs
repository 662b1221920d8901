//! Verdict types and the pure decision function

use crate::resolver::Resolution;
use crate::types::{AccessRequirement, Entitlement, Principal, RoleSet};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a request was denied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    Unauthenticated,
    InsufficientRole,
    NoEntitlement,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Unauthenticated => "unauthenticated",
            DenyReason::InsufficientRole => "insufficient_role",
            DenyReason::NoEntitlement => "no_entitlement",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allow/Deny outcome of one evaluation. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny(DenyReason),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

/// Why no verdict could be produced yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", content = "detail", rename_all = "snake_case")]
pub enum PendingCause {
    /// Identity provider has not reported a principal yet
    Identity,
    /// A role or entitlement lookup is still in flight
    Unresolved,
    /// A lookup failed; the guard holds until the next refresh
    LookupFailed(String),
}

/// Result of [`decide`]: a verdict, or a pending marker distinct from Deny
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Pending(PendingCause),
    Decided(Verdict),
}

impl Outcome {
    pub fn verdict(&self) -> Option<Verdict> {
        match self {
            Outcome::Decided(verdict) => Some(*verdict),
            Outcome::Pending(_) => None,
        }
    }
}

/// Readiness of the role and entitlement inputs taken together
pub(crate) fn pending_cause(
    roles: &Resolution<RoleSet>,
    entitlement: &Resolution<Entitlement>,
) -> Option<PendingCause> {
    match (roles, entitlement) {
        (Resolution::Failed(e), _) | (_, Resolution::Failed(e)) => {
            Some(PendingCause::LookupFailed(e.clone()))
        }
        (Resolution::Unresolved, _) | (_, Resolution::Unresolved) => Some(PendingCause::Unresolved),
        _ => None,
    }
}

/// Decide whether `principal` satisfies `requirement`
///
/// Checks run in a fixed order: authentication, input readiness, role intersection,
/// then entitlement. The admin exemption is applied inside the entitlement check so an
/// admin never reaches the entitlement denial. Pure: identical inputs give identical
/// outcomes.
pub fn decide(
    principal: &Principal,
    roles: &Resolution<RoleSet>,
    entitlement: &Resolution<Entitlement>,
    requirement: &AccessRequirement,
) -> Outcome {
    if !principal.authenticated {
        return Outcome::Decided(Verdict::Deny(DenyReason::Unauthenticated));
    }

    if let Some(cause) = pending_cause(roles, entitlement) {
        return Outcome::Pending(cause);
    }

    let (Resolution::Resolved(roles), Resolution::Resolved(entitlement)) = (roles, entitlement)
    else {
        return Outcome::Pending(PendingCause::Unresolved);
    };

    if let Some(required) = &requirement.roles {
        if !roles.intersects(required) {
            return Outcome::Decided(Verdict::Deny(DenyReason::InsufficientRole));
        }
    }

    if requirement.requires_entitlement && !roles.is_admin() && !entitlement.active {
        return Outcome::Decided(Verdict::Deny(DenyReason::NoEntitlement));
    }

    Outcome::Decided(Verdict::Allow)
}
