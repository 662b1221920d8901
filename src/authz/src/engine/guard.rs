//! Guard chains over a navigation or action request
//!
//! A chain is an ordered list of single-requirement guards. Evaluation waits until both
//! resolvers have settled, then runs guards in order and stops at the first Deny. The
//! result is a plain value; applying the redirect is left to the caller.

use super::decision::{decide, pending_cause, DenyReason, Outcome, PendingCause, Verdict};
use crate::resolver::Resolution;
use crate::types::{AccessRequirement, Entitlement, Principal, RoleSet};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A single authorization check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "guard", content = "roles", rename_all = "snake_case")]
pub enum Guard {
    /// Principal must be authenticated
    Authenticated,
    /// Principal must hold at least one of these roles
    Role(RoleSet),
    /// Principal must hold an active entitlement unless admin
    Entitlement,
}

impl Guard {
    pub fn name(&self) -> &'static str {
        match self {
            Guard::Authenticated => "authenticated",
            Guard::Role(_) => "role",
            Guard::Entitlement => "entitlement",
        }
    }

    fn requirement(&self) -> AccessRequirement {
        match self {
            Guard::Authenticated => AccessRequirement::authenticated(),
            Guard::Role(roles) => AccessRequirement {
                roles: Some(roles.clone()),
                requires_entitlement: false,
            },
            Guard::Entitlement => AccessRequirement::entitled(),
        }
    }
}

/// Fallback destinations, one per deny reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectTargets {
    pub sign_in: String,
    pub default_area: String,
    pub plan_selection: String,
}

impl Default for RedirectTargets {
    fn default() -> Self {
        Self {
            sign_in: "/auth".to_string(),
            default_area: "/dashboard".to_string(),
            plan_selection: "/plans".to_string(),
        }
    }
}

impl RedirectTargets {
    pub fn for_reason(&self, reason: DenyReason) -> &str {
        match reason {
            DenyReason::Unauthenticated => &self.sign_in,
            DenyReason::InsufficientRole => &self.default_area,
            DenyReason::NoEntitlement => &self.plan_selection,
        }
    }
}

/// State of a guarded request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GuardState {
    /// Inputs not settled; render a neutral waiting state, issue no redirect
    Pending { cause: PendingCause },
    /// First failing guard's reason and where to send the user
    Denied { reason: DenyReason, redirect: String },
    /// Every guard allowed; release the protected content
    Allowed,
}

impl GuardState {
    pub fn is_pending(&self) -> bool {
        matches!(self, GuardState::Pending { .. })
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, GuardState::Allowed)
    }

    pub fn redirect(&self) -> Option<&str> {
        match self {
            GuardState::Denied { redirect, .. } => Some(redirect),
            _ => None,
        }
    }
}

/// Outcome of running a chain, plus the guards that actually ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardEvaluation {
    pub state: GuardState,
    pub evaluated: Vec<String>,
}

/// Ordered guard chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GuardChain {
    guards: Vec<Guard>,
}

impl GuardChain {
    pub fn new(guards: Vec<Guard>) -> Self {
        Self { guards }
    }

    /// Chain with no guards (public route)
    pub fn public() -> Self {
        Self::default()
    }

    /// Canonical chain for a requirement: authenticated, then role, then entitlement
    pub fn for_requirement(requirement: &AccessRequirement) -> Self {
        let mut guards = vec![Guard::Authenticated];
        if let Some(roles) = &requirement.roles {
            guards.push(Guard::Role(roles.clone()));
        }
        if requirement.requires_entitlement {
            guards.push(Guard::Entitlement);
        }
        Self { guards }
    }

    pub fn then(mut self, guard: Guard) -> Self {
        self.guards.push(guard);
        self
    }

    pub fn guards(&self) -> &[Guard] {
        &self.guards
    }

    pub fn is_empty(&self) -> bool {
        self.guards.is_empty()
    }

    /// Evaluate the chain against settled or unsettled inputs
    pub fn evaluate(
        &self,
        principal: &Principal,
        roles: &Resolution<RoleSet>,
        entitlement: &Resolution<Entitlement>,
        targets: &RedirectTargets,
    ) -> GuardEvaluation {
        if self.guards.is_empty() {
            return GuardEvaluation {
                state: GuardState::Allowed,
                evaluated: Vec::new(),
            };
        }

        // AND-join: nothing is decided until both lookups have settled
        if let Some(cause) = pending_cause(roles, entitlement) {
            debug!("Guard chain pending: {:?}", cause);
            return GuardEvaluation {
                state: GuardState::Pending { cause },
                evaluated: Vec::new(),
            };
        }

        let mut evaluated = Vec::with_capacity(self.guards.len());
        for guard in &self.guards {
            evaluated.push(guard.name().to_string());

            match decide(principal, roles, entitlement, &guard.requirement()) {
                Outcome::Decided(Verdict::Allow) => continue,
                Outcome::Decided(Verdict::Deny(reason)) => {
                    debug!("Guard '{}' denied: {}", guard.name(), reason);
                    return GuardEvaluation {
                        state: GuardState::Denied {
                            reason,
                            redirect: targets.for_reason(reason).to_string(),
                        },
                        evaluated,
                    };
                }
                Outcome::Pending(cause) => {
                    return GuardEvaluation {
                        state: GuardState::Pending { cause },
                        evaluated,
                    };
                }
            }
        }

        GuardEvaluation {
            state: GuardState::Allowed,
            evaluated,
        }
    }
}
