//! # Appraisal Authorization Layer
//!
//! Role and subscription based access control for the appraisal platform.
//!
//! ## Features
//!
//! - **Role resolution** from the persisted assignment store, never from the token
//! - **Entitlement resolution** from the latest subscription record
//! - **Pure access decisions** with an explicit pending state while lookups settle
//! - **Composable route guards** that short-circuit on the first failure
//! - **Per-session caching** with stale-lookup discard on refresh and teardown
//! - **Server-side privilege check** bound to the authenticated caller
//!
//! ## Example
//!
//! ```rust
//! use appraisal_authz::{AccessEngine, EngineConfig, RouteTable, Principal};
//! use appraisal_authz::resolver::{InMemoryEntitlementStore, InMemoryRoleStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = AccessEngine::new(
//!         Arc::new(InMemoryRoleStore::new()),
//!         Arc::new(InMemoryEntitlementStore::new()),
//!         RouteTable::appraisal_defaults(),
//!         EngineConfig::default(),
//!     );
//!
//!     let mut session = engine.open_session(Some(Principal::authenticated("u-1", "u@example.com")));
//!     let evaluation = engine.guard_route(&mut session, "/admin").await;
//!
//!     assert_eq!(evaluation.state.redirect(), Some("/dashboard"));
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod privilege;
pub mod resolver;
pub mod session;
pub mod types;

pub use config::{AuthzConfig, GatewaySeed};
pub use engine::{
    decide, AccessEngine, DenyReason, EngineConfig, Guard, GuardChain, GuardEvaluation,
    GuardState, MetricsCollector, Outcome, PendingCause, RedirectTargets, RouteTable, Verdict,
};
pub use error::{AuthzError, Result};
pub use privilege::{AuthenticatedCaller, DataOperation, DataTier, PrivilegeCheck, TrustBoundary};
pub use resolver::{Resolution, RoleResolver, SubscriptionResolver};
pub use session::{SessionContext, SessionRegistry, SharedSession};
pub use types::{
    AccessRequirement, Entitlement, Principal, PrincipalId, Role, RoleSet, SubscriptionRecord,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
