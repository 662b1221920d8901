//! Per-principal session context
//!
//! Owns the current principal and the cached role/entitlement resolutions that guard
//! evaluation reads. Every invalidation (sign-out, refresh, identity change) bumps a
//! generation counter; lookup results carry the generation they were started under and
//! are dropped if it no longer matches. Tearing the session down cancels lookups still
//! in flight.

use crate::engine::guard::{GuardChain, GuardEvaluation, GuardState, RedirectTargets};
use crate::engine::decision::PendingCause;
use crate::error::Result;
use crate::resolver::{Resolution, RoleResolver, SubscriptionResolver};
use crate::types::{Entitlement, Principal, PrincipalId, RoleSet};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct Cached<T> {
    value: Resolution<T>,
    settled_at: Option<Instant>,
}

impl<T: Clone> Cached<T> {
    fn unresolved() -> Self {
        Self {
            value: Resolution::Unresolved,
            settled_at: None,
        }
    }

    fn settled(value: Resolution<T>) -> Self {
        Self {
            value,
            settled_at: Some(Instant::now()),
        }
    }

    fn is_expired(&self, ttl: Duration) -> bool {
        self.settled_at.map_or(false, |at| at.elapsed() > ttl)
    }

    /// Value as seen by guards; an expired entry reads as unresolved
    fn current(&self, ttl: Duration) -> Resolution<T> {
        if self.is_expired(ttl) {
            Resolution::Unresolved
        } else {
            self.value.clone()
        }
    }

    fn needs_fetch(&self, ttl: Duration) -> bool {
        matches!(self.value, Resolution::Unresolved) || self.is_expired(ttl)
    }
}

/// Handle for one lookup round, detached from the session borrow
#[derive(Debug, Clone)]
pub struct LookupTicket {
    generation: u64,
    principal: Principal,
    cancel: CancellationToken,
}

/// Settled lookups, tagged with the generation they belong to
#[derive(Debug)]
pub struct LookupResults {
    generation: u64,
    roles: Result<RoleSet>,
    entitlement: Result<Entitlement>,
}

impl LookupTicket {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Run both lookups concurrently
    ///
    /// Returns `None` when the session was torn down before both settled.
    pub async fn run(
        self,
        roles: &RoleResolver,
        subscriptions: &SubscriptionResolver,
    ) -> Option<LookupResults> {
        let lookups = async {
            tokio::join!(
                roles.resolve(&self.principal),
                subscriptions.resolve(&self.principal, None)
            )
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!("Lookup for {} cancelled", self.principal.id);
                None
            }
            (roles, entitlement) = lookups => Some(LookupResults {
                generation: self.generation,
                roles,
                entitlement,
            }),
        }
    }
}

/// Explicitly owned session state threaded through guard evaluation
#[derive(Debug)]
pub struct SessionContext {
    /// `None` while the identity provider is still loading
    identity: Option<Principal>,
    roles: Cached<RoleSet>,
    entitlement: Cached<Entitlement>,
    generation: u64,
    ttl: Duration,
    cancel: CancellationToken,
}

impl SessionContext {
    /// Session whose identity is not known yet
    pub fn new(ttl: Duration) -> Self {
        Self {
            identity: None,
            roles: Cached::unresolved(),
            entitlement: Cached::unresolved(),
            generation: 0,
            ttl,
            cancel: CancellationToken::new(),
        }
    }

    pub fn for_principal(principal: Principal, ttl: Duration) -> Self {
        let mut session = Self::new(ttl);
        session.set_identity(principal);
        session
    }

    /// Identity provider reported a principal
    ///
    /// Re-reporting the same principal keeps the cache; a different principal starts a
    /// new generation.
    pub fn set_identity(&mut self, principal: Principal) {
        if self.identity.as_ref() == Some(&principal) {
            return;
        }

        self.generation += 1;
        if principal.authenticated {
            self.roles = Cached::unresolved();
            self.entitlement = Cached::unresolved();
        } else {
            // Nothing to look up for a visitor
            self.roles = Cached::settled(Resolution::Resolved(RoleSet::new()));
            self.entitlement = Cached::settled(Resolution::Resolved(Entitlement::none()));
        }
        self.identity = Some(principal);
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.identity.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn roles(&self) -> Resolution<RoleSet> {
        self.roles.current(self.ttl)
    }

    pub fn entitlement(&self) -> Resolution<Entitlement> {
        self.entitlement.current(self.ttl)
    }

    /// Whether guards would need a lookup before deciding
    ///
    /// Failed lookups are not retried here; they wait for [`Self::refresh`].
    pub fn needs_lookup(&self) -> bool {
        match &self.identity {
            Some(principal) if principal.authenticated => {
                self.roles.needs_fetch(self.ttl) || self.entitlement.needs_fetch(self.ttl)
            }
            _ => false,
        }
    }

    /// Start a lookup round for the current generation
    pub fn begin_lookup(&self) -> Option<LookupTicket> {
        if self.cancel.is_cancelled() {
            return None;
        }

        let principal = self.identity.as_ref().filter(|p| p.authenticated)?;
        Some(LookupTicket {
            generation: self.generation,
            principal: principal.clone(),
            cancel: self.cancel.child_token(),
        })
    }

    /// Apply settled lookups; returns false if they were stale and got discarded
    pub fn apply(&mut self, results: LookupResults) -> bool {
        if self.cancel.is_cancelled() || results.generation != self.generation {
            debug!(
                "Discarding lookup from generation {} (current {})",
                results.generation, self.generation
            );
            return false;
        }

        // An admin role set overrides the billing result, failure included
        let entitlement = match &results.roles {
            Ok(roles) if roles.is_admin() => {
                if let Err(e) = &results.entitlement {
                    debug!("Ignoring entitlement failure for admin: {}", e);
                }
                Resolution::Resolved(Entitlement::admin_exempt())
            }
            _ => results.entitlement.into(),
        };

        self.roles = Cached::settled(results.roles.into());
        self.entitlement = Cached::settled(entitlement);
        true
    }

    /// Look up roles and entitlement and cache them
    pub async fn load(&mut self, roles: &RoleResolver, subscriptions: &SubscriptionResolver) -> bool {
        let Some(ticket) = self.begin_lookup() else {
            return false;
        };

        match ticket.run(roles, subscriptions).await {
            Some(results) => self.apply(results),
            None => false,
        }
    }

    /// Drop cached resolutions; the next guard evaluation refetches
    pub fn refresh(&mut self) {
        self.generation += 1;
        if self.identity.as_ref().is_some_and(|p| p.authenticated) {
            self.roles = Cached::unresolved();
            self.entitlement = Cached::unresolved();
        }
    }

    pub fn sign_out(&mut self) {
        self.set_identity(Principal::anonymous());
    }

    /// Consuming context went away; in-flight lookups are abandoned
    pub fn teardown(&self) {
        self.cancel.cancel();
    }

    pub fn is_torn_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Evaluate a chain against the cached state without issuing lookups
    pub fn evaluate(&self, chain: &GuardChain, targets: &RedirectTargets) -> GuardEvaluation {
        match &self.identity {
            None if chain.is_empty() => GuardEvaluation {
                state: GuardState::Allowed,
                evaluated: Vec::new(),
            },
            None => GuardEvaluation {
                state: GuardState::Pending {
                    cause: PendingCause::Identity,
                },
                evaluated: Vec::new(),
            },
            Some(principal) => chain.evaluate(principal, &self.roles(), &self.entitlement(), targets),
        }
    }
}

/// Shared handle to one principal's session
pub type SharedSession = Arc<Mutex<SessionContext>>;

#[derive(Debug)]
struct RegistryEntry {
    session: SharedSession,
    last_used: Instant,
}

/// Sessions keyed by principal, with idle eviction
///
/// Each access refreshes the entry's idle clock. [`Self::evict_idle`] drops entries
/// nobody touched within the idle window and tears them down; an entry whose session
/// is currently locked is kept until the next sweep.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<PrincipalId, RegistryEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session for the principal, opened with `open` on first use
    pub fn get_or_open<F>(&self, principal_id: &PrincipalId, open: F) -> SharedSession
    where
        F: FnOnce() -> SessionContext,
    {
        let mut entry = self
            .sessions
            .entry(principal_id.clone())
            .or_insert_with(|| RegistryEntry {
                session: Arc::new(Mutex::new(open())),
                last_used: Instant::now(),
            });
        entry.last_used = Instant::now();
        entry.session.clone()
    }

    pub fn remove(&self, principal_id: &PrincipalId) -> Option<SharedSession> {
        self.sessions.remove(principal_id).map(|(_, entry)| entry.session)
    }

    pub fn contains(&self, principal_id: &PrincipalId) -> bool {
        self.sessions.contains_key(principal_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop sessions idle for longer than `idle`; returns how many were evicted
    pub fn evict_idle(&self, idle: Duration) -> usize {
        let stale: Vec<PrincipalId> = self
            .sessions
            .iter()
            .filter(|entry| entry.last_used.elapsed() > idle)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for principal_id in stale {
            let removed = self.sessions.remove_if(&principal_id, |_, entry| {
                entry.last_used.elapsed() > idle && entry.session.try_lock().is_ok()
            });
            if let Some((_, entry)) = removed {
                if let Ok(session) = entry.session.try_lock() {
                    session.teardown();
                }
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!("Evicted {} idle session(s), {} remaining", evicted, self.sessions.len());
        }
        evicted
    }
}
