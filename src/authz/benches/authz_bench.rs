//! Access decision benchmarks
//!
//! `decide` and chain evaluation run on every navigation, so they should stay in the
//! sub-microsecond range; the engine benchmark includes the session cache hit path.

use appraisal_authz::resolver::{InMemoryEntitlementStore, InMemoryRoleStore, RoleStore};
use appraisal_authz::{
    decide, AccessEngine, AccessRequirement, EngineConfig, Entitlement, GuardChain, Principal,
    PrincipalId, RedirectTargets, Resolution, Role, RoleSet, RouteTable,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn principal() -> Principal {
    Principal::authenticated("bench-user", "bench@example.com")
}

fn bench_decide(c: &mut Criterion) {
    let mut group = c.benchmark_group("decide");
    let principal = principal();
    let entitlement = Resolution::Resolved(Entitlement::none());

    for role_count in [1usize, 4, 16] {
        let roles: RoleSet = (0..role_count)
            .map(|i| Role::from(format!("role-{}", i)))
            .chain(std::iter::once(Role::User))
            .collect();
        let roles = Resolution::Resolved(roles);
        let requirement = AccessRequirement::with_roles([Role::Admin, Role::User]);

        group.bench_with_input(BenchmarkId::new("roles", role_count), &roles, |b, roles| {
            b.iter(|| {
                black_box(decide(
                    black_box(&principal),
                    black_box(roles),
                    black_box(&entitlement),
                    black_box(&requirement),
                ))
            });
        });
    }

    group.finish();
}

fn bench_chain_evaluation(c: &mut Criterion) {
    let principal = principal();
    let targets = RedirectTargets::default();
    let roles = Resolution::Resolved([Role::User].into_iter().collect::<RoleSet>());
    let entitlement = Resolution::Resolved(Entitlement {
        active: true,
        ..Entitlement::none()
    });

    let allowed = GuardChain::for_requirement(&AccessRequirement::entitled());
    let denied_early =
        GuardChain::for_requirement(&AccessRequirement::with_roles([Role::Admin]).and_entitled());

    c.bench_function("chain_allowed", |b| {
        b.iter(|| black_box(allowed.evaluate(&principal, &roles, &entitlement, &targets)));
    });

    c.bench_function("chain_short_circuit", |b| {
        b.iter(|| black_box(denied_early.evaluate(&principal, &roles, &entitlement, &targets)));
    });

    c.bench_function("chain_pending", |b| {
        let unresolved: Resolution<Entitlement> = Resolution::Unresolved;
        b.iter(|| black_box(allowed.evaluate(&principal, &roles, &unresolved, &targets)));
    });
}

fn bench_route_lookup(c: &mut Criterion) {
    let table = RouteTable::appraisal_defaults();

    c.bench_function("route_chain_for", |b| {
        b.iter(|| black_box(table.chain_for(black_box("/appraisals/12345"))));
    });
}

fn bench_engine_cached_guard(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let roles = Arc::new(InMemoryRoleStore::new());
    rt.block_on(roles.grant(&PrincipalId::new("bench-user"), Role::Admin))
        .unwrap();

    let engine = AccessEngine::new(
        roles,
        Arc::new(InMemoryEntitlementStore::new()),
        RouteTable::appraisal_defaults(),
        EngineConfig::default(),
    );
    let mut session = engine.open_session(Some(principal()));
    // Warm the session cache
    rt.block_on(engine.guard_route(&mut session, "/admin"));

    c.bench_function("engine_guard_route_cached", |b| {
        b.iter(|| black_box(rt.block_on(engine.guard_route(&mut session, "/admin"))));
    });
}

criterion_group!(
    benches,
    bench_decide,
    bench_chain_evaluation,
    bench_route_lookup,
    bench_engine_cached_guard
);
criterion_main!(benches);
