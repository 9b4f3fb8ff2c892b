//! Integration property tests for tenancy-core.
//!
//! These tests check the isolation guarantees across random tenants, roles
//! and binding sequences on a single reused pooled connection.

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use tenancy_core::audit::{AuditEventKind, AuditTrail};
use tenancy_core::config::{PoolConfig, SessionVars};
use tenancy_core::engine::{Database, Filter, NewRow, Patch, RowId, TableSchema};
use tenancy_core::pool::Pool;
use tenancy_core::state::Resolved;
use tenancy_core::{
    Binder, Claims, ContextGate, CredentialResolver, Credentials, Ctx, RequestMeta, TenantId,
    Violation, ViolationKind,
};

const TABLE: &str = "records";

// Strategy: Generate a well-formed tenant id
fn arb_tenant() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9-]{0,7}").unwrap()
}

// Strategy: Generate row counts for 2..5 distinct tenants
fn arb_population() -> impl Strategy<Value = BTreeMap<String, usize>> {
    prop::collection::btree_map(arb_tenant(), 0usize..4, 2..5)
}

// Strategy: Generate a role that is not the platform-admin role
fn arb_tenant_role() -> impl Strategy<Value = &'static str> {
    prop_oneof![Just("member"), Just("tenant_admin")]
}

fn claims(request_id: &str, tenant: Option<&str>, role: &str) -> RequestMeta {
    RequestMeta {
        request_id: request_id.to_string(),
        credentials: Some(Credentials::Bearer(Claims {
            sub: format!("sub-{request_id}"),
            tenant_id: tenant.map(str::to_string),
            role: role.to_string(),
        })),
    }
}

fn resolve(request_id: &str, tenant: Option<&str>, role: &str) -> Result<Ctx<Resolved>, Violation> {
    ContextGate::new(claims(request_id, tenant, role)).build(&CredentialResolver::new())
}

struct World {
    pool: Pool,
    binder: Binder,
    trail: Arc<AuditTrail>,
    ids: BTreeMap<String, Vec<RowId>>,
}

fn populate(population: &BTreeMap<String, usize>) -> World {
    let db = Database::new(SessionVars::default()).unwrap();
    db.create_table(TableSchema::new(TABLE)).unwrap();
    let trail = Arc::new(AuditTrail::new());
    let pool = Pool::new(
        db,
        PoolConfig {
            size: 1,
            acquire_timeout_ms: 50,
        },
        trail.clone(),
    );
    let binder = Binder::new(SessionVars::default(), trail.clone());

    let mut ids: BTreeMap<String, Vec<RowId>> = BTreeMap::new();
    for (tenant, count) in population {
        let mut ctx = resolve("seed", Some(tenant), "tenant_admin")
            .unwrap()
            .bind(&binder, pool.try_acquire().unwrap());
        let owned = ids.entry(tenant.clone()).or_default();
        for n in 0..*count {
            let id = ctx.db().insert(TABLE, NewRow::new().set("n", n)).unwrap();
            owned.push(id.expect("own-tenant insert lands"));
        }
    }
    trail.clear();

    World {
        pool,
        binder,
        trail,
        ids,
    }
}

proptest! {
    /// Property: A tenant context sees exactly its own rows, never another's.
    #[test]
    fn proptest_tenant_sees_only_own_rows(
        population in arb_population(),
        role in arb_tenant_role(),
        pick in any::<prop::sample::Index>(),
    ) {
        let world = populate(&population);
        let tenants: Vec<&String> = population.keys().collect();
        let tenant = tenants[pick.index(tenants.len())];

        let mut ctx = resolve("read", Some(tenant), role)
            .unwrap()
            .bind(&world.binder, world.pool.try_acquire().unwrap());
        let rows = ctx.db().select(TABLE, &Filter::All).unwrap();

        prop_assert_eq!(rows.len(), population[tenant]);
        prop_assert!(rows.iter().all(|r| r.tenant_id.as_str() == tenant.as_str()));
    }

    /// Property: Targeted reads (by row id or by tenant column) never return
    /// another tenant's rows.
    #[test]
    fn proptest_targeted_reads_never_cross_tenants(
        population in arb_population(),
        role in arb_tenant_role(),
        pick in any::<prop::sample::Index>(),
    ) {
        let world = populate(&population);
        let tenants: Vec<&String> = population.keys().collect();
        let tenant = tenants[pick.index(tenants.len())];

        let mut ctx = resolve("targeted", Some(tenant), role)
            .unwrap()
            .bind(&world.binder, world.pool.try_acquire().unwrap());

        for (other, rows) in &world.ids {
            let by_tenant = ctx.db().select(TABLE, &Filter::eq("tenant_id", other.as_str())).unwrap();
            if other == tenant {
                prop_assert_eq!(by_tenant.len(), population[tenant]);
            } else {
                prop_assert!(by_tenant.is_empty());
            }
            for id in rows {
                let by_id = ctx.db().select(TABLE, &Filter::Id(*id)).unwrap();
                prop_assert_eq!(by_id.len(), usize::from(other == tenant));
            }
        }
    }

    /// Property: Credentials without a tenant resolve only for platform
    /// administrators; everything else fails closed.
    #[test]
    fn proptest_missing_tenant_fails_closed(
        role in prop_oneof![Just("member"), Just("tenant_admin"), Just("root"), Just("")],
        blank in any::<bool>(),
    ) {
        let tenant = if blank { Some("") } else { None };
        let err = resolve("anon", tenant, role).unwrap_err();
        prop_assert_eq!(err.kind, ViolationKind::Unresolvable);
    }

    /// Property: Writes aimed at a foreign tenant never land, and every
    /// attempt is audited.
    #[test]
    fn proptest_foreign_writes_are_contained(
        population in arb_population(),
        actor in any::<prop::sample::Index>(),
        victim in any::<prop::sample::Index>(),
        role in arb_tenant_role(),
    ) {
        let world = populate(&population);
        let tenants: Vec<&String> = population.keys().collect();
        let actor = tenants[actor.index(tenants.len())];
        let victim = tenants[victim.index(tenants.len())];
        prop_assume!(actor != victim);

        let mut ctx = resolve("write", Some(actor), role)
            .unwrap()
            .bind(&world.binder, world.pool.try_acquire().unwrap());
        let victim_id = TenantId::parse(victim).unwrap();

        let inserted = ctx
            .db()
            .insert(TABLE, NewRow::for_tenant(victim_id.clone()).set("n", 99))
            .unwrap();
        prop_assert!(inserted.is_none());

        let moved = ctx
            .db()
            .update(TABLE, &Filter::All, &Patch::new().reassign_tenant(victim_id))
            .unwrap();
        prop_assert_eq!(moved, 0);

        for id in &world.ids[victim] {
            let patched = ctx
                .db()
                .update(TABLE, &Filter::Id(*id), &Patch::new().set("n", -1))
                .unwrap();
            prop_assert_eq!(patched, 0);
            prop_assert_eq!(ctx.db().delete(TABLE, &Filter::Id(*id)).unwrap(), 0);
        }
        ctx.release();

        let mut check = resolve("check", Some(victim), "member")
            .unwrap()
            .bind(&world.binder, world.pool.try_acquire().unwrap());
        let survivors = check.db().select(TABLE, &Filter::All).unwrap();
        prop_assert_eq!(survivors.len(), population[victim]);
        prop_assert!(survivors.iter().all(|r| r.get("n") != Some(serde_json::json!(-1))));

        // One denial for the insert, one for the reassignment when the actor
        // owns rows, and one per targeted update or delete.
        let denied = world.trail.of_kind(AuditEventKind::WriteDenied).len();
        prop_assert!(denied >= 1 + 2 * world.ids[victim].len());
    }

    /// Property: The platform-admin scope sees every row and audits each
    /// bypassed statement.
    #[test]
    fn proptest_admin_bypass_sees_all(population in arb_population(), reads in 1usize..4) {
        let world = populate(&population);
        let total: usize = population.values().sum();

        let mut ctx = resolve("ops", None, "platform_admin")
            .unwrap()
            .bind(&world.binder, world.pool.try_acquire().unwrap());
        for _ in 0..reads {
            prop_assert_eq!(ctx.db().select(TABLE, &Filter::All).unwrap().len(), total);
            prop_assert!(ctx.db().is_clean());
        }
        prop_assert_eq!(world.trail.of_kind(AuditEventKind::AdminBypass).len(), reads);
    }

    /// Property: Unbinding any number of times leaves the same clean,
    /// deny-all state.
    #[test]
    fn proptest_unbind_is_idempotent(
        population in arb_population(),
        times in 1usize..5,
        pick in any::<prop::sample::Index>(),
    ) {
        let world = populate(&population);
        let tenants: Vec<&String> = population.keys().collect();
        let tenant = tenants[pick.index(tenants.len())];

        let mut ctx = resolve("unbind", Some(tenant), "member")
            .unwrap()
            .bind(&world.binder, world.pool.try_acquire().unwrap());
        for _ in 0..times {
            ctx.db().unbind();
            prop_assert!(ctx.db().is_clean());
            prop_assert!(ctx.db().context().is_none());
        }
        prop_assert!(ctx.db().select(TABLE, &Filter::All).unwrap().is_empty());
    }

    /// Property: Any sequence of contexts on one reused physical connection
    /// sees only the current context's rows.
    #[test]
    fn proptest_reuse_leaves_no_residue(
        population in arb_population(),
        sequence in prop::collection::vec(any::<prop::sample::Index>(), 1..8),
    ) {
        let world = populate(&population);
        let tenants: Vec<&String> = population.keys().collect();
        let mut physical = None;

        for (step, pick) in sequence.iter().enumerate() {
            let tenant = tenants[pick.index(tenants.len())];
            let mut ctx = resolve(&format!("step-{step}"), Some(tenant), "member")
                .unwrap()
                .bind(&world.binder, world.pool.try_acquire().unwrap());

            let id = ctx.db().connection_id();
            prop_assert!(physical.is_none() || physical == id);
            physical = id;

            let rows = ctx.db().select(TABLE, &Filter::All).unwrap();
            prop_assert_eq!(rows.len(), population[tenant]);
            prop_assert!(rows.iter().all(|r| r.tenant_id.as_str() == tenant.as_str()));
        }
        prop_assert!(world.trail.of_kind(AuditEventKind::BindingLeak).is_empty());
    }
}
