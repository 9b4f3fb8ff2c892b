//! PostgreSQL binding through `sqlx`.
//!
//! The in-process engine mirrors PostgreSQL row level security; this module
//! applies the same binding discipline to a real server:
//!
//! - settings are written with `set_config($1, $2, true)`, i.e. bound
//!   parameters and transaction-local, never interpolated into SQL text;
//! - every scope is a transaction, so commit, rollback or drop of the
//!   transaction clears the binding before the connection is reused;
//! - policies come from [`PolicySet::to_postgres_ddl`].

use sqlx::{PgConnection, PgPool, Postgres, Transaction};

use crate::config::SessionVars;
use crate::context::{RequestContext, Scope};
use crate::policy::PolicySet;

/// The `(setting, value)` pairs a context binds.
///
/// The bypass scope binds only the role; no tenant value exists for it.
pub fn bindings<'a>(context: &RequestContext, vars: &'a SessionVars) -> Vec<(&'a str, String)> {
    let mut pairs = Vec::with_capacity(2);
    if let Scope::Tenant(tenant) = context.scope() {
        pairs.push((vars.tenant_var.as_str(), tenant.as_str().to_string()));
    }
    pairs.push((vars.role_var.as_str(), context.role().as_str().to_string()));
    pairs
}

/// Binds `context` onto an open transaction.
///
/// # Errors
///
/// Returns the driver error if a `set_config` call fails.
pub async fn bind_transaction(
    tx: &mut Transaction<'_, Postgres>,
    vars: &SessionVars,
    context: &RequestContext,
) -> Result<(), sqlx::Error> {
    for (name, value) in bindings(context, vars) {
        sqlx::query("SELECT set_config($1, $2, true)")
            .bind(name)
            .bind(value)
            .execute(&mut **tx)
            .await?;
    }
    tracing::debug!(scope = %context.scope(), role = %context.role(), "postgres transaction bound");
    Ok(())
}

/// Begins a transaction on `pool` with `context` already bound.
///
/// # Errors
///
/// Returns the driver error if the transaction cannot be started or bound.
pub async fn begin_scoped(
    pool: &PgPool,
    vars: &SessionVars,
    context: &RequestContext,
) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    bind_transaction(&mut tx, vars, context).await?;
    Ok(tx)
}

/// Clears both settings at session level on a raw connection.
///
/// # Errors
///
/// Returns the driver error if a reset fails.
pub async fn reset_session(conn: &mut PgConnection, vars: &SessionVars) -> Result<(), sqlx::Error> {
    for name in [&vars.tenant_var, &vars.role_var] {
        sqlx::query("SELECT set_config($1, NULL, false)")
            .bind(name.as_str())
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

/// Enables, forces and creates the row policies for `table`.
///
/// # Errors
///
/// Returns the driver error of the first failing statement.
pub async fn install_policies(
    conn: &mut PgConnection,
    table: &str,
    policy: &PolicySet,
    vars: &SessionVars,
) -> Result<(), sqlx::Error> {
    for statement in policy.to_postgres_ddl(table, vars) {
        sqlx::query(&statement).execute(&mut *conn).await?;
    }
    tracing::info!(table, "row policies installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Role;
    use crate::tenant::TenantId;

    #[test]
    fn tenant_context_binds_tenant_and_role() {
        let vars = SessionVars::default();
        let ctx = RequestContext::for_tenant("u1", TenantId::parse("a").unwrap(), Role::TenantAdmin);
        assert_eq!(
            bindings(&ctx, &vars),
            vec![
                ("app.tenant_id", "a".to_string()),
                ("app.role", "tenant_admin".to_string())
            ]
        );
    }

    #[test]
    fn bypass_binds_role_only() {
        let vars = SessionVars::default();
        let ctx = RequestContext::all_tenants("ops");
        assert_eq!(
            bindings(&ctx, &vars),
            vec![("app.role", "platform_admin".to_string())]
        );
    }
}
