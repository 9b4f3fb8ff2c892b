//! Session context binder.
//!
//! [`Binder::bind`] turns a pooled connection plus a [`RequestContext`] into a
//! [`ScopedConnection`]: the only data-access handle handlers ever see.
//!
//! Tenant contexts are bound as session settings for the lifetime of the
//! scoped connection. The platform-admin bypass is never bound at session
//! level: each operation runs in its own transaction with the bypass role set
//! transaction-locally, so it disappears the moment the operation ends.
//!
//! Unbinding is idempotent and happens on drop, so every exit path of a
//! handler (return, `?`, panic unwind, future cancellation) resets the
//! connection before it is returned to the pool.

use std::sync::Arc;

use crate::audit::{AuditEvent, AuditEventKind, AuditOutcome, AuditSink};
use crate::config::SessionVars;
use crate::context::{RequestContext, Scope};
use crate::engine::{
    Affected, Connection, ConnectionId, EngineError, Filter, NewRow, Patch, Row, RowId,
};
use crate::error::DataError;
use crate::policy::{Command, TENANT_COLUMN};
use crate::pool::PooledConnection;
use crate::request::Role;

/// Binds request contexts onto pooled connections.
#[derive(Clone)]
pub struct Binder {
    vars: SessionVars,
    audit: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for Binder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binder").field("vars", &self.vars).finish()
    }
}

impl Binder {
    /// Creates a binder writing the given settings and reporting to `audit`.
    pub fn new(vars: SessionVars, audit: Arc<dyn AuditSink>) -> Self {
        Self { vars, audit }
    }

    /// Returns the setting names this binder writes.
    pub fn vars(&self) -> &SessionVars {
        &self.vars
    }

    /// Binds `context` onto `connection` for the request `request_id`.
    pub fn bind(
        &self,
        connection: PooledConnection,
        context: &RequestContext,
        request_id: &str,
    ) -> ScopedConnection {
        let mut scoped = ScopedConnection {
            conn: connection,
            vars: self.vars.clone(),
            audit: Arc::clone(&self.audit),
            request_id: request_id.to_string(),
            context: None,
        };
        scoped.rebind(context);
        scoped
    }
}

/// A pooled connection pre-scoped to one request's context.
///
/// Every data-access call is subject to the table's row policies under the
/// bound context:
/// - rows outside the context are simply absent from reads;
/// - writes the policies reject affect zero rows (`Ok(0)` / `Ok(None)`) and
///   are reported as [`AuditEventKind::WriteDenied`], so a caller cannot tell
///   "exists in another tenant" from "does not exist";
/// - with no context bound (after [`ScopedConnection::unbind`]) nothing is
///   visible and nothing is writable.
///
/// The context is fixed at [`Binder::bind`]. A handler holding the scoped
/// connection cannot swap in another one:
///
/// ```compile_fail
/// use tenancy_core::{RequestContext, ScopedConnection};
///
/// fn widen(db: &mut ScopedConnection, other: &RequestContext) {
///     db.rebind(other); // Error: rebind is private to the crate
/// }
/// ```
///
/// Nor can it reach the raw connection underneath and rewrite its settings:
///
/// ```compile_fail
/// use tenancy_core::engine::Connection; // Error: Connection is private
/// ```
pub struct ScopedConnection {
    conn: PooledConnection,
    vars: SessionVars,
    audit: Arc<dyn AuditSink>,
    request_id: String,
    context: Option<RequestContext>,
}

impl std::fmt::Debug for ScopedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopedConnection")
            .field("connection", &self.conn.physical_id())
            .field("request_id", &self.request_id)
            .field("scope", &self.context.as_ref().map(|c| c.scope().to_string()))
            .finish()
    }
}

impl ScopedConnection {
    // ========================================================================
    // Binding lifecycle
    // ========================================================================

    /// Returns the bound context, or `None` once unbound.
    pub fn context(&self) -> Option<&RequestContext> {
        self.context.as_ref()
    }

    /// Returns the physical connection id.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.conn.physical_id()
    }

    /// Returns true if the underlying connection carries no settings.
    pub fn is_clean(&self) -> bool {
        self.conn.is_clean()
    }

    /// Resets the connection to the deny-all state.
    ///
    /// Safe to call any number of times.
    pub fn unbind(&mut self) {
        if let Some(conn) = self.conn.connection_mut() {
            conn.reset_all();
        }
        if let Some(context) = self.context.take() {
            tracing::debug!(
                request_id = %self.request_id,
                connection = ?self.conn.physical_id(),
                scope = %context.scope(),
                "context unbound"
            );
        }
    }

    /// Replaces the bound context on the same physical connection.
    ///
    /// The previous binding is fully reset first.
    pub(crate) fn rebind(&mut self, context: &RequestContext) {
        self.unbind();
        if let (Scope::Tenant(tenant), Some(conn)) = (context.scope(), self.conn.connection_mut()) {
            conn.set_config(&self.vars.tenant_var, Some(tenant.as_str()), false);
            conn.set_config(&self.vars.role_var, Some(context.role().as_str()), false);
        }
        tracing::debug!(
            request_id = %self.request_id,
            connection = ?self.conn.physical_id(),
            scope = %context.scope(),
            role = %context.role(),
            "context bound"
        );
        self.context = Some(context.clone());
    }

    // ========================================================================
    // Data access
    // ========================================================================

    /// Reads rows matching `filter` that the bound context may see.
    ///
    /// # Errors
    ///
    /// Returns `DataError::Engine` for engine failures such as an unknown
    /// table; invisible rows are never an error.
    pub fn select(&mut self, table: &str, filter: &Filter) -> Result<Vec<Row>, DataError> {
        Ok(self
            .run(table, Command::Select, |conn| conn.select(table, filter))?
            .unwrap_or_default())
    }

    /// Inserts a row, returning its id, or `None` if policy denied the write.
    ///
    /// # Errors
    ///
    /// Returns `DataError::Engine` for failures other than a policy denial.
    pub fn insert(&mut self, table: &str, row: NewRow) -> Result<Option<RowId>, DataError> {
        self.run(table, Command::Insert, |conn| conn.insert(table, row))
    }

    /// Updates rows matching `filter`, returning how many changed.
    ///
    /// When `filter` names rows the bound context cannot see, the statement
    /// still returns the visible count and the attempt is reported as
    /// [`AuditEventKind::WriteDenied`].
    ///
    /// # Errors
    ///
    /// Returns `DataError::Engine` for failures other than a policy denial,
    /// including `ImmutableColumn` when the patch moves a row to another
    /// tenant.
    pub fn update(&mut self, table: &str, filter: &Filter, patch: &Patch) -> Result<u64, DataError> {
        let affected = self.run(table, Command::Update, |conn| conn.update(table, filter, patch))?;
        Ok(self.settle(table, Command::Update, affected))
    }

    /// Deletes rows matching `filter`, returning how many were removed.
    ///
    /// Denials are reported as for [`ScopedConnection::update`].
    ///
    /// # Errors
    ///
    /// Returns `DataError::Engine` for engine failures.
    pub fn delete(&mut self, table: &str, filter: &Filter) -> Result<u64, DataError> {
        let affected = self.run(table, Command::Delete, |conn| conn.delete(table, filter))?;
        Ok(self.settle(table, Command::Delete, affected))
    }

    fn settle(&self, table: &str, command: Command, affected: Option<Affected>) -> u64 {
        match affected {
            Some(a) => {
                if a.denied > 0 {
                    self.report_denied(table, command);
                }
                a.rows
            }
            None => 0,
        }
    }

    // Runs one statement under the bound context. `Ok(None)` means the
    // statement was denied by policy.
    fn run<T>(
        &mut self,
        table: &str,
        command: Command,
        op: impl FnOnce(&mut Connection) -> Result<T, EngineError>,
    ) -> Result<Option<T>, DataError> {
        let bypass = self.context.as_ref().is_some_and(RequestContext::is_bypass);
        let conn = self.conn.connection_mut().ok_or(DataError::Released)?;

        let result = if bypass {
            run_with_bypass(conn, &self.vars, op)
        } else {
            op(conn)
        };

        if bypass {
            self.report_bypass(table, command, result.is_ok());
        }

        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) if self.is_denial(&err) => {
                self.report_denied(table, command);
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn is_denial(&self, err: &EngineError) -> bool {
        match err {
            EngineError::PolicyViolation { .. } => true,
            // With nothing bound there is no tenant to default to; the write
            // is denied like any other unbound write.
            EngineError::NotNullViolation { column, .. } => {
                self.context.is_none() && *column == TENANT_COLUMN
            }
            _ => false,
        }
    }

    fn report_denied(&self, table: &str, command: Command) {
        tracing::warn!(
            request_id = %self.request_id,
            connection = ?self.conn.physical_id(),
            table,
            command = %command,
            "write denied by row policy"
        );
        let event = match &self.context {
            Some(context) => AuditEvent::for_context(
                &self.request_id,
                context,
                AuditEventKind::WriteDenied,
                AuditOutcome::Denied,
            ),
            None => AuditEvent::new(&self.request_id, AuditEventKind::WriteDenied, AuditOutcome::Denied)
                .with_detail("no context bound"),
        };
        self.audit.record(event.with_table(table).with_command(command));
    }

    fn report_bypass(&self, table: &str, command: Command, succeeded: bool) {
        let Some(context) = &self.context else {
            return;
        };
        let outcome = if succeeded {
            AuditOutcome::Success
        } else {
            AuditOutcome::Error
        };
        tracing::info!(
            request_id = %self.request_id,
            principal = context.principal_id(),
            table,
            command = %command,
            outcome = %outcome,
            "platform admin bypass"
        );
        let mut event =
            AuditEvent::for_context(&self.request_id, context, AuditEventKind::AdminBypass, outcome)
                .with_table(table)
                .with_command(command);
        if let Some(id) = self.conn.physical_id() {
            event = event.with_connection(id);
        }
        self.audit.record(event);
    }
}

impl Drop for ScopedConnection {
    fn drop(&mut self) {
        self.unbind();
    }
}

// One operation, one transaction: the bypass role exists only between
// `begin` and `commit`/`rollback`.
fn run_with_bypass<T>(
    conn: &mut Connection,
    vars: &SessionVars,
    op: impl FnOnce(&mut Connection) -> Result<T, EngineError>,
) -> Result<T, EngineError> {
    conn.begin()?;
    conn.set_config(&vars.role_var, Some(Role::PlatformAdmin.as_str()), true);
    match op(conn) {
        Ok(value) => {
            conn.commit()?;
            Ok(value)
        }
        Err(err) => {
            conn.rollback()?;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditTrail;
    use crate::config::PoolConfig;
    use crate::engine::{Database, TableSchema};
    use crate::pool::Pool;
    use crate::tenant::TenantId;

    fn tid(s: &str) -> TenantId {
        TenantId::parse(s).unwrap()
    }

    struct Fixture {
        pool: Pool,
        binder: Binder,
        trail: Arc<AuditTrail>,
    }

    fn fixture() -> Fixture {
        let db = Database::default();
        db.create_table(TableSchema::new("patients")).unwrap();
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

        let admin = RequestContext::all_tenants("seed");
        let mut conn = binder.bind(pool.try_acquire().unwrap(), &admin, "seed");
        conn.insert("patients", NewRow::for_tenant(tid("a")).set("name", "Ada"))
            .unwrap();
        conn.insert("patients", NewRow::for_tenant(tid("b")).set("name", "Bo"))
            .unwrap();
        drop(conn);
        trail.clear();

        Fixture { pool, binder, trail }
    }

    fn tenant(t: &str) -> RequestContext {
        RequestContext::for_tenant("u1", tid(t), Role::Member)
    }

    #[test]
    fn tenant_binding_filters_reads() {
        let f = fixture();
        let mut conn = f.binder.bind(f.pool.try_acquire().unwrap(), &tenant("a"), "r1");
        let rows = conn.select("patients", &Filter::All).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tenant_id, tid("a"));
    }

    #[test]
    fn denied_insert_affects_zero_rows_and_is_audited() {
        let f = fixture();
        let mut conn = f.binder.bind(f.pool.try_acquire().unwrap(), &tenant("b"), "r2");
        let id = conn
            .insert("patients", NewRow::for_tenant(tid("a")).set("name", "Eve"))
            .unwrap();
        assert_eq!(id, None);

        let denied = f.trail.of_kind(AuditEventKind::WriteDenied);
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].request_id(), "r2");
        assert_eq!(denied[0].scope(), Some("tenant:b"));
        assert_eq!(denied[0].command(), Some("INSERT"));
    }

    #[test]
    fn tenant_reassignment_is_an_error_not_a_silent_fix() {
        let f = fixture();
        let admin = RequestContext::all_tenants("ops");
        let mut conn = f.binder.bind(f.pool.try_acquire().unwrap(), &admin, "r3");
        let err = conn
            .update(
                "patients",
                &Filter::eq("name", "Ada"),
                &Patch::new().reassign_tenant(tid("b")),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            DataError::Engine(EngineError::ImmutableColumn { .. })
        ));
        let bypass = f.trail.of_kind(AuditEventKind::AdminBypass);
        assert_eq!(bypass.len(), 1);
        assert_eq!(bypass[0].outcome(), AuditOutcome::Error);
    }

    #[test]
    fn bypass_is_bound_per_operation_only() {
        let f = fixture();
        let admin = RequestContext::all_tenants("ops");
        let mut conn = f.binder.bind(f.pool.try_acquire().unwrap(), &admin, "r4");

        assert!(conn.is_clean());
        assert_eq!(conn.select("patients", &Filter::All).unwrap().len(), 2);
        assert!(conn.is_clean());
        assert_eq!(f.trail.of_kind(AuditEventKind::AdminBypass).len(), 1);
    }

    #[test]
    fn unbind_is_idempotent_and_denies_everything() {
        let f = fixture();
        let mut conn = f.binder.bind(f.pool.try_acquire().unwrap(), &tenant("a"), "r5");
        conn.unbind();
        conn.unbind();
        assert!(conn.context().is_none());
        assert!(conn.is_clean());
        assert!(conn.select("patients", &Filter::All).unwrap().is_empty());
        assert_eq!(conn.insert("patients", NewRow::new()).unwrap(), None);
        assert_eq!(conn.delete("patients", &Filter::All).unwrap(), 0);
    }

    #[test]
    fn rebind_on_same_connection_leaves_no_residue() {
        let f = fixture();
        let mut conn = f.binder.bind(f.pool.try_acquire().unwrap(), &tenant("a"), "r6");
        let physical = conn.connection_id();
        assert_eq!(conn.select("patients", &Filter::All).unwrap()[0].tenant_id, tid("a"));

        conn.rebind(&tenant("b"));
        assert_eq!(conn.connection_id(), physical);
        let rows = conn.select("patients", &Filter::All).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tenant_id, tid("b"));
    }

    #[test]
    fn drop_returns_a_clean_connection() {
        let f = fixture();
        let conn = f.binder.bind(f.pool.try_acquire().unwrap(), &tenant("a"), "r7");
        let physical = conn.connection_id();
        drop(conn);

        let pooled = f.pool.try_acquire().unwrap();
        assert_eq!(pooled.physical_id(), physical);
        assert!(pooled.is_clean());
        assert!(f.trail.of_kind(AuditEventKind::BindingLeak).is_empty());
    }

    #[test]
    fn member_update_of_foreign_row_is_zero_rows() {
        let f = fixture();
        let mut conn = f.binder.bind(f.pool.try_acquire().unwrap(), &tenant("a"), "r8");
        let n = conn
            .update("patients", &Filter::eq("name", "Bo"), &Patch::new().set("name", "X"))
            .unwrap();
        assert_eq!(n, 0);
        assert_eq!(f.trail.of_kind(AuditEventKind::WriteDenied).len(), 1);
    }

    #[test]
    fn foreign_row_by_id_is_zero_rows_and_audited() {
        let f = fixture();
        let admin = RequestContext::all_tenants("ops");
        let mut ops = f.binder.bind(f.pool.try_acquire().unwrap(), &admin, "lookup");
        let b_row = ops.select("patients", &Filter::eq("name", "Bo")).unwrap()[0].id;
        drop(ops);
        f.trail.clear();

        let mut conn = f.binder.bind(f.pool.try_acquire().unwrap(), &tenant("a"), "r9");
        let updated = conn
            .update("patients", &Filter::Id(b_row), &Patch::new().set("name", "Eve"))
            .unwrap();
        let deleted = conn.delete("patients", &Filter::Id(b_row)).unwrap();
        assert_eq!((updated, deleted), (0, 0));

        let denied = f.trail.of_kind(AuditEventKind::WriteDenied);
        assert_eq!(denied.len(), 2);
        assert_eq!(denied[0].command(), Some("UPDATE"));
        assert_eq!(denied[1].command(), Some("DELETE"));
        assert!(denied.iter().all(|e| e.request_id() == "r9"));
        assert_eq!(denied[0].scope(), Some("tenant:a"));
    }

    #[test]
    fn sweeping_writes_report_no_denial() {
        let f = fixture();
        let mut conn = f.binder.bind(f.pool.try_acquire().unwrap(), &tenant("a"), "r10");
        let n = conn
            .update("patients", &Filter::All, &Patch::new().set("seen", true))
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(conn.delete("patients", &Filter::All).unwrap(), 1);
        assert!(f.trail.of_kind(AuditEventKind::WriteDenied).is_empty());
    }
}
