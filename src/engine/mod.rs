//! In-process storage engine enforcing row policies.
//!
//! This module provides:
//! - `Database`: shared table store with per-table [`PolicySet`]s
//! - `Connection`: a physical connection carrying session settings, only
//!   reachable through [`crate::pool::Pool`] and [`crate::binder::Binder`]
//! - `Row`, `NewRow`, `Patch`, `Filter`: statement inputs and outputs
//!
//! Policies are attached at table creation and applied to every statement
//! by the engine itself; a statement's own filter only ever narrows what the
//! policy already allows.

mod connection;
mod table;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::config::{ConfigError, SessionVars};
use crate::policy::{is_identifier, Command, PolicySet, TENANT_COLUMN};
use crate::tenant::TenantId;

pub(crate) use connection::Connection;
pub(crate) use table::Table;

/// Identifier of a row within a table.
pub type RowId = u64;

/// Name of the row identifier column.
pub const ID_COLUMN: &str = "id";

/// Storage engine errors.
///
/// `PolicyViolation` never carries row contents or the foreign tenant id;
/// it names only the table and the command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The table does not exist
    #[error("table '{0}' does not exist")]
    UnknownTable(String),
    /// A table with this name already exists
    #[error("table '{0}' already exists")]
    TableExists(String),
    /// A table name is not a plain SQL identifier
    #[error("'{0}' is not a valid table name")]
    InvalidIdentifier(String),
    /// A new row image failed the table's WITH CHECK policy
    #[error("new row violates row-level security policy for table '{table}' ({command})")]
    PolicyViolation {
        /// Table name
        table: String,
        /// Statement kind
        command: Command,
    },
    /// A required column was null
    #[error("null value in column '{column}' of table '{table}'")]
    NotNullViolation {
        /// Table name
        table: String,
        /// Column name
        column: &'static str,
    },
    /// An update tried to change a column that is fixed once set
    #[error("column '{column}' of table '{table}' cannot be changed")]
    ImmutableColumn {
        /// Table name
        table: String,
        /// Column name
        column: &'static str,
    },
    /// Row data used an engine-managed column name
    #[error("column '{0}' is managed by the engine")]
    ReservedColumn(String),
    /// `begin` while a transaction is open
    #[error("a transaction is already in progress")]
    TransactionInProgress,
    /// `commit`/`rollback` without an open transaction
    #[error("no transaction in progress")]
    NoTransaction,
}

/// A stored row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    /// Row identifier
    pub id: RowId,
    /// Owning tenant; never null, never changed
    pub tenant_id: TenantId,
    /// Remaining columns
    pub data: Map<String, Value>,
}

impl Row {
    /// Returns a column value, including the engine-managed columns.
    pub fn get(&self, column: &str) -> Option<Value> {
        match column {
            ID_COLUMN => Some(Value::from(self.id)),
            TENANT_COLUMN => Some(Value::from(self.tenant_id.as_str())),
            other => self.data.get(other).cloned(),
        }
    }
}

/// A row to insert.
///
/// When no tenant is given the engine fills it from the connection's bound
/// tenant setting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewRow {
    /// Explicit owning tenant
    pub tenant_id: Option<TenantId>,
    /// Column values
    pub data: Map<String, Value>,
}

impl NewRow {
    /// Creates an empty row owned by the bound tenant.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty row owned by an explicit tenant.
    pub fn for_tenant(tenant: TenantId) -> Self {
        Self {
            tenant_id: Some(tenant),
            data: Map::new(),
        }
    }

    /// Sets a column value.
    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(column.into(), value.into());
        self
    }
}

/// Column changes for an update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    /// New owning tenant; any change is rejected
    pub tenant_id: Option<TenantId>,
    /// Column values to set
    pub data: Map<String, Value>,
}

impl Patch {
    /// Creates an empty patch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a column value.
    pub fn set(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(column.into(), value.into());
        self
    }

    /// Attempts to move the row to another tenant.
    pub fn reassign_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant_id = Some(tenant);
        self
    }
}

/// Outcome of an UPDATE or DELETE.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Affected {
    /// Rows changed or removed
    pub(crate) rows: u64,
    /// Rows the statement named that the policy kept out of reach
    pub(crate) denied: u64,
}

/// Statement-level row filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Every row the policy allows
    All,
    /// A single row by id
    Id(RowId),
    /// Rows whose column equals a value
    Eq(String, Value),
}

impl Filter {
    /// Shorthand for [`Filter::Eq`].
    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Filter::Eq(column.into(), value.into())
    }

    /// True for filters that name rows (`Id`, `Eq`) rather than sweep the
    /// whole visible table.
    pub(crate) fn is_targeted(&self) -> bool {
        !matches!(self, Filter::All)
    }

    pub(crate) fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::All => true,
            Filter::Id(id) => row.id == *id,
            Filter::Eq(column, value) => row.get(column).as_ref() == Some(value),
        }
    }
}

/// Schema of a tenant-scoped table.
///
/// Every table carries a policy set; a schema built without one gets
/// [`PolicySet::tenant_isolation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    name: String,
    policy: PolicySet,
}

impl TableSchema {
    /// Creates a schema with the standard tenant isolation policy.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            policy: PolicySet::tenant_isolation(),
        }
    }

    /// Replaces the policy set.
    pub fn with_policy(mut self, policy: PolicySet) -> Self {
        self.policy = policy;
        self
    }

    /// Returns the table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the policy set.
    pub fn policy(&self) -> &PolicySet {
        &self.policy
    }
}

/// Connection settings as seen by policy predicates.
///
/// Transaction-local values shadow session values and vanish when the
/// transaction ends.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    session: HashMap<String, String>,
    local: HashMap<String, String>,
}

impl Settings {
    /// Returns the effective value of a setting.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.local
            .get(name)
            .or_else(|| self.session.get(name))
            .map(String::as_str)
    }

    pub(crate) fn set_session(&mut self, name: &str, value: &str) {
        self.session.insert(name.to_string(), value.to_string());
    }

    pub(crate) fn set_local(&mut self, name: &str, value: &str) {
        self.local.insert(name.to_string(), value.to_string());
    }

    pub(crate) fn remove(&mut self, name: &str) {
        self.session.remove(name);
        self.local.remove(name);
    }

    pub(crate) fn clear_local(&mut self) {
        self.local.clear();
    }

    pub(crate) fn clear(&mut self) {
        self.session.clear();
        self.local.clear();
    }

    /// Returns true if no setting is present.
    pub fn is_empty(&self) -> bool {
        self.session.is_empty() && self.local.is_empty()
    }
}

/// Physical connection identifier, stable for the connection's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug)]
struct DatabaseInner {
    vars: SessionVars,
    tables: RwLock<HashMap<String, Table>>,
    next_connection: AtomicU64,
}

/// Shared handle to the table store.
///
/// Cloning is cheap; all clones see the same tables.
///
/// Connections come only from a [`crate::pool::Pool`]; a database handle
/// cannot open one directly:
///
/// ```compile_fail
/// use tenancy_core::engine::Database;
///
/// let db = Database::default();
/// let mut raw = db.connect(); // Error: connect is private to the crate
/// ```
#[derive(Debug, Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    /// Creates an empty database whose policies read the given settings.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if a setting name is not a
    /// `namespace.name` identifier or both names are the same.
    pub fn new(vars: SessionVars) -> Result<Self, ConfigError> {
        vars.validate()?;
        Ok(Self::with_vars(vars))
    }

    fn with_vars(vars: SessionVars) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                vars,
                tables: RwLock::new(HashMap::new()),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    /// Returns the setting names policies read.
    pub fn vars(&self) -> &SessionVars {
        &self.inner.vars
    }

    /// Creates a table with its policy set.
    ///
    /// # Errors
    ///
    /// - `EngineError::InvalidIdentifier` if the name is not a plain SQL
    ///   identifier
    /// - `EngineError::TableExists` if the name is taken
    pub fn create_table(&self, schema: TableSchema) -> Result<(), EngineError> {
        if !is_identifier(schema.name()) {
            return Err(EngineError::InvalidIdentifier(schema.name().to_string()));
        }
        let mut tables = self.inner.tables.write();
        if tables.contains_key(schema.name()) {
            return Err(EngineError::TableExists(schema.name().to_string()));
        }
        tracing::debug!(table = schema.name(), "table created with row policies");
        tables.insert(schema.name().to_string(), Table::new(schema));
        Ok(())
    }

    /// Returns the names of all tables, sorted.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.tables.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Renders the policy DDL of every table, in table-name order.
    pub fn policy_ddl(&self) -> Vec<String> {
        let tables = self.inner.tables.read();
        let mut names: Vec<&String> = tables.keys().collect();
        names.sort();
        names
            .into_iter()
            .flat_map(|name| {
                tables[name]
                    .schema()
                    .policy()
                    .to_postgres_ddl(name, &self.inner.vars)
            })
            .collect()
    }

    /// Opens a new physical connection with no settings bound.
    pub(crate) fn connect(&self) -> Connection {
        let id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        Connection::new(ConnectionId(id), self.clone())
    }

    pub(crate) fn tables(&self) -> &RwLock<HashMap<String, Table>> {
        &self.inner.tables
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::with_vars(SessionVars::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_table_rejects_duplicates() {
        let db = Database::default();
        db.create_table(TableSchema::new("patients")).unwrap();
        assert_eq!(
            db.create_table(TableSchema::new("patients")),
            Err(EngineError::TableExists("patients".to_string()))
        );
        assert_eq!(db.table_names(), vec!["patients".to_string()]);
    }

    #[test]
    fn connections_get_distinct_ids() {
        let db = Database::default();
        let a = db.connect();
        let b = db.connect();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn policy_ddl_is_rendered_per_table() {
        let db = Database::default();
        db.create_table(TableSchema::new("orders")).unwrap();
        db.create_table(TableSchema::new("patients")).unwrap();
        let ddl = db.policy_ddl();
        assert_eq!(ddl.len(), 12);
        assert!(ddl[0].starts_with("ALTER TABLE \"orders\""));
        assert!(ddl[6].starts_with("ALTER TABLE \"patients\""));
    }

    #[test]
    fn create_table_rejects_non_identifiers() {
        let db = Database::default();
        for name in ["", "patients; DROP TABLE x", "o\"rders", "9lives"] {
            assert_eq!(
                db.create_table(TableSchema::new(name)),
                Err(EngineError::InvalidIdentifier(name.to_string()))
            );
        }
        assert!(db.table_names().is_empty());
    }

    #[test]
    fn new_validates_setting_names() {
        let vars = SessionVars {
            role_var: "app.role', true) OR true --".to_string(),
            ..SessionVars::default()
        };
        assert!(matches!(Database::new(vars), Err(ConfigError::Invalid { .. })));

        let same = SessionVars {
            role_var: "app.tenant_id".to_string(),
            ..SessionVars::default()
        };
        assert!(Database::new(same).is_err());
        assert!(Database::new(SessionVars::default()).is_ok());
    }

    #[test]
    fn filter_matches_virtual_columns() {
        let row = Row {
            id: 7,
            tenant_id: TenantId::parse("a").unwrap(),
            data: Map::new(),
        };
        assert!(Filter::Id(7).matches(&row));
        assert!(Filter::eq("tenant_id", "a").matches(&row));
        assert!(Filter::eq("id", 7).matches(&row));
        assert!(!Filter::eq("name", "x").matches(&row));
    }

    #[test]
    fn local_settings_shadow_session_settings() {
        let mut s = Settings::default();
        s.set_session("app.role", "member");
        s.set_local("app.role", "platform_admin");
        assert_eq!(s.get("app.role"), Some("platform_admin"));
        s.clear_local();
        assert_eq!(s.get("app.role"), Some("member"));
        s.clear();
        assert!(s.is_empty());
    }
}
