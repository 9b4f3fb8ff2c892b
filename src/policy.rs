//! Declarative row policies.
//!
//! A [`PolicySet`] is attached to a table when the table is created and is
//! evaluated by the storage engine for every statement, independent of the
//! statement's own filter. Predicates read the bound tenant and role from
//! connection settings, never from statement text, and an unset setting never
//! matches anything: with no bound context every predicate built from
//! [`Predicate::TenantMatches`] and [`Predicate::RoleIs`] is false.

use std::fmt;

use crate::config::SessionVars;
use crate::engine::Settings;
use crate::request::Role;
use crate::tenant::TenantId;

/// Name of the owning-tenant column on every tenant-scoped table.
pub const TENANT_COLUMN: &str = "tenant_id";

/// Longest identifier PostgreSQL keeps without truncation.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Returns true if `name` is a plain SQL identifier: an ASCII letter or
/// underscore followed by letters, digits or underscores.
///
/// ```
/// use tenancy_core::policy::is_identifier;
///
/// assert!(is_identifier("patients"));
/// assert!(!is_identifier("patients; DROP TABLE x"));
/// assert!(!is_identifier("1st"));
/// ```
pub fn is_identifier(name: &str) -> bool {
    name.len() <= MAX_IDENTIFIER_LEN
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Statement kind a policy applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Reads
    Select,
    /// New rows
    Insert,
    /// Modifications of existing rows
    Update,
    /// Removals
    Delete,
}

impl Command {
    /// Returns the SQL keyword for this command.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Command::Select => "SELECT",
            Command::Insert => "INSERT",
            Command::Update => "UPDATE",
            Command::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// A row predicate evaluated against the connection's bound settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Always true
    Allow,
    /// Always false
    Deny,
    /// The row's tenant equals the bound tenant setting
    TenantMatches,
    /// The bound role setting equals this role
    RoleIs(Role),
    /// Any of the inner predicates holds (false when empty)
    Any(Vec<Predicate>),
    /// All of the inner predicates hold (true when empty)
    All(Vec<Predicate>),
}

impl Predicate {
    /// The standard isolation predicate: own tenant, or the bypass role.
    pub fn tenant_or_bypass() -> Self {
        Predicate::Any(vec![
            Predicate::TenantMatches,
            Predicate::RoleIs(Role::PlatformAdmin),
        ])
    }

    /// Evaluates the predicate for a row owned by `row_tenant`.
    pub fn evaluate(&self, row_tenant: &TenantId, settings: &Settings, vars: &SessionVars) -> bool {
        match self {
            Predicate::Allow => true,
            Predicate::Deny => false,
            Predicate::TenantMatches => settings
                .get(&vars.tenant_var)
                .is_some_and(|bound| bound == row_tenant.as_str()),
            Predicate::RoleIs(role) => settings
                .get(&vars.role_var)
                .is_some_and(|bound| bound == role.as_str()),
            Predicate::Any(inner) => inner.iter().any(|p| p.evaluate(row_tenant, settings, vars)),
            Predicate::All(inner) => inner.iter().all(|p| p.evaluate(row_tenant, settings, vars)),
        }
    }

    /// Renders the predicate as a PostgreSQL boolean expression.
    ///
    /// Settings are read with `current_setting(name, true)`, which yields
    /// NULL when unset, so the rendered expression fails closed too.
    pub fn to_sql(&self, vars: &SessionVars) -> String {
        match self {
            Predicate::Allow => "true".to_string(),
            Predicate::Deny => "false".to_string(),
            Predicate::TenantMatches => format!(
                "{} = current_setting({}, true)",
                TENANT_COLUMN,
                quote_literal(&vars.tenant_var)
            ),
            Predicate::RoleIs(role) => format!(
                "current_setting({}, true) = {}",
                quote_literal(&vars.role_var),
                quote_literal(role.as_str())
            ),
            Predicate::Any(inner) if inner.is_empty() => "false".to_string(),
            Predicate::All(inner) if inner.is_empty() => "true".to_string(),
            Predicate::Any(inner) => join_sql(inner, " OR ", vars),
            Predicate::All(inner) => join_sql(inner, " AND ", vars),
        }
    }
}

fn join_sql(inner: &[Predicate], op: &str, vars: &SessionVars) -> String {
    let parts: Vec<String> = inner.iter().map(|p| p.to_sql(vars)).collect();
    format!("({})", parts.join(op))
}

/// One policy per command for a single table.
///
/// `USING` predicates decide which existing rows a statement can see;
/// `WITH CHECK` predicates decide whether a new row image may be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicySet {
    /// Visibility for reads
    pub select: Predicate,
    /// Check applied to inserted rows
    pub insert_check: Predicate,
    /// Rows an update may target
    pub update_using: Predicate,
    /// Check applied to the updated row image
    pub update_check: Predicate,
    /// Rows a delete may target
    pub delete: Predicate,
}

impl PolicySet {
    /// Standard tenant isolation: every command is limited to the bound
    /// tenant, unless the platform-admin bypass is bound.
    ///
    /// # Examples
    ///
    /// ```
    /// use tenancy_core::policy::{PolicySet, Predicate};
    ///
    /// let set = PolicySet::tenant_isolation();
    /// assert_eq!(set.select, Predicate::tenant_or_bypass());
    /// assert_eq!(set.delete, set.select);
    /// ```
    pub fn tenant_isolation() -> Self {
        let p = Predicate::tenant_or_bypass();
        Self {
            select: p.clone(),
            insert_check: p.clone(),
            update_using: p.clone(),
            update_check: p.clone(),
            delete: p,
        }
    }

    /// Tenant isolation where only tenant administrators (or the bypass)
    /// may write; members read.
    pub fn admin_writes() -> Self {
        let admin_in_tenant = Predicate::All(vec![
            Predicate::TenantMatches,
            Predicate::RoleIs(Role::TenantAdmin),
        ]);
        let write = Predicate::Any(vec![admin_in_tenant, Predicate::RoleIs(Role::PlatformAdmin)]);
        Self {
            select: Predicate::tenant_or_bypass(),
            insert_check: write.clone(),
            update_using: write.clone(),
            update_check: write.clone(),
            delete: write,
        }
    }

    /// Renders the policy set as PostgreSQL DDL statements for `table`.
    ///
    /// Row level security is both enabled and forced so the table owner is
    /// subject to the policies as well. Table and policy names are quoted
    /// identifiers.
    pub fn to_postgres_ddl(&self, table: &str, vars: &SessionVars) -> Vec<String> {
        let t = quote_ident(table);
        let policy = |command: &str| quote_ident(&format!("{table}_{command}"));
        vec![
            format!("ALTER TABLE {t} ENABLE ROW LEVEL SECURITY"),
            format!("ALTER TABLE {t} FORCE ROW LEVEL SECURITY"),
            format!(
                "CREATE POLICY {} ON {t} FOR SELECT USING ({})",
                policy("select"),
                self.select.to_sql(vars)
            ),
            format!(
                "CREATE POLICY {} ON {t} FOR INSERT WITH CHECK ({})",
                policy("insert"),
                self.insert_check.to_sql(vars)
            ),
            format!(
                "CREATE POLICY {} ON {t} FOR UPDATE USING ({}) WITH CHECK ({})",
                policy("update"),
                self.update_using.to_sql(vars),
                self.update_check.to_sql(vars)
            ),
            format!(
                "CREATE POLICY {} ON {t} FOR DELETE USING ({})",
                policy("delete"),
                self.delete.to_sql(vars)
            ),
        ]
    }
}

impl Default for PolicySet {
    fn default() -> Self {
        Self::tenant_isolation()
    }
}
