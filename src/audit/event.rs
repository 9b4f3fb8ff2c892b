//! Audit event schema and types.

use std::fmt;

use serde::Serialize;

use crate::context::RequestContext;
use crate::engine::ConnectionId;
use crate::policy::Command;

/// Kind of audit event being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// A request arrived without a resolvable tenant/role context
    MissingContext,
    /// A write was rejected by a row policy
    WriteDenied,
    /// An operation ran under the platform-admin bypass
    AdminBypass,
    /// A pooled connection was found still carrying a previous binding
    BindingLeak,
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditEventKind::MissingContext => write!(f, "missing_context"),
            AuditEventKind::WriteDenied => write!(f, "write_denied"),
            AuditEventKind::AdminBypass => write!(f, "admin_bypass"),
            AuditEventKind::BindingLeak => write!(f, "binding_leak"),
        }
    }
}

/// Outcome of an audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Operation succeeded
    Success,
    /// Operation was denied by policy
    Denied,
    /// Operation failed or a defect was detected
    Error,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditOutcome::Success => write!(f, "success"),
            AuditOutcome::Denied => write!(f, "denied"),
            AuditOutcome::Error => write!(f, "error"),
        }
    }
}

/// A structured audit event containing only safe metadata.
///
/// # Example
///
/// ```
/// use tenancy_core::audit::{AuditEvent, AuditEventKind, AuditOutcome};
/// use tenancy_core::policy::Command;
///
/// let event = AuditEvent::new("req-123", AuditEventKind::WriteDenied, AuditOutcome::Denied)
///     .with_principal("user-1")
///     .with_scope("tenant:clinic-a")
///     .with_table("patients")
///     .with_command(Command::Insert);
///
/// assert_eq!(event.request_id(), "req-123");
/// assert_eq!(event.table(), Some("patients"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    request_id: String,
    kind: AuditEventKind,
    outcome: AuditOutcome,
    principal: Option<String>,
    scope: Option<String>,
    role: Option<String>,
    table: Option<String>,
    command: Option<String>,
    connection: Option<String>,
    detail: Option<String>,
}

impl AuditEvent {
    /// Creates a new audit event with required fields.
    pub fn new(request_id: impl Into<String>, kind: AuditEventKind, outcome: AuditOutcome) -> Self {
        Self {
            request_id: request_id.into(),
            kind,
            outcome,
            principal: None,
            scope: None,
            role: None,
            table: None,
            command: None,
            connection: None,
            detail: None,
        }
    }

    /// Creates an event pre-filled with the principal, scope and role of a
    /// bound context.
    pub fn for_context(
        request_id: impl Into<String>,
        context: &RequestContext,
        kind: AuditEventKind,
        outcome: AuditOutcome,
    ) -> Self {
        let mut event = Self::new(request_id, kind, outcome)
            .with_principal(context.principal_id())
            .with_scope(context.scope().to_string());
        event.role = Some(context.role().to_string());
        event
    }

    /// Sets the acting principal.
    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    /// Sets the bound scope (`tenant:<id>` or `all-tenants`).
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Sets the affected table.
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    /// Sets the statement kind.
    pub fn with_command(mut self, command: Command) -> Self {
        self.command = Some(command.as_sql().to_string());
        self
    }

    /// Sets the physical connection involved.
    pub fn with_connection(mut self, connection: ConnectionId) -> Self {
        self.connection = Some(connection.to_string());
        self
    }

    /// Sets a short free-form detail.
    ///
    /// Callers must not pass row data or foreign tenant ids.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Returns the request identifier.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Returns the event kind.
    pub fn kind(&self) -> AuditEventKind {
        self.kind
    }

    /// Returns the operation outcome.
    pub fn outcome(&self) -> AuditOutcome {
        self.outcome
    }

    /// Returns the principal, if known.
    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    /// Returns the bound scope, if any.
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Returns the effective role, if any.
    pub fn role(&self) -> Option<&str> {
        self.role.as_deref()
    }

    /// Returns the table, if set.
    pub fn table(&self) -> Option<&str> {
        self.table.as_deref()
    }

    /// Returns the statement kind, if set.
    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    /// Returns the connection id, if set.
    pub fn connection(&self) -> Option<&str> {
        self.connection.as_deref()
    }

    /// Returns the detail, if set.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AuditEvent[kind={}, outcome={}, request_id={}, principal={}",
            self.kind,
            self.outcome,
            self.request_id,
            self.principal.as_deref().unwrap_or("<none>")
        )?;

        if let Some(scope) = &self.scope {
            write!(f, ", scope={}", scope)?;
        }
        if let Some(table) = &self.table {
            write!(f, ", table={}", table)?;
        }
        if let Some(command) = &self.command {
            write!(f, ", command={}", command)?;
        }
        if let Some(connection) = &self.connection {
            write!(f, ", connection={}", connection)?;
        }

        write!(f, "]")
    }
}
