use std::fmt;

use crate::binder::{Binder, ScopedConnection};
use crate::error::Violation;
use crate::logging::RequestLog;
use crate::pool::PooledConnection;
use crate::request::{RequestMeta, Role};
use crate::resolver::ContextResolver;
use crate::state::{Bound, Resolved, Unresolved};
use crate::tenant::TenantId;

/// Which rows a context may see.
///
/// The bypass scope is its own variant rather than an absent tenant, so a
/// missing tenant id can never be mistaken for "all tenants".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    /// Rows owned by exactly this tenant
    Tenant(TenantId),
    /// Rows of every tenant (platform administrators only)
    AllTenants,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Tenant(id) => write!(f, "tenant:{}", id),
            Scope::AllTenants => write!(f, "all-tenants"),
        }
    }
}

/// The per-request tenant/role scope consulted by every row policy.
///
/// A `RequestContext` is constructed once per inbound request by a
/// [`ContextResolver`] and discarded at request end. It is never persisted
/// and cannot be built outside this crate.
///
/// Inside a tenant scope no role above [`Role::TenantAdmin`] exists: a
/// platform administrator acting within one tenant is bound with tenant-admin
/// visibility. Only [`Scope::AllTenants`] carries the bypass role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    principal_id: String,
    principal_role: Role,
    scope: Scope,
}

impl RequestContext {
    pub(crate) fn for_tenant(
        principal_id: impl Into<String>,
        tenant: TenantId,
        principal_role: Role,
    ) -> Self {
        Self {
            principal_id: principal_id.into(),
            principal_role,
            scope: Scope::Tenant(tenant),
        }
    }

    pub(crate) fn all_tenants(principal_id: impl Into<String>) -> Self {
        Self {
            principal_id: principal_id.into(),
            principal_role: Role::PlatformAdmin,
            scope: Scope::AllTenants,
        }
    }

    /// Returns the id of the principal this context was resolved for.
    pub fn principal_id(&self) -> &str {
        &self.principal_id
    }

    /// Returns the principal's own role, independent of the bound scope.
    pub fn principal_role(&self) -> Role {
        self.principal_role
    }

    /// Returns the visibility scope.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// Returns the effective tenant id; `None` for the bypass scope.
    pub fn tenant_id(&self) -> Option<&TenantId> {
        match &self.scope {
            Scope::Tenant(id) => Some(id),
            Scope::AllTenants => None,
        }
    }

    /// Returns the effective role bound for this scope.
    pub fn role(&self) -> Role {
        match self.scope {
            Scope::AllTenants => Role::PlatformAdmin,
            Scope::Tenant(_) => self.principal_role.min(Role::TenantAdmin),
        }
    }

    /// Returns true if this context bypasses tenant filtering.
    pub fn is_bypass(&self) -> bool {
        self.scope == Scope::AllTenants
    }

    /// Widens a platform administrator's context to every tenant.
    ///
    /// Returns `None` for any other principal.
    pub(crate) fn widened(&self) -> Option<Self> {
        (self.principal_role == Role::PlatformAdmin)
            .then(|| Self::all_tenants(self.principal_id.clone()))
    }
}

/// Execution context for one inbound request.
///
/// `Ctx<S>` is generic over its lifecycle state:
/// - `Ctx<Unresolved>`: credentials only
/// - `Ctx<Resolved>`: has a [`RequestContext`], no connection
/// - `Ctx<Bound>`: has a [`RequestContext`] bound onto a pooled connection
///
/// ```text
/// Ctx<Unresolved> --resolve--> Ctx<Resolved> --bind--> Ctx<Bound> --drop--> (unbound)
/// ```
///
/// Only `Ctx<Bound>` exposes data access, and dropping it (on success, error,
/// panic or cancellation) resets the connection before it returns to the
/// pool.
#[derive(Debug)]
pub struct Ctx<S = Bound> {
    request_id: String,
    state: S,
}

// ============================================================================
// Shared methods (available on all states)
// ============================================================================

impl<S> Ctx<S> {
    /// Returns the request ID for this context.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

// ============================================================================
// Ctx<Unresolved> - Initial state
// ============================================================================

impl Ctx<Unresolved> {
    pub(crate) fn new(meta: RequestMeta) -> Self {
        Self {
            request_id: meta.request_id,
            state: Unresolved {
                credentials: meta.credentials,
            },
        }
    }

    /// Resolves the request's credentials into a [`RequestContext`].
    ///
    /// # Errors
    ///
    /// Returns a `Violation` if no credentials were presented or the resolver
    /// cannot derive a tenant/role binding from them.
    pub fn resolve<R>(self, resolver: &R) -> Result<Ctx<Resolved>, Violation>
    where
        R: ContextResolver + ?Sized,
    {
        let credentials = self.state.credentials.ok_or_else(|| {
            Violation::new(
                crate::error::ViolationKind::Unauthenticated,
                "Authentication required: no credentials presented",
            )
        })?;
        let context = resolver.resolve(&credentials)?;

        tracing::debug!(
            request_id = %self.request_id,
            scope = %context.scope(),
            role = %context.role(),
            "context resolved"
        );

        Ok(Ctx {
            request_id: self.request_id,
            state: Resolved { context },
        })
    }
}

// ============================================================================
// Ctx<Resolved> - Context known, no connection
// ============================================================================

impl Ctx<Resolved> {
    pub(crate) fn with_context(request_id: String, context: RequestContext) -> Self {
        Self {
            request_id,
            state: Resolved { context },
        }
    }

    /// Returns the resolved request context.
    pub fn context(&self) -> &RequestContext {
        &self.state.context
    }

    pub(crate) fn into_context(self) -> RequestContext {
        self.state.context
    }

    /// Binds the context onto a pooled connection.
    pub fn bind(self, binder: &Binder, connection: PooledConnection) -> Ctx<Bound> {
        let session = binder.bind(connection, &self.state.context, &self.request_id);
        Ctx {
            request_id: self.request_id,
            state: Bound {
                context: self.state.context,
                session,
            },
        }
    }
}

// ============================================================================
// Ctx<Bound> - Context bound onto a connection
// ============================================================================

impl Ctx<Bound> {
    /// Returns the request context the connection is bound to.
    pub fn context(&self) -> &RequestContext {
        &self.state.context
    }

    /// Returns the scoped connection for data access.
    pub fn db(&mut self) -> &mut ScopedConnection {
        &mut self.state.session
    }

    /// Returns a logger that tags every record with this request's scope.
    pub fn log(&self) -> RequestLog<'_> {
        RequestLog::new(&self.request_id, &self.state.context)
    }

    /// Unbinds the connection and returns it to the pool.
    ///
    /// Equivalent to dropping the context; provided for call sites that
    /// want the release to be visible.
    pub fn release(self) {
        drop(self);
    }
}
