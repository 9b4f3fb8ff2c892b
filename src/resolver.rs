//! Context resolution: credentials in, [`RequestContext`] out.
//!
//! Resolution is a pure function of the presented credentials (plus an
//! optional tenant registry lookup). It never touches tenant-scoped data and
//! never defaults to an unrestricted context: anything that cannot be mapped
//! to a tenant, or to an explicit platform-admin role, fails closed.

use std::sync::Arc;

use crate::context::RequestContext;
use crate::error::Violation;
use crate::request::{Claims, Credentials, Role, SessionRecord};
use crate::tenant::{TenantId, TenantRegistry};

/// Derives a [`RequestContext`] from authenticated credentials.
///
/// Implementations must fail with [`crate::ViolationKind::Unresolvable`]
/// rather than return a context without a tenant binding for a non-admin
/// principal.
pub trait ContextResolver: Send + Sync {
    /// Resolves credentials into a request context.
    ///
    /// # Errors
    ///
    /// Returns a `Violation` when no tenant/role binding can be derived.
    fn resolve(&self, credentials: &Credentials) -> Result<RequestContext, Violation>;
}

/// The default resolver for bearer claims and session records.
///
/// # Examples
///
/// ```
/// use tenancy_core::{Claims, ContextResolver, CredentialResolver, Credentials};
///
/// let resolver = CredentialResolver::new();
/// let ctx = resolver
///     .resolve(&Credentials::Bearer(Claims {
///         sub: "user-1".to_string(),
///         tenant_id: Some("clinic-a".to_string()),
///         role: "member".to_string(),
///     }))
///     .expect("tenant-bound member resolves");
///
/// assert_eq!(ctx.tenant_id().map(|t| t.as_str()), Some("clinic-a"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct CredentialResolver {
    registry: Option<Arc<TenantRegistry>>,
}

impl CredentialResolver {
    /// Creates a resolver that trusts any well-formed tenant id.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a resolver that additionally requires the tenant to be
    /// registered and active.
    pub fn with_registry(registry: Arc<TenantRegistry>) -> Self {
        Self {
            registry: Some(registry),
        }
    }

    fn resolve_claims(&self, claims: &Claims) -> Result<RequestContext, Violation> {
        if claims.sub.trim().is_empty() {
            return Err(Violation::unresolvable("claims carry no subject"));
        }
        let role: Role = claims
            .role
            .parse()
            .map_err(|e| Violation::unresolvable(format!("claims role rejected: {e}")))?;

        let tenant = match claims.tenant_id.as_deref() {
            None | Some("") => None,
            Some(raw) => Some(
                TenantId::parse(raw)
                    .ok_or_else(|| Violation::unresolvable("claims carry a malformed tenant id"))?,
            ),
        };

        self.context_for(&claims.sub, tenant, role)
    }

    fn resolve_session(&self, record: &SessionRecord) -> Result<RequestContext, Violation> {
        let principal = &record.principal;
        if principal.role != Role::PlatformAdmin
            && principal.tenant_id != record.established_tenant
        {
            tracing::warn!(
                session_id = %record.session_id,
                principal = %principal.id,
                "principal tenant changed during session"
            );
            return Err(Violation::unresolvable(
                "principal tenant differs from the session's tenant",
            ));
        }

        self.context_for(&principal.id, principal.tenant_id.clone(), principal.role)
    }

    fn context_for(
        &self,
        principal_id: &str,
        tenant: Option<TenantId>,
        role: Role,
    ) -> Result<RequestContext, Violation> {
        match (tenant, role) {
            (Some(tenant), role) => {
                if let Some(registry) = &self.registry {
                    if !registry.is_active(&tenant) {
                        tracing::warn!(tenant = %tenant, "tenant unknown or inactive");
                        return Err(Violation::unresolvable("tenant is not active"));
                    }
                }
                Ok(RequestContext::for_tenant(principal_id, tenant, role))
            }
            (None, Role::PlatformAdmin) => Ok(RequestContext::all_tenants(principal_id)),
            (None, _) => Err(Violation::unresolvable(
                "credentials carry no tenant binding and no platform-admin role",
            )),
        }
    }
}

impl ContextResolver for CredentialResolver {
    fn resolve(&self, credentials: &Credentials) -> Result<RequestContext, Violation> {
        match credentials {
            Credentials::Bearer(claims) => self.resolve_claims(claims),
            Credentials::Session(record) => self.resolve_session(record),
        }
    }
}

impl<R: ContextResolver + ?Sized> ContextResolver for Arc<R> {
    fn resolve(&self, credentials: &Credentials) -> Result<RequestContext, Violation> {
        (**self).resolve(credentials)
    }
}
