use crate::{
    context::{Ctx, RequestContext},
    error::{Violation, ViolationKind},
    request::RequestMeta,
    requirement::Requirement,
    resolver::ContextResolver,
    state::Resolved,
};

/// The context gate.
///
/// `ContextGate` is the only public way to obtain a `Ctx<Resolved>`. It runs
/// the context resolver and then validates every requirement; handlers are
/// unreachable unless both succeed.
///
/// # Examples
///
/// ```
/// use tenancy_core::{
///     Claims, ContextGate, CredentialResolver, Credentials, MinRole, RequestMeta, Role,
///     TenantBound,
/// };
///
/// let meta = RequestMeta {
///     request_id: "req-123".to_string(),
///     credentials: Some(Credentials::Bearer(Claims {
///         sub: "user-1".to_string(),
///         tenant_id: Some("clinic-a".to_string()),
///         role: "tenant_admin".to_string(),
///     })),
/// };
///
/// let ctx = ContextGate::new(meta)
///     .require(TenantBound)
///     .require(MinRole(Role::TenantAdmin))
///     .build(&CredentialResolver::new())
///     .expect("requirements satisfied");
///
/// assert_eq!(ctx.context().role(), Role::TenantAdmin);
/// ```
pub struct ContextGate {
    meta: RequestMeta,
    requirements: Vec<Requirement>,
}

impl ContextGate {
    /// Creates a new gate for the given request metadata.
    pub fn new(meta: RequestMeta) -> Self {
        Self {
            meta,
            requirements: Vec::new(),
        }
    }

    /// Adds a requirement to the gate, deduplicating identical requirements.
    pub fn require(mut self, requirement: impl Into<Requirement>) -> Self {
        let req = requirement.into();
        if !self.requirements.contains(&req) {
            self.requirements.push(req);
        }
        self
    }

    /// Resolves the request's credentials and validates all requirements.
    ///
    /// # Errors
    ///
    /// Returns a `Violation` if resolution fails or any requirement is not
    /// satisfied.
    pub fn build<R>(self, resolver: &R) -> Result<Ctx<Resolved>, Violation>
    where
        R: ContextResolver + ?Sized,
    {
        let resolved = Ctx::new(self.meta).resolve(resolver)?;
        let request_id = resolved.request_id().to_string();
        let mut context = resolved.into_context();

        // Widening must happen before the other checks so they see the
        // scope the handler will actually run under.
        if self.requirements.contains(&Requirement::PlatformAdmin) {
            context = context.widened().ok_or_else(|| {
                Violation::new(
                    ViolationKind::PlatformAdminRequired,
                    "Route is reserved for platform administrators",
                )
            })?;
        }

        for req in &self.requirements {
            Self::validate_one(req, &context)?;
        }

        Ok(Ctx::with_context(request_id, context))
    }

    fn validate_one(req: &Requirement, context: &RequestContext) -> Result<(), Violation> {
        match req {
            Requirement::TenantBound => {
                if context.tenant_id().is_none() {
                    return Err(Violation::new(
                        ViolationKind::TenantRequired,
                        "Route requires a tenant-scoped context",
                    ));
                }
            }
            Requirement::MinRole(required) => {
                if context.role() < *required {
                    return Err(Violation::new(
                        ViolationKind::InsufficientRole {
                            required: *required,
                        },
                        format!("Role '{}' is below '{}'", context.role(), required),
                    ));
                }
            }
            Requirement::PlatformAdmin => {
                if !context.is_bypass() {
                    return Err(Violation::new(
                        ViolationKind::PlatformAdminRequired,
                        "Route is reserved for platform administrators",
                    ));
                }
            }
        }
        Ok(())
    }
}
