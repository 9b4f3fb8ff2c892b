use crate::request::Role;

/// A requirement a resolved context must satisfy before a handler runs.
///
/// Requirements are evaluated by [`crate::ContextGate::build()`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// The context must be scoped to a concrete tenant
    TenantBound,
    /// The effective role must be at least this role
    MinRole(Role),
    /// The principal must be a platform administrator; the context is
    /// widened to every tenant
    PlatformAdmin,
}

/// Requirement for routes that operate inside a single tenant.
pub struct TenantBound;

/// Requirement on the minimum effective role.
///
/// The effective role inside a tenant scope never exceeds
/// [`Role::TenantAdmin`]; use [`PlatformAdmin`] for platform routes.
pub struct MinRole(pub Role);

/// Requirement for platform-level routes.
pub struct PlatformAdmin;

impl From<TenantBound> for Requirement {
    fn from(_: TenantBound) -> Self {
        Requirement::TenantBound
    }
}

impl From<MinRole> for Requirement {
    fn from(min: MinRole) -> Self {
        Requirement::MinRole(min.0)
    }
}

impl From<PlatformAdmin> for Requirement {
    fn from(_: PlatformAdmin) -> Self {
        Requirement::PlatformAdmin
    }
}
