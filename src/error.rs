use thiserror::Error as ThisError;

use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::pool::PoolError;
use crate::request::Role;

/// Errors that can occur in the tenancy crate.
#[derive(Debug, ThisError)]
pub enum Error {
    /// A context resolution or authorization requirement failed
    #[error("policy violation: {0}")]
    Violation(#[from] Violation),
    /// A data-access call failed for a reason other than a policy denial
    #[error("data access failed: {0}")]
    Data(#[from] DataError),
    /// No pooled connection could be obtained
    #[error("connection pool: {0}")]
    Pool(#[from] PoolError),
    /// Configuration could not be loaded or is invalid
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
}

/// A failed authorization requirement with details about what failed.
///
/// Violations are raised before any handler code runs and are turned into
/// a uniform client-visible rejection at the route guard boundary.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
#[error("{kind}: {message}")]
pub struct Violation {
    /// The kind of violation that occurred
    pub kind: ViolationKind,
    /// Human-readable message explaining the violation
    pub message: String,
}

impl Violation {
    /// Creates a new violation.
    pub fn new(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for an [`ViolationKind::Unresolvable`] violation.
    pub fn unresolvable(message: impl Into<String>) -> Self {
        Self::new(ViolationKind::Unresolvable, message)
    }

    /// Returns true if this violation means no context could be derived at all.
    pub fn is_unresolvable(&self) -> bool {
        matches!(
            self.kind,
            ViolationKind::Unauthenticated | ViolationKind::Unresolvable
        )
    }
}

/// The kind of policy violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum ViolationKind {
    /// No authenticated principal was presented
    #[error("Unauthenticated")]
    Unauthenticated,
    /// Credentials present but no tenant/role binding derivable
    #[error("Unresolvable")]
    Unresolvable,
    /// The route needs a concrete tenant but the context has none
    #[error("Tenant required")]
    TenantRequired,
    /// The principal's role is below the route's minimum
    #[error("Insufficient role (requires '{required}')")]
    InsufficientRole {
        /// Minimum role the route requires
        required: Role,
    },
    /// The route is reserved for platform administrators
    #[error("Platform admin required")]
    PlatformAdminRequired,
}

/// Failure of a data-access call made through a scoped connection.
///
/// Policy denials are never reported here: a denied write affects zero rows
/// and an invisible row is simply absent.
#[derive(Debug, Clone, PartialEq, ThisError)]
pub enum DataError {
    /// The storage engine rejected the statement
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// The underlying connection has already gone back to the pool
    #[error("connection released")]
    Released,
}
