//! Route guard: the per-request enforcement state machine.
//!
//! ```text
//! Unauthenticated --resolve--> ContextResolved --bind--> ConnectionBound
//!        |                           |                        |
//!        v                           v                        v
//!    (rejected)                 (rejected)              HandlerExecuting --> Unbound
//! ```
//!
//! A handler is only ever called with a `Ctx<Bound>`, by value. The binding
//! lives inside that value, so it is released whenever the handler's future
//! finishes, returns an error, unwinds, or is dropped because the request was
//! cancelled or timed out.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use http::StatusCode;

use crate::audit::{AuditEvent, AuditEventKind, AuditOutcome, AuditSink};
use crate::binder::Binder;
use crate::config::{ConfigError, TenancyConfig};
use crate::context::Ctx;
use crate::engine::Database;
use crate::error::Violation;
use crate::gate::ContextGate;
use crate::pool::{Pool, PoolError};
use crate::requirement::Requirement;
use crate::resolver::ContextResolver;
use crate::web::ExtractMetadata;

/// Lifecycle state of one guarded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    /// Credentials extracted, nothing resolved
    Unauthenticated,
    /// A request context was resolved and every requirement holds
    ContextResolved,
    /// The context is bound onto a pooled connection
    ConnectionBound,
    /// The handler is running
    HandlerExecuting,
    /// The binding has been released (terminal)
    Unbound,
}

impl GuardState {
    /// Returns true if `next` is a legal successor of this state.
    ///
    /// Every state may move to `Unbound`, which is how rejections end.
    pub fn can_transition_to(self, next: GuardState) -> bool {
        use GuardState::*;
        matches!(
            (self, next),
            (Unauthenticated, ContextResolved)
                | (ContextResolved, ConnectionBound)
                | (ConnectionBound, HandlerExecuting)
                | (Unauthenticated | ContextResolved | ConnectionBound | HandlerExecuting, Unbound)
        )
    }
}

impl fmt::Display for GuardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GuardState::Unauthenticated => "unauthenticated",
            GuardState::ContextResolved => "context_resolved",
            GuardState::ConnectionBound => "connection_bound",
            GuardState::HandlerExecuting => "handler_executing",
            GuardState::Unbound => "unbound",
        };
        f.write_str(name)
    }
}

struct Lifecycle<'a> {
    request_id: &'a str,
    state: GuardState,
}

impl<'a> Lifecycle<'a> {
    fn start(request_id: &'a str) -> Self {
        tracing::trace!(request_id, state = %GuardState::Unauthenticated, "guard started");
        Self {
            request_id,
            state: GuardState::Unauthenticated,
        }
    }

    fn advance(&mut self, next: GuardState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal guard transition {} -> {}",
            self.state,
            next
        );
        tracing::trace!(
            request_id = self.request_id,
            from = %self.state,
            to = %next,
            "guard transition"
        );
        self.state = next;
    }
}

/// Why a request was turned away before reaching its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    /// No context could be resolved from the credentials
    Unauthorized,
    /// A context was resolved but the route's requirements do not hold
    Forbidden,
    /// No pooled connection was available
    Unavailable,
}

/// Uniform client-visible rejection.
///
/// Carries no resolver or policy detail: the reason is logged server-side
/// and only the status, an opaque message and the request id are exposed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardRejection {
    kind: RejectionKind,
    request_id: String,
}

impl GuardRejection {
    fn new(kind: RejectionKind, request_id: &str) -> Self {
        Self {
            kind,
            request_id: request_id.to_string(),
        }
    }

    /// Returns the rejection kind.
    pub fn kind(&self) -> RejectionKind {
        self.kind
    }

    /// Returns the id of the rejected request.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Returns the HTTP status for this rejection.
    pub fn status(&self) -> StatusCode {
        match self.kind {
            RejectionKind::Unauthorized => StatusCode::UNAUTHORIZED,
            RejectionKind::Forbidden => StatusCode::FORBIDDEN,
            RejectionKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Returns the public message.
    pub fn message(&self) -> &'static str {
        match self.kind {
            RejectionKind::Unauthorized => "authorization context required",
            RejectionKind::Forbidden => "forbidden",
            RejectionKind::Unavailable => "service unavailable",
        }
    }

    /// Renders the rejection as a JSON HTTP response.
    pub fn to_response(&self) -> http::Response<String> {
        let body = serde_json::json!({
            "error": self.message(),
            "request_id": self.request_id,
        });
        let mut response = http::Response::new(body.to_string());
        *response.status_mut() = self.status();
        response.headers_mut().insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static("application/json"),
        );
        response
    }
}

impl fmt::Display for GuardRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (request {})", self.message(), self.request_id)
    }
}

impl std::error::Error for GuardRejection {}

/// The shared enforcement stack: resolver, pool, binder and audit sink.
///
/// Cloning is cheap; every clone shares the same pool and database.
#[derive(Clone)]
pub struct Tenancy {
    resolver: Arc<dyn ContextResolver>,
    pool: Pool,
    binder: Binder,
    audit: Arc<dyn AuditSink>,
}

impl fmt::Debug for Tenancy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tenancy")
            .field("pool", &self.pool)
            .field("binder", &self.binder)
            .finish()
    }
}

impl Tenancy {
    /// Assembles the stack from its parts.
    pub fn new(
        resolver: Arc<dyn ContextResolver>,
        pool: Pool,
        binder: Binder,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            resolver,
            pool,
            binder,
            audit,
        }
    }

    /// Builds a fresh database, pool and binder from configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` if the configuration fails validation.
    pub fn from_config(
        config: &TenancyConfig,
        resolver: Arc<dyn ContextResolver>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let db = Database::new(config.session.clone())?;
        let pool = Pool::new(db, config.pool.clone(), Arc::clone(&audit));
        let binder = Binder::new(config.session.clone(), Arc::clone(&audit));
        Ok(Self::new(resolver, pool, binder, audit))
    }

    /// Returns the database behind the pool.
    pub fn database(&self) -> &Database {
        self.pool.database()
    }

    /// Returns the connection pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Returns the binder.
    pub fn binder(&self) -> &Binder {
        &self.binder
    }
}

/// Guards one route (or group of routes).
///
/// - [`RouteGuard::tenant`] requires a concrete tenant scope.
/// - [`RouteGuard::platform`] requires a platform administrator and binds the
///   all-tenants bypass scope. It runs the same state machine.
#[derive(Debug, Clone)]
pub struct RouteGuard {
    tenancy: Tenancy,
    requirements: Vec<Requirement>,
}

impl RouteGuard {
    /// A guard for tenant-scoped routes.
    pub fn tenant(tenancy: Tenancy) -> Self {
        Self {
            tenancy,
            requirements: vec![Requirement::TenantBound],
        }
    }

    /// A guard for platform-level routes.
    pub fn platform(tenancy: Tenancy) -> Self {
        Self {
            tenancy,
            requirements: vec![Requirement::PlatformAdmin],
        }
    }

    /// Adds a further requirement, e.g. `MinRole(Role::TenantAdmin)`.
    pub fn with_requirement(mut self, requirement: impl Into<Requirement>) -> Self {
        let req = requirement.into();
        if !self.requirements.contains(&req) {
            self.requirements.push(req);
        }
        self
    }

    /// Runs `handler` for `request` under a bound context.
    ///
    /// The handler is never called unless a context was resolved, every
    /// requirement holds and a connection was bound.
    ///
    /// # Errors
    ///
    /// Returns a `GuardRejection` if resolution, a requirement, or
    /// connection checkout fails. Handler outcomes are returned as `T`.
    pub async fn handle<A, F, Fut, T>(&self, request: &A, handler: F) -> Result<T, GuardRejection>
    where
        A: ExtractMetadata + ?Sized,
        F: FnOnce(Ctx) -> Fut,
        Fut: Future<Output = T>,
    {
        let meta = request.extract_metadata();
        let request_id = meta.request_id.clone();
        let mut lifecycle = Lifecycle::start(&request_id);

        let gate = self
            .requirements
            .iter()
            .fold(ContextGate::new(meta), |gate, req| gate.require(*req));
        let resolved = match gate.build(&*self.tenancy.resolver) {
            Ok(ctx) => ctx,
            Err(violation) => {
                lifecycle.advance(GuardState::Unbound);
                return Err(self.reject_violation(&request_id, &violation));
            }
        };
        lifecycle.advance(GuardState::ContextResolved);

        let connection = match self.tenancy.pool.acquire().await {
            Ok(connection) => connection,
            Err(err) => {
                lifecycle.advance(GuardState::Unbound);
                return Err(self.reject_unavailable(&request_id, &err));
            }
        };
        let ctx = resolved.bind(&self.tenancy.binder, connection);
        lifecycle.advance(GuardState::ConnectionBound);

        lifecycle.advance(GuardState::HandlerExecuting);
        let output = handler(ctx).await;
        lifecycle.advance(GuardState::Unbound);

        Ok(output)
    }

    fn reject_violation(&self, request_id: &str, violation: &Violation) -> GuardRejection {
        if violation.is_unresolvable() {
            tracing::warn!(
                request_id,
                kind = %violation.kind,
                reason = %violation.message,
                "request rejected: no resolvable context"
            );
            self.tenancy.audit.record(
                AuditEvent::new(request_id, AuditEventKind::MissingContext, AuditOutcome::Denied)
                    .with_detail(violation.kind.to_string()),
            );
            GuardRejection::new(RejectionKind::Unauthorized, request_id)
        } else {
            tracing::warn!(
                request_id,
                kind = %violation.kind,
                reason = %violation.message,
                "request rejected: requirement not met"
            );
            GuardRejection::new(RejectionKind::Forbidden, request_id)
        }
    }

    fn reject_unavailable(&self, request_id: &str, err: &PoolError) -> GuardRejection {
        tracing::error!(request_id, error = %err, "request rejected: no connection available");
        GuardRejection::new(RejectionKind::Unavailable, request_id)
    }
}
