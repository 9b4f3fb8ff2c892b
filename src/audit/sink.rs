//! The outbound audit interface.

use std::sync::Arc;

use super::{AuditEvent, AuditOutcome};

/// Receiver of policy-relevant audit events.
///
/// The core calls into a sink but does not own its storage. Implementations
/// must not block for long: sinks are called on the request's critical path.
pub trait AuditSink: Send + Sync {
    /// Records one event.
    fn record(&self, event: AuditEvent);
}

impl<S: AuditSink + ?Sized> AuditSink for Arc<S> {
    fn record(&self, event: AuditEvent) {
        (**self).record(event)
    }
}

/// Sink that emits every event as a structured `tracing` record under the
/// `tenancy_audit` target.
///
/// Denials and defects are logged at `warn` and `error`; bypass operations
/// at `info`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        macro_rules! emit {
            ($level:ident) => {
                tracing::$level!(
                    target: "tenancy_audit",
                    request_id = %event.request_id(),
                    kind = %event.kind(),
                    outcome = %event.outcome(),
                    principal = ?event.principal(),
                    scope = ?event.scope(),
                    role = ?event.role(),
                    table = ?event.table(),
                    command = ?event.command(),
                    connection = ?event.connection(),
                    detail = ?event.detail(),
                    "audit event"
                )
            };
        }

        match event.outcome() {
            AuditOutcome::Success => emit!(info),
            AuditOutcome::Denied => emit!(warn),
            AuditOutcome::Error => emit!(error),
        }
    }
}
