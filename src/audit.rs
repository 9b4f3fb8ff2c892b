//! Audit events for policy-relevant outcomes.
//!
//! This module provides:
//! - `AuditEvent`: structured event schema
//! - `AuditSink`: the outbound interface the core reports into
//! - `AuditTrail`: in-memory sink for tests and inspection
//! - `TracingAuditSink`: sink emitting events as `tracing` records
//!
//! Events carry identifiers and metadata only: never row contents, and never
//! the id of a tenant other than the one bound to the request.

mod event;
mod sink;
mod trail;

pub use event::{AuditEvent, AuditEventKind, AuditOutcome};
pub use sink::{AuditSink, TracingAuditSink};
pub use trail::AuditTrail;
