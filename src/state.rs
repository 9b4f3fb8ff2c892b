//! Type-state payloads for request context progression.
//!
//! Each state carries exactly the data that exists at that point of the
//! request lifecycle, so a handler holding `Ctx<Bound>` can never observe a
//! context without a bound connection.

use crate::binder::ScopedConnection;
use crate::context::RequestContext;
use crate::request::Credentials;

/// Initial state: credentials extracted, nothing resolved yet.
///
/// `Ctx<Unresolved>` cannot reach the database.
#[derive(Debug)]
pub struct Unresolved {
    pub(crate) credentials: Option<Credentials>,
}

/// The context resolver succeeded.
///
/// `Ctx<Resolved>` knows its tenant and role but holds no connection.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub(crate) context: RequestContext,
}

/// The context is bound onto a pooled connection.
///
/// Only this state can issue data-access calls. Dropping it unbinds the
/// connection and returns it to the pool.
#[derive(Debug)]
pub struct Bound {
    pub(crate) context: RequestContext,
    pub(crate) session: ScopedConnection,
}
