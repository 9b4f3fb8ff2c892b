//! Tenant-isolation enforcement for multi-tenant services.
//!
//! A request authenticated for one tenant must never read or write rows of
//! another, even when a handler forgets a filter or a pooled connection is
//! reused. This crate enforces that in layers:
//! - **Context resolution**: credentials become a [`RequestContext`] or the
//!   request fails closed ([`CredentialResolver`], [`ContextGate`])
//! - **Session binding**: the context is written onto a pooled connection as
//!   session settings and reset on every exit path ([`binder`], [`pool`])
//! - **Row policies**: per-table predicates evaluated by the storage engine
//!   for every statement ([`policy`], [`engine`])
//! - **Route guard**: the per-request state machine wiring it together
//!   ([`guard::RouteGuard`])
//!
//! # Core Types
//!
//! - [`Ctx`]: per-request context; only `Ctx<Bound>` can reach the database
//! - [`RequestContext`] and [`Scope`]: the tenant/role scope policies consult
//! - [`ScopedConnection`]: the only data-access handle handlers see
//! - [`Violation`]: why a context could not be established
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use tenancy_core::audit::AuditTrail;
//! use tenancy_core::config::TenancyConfig;
//! use tenancy_core::engine::{Filter, NewRow, TableSchema};
//! use tenancy_core::guard::{RouteGuard, Tenancy};
//! use tenancy_core::web::RequestAdapter;
//! use tenancy_core::{Claims, CredentialResolver, Credentials};
//!
//! # tokio_test_block(async {
//! let trail = Arc::new(AuditTrail::new());
//! let tenancy = Tenancy::from_config(
//!     &TenancyConfig::default(),
//!     Arc::new(CredentialResolver::new()),
//!     trail.clone(),
//! )
//! .expect("default configuration is valid");
//! tenancy.database().create_table(TableSchema::new("patients")).unwrap();
//!
//! let request = RequestAdapter::new("req-1").with_credentials(Credentials::Bearer(Claims {
//!     sub: "user-1".to_string(),
//!     tenant_id: Some("clinic-a".to_string()),
//!     role: "member".to_string(),
//! }));
//!
//! let rows = RouteGuard::tenant(tenancy)
//!     .handle(&request, |mut ctx| async move {
//!         ctx.db().insert("patients", NewRow::new().set("name", "Ada")).unwrap();
//!         ctx.db().select("patients", &Filter::All).unwrap()
//!     })
//!     .await
//!     .expect("request admitted");
//!
//! assert_eq!(rows.len(), 1);
//! assert_eq!(rows[0].tenant_id.as_str(), "clinic-a");
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f)
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod binder;
pub mod config;
mod context;
pub mod engine;
mod error;
mod gate;
pub mod guard;
mod logging;
#[cfg(feature = "postgres")]
pub mod pg;
pub mod policy;
pub mod pool;
mod request;
mod requirement;
mod resolver;
pub mod state;
mod tenant;
pub mod web;

pub use binder::{Binder, ScopedConnection};
pub use context::{Ctx, RequestContext, Scope};
pub use error::{DataError, Error, Violation, ViolationKind};
pub use gate::ContextGate;
pub use logging::RequestLog;
pub use request::{Claims, Credentials, Principal, RequestMeta, Role, SessionRecord, UnknownRole};
pub use requirement::{MinRole, PlatformAdmin, Requirement, TenantBound};
pub use resolver::{ContextResolver, CredentialResolver};
pub use tenant::{Tenant, TenantId, TenantRegistry, TenantStatus, MAX_TENANT_ID_LEN};
