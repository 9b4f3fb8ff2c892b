//! Web framework integration surface.
//!
//! This module maps framework requests onto [`RequestMeta`](crate::RequestMeta)
//! for the route guard. It does not authenticate: token verification happens
//! upstream, and the verified claims or session record are attached to the
//! adapter with [`RequestAdapter::set_credentials`].
//!
//! # Integration Model
//!
//! 1. Build a `RequestAdapter` from the framework request
//!    (`RequestAdapter::from_http` for `http::Request`)
//! 2. Let the authentication layer attach verified credentials
//! 3. Hand the adapter to [`RouteGuard::handle`](crate::guard::RouteGuard::handle)
//!
//! No global state is involved; everything flows through the adapter value.

mod adapter;
mod extract;

pub use adapter::{RequestAdapter, REQUEST_ID_HEADER};
pub use extract::ExtractMetadata;
