//! Extraction boundary trait for web integration.

use crate::request::RequestMeta;

/// Extracts request metadata from a framework-specific request.
///
/// Implementations only map framework types onto [`RequestMeta`]; they never
/// resolve a tenant context themselves. Resolution is the resolver's job,
/// run by the route guard.
///
/// # Examples
///
/// ```
/// use tenancy_core::web::ExtractMetadata;
/// use tenancy_core::{Claims, Credentials, RequestMeta};
///
/// struct GatewayRequest {
///     trace_id: String,
///     verified: Option<Claims>,
/// }
///
/// impl ExtractMetadata for GatewayRequest {
///     fn extract_metadata(&self) -> RequestMeta {
///         RequestMeta {
///             request_id: self.trace_id.clone(),
///             credentials: self.verified.clone().map(Credentials::Bearer),
///         }
///     }
/// }
/// ```
pub trait ExtractMetadata {
    /// Extracts the request id and any attached credentials.
    fn extract_metadata(&self) -> RequestMeta;
}

impl ExtractMetadata for RequestMeta {
    fn extract_metadata(&self) -> RequestMeta {
        self.clone()
    }
}
