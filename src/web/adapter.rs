//! Request adapter for mapping HTTP requests to tenancy types.

use http::header::AUTHORIZATION;
use http::HeaderMap;

use crate::request::{Credentials, RequestMeta};

use super::ExtractMetadata;

/// Header carrying the caller-supplied request id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Maximum accepted length of a caller-supplied request id.
const MAX_REQUEST_ID_LEN: usize = 128;

/// Framework-agnostic view of an inbound request.
///
/// Holds owned data only, so framework integrations can build one from
/// their own request types and drop the original.
///
/// # Examples
///
/// ```
/// use tenancy_core::web::{ExtractMetadata, RequestAdapter};
/// use tenancy_core::{Claims, Credentials};
///
/// let request = http::Request::builder()
///     .header("x-request-id", "req-12345")
///     .header("authorization", "Bearer abc.def.ghi")
///     .body(())
///     .unwrap();
///
/// let mut adapter = RequestAdapter::from_http(&request);
/// assert_eq!(adapter.bearer_token(), Some("abc.def.ghi"));
///
/// // The authentication layer verifies the token, then attaches its claims.
/// adapter.set_credentials(Some(Credentials::Bearer(Claims {
///     sub: "user-1".to_string(),
///     tenant_id: Some("clinic-a".to_string()),
///     role: "member".to_string(),
/// })));
///
/// let meta = adapter.extract_metadata();
/// assert_eq!(meta.request_id, "req-12345");
/// assert!(meta.credentials.is_some());
/// ```
#[derive(Debug, Clone)]
pub struct RequestAdapter {
    request_id: String,
    headers: HeaderMap,
    credentials: Option<Credentials>,
}

impl RequestAdapter {
    /// Creates an adapter with the given request id and nothing else.
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            headers: HeaderMap::new(),
            credentials: None,
        }
    }

    /// Creates an adapter from an `http::Request`.
    ///
    /// The request id is taken from the `x-request-id` header when it is
    /// present and printable, otherwise a random UUID is generated.
    pub fn from_http<B>(request: &http::Request<B>) -> Self {
        let headers = request.headers().clone();
        let request_id = headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| is_valid_request_id(v))
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Self {
            request_id,
            headers,
            credentials: None,
        }
    }

    /// Attaches the credentials the authentication layer verified.
    pub fn set_credentials(&mut self, credentials: Option<Credentials>) {
        self.credentials = credentials;
    }

    /// Builder-style variant of [`RequestAdapter::set_credentials`].
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Returns the request ID.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Returns a header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns the raw bearer token from the `Authorization` header.
    ///
    /// The token is unverified; it is exposed only so an upstream
    /// authentication layer can verify it.
    pub fn bearer_token(&self) -> Option<&str> {
        self.headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// Returns the attached credentials, if any.
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }
}

impl ExtractMetadata for RequestAdapter {
    fn extract_metadata(&self) -> RequestMeta {
        RequestMeta {
            request_id: self.request_id.clone(),
            credentials: self.credentials.clone(),
        }
    }
}

fn is_valid_request_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_REQUEST_ID_LEN
        && id.chars().all(|c| c.is_ascii_graphic())
}
