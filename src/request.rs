use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::tenant::TenantId;

/// Role of an authenticated actor.
///
/// Roles are ordered: `Member < TenantAdmin < PlatformAdmin`. Only
/// `PlatformAdmin` may ever see rows outside its own tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Ordinary member of a tenant
    Member,
    /// Administrator of a single tenant
    TenantAdmin,
    /// Operator allowed to bypass per-tenant row filtering
    PlatformAdmin,
}

impl Role {
    /// Returns the wire name of the role.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Member => "member",
            Role::TenantAdmin => "tenant_admin",
            Role::PlatformAdmin => "platform_admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "member" => Ok(Role::Member),
            "tenant_admin" => Ok(Role::TenantAdmin),
            "platform_admin" => Ok(Role::PlatformAdmin),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// Returned when a role name is not recognized.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role '{0}'")]
pub struct UnknownRole(pub String);

/// An authenticated actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Unique identifier for this principal
    pub id: String,
    /// Home tenant; `None` only for platform administrators
    pub tenant_id: Option<TenantId>,
    /// Role within the tenant (or platform)
    pub role: Role,
}

/// Token claims as produced by the upstream authentication layer.
///
/// Signature and expiry have already been verified by the time claims reach
/// this crate; only the tenant and role bindings are interpreted here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (principal id)
    pub sub: String,
    /// Tenant the token was issued for
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Role name (`member`, `tenant_admin`, `platform_admin`)
    pub role: String,
}

/// A server-side session record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    /// Session identifier
    pub session_id: String,
    /// Principal as currently stored
    pub principal: Principal,
    /// Tenant the session was established under
    pub established_tenant: Option<TenantId>,
}

/// Credentials presented with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Verified bearer token claims
    Bearer(Claims),
    /// A looked-up session record
    Session(SessionRecord),
}

/// Metadata about an incoming request.
///
/// Contains the request identifier and the credentials (if any) the
/// authentication layer attached.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    /// Unique identifier for this request
    pub request_id: String,
    /// Authenticated credentials, if any
    pub credentials: Option<Credentials>,
}
