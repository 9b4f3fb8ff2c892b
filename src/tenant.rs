//! Tenants and the registry used to check their status.

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Maximum accepted length of a tenant identifier.
pub const MAX_TENANT_ID_LEN: usize = 128;

/// Identifier of an isolated customer organization.
///
/// Tenant ids are opaque, non-empty strings without whitespace or control
/// characters. They are carried into the storage engine as session setting
/// values, never spliced into statement text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Parses a tenant id, returning `None` for empty or malformed input.
    ///
    /// # Examples
    ///
    /// ```
    /// use tenancy_core::TenantId;
    ///
    /// assert!(TenantId::parse("clinic-001").is_some());
    /// assert!(TenantId::parse("").is_none());
    /// assert!(TenantId::parse("a b").is_none());
    /// ```
    pub fn parse(raw: &str) -> Option<Self> {
        let valid = !raw.is_empty()
            && raw.len() <= MAX_TENANT_ID_LEN
            && !raw.chars().any(|c| c.is_whitespace() || c.is_control());
        valid.then(|| Self(raw.to_string()))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("invalid tenant id '{value}'"))
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

/// Lifecycle status of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    /// Tenant is operating normally
    Active,
    /// Tenant access is temporarily blocked
    Suspended,
    /// Tenant has been removed
    Deleted,
}

/// An organizational unit owning every tenant-scoped row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    /// Tenant identifier
    pub id: TenantId,
    /// Display name
    pub name: String,
    /// Lifecycle status
    pub status: TenantStatus,
}

impl Tenant {
    /// Creates an active tenant.
    pub fn active(id: TenantId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            status: TenantStatus::Active,
        }
    }
}

/// In-memory directory of known tenants.
///
/// When a resolver is given a registry, only principals whose tenant is
/// registered and [`TenantStatus::Active`] resolve to a context.
#[derive(Debug, Default)]
pub struct TenantRegistry {
    tenants: RwLock<HashMap<TenantId, Tenant>>,
}

impl TenantRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers or replaces a tenant.
    pub fn register(&self, tenant: Tenant) {
        self.tenants.write().insert(tenant.id.clone(), tenant);
    }

    /// Looks up a tenant by id.
    pub fn get(&self, id: &TenantId) -> Option<Tenant> {
        self.tenants.read().get(id).cloned()
    }

    /// Updates a tenant's status. Returns false if the tenant is unknown.
    pub fn set_status(&self, id: &TenantId, status: TenantStatus) -> bool {
        match self.tenants.write().get_mut(id) {
            Some(tenant) => {
                tenant.status = status;
                true
            }
            None => false,
        }
    }

    /// Returns true if the tenant is registered and active.
    pub fn is_active(&self, id: &TenantId) -> bool {
        self.tenants
            .read()
            .get(id)
            .is_some_and(|t| t.status == TenantStatus::Active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(s: &str) -> TenantId {
        TenantId::parse(s).unwrap()
    }

    #[test]
    fn tenant_id_rejects_control_characters() {
        assert!(TenantId::parse("a\u{0}b").is_none());
        assert!(TenantId::parse("tab\there").is_none());
    }

    #[test]
    fn tenant_id_rejects_overlong_input() {
        let raw = "x".repeat(MAX_TENANT_ID_LEN + 1);
        assert!(TenantId::parse(&raw).is_none());
        assert!(TenantId::parse(&raw[..MAX_TENANT_ID_LEN]).is_some());
    }

    #[test]
    fn tenant_id_deserializes_with_validation() {
        let ok: TenantId = serde_json::from_str("\"clinic-a\"").unwrap();
        assert_eq!(ok.as_str(), "clinic-a");
        assert!(serde_json::from_str::<TenantId>("\"\"").is_err());
    }

    #[test]
    fn registry_tracks_status() {
        let registry = TenantRegistry::new();
        registry.register(Tenant::active(tid("a"), "Clinic A"));

        assert!(registry.is_active(&tid("a")));
        assert!(!registry.is_active(&tid("b")));

        assert!(registry.set_status(&tid("a"), TenantStatus::Suspended));
        assert!(!registry.is_active(&tid("a")));
        assert!(!registry.set_status(&tid("b"), TenantStatus::Active));
    }
}
