//! Tenant scoping
//!
//! Every definition, rule, run and event carries a [`Scope`]: either a
//! tenant id or the platform-wide wildcard `*`. A [`ScopeResolver`] decides
//! which scopes are visible from a given scope, so one interpreter can serve
//! tenant-scoped and platform-scoped processes alike.

use serde::{Deserialize, Serialize};

/// The universal wildcard scope
pub const PLATFORM_SCOPE: &str = "*";

/// Tenant or platform scope
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(pub String);

impl Scope {
    pub fn tenant(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn platform() -> Self {
        Self(PLATFORM_SCOPE.to_string())
    }

    pub fn is_platform(&self) -> bool {
        self.0 == PLATFORM_SCOPE
    }

    /// Whether a subscriber/owner with this scope may see something in `other`
    pub fn covers(&self, other: &Scope) -> bool {
        self.is_platform() || self == other
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::platform()
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Decides which owner scopes are visible from a requesting scope.
///
/// Candidates are returned most specific first; the first candidate that
/// owns a matching item wins.
pub trait ScopeResolver: Send + Sync {
    fn candidates(&self, requested: &Scope) -> Vec<Scope>;
}

/// Tenant items shadow platform items with the same key
#[derive(Clone, Copy, Debug, Default)]
pub struct TenantThenPlatform;

impl ScopeResolver for TenantThenPlatform {
    fn candidates(&self, requested: &Scope) -> Vec<Scope> {
        if requested.is_platform() {
            vec![Scope::platform()]
        } else {
            vec![requested.clone(), Scope::platform()]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_covers_everything() {
        let platform = Scope::platform();
        assert!(platform.covers(&Scope::tenant("acme")));
        assert!(platform.covers(&Scope::platform()));
    }

    #[test]
    fn test_tenant_covers_only_itself() {
        let acme = Scope::tenant("acme");
        assert!(acme.covers(&Scope::tenant("acme")));
        assert!(!acme.covers(&Scope::tenant("globex")));
        assert!(!acme.covers(&Scope::platform()));
    }

    #[test]
    fn test_tenant_then_platform_candidates() {
        let resolver = TenantThenPlatform;
        assert_eq!(
            resolver.candidates(&Scope::tenant("acme")),
            vec![Scope::tenant("acme"), Scope::platform()]
        );
        assert_eq!(resolver.candidates(&Scope::platform()), vec![Scope::platform()]);
    }

    #[test]
    fn test_scope_serializes_as_plain_string() {
        let json = serde_json::to_string(&Scope::tenant("acme")).unwrap();
        assert_eq!(json, "\"acme\"");
    }
}
