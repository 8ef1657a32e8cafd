//! Definition registry: stores and resolves run definitions
//!
//! Definitions are immutable once registered. To modify one, register it
//! again under the same code; the registry assigns the next version.
//! Lookups by code go through a [`ScopeResolver`], so a tenant's own
//! definition shadows a platform-wide one with the same code.

use parking_lot::RwLock;
use runflow_types::{RunDefinition, RunDefinitionId, RunflowError, RunflowResult, Scope, ScopeResolver};
use std::collections::HashMap;

#[derive(Debug, Default)]
struct RegistryState {
    /// All registered definitions, keyed by ID
    definitions: HashMap<RunDefinitionId, RunDefinition>,
    /// Index by (scope, code) → definition IDs in version order
    by_code: HashMap<(Scope, String), Vec<RunDefinitionId>>,
}

/// Registry of run definitions
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    state: RwLock<RegistryState>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a definition, assigning the next version for its
    /// (scope, code). Returns the stored definition.
    pub fn register(&self, mut definition: RunDefinition) -> RunflowResult<RunDefinition> {
        definition.validate()?;

        let mut state = self.state.write();
        if state.definitions.contains_key(&definition.id) {
            definition.id = RunDefinitionId::generate();
        }
        let key = (definition.scope.clone(), definition.code.clone());
        let latest = state
            .by_code
            .get(&key)
            .and_then(|ids| ids.last())
            .and_then(|id| state.definitions.get(id))
            .map(|d| d.version)
            .unwrap_or(0);
        definition.version = latest + 1;

        let id = definition.id.clone();
        state.by_code.entry(key).or_default().push(id.clone());
        state.definitions.insert(id.clone(), definition.clone());

        tracing::info!(
            definition_id = %id,
            code = %definition.code,
            version = definition.version,
            scope = %definition.scope,
            "Run definition registered"
        );
        Ok(definition)
    }

    pub fn get(&self, id: &RunDefinitionId) -> RunflowResult<RunDefinition> {
        self.state
            .read()
            .definitions
            .get(id)
            .cloned()
            .ok_or_else(|| RunflowError::DefinitionNotFound(id.clone()))
    }

    /// Latest version of `code` owned by exactly `scope`
    pub fn latest(&self, scope: &Scope, code: &str) -> Option<RunDefinition> {
        let state = self.state.read();
        state
            .by_code
            .get(&(scope.clone(), code.to_string()))
            .and_then(|ids| ids.last())
            .and_then(|id| state.definitions.get(id))
            .cloned()
    }

    /// Latest version of `code` visible from `scope`, most specific owner first
    pub fn resolve(
        &self,
        scope: &Scope,
        code: &str,
        resolver: &dyn ScopeResolver,
    ) -> RunflowResult<RunDefinition> {
        resolver
            .candidates(scope)
            .iter()
            .find_map(|candidate| self.latest(candidate, code))
            .ok_or_else(|| RunflowError::DefinitionCodeNotFound {
                code: code.to_string(),
                scope: scope.to_string(),
            })
    }

    /// All versions of `code` owned by `scope`, oldest first
    pub fn versions(&self, scope: &Scope, code: &str) -> Vec<RunDefinition> {
        let state = self.state.read();
        state
            .by_code
            .get(&(scope.clone(), code.to_string()))
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.definitions.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn list(&self) -> Vec<RunDefinition> {
        self.state.read().definitions.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.state.read().definitions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runflow_types::{Step, TenantThenPlatform};

    fn make_valid_definition(code: &str, scope: Scope) -> RunDefinition {
        RunDefinition::new(code, scope)
            .with_step(Step::start("start").then("end"))
            .with_step(Step::end("end"))
    }

    #[test]
    fn test_register_and_get() {
        let registry = DefinitionRegistry::new();
        let def = registry
            .register(make_valid_definition("review", Scope::platform()))
            .unwrap();
        assert_eq!(def.version, 1);
        assert_eq!(registry.get(&def.id).unwrap().code, "review");
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_register_invalid() {
        let registry = DefinitionRegistry::new();
        let result = registry.register(RunDefinition::new("bad", Scope::platform()));
        assert!(result.is_err());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_versions_increase_per_code() {
        let registry = DefinitionRegistry::new();
        registry
            .register(make_valid_definition("review", Scope::platform()))
            .unwrap();
        let second = registry
            .register(make_valid_definition("review", Scope::platform()))
            .unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(registry.versions(&Scope::platform(), "review").len(), 2);
        assert_eq!(
            registry.latest(&Scope::platform(), "review").unwrap().id,
            second.id
        );
        assert!(registry.latest(&Scope::platform(), "nonexistent").is_none());
    }

    #[test]
    fn test_tenant_definition_shadows_platform() {
        let registry = DefinitionRegistry::new();
        let platform = registry
            .register(make_valid_definition("review", Scope::platform()))
            .unwrap();
        let tenant = registry
            .register(make_valid_definition("review", Scope::tenant("acme")))
            .unwrap();
        assert_eq!(tenant.version, 1);

        let resolver = TenantThenPlatform;
        let for_acme = registry
            .resolve(&Scope::tenant("acme"), "review", &resolver)
            .unwrap();
        assert_eq!(for_acme.id, tenant.id);
        let for_other = registry
            .resolve(&Scope::tenant("globex"), "review", &resolver)
            .unwrap();
        assert_eq!(for_other.id, platform.id);
    }

    #[test]
    fn test_resolve_unknown_code() {
        let registry = DefinitionRegistry::new();
        let result = registry.resolve(&Scope::platform(), "missing", &TenantThenPlatform);
        assert!(matches!(result, Err(RunflowError::DefinitionCodeNotFound { .. })));
    }

    #[test]
    fn test_get_nonexistent() {
        let registry = DefinitionRegistry::new();
        let result = registry.get(&RunDefinitionId::new("nonexistent"));
        assert!(matches!(result, Err(RunflowError::DefinitionNotFound(_))));
    }
}
