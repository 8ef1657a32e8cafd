//! Rule storage
//!
//! Rule administration is an external concern; the engine only needs to
//! load the applicable rules for a mutation, already ordered.

use async_trait::async_trait;
use runflow_types::{BusinessRule, RuleId, RuleTrigger, Scope, ScopeResolver, StoreError, StoreResult};
use std::collections::HashMap;
use std::sync::RwLock;

/// Storage interface for business rules.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Insert or replace a rule.
    async fn upsert_rule(&self, rule: BusinessRule) -> StoreResult<()>;

    /// Remove a rule; false if it did not exist.
    async fn remove_rule(&self, id: &RuleId) -> StoreResult<bool>;

    async fn get_rule(&self, id: &RuleId) -> StoreResult<Option<BusinessRule>>;

    async fn list_rules(&self) -> StoreResult<Vec<BusinessRule>>;

    /// Active rules for a mutation, visible from `scope` through `resolver`,
    /// ordered by ascending priority (ties by name, then id).
    async fn applicable_rules(
        &self,
        scope: &Scope,
        collection: &str,
        trigger: RuleTrigger,
        resolver: &dyn ScopeResolver,
    ) -> StoreResult<Vec<BusinessRule>>;
}

/// Order rules for execution
pub fn sort_rules(rules: &mut [BusinessRule]) {
    rules.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.name.cmp(&b.name))
            .then_with(|| a.id.0.cmp(&b.id.0))
    });
}

/// In-memory rule store.
#[derive(Default)]
pub struct InMemoryRuleStore {
    rules: RwLock<HashMap<RuleId, BusinessRule>>,
}

impl InMemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StoreError {
    StoreError::Backend("rules lock poisoned".to_string())
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn upsert_rule(&self, rule: BusinessRule) -> StoreResult<()> {
        if rule.collection.is_empty() {
            return Err(StoreError::InvalidInput(format!(
                "rule {} has no collection",
                rule.id
            )));
        }
        let mut guard = self.rules.write().map_err(|_| poisoned())?;
        guard.insert(rule.id.clone(), rule);
        Ok(())
    }

    async fn remove_rule(&self, id: &RuleId) -> StoreResult<bool> {
        let mut guard = self.rules.write().map_err(|_| poisoned())?;
        Ok(guard.remove(id).is_some())
    }

    async fn get_rule(&self, id: &RuleId) -> StoreResult<Option<BusinessRule>> {
        let guard = self.rules.read().map_err(|_| poisoned())?;
        Ok(guard.get(id).cloned())
    }

    async fn list_rules(&self) -> StoreResult<Vec<BusinessRule>> {
        let guard = self.rules.read().map_err(|_| poisoned())?;
        let mut rules: Vec<_> = guard.values().cloned().collect();
        sort_rules(&mut rules);
        Ok(rules)
    }

    async fn applicable_rules(
        &self,
        scope: &Scope,
        collection: &str,
        trigger: RuleTrigger,
        resolver: &dyn ScopeResolver,
    ) -> StoreResult<Vec<BusinessRule>> {
        let visible = resolver.candidates(scope);
        let guard = self.rules.read().map_err(|_| poisoned())?;
        let mut rules: Vec<_> = guard
            .values()
            .filter(|r| {
                r.active
                    && r.trigger == trigger
                    && r.collection == collection
                    && visible.contains(&r.scope)
            })
            .cloned()
            .collect();
        sort_rules(&mut rules);
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runflow_types::{RuleAction, TenantThenPlatform};

    fn rule(name: &str, scope: Scope, priority: i32) -> BusinessRule {
        BusinessRule::new(
            name,
            "orders",
            RuleTrigger::BeforeInsert,
            RuleAction::Abort {
                message: name.to_string(),
            },
        )
        .with_scope(scope)
        .with_priority(priority)
    }

    #[tokio::test]
    async fn test_applicable_rules_visibility_and_order() {
        let store = InMemoryRuleStore::new();
        store.upsert_rule(rule("platform-late", Scope::platform(), 20)).await.unwrap();
        store.upsert_rule(rule("acme-early", Scope::tenant("acme"), 5)).await.unwrap();
        store.upsert_rule(rule("globex", Scope::tenant("globex"), 1)).await.unwrap();
        let mut inactive = rule("inactive", Scope::platform(), 0);
        inactive.active = false;
        store.upsert_rule(inactive).await.unwrap();
        let mut other_trigger = rule("after", Scope::platform(), 0);
        other_trigger.trigger = RuleTrigger::AfterInsert;
        store.upsert_rule(other_trigger).await.unwrap();

        let acme = store
            .applicable_rules(&Scope::tenant("acme"), "orders", RuleTrigger::BeforeInsert, &TenantThenPlatform)
            .await
            .unwrap();
        let names: Vec<_> = acme.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["acme-early", "platform-late"]);

        let platform = store
            .applicable_rules(&Scope::platform(), "orders", RuleTrigger::BeforeInsert, &TenantThenPlatform)
            .await
            .unwrap();
        assert_eq!(platform.len(), 1);

        let none = store
            .applicable_rules(&Scope::tenant("acme"), "invoices", RuleTrigger::BeforeInsert, &TenantThenPlatform)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_replace_and_remove() {
        let store = InMemoryRuleStore::new();
        let mut r = rule("a", Scope::platform(), 1);
        store.upsert_rule(r.clone()).await.unwrap();
        r.priority = 9;
        store.upsert_rule(r.clone()).await.unwrap();
        assert_eq!(store.get_rule(&r.id).await.unwrap().unwrap().priority, 9);
        assert_eq!(store.list_rules().await.unwrap().len(), 1);
        assert!(store.remove_rule(&r.id).await.unwrap());
        assert!(!store.remove_rule(&r.id).await.unwrap());

        let mut bad = rule("b", Scope::platform(), 1);
        bad.collection.clear();
        assert!(matches!(
            store.upsert_rule(bad).await,
            Err(StoreError::InvalidInput(_))
        ));
    }
}
