//! Run definitions: versioned step graphs
//!
//! A RunDefinition is a directed graph where nodes are typed [`Step`]s and
//! edges are either the default `next` link or labeled connections.
//! Definitions are immutable once registered. To modify, register a new
//! version under the same code.

use crate::{RunDefinitionId, RunflowError, RunflowResult, Scope, Step, StepId, StepType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A versioned, validated step graph
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunDefinition {
    #[serde(default = "RunDefinitionId::generate")]
    pub id: RunDefinitionId,
    /// Stable code used to start runs (`expense-approval`)
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Assigned by the registry; increases per (scope, code)
    #[serde(default)]
    pub version: u32,
    #[serde(default)]
    pub scope: Scope,
    pub steps: Vec<Step>,
    /// Service-level deadline for runs of this definition
    #[serde(default)]
    pub sla_minutes: Option<u64>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl RunDefinition {
    pub fn new(code: impl Into<String>, scope: Scope) -> Self {
        let code = code.into();
        Self {
            id: RunDefinitionId::generate(),
            name: code.clone(),
            code,
            description: String::new(),
            version: 0,
            scope,
            steps: Vec::new(),
            sla_minutes: None,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn with_sla_minutes(mut self, minutes: u64) -> Self {
        self.sla_minutes = Some(minutes);
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    /// Add a step, rejecting duplicate ids
    pub fn add_step(&mut self, step: Step) -> RunflowResult<()> {
        if self.steps.iter().any(|s| s.id == step.id) {
            return Err(RunflowError::DuplicateStepId(step.id));
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn step(&self, id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|s| &s.id == id)
    }

    pub fn require_step(&self, id: &StepId) -> RunflowResult<&Step> {
        self.step(id)
            .ok_or_else(|| RunflowError::StepNotFound(id.clone()))
    }

    pub fn start_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_type() == StepType::Start)
    }

    pub fn end_steps(&self) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|s| s.step_type() == StepType::End)
            .collect()
    }

    /// Validate the graph structure.
    ///
    /// Checks: unique step ids; exactly one start step; every edge and
    /// nested step reference exists; end steps have no outgoing edges;
    /// every step is reachable from start; no step that may suspend is
    /// nested inside a parallel branch or loop body.
    pub fn validate(&self) -> RunflowResult<()> {
        if self.code.trim().is_empty() {
            return Err(RunflowError::ValidationError(
                "definition code must not be empty".into(),
            ));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(&step.id) {
                return Err(RunflowError::DuplicateStepId(step.id.clone()));
            }
        }

        let starts: Vec<&Step> = self
            .steps
            .iter()
            .filter(|s| s.step_type() == StepType::Start)
            .collect();
        let start = match starts.as_slice() {
            [] => return Err(RunflowError::NoStartStep),
            [one] => *one,
            _ => return Err(RunflowError::MultipleStartSteps(starts.len())),
        };

        for step in &self.steps {
            for target in step.successors().into_iter().chain(step.kind.nested_steps()) {
                if !seen.contains(target) {
                    return Err(RunflowError::DanglingEdge {
                        from: step.id.clone(),
                        to: target.clone(),
                    });
                }
            }
            if step.step_type() == StepType::End && !step.successors().is_empty() {
                return Err(RunflowError::EndStepHasEdges(step.id.clone()));
            }
            for nested in step.kind.nested_steps() {
                let nested_step = self.require_step(nested)?;
                if nested_step.kind.may_suspend() {
                    return Err(RunflowError::SuspensionInBranch {
                        container: step.id.clone(),
                        step: nested.clone(),
                    });
                }
                if matches!(nested_step.step_type(), StepType::Start | StepType::End) {
                    return Err(RunflowError::ValidationError(format!(
                        "step '{}' of type {} cannot be nested in '{}'",
                        nested,
                        nested_step.step_type(),
                        step.id
                    )));
                }
            }
        }

        let reachable = self.reachable_from(&start.id);
        if let Some(orphan) = self.steps.iter().find(|s| !reachable.contains(&s.id)) {
            return Err(RunflowError::UnreachableStep(orphan.id.clone()));
        }

        Ok(())
    }

    /// Steps reachable from `from` via edges, error edges and nesting
    pub fn reachable_from(&self, from: &StepId) -> HashSet<StepId> {
        let mut visited = HashSet::new();
        let mut stack = vec![from.clone()];
        while let Some(id) = stack.pop() {
            if !visited.insert(id.clone()) {
                continue;
            }
            if let Some(step) = self.step(&id) {
                for next in step.successors().into_iter().chain(step.kind.nested_steps()) {
                    if !visited.contains(next) {
                        stack.push(next.clone());
                    }
                }
            }
        }
        visited
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ApprovalConfig, ConditionCheck, StepKind, WaitConfig};

    fn make_simple_definition() -> RunDefinition {
        RunDefinition::new("simple", Scope::platform())
            .with_step(Step::start("start").then("check"))
            .with_step(
                Step::new(
                    "check",
                    StepKind::Condition(ConditionCheck::Expression {
                        expression: "input.amount > 1000".into(),
                    }),
                )
                .on("true", "approve")
                .on("false", "end"),
            )
            .with_step(Step::new("approve", StepKind::Approval(ApprovalConfig::default())).then("end"))
            .with_step(Step::end("end"))
    }

    #[test]
    fn test_valid_definition() {
        let def = make_simple_definition();
        assert!(def.validate().is_ok());
        assert_eq!(def.start_step().unwrap().id, StepId::new("start"));
        assert_eq!(def.end_steps().len(), 1);
    }

    #[test]
    fn test_missing_start() {
        let def = RunDefinition::new("x", Scope::platform()).with_step(Step::end("end"));
        assert!(matches!(def.validate(), Err(RunflowError::NoStartStep)));
    }

    #[test]
    fn test_two_starts() {
        let def = RunDefinition::new("x", Scope::platform())
            .with_step(Step::start("a").then("end"))
            .with_step(Step::start("b").then("end"))
            .with_step(Step::end("end"));
        assert!(matches!(def.validate(), Err(RunflowError::MultipleStartSteps(2))));
    }

    #[test]
    fn test_dangling_edge() {
        let def = RunDefinition::new("x", Scope::platform()).with_step(Step::start("s").then("nowhere"));
        assert!(matches!(def.validate(), Err(RunflowError::DanglingEdge { .. })));
    }

    #[test]
    fn test_end_with_edges_rejected() {
        let def = RunDefinition::new("x", Scope::platform())
            .with_step(Step::start("s").then("e"))
            .with_step(Step::end("e").then("s"));
        assert!(matches!(def.validate(), Err(RunflowError::EndStepHasEdges(_))));
    }

    #[test]
    fn test_unreachable_step() {
        let def = RunDefinition::new("x", Scope::platform())
            .with_step(Step::start("s").then("e"))
            .with_step(Step::end("e"))
            .with_step(Step::end("orphan"));
        assert!(matches!(def.validate(), Err(RunflowError::UnreachableStep(id)) if id.as_str() == "orphan"));
    }

    #[test]
    fn test_wait_inside_parallel_rejected() {
        let def = RunDefinition::new("x", Scope::platform())
            .with_step(Step::start("s").then("fork"))
            .with_step(
                Step::new(
                    "fork",
                    StepKind::Parallel {
                        branches: vec![vec![StepId::new("pause")]],
                    },
                )
                .then("e"),
            )
            .with_step(Step::new("pause", StepKind::Wait(WaitConfig::millis(10))))
            .with_step(Step::end("e"));
        assert!(matches!(def.validate(), Err(RunflowError::SuspensionInBranch { .. })));
    }

    #[test]
    fn test_duplicate_step() {
        let mut def = make_simple_definition();
        assert!(matches!(
            def.add_step(Step::end("end")),
            Err(RunflowError::DuplicateStepId(_))
        ));
    }

    #[test]
    fn test_definition_json_round_trip() {
        let def = make_simple_definition();
        let json = serde_json::to_string(&def).unwrap();
        let restored: RunDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.steps, def.steps);
        assert!(restored.validate().is_ok());
    }
}
