//! Run and step-record storage
//!
//! Run rows are the only mutable shared state of the engine. Concurrent
//! resumes are serialized by [`RunStore::transition_run`], a conditional
//! state update that fails unless the row is still in an expected state.

use async_trait::async_trait;
use runflow_types::{
    PendingApproval, RunId, RunInstance, RunState, StepExecutionRecord, StepId, StepStatus,
    StoreError, StoreResult,
};
use std::collections::HashMap;
use std::sync::RwLock;

/// Storage interface for run instances and their step records.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, run: RunInstance) -> StoreResult<()>;

    async fn get_run(&self, id: &RunId) -> StoreResult<Option<RunInstance>>;

    /// Overwrite a run. Fails with `Conflict` once the stored run is
    /// terminal, so a cancelled run cannot be revived by a late writer.
    async fn update_run(&self, run: &RunInstance) -> StoreResult<()>;

    /// Compare-and-swap the run state: succeeds only if the stored state is
    /// one of `expected`, otherwise `InvariantViolation`. Returns the
    /// updated run.
    async fn transition_run(
        &self,
        id: &RunId,
        expected: &[RunState],
        to: RunState,
    ) -> StoreResult<RunInstance>;

    /// Compare-and-swap the pending approval: succeeds only while the run
    /// is `waiting_approval` with exactly `expected` pending, otherwise
    /// `InvariantViolation`. Returns the updated run.
    async fn record_approval(
        &self,
        id: &RunId,
        expected: &PendingApproval,
        updated: PendingApproval,
    ) -> StoreResult<RunInstance>;

    /// Runs, optionally filtered by state, oldest first.
    async fn list_runs(&self, state: Option<RunState>) -> StoreResult<Vec<RunInstance>>;

    /// Append a new step record.
    async fn append_record(&self, record: StepExecutionRecord) -> StoreResult<()>;

    /// Replace a step record that is not yet final.
    async fn update_record(&self, record: &StepExecutionRecord) -> StoreResult<()>;

    /// Step records of a run, in append order.
    async fn records(&self, run_id: &RunId) -> StoreResult<Vec<StepExecutionRecord>>;

    /// The waiting record of a run at `step_id`, if any.
    async fn waiting_record(
        &self,
        run_id: &RunId,
        step_id: &StepId,
    ) -> StoreResult<Option<StepExecutionRecord>> {
        Ok(self
            .records(run_id)
            .await?
            .into_iter()
            .rev()
            .find(|r| &r.step_id == step_id && r.status == StepStatus::Waiting))
    }
}

/// In-memory run store.
#[derive(Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<RunId, RunInstance>>,
    records: RwLock<HashMap<RunId, Vec<StepExecutionRecord>>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create_run(&self, run: RunInstance) -> StoreResult<()> {
        let mut guard = self
            .runs
            .write()
            .map_err(|_| StoreError::Backend("runs lock poisoned".to_string()))?;
        if guard.contains_key(&run.id) {
            return Err(StoreError::Conflict(format!("run {} already exists", run.id)));
        }
        guard.insert(run.id.clone(), run);
        Ok(())
    }

    async fn get_run(&self, id: &RunId) -> StoreResult<Option<RunInstance>> {
        let guard = self
            .runs
            .read()
            .map_err(|_| StoreError::Backend("runs lock poisoned".to_string()))?;
        Ok(guard.get(id).cloned())
    }

    async fn update_run(&self, run: &RunInstance) -> StoreResult<()> {
        let mut guard = self
            .runs
            .write()
            .map_err(|_| StoreError::Backend("runs lock poisoned".to_string()))?;
        let stored = guard
            .get_mut(&run.id)
            .ok_or_else(|| StoreError::NotFound(format!("run {} not found", run.id)))?;
        if stored.state.is_terminal() {
            return Err(StoreError::Conflict(format!(
                "run {} is already {}",
                run.id, stored.state
            )));
        }
        *stored = run.clone();
        Ok(())
    }

    async fn transition_run(
        &self,
        id: &RunId,
        expected: &[RunState],
        to: RunState,
    ) -> StoreResult<RunInstance> {
        let mut guard = self
            .runs
            .write()
            .map_err(|_| StoreError::Backend("runs lock poisoned".to_string()))?;
        let stored = guard
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("run {} not found", id)))?;
        if !expected.contains(&stored.state) {
            return Err(StoreError::InvariantViolation(format!(
                "invalid run transition: expected one of {:?}, found {}",
                expected, stored.state
            )));
        }
        stored
            .transition(to)
            .map_err(|e| StoreError::InvariantViolation(e.to_string()))?;
        Ok(stored.clone())
    }

    async fn record_approval(
        &self,
        id: &RunId,
        expected: &PendingApproval,
        updated: PendingApproval,
    ) -> StoreResult<RunInstance> {
        let mut guard = self
            .runs
            .write()
            .map_err(|_| StoreError::Backend("runs lock poisoned".to_string()))?;
        let stored = guard
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("run {} not found", id)))?;
        if stored.state != RunState::WaitingApproval
            || stored.pending_approval.as_ref() != Some(expected)
        {
            return Err(StoreError::InvariantViolation(format!(
                "run {} is no longer waiting on this approval at {} (state {})",
                id, expected.step_id, stored.state
            )));
        }
        stored.pending_approval = Some(updated);
        stored.updated_at = chrono::Utc::now();
        Ok(stored.clone())
    }

    async fn list_runs(&self, state: Option<RunState>) -> StoreResult<Vec<RunInstance>> {
        let guard = self
            .runs
            .read()
            .map_err(|_| StoreError::Backend("runs lock poisoned".to_string()))?;
        let mut runs: Vec<RunInstance> = guard
            .values()
            .filter(|r| state.map(|s| r.state == s).unwrap_or(true))
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.0.cmp(&b.id.0)));
        Ok(runs)
    }

    async fn append_record(&self, record: StepExecutionRecord) -> StoreResult<()> {
        let mut guard = self
            .records
            .write()
            .map_err(|_| StoreError::Backend("records lock poisoned".to_string()))?;
        guard.entry(record.run_id.clone()).or_default().push(record);
        Ok(())
    }

    async fn update_record(&self, record: &StepExecutionRecord) -> StoreResult<()> {
        let mut guard = self
            .records
            .write()
            .map_err(|_| StoreError::Backend("records lock poisoned".to_string()))?;
        let stored = guard
            .get_mut(&record.run_id)
            .and_then(|records| records.iter_mut().find(|r| r.id == record.id))
            .ok_or_else(|| StoreError::NotFound(format!("step record {} not found", record.id)))?;
        if stored.status.is_final() {
            return Err(StoreError::InvariantViolation(format!(
                "step record {} is already final",
                record.id
            )));
        }
        *stored = record.clone();
        Ok(())
    }

    async fn records(&self, run_id: &RunId) -> StoreResult<Vec<StepExecutionRecord>> {
        let guard = self
            .records
            .read()
            .map_err(|_| StoreError::Backend("records lock poisoned".to_string()))?;
        Ok(guard.get(run_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runflow_types::{RunContext, RunDefinitionId, Scope, StepType};
    use serde_json::json;

    fn make_run() -> RunInstance {
        RunInstance::new(
            RunDefinitionId::new("def"),
            "expense",
            1,
            Scope::platform(),
            RunContext::new(json!({}), None),
        )
    }

    #[tokio::test]
    async fn test_transition_run_is_conditional() {
        let store = InMemoryRunStore::new();
        let mut run = make_run();
        run.transition(RunState::Running).unwrap();
        run.transition(RunState::WaitingCondition).unwrap();
        let id = run.id.clone();
        store.create_run(run).await.unwrap();

        let waiting = [RunState::WaitingCondition, RunState::WaitingApproval];
        let resumed = store
            .transition_run(&id, &waiting, RunState::Running)
            .await
            .unwrap();
        assert_eq!(resumed.state, RunState::Running);

        // A second resumer loses the race.
        let err = store
            .transition_run(&id, &waiting, RunState::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn test_terminal_run_cannot_be_overwritten() {
        let store = InMemoryRunStore::new();
        let mut run = make_run();
        let id = run.id.clone();
        store.create_run(run.clone()).await.unwrap();
        store
            .transition_run(&id, &[RunState::Pending], RunState::Cancelled)
            .await
            .unwrap();

        run.transition(RunState::Running).unwrap();
        assert!(matches!(
            store.update_run(&run).await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(
            store.get_run(&id).await.unwrap().unwrap().state,
            RunState::Cancelled
        );
    }

    #[tokio::test]
    async fn test_record_approval_is_conditional() {
        use runflow_types::{ApprovalPolicy, ApprovalResponse, PendingApproval};

        let store = InMemoryRunStore::new();
        let mut run = make_run();
        run.transition(RunState::Running).unwrap();
        run.transition(RunState::WaitingApproval).unwrap();
        let pending = PendingApproval::new(
            StepId::new("approve"),
            vec!["mgr1".into(), "mgr2".into()],
            ApprovalPolicy::All,
        );
        run.current_step = Some(StepId::new("approve"));
        run.pending_approval = Some(pending.clone());
        let id = run.id.clone();
        store.create_run(run).await.unwrap();

        let mut tallied = pending.clone();
        tallied.record(ApprovalResponse {
            approver: "mgr1".into(),
            approved: true,
            comments: None,
            at: chrono::Utc::now(),
        });
        let stored = store
            .record_approval(&id, &pending, tallied.clone())
            .await
            .unwrap();
        assert_eq!(stored.pending_approval.unwrap().responses.len(), 1);

        // A writer holding the old snapshot loses.
        assert!(matches!(
            store.record_approval(&id, &pending, pending.clone()).await,
            Err(StoreError::InvariantViolation(_))
        ));

        // Once resumed, no tally can be written back.
        store
            .transition_run(&id, &[RunState::WaitingApproval], RunState::Running)
            .await
            .unwrap();
        assert!(matches!(
            store.record_approval(&id, &tallied, tallied.clone()).await,
            Err(StoreError::InvariantViolation(_))
        ));
        assert_eq!(
            store.get_run(&id).await.unwrap().unwrap().state,
            RunState::Running
        );
    }

    #[tokio::test]
    async fn test_list_runs_by_state() {
        let store = InMemoryRunStore::new();
        store.create_run(make_run()).await.unwrap();
        let mut running = make_run();
        running.transition(RunState::Running).unwrap();
        store.create_run(running).await.unwrap();

        assert_eq!(store.list_runs(None).await.unwrap().len(), 2);
        assert_eq!(store.list_runs(Some(RunState::Running)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_final_records_are_immutable() {
        let store = InMemoryRunStore::new();
        let run_id = RunId::new("r");
        let mut record = StepExecutionRecord::started(
            run_id.clone(),
            StepId::new("pause"),
            StepType::Wait,
            json!({}),
        );
        store.append_record(record.clone()).await.unwrap();

        record.wait(json!({"waitMs": 0}));
        store.update_record(&record).await.unwrap();
        let waiting = store
            .waiting_record(&run_id, &StepId::new("pause"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(waiting.id, record.id);

        record.complete(json!({}));
        store.update_record(&record).await.unwrap();
        assert!(matches!(
            store.update_record(&record).await,
            Err(StoreError::InvariantViolation(_))
        ));
        assert_eq!(store.records(&run_id).await.unwrap().len(), 1);
    }
}
