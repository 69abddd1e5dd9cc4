//! Agent Executor
//!
//! Runs one approved task against the environment:
//! capability check → action → retry transient failures with backoff → result.
//! Transient failures that outlive the retry budget escalate as
//! `action_failure`; permanent failures end the task immediately.

use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::recovery::RetryPolicy;
use crate::adapter::describe_shape;
use crate::environment::Environment;
use crate::error::TaskError;
use crate::types::{
    ActionCommand, CompletionReport, ControlSignal, ObservationStatus, Outcome, ResourceUsage,
    TaskRequest,
};

/// Result of one agent run, successful or not
#[derive(Debug)]
pub struct Execution {
    pub agent: String,
    pub result: Result<(Outcome, Value), TaskError>,
    pub actions: u32,
    pub retries: u32,
    /// Shape of the payload this run worked against
    pub schema: Value,
    pub schema_reused: bool,
}

impl Execution {
    fn new(agent: &str, schema: Value, schema_reused: bool) -> Self {
        Self {
            agent: agent.to_string(),
            result: Err(TaskError::Internal("not started".into())),
            actions: 0,
            retries: 0,
            schema,
            schema_reused,
        }
    }

    fn finish(mut self, result: Result<(Outcome, Value), TaskError>) -> Self {
        self.result = result;
        self
    }

    /// Convert into the terminal report for a task
    pub fn into_report(self, task_id: &str, units: u32, duration: Duration) -> CompletionReport {
        let mut report = match self.result {
            Ok((outcome, data)) => CompletionReport::completed(task_id, outcome, data, duration),
            Err(ref e) => CompletionReport::failed(task_id, e, duration),
        };
        report.agent = Some(self.agent);
        report.resources_used = ResourceUsage {
            units,
            actions: self.actions,
            retries: self.retries,
        };
        report
    }
}

/// Attempt counts readable while a run is still in progress.
///
/// A run abandoned at its deadline never yields an `Execution`, so the
/// caller keeps these to report what the run had done by then.
#[derive(Debug, Default)]
pub struct Attempts {
    actions: AtomicU32,
    retries: AtomicU32,
}

impl Attempts {
    pub fn actions(&self) -> u32 {
        self.actions.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }
}

/// A named executor with a declared capability set
pub struct Agent {
    name: String,
    capabilities: BTreeSet<String>,
    environment: Arc<Environment>,
    retry: RetryPolicy,
}

impl Agent {
    pub fn new(name: &str, capabilities: &[&str], environment: Arc<Environment>) -> Self {
        Self {
            name: name.to_string(),
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            environment,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &str> {
        self.capabilities.iter().map(String::as_str)
    }

    pub fn supports(&self, kind: &str) -> bool {
        self.capabilities.contains(kind)
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.environment
    }

    /// Reduced resource footprints to try when the full request is denied
    pub fn alternatives(&self, task: &TaskRequest) -> Vec<u32> {
        let mut units = task.resources;
        let mut reduced = Vec::new();
        while units > 1 {
            units /= 2;
            reduced.push(units);
        }
        reduced
    }

    /// Execute an approved control signal; `sequence` distinguishes strategies of one task
    pub async fn execute(
        &self,
        signal: &ControlSignal,
        sequence: u32,
        cancel: &CancellationToken,
    ) -> Execution {
        self.execute_counted(signal, sequence, cancel, &Attempts::default())
            .await
    }

    /// Like `execute`, also counting attempts into `attempts` as they happen
    pub async fn execute_counted(
        &self,
        signal: &ControlSignal,
        sequence: u32,
        cancel: &CancellationToken,
        attempts: &Attempts,
    ) -> Execution {
        let task = &signal.task;
        let shape = describe_shape(&task.payload);
        let cached = signal.context_snapshot.record.cached_schema.as_ref();
        let schema_reused = signal.use_cached_schema && cached == Some(&shape);
        if signal.use_cached_schema && !schema_reused {
            debug!("Cached schema for '{}' is out of date", task.context_key());
        }

        let execution = Execution::new(&self.name, shape, schema_reused);

        if !signal.approved {
            let reason = signal.reason.clone().unwrap_or_else(|| "not approved".into());
            return execution.finish(Err(TaskError::Rejected(reason)));
        }
        if !self.supports(&task.kind) {
            return execution.finish(Err(TaskError::Unsupported(task.kind.clone())));
        }

        self.run_action(
            task,
            sequence,
            signal.constraints.max_retries,
            cancel,
            attempts,
            execution,
        )
        .await
    }

    async fn run_action(
        &self,
        task: &TaskRequest,
        sequence: u32,
        max_retries: u32,
        cancel: &CancellationToken,
        attempts: &Attempts,
        mut execution: Execution,
    ) -> Execution {
        let retry_budget = max_retries.min(self.retry.max_retries);
        let cmd = ActionCommand::new(task, sequence);

        loop {
            if cancel.is_cancelled() {
                return execution.finish(Err(TaskError::Cancelled));
            }

            execution.actions += 1;
            attempts.actions.fetch_add(1, Ordering::Relaxed);
            let observation = tokio::select! {
                obs = self.environment.perform(cmd.clone()) => obs,
                _ = cancel.cancelled() => {
                    info!("Task {} cancelled with action in flight", task.task_id);
                    return execution.finish(Err(TaskError::Cancelled));
                }
            };

            match observation.status {
                ObservationStatus::Success => {
                    return execution.finish(Ok((Outcome::Success, observation.data)));
                }
                ObservationStatus::Partial => {
                    return execution.finish(Ok((Outcome::Partial, observation.data)));
                }
                ObservationStatus::PermanentError => {
                    let kind = observation.error_kind.unwrap_or_else(|| "unknown".into());
                    warn!("Task {} permanent failure on '{}': {}", task.task_id, self.name, kind);
                    return execution.finish(Err(TaskError::PermanentActionFailure(kind)));
                }
                ObservationStatus::TransientError => {
                    let kind = observation.error_kind.unwrap_or_else(|| "transient".into());

                    if execution.retries >= retry_budget {
                        warn!(
                            "Task {} escalating after {} attempts on '{}': {}",
                            task.task_id, execution.actions, self.name, kind
                        );
                        let tried = execution.actions;
                        return execution.finish(Err(TaskError::ActionFailure {
                            attempts: tried,
                            message: kind,
                        }));
                    }

                    let delay = self.retry.delay_for_retry(execution.retries);
                    execution.retries += 1;
                    attempts.retries.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Retry {} for task {} after {:?} ({})",
                        execution.retries, task.task_id, delay, kind
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            return execution.finish(Err(TaskError::Cancelled));
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::ScriptedHandler;
    use crate::types::{Constraints, ContextRecord, ContextSnapshot, Observation};
    use serde_json::json;

    fn agent_with(handler: Arc<ScriptedHandler>) -> Agent {
        let env = Arc::new(Environment::new(handler, 100, Duration::from_secs(60)));
        Agent::new("worker", &["ingest"], env)
    }

    fn signal(task: TaskRequest) -> ControlSignal {
        ControlSignal {
            approved: true,
            reason: None,
            agent: "worker".into(),
            constraints: Constraints {
                resource_units: task.resources,
                timeout_ms: 60_000,
                max_retries: 3,
            },
            context_snapshot: ContextSnapshot {
                record: ContextRecord::empty(task.context_key()),
                degraded: false,
            },
            use_cached_schema: false,
            task,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_with_backoff_then_succeeds() {
        let handler = Arc::new(ScriptedHandler::new());
        handler.push("ingest", Observation::transient("busy"));
        handler.push("ingest", Observation::transient("busy"));
        handler.push("ingest", Observation::success(json!({"rows": 3})));
        let agent = agent_with(handler);

        let start = tokio::time::Instant::now();
        let exec = agent
            .execute(&signal(TaskRequest::new("T1", "ingest", json!({}))), 0, &CancellationToken::new())
            .await;

        assert_eq!(exec.retries, 2);
        assert_eq!(exec.actions, 3);
        assert!(start.elapsed() >= Duration::from_secs(6));
        let (outcome, data) = exec.result.unwrap();
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(data["rows"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_escalates_after_three_retries() {
        let handler = Arc::new(ScriptedHandler::new());
        for _ in 0..10 {
            handler.push("ingest", Observation::transient("busy"));
        }
        let agent = agent_with(handler.clone());

        let exec = agent
            .execute(&signal(TaskRequest::new("T1", "ingest", json!({}))), 0, &CancellationToken::new())
            .await;

        assert_eq!(exec.retries, 3);
        assert_eq!(exec.actions, 4);
        assert!(matches!(exec.result, Err(TaskError::ActionFailure { attempts: 4, .. })));
        assert_eq!(handler.total_side_effects(), 4);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let handler = Arc::new(ScriptedHandler::new());
        handler.push("ingest", Observation::permanent("bad_dataset"));
        let agent = agent_with(handler);

        let exec = agent
            .execute(&signal(TaskRequest::new("T1", "ingest", json!({}))), 0, &CancellationToken::new())
            .await;

        assert_eq!(exec.actions, 1);
        assert_eq!(exec.retries, 0);
        assert!(matches!(exec.result, Err(TaskError::PermanentActionFailure(ref k)) if k == "bad_dataset"));
    }

    #[tokio::test]
    async fn test_unsupported_task_type() {
        let agent = agent_with(Arc::new(ScriptedHandler::new()));
        let exec = agent
            .execute(&signal(TaskRequest::new("T1", "render", json!({}))), 0, &CancellationToken::new())
            .await;
        assert!(matches!(exec.result, Err(TaskError::Unsupported(_))));
        assert_eq!(exec.actions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let handler = Arc::new(ScriptedHandler::new());
        handler.push("ingest", Observation::transient("busy"));
        let agent = agent_with(handler);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });

        let exec = agent
            .execute(&signal(TaskRequest::new("T1", "ingest", json!({}))), 0, &cancel)
            .await;
        assert!(matches!(exec.result, Err(TaskError::Cancelled)));
        assert_eq!(exec.actions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_visible_when_run_is_abandoned() {
        let handler = Arc::new(ScriptedHandler::new());
        handler.push("ingest", Observation::transient("busy"));
        let agent = agent_with(handler);
        let attempts = Attempts::default();

        let sig = signal(TaskRequest::new("T1", "ingest", json!({})));
        let cancel = CancellationToken::new();
        let abandoned = tokio::time::timeout(
            Duration::from_millis(500),
            agent.execute_counted(&sig, 0, &cancel, &attempts),
        )
        .await;

        // Dropped inside the first 2s backoff
        assert!(abandoned.is_err());
        assert_eq!(attempts.actions(), 1);
        assert_eq!(attempts.retries(), 1);
    }

    #[tokio::test]
    async fn test_cached_schema_reuse() {
        let agent = agent_with(Arc::new(ScriptedHandler::new()));
        let task = TaskRequest::new("T1", "ingest", json!({"dataset_id": "DS1"}));
        let mut sig = signal(task);
        sig.use_cached_schema = true;
        sig.context_snapshot.record.cached_schema = Some(json!({"dataset_id": "string"}));

        let exec = agent.execute(&sig, 0, &CancellationToken::new()).await;
        assert!(exec.schema_reused);

        sig.context_snapshot.record.cached_schema = Some(json!({"dataset_id": "number"}));
        let exec = agent.execute(&sig, 1, &CancellationToken::new()).await;
        assert!(!exec.schema_reused);
        assert_eq!(exec.schema, json!({"dataset_id": "string"}));
    }

    #[test]
    fn test_alternatives_halve_resources() {
        let env = Arc::new(Environment::new(
            Arc::new(ScriptedHandler::new()),
            10,
            Duration::from_secs(1),
        ));
        let agent = Agent::new("worker", &["ingest"], env);

        let task = TaskRequest::new("T1", "ingest", json!({})).with_resources(8);
        assert_eq!(agent.alternatives(&task), vec![4, 2, 1]);

        let single = TaskRequest::new("T1", "ingest", json!({}));
        assert!(agent.alternatives(&single).is_empty());
    }

    #[test]
    fn test_into_report_carries_usage() {
        let exec = Execution {
            agent: "worker".into(),
            result: Ok((Outcome::Success, json!({"rows_processed": 10000}))),
            actions: 3,
            retries: 2,
            schema: json!({}),
            schema_reused: false,
        };
        let report = exec.into_report("T1", 2, Duration::from_millis(5));
        assert_eq!(report.outcome, Outcome::Success);
        assert_eq!(report.agent.as_deref(), Some("worker"));
        assert_eq!(report.resources_used.retries, 2);
        assert_eq!(report.resources_used.units, 2);
    }
}
